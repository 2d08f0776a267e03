// SPDX-License-Identifier: BSD-3-Clause
//! Names of the recognized runtime symbols. The defaults match the R
//! runtime; a JSON file can override any of them so the checker is not tied
//! to one runtime build.

use rustc_hash::FxHashSet;

use crate::ir::{FunId, GlobalId, Module};

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeNames {
    pub protect: String,
    pub protect_with_index: String,
    pub unprotect: String,
    pub unprotect_ptr: String,
    pub stack_top: String,
    pub intern: String,
    pub gc: String,
    pub register_routines: String,
    pub nil_value: String,
    /// Struct tag of the runtime value type; pointers to it are SEXPs.
    pub sexp_struct: String,
    /// No-return error functions; paths that reach them are not analyzed.
    pub error_functions: Vec<String>,
    /// Functions that are known to never return a fresh allocation.
    pub non_allocators: Vec<String>,
    /// Extra functions to treat as allocating, on top of what the call
    /// graph reaches.
    pub allocating: Vec<String>,
}

impl Default for RuntimeNames {
    fn default() -> Self {
        RuntimeNames {
            protect: "Rf_protect".to_string(),
            protect_with_index: "R_ProtectWithIndex".to_string(),
            unprotect: "Rf_unprotect".to_string(),
            unprotect_ptr: "Rf_unprotect_ptr".to_string(),
            stack_top: "R_PPStackTop".to_string(),
            intern: "Rf_install".to_string(),
            gc: "R_gc_internal".to_string(),
            register_routines: "R_registerRoutines".to_string(),
            nil_value: "R_NilValue".to_string(),
            sexp_struct: "struct.SEXPREC".to_string(),
            error_functions: vec![
                "Rf_error".to_string(),
                "Rf_errorcall".to_string(),
                "UNIMPLEMENTED".to_string(),
                "R_ThrowError".to_string(),
            ],
            non_allocators: Vec::new(),
            allocating: Vec::new(),
        }
    }
}

/// The runtime symbols resolved against one module. Absent symbols stay
/// `None`; the recognizers fail closed on them.
#[derive(Debug)]
pub struct Runtime {
    pub protect: Option<FunId>,
    pub protect_with_index: Option<FunId>,
    pub unprotect: Option<FunId>,
    pub unprotect_ptr: Option<FunId>,
    pub intern: Option<FunId>,
    pub gc: Option<FunId>,
    pub register_routines: Option<FunId>,
    pub stack_top: Option<GlobalId>,
    pub nil_value: Option<GlobalId>,
    pub error_funs: FxHashSet<FunId>,
    pub non_allocators: FxHashSet<FunId>,
    pub allocating_seed: FxHashSet<FunId>,
}

impl Runtime {
    pub fn resolve(module: &Module, names: &RuntimeNames) -> Self {
        let fun = |n: &str| module.fun_by_name(n);
        let set = |ns: &[String]| ns.iter().filter_map(|n| module.fun_by_name(n)).collect();
        Runtime {
            protect: fun(&names.protect),
            protect_with_index: fun(&names.protect_with_index),
            unprotect: fun(&names.unprotect),
            unprotect_ptr: fun(&names.unprotect_ptr),
            intern: fun(&names.intern),
            gc: fun(&names.gc),
            register_routines: fun(&names.register_routines),
            stack_top: module.global_by_name(&names.stack_top),
            nil_value: module.global_by_name(&names.nil_value),
            error_funs: set(&names.error_functions),
            non_allocators: set(&names.non_allocators),
            allocating_seed: set(&names.allocating),
        }
    }
}

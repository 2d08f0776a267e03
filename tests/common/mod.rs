// SPDX-License-Identifier: BSD-3-Clause
//! Shared fixture for the integration tests: a module builder preloaded
//! with the runtime declarations the checkers recognize.

use protcheck::config::{Runtime, RuntimeNames};
use protcheck::ir::{FunId, GlobalId, Module, ModuleBuilder, Type};
use protcheck::symbols::{find_symbols, SymbolsMap};

#[allow(dead_code)]
pub struct Fixture {
    pub mb: ModuleBuilder,
    pub protect: FunId,
    pub protect_with_index: FunId,
    pub unprotect: FunId,
    pub unprotect_ptr: FunId,
    pub install: FunId,
    pub gc: FunId,
    pub stack_top: GlobalId,
    pub nil: GlobalId,
}

impl Fixture {
    pub fn new() -> Self {
        let mut mb = ModuleBuilder::new();
        let protect = mb.declare("Rf_protect", vec![Type::Sexp], Type::Sexp);
        let protect_with_index =
            mb.declare("R_ProtectWithIndex", vec![Type::Sexp, Type::Ptr], Type::Void);
        let unprotect = mb.declare("Rf_unprotect", vec![Type::Int { bits: 32 }], Type::Void);
        let unprotect_ptr = mb.declare("Rf_unprotect_ptr", vec![Type::Sexp], Type::Void);
        let install = mb.declare("Rf_install", vec![Type::Ptr], Type::Sexp);
        let gc = mb.declare("R_gc_internal", vec![], Type::Void);
        let stack_top = mb.global("R_PPStackTop", Type::Ptr);
        let nil = mb.global("R_NilValue", Type::Sexp);
        Fixture {
            mb,
            protect,
            protect_with_index,
            unprotect,
            unprotect_ptr,
            install,
            gc,
            stack_top,
            nil,
        }
    }

    pub fn finish(self) -> (Module, Runtime, SymbolsMap) {
        let module = self.mb.finish();
        let rt = Runtime::resolve(&module, &RuntimeNames::default());
        let symbols = find_symbols(&module, &rt);
        (module, rt, symbols)
    }
}

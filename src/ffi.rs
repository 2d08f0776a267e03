// SPDX-License-Identifier: BSD-3-Clause
//! The registration-table check: given the library name, find the
//! initialization function, locate its calls to the registration primitive,
//! and walk the `.Call` table checking every registered entry for an SEXP
//! return type, matching arity, and SEXP-typed parameters.

use crate::config::Runtime;
use crate::ir::{Const, FunId, Module, Opcode, Operand};

#[derive(Clone, Debug, thiserror::Error)]
pub enum FfiError {
    #[error("did not find initialization function {0}")]
    MissingInit(String),
    #[error("cannot find the registration primitive")]
    MissingRegisterRoutines,
}

/// Derives the library name from the path of the last input: the file name
/// with the first of the suffixes `.so`, `.bc`, `.so.bc` stripped.
pub fn library_name(path: &str) -> String {
    let file = match path.rfind('/') {
        Some(sep) => &path[sep + 1..],
        None => path,
    };
    for (i, _) in file.char_indices() {
        let rest = &file[i..];
        if rest == ".so" || rest == ".bc" || rest == ".so.bc" {
            return file[..i].to_string();
        }
    }
    file.to_string()
}

/// Checks the registration table of `module`. Findings go to stderr; the
/// returned error means the check could not run at all.
pub fn check_registration(
    module: &Module,
    libname: &str,
    rt: &Runtime,
) -> Result<(), FfiError> {
    let initfn = format!("R_init_{}", libname);

    for f in module.defined_funs() {
        let name = module.fun_name(f);
        if name.starts_with("R_init_") && name != initfn {
            eprintln!(
                "WARNING: possible initialization function {} will not be used by R",
                name
            );
        }
    }

    let init = module
        .fun_by_name(&initfn)
        .filter(|f| module.fun(*f).body.is_some())
        .ok_or_else(|| FfiError::MissingInit(initfn.clone()))?;
    eprintln!("Initialization function: {}", initfn);

    let regf = rt
        .register_routines
        .ok_or(FfiError::MissingRegisterRoutines)?;

    let mut checked = false;
    let fun = module.fun(init).body.as_ref().expect("checked above");
    for i in fun.instr_ids() {
        let Opcode::Call(call) = &fun.instr(i).op else {
            continue;
        };
        if call.target() != Some(regf) {
            continue;
        }
        // R_registerRoutines(dll, cRoutines, callRoutines, fortranRoutines,
        // externalRoutines): the third argument is the `.Call` table.
        if let Some(&table) = call.args.get(2) {
            check_table(module, table);
            checked = true;
        }
    }
    eprintln!("Checked call to R_registerRoutines: {}", checked);
    Ok(())
}

fn check_table(module: &Module, table: Operand) {
    let Operand::Global(g) = table else {
        if table != Operand::Null {
            eprintln!("ERROR: did not recognize the function table argument");
        }
        return;
    };
    let Some(Const::Array(entries)) = &module.global(g).init else {
        eprintln!("ERROR: did not get the elements of the function table");
        return;
    };

    eprintln!("Functions: {}", entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        match entry {
            // The terminating {NULL, NULL, 0} entry.
            Const::Zero | Const::Null => break,
            Const::Struct(fields) => {
                if !check_entry(module, fields) {
                    return;
                }
            }
            _ => {
                if idx + 1 == entries.len() {
                    break;
                }
                eprintln!("ERROR: invalid entry in function table");
                return;
            }
        }
    }
}

fn check_entry(module: &Module, fields: &[Const]) -> bool {
    let name = match fields.first() {
        Some(Const::Global(ng)) => match &module.global(*ng).init {
            Some(Const::Str(s)) => module.str_(*s).to_string(),
            _ => String::new(),
        },
        Some(Const::Str(s)) => module.str_(*s).to_string(),
        _ => String::new(),
    };
    if name.is_empty() {
        eprintln!("ERROR: invalid function name string in function table");
        return false;
    }

    let fun: Option<FunId> = match fields.get(1) {
        Some(Const::Fun(f)) => Some(*f),
        _ => None,
    };
    let Some(fun) = fun else {
        eprintln!("ERROR: invalid function in function table");
        return false;
    };

    let arity = match fields.get(2) {
        Some(Const::Int(a)) => *a,
        _ => {
            eprintln!("ERROR: invalid arity in function table");
            return false;
        }
    };

    let decl = module.fun(fun);
    if !decl.ret.is_sexp() {
        eprintln!(
            "ERROR: function {} ({}) does not return SEXP",
            name,
            module.fun_name(fun)
        );
    }
    let real_arity = decl.params.len() as i64;
    if arity > -1 && arity != real_arity {
        eprintln!(
            "ERROR: function {} ({}) has arity {} but registered arity {}",
            name,
            module.fun_name(fun),
            real_arity,
            arity
        );
    }
    for (i, p) in decl.params.iter().enumerate() {
        if !p.is_sexp() {
            eprintln!(
                "ERROR: function {} ({}) parameter {} is not SEXP",
                name,
                module.fun_name(fun),
                i + 1
            );
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::library_name;

    #[test]
    fn strips_directories_and_suffixes() {
        assert_eq!(library_name("pkg.so"), "pkg");
        assert_eq!(library_name("pkg.bc"), "pkg");
        assert_eq!(library_name("pkg.so.bc"), "pkg");
        assert_eq!(library_name("/a/b/stats.so.bc"), "stats");
        assert_eq!(library_name("dir/noext"), "noext");
    }

    #[test]
    fn earliest_suffix_wins() {
        // The scan stops at the first matching suffix position.
        assert_eq!(library_name("x.so.bc"), "x");
        assert_eq!(library_name("libfoo"), "libfoo");
    }
}

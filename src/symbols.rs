// SPDX-License-Identifier: BSD-3-Clause
//! Seeding of the symbol table: which global variables hold interned
//! symbols, and under what name. The scan recognizes the initialization
//! idiom `sym_global = install("name")`.

use rustc_hash::FxHashMap;

use crate::config::Runtime;
use crate::ir::{GlobalId, Module, Opcode, Operand, StrId};
use crate::sigs::intern_constant_call;

pub type SymbolsMap = FxHashMap<GlobalId, StrId>;

pub fn find_symbols(module: &Module, rt: &Runtime) -> SymbolsMap {
    let mut symbols = SymbolsMap::default();
    for f in module.defined_funs() {
        let Some(fun) = module.fun(f).body.as_ref() else {
            continue;
        };
        for i in fun.instr_ids() {
            if let Opcode::Store {
                ptr: Operand::Global(g),
                value,
            } = fun.instr(i).op
            {
                if let Some(sym) = intern_constant_call(fun, value, rt) {
                    symbols.insert(g, sym);
                }
            }
        }
    }
    symbols
}

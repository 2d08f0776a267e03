// SPDX-License-Identifier: BSD-3-Clause
//! Call signatures: a called function together with per-argument symbol
//! knowledge. Signatures are the unit of context sensitivity for the
//! allocator analysis; both the argument-info vectors and the signatures
//! themselves are interned, so equality is index equality and every
//! signature has a stable dense index for the closure matrices.

use smallvec::SmallVec;

use crate::config::Runtime;
use crate::intern::Interner;
use crate::ir::{Call, FunId, Function, Module, Opcode, Operand, StrId};
use crate::guards::{SexpGuardState, SexpGuards};
use crate::symbols::SymbolsMap;

/// What is known about one actual argument at a call site.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArgInfo {
    Unknown,
    Symbol(StrId),
}

pub type ArgInfos = SmallVec<[ArgInfo; 4]>;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ArgsId(pub u32);

/// Index of an interned signature; stable for the lifetime of the table.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SigId(pub u32);

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct CalledFun {
    pub fun: FunId,
    pub args: ArgsId,
}

#[derive(Debug, Default)]
pub struct SigTable {
    args: Interner<ArgInfos>,
    sigs: Interner<CalledFun>,
}

impl SigTable {
    pub fn new() -> Self {
        SigTable::default()
    }

    pub fn intern_args(&mut self, args: ArgInfos) -> ArgsId {
        ArgsId(self.args.intern(args))
    }

    pub fn intern(&mut self, cf: CalledFun) -> SigId {
        SigId(self.sigs.intern(cf))
    }

    /// The context-free signature of a function: one `Unknown` per formal.
    pub fn plain(&mut self, module: &Module, fun: FunId) -> SigId {
        let args = self.intern_args(
            std::iter::repeat(ArgInfo::Unknown)
                .take(module.fun(fun).params.len())
                .collect(),
        );
        self.intern(CalledFun { fun, args })
    }

    pub fn sig(&self, id: SigId) -> CalledFun {
        *self.sigs.get(id.0)
    }

    pub fn arg_infos(&self, id: ArgsId) -> &ArgInfos {
        self.args.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }

    /// Renders `name(S:sym,?)` when at least one argument is a known
    /// symbol, plain `name` otherwise.
    pub fn name(&self, module: &Module, id: SigId) -> String {
        let cf = self.sig(id);
        let mut out = module.fun_name(cf.fun).to_string();
        let infos = self.arg_infos(cf.args);
        if infos.iter().any(|a| matches!(a, ArgInfo::Symbol(_))) {
            out.push('(');
            for (i, a) in infos.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                match a {
                    ArgInfo::Symbol(s) => {
                        out.push_str("S:");
                        out.push_str(module.str_(*s));
                    }
                    ArgInfo::Unknown => out.push('?'),
                }
            }
            out.push(')');
        }
        out
    }

    /// Builds the signature of a direct call, refining each argument with
    /// the current symbol knowledge: a load of a known symbol global, a
    /// load of a guard slot currently holding a symbol, or the
    /// `install("name")` idiom.
    pub fn resolve_call(
        &mut self,
        fun: &Function,
        call: &Call,
        sexp_guards: Option<&SexpGuards>,
        symbols: &SymbolsMap,
        rt: &Runtime,
    ) -> Option<SigId> {
        let target = call.target()?;
        let mut infos: ArgInfos = SmallVec::with_capacity(call.args.len());
        for &arg in &call.args {
            infos.push(arg_info(fun, arg, sexp_guards, symbols, rt));
        }
        let args = self.intern_args(infos);
        Some(self.intern(CalledFun { fun: target, args }))
    }
}

fn arg_info(
    fun: &Function,
    arg: Operand,
    sexp_guards: Option<&SexpGuards>,
    symbols: &SymbolsMap,
    rt: &Runtime,
) -> ArgInfo {
    if let Some(g) = fun.loaded_global(arg) {
        if let Some(&sym) = symbols.get(&g) {
            return ArgInfo::Symbol(sym);
        }
    }
    if let (Some(slot), Some(sg)) = (fun.loaded_slot(arg), sexp_guards) {
        if let Some(SexpGuardState::Symbol(sym)) = sg.get(&slot) {
            return ArgInfo::Symbol(*sym);
        }
    }
    if let Some(sym) = intern_constant_call(fun, arg, rt) {
        return ArgInfo::Symbol(sym);
    }
    ArgInfo::Unknown
}

/// Matches the result of `install("name")` with a constant string literal.
pub(crate) fn intern_constant_call(fun: &Function, op: Operand, rt: &Runtime) -> Option<StrId> {
    let Operand::Value(v) = op else {
        return None;
    };
    let Opcode::Call(call) = &fun.instr(v).op else {
        return None;
    };
    let intern = rt.intern?;
    if call.target() != Some(intern) {
        return None;
    }
    match call.args.first() {
        Some(Operand::Str(s)) => Some(*s),
        _ => None,
    }
}

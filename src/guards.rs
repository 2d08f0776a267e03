// SPDX-License-Identifier: BSD-3-Clause
//! Boolean facts about guard variables, used by both engines to prune
//! infeasible branches.
//!
//! Two flavors are tracked: integer guards (slots only ever assigned
//! constants and compared against zero) and SEXP guards (value-typed slots
//! whose address never escapes). Facts are part of the per-path abstract
//! state; packing interns the sorted fact vectors so dedup-set membership
//! is a pair of integer comparisons.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::config::Runtime;
use crate::intern::Interner;
use crate::ir::{
    BlockId, Function, Instr, Opcode, Operand, Pred, SlotId, StrId, TermOp, UseSite,
};
use crate::sigs::ArgInfo;
use crate::symbols::SymbolsMap;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum IntGuardState {
    Zero,
    NonZero,
    Unknown,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum SexpGuardState {
    Nil,
    NonNil,
    Symbol(StrId),
    Unknown,
}

/// Facts for the guard slots a path has touched; untracked slots are
/// absent. Ordered so packing is deterministic.
pub type IntGuards = BTreeMap<SlotId, IntGuardState>;
pub type SexpGuards = BTreeMap<SlotId, SexpGuardState>;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct IntPackId(pub u32);

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct SexpPackId(pub u32);

/// What a guard comparison at a terminator tells the engine to do.
#[derive(Clone, Copy, Debug)]
pub enum GuardDecision {
    /// The fact is known; only this successor is feasible.
    Taken(BlockId),
    /// The fact is unknown; explore both successors with refined facts.
    Fork {
        slot: SlotId,
        arms: [(BlockId, SexpGuardState); 2],
    },
    ForkInt {
        slot: SlotId,
        zero: BlockId,
        nonzero: BlockId,
    },
}

/// Per-function guard machinery: recognition caches plus the interning
/// tables for packed fact vectors.
#[derive(Debug, Default)]
pub struct GuardsChecker {
    int_cache: FxHashMap<SlotId, bool>,
    sexp_cache: FxHashMap<SlotId, bool>,
    int_packs: Interner<Vec<(SlotId, IntGuardState)>>,
    sexp_packs: Interner<Vec<(SlotId, SexpGuardState)>>,
}

impl GuardsChecker {
    pub fn new() -> Self {
        GuardsChecker::default()
    }

    pub fn pack_int(&mut self, g: &IntGuards) -> IntPackId {
        IntPackId(self.int_packs.intern(g.iter().map(|(k, v)| (*k, *v)).collect()))
    }

    pub fn unpack_int(&self, id: IntPackId) -> IntGuards {
        self.int_packs.get(id.0).iter().copied().collect()
    }

    pub fn pack_sexp(&mut self, g: &SexpGuards) -> SexpPackId {
        SexpPackId(self.sexp_packs.intern(g.iter().map(|(k, v)| (*k, *v)).collect()))
    }

    pub fn unpack_sexp(&self, id: SexpPackId) -> SexpGuards {
        self.sexp_packs.get(id.0).iter().copied().collect()
    }

    /// An integer guard is a non-array integer slot that is only ever
    /// assigned constants and whose loads feed zero-comparisons on
    /// conditional branches.
    pub fn is_int_guard(&mut self, fun: &Function, slot: SlotId) -> bool {
        if let Some(&cached) = self.int_cache.get(&slot) {
            return cached;
        }
        let res = int_guard_shape(fun, slot);
        self.int_cache.insert(slot, res);
        res
    }

    /// An SEXP guard is a non-array value-typed slot whose address never
    /// escapes: every use is a plain load or a store to it.
    pub fn is_sexp_guard(&mut self, fun: &Function, slot: SlotId) -> bool {
        if let Some(&cached) = self.sexp_cache.get(&slot) {
            return cached;
        }
        let res = sexp_guard_shape(fun, slot);
        self.sexp_cache.insert(slot, res);
        res
    }

    /// Non-terminator transfer for integer guards.
    pub fn transfer_int(&mut self, fun: &Function, instr: &Instr, ig: &mut IntGuards) {
        if let Opcode::Store { ptr, value } = &instr.op {
            if let Operand::Slot(slot) = *ptr {
                if self.is_int_guard(fun, slot) {
                    let state = match *value {
                        Operand::Const(0) => IntGuardState::Zero,
                        Operand::Const(_) => IntGuardState::NonZero,
                        _ => IntGuardState::Unknown,
                    };
                    ig.insert(slot, state);
                }
            }
        }
    }

    /// Non-terminator transfer for SEXP guards. `arg_info` carries the
    /// per-parameter symbol knowledge of the analyzed call signature, so a
    /// parameter spilled into a guard slot keeps its symbol identity.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_sexp(
        &mut self,
        fun: &Function,
        instr: &Instr,
        sg: &mut SexpGuards,
        rt: &Runtime,
        symbols: &SymbolsMap,
        arg_info: Option<&[ArgInfo]>,
    ) {
        let Opcode::Store { ptr, value } = &instr.op else {
            return;
        };
        let Operand::Slot(slot) = *ptr else {
            return;
        };
        if !self.is_sexp_guard(fun, slot) {
            return;
        }
        let state = match *value {
            Operand::Value(_) => {
                if let Some(g) = fun.loaded_global(*value) {
                    if rt.nil_value == Some(g) {
                        SexpGuardState::Nil
                    } else if let Some(&sym) = symbols.get(&g) {
                        SexpGuardState::Symbol(sym)
                    } else {
                        SexpGuardState::Unknown
                    }
                } else if let Some(sym) = crate::sigs::intern_constant_call(fun, *value, rt) {
                    SexpGuardState::Symbol(sym)
                } else {
                    SexpGuardState::Unknown
                }
            }
            Operand::Param(i) => match arg_info.and_then(|a| a.get(i as usize)) {
                Some(ArgInfo::Symbol(sym)) => SexpGuardState::Symbol(*sym),
                _ => SexpGuardState::Unknown,
            },
            _ => SexpGuardState::Unknown,
        };
        sg.insert(slot, state);
    }

    /// Terminator transfer for integer guards: `if (flag)` and
    /// `if (flag == 0)` shapes.
    pub fn int_branch(
        &mut self,
        fun: &Function,
        term: &TermOp,
        ig: &IntGuards,
    ) -> Option<GuardDecision> {
        let TermOp::CondBr {
            cond,
            if_true,
            if_false,
        } = *term
        else {
            return None;
        };
        let (pred, slot) = guard_zero_compare(fun, cond)?;
        if !self.is_int_guard(fun, slot) {
            return None;
        }
        // `pred` is Eq or Ne against zero.
        let (zero_succ, nonzero_succ) = if pred == Pred::Eq {
            (if_true, if_false)
        } else {
            (if_false, if_true)
        };
        match ig.get(&slot).copied().unwrap_or(IntGuardState::Unknown) {
            IntGuardState::Zero => Some(GuardDecision::Taken(zero_succ)),
            IntGuardState::NonZero => Some(GuardDecision::Taken(nonzero_succ)),
            IntGuardState::Unknown => Some(GuardDecision::ForkInt {
                slot,
                zero: zero_succ,
                nonzero: nonzero_succ,
            }),
        }
    }

    /// Terminator transfer for SEXP guards: comparisons of a guard against
    /// the nil global or a known symbol global.
    pub fn sexp_branch(
        &mut self,
        fun: &Function,
        term: &TermOp,
        sg: &SexpGuards,
        rt: &Runtime,
        symbols: &SymbolsMap,
    ) -> Option<GuardDecision> {
        let TermOp::CondBr {
            cond,
            if_true,
            if_false,
        } = *term
        else {
            return None;
        };
        let Operand::Value(cmp) = cond else {
            return None;
        };
        let Opcode::Icmp { pred, lhs, rhs } = fun.instr(cmp).op else {
            return None;
        };
        if !pred.is_equality() {
            return None;
        }
        // One side loads a guard slot, the other a known global.
        let (slot, global) = match (fun.loaded_slot(lhs), fun.loaded_global(rhs)) {
            (Some(s), Some(g)) => (s, g),
            _ => match (fun.loaded_slot(rhs), fun.loaded_global(lhs)) {
                (Some(s), Some(g)) => (s, g),
                _ => return None,
            },
        };
        if !self.is_sexp_guard(fun, slot) {
            return None;
        }
        let (eq_succ, ne_succ) = if pred == Pred::Eq {
            (if_true, if_false)
        } else {
            (if_false, if_true)
        };
        let state = sg.get(&slot).copied().unwrap_or(SexpGuardState::Unknown);

        if rt.nil_value == Some(global) {
            return Some(match state {
                SexpGuardState::Nil => GuardDecision::Taken(eq_succ),
                SexpGuardState::NonNil | SexpGuardState::Symbol(_) => {
                    GuardDecision::Taken(ne_succ)
                }
                SexpGuardState::Unknown => GuardDecision::Fork {
                    slot,
                    arms: [
                        (eq_succ, SexpGuardState::Nil),
                        (ne_succ, SexpGuardState::NonNil),
                    ],
                },
            });
        }
        if let Some(&sym) = symbols.get(&global) {
            return Some(match state {
                SexpGuardState::Symbol(s) if s == sym => GuardDecision::Taken(eq_succ),
                SexpGuardState::Symbol(_) | SexpGuardState::Nil => GuardDecision::Taken(ne_succ),
                prior @ (SexpGuardState::NonNil | SexpGuardState::Unknown) => {
                    GuardDecision::Fork {
                        slot,
                        arms: [(eq_succ, SexpGuardState::Symbol(sym)), (ne_succ, prior)],
                    }
                }
            });
        }
        None
    }
}

/// Matches `cmp(load(slot), 0)` in either operand order, for equality
/// predicates only.
fn guard_zero_compare(fun: &Function, cond: Operand) -> Option<(Pred, SlotId)> {
    let Operand::Value(cmp) = cond else {
        return None;
    };
    let Opcode::Icmp { pred, lhs, rhs } = fun.instr(cmp).op else {
        return None;
    };
    if !pred.is_equality() {
        return None;
    }
    let slot = match (lhs, rhs) {
        (Operand::Const(0), other) => fun.loaded_slot(other)?,
        (other, Operand::Const(0)) => fun.loaded_slot(other)?,
        _ => return None,
    };
    Some((pred, slot))
}

fn int_guard_shape(fun: &Function, slot: SlotId) -> bool {
    let info = fun.slot(slot);
    if !info.ty.is_int() || info.array {
        return false;
    }
    let mut compared = false;
    for &site in fun.slot_users(slot) {
        let UseSite::Instr(i) = site else {
            return false;
        };
        match &fun.instr(i).op {
            Opcode::Store { ptr, value } if *ptr == Operand::Slot(slot) => {
                if !matches!(value, Operand::Const(_)) {
                    return false;
                }
            }
            Opcode::Load(ptr) if *ptr == Operand::Slot(slot) => {
                for &user in fun.value_users(i) {
                    let UseSite::Instr(u) = user else {
                        return false;
                    };
                    match &fun.instr(u).op {
                        Opcode::Icmp { lhs, rhs, pred } if pred.is_equality() => {
                            let other = if *lhs == Operand::Value(i) { *rhs } else { *lhs };
                            if other != Operand::Const(0) {
                                return false;
                            }
                            compared = true;
                        }
                        _ => return false,
                    }
                }
            }
            _ => return false,
        }
    }
    compared
}

fn sexp_guard_shape(fun: &Function, slot: SlotId) -> bool {
    let info = fun.slot(slot);
    if !info.ty.is_sexp() || info.array {
        return false;
    }
    for &site in fun.slot_users(slot) {
        let UseSite::Instr(i) = site else {
            return false;
        };
        match &fun.instr(i).op {
            Opcode::Load(ptr) if *ptr == Operand::Slot(slot) => {}
            Opcode::Store { ptr, .. } if *ptr == Operand::Slot(slot) => {}
            _ => return false,
        }
    }
    true
}

// SPDX-License-Identifier: BSD-3-Clause
//! Recognizers for the two special stack-slot shapes the balance engine
//! keys on: protection counters and stack-top save slots. Both walk only
//! the direct users of a slot and fail closed on any use they do not
//! recognize. The predicates are pure functions of the IR, so results are
//! memoized per slot.

use rustc_hash::FxHashMap;

use crate::ir::{Function, FunId, GlobalId, Opcode, Operand, SlotId, TermOp, UseSite};

#[derive(Debug, Default)]
pub struct PatternCache {
    counters: FxHashMap<SlotId, bool>,
    saves: FxHashMap<SlotId, bool>,
}

impl PatternCache {
    pub fn new() -> Self {
        PatternCache::default()
    }

    /// A protection counter is an integer slot that is only ever assigned a
    /// constant or `slot + constant`, whose loads each have exactly one
    /// recognized user, and at least one of whose loads is passed to the
    /// unprotect primitive.
    pub fn is_counter(&mut self, fun: &Function, slot: SlotId, unprotect: Option<FunId>) -> bool {
        let Some(unprotect) = unprotect else {
            return false;
        };
        if let Some(&cached) = self.counters.get(&slot) {
            return cached;
        }
        let res = counter_shape(fun, slot, unprotect);
        self.counters.insert(slot, res);
        res
    }

    /// A save slot is a local whose every use either captures the stack-top
    /// global or stores it back.
    pub fn is_save_slot(
        &mut self,
        fun: &Function,
        slot: SlotId,
        stack_top: Option<GlobalId>,
    ) -> bool {
        let Some(stack_top) = stack_top else {
            return false;
        };
        if let Some(&cached) = self.saves.get(&slot) {
            return cached;
        }
        let res = save_shape(fun, slot, stack_top);
        self.saves.insert(slot, res);
        res
    }
}

fn counter_shape(fun: &Function, slot: SlotId, unprotect: FunId) -> bool {
    let info = fun.slot(slot);
    if !info.ty.is_int() || info.array {
        return false;
    }

    let mut passed_to_unprotect = false;
    for &site in fun.slot_users(slot) {
        let UseSite::Instr(i) = site else {
            return false;
        };
        match &fun.instr(i).op {
            // nprotect = 3   or   nprotect = nprotect + 3
            Opcode::Store { ptr, value } if *ptr == Operand::Slot(slot) => match *value {
                Operand::Const(_) => {}
                Operand::Value(v) => {
                    if add_of_slot_and_const(fun, v) != Some(slot) {
                        return false;
                    }
                }
                _ => return false,
            },
            Opcode::Load(ptr) if *ptr == Operand::Slot(slot) => {
                let users = fun.value_users(i);
                if users.len() != 1 {
                    return false;
                }
                match users[0] {
                    UseSite::Instr(u) => match &fun.instr(u).op {
                        Opcode::Call(call) => {
                            if call.target() != Some(unprotect)
                                || !call.args.contains(&Operand::Value(i))
                            {
                                return false;
                            }
                            passed_to_unprotect = true;
                        }
                        // The increment: the add must flow straight back
                        // into this slot.
                        Opcode::Add { .. } => {
                            if add_of_slot_and_const(fun, u) != Some(slot)
                                || !stored_only_to(fun, u, slot)
                            {
                                return false;
                            }
                        }
                        // nprotect2 = nprotect
                        Opcode::Store { ptr, value } => {
                            if *value != Operand::Value(i) {
                                return false;
                            }
                            match *ptr {
                                Operand::Slot(dst) => {
                                    let d = fun.slot(dst);
                                    if !d.ty.is_int() || d.array {
                                        return false;
                                    }
                                }
                                _ => return false,
                            }
                        }
                        // if (nprotect) ...
                        Opcode::Icmp { .. } => {
                            if !feeds_conditional_branch(fun, u) {
                                return false;
                            }
                        }
                        _ => return false,
                    },
                    UseSite::Term(_) => return false,
                }
            }
            // Any other use, including taking the slot's address.
            _ => return false,
        }
    }
    passed_to_unprotect
}

/// When `v` is `load(slot) + c` or `c + load(slot)`, returns the slot.
fn add_of_slot_and_const(fun: &Function, v: crate::ir::InstrId) -> Option<SlotId> {
    if let Opcode::Add { lhs, rhs } = fun.instr(v).op {
        let loaded = match (lhs, rhs) {
            (Operand::Const(_), other) => other,
            (other, Operand::Const(_)) => other,
            _ => return None,
        };
        return fun.loaded_slot(loaded);
    }
    None
}

fn stored_only_to(fun: &Function, v: crate::ir::InstrId, slot: SlotId) -> bool {
    let users = fun.value_users(v);
    users.len() == 1
        && match users[0] {
            UseSite::Instr(u) => matches!(
                &fun.instr(u).op,
                Opcode::Store { ptr, value }
                    if *ptr == Operand::Slot(slot) && *value == Operand::Value(v)
            ),
            UseSite::Term(_) => false,
        }
}

fn feeds_conditional_branch(fun: &Function, v: crate::ir::InstrId) -> bool {
    fun.value_users(v).iter().all(|site| match site {
        UseSite::Term(b) => matches!(
            &fun.block(*b).term.op,
            TermOp::CondBr { cond, .. } if *cond == Operand::Value(v)
        ),
        UseSite::Instr(_) => false,
    })
}

fn save_shape(fun: &Function, slot: SlotId, stack_top: GlobalId) -> bool {
    let mut uses_stack_top = false;
    for &site in fun.slot_users(slot) {
        let UseSite::Instr(i) = site else {
            return false;
        };
        match &fun.instr(i).op {
            // savestack = R_PPStackTop
            Opcode::Store { ptr, value } if *ptr == Operand::Slot(slot) => {
                match *value {
                    Operand::Value(v)
                        if fun.loaded_global(Operand::Value(v)) == Some(stack_top)
                            && fun.value_users(v).len() == 1 =>
                    {
                        uses_stack_top = true;
                    }
                    _ => return false,
                }
            }
            // R_PPStackTop = savestack
            Opcode::Load(ptr) if *ptr == Operand::Slot(slot) => {
                let users = fun.value_users(i);
                if users.len() != 1 {
                    return false;
                }
                match users[0] {
                    UseSite::Instr(u) => match &fun.instr(u).op {
                        Opcode::Store { ptr, value }
                            if *ptr == Operand::Global(stack_top)
                                && *value == Operand::Value(i) =>
                        {
                            uses_stack_top = true;
                        }
                        _ => return false,
                    },
                    UseSite::Term(_) => return false,
                }
            }
            _ => return false,
        }
    }
    uses_stack_top
}

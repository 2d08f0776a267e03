// SPDX-License-Identifier: BSD-3-Clause
//! The protection-balance engine: a per-function, path-sensitive abstract
//! interpretation of the protection stack.
//!
//! Each path tracks the stack depth relative to function entry, the depth
//! captured by a stack-top save slot, and the abstract value of at most one
//! protection counter variable. The counter is modeled in one of three
//! regimes: no known value, an exact value, or `Diff`, where the counter's
//! unknown value has already been folded into the depth as a negative
//! offset. Saturation into `Diff` keeps the state space finite; a state cap
//! backstops everything else.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashSet, FxHasher};

use crate::config::Runtime;
use crate::diag::{Kind, Loc, Messenger};
use crate::errors::{error_blocks, ErrorBlocks};
use crate::guards::{GuardDecision, GuardsChecker, IntGuards, IntPackId, SexpGuards, SexpPackId};
use crate::ir::{
    Block, BlockId, FunId, Function, Module, Opcode, Operand, SlotId, TermOp,
};
use crate::patterns::PatternCache;
use crate::symbols::SymbolsMap;

/// Counters larger than this saturate into the differential regime.
pub const MAX_COUNT: i64 = 64;
/// Paths deeper than this are reported and cut.
pub const MAX_DEPTH: i64 = 64;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CountState {
    None,
    Exact,
    Diff,
}

#[derive(Clone, Debug)]
struct State {
    block: BlockId,
    depth: i64,
    saved_depth: Option<i64>,
    count: i64,
    count_state: CountState,
    counter: Option<SlotId>,
    int_guards: IntGuards,
    sexp_guards: SexpGuards,
}

impl State {
    fn entry(block: BlockId) -> Self {
        State {
            block,
            depth: 0,
            saved_depth: None,
            count: -1,
            count_state: CountState::None,
            counter: None,
            int_guards: IntGuards::new(),
            sexp_guards: SexpGuards::new(),
        }
    }

    fn to_block(&self, block: BlockId) -> Self {
        let mut s = self.clone();
        s.block = block;
        s
    }

    fn describe(&self, fun: &Function) -> String {
        let mut out = format!("depth {}", self.depth);
        if let Some(saved) = self.saved_depth {
            out.push_str(&format!(", saved depth {}", saved));
        }
        match self.count_state {
            CountState::None => {}
            CountState::Exact => out.push_str(&format!(", count {}", self.count)),
            CountState::Diff => out.push_str(", differential count"),
        }
        if let Some(counter) = self.counter {
            out.push_str(&format!(", counter {}", fun.slot(counter).name));
        }
        out
    }
}

/// Hash-consed form of a [`State`]; the hash is computed once when packing.
#[derive(Clone, Debug)]
struct Packed {
    hash: u64,
    block: BlockId,
    depth: i64,
    saved_depth: Option<i64>,
    count: i64,
    count_state: CountState,
    counter: Option<SlotId>,
    int_guards: IntPackId,
    sexp_guards: SexpPackId,
}

impl PartialEq for Packed {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
            && self.depth == other.depth
            && self.saved_depth == other.saved_depth
            && self.count == other.count
            && self.count_state == other.count_state
            && self.counter == other.counter
            && self.int_guards == other.int_guards
            && self.sexp_guards == other.sexp_guards
    }
}

impl Eq for Packed {}

impl Hash for Packed {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BalanceOptions {
    pub max_states: usize,
}

impl Default for BalanceOptions {
    fn default() -> Self {
        BalanceOptions { max_states: 3000 }
    }
}

pub fn check_module(
    module: &Module,
    rt: &Runtime,
    symbols: &SymbolsMap,
    opts: &BalanceOptions,
    msg: &mut Messenger,
) {
    for f in module.defined_funs() {
        check_function(module, f, rt, symbols, opts, msg);
    }
}

pub fn check_function(
    module: &Module,
    fun_id: FunId,
    rt: &Runtime,
    symbols: &SymbolsMap,
    opts: &BalanceOptions,
    msg: &mut Messenger,
) {
    let Some(fun) = module.fun(fun_id).body.as_ref() else {
        return;
    };
    msg.start_function(module.fun_name(fun_id).to_string());
    let err_blocks = error_blocks(fun, rt);
    let mut cx = Checker {
        module,
        fun,
        fun_id,
        rt,
        symbols,
        err_blocks,
        patterns: PatternCache::new(),
        guards: GuardsChecker::new(),
        worklist: Vec::new(),
        done: FxHashSet::default(),
        msg,
    };
    cx.run(opts.max_states);
}

struct Checker<'a> {
    module: &'a Module,
    fun: &'a Function,
    fun_id: FunId,
    rt: &'a Runtime,
    symbols: &'a SymbolsMap,
    err_blocks: ErrorBlocks,
    patterns: PatternCache,
    guards: GuardsChecker,
    worklist: Vec<Packed>,
    done: FxHashSet<Packed>,
    msg: &'a mut Messenger,
}

impl<'a> Checker<'a> {
    fn run(&mut self, max_states: usize) {
        self.add(State::entry(self.fun.entry()));
        while let Some(packed) = self.worklist.pop() {
            if self.done.len() > max_states {
                eprintln!(
                    "ERROR: too many states (abstraction error?) in function {}",
                    self.module.fun_name(self.fun_id)
                );
                let loc = Loc::instr(self.fun.entry(), 0, None);
                self.msg
                    .info(self.module, self.fun_id, Kind::TooManyStates, loc);
                return;
            }
            if self.err_blocks.contains(&packed.block) {
                continue;
            }
            let mut s = self.unpack(&packed);
            let block = self.fun.block(s.block);
            self.msg.trace(
                self.module,
                self.fun_id,
                &format!("visiting state: {}", s.describe(self.fun)),
                &Loc::instr(s.block, 0, None),
            );
            for (pos, &iid) in block.instrs.iter().enumerate() {
                let instr = self.fun.instr(iid);
                let loc = Loc::instr(s.block, pos, instr.loc);
                self.handle_call(&mut s, iid, &loc);
                self.handle_load(&mut s, iid, &loc);
                self.handle_store(&mut s, iid, &loc);
                self.guards.transfer_int(self.fun, instr, &mut s.int_guards);
                self.guards.transfer_sexp(
                    self.fun,
                    instr,
                    &mut s.sexp_guards,
                    self.rt,
                    self.symbols,
                    None,
                );
            }
            self.handle_terminator(s, block);
        }
    }

    fn add(&mut self, s: State) -> bool {
        let packed = self.pack(&s);
        if self.done.insert(packed.clone()) {
            self.worklist.push(packed);
            true
        } else {
            false
        }
    }

    fn pack(&mut self, s: &State) -> Packed {
        let int_guards = self.guards.pack_int(&s.int_guards);
        let sexp_guards = self.guards.pack_sexp(&s.sexp_guards);
        let mut h = FxHasher::default();
        (
            s.block,
            s.depth,
            s.saved_depth,
            s.count,
            s.count_state,
            s.counter,
            int_guards,
            sexp_guards,
        )
            .hash(&mut h);
        Packed {
            hash: h.finish(),
            block: s.block,
            depth: s.depth,
            saved_depth: s.saved_depth,
            count: s.count,
            count_state: s.count_state,
            counter: s.counter,
            int_guards,
            sexp_guards,
        }
    }

    fn unpack(&self, p: &Packed) -> State {
        State {
            block: p.block,
            depth: p.depth,
            saved_depth: p.saved_depth,
            count: p.count,
            count_state: p.count_state,
            counter: p.counter,
            int_guards: self.guards.unpack_int(p.int_guards),
            sexp_guards: self.guards.unpack_sexp(p.sexp_guards),
        }
    }

    fn info(&mut self, kind: Kind, loc: &Loc) {
        self.msg.info(self.module, self.fun_id, kind, *loc);
    }

    /// Binds the path's counter variable, reporting when a second one
    /// appears.
    fn bind_counter(&mut self, s: &mut State, slot: SlotId, loc: &Loc) -> bool {
        match s.counter {
            None => {
                s.counter = Some(slot);
                true
            }
            Some(bound) if bound == slot => true,
            Some(_) => {
                self.info(Kind::MultipleCounters, loc);
                false
            }
        }
    }

    fn handle_call(&mut self, s: &mut State, iid: crate::ir::InstrId, loc: &Loc) {
        let Opcode::Call(call) = &self.fun.instr(iid).op else {
            return;
        };
        let Some(target) = call.target() else {
            return;
        };

        if self.rt.protect == Some(target) || self.rt.protect_with_index == Some(target) {
            s.depth += 1;
            self.msg.debug(self.module, self.fun_id, "protect call", loc);
            return;
        }

        if self.rt.unprotect == Some(target) {
            match call.args.first().copied() {
                // UNPROTECT(3)
                Some(Operand::Const(k)) => {
                    s.depth -= k;
                    self.msg
                        .debug(self.module, self.fun_id, "unprotect call using constant", loc);
                    if s.count_state != CountState::Diff && s.depth < 0 {
                        self.info(Kind::NegativeDepth, loc);
                    }
                }
                // UNPROTECT(nprotect)
                Some(arg) => {
                    let Some(slot) = self.fun.loaded_slot(arg) else {
                        return;
                    };
                    if !self.patterns.is_counter(self.fun, slot, self.rt.unprotect) {
                        self.info(Kind::UnsupportedForm, loc);
                        return;
                    }
                    if !self.bind_counter(s, slot, loc) {
                        return;
                    }
                    match s.count_state {
                        CountState::None => {
                            self.info(Kind::UninitializedCounter, loc);
                        }
                        CountState::Exact => {
                            s.depth -= s.count;
                            self.msg.debug(
                                self.module,
                                self.fun_id,
                                "unprotect call using counter in exact state",
                                loc,
                            );
                            if s.depth < 0 {
                                self.info(Kind::NegativeDepth, loc);
                            }
                        }
                        CountState::Diff => {
                            self.msg.debug(
                                self.module,
                                self.fun_id,
                                "unprotect call using counter in diff state",
                                loc,
                            );
                            // The depth already reflects the counter; it is
                            // exact again from here on.
                            s.count_state = CountState::None;
                            if s.depth < 0 {
                                self.info(Kind::NegativeDepth, loc);
                            }
                        }
                    }
                }
                None => {}
            }
            return;
        }

        if self.rt.unprotect_ptr == Some(target) {
            self.msg
                .debug(self.module, self.fun_id, "unprotect_ptr call", loc);
            s.depth -= 1;
            if s.count_state != CountState::Diff && s.depth < 0 {
                self.info(Kind::NegativeDepth, loc);
            }
        }
    }

    /// A single-use load of the stack-top global stored into a save slot
    /// captures the current depth.
    fn handle_load(&mut self, s: &mut State, iid: crate::ir::InstrId, loc: &Loc) {
        let Opcode::Load(ptr) = self.fun.instr(iid).op else {
            return;
        };
        if Some(ptr) != self.rt.stack_top.map(Operand::Global) {
            return;
        }
        let users = self.fun.value_users(iid);
        if users.len() != 1 {
            return;
        }
        let crate::ir::UseSite::Instr(u) = users[0] else {
            return;
        };
        let Opcode::Store {
            ptr: Operand::Slot(slot),
            ..
        } = self.fun.instr(u).op
        else {
            return;
        };
        if !self.patterns.is_save_slot(self.fun, slot, self.rt.stack_top) {
            return;
        }
        if s.count_state == CountState::Diff {
            self.info(Kind::SaveInDiff, loc);
            return;
        }
        s.saved_depth = Some(s.depth);
        self.msg
            .debug(self.module, self.fun_id, "saving value of the stack top", loc);
    }

    fn handle_store(&mut self, s: &mut State, iid: crate::ir::InstrId, loc: &Loc) {
        let Opcode::Store { ptr, value } = self.fun.instr(iid).op else {
            return;
        };

        // R_PPStackTop = ...
        if Some(ptr) == self.rt.stack_top.map(Operand::Global) {
            if let Some(slot) = self.fun.loaded_slot(value) {
                if self.patterns.is_save_slot(self.fun, slot, self.rt.stack_top) {
                    if s.count_state == CountState::Diff {
                        self.info(Kind::RestoreInDiff, loc);
                        return;
                    }
                    self.msg.debug(
                        self.module,
                        self.fun_id,
                        "restoring value of the stack top",
                        loc,
                    );
                    match s.saved_depth {
                        None => self.info(Kind::RestoreFromUninitializedSave, loc),
                        Some(saved) => s.depth = saved,
                    }
                    return;
                }
            }
            self.info(Kind::DirectStackTopWrite, loc);
            return;
        }

        // nprotect = ...
        let Operand::Slot(slot) = ptr else {
            return;
        };
        if !self.patterns.is_counter(self.fun, slot, self.rt.unprotect) {
            return;
        }
        if !self.bind_counter(s, slot, loc) {
            return;
        }
        match value {
            // nprotect = 3
            Operand::Const(c) => {
                if s.count_state == CountState::Diff {
                    self.info(Kind::CounterSetInDiff, loc);
                    return;
                }
                s.count = c;
                s.count_state = CountState::Exact;
                self.msg
                    .debug(self.module, self.fun_id, "setting counter to a constant", loc);
                if c < 0 {
                    self.info(Kind::NegativeCounter, loc);
                }
            }
            // nprotect += 3
            Operand::Value(v) => {
                let Some((src, c)) = self.add_operands(v) else {
                    return;
                };
                if Some(src) != s.counter {
                    return;
                }
                if s.count_state == CountState::None {
                    self.info(Kind::AddToUninitializedCounter, loc);
                    return;
                }
                self.msg
                    .debug(self.module, self.fun_id, "adding a constant to counter", loc);
                match s.count_state {
                    CountState::Exact => {
                        s.count += c;
                        if s.count < 0 {
                            self.info(Kind::NegativeCounter, loc);
                        }
                    }
                    // Fewer protects on top of the counter than before.
                    CountState::Diff => s.depth -= c,
                    CountState::None => unreachable!(),
                }
            }
            _ => {}
        }
    }

    /// When `v` is `load(slot) + c` in either operand order, returns the
    /// slot and the constant.
    fn add_operands(&self, v: crate::ir::InstrId) -> Option<(SlotId, i64)> {
        let Opcode::Add { lhs, rhs } = self.fun.instr(v).op else {
            return None;
        };
        let (c, other) = match (lhs, rhs) {
            (Operand::Const(c), other) => (c, other),
            (other, Operand::Const(c)) => (c, other),
            _ => return None,
        };
        Some((self.fun.loaded_slot(other)?, c))
    }

    fn handle_terminator(&mut self, mut s: State, block: &Block) {
        let loc = Loc::term(s.block, block.instrs.len(), block.term.loc);

        if let TermOp::Ret(_) = block.term.op {
            if s.count_state == CountState::Diff || s.depth != 0 {
                self.info(Kind::Imbalance, &loc);
            }
            return;
        }

        // Saturate the counter so the abstract state space stays finite.
        if s.count > MAX_COUNT {
            debug_assert_eq!(s.count_state, CountState::Exact);
            s.count_state = CountState::Diff;
            s.depth -= s.count;
            s.count = -1;
        }

        if s.depth > MAX_DEPTH {
            self.info(Kind::TooDeep, &loc);
            return;
        }

        // Impossible path; the counter regime keeps -1 as "no value", so
        // this pruning only applies outside the differential state.
        if s.count_state != CountState::Diff && s.depth < 0 {
            return;
        }

        if self.counter_branch(&mut s, block, &loc) {
            return;
        }

        match self
            .guards
            .sexp_branch(self.fun, &block.term.op, &s.sexp_guards, self.rt, self.symbols)
        {
            Some(GuardDecision::Taken(succ)) => {
                self.add(s.to_block(succ));
                return;
            }
            Some(GuardDecision::Fork { slot, arms }) => {
                for (succ, fact) in arms {
                    let mut next = s.to_block(succ);
                    next.sexp_guards.insert(slot, fact);
                    self.add(next);
                }
                return;
            }
            Some(GuardDecision::ForkInt { .. }) | None => {}
        }

        match self.guards.int_branch(self.fun, &block.term.op, &s.int_guards) {
            Some(GuardDecision::Taken(succ)) => {
                self.add(s.to_block(succ));
                return;
            }
            Some(GuardDecision::ForkInt {
                slot,
                zero,
                nonzero,
            }) => {
                let mut z = s.to_block(zero);
                z.int_guards.insert(slot, crate::guards::IntGuardState::Zero);
                self.add(z);
                let mut nz = s.to_block(nonzero);
                nz.int_guards
                    .insert(slot, crate::guards::IntGuardState::NonZero);
                self.add(nz);
                return;
            }
            Some(GuardDecision::Fork { .. }) | None => {}
        }

        for succ in block.term.op.successors() {
            if self.add(s.to_block(succ)) {
                self.msg
                    .trace(self.module, self.fun_id, "added successor", &loc);
            }
        }
    }

    /// Branch folding on the counter: with an exact count the comparison is
    /// decided outright; in the differential state the idiomatic
    /// `if (nprotect) UNPROTECT(nprotect)` collapses to its join block.
    fn counter_branch(&mut self, s: &mut State, block: &Block, loc: &Loc) -> bool {
        let TermOp::CondBr {
            cond,
            if_true,
            if_false,
        } = block.term.op
        else {
            return false;
        };
        let Operand::Value(ci) = cond else {
            return false;
        };
        let Opcode::Icmp { pred, lhs, rhs } = self.fun.instr(ci).op else {
            return false;
        };
        let (pred, other, konst) = match (lhs, rhs) {
            (Operand::Const(c), other) => (pred.flip(), other, c),
            (other, Operand::Const(c)) => (pred, other, c),
            _ => return false,
        };
        let Some(slot) = self.fun.loaded_slot(other) else {
            return false;
        };
        if !self.patterns.is_counter(self.fun, slot, self.rt.unprotect) {
            return false;
        }
        if !self.bind_counter(s, slot, loc) {
            return false;
        }

        match s.count_state {
            CountState::None => {
                self.info(Kind::BranchOnUninitializedCounter, loc);
                false
            }
            CountState::Exact => {
                self.msg.debug(
                    self.module,
                    self.fun_id,
                    "folding out branch on counter value",
                    loc,
                );
                let succ = if pred.eval(s.count, konst) {
                    if_true
                } else {
                    if_false
                };
                if self.add(s.to_block(succ)) {
                    self.msg
                        .trace(self.module, self.fun_id, "added folded successor", loc);
                }
                true
            }
            CountState::Diff => {
                // Only `if (nprotect != 0)` in front of the exact
                // three-instruction unprotect block is recognized; other
                // equivalent shapes fall through to plain enumeration.
                if !pred.is_equality() || konst != 0 {
                    return false;
                }
                let (unprotect_succ, join_succ) = if pred.true_when_equal() {
                    (if_false, if_true)
                } else {
                    (if_true, if_false)
                };
                if !self.is_unprotect_block(unprotect_succ, slot, join_succ) {
                    return false;
                }
                self.msg.debug(
                    self.module,
                    self.fun_id,
                    "simplifying unprotect conditional on counter value (diff state)",
                    loc,
                );
                // UNPROTECT(0) does nothing, so both arms land in the join
                // block with the counter absorbed.
                s.count_state = CountState::None;
                if s.depth < 0 {
                    self.info(Kind::NegativeDepth, loc);
                    return false;
                }
                if self.add(s.to_block(join_succ)) {
                    self.msg.trace(
                        self.module,
                        self.fun_id,
                        "added folded successor (diff counter state)",
                        loc,
                    );
                }
                true
            }
        }
    }

    /// Exactly `load counter; UNPROTECT(load); br join`.
    fn is_unprotect_block(&self, b: BlockId, counter: SlotId, join: BlockId) -> bool {
        let block = self.fun.block(b);
        if block.instrs.len() != 2 {
            return false;
        }
        let load = block.instrs[0];
        if self.fun.instr(load).op != Opcode::Load(Operand::Slot(counter)) {
            return false;
        }
        let Opcode::Call(call) = &self.fun.instr(block.instrs[1]).op else {
            return false;
        };
        if self.rt.unprotect.is_none() || call.target() != self.rt.unprotect {
            return false;
        }
        if call.args.first() != Some(&Operand::Value(load)) {
            return false;
        }
        block.term.op == TermOp::Br(join)
    }
}

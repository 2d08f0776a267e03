// SPDX-License-Identifier: BSD-3-Clause
//! Allocator inference. A coarse call-graph pass seeds the function-level
//! "may allocate" and "possible allocator" relations; a context-sensitive
//! dataflow then refines them per call signature, tracking which called
//! signatures may allocate and which slots may hold their freshly returned
//! values. The transitive closure of the resulting `calls` and `wraps`
//! relations decides which signatures reach the collector.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashSet, FxHasher};

use crate::closure::Relation;
use crate::config::Runtime;
use crate::diag::{Kind, Loc, Messenger};
use crate::errors::{error_blocks, ErrorBlocks};
use crate::guards::{GuardDecision, GuardsChecker, IntGuards, IntPackId, SexpGuards, SexpPackId};
use crate::intern::Interner;
use crate::ir::{BlockId, FunId, Function, Module, Opcode, Operand, SlotId, TermOp};
use crate::sigs::{SigId, SigTable};
use crate::symbols::SymbolsMap;

#[derive(Clone, Copy, Debug)]
pub struct AllocOptions {
    pub max_states: usize,
}

impl Default for AllocOptions {
    fn default() -> Self {
        AllocOptions { max_states: 3000 }
    }
}

/// Signatures reaching the collector, sorted by index.
#[derive(Debug, Default)]
pub struct AllocResults {
    pub allocating: Vec<SigId>,
    pub possible_allocators: Vec<SigId>,
}

/// Module-wide allocator analysis. The signature table persists across
/// functions so signature indices stay stable; the per-function dataflow
/// state does not.
pub struct AllocModule<'m> {
    pub module: &'m Module,
    pub rt: &'m Runtime,
    pub symbols: &'m SymbolsMap,
    pub sigs: SigTable,
    gc_sig: Option<SigId>,
    allocating_funs: FxHashSet<FunId>,
    possible_alloc_funs: FxHashSet<FunId>,
    opts: AllocOptions,
}

impl<'m> AllocModule<'m> {
    pub fn new(
        module: &'m Module,
        rt: &'m Runtime,
        symbols: &'m SymbolsMap,
        opts: AllocOptions,
    ) -> Self {
        let (allocating_funs, possible_alloc_funs) = coarse_seeds(module, rt);
        let mut sigs = SigTable::new();
        // Every function gets its context-free signature up front, in
        // module order, so reports stay stable.
        for f in module.fun_ids() {
            sigs.plain(module, f);
        }
        let gc_sig = rt.gc.map(|gc| sigs.plain(module, gc));
        AllocModule {
            module,
            rt,
            symbols,
            sigs,
            gc_sig,
            allocating_funs,
            possible_alloc_funs,
            opts,
        }
    }

    /// Function-level may-allocate, from the coarse seed.
    pub fn is_allocating(&self, f: FunId) -> bool {
        self.allocating_funs.contains(&f)
    }

    /// Function-level possible allocator, from the coarse seed.
    pub fn is_possible_allocator(&self, f: FunId) -> bool {
        self.possible_alloc_funs.contains(&f)
    }

    /// Runs the per-signature dataflow over every interesting signature and
    /// closes the `calls`/`wraps` relations. New signatures interned while
    /// a function is analyzed are picked up later in the same sweep.
    pub fn compute(&mut self, msg: &mut Messenger) -> AllocResults {
        let mut calls = Relation::new();
        let mut wraps = Relation::new();

        let mut i = 0;
        while i < self.sigs.len() {
            let sig = SigId(i as u32);
            let cf = self.sigs.sig(sig);
            if self.module.fun(cf.fun).body.is_some() && self.is_allocating(cf.fun) {
                let (called, wrapped) = self.called_and_wrapped(sig, msg);
                for c in called {
                    calls.add(sig.0, c.0);
                }
                for w in wrapped {
                    wraps.add(sig.0, w.0);
                }
            }
            i += 1;
        }

        let n = self.sigs.len();
        calls.grow(n);
        wraps.grow(n);
        calls.close();
        wraps.close();

        let mut results = AllocResults::default();
        let Some(gc) = self.gc_sig else {
            return results;
        };
        for i in 0..n as u32 {
            if calls.contains(i, gc.0) {
                results.allocating.push(SigId(i));
            }
            if wraps.contains(i, gc.0) {
                let target = self.sigs.sig(SigId(i)).fun;
                if !self.rt.non_allocators.contains(&target) {
                    results.possible_allocators.push(SigId(i));
                }
            }
        }
        // The collector itself is both.
        if !results.allocating.contains(&gc) {
            results.allocating.push(gc);
            results.allocating.sort_unstable();
        }
        if !results.possible_allocators.contains(&gc) {
            results.possible_allocators.push(gc);
            results.possible_allocators.sort_unstable();
        }
        results
    }

    /// The per-signature dataflow: which allocating signatures does this
    /// function call, and which possible-allocator signatures can its
    /// return value come from.
    fn called_and_wrapped(
        &mut self,
        sig: SigId,
        msg: &mut Messenger,
    ) -> (BTreeSet<SigId>, BTreeSet<SigId>) {
        let mut called = BTreeSet::new();
        let mut wrapped = BTreeSet::new();

        let cf = self.sigs.sig(sig);
        let Some(fun) = self.module.fun(cf.fun).body.as_ref() else {
            return (called, wrapped);
        };
        msg.start_function(self.sigs.name(self.module, sig));

        let arg_info: Vec<crate::sigs::ArgInfo> =
            self.sigs.arg_infos(cf.args).iter().copied().collect();
        let err_blocks = error_blocks(fun, self.rt);
        let returned = possibly_returned_slots(fun);
        let track_origins = self.module.fun(cf.fun).ret.is_sexp();

        let mut flow = Flow {
            guards: GuardsChecker::new(),
            origin_sets: Interner::new(),
            worklist: Vec::new(),
            done: FxHashSet::default(),
        };
        flow.add(FlowState::entry(fun.entry()));

        while let Some(packed) = flow.worklist.pop() {
            if err_blocks.contains(&packed.block) {
                continue;
            }
            if flow.done.len() > self.opts.max_states {
                eprintln!(
                    "ERROR: too many states (abstraction error?) in function {}",
                    self.sigs.name(self.module, sig)
                );
                msg.info(
                    self.module,
                    cf.fun,
                    Kind::TooManyStates,
                    Loc::instr(fun.entry(), 0, None),
                );
                self.insensitive_sweep(cf.fun, fun, &err_blocks, &mut called, &mut wrapped);
                return self.with_gc_exception(track_origins, called, wrapped);
            }
            let mut s = flow.unpack(&packed);
            let block = fun.block(s.block);

            for &iid in &block.instrs {
                let instr = fun.instr(iid);
                flow.guards.transfer_int(fun, instr, &mut s.int_guards);
                flow.guards.transfer_sexp(
                    fun,
                    instr,
                    &mut s.sexp_guards,
                    self.rt,
                    self.symbols,
                    Some(arg_info.as_slice()),
                );

                // Assignments into slots that may flow to the return value.
                if track_origins {
                    if let Opcode::Store {
                        ptr: Operand::Slot(dst),
                        value,
                    } = instr.op
                    {
                        if returned.contains(&dst) {
                            // Assignment is destructive.
                            s.origins.remove(&dst);
                            if let Some(src) = fun.loaded_slot(value) {
                                if let Some(srcs) = s.origins.get(&src).cloned() {
                                    s.origins.insert(dst, srcs);
                                }
                                continue;
                            }
                            if let Operand::Value(v) = value {
                                if let Opcode::Call(call) = &fun.instr(v).op {
                                    if let Some(tgt) = self.sigs.resolve_call(
                                        fun,
                                        call,
                                        Some(&s.sexp_guards),
                                        self.symbols,
                                        self.rt,
                                    ) {
                                        if self.is_possible_allocator(self.sigs.sig(tgt).fun) {
                                            s.origins
                                                .insert(dst, BTreeSet::from([tgt]));
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                // Record allocating calls at the function level.
                if let Opcode::Call(call) = &instr.op {
                    if let Some(tgt) = self.sigs.resolve_call(
                        fun,
                        call,
                        Some(&s.sexp_guards),
                        self.symbols,
                        self.rt,
                    ) {
                        if self.is_allocating(self.sigs.sig(tgt).fun) {
                            called.insert(tgt);
                        }
                    }
                }
            }

            let term = &block.term;
            if let TermOp::Ret(ret) = &term.op {
                if track_origins {
                    if let Some(op) = ret {
                        if let Some(src) = fun.loaded_slot(*op) {
                            if let Some(srcs) = s.origins.get(&src) {
                                wrapped.extend(srcs.iter().copied());
                            }
                        }
                        if let Operand::Value(v) = op {
                            if let Opcode::Call(call) = &fun.instr(*v).op {
                                if let Some(tgt) = self.sigs.resolve_call(
                                    fun,
                                    call,
                                    Some(&s.sexp_guards),
                                    self.symbols,
                                    self.rt,
                                ) {
                                    if self.is_possible_allocator(self.sigs.sig(tgt).fun) {
                                        wrapped.insert(tgt);
                                    }
                                }
                            }
                        }
                    }
                }
                continue;
            }

            match flow
                .guards
                .sexp_branch(fun, &term.op, &s.sexp_guards, self.rt, self.symbols)
            {
                Some(GuardDecision::Taken(succ)) => {
                    flow.add(s.to_block(succ));
                    continue;
                }
                Some(GuardDecision::Fork { slot, arms }) => {
                    for (succ, fact) in arms {
                        let mut next = s.to_block(succ);
                        next.sexp_guards.insert(slot, fact);
                        flow.add(next);
                    }
                    continue;
                }
                Some(GuardDecision::ForkInt { .. }) | None => {}
            }

            match flow.guards.int_branch(fun, &term.op, &s.int_guards) {
                Some(GuardDecision::Taken(succ)) => {
                    flow.add(s.to_block(succ));
                    continue;
                }
                Some(GuardDecision::ForkInt {
                    slot,
                    zero,
                    nonzero,
                }) => {
                    let mut z = s.to_block(zero);
                    z.int_guards
                        .insert(slot, crate::guards::IntGuardState::Zero);
                    flow.add(z);
                    let mut nz = s.to_block(nonzero);
                    nz.int_guards
                        .insert(slot, crate::guards::IntGuardState::NonZero);
                    flow.add(nz);
                    continue;
                }
                Some(GuardDecision::Fork { .. }) | None => {}
            }

            for succ in term.op.successors() {
                flow.add(s.to_block(succ));
            }
        }

        self.with_gc_exception(track_origins, called, wrapped)
    }

    /// Calling the collector and returning an SEXP counts as possibly
    /// returning a collector-touched value.
    fn with_gc_exception(
        &self,
        track_origins: bool,
        called: BTreeSet<SigId>,
        mut wrapped: BTreeSet<SigId>,
    ) -> (BTreeSet<SigId>, BTreeSet<SigId>) {
        if let Some(gc) = self.gc_sig {
            if track_origins && called.contains(&gc) {
                wrapped.insert(gc);
            }
        }
        (called, wrapped)
    }

    /// Flow-insensitive fallback after abstraction overflow: every direct
    /// call in the function contributes, with no guard refinement.
    fn insensitive_sweep(
        &mut self,
        fun_id: FunId,
        fun: &Function,
        err_blocks: &ErrorBlocks,
        called: &mut BTreeSet<SigId>,
        wrapped: &mut BTreeSet<SigId>,
    ) {
        let origin_allocating = self.is_allocating(fun_id);
        let origin_allocator = self.is_possible_allocator(fun_id);
        if !origin_allocating && !origin_allocator {
            return;
        }
        for (bi, block) in fun.blocks.iter().enumerate() {
            if err_blocks.contains(&BlockId(bi as u32)) {
                continue;
            }
            for &iid in &block.instrs {
                let Opcode::Call(call) = &fun.instr(iid).op else {
                    continue;
                };
                let Some(tgt) = self
                    .sigs
                    .resolve_call(fun, call, None, self.symbols, self.rt)
                else {
                    continue;
                };
                let target_fun = self.sigs.sig(tgt).fun;
                if origin_allocating && self.is_allocating(target_fun) {
                    called.insert(tgt);
                }
                if origin_allocator && self.is_possible_allocator(target_fun) {
                    wrapped.insert(tgt);
                }
            }
        }
    }
}

/// Function-level seeding by direct-call-graph reachability: a function may
/// allocate when it reaches the collector, and is a coarse possible
/// allocator when it additionally returns an SEXP.
fn coarse_seeds(module: &Module, rt: &Runtime) -> (FxHashSet<FunId>, FxHashSet<FunId>) {
    let mut allocating: FxHashSet<FunId> = rt.allocating_seed.clone();
    if let Some(gc) = rt.gc {
        allocating.insert(gc);
    }
    if allocating.is_empty() {
        return (FxHashSet::default(), FxHashSet::default());
    }

    let mut changed = true;
    while changed {
        changed = false;
        for f in module.defined_funs() {
            if allocating.contains(&f) {
                continue;
            }
            let Some(fun) = module.fun(f).body.as_ref() else {
                continue;
            };
            let calls_allocating = fun.instr_ids().any(|i| {
                matches!(
                    &fun.instr(i).op,
                    Opcode::Call(call)
                        if call.target().is_some_and(|t| allocating.contains(&t))
                )
            });
            if calls_allocating {
                allocating.insert(f);
                changed = true;
            }
        }
    }

    let mut possible: FxHashSet<FunId> = allocating
        .iter()
        .copied()
        .filter(|&f| module.fun(f).ret.is_sexp())
        .collect();
    if let Some(gc) = rt.gc {
        possible.insert(gc);
    }
    (allocating, possible)
}

/// Slots whose contents may flow to a `return`, via direct returns and
/// slot-to-slot copies.
fn possibly_returned_slots(fun: &Function) -> FxHashSet<SlotId> {
    let mut returned = FxHashSet::default();
    for block in &fun.blocks {
        if let TermOp::Ret(Some(op)) = &block.term.op {
            if let Some(slot) = fun.loaded_slot(*op) {
                returned.insert(slot);
            }
        }
    }
    let mut changed = true;
    while changed {
        changed = false;
        for i in fun.instr_ids() {
            if let Opcode::Store {
                ptr: Operand::Slot(dst),
                value,
            } = fun.instr(i).op
            {
                if returned.contains(&dst) {
                    if let Some(src) = fun.loaded_slot(value) {
                        if returned.insert(src) {
                            changed = true;
                        }
                    }
                }
            }
        }
    }
    returned
}

// ------------------------------------------------------------------
// Dataflow state

#[derive(Clone, Debug)]
struct FlowState {
    block: BlockId,
    int_guards: IntGuards,
    sexp_guards: SexpGuards,
    /// Per slot, the signatures whose returned value may currently sit in
    /// it.
    origins: BTreeMap<SlotId, BTreeSet<SigId>>,
}

impl FlowState {
    fn entry(block: BlockId) -> Self {
        FlowState {
            block,
            int_guards: IntGuards::new(),
            sexp_guards: SexpGuards::new(),
            origins: BTreeMap::new(),
        }
    }

    fn to_block(&self, block: BlockId) -> Self {
        let mut s = self.clone();
        s.block = block;
        s
    }
}

/// Hash-consed dataflow state; origin sets are interned so equality is a
/// vector of integer pairs.
#[derive(Clone, Debug)]
struct PackedFlow {
    hash: u64,
    block: BlockId,
    int_guards: IntPackId,
    sexp_guards: SexpPackId,
    origins: Vec<(SlotId, u32)>,
}

impl PartialEq for PackedFlow {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
            && self.int_guards == other.int_guards
            && self.sexp_guards == other.sexp_guards
            && self.origins == other.origins
    }
}

impl Eq for PackedFlow {}

impl Hash for PackedFlow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

struct Flow {
    guards: GuardsChecker,
    origin_sets: Interner<Vec<SigId>>,
    worklist: Vec<PackedFlow>,
    done: FxHashSet<PackedFlow>,
}

impl Flow {
    fn add(&mut self, s: FlowState) -> bool {
        let packed = self.pack(&s);
        if self.done.insert(packed.clone()) {
            self.worklist.push(packed);
            true
        } else {
            false
        }
    }

    fn pack(&mut self, s: &FlowState) -> PackedFlow {
        let int_guards = self.guards.pack_int(&s.int_guards);
        let sexp_guards = self.guards.pack_sexp(&s.sexp_guards);
        let origins: Vec<(SlotId, u32)> = s
            .origins
            .iter()
            .map(|(slot, set)| {
                let v: Vec<SigId> = set.iter().copied().collect();
                (*slot, self.origin_sets.intern(v))
            })
            .collect();
        let mut h = FxHasher::default();
        (s.block, int_guards, sexp_guards, &origins).hash(&mut h);
        PackedFlow {
            hash: h.finish(),
            block: s.block,
            int_guards,
            sexp_guards,
            origins,
        }
    }

    fn unpack(&self, p: &PackedFlow) -> FlowState {
        FlowState {
            block: p.block,
            int_guards: self.guards.unpack_int(p.int_guards),
            sexp_guards: self.guards.unpack_sexp(p.sexp_guards),
            origins: p
                .origins
                .iter()
                .map(|(slot, set)| {
                    (
                        *slot,
                        self.origin_sets.get(*set).iter().copied().collect(),
                    )
                })
                .collect(),
        }
    }
}

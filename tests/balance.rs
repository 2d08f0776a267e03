// SPDX-License-Identifier: BSD-3-Clause
//! Protection-balance scenarios, built directly on the analysis IR.

use protcheck::balance::{check_function, BalanceOptions};
use protcheck::diag::{Kind, Messenger};
use protcheck::ir::{FunctionBuilder, Opcode, Operand, Pred, TermOp, Type};

mod common;
use common::Fixture;

fn quiet() -> Messenger {
    Messenger::new(true).quiet()
}

#[test]
fn balanced_constant_protects() {
    // PROTECT(a); PROTECT(b); UNPROTECT(2); return a;
    let mut fx = Fixture::new();
    let f = fx
        .mb
        .declare("two_protects", vec![Type::Sexp, Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let b0 = fb.block();
    fb.call(b0, fx.protect, &[Operand::Param(0)]);
    fb.call(b0, fx.protect, &[Operand::Param(1)]);
    fb.call(b0, fx.unprotect, &[Operand::Const(2)]);
    fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert!(msg.infos().is_empty(), "unexpected: {:?}", msg.infos());
}

#[test]
fn constant_unprotect_underflow() {
    // PROTECT(a); UNPROTECT(2); return a;
    let mut fx = Fixture::new();
    let f = fx.mb.declare("underflow", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let b0 = fb.block();
    fb.call(b0, fx.protect, &[Operand::Param(0)]);
    fb.call(b0, fx.unprotect, &[Operand::Const(2)]);
    fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert_eq!(msg.count(Kind::NegativeDepth), 1);
}

#[test]
fn counter_idiom_is_balanced() {
    // int n = 0; PROTECT(a); n++; if (n) UNPROTECT(n); return a;
    let mut fx = Fixture::new();
    let f = fx.mb.declare("counter_idiom", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let n = fb.slot("nprotect", Type::Int { bits: 32 });
    let b0 = fb.block();
    let b_unprotect = fb.block();
    let b_join = fb.block();

    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(n),
            value: Operand::Const(0),
        },
    );
    fb.call(b0, fx.protect, &[Operand::Param(0)]);
    let l = fb.load_slot(b0, n);
    let add = fb.push(
        b0,
        Opcode::Add {
            lhs: Operand::Value(l),
            rhs: Operand::Const(1),
        },
    );
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(n),
            value: Operand::Value(add),
        },
    );
    let l2 = fb.load_slot(b0, n);
    let cmp = fb.push(
        b0,
        Opcode::Icmp {
            pred: Pred::Ne,
            lhs: Operand::Value(l2),
            rhs: Operand::Const(0),
        },
    );
    fb.terminate(
        b0,
        TermOp::CondBr {
            cond: Operand::Value(cmp),
            if_true: b_unprotect,
            if_false: b_join,
        },
    );

    let l3 = fb.load_slot(b_unprotect, n);
    fb.call(b_unprotect, fx.unprotect, &[Operand::Value(l3)]);
    fb.terminate(b_unprotect, TermOp::Br(b_join));

    fb.terminate(b_join, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert!(msg.infos().is_empty(), "unexpected: {:?}", msg.infos());
}

#[test]
fn counter_used_uninitialized() {
    // int n; UNPROTECT(n); return a;
    let mut fx = Fixture::new();
    let f = fx.mb.declare("uninit_counter", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let n = fb.slot("nprotect", Type::Int { bits: 32 });
    let b0 = fb.block();
    let l = fb.load_slot(b0, n);
    fb.call(b0, fx.unprotect, &[Operand::Value(l)]);
    fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert_eq!(msg.count(Kind::UninitializedCounter), 1);
}

#[test]
fn save_and_restore_stack_top() {
    // save = R_PPStackTop; PROTECT(a); PROTECT(b);
    // R_PPStackTop = save; return a;
    let mut fx = Fixture::new();
    let f = fx
        .mb
        .declare("save_restore", vec![Type::Sexp, Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let save = fb.slot("savestack", Type::Ptr);
    let b0 = fb.block();
    let top = fb.push(b0, Opcode::Load(Operand::Global(fx.stack_top)));
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(save),
            value: Operand::Value(top),
        },
    );
    fb.call(b0, fx.protect, &[Operand::Param(0)]);
    fb.call(b0, fx.protect, &[Operand::Param(1)]);
    let restored = fb.load_slot(b0, save);
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Global(fx.stack_top),
            value: Operand::Value(restored),
        },
    );
    fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert!(msg.infos().is_empty(), "unexpected: {:?}", msg.infos());
}

#[test]
fn direct_stack_top_write_is_flagged() {
    let mut fx = Fixture::new();
    let f = fx.mb.declare("raw_write", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let b0 = fb.block();
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Global(fx.stack_top),
            value: Operand::Null,
        },
    );
    fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert_eq!(msg.count(Kind::DirectStackTopWrite), 1);
}

#[test]
fn two_counter_variables_are_flagged() {
    let mut fx = Fixture::new();
    let f = fx.mb.declare("two_counters", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let n = fb.slot("n", Type::Int { bits: 32 });
    let m = fb.slot("m", Type::Int { bits: 32 });
    let b0 = fb.block();
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(n),
            value: Operand::Const(1),
        },
    );
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(m),
            value: Operand::Const(1),
        },
    );
    fb.call(b0, fx.protect, &[Operand::Param(0)]);
    fb.call(b0, fx.protect, &[Operand::Param(0)]);
    let ln = fb.load_slot(b0, n);
    fb.call(b0, fx.unprotect, &[Operand::Value(ln)]);
    let lm = fb.load_slot(b0, m);
    fb.call(b0, fx.unprotect, &[Operand::Value(lm)]);
    fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert!(msg.count(Kind::MultipleCounters) >= 1);
}

#[test]
fn saturation_switches_to_differential() {
    // A counter far above the saturation bound turns differential at the
    // block boundary; a later constant assignment is then flagged.
    let mut fx = Fixture::new();
    let f = fx.mb.declare("saturating", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let n = fb.slot("n", Type::Int { bits: 32 });
    let b0 = fb.block();
    let b1 = fb.block();
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(n),
            value: Operand::Const(65),
        },
    );
    fb.terminate(b0, TermOp::Br(b1));

    fb.push(
        b1,
        Opcode::Store {
            ptr: Operand::Slot(n),
            value: Operand::Const(0),
        },
    );
    let l = fb.load_slot(b1, n);
    fb.call(b1, fx.unprotect, &[Operand::Value(l)]);
    fb.terminate(b1, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert_eq!(msg.count(Kind::CounterSetInDiff), 1);
}

#[test]
fn unbounded_protect_loop_terminates() {
    // while (...) PROTECT(x): the depth bound cuts the path and the engine
    // terminates.
    let mut fx = Fixture::new();
    let f = fx.mb.declare("deep_loop", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let b0 = fb.block();
    let b1 = fb.block();
    let b2 = fb.block();
    fb.terminate(b0, TermOp::Br(b1));
    fb.call(b1, fx.protect, &[Operand::Param(0)]);
    fb.terminate(
        b1,
        TermOp::CondBr {
            cond: Operand::Other,
            if_true: b1,
            if_false: b2,
        },
    );
    fb.terminate(b2, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert!(msg.count(Kind::TooDeep) >= 1);
}

#[test]
fn zero_guard_prunes_unbalanced_arm() {
    // int flag = 0; if (flag) PROTECT(a); return a;
    let mut fx = Fixture::new();
    let f = fx.mb.declare("guarded", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let flag = fb.slot("flag", Type::Int { bits: 32 });
    let b0 = fb.block();
    let b1 = fb.block();
    let b2 = fb.block();
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(flag),
            value: Operand::Const(0),
        },
    );
    let l = fb.load_slot(b0, flag);
    let cmp = fb.push(
        b0,
        Opcode::Icmp {
            pred: Pred::Ne,
            lhs: Operand::Value(l),
            rhs: Operand::Const(0),
        },
    );
    fb.terminate(
        b0,
        TermOp::CondBr {
            cond: Operand::Value(cmp),
            if_true: b1,
            if_false: b2,
        },
    );
    fb.call(b1, fx.protect, &[Operand::Param(0)]);
    fb.terminate(b1, TermOp::Br(b2));
    fb.terminate(b2, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert!(msg.infos().is_empty(), "unexpected: {:?}", msg.infos());
}

#[test]
fn nil_guard_prunes_unbalanced_arm() {
    // SEXP x = R_NilValue; if (x == R_NilValue) return a; PROTECT(a); ...
    let mut fx = Fixture::new();
    let f = fx.mb.declare("nil_guarded", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let x = fb.slot("x", Type::Sexp);
    let b0 = fb.block();
    let b1 = fb.block();
    let b2 = fb.block();
    let nil0 = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
    fb.push(
        b0,
        Opcode::Store {
            ptr: Operand::Slot(x),
            value: Operand::Value(nil0),
        },
    );
    let lx = fb.load_slot(b0, x);
    let nil1 = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
    let cmp = fb.push(
        b0,
        Opcode::Icmp {
            pred: Pred::Eq,
            lhs: Operand::Value(lx),
            rhs: Operand::Value(nil1),
        },
    );
    fb.terminate(
        b0,
        TermOp::CondBr {
            cond: Operand::Value(cmp),
            if_true: b1,
            if_false: b2,
        },
    );
    fb.terminate(b1, TermOp::Ret(Some(Operand::Param(0))));
    fb.call(b2, fx.protect, &[Operand::Param(0)]);
    fb.terminate(b2, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut msg);
    assert!(msg.infos().is_empty(), "unexpected: {:?}", msg.infos());
}

#[test]
fn state_cap_reports_overflow() {
    // Enough depth-diverse diamonds to blow a tiny state cap.
    let mut fx = Fixture::new();
    let f = fx.mb.declare("state_happy", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let mut prev = fb.block();
    for _ in 0..4 {
        let t = fb.block();
        let e = fb.block();
        let join = fb.block();
        fb.terminate(
            prev,
            TermOp::CondBr {
                cond: Operand::Other,
                if_true: t,
                if_false: e,
            },
        );
        fb.call(t, fx.protect, &[Operand::Param(0)]);
        fb.terminate(t, TermOp::Br(join));
        fb.terminate(e, TermOp::Br(join));
        prev = join;
    }
    fb.terminate(prev, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    let opts = BalanceOptions { max_states: 5 };
    check_function(&module, f, &rt, &symbols, &opts, &mut msg);
    assert_eq!(msg.count(Kind::TooManyStates), 1);
}

#[test]
fn repeated_runs_are_deterministic() {
    let mut fx = Fixture::new();
    let f = fx.mb.declare("deterministic", vec![Type::Sexp], Type::Sexp);
    let mut fb = FunctionBuilder::new();
    let b0 = fb.block();
    fb.call(b0, fx.protect, &[Operand::Param(0)]);
    fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(f, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut first = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut first);
    let mut second = quiet();
    check_function(&module, f, &rt, &symbols, &BalanceOptions::default(), &mut second);
    assert_eq!(first.infos().len(), second.infos().len());
    assert_eq!(first.count(Kind::Imbalance), 1);
    assert_eq!(second.count(Kind::Imbalance), 1);
}

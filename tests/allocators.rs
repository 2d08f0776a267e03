// SPDX-License-Identifier: BSD-3-Clause
//! Allocator-inference scenarios: wrapping, context sensitivity, and the
//! flow-insensitive fallback.

use protcheck::allocators::{AllocModule, AllocOptions};
use protcheck::diag::{Kind, Messenger};
use protcheck::ir::{FunctionBuilder, Module, Opcode, Operand, TermOp, Type};
use protcheck::sigs::{ArgInfo, CalledFun, SigTable};

mod common;
use common::Fixture;

fn quiet() -> Messenger {
    Messenger::new(true).quiet()
}

fn names(am: &AllocModule, module: &Module, sigs: &[protcheck::sigs::SigId]) -> Vec<String> {
    sigs.iter().map(|s| am.sigs.name(module, *s)).collect()
}

#[test]
fn wrapping_and_discarding_allocations() {
    // g calls the collector and returns an SEXP: allocating and a possible
    // allocator. f returns g's result: both, transitively. h calls g but
    // returns its argument untouched: allocating only.
    let mut fx = Fixture::new();
    let g = fx.mb.declare("g", vec![], Type::Sexp);
    let f = fx.mb.declare("f", vec![], Type::Sexp);
    let h = fx.mb.declare("h", vec![Type::Sexp], Type::Sexp);

    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        fb.call(b0, fx.gc, &[]);
        let nil = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(nil))));
        fx.mb.define(g, fb.finish());
    }
    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        let call = fb.call(b0, g, &[]);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(call))));
        fx.mb.define(f, fb.finish());
    }
    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        fb.call(b0, g, &[]);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Param(0))));
        fx.mb.define(h, fb.finish());
    }

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    let mut am = AllocModule::new(&module, &rt, &symbols, AllocOptions::default());
    let outs = am.compute(&mut msg);

    let allocating = names(&am, &module, &outs.allocating);
    let possible = names(&am, &module, &outs.possible_allocators);

    assert!(allocating.iter().any(|n| n == "f"));
    assert!(allocating.iter().any(|n| n == "g"));
    assert!(allocating.iter().any(|n| n == "h"));
    assert!(allocating.iter().any(|n| n == "R_gc_internal"));

    assert!(possible.iter().any(|n| n == "f"));
    assert!(possible.iter().any(|n| n == "g"));
    assert!(possible.iter().any(|n| n == "R_gc_internal"));
    assert!(!possible.iter().any(|n| n == "h"));
}

#[test]
fn variable_origins_flow_to_return() {
    // SEXP x = g(); SEXP y = x; return y;
    let mut fx = Fixture::new();
    let g = fx.mb.declare("g", vec![], Type::Sexp);
    let wrapper = fx.mb.declare("wrapper", vec![], Type::Sexp);

    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        fb.call(b0, fx.gc, &[]);
        let nil = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(nil))));
        fx.mb.define(g, fb.finish());
    }
    {
        let mut fb = FunctionBuilder::new();
        let x = fb.slot("x", Type::Sexp);
        let y = fb.slot("y", Type::Sexp);
        let b0 = fb.block();
        let call = fb.call(b0, g, &[]);
        fb.push(
            b0,
            Opcode::Store {
                ptr: Operand::Slot(x),
                value: Operand::Value(call),
            },
        );
        let lx = fb.load_slot(b0, x);
        fb.push(
            b0,
            Opcode::Store {
                ptr: Operand::Slot(y),
                value: Operand::Value(lx),
            },
        );
        let ly = fb.load_slot(b0, y);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(ly))));
        fx.mb.define(wrapper, fb.finish());
    }

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    let mut am = AllocModule::new(&module, &rt, &symbols, AllocOptions::default());
    let outs = am.compute(&mut msg);
    let possible = names(&am, &module, &outs.possible_allocators);
    assert!(possible.iter().any(|n| n == "wrapper"));
}

#[test]
fn overwriting_a_variable_drops_its_origin() {
    // SEXP x = g(); x = R_NilValue; return x;  -- not a wrapper.
    let mut fx = Fixture::new();
    let g = fx.mb.declare("g", vec![], Type::Sexp);
    let cleared = fx.mb.declare("cleared", vec![], Type::Sexp);

    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        fb.call(b0, fx.gc, &[]);
        let nil = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(nil))));
        fx.mb.define(g, fb.finish());
    }
    {
        let mut fb = FunctionBuilder::new();
        let x = fb.slot("x", Type::Sexp);
        let b0 = fb.block();
        let call = fb.call(b0, g, &[]);
        fb.push(
            b0,
            Opcode::Store {
                ptr: Operand::Slot(x),
                value: Operand::Value(call),
            },
        );
        let nil = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
        fb.push(
            b0,
            Opcode::Store {
                ptr: Operand::Slot(x),
                value: Operand::Value(nil),
            },
        );
        let lx = fb.load_slot(b0, x);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(lx))));
        fx.mb.define(cleared, fb.finish());
    }

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    let mut am = AllocModule::new(&module, &rt, &symbols, AllocOptions::default());
    let outs = am.compute(&mut msg);
    let possible = names(&am, &module, &outs.possible_allocators);
    // `cleared` still calls g, so it allocates, but its return value is the
    // nil global.
    let allocating = names(&am, &module, &outs.allocating);
    assert!(allocating.iter().any(|n| n == "cleared"));
    assert!(!possible.iter().any(|n| n == "cleared"));
}

#[test]
fn symbol_arguments_split_contexts() {
    // mk(install("x")) is recorded as mk(S:x), distinct from mk(?).
    let mut fx = Fixture::new();
    let mk = fx.mb.declare("mk", vec![Type::Sexp], Type::Sexp);
    let direct = fx.mb.declare("direct", vec![], Type::Sexp);
    let unknown = fx.mb.declare("unknown", vec![Type::Sexp], Type::Sexp);
    let via_local = fx.mb.declare("via_local", vec![], Type::Sexp);
    let x_str = fx.mb.intern_str("x");
    let y_str = fx.mb.intern_str("y");

    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        fb.call(b0, fx.gc, &[]);
        let nil = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(nil))));
        fx.mb.define(mk, fb.finish());
    }
    {
        // return mk(install("x"));
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        let sym = fb.call(b0, fx.install, &[Operand::Str(x_str)]);
        let call = fb.call(b0, mk, &[Operand::Value(sym)]);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(call))));
        fx.mb.define(direct, fb.finish());
    }
    {
        // return mk(arg);  -- nothing known about the argument
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        let call = fb.call(b0, mk, &[Operand::Param(0)]);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(call))));
        fx.mb.define(unknown, fb.finish());
    }
    {
        // SEXP s = install("y"); return mk(s);  -- via an SEXP guard
        let mut fb = FunctionBuilder::new();
        let s = fb.slot("s", Type::Sexp);
        let b0 = fb.block();
        let sym = fb.call(b0, fx.install, &[Operand::Str(y_str)]);
        fb.push(
            b0,
            Opcode::Store {
                ptr: Operand::Slot(s),
                value: Operand::Value(sym),
            },
        );
        let ls = fb.load_slot(b0, s);
        let call = fb.call(b0, mk, &[Operand::Value(ls)]);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(call))));
        fx.mb.define(via_local, fb.finish());
    }

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    let mut am = AllocModule::new(&module, &rt, &symbols, AllocOptions::default());
    let outs = am.compute(&mut msg);
    let allocating = names(&am, &module, &outs.allocating);

    assert!(allocating.iter().any(|n| n == "mk(S:x)"));
    assert!(allocating.iter().any(|n| n == "mk(S:y)"));
    assert!(allocating.iter().any(|n| n == "mk"));
}

#[test]
fn symbol_globals_are_recognized() {
    // setup: sym_g = install("z"); user: return mk(sym_g);
    let mut fx = Fixture::new();
    let mk = fx.mb.declare("mk", vec![Type::Sexp], Type::Sexp);
    let setup = fx.mb.declare("setup", vec![], Type::Void);
    let user = fx.mb.declare("user", vec![], Type::Sexp);
    let sym_g = fx.mb.global("sym_g", Type::Sexp);
    let z_str = fx.mb.intern_str("z");

    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        fb.call(b0, fx.gc, &[]);
        let nil = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(nil))));
        fx.mb.define(mk, fb.finish());
    }
    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        let sym = fb.call(b0, fx.install, &[Operand::Str(z_str)]);
        fb.push(
            b0,
            Opcode::Store {
                ptr: Operand::Global(sym_g),
                value: Operand::Value(sym),
            },
        );
        fb.terminate(b0, TermOp::Ret(None));
        fx.mb.define(setup, fb.finish());
    }
    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        let l = fb.push(b0, Opcode::Load(Operand::Global(sym_g)));
        let call = fb.call(b0, mk, &[Operand::Value(l)]);
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(call))));
        fx.mb.define(user, fb.finish());
    }

    let (module, rt, symbols) = fx.finish();
    assert_eq!(symbols.len(), 1);

    let mut msg = quiet();
    let mut am = AllocModule::new(&module, &rt, &symbols, AllocOptions::default());
    let outs = am.compute(&mut msg);
    let allocating = names(&am, &module, &outs.allocating);
    assert!(allocating.iter().any(|n| n == "mk(S:z)"));
}

#[test]
fn state_cap_falls_back_to_sweep() {
    // Guard forks multiply states past a tiny cap; the sweep still finds
    // the collector call.
    let mut fx = Fixture::new();
    let w = fx.mb.declare("w", vec![Type::Sexp], Type::Sexp);

    let mut fb = FunctionBuilder::new();
    let flags: Vec<_> = (0..4)
        .map(|i| fb.slot(&format!("flag{}", i), Type::Int { bits: 32 }))
        .collect();
    let b0 = fb.block();
    fb.call(b0, fx.gc, &[]);
    let mut prev = b0;
    for &flag in &flags {
        let t = fb.block();
        let e = fb.block();
        let join = fb.block();
        let l = fb.load_slot(prev, flag);
        let cmp = fb.push(
            prev,
            Opcode::Icmp {
                pred: protcheck::ir::Pred::Ne,
                lhs: Operand::Value(l),
                rhs: Operand::Const(0),
            },
        );
        fb.terminate(
            prev,
            TermOp::CondBr {
                cond: Operand::Value(cmp),
                if_true: t,
                if_false: e,
            },
        );
        fb.terminate(t, TermOp::Br(join));
        fb.terminate(e, TermOp::Br(join));
        prev = join;
    }
    fb.terminate(prev, TermOp::Ret(Some(Operand::Param(0))));
    fx.mb.define(w, fb.finish());

    let (module, rt, symbols) = fx.finish();
    let mut msg = quiet();
    let mut am = AllocModule::new(&module, &rt, &symbols, AllocOptions { max_states: 3 });
    let outs = am.compute(&mut msg);

    assert_eq!(msg.count(Kind::TooManyStates), 1);
    let allocating = names(&am, &module, &outs.allocating);
    assert!(allocating.iter().any(|n| n == "w"));
}

#[test]
fn signature_interning_is_canonical() {
    let mut fx = Fixture::new();
    let mk = fx.mb.declare("mk", vec![Type::Sexp], Type::Sexp);
    let x_str = fx.mb.intern_str("x");
    let (module, _rt, _symbols) = fx.finish();

    let mut sigs = SigTable::new();
    let args_a = sigs.intern_args([ArgInfo::Symbol(x_str)].into_iter().collect());
    let args_b = sigs.intern_args([ArgInfo::Symbol(x_str)].into_iter().collect());
    assert_eq!(args_a, args_b);

    let sig_a = sigs.intern(CalledFun { fun: mk, args: args_a });
    let sig_b = sigs.intern(CalledFun { fun: mk, args: args_b });
    assert_eq!(sig_a, sig_b);

    let plain_a = sigs.plain(&module, mk);
    let plain_b = sigs.plain(&module, mk);
    assert_eq!(plain_a, plain_b);
    assert_ne!(plain_a, sig_a);

    assert_eq!(sigs.name(&module, sig_a), "mk(S:x)");
    assert_eq!(sigs.name(&module, plain_a), "mk");
}

#[test]
fn recomputing_results_is_stable() {
    let mut fx = Fixture::new();
    let g = fx.mb.declare("g", vec![], Type::Sexp);
    {
        let mut fb = FunctionBuilder::new();
        let b0 = fb.block();
        fb.call(b0, fx.gc, &[]);
        let nil = fb.push(b0, Opcode::Load(Operand::Global(fx.nil)));
        fb.terminate(b0, TermOp::Ret(Some(Operand::Value(nil))));
        fx.mb.define(g, fb.finish());
    }
    let (module, rt, symbols) = fx.finish();

    let mut msg_a = quiet();
    let mut am_a = AllocModule::new(&module, &rt, &symbols, AllocOptions::default());
    let outs_a = am_a.compute(&mut msg_a);

    let mut msg_b = quiet();
    let mut am_b = AllocModule::new(&module, &rt, &symbols, AllocOptions::default());
    let outs_b = am_b.compute(&mut msg_b);

    assert_eq!(outs_a.allocating, outs_b.allocating);
    assert_eq!(outs_a.possible_allocators, outs_b.possible_allocators);
}

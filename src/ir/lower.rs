// SPDX-License-Identifier: BSD-3-Clause
//! Lowering from `llvm_ir` modules to the analysis representation.
//!
//! Lowering is deliberately lossy: instructions the checkers never match
//! become [`Opcode::Other`], and unmodeled operands become
//! [`Operand::Other`]. The engines treat both conservatively.

use either::Either;
use llvm_ir::HasDebugLoc;
use rustc_hash::FxHashMap;

use super::{
    BlockId, Call, Callee, Const, Error, FunctionBuilder, InstrId, Module, ModuleBuilder, Opcode,
    Operand, Pred, SrcLoc, TermOp, Type,
};

/// Lowers a loaded module. `sexp_struct` names the runtime's value struct
/// (pointers to it classify as [`Type::Sexp`]).
pub fn lower_module(m: &llvm_ir::Module, sexp_struct: &str) -> Result<Module, Error> {
    let mut mb = ModuleBuilder::new();

    // Declare every function and global first so constants can refer to
    // them regardless of module order.
    for f in &m.functions {
        let params = f.parameters.iter().map(|p| ty(&p.ty, sexp_struct)).collect();
        mb.declare(&f.name, params, ty(&f.return_type, sexp_struct));
    }
    for d in &m.func_declarations {
        let params = d.parameters.iter().map(|p| ty(&p.ty, sexp_struct)).collect();
        mb.declare(&d.name, params, ty(&d.return_type, sexp_struct));
    }
    for g in &m.global_vars {
        mb.global(&g.name, ty(&g.ty, sexp_struct));
    }

    // Global initializers next; string data must be resolved before any
    // function body references it through a constant expression.
    for g in &m.global_vars {
        if let Some(init) = &g.initializer {
            let name = g.name.clone();
            let id = mb
                .global_by_name(&name)
                .ok_or_else(|| Error(format!("lost global {}", name)))?;
            let c = lower_const(&mut mb, init)?;
            mb.set_global_init(id, c, g.is_constant);
        }
    }

    for f in &m.functions {
        let id = mb
            .fun_by_name(&f.name)
            .ok_or_else(|| Error(format!("lost function {}", f.name)))?;
        let body = lower_function(&mut mb, f, sexp_struct)?;
        mb.define(id, body);
    }

    Ok(mb.finish())
}

fn name_string(n: &llvm_ir::Name) -> String {
    match n {
        llvm_ir::Name::Name(s) => (**s).clone(),
        llvm_ir::Name::Number(i) => i.to_string(),
    }
}

fn ty(t: &llvm_ir::TypeRef, sexp_struct: &str) -> Type {
    match &**t {
        llvm_ir::Type::VoidType => Type::Void,
        llvm_ir::Type::IntegerType { bits } => Type::Int { bits: *bits },
        llvm_ir::Type::PointerType { pointee_type, .. } => match &**pointee_type {
            llvm_ir::Type::NamedStructType { name } if name == sexp_struct => Type::Sexp,
            _ => Type::Ptr,
        },
        _ => Type::Other,
    }
}

fn sext(value: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

fn pred(p: llvm_ir::IntPredicate) -> Pred {
    match p {
        llvm_ir::IntPredicate::EQ => Pred::Eq,
        llvm_ir::IntPredicate::NE => Pred::Ne,
        llvm_ir::IntPredicate::UGT => Pred::Ugt,
        llvm_ir::IntPredicate::UGE => Pred::Uge,
        llvm_ir::IntPredicate::ULT => Pred::Ult,
        llvm_ir::IntPredicate::ULE => Pred::Ule,
        llvm_ir::IntPredicate::SGT => Pred::Sgt,
        llvm_ir::IntPredicate::SGE => Pred::Sge,
        llvm_ir::IntPredicate::SLT => Pred::Slt,
        llvm_ir::IntPredicate::SLE => Pred::Sle,
    }
}

/// Decodes an `[N x i8]` initializer as a C string.
fn c_string(elements: &[llvm_ir::ConstantRef]) -> Option<String> {
    let mut bytes = Vec::with_capacity(elements.len());
    for e in elements {
        match &**e {
            llvm_ir::Constant::Int { bits: 8, value } => bytes.push(*value as u8),
            _ => return None,
        }
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

fn lower_const(mb: &mut ModuleBuilder, c: &llvm_ir::ConstantRef) -> Result<Const, Error> {
    Ok(match &**c {
        llvm_ir::Constant::Int { bits, value } => Const::Int(sext(*value, *bits)),
        llvm_ir::Constant::Null(_) => Const::Null,
        llvm_ir::Constant::AggregateZero(_) => Const::Zero,
        llvm_ir::Constant::GlobalReference { name, .. } => {
            let name = name.clone();
            if let Some(f) = mb.fun_by_name(&name) {
                Const::Fun(f)
            } else if let Some(g) = mb.global_by_name(&name) {
                Const::Global(g)
            } else {
                Const::Other
            }
        }
        llvm_ir::Constant::Array { elements, .. } => {
            if let Some(s) = c_string(elements) {
                Const::Str(mb.intern_str(&s))
            } else {
                let mut es = Vec::with_capacity(elements.len());
                for e in elements {
                    es.push(lower_const(mb, e)?);
                }
                Const::Array(es)
            }
        }
        llvm_ir::Constant::Struct { values, .. } => {
            let mut fields = Vec::with_capacity(values.len());
            for v in values {
                fields.push(lower_const(mb, v)?);
            }
            Const::Struct(fields)
        }
        llvm_ir::Constant::GetElementPtr(gep) => lower_const(mb, &gep.address)?,
        llvm_ir::Constant::BitCast(bc) => lower_const(mb, &bc.operand)?,
        _ => Const::Other,
    })
}

/// Lowers a constant in operand position. Pointers into string data resolve
/// to [`Operand::Str`] so that interned-symbol call sites can be matched.
fn const_operand(mb: &ModuleBuilder, c: &llvm_ir::ConstantRef) -> Operand {
    match &**c {
        llvm_ir::Constant::Int { bits, value } => Operand::Const(sext(*value, *bits)),
        llvm_ir::Constant::Null(_) => Operand::Null,
        llvm_ir::Constant::GlobalReference { name, .. } => {
            let name = name.clone();
            if let Some(f) = mb.fun_by_name(&name) {
                Operand::Fun(f)
            } else if let Some(g) = mb.global_by_name(&name) {
                Operand::Global(g)
            } else {
                Operand::Other
            }
        }
        llvm_ir::Constant::GetElementPtr(gep) => match const_operand(mb, &gep.address) {
            Operand::Global(g) => match mb.global_init(g) {
                Some(Const::Str(s)) => Operand::Str(*s),
                _ => Operand::Global(g),
            },
            other => other,
        },
        llvm_ir::Constant::BitCast(bc) => const_operand(mb, &bc.operand),
        _ => Operand::Other,
    }
}

fn lower_function(
    mb: &mut ModuleBuilder,
    f: &llvm_ir::Function,
    sexp_struct: &str,
) -> Result<super::Function, Error> {
    let mut fb = FunctionBuilder::new();
    let mut locals: FxHashMap<&llvm_ir::Name, Operand> = FxHashMap::default();

    for (i, p) in f.parameters.iter().enumerate() {
        locals.insert(&p.name, Operand::Param(i as u32));
    }

    // Stack slots first: allocas may be referenced from any block.
    for b in &f.basic_blocks {
        for instr in &b.instrs {
            if let llvm_ir::Instruction::Alloca(a) = instr {
                let array = match &a.num_elements {
                    llvm_ir::Operand::ConstantOperand(c) => {
                        !matches!(&**c, llvm_ir::Constant::Int { value: 1, .. })
                    }
                    _ => true,
                };
                let slot = fb.array_slot(
                    &name_string(&a.dest),
                    ty(&a.allocated_type, sexp_struct),
                    array,
                );
                locals.insert(&a.dest, Operand::Slot(slot));
            }
        }
    }

    // Pre-assign result ids so uses can precede definitions.
    let mut blocks: FxHashMap<&llvm_ir::Name, BlockId> = FxHashMap::default();
    {
        let mut next = 0u32;
        for b in &f.basic_blocks {
            blocks.insert(&b.name, fb.block());
            for instr in &b.instrs {
                if matches!(instr, llvm_ir::Instruction::Alloca(_)) {
                    continue;
                }
                if let Some(n) = instr.try_get_result() {
                    locals.insert(n, Operand::Value(InstrId(next)));
                }
                next += 1;
            }
        }
    }

    let block_of = |blocks: &FxHashMap<&llvm_ir::Name, BlockId>,
                    n: &llvm_ir::Name|
     -> Result<BlockId, Error> {
        blocks
            .get(n)
            .copied()
            .ok_or_else(|| Error(format!("unknown block {} in {}", name_string(n), f.name)))
    };

    for (bi, b) in f.basic_blocks.iter().enumerate() {
        let bid = BlockId(bi as u32);
        for instr in &b.instrs {
            let loc = src_loc(mb, instr.get_debug_loc());
            let op = match instr {
                llvm_ir::Instruction::Alloca(_) => continue,
                llvm_ir::Instruction::Load(l) => Opcode::Load(operand(mb, &locals, &l.address)),
                llvm_ir::Instruction::Store(s) => Opcode::Store {
                    ptr: operand(mb, &locals, &s.address),
                    value: operand(mb, &locals, &s.value),
                },
                llvm_ir::Instruction::Call(call) => {
                    let callee = match &call.function {
                        Either::Left(_asm) => Callee::Indirect,
                        Either::Right(op) => match operand(mb, &locals, op) {
                            Operand::Fun(f) => Callee::Fun(f),
                            _ => Callee::Indirect,
                        },
                    };
                    Opcode::Call(Call {
                        callee,
                        args: call
                            .arguments
                            .iter()
                            .map(|(a, _)| operand(mb, &locals, a))
                            .collect(),
                    })
                }
                llvm_ir::Instruction::Add(a) => Opcode::Add {
                    lhs: operand(mb, &locals, &a.operand0),
                    rhs: operand(mb, &locals, &a.operand1),
                },
                llvm_ir::Instruction::ICmp(i) => Opcode::Icmp {
                    pred: pred(i.predicate),
                    lhs: operand(mb, &locals, &i.operand0),
                    rhs: operand(mb, &locals, &i.operand1),
                },
                _ => Opcode::Other,
            };
            fb.push_at(bid, op, loc);
        }

        let loc = src_loc(mb, b.term.get_debug_loc());
        let term = match &b.term {
            llvm_ir::Terminator::Ret(r) => TermOp::Ret(
                r.return_operand
                    .as_ref()
                    .map(|op| operand(mb, &locals, op)),
            ),
            llvm_ir::Terminator::Br(br) => TermOp::Br(block_of(&blocks, &br.dest)?),
            llvm_ir::Terminator::CondBr(br) => TermOp::CondBr {
                cond: operand(mb, &locals, &br.condition),
                if_true: block_of(&blocks, &br.true_dest)?,
                if_false: block_of(&blocks, &br.false_dest)?,
            },
            llvm_ir::Terminator::Switch(sw) => {
                let mut targets = smallvec::SmallVec::new();
                targets.push(block_of(&blocks, &sw.default_dest)?);
                for (_, dest) in &sw.dests {
                    targets.push(block_of(&blocks, dest)?);
                }
                TermOp::Switch(targets)
            }
            llvm_ir::Terminator::Unreachable(_) => TermOp::Unreachable,
            llvm_ir::Terminator::Invoke(inv) => TermOp::Other(smallvec::SmallVec::from_slice(&[
                block_of(&blocks, &inv.return_label)?,
                block_of(&blocks, &inv.exception_label)?,
            ])),
            _ => TermOp::Other(smallvec::SmallVec::new()),
        };
        fb.terminate_at(bid, term, loc);
    }

    Ok(fb.finish())
}

fn src_loc(mb: &mut ModuleBuilder, dl: &Option<llvm_ir::DebugLoc>) -> Option<SrcLoc> {
    dl.as_ref().map(|dl| SrcLoc {
        file: mb.intern_str(&dl.filename),
        line: dl.line,
    })
}

fn operand(
    mb: &ModuleBuilder,
    locals: &FxHashMap<&llvm_ir::Name, Operand>,
    op: &llvm_ir::Operand,
) -> Operand {
    match op {
        llvm_ir::Operand::LocalOperand { name, .. } => {
            locals.get(name).copied().unwrap_or(Operand::Other)
        }
        llvm_ir::Operand::ConstantOperand(c) => const_operand(mb, c),
        llvm_ir::Operand::MetadataOperand => Operand::Other,
    }
}

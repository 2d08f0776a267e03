// SPDX-License-Identifier: BSD-3-Clause
//! Representation of a bitcode module that is amenable to analysis. The
//! loaded `llvm_ir` structures carry floats, metadata, and a great deal of
//! instruction variety that the checkers never look at; lowering
//! re-expresses a module with just the shapes the engines match on (stack
//! slots, loads, stores, direct calls, integer adds and comparisons,
//! branches, returns) and precomputes the use information the pattern
//! recognizers need.
//!
//! Everything here is a read-only view once built: the engines never modify
//! the IR.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::intern::Interner;

pub mod build;
pub mod lower;

pub use build::{FunctionBuilder, ModuleBuilder};
pub use lower::lower_module;

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, thiserror::Error)]
pub struct Error(pub String);

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed IR module: {}", self.0)
    }
}

// ------------------------------------------------------------------
// Identifiers

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_type!(
    /// A function (defined or only declared), module-wide.
    FunId
);
id_type!(
    /// A global variable, module-wide.
    GlobalId
);
id_type!(
    /// A basic block, within one function.
    BlockId
);
id_type!(
    /// A non-terminator instruction, within one function.
    InstrId
);
id_type!(
    /// A stack slot (alloca), within one function.
    SlotId
);
id_type!(
    /// An interned constant string, module-wide.
    StrId
);

// ------------------------------------------------------------------
// Types

/// The type distinctions the analysis cares about. An SEXP is a pointer to
/// the runtime's value struct; every other pointer is just `Ptr`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Type {
    Void,
    Int { bits: u32 },
    Sexp,
    Ptr,
    Other,
}

impl Type {
    #[inline]
    pub fn is_sexp(self) -> bool {
        matches!(self, Type::Sexp)
    }

    #[inline]
    pub fn is_int(self) -> bool {
        matches!(self, Type::Int { .. })
    }
}

// ------------------------------------------------------------------
// Operands and opcodes

/// An SSA operand. Integer constants are kept sign-extended; constant
/// pointers to string data are resolved to interned strings so that call
/// sites like `install("name")` can be matched directly.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Operand {
    /// Result of another instruction in the same function.
    Value(InstrId),
    /// A formal parameter, by position.
    Param(u32),
    /// The address of a stack slot.
    Slot(SlotId),
    /// The address of a global variable.
    Global(GlobalId),
    /// The address of a function.
    Fun(FunId),
    /// An integer constant, sign-extended.
    Const(i64),
    /// A pointer to constant string data.
    Str(StrId),
    /// A null pointer constant.
    Null,
    /// Anything the analysis does not model.
    Other,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Callee {
    Fun(FunId),
    Indirect,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Call {
    pub callee: Callee,
    pub args: SmallVec<[Operand; 4]>,
}

impl Call {
    pub fn target(&self) -> Option<FunId> {
        match self.callee {
            Callee::Fun(f) => Some(f),
            Callee::Indirect => None,
        }
    }
}

/// Integer comparison predicates.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Pred {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl Pred {
    /// Concrete evaluation on sign-extended constants.
    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Pred::Eq => lhs == rhs,
            Pred::Ne => lhs != rhs,
            Pred::Ugt => (lhs as u64) > (rhs as u64),
            Pred::Uge => (lhs as u64) >= (rhs as u64),
            Pred::Ult => (lhs as u64) < (rhs as u64),
            Pred::Ule => (lhs as u64) <= (rhs as u64),
            Pred::Sgt => lhs > rhs,
            Pred::Sge => lhs >= rhs,
            Pred::Slt => lhs < rhs,
            Pred::Sle => lhs <= rhs,
        }
    }

    #[inline]
    pub fn is_equality(self) -> bool {
        matches!(self, Pred::Eq | Pred::Ne)
    }

    /// Whether equal operands satisfy the predicate.
    #[inline]
    pub fn true_when_equal(self) -> bool {
        matches!(self, Pred::Eq | Pred::Uge | Pred::Ule | Pred::Sge | Pred::Sle)
    }

    /// Mirrors the comparison for swapped operands.
    pub fn flip(self) -> Pred {
        match self {
            Pred::Eq => Pred::Eq,
            Pred::Ne => Pred::Ne,
            Pred::Ugt => Pred::Ult,
            Pred::Uge => Pred::Ule,
            Pred::Ult => Pred::Ugt,
            Pred::Ule => Pred::Uge,
            Pred::Sgt => Pred::Slt,
            Pred::Sge => Pred::Sle,
            Pred::Slt => Pred::Sgt,
            Pred::Sle => Pred::Sge,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Opcode {
    Load(Operand),
    Store { ptr: Operand, value: Operand },
    Call(Call),
    Add { lhs: Operand, rhs: Operand },
    Icmp { pred: Pred, lhs: Operand, rhs: Operand },
    Other,
}

/// Source position from debug info, when present.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct SrcLoc {
    pub file: StrId,
    pub line: u32,
}

#[derive(Clone, Debug)]
pub struct Instr {
    pub op: Opcode,
    pub loc: Option<SrcLoc>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum TermOp {
    Ret(Option<Operand>),
    Br(BlockId),
    CondBr {
        cond: Operand,
        if_true: BlockId,
        if_false: BlockId,
    },
    /// Default target first.
    Switch(SmallVec<[BlockId; 4]>),
    Unreachable,
    Other(SmallVec<[BlockId; 2]>),
}

impl TermOp {
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            TermOp::Ret(_) | TermOp::Unreachable => SmallVec::new(),
            TermOp::Br(b) => SmallVec::from_slice(&[*b]),
            TermOp::CondBr {
                if_true, if_false, ..
            } => SmallVec::from_slice(&[*if_true, *if_false]),
            TermOp::Switch(targets) => targets.iter().copied().collect(),
            TermOp::Other(targets) => targets.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Terminator {
    pub op: TermOp,
    pub loc: Option<SrcLoc>,
}

// ------------------------------------------------------------------
// Functions

#[derive(Clone, Debug)]
pub struct Slot {
    pub name: Arc<str>,
    pub ty: Type,
    /// Array allocations never qualify as counters or guards.
    pub array: bool,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub instrs: Vec<InstrId>,
    pub term: Terminator,
}

/// A place in a function body where a value or slot is referenced: either a
/// non-terminator instruction or the terminator of a block.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum UseSite {
    Instr(InstrId),
    Term(BlockId),
}

#[derive(Clone, Debug)]
pub struct Function {
    pub slots: Vec<Slot>,
    pub blocks: Vec<Block>,
    instrs: Vec<Instr>,
    value_users: Vec<SmallVec<[UseSite; 2]>>,
    slot_users: Vec<SmallVec<[UseSite; 4]>>,
}

impl Function {
    #[inline]
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    #[inline]
    pub fn block(&self, b: BlockId) -> &Block {
        &self.blocks[b.index()]
    }

    #[inline]
    pub fn instr(&self, i: InstrId) -> &Instr {
        &self.instrs[i.index()]
    }

    #[inline]
    pub fn slot(&self, s: SlotId) -> &Slot {
        &self.slots[s.index()]
    }

    /// All instructions that reference the result of `v`.
    #[inline]
    pub fn value_users(&self, v: InstrId) -> &[UseSite] {
        &self.value_users[v.index()]
    }

    /// All instructions that reference the address of slot `s`, in any
    /// operand position.
    #[inline]
    pub fn slot_users(&self, s: SlotId) -> &[UseSite] {
        &self.slot_users[s.index()]
    }

    pub fn instr_ids(&self) -> impl Iterator<Item = InstrId> {
        (0..self.instrs.len() as u32).map(InstrId)
    }

    /// The slot loaded by `op`, when `op` is the result of a plain slot
    /// load.
    pub fn loaded_slot(&self, op: Operand) -> Option<SlotId> {
        if let Operand::Value(v) = op {
            if let Opcode::Load(Operand::Slot(s)) = self.instr(v).op {
                return Some(s);
            }
        }
        None
    }

    /// The global loaded by `op`, when `op` is the result of a plain global
    /// load.
    pub fn loaded_global(&self, op: Operand) -> Option<GlobalId> {
        if let Operand::Value(v) = op {
            if let Opcode::Load(Operand::Global(g)) = self.instr(v).op {
                return Some(g);
            }
        }
        None
    }

    pub fn loc_of(&self, site: UseSite) -> Option<SrcLoc> {
        match site {
            UseSite::Instr(i) => self.instr(i).loc,
            UseSite::Term(b) => self.block(b).term.loc,
        }
    }
}

// ------------------------------------------------------------------
// Module

#[derive(Clone, Debug)]
pub struct FunDecl {
    pub name: Arc<str>,
    pub params: Vec<Type>,
    pub ret: Type,
    pub body: Option<Function>,
}

#[derive(Clone, Debug)]
pub struct GlobalVar {
    pub name: Arc<str>,
    pub ty: Type,
    pub init: Option<Const>,
    pub is_const: bool,
}

/// Constant initializer structure, kept only as deep as the registration
/// table walker needs.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Const {
    Int(i64),
    Str(StrId),
    Global(GlobalId),
    Fun(FunId),
    Array(Vec<Const>),
    Struct(Vec<Const>),
    Null,
    Zero,
    Other,
}

#[derive(Debug, Default)]
pub struct Module {
    pub funs: Vec<FunDecl>,
    pub globals: Vec<GlobalVar>,
    strs: Interner<Arc<str>>,
    fun_index: rustc_hash::FxHashMap<Arc<str>, FunId>,
    global_index: rustc_hash::FxHashMap<Arc<str>, GlobalId>,
}

impl Module {
    #[inline]
    pub fn fun(&self, f: FunId) -> &FunDecl {
        &self.funs[f.index()]
    }

    #[inline]
    pub fn global(&self, g: GlobalId) -> &GlobalVar {
        &self.globals[g.index()]
    }

    #[inline]
    pub fn fun_name(&self, f: FunId) -> &str {
        &self.fun(f).name
    }

    #[inline]
    pub fn str_(&self, s: StrId) -> &str {
        self.strs.get(s.0)
    }

    pub fn fun_by_name(&self, name: &str) -> Option<FunId> {
        self.fun_index.get(name).copied()
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.global_index.get(name).copied()
    }

    pub fn fun_ids(&self) -> impl Iterator<Item = FunId> {
        (0..self.funs.len() as u32).map(FunId)
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId)
    }

    /// Functions that have a body, in module order.
    pub fn defined_funs(&self) -> impl Iterator<Item = FunId> + '_ {
        self.fun_ids().filter(|f| self.fun(*f).body.is_some())
    }
}

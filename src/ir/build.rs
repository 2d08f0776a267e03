// SPDX-License-Identifier: BSD-3-Clause
//! Builders for analysis modules. The lowering pass assembles every function
//! through [`FunctionBuilder`]; the integration tests use the same builders
//! to put together small modules without going through bitcode.

use std::sync::Arc;

use smallvec::SmallVec;

use super::{
    Block, BlockId, Call, Callee, Const, FunDecl, FunId, Function, GlobalId, GlobalVar, Instr,
    InstrId, Module, Opcode, Operand, Slot, SlotId, SrcLoc, StrId, TermOp, Terminator, Type,
    UseSite,
};

#[derive(Debug, Default)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            module: Module::default(),
        }
    }

    pub fn intern_str(&mut self, s: &str) -> StrId {
        StrId(self.module.strs.intern(Arc::from(s)))
    }

    /// Declares a function; a body can be attached later with [`define`].
    ///
    /// [`define`]: ModuleBuilder::define
    pub fn declare(&mut self, name: &str, params: Vec<Type>, ret: Type) -> FunId {
        if let Some(f) = self.module.fun_by_name(name) {
            return f;
        }
        let id = FunId(self.module.funs.len() as u32);
        let name: Arc<str> = Arc::from(name);
        self.module.funs.push(FunDecl {
            name: name.clone(),
            params,
            ret,
            body: None,
        });
        self.module.fun_index.insert(name, id);
        id
    }

    pub fn define(&mut self, f: FunId, body: Function) {
        self.module.funs[f.index()].body = Some(body);
    }

    pub fn global(&mut self, name: &str, ty: Type) -> GlobalId {
        if let Some(g) = self.module.global_by_name(name) {
            return g;
        }
        let id = GlobalId(self.module.globals.len() as u32);
        let name: Arc<str> = Arc::from(name);
        self.module.globals.push(GlobalVar {
            name: name.clone(),
            ty,
            init: None,
            is_const: false,
        });
        self.module.global_index.insert(name, id);
        id
    }

    pub fn set_global_init(&mut self, g: GlobalId, init: Const, is_const: bool) {
        let var = &mut self.module.globals[g.index()];
        var.init = Some(init);
        var.is_const = is_const;
    }

    pub fn fun_by_name(&self, name: &str) -> Option<FunId> {
        self.module.fun_by_name(name)
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.module.global_by_name(name)
    }

    pub fn global_init(&self, g: GlobalId) -> Option<&Const> {
        self.module.globals[g.index()].init.as_ref()
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

/// Assembles one function body. Blocks are created up front so branches can
/// reference them; `finish` computes the per-value and per-slot use lists.
#[derive(Debug)]
pub struct FunctionBuilder {
    slots: Vec<Slot>,
    blocks: Vec<BlockInProgress>,
    instrs: Vec<Instr>,
}

#[derive(Debug)]
struct BlockInProgress {
    instrs: Vec<InstrId>,
    term: Option<Terminator>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        FunctionBuilder {
            slots: Vec::new(),
            blocks: Vec::new(),
            instrs: Vec::new(),
        }
    }

    pub fn slot(&mut self, name: &str, ty: Type) -> SlotId {
        self.array_slot(name, ty, false)
    }

    pub fn array_slot(&mut self, name: &str, ty: Type, array: bool) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(Slot {
            name: Arc::from(name),
            ty,
            array,
        });
        id
    }

    pub fn block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockInProgress {
            instrs: Vec::new(),
            term: None,
        });
        id
    }

    pub fn push(&mut self, block: BlockId, op: Opcode) -> InstrId {
        self.push_at(block, op, None)
    }

    pub fn push_at(&mut self, block: BlockId, op: Opcode, loc: Option<SrcLoc>) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(Instr { op, loc });
        self.blocks[block.index()].instrs.push(id);
        id
    }

    /// Convenience for the ubiquitous `load slot` shape.
    pub fn load_slot(&mut self, block: BlockId, slot: SlotId) -> InstrId {
        self.push(block, Opcode::Load(Operand::Slot(slot)))
    }

    /// Convenience for direct calls.
    pub fn call(&mut self, block: BlockId, callee: FunId, args: &[Operand]) -> InstrId {
        self.push(
            block,
            Opcode::Call(Call {
                callee: Callee::Fun(callee),
                args: SmallVec::from_slice(args),
            }),
        )
    }

    pub fn terminate(&mut self, block: BlockId, op: TermOp) {
        self.terminate_at(block, op, None);
    }

    pub fn terminate_at(&mut self, block: BlockId, op: TermOp, loc: Option<SrcLoc>) {
        self.blocks[block.index()].term = Some(Terminator { op, loc });
    }

    pub fn finish(self) -> Function {
        let blocks: Vec<Block> = self
            .blocks
            .into_iter()
            .map(|b| Block {
                instrs: b.instrs,
                term: b.term.unwrap_or(Terminator {
                    op: TermOp::Unreachable,
                    loc: None,
                }),
            })
            .collect();

        let mut value_users: Vec<SmallVec<[UseSite; 2]>> = vec![SmallVec::new(); self.instrs.len()];
        let mut slot_users: Vec<SmallVec<[UseSite; 4]>> = vec![SmallVec::new(); self.slots.len()];
        let mut record = |op: &Operand, site: UseSite| match *op {
            Operand::Value(v) => value_users[v.index()].push(site),
            Operand::Slot(s) => slot_users[s.index()].push(site),
            _ => {}
        };
        for (idx, instr) in self.instrs.iter().enumerate() {
            let site = UseSite::Instr(InstrId(idx as u32));
            match &instr.op {
                Opcode::Load(ptr) => record(ptr, site),
                Opcode::Store { ptr, value } => {
                    record(ptr, site);
                    record(value, site);
                }
                Opcode::Call(call) => {
                    for a in &call.args {
                        record(a, site);
                    }
                }
                Opcode::Add { lhs, rhs } | Opcode::Icmp { lhs, rhs, .. } => {
                    record(lhs, site);
                    record(rhs, site);
                }
                Opcode::Other => {}
            }
        }
        for (idx, block) in blocks.iter().enumerate() {
            let site = UseSite::Term(BlockId(idx as u32));
            match &block.term.op {
                TermOp::Ret(Some(op)) => record(op, site),
                TermOp::CondBr { cond, .. } => record(cond, site),
                _ => {}
            }
        }

        Function {
            slots: self.slots,
            blocks,
            instrs: self.instrs,
            value_users,
            slot_users,
        }
    }
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

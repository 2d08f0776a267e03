// SPDX-License-Identifier: BSD-3-Clause
//! Classification of error paths. A block is on an error path when it
//! cannot avoid a no-return error function: it calls one directly, ends in
//! `unreachable`, or every successor is already on an error path. The
//! engines skip such blocks so that intentionally unbalanced error exits do
//! not drown the report.

use rustc_hash::FxHashSet;

use crate::config::Runtime;
use crate::ir::{BlockId, Function, Opcode, TermOp};

pub type ErrorBlocks = FxHashSet<BlockId>;

pub fn error_blocks(fun: &Function, rt: &Runtime) -> ErrorBlocks {
    let mut err = ErrorBlocks::default();
    for (bi, block) in fun.blocks.iter().enumerate() {
        let calls_error = block.instrs.iter().any(|&i| {
            matches!(
                &fun.instr(i).op,
                Opcode::Call(call)
                    if call.target().is_some_and(|t| rt.error_funs.contains(&t))
            )
        });
        if calls_error || matches!(block.term.op, TermOp::Unreachable) {
            err.insert(BlockId(bi as u32));
        }
    }

    // Blocks whose every successor is an error block are error blocks too.
    let mut changed = true;
    while changed {
        changed = false;
        for (bi, block) in fun.blocks.iter().enumerate() {
            let b = BlockId(bi as u32);
            if err.contains(&b) {
                continue;
            }
            let succs = block.term.op.successors();
            if !succs.is_empty() && succs.iter().all(|s| err.contains(s)) {
                err.insert(b);
                changed = true;
            }
        }
    }
    err
}

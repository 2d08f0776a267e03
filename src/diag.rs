// SPDX-License-Identifier: BSD-3-Clause
//! The diagnostics sink. Info-level findings are recorded (and printed to
//! stderr) through [`Messenger`]; debug- and trace-level narration goes to
//! `tracing` subscribers and is never collected.
//!
//! In unique-message mode, repeated findings of the same kind at the same
//! line of the same function are reported once.

use rustc_hash::FxHashSet;

use crate::ir::{BlockId, FunId, Module, SrcLoc};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Kind {
    NegativeDepth,
    Imbalance,
    TooDeep,
    UninitializedCounter,
    MultipleCounters,
    CounterSetInDiff,
    NegativeCounter,
    AddToUninitializedCounter,
    BranchOnUninitializedCounter,
    SaveInDiff,
    RestoreInDiff,
    RestoreFromUninitializedSave,
    DirectStackTopWrite,
    UnsupportedForm,
    TooManyStates,
}

impl Kind {
    pub fn message(self) -> &'static str {
        match self {
            Kind::NegativeDepth => "has negative depth",
            Kind::Imbalance => "has possible protection stack imbalance",
            Kind::TooDeep => "has too high protection stack depth",
            Kind::UninitializedCounter => {
                "passes uninitialized counter of protects in a call to unprotect"
            }
            Kind::MultipleCounters => {
                "uses multiple protection counters (results will be incorrect)"
            }
            Kind::CounterSetInDiff => {
                "setting counter value while in differential mode (forgetting protects?)"
            }
            Kind::NegativeCounter => "protection counter went negative",
            Kind::AddToUninitializedCounter => {
                "adds a constant to an uninitialized counter variable"
            }
            Kind::BranchOnUninitializedCounter => {
                "branches based on an uninitialized value of the protection counter variable"
            }
            Kind::SaveInDiff => {
                "saving value of the stack top while in differential count state \
                 (results will be incorrect)"
            }
            Kind::RestoreInDiff => {
                "restoring value of the stack top while in differential count state \
                 (results will be incorrect)"
            }
            Kind::RestoreFromUninitializedSave => {
                "restores the stack top from an uninitialized local variable"
            }
            Kind::DirectStackTopWrite => {
                "manipulates the protection stack top directly (results will be incorrect)"
            }
            Kind::UnsupportedForm => {
                "has an unsupported form of unprotect with a variable (results will be incorrect)"
            }
            Kind::TooManyStates => "has too many states (abstraction overflow)",
        }
    }
}

/// Where a finding was made: the block/position pair always, the source
/// position when debug info was present.
#[derive(Clone, Copy, Debug)]
pub struct Loc {
    pub block: BlockId,
    /// Instruction index within the block; the block's instruction count
    /// denotes the terminator.
    pub pos: u32,
    pub src: Option<SrcLoc>,
}

impl Loc {
    pub fn instr(block: BlockId, pos: usize, src: Option<SrcLoc>) -> Self {
        Loc {
            block,
            pos: pos as u32,
            src,
        }
    }

    pub fn term(block: BlockId, len: usize, src: Option<SrcLoc>) -> Self {
        Loc {
            block,
            pos: len as u32,
            src,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub kind: Kind,
    pub fun: FunId,
    pub loc: Loc,
}

pub fn render_loc(module: &Module, fun: FunId, loc: &Loc) -> String {
    match loc.src {
        Some(src) => format!("{}:{}", module.str_(src.file), src.line),
        None => format!(
            "{}:{}:{}",
            module.fun_name(fun),
            loc.block.0,
            loc.pos
        ),
    }
}

#[derive(Debug)]
pub struct Messenger {
    infos: Vec<Diagnostic>,
    seen: FxHashSet<(FunId, Kind, u64)>,
    unique: bool,
    quiet: bool,
    header: Option<String>,
}

impl Messenger {
    pub fn new(unique: bool) -> Self {
        Messenger {
            infos: Vec::new(),
            seen: FxHashSet::default(),
            unique,
            quiet: false,
            header: None,
        }
    }

    /// Suppresses stderr output; findings are still recorded.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Announces the function about to be analyzed. The header is printed
    /// lazily, before its first finding.
    pub fn start_function(&mut self, label: String) {
        self.header = Some(label);
    }

    pub fn debug(&self, module: &Module, fun: FunId, text: &str, loc: &Loc) {
        tracing::debug!("{} {}: {}", render_loc(module, fun, loc), module.fun_name(fun), text);
    }

    pub fn trace(&self, module: &Module, fun: FunId, text: &str, loc: &Loc) {
        tracing::trace!("{} {}: {}", render_loc(module, fun, loc), module.fun_name(fun), text);
    }

    pub fn info(&mut self, module: &Module, fun: FunId, kind: Kind, loc: Loc) {
        let key = match loc.src {
            Some(src) => src.line as u64,
            None => ((loc.block.0 as u64) << 32) | loc.pos as u64,
        };
        if self.unique && !self.seen.insert((fun, kind, key)) {
            return;
        }
        if !self.quiet {
            if let Some(header) = self.header.take() {
                eprintln!("Function {}", header);
            }
            eprintln!("  [INFO] {}: {}", render_loc(module, fun, &loc), kind.message());
        }
        self.infos.push(Diagnostic { kind, fun, loc });
    }

    pub fn infos(&self) -> &[Diagnostic] {
        &self.infos
    }

    pub fn count(&self, kind: Kind) -> usize {
        self.infos.iter().filter(|d| d.kind == kind).count()
    }
}

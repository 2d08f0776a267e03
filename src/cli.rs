// SPDX-License-Identifier: BSD-3-Clause
use std::path::PathBuf;

/// Protection-stack balance and allocator analysis for R extension bitcode
#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Bitcode modules; the last one also names the library
    #[arg()]
    pub modules: Vec<PathBuf>,

    /// Runtime symbol configuration (JSON)
    #[arg(long)]
    pub runtime: Option<PathBuf>,

    /// Check the FFI registration table
    #[arg(long)]
    pub ffi: bool,

    /// Skip the protection-balance check
    #[arg(long)]
    pub no_balance: bool,

    /// Report context-sensitive allocator inference
    #[arg(long)]
    pub allocators: bool,

    /// Per-function abstract state cap
    #[arg(long, default_value_t = 3000)]
    pub max_states: usize,

    /// Report every repeated finding instead of deduplicating by line
    #[arg(long)]
    pub all_messages: bool,

    /// Engine narration
    #[arg(long)]
    pub debug: bool,

    /// Even more engine narration
    #[arg(long)]
    pub trace: bool,

    /// Suppress the findings listing
    #[arg(long)]
    pub quiet: bool,
}

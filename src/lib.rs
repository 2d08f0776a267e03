// SPDX-License-Identifier: BSD-3-Clause
//! Static analysis of compiled R extensions: protection-stack balance
//! checking and context-sensitive allocator inference over bitcode
//! modules.

pub mod allocators;
pub mod balance;
pub mod closure;
pub mod config;
pub mod diag;
pub mod errors;
pub mod ffi;
pub mod guards;
pub mod intern;
pub mod ir;
pub mod patterns;
pub mod sigs;
pub mod symbols;

pub use allocators::{AllocModule, AllocOptions, AllocResults};
pub use balance::{check_function, check_module, BalanceOptions};
pub use config::{Runtime, RuntimeNames};
pub use diag::{Diagnostic, Kind, Loc, Messenger};
pub use ir::{FunctionBuilder, Module, ModuleBuilder};
pub use sigs::{ArgInfo, SigId, SigTable};
pub use symbols::find_symbols;

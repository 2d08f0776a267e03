// SPDX-License-Identifier: BSD-3-Clause
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Error, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*};

use protcheck::allocators::{AllocModule, AllocOptions};
use protcheck::balance::{self, BalanceOptions};
use protcheck::config::{Runtime, RuntimeNames};
use protcheck::diag::Messenger;
use protcheck::ffi;
use protcheck::ir;
use protcheck::symbols::find_symbols;

mod cli;

fn setup_subscriber(trace: bool) {
    let level = if trace {
        tracing::level_filters::LevelFilter::TRACE
    } else {
        tracing::level_filters::LevelFilter::DEBUG
    };
    tracing_subscriber::registry()
        .with(level)
        .with(fmt::Layer::default().with_writer(io::stderr))
        .init();
}

fn load_module(path: &Path, names: &RuntimeNames) -> Result<ir::Module> {
    let llvm_module = if path.extension().is_some_and(|e| e == "ll") {
        llvm_ir::Module::from_ir_path(path)
    } else {
        llvm_ir::Module::from_bc_path(path)
    }
    .map_err(Error::msg)
    .with_context(|| format!("couldn't parse bitcode module at {}", path.display()))?;
    ir::lower_module(&llvm_module, &names.sexp_struct)
        .with_context(|| format!("couldn't lower module at {}", path.display()))
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = cli::Args::parse();

    if args.modules.is_empty() {
        eprintln!("Need R and package bitcode files.");
        return Ok(ExitCode::from(2));
    }

    if args.debug || args.trace {
        setup_subscriber(args.trace);
    }

    let names = match &args.runtime {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .context("couldn't read the runtime symbol configuration")?;
            serde_json::from_str(&text)
                .context("couldn't deserialize the runtime symbol configuration")?
        }
        None => RuntimeNames::default(),
    };

    let last = args.modules.last().expect("checked above");
    let libname = ffi::library_name(&last.to_string_lossy());
    eprintln!("Library name (usually package name): {}", libname);

    let mut modules = Vec::with_capacity(args.modules.len());
    for path in &args.modules {
        modules.push(load_module(path, &names)?);
    }

    for module in &modules {
        let rt = Runtime::resolve(module, &names);
        let symbols = find_symbols(module, &rt);
        let mut msg = Messenger::new(!args.all_messages);

        if !args.no_balance {
            let opts = BalanceOptions {
                max_states: args.max_states,
            };
            balance::check_module(module, &rt, &symbols, &opts, &mut msg);
        }

        if args.allocators {
            let opts = AllocOptions {
                max_states: args.max_states,
            };
            let mut am = AllocModule::new(module, &rt, &symbols, opts);
            let outs = am.compute(&mut msg);
            if !args.quiet {
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "allocating functions")?;
                writeln!(stdout, "--------------------")?;
                for sig in &outs.allocating {
                    writeln!(stdout, "{}", am.sigs.name(module, *sig))?;
                }
                writeln!(stdout)?;
                writeln!(stdout, "possible allocators")?;
                writeln!(stdout, "-------------------")?;
                for sig in &outs.possible_allocators {
                    writeln!(stdout, "{}", am.sigs.name(module, *sig))?;
                }
            }
        }
    }

    if args.ffi {
        let with_init = modules.iter().find(|m| {
            m.fun_by_name(&format!("R_init_{}", libname))
                .is_some_and(|f| m.fun(f).body.is_some())
        });
        let Some(module) = with_init else {
            eprintln!("ERROR: did not find initialization function R_init_{}", libname);
            return Ok(ExitCode::from(1));
        };
        let rt = Runtime::resolve(module, &names);
        if let Err(e) = ffi::check_registration(module, &libname, &rt) {
            eprintln!("ERROR: {}", e);
            return Ok(ExitCode::from(1));
        }
    }

    Ok(ExitCode::SUCCESS)
}

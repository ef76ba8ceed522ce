// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use rv_lisp::bytecode;
use rv_lisp::compiler;
use rv_lisp::compiler::context::CompileStats;
use rv_lisp::logging;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rv-lisp",
    about = "Compiler for the rv-lisp language, targeting a register-based bytecode VM.",
    version
)]
struct Cli {
    /// Global JSON output
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    /// Global log level (trace|debug|info|warn|error)
    #[arg(
        long,
        global = true,
        default_value = "info",
        value_parser = ["trace","debug","info","warn","error"],
    )]
    log_level: String,
    /// Max input file size in bytes
    #[arg(long, global = true, default_value_t = 1_048_576)]
    max_bytes: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Compile a source file into a bytecode image
    Compile(CompileArgs),
    /// Run the frontend and the attribution pass only
    Check(CheckArgs),
    /// Compile and print a disassembly listing
    Dump(DumpArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct CompileArgs {
    /// Path to .rvl file
    path: PathBuf,
    /// Output path for the bytecode image
    #[arg(short, long)]
    out: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
struct CheckArgs {
    /// Path to .rvl file
    path: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
struct DumpArgs {
    /// Path to .rvl file
    path: PathBuf,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("compile error")]
    Compile(#[from] compiler::Error),
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("io error: {source}: {path}")]
    IoPath {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

impl CliError {
    fn code(&self) -> i32 {
        match self {
            CliError::InvalidInput(_) => 2,
            CliError::Compile(_) => 3,
            CliError::Io(_) | CliError::IoPath { .. } => 5,
        }
    }
}

fn try_main(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Compile(args) => cmd_compile(args, cli.json, cli.max_bytes),
        Command::Check(args) => cmd_check(args, cli.json, cli.max_bytes),
        Command::Dump(args) => cmd_dump(args, cli.json, cli.max_bytes),
    }
}

fn read_program(path: impl AsRef<std::path::Path>, max_bytes: usize) -> Result<String, CliError> {
    let path_ref = path.as_ref();
    let meta = fs::metadata(path_ref).map_err(|e| CliError::IoPath {
        source: e,
        path: path_ref.to_path_buf(),
    })?;

    if meta.len() as usize > max_bytes {
        return Err(CliError::InvalidInput(format!(
            "file too large: {} bytes (limit {})",
            meta.len(),
            max_bytes
        )));
    }

    let s = fs::read_to_string(path_ref).map_err(|e| CliError::IoPath {
        source: e,
        path: path_ref.to_path_buf(),
    })?;

    Ok(s)
}

fn stats_json(stats: &CompileStats) -> serde_json::Value {
    serde_json::json!({
        "peak_live": stats.peak_live,
        "regs_reused": stats.regs_reused,
        "movs_elided": stats.movs_elided,
        "consts_deduped": stats.consts_deduped,
    })
}

fn print_stats_line(stats: &CompileStats) {
    println!(
        "stats: peak_live={} regs_reused={} movs_elided={} consts_deduped={}",
        stats.peak_live, stats.regs_reused, stats.movs_elided, stats.consts_deduped
    );
}

fn cmd_compile(args: CompileArgs, json: bool, max_bytes: usize) -> Result<(), CliError> {
    let src = read_program(&args.path, max_bytes)?;
    let artifact = compiler::compile_str(&src)?;

    if let Err(e) = fs::write(&args.out, &artifact.image) {
        return Err(CliError::IoPath {
            source: e,
            path: args.out,
        });
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "out": args.out.display().to_string(),
                "image_len": artifact.image.len(),
                "code_len": artifact.code_len,
                "consts": artifact.consts.len(),
                "funcs": artifact.funcs.len(),
                "stats": stats_json(&artifact.stats),
            })
        );
    } else {
        println!(
            "wrote {}: {} bytes ({} code, {} constants, {} functions)",
            args.out.display(),
            artifact.image.len(),
            artifact.code_len,
            artifact.consts.len(),
            artifact.funcs.len()
        );
        print_stats_line(&artifact.stats);
    }

    Ok(())
}

fn cmd_check(args: CheckArgs, json: bool, max_bytes: usize) -> Result<(), CliError> {
    let src = read_program(&args.path, max_bytes)?;
    let stats = compiler::check_str(&src)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "stats": stats_json(&stats) })
        );
    } else {
        println!("OK");
        print_stats_line(&stats);
    }

    Ok(())
}

fn cmd_dump(args: DumpArgs, json: bool, max_bytes: usize) -> Result<(), CliError> {
    let src = read_program(&args.path, max_bytes)?;
    let artifact = compiler::compile_str(&src)?;

    let listing = bytecode::disassemble(artifact.code())
        .map_err(|e| CliError::InvalidInput(format!("cannot decode generated code: {e}")))?;

    if json {
        let instrs: Vec<serde_json::Value> = listing
            .iter()
            .map(|i| serde_json::json!({ "offset": i.offset, "op": i.op.to_string() }))
            .collect();
        let consts: Vec<String> = artifact.consts.iter().map(|v| v.to_string()).collect();
        let funcs: Vec<serde_json::Value> = artifact
            .funcs
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name,
                    "arity": f.arity,
                    "ret": f.ret.to_string(),
                    "addr": f.addr,
                })
            })
            .collect();

        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "code": instrs,
                "consts": consts,
                "funcs": funcs,
            })
        );
    } else {
        for instr in &listing {
            println!("{:>6}  {}", instr.offset, instr.op);
        }

        if !artifact.consts.is_empty() {
            println!("constants:");
            for (i, value) in artifact.consts.iter().enumerate() {
                println!("  c#{i} = {value}");
            }
        }

        if !artifact.funcs.is_empty() {
            println!("functions:");
            for (i, f) in artifact.funcs.iter().enumerate() {
                let addr = f.addr.map(|a| a.to_string()).unwrap_or_else(|| "?".into());
                println!("  f#{i} {}/{} -> {} @{addr}", f.name, f.arity, f.ret);
            }
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();
    logging::init_with_level(Some(&cli.log_level));

    let code = match try_main(cli.clone()) {
        Ok(()) => 0,
        Err(e) => {
            let code = e.code();
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "ok": false, "error": e.to_string(), "code": code })
                );
            } else {
                eprintln!("error: {e}");
            }

            code
        }
    };

    std::process::exit(code);
}

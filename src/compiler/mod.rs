// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! Compilation pipeline for rv-lisp.
//!
//! `lex` and `parse` turn source text into s-expressions, `syntax`
//! shapes them into the owned tree, and [`ast::Program`] runs the two
//! core passes: attribution, then code generation into a
//! [`crate::bytecode::CodeSink`].

pub mod ast;
pub mod context;
pub mod scope;

mod attr;
mod codegen;
mod syntax;

use std::collections::VecDeque;

use thiserror::Error as ThisError;
use tracing::{debug, instrument};

use crate::bytecode::{BytecodeWriter, CodeSink};
use crate::compiler::ast::{Type, Value};
use crate::compiler::context::{CompileStats, FuncEntry};
use crate::compiler::syntax::{SExpr, Tok};

const MAX_TOKENS: usize = 200_000;
const MAX_PARSE_DEPTH: usize = 1_024;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("lex: invalid char '{0}' at {1}")]
    Lex(char, usize),
    #[error("parse: unexpected EOF")]
    Eof,
    #[error("parse: unmatched ')'")]
    Unmatched,
    #[error("syntax: invalid form '{0}'")]
    Syntax(String),
    #[error("attr: unresolved symbol '{0}'")]
    UnresolvedSymbol(String),
    #[error("attr: duplicate symbol '{0}' in scope")]
    DuplicateSymbol(String),
    #[error("attr: type mismatch ({expected} vs {found})")]
    TypeMismatch { expected: Type, found: Type },
    #[error("attr: '{name}' expects {expects} args (got {got})")]
    ArityMismatch {
        name: String,
        expects: usize,
        got: usize,
    },
    #[error("attr: registers exhausted (frame limit {limit})")]
    RegisterExhaustion { limit: usize },
    #[error("attr: function '{0}' has no tail expression")]
    MissingTailExpression(String),
    #[error("limit: {0}")]
    Limit(&'static str),
    #[error("internal: {0}")]
    Internal(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A finished compile: the full container image plus the tables and
/// counters behind it, kept inspectable for tooling and tests.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub image: Vec<u8>,
    pub code_len: usize,
    pub consts: Vec<Value>,
    pub funcs: Vec<FuncEntry>,
    pub stats: CompileStats,
}

impl Artifact {
    /// The instruction stream, without the trailing sections.
    pub fn code(&self) -> &[u8] {
        &self.image[..self.code_len]
    }
}

#[instrument(level = "info", skip(src))]
pub fn compile_str(src: &str) -> Result<Artifact, Error> {
    let mut program = frontend(src)?;
    program.attribute_tree()?;
    debug!("attributed");

    let mut writer = BytecodeWriter::new(Vec::new());
    program.generate_code(&mut writer)?;

    let code_len = writer.code_len() as usize;
    let image = writer.into_inner();
    let ctx = program.ctx();

    debug!(
        code_len,
        consts = ctx.consts.values().len(),
        funcs = ctx.funcs.entries().len(),
        peak_live = ctx.stats().peak_live,
        "generated"
    );

    Ok(Artifact {
        image,
        code_len,
        consts: ctx.consts.values().to_vec(),
        funcs: ctx.funcs.entries().to_vec(),
        stats: ctx.stats(),
    })
}

/// Compile into a caller-provided sink. Attribution must succeed in
/// full before a single byte reaches the sink.
#[instrument(level = "info", skip(src, sink))]
pub fn compile_to(src: &str, sink: &mut dyn CodeSink) -> Result<CompileStats, Error> {
    let mut program = frontend(src)?;
    program.attribute_tree()?;
    program.generate_code(sink)?;

    Ok(program.ctx().stats())
}

/// Run the frontend and the attribution pass only.
#[instrument(level = "info", skip(src))]
pub fn check_str(src: &str) -> Result<CompileStats, Error> {
    let mut program = frontend(src)?;
    program.attribute_tree()?;

    Ok(program.ctx().stats())
}

fn frontend(src: &str) -> Result<ast::Program, Error> {
    let toks = lex(src)?;
    debug!(toks = toks.len(), "lexed");

    let forms = parse(&toks)?;
    debug!(forms = forms.len(), "parsed");

    let decls = syntax::build_program(forms)?;

    Ok(ast::Program::new(decls))
}

// Lexer
pub fn lex(src: &str) -> Result<Vec<Tok>, Error> {
    let mut out = Vec::new();
    let mut it = src.chars().peekable();
    let mut i = 0usize;

    while let Some(&ch) = it.peek() {
        match ch {
            '(' => {
                out.push(Tok::LParen);
                it.next();
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                it.next();
                i += 1;
            }
            ';' => {
                // Line comment; skip until end of line.
                it.next();
                i += 1;

                while let Some(&c2) = it.peek() {
                    if c2 == '\n' {
                        break;
                    }

                    it.next();
                    i += 1;
                }
            }
            ' ' | '\n' | '\r' | '\t' => {
                it.next();
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && digit_follows(&it)) => {
                let mut s = String::new();
                if c == '-' {
                    s.push('-');
                    it.next();
                    i += 1;
                }

                while let Some(&c2) = it.peek() {
                    if c2.is_ascii_digit() {
                        s.push(c2);
                        it.next();
                        i += 1;
                    } else {
                        break;
                    }
                }

                // Decimal part makes a float64; a trailing 'f' makes
                // a float32.
                let mut fractional = false;
                if let Some(&'.') = it.peek() {
                    it.next();
                    i += 1;
                    s.push('.');
                    fractional = true;

                    let mut any = false;
                    while let Some(&c2) = it.peek() {
                        if c2.is_ascii_digit() {
                            s.push(c2);
                            it.next();
                            i += 1;
                            any = true;
                        } else {
                            break;
                        }
                    }

                    if !any {
                        return Err(Error::Lex('.', i));
                    }
                }

                let single = fractional && matches!(it.peek(), Some(&'f'));
                if single {
                    it.next();
                    i += 1;
                }

                let value = if single {
                    Value::Float32(s.parse::<f32>().map_err(|_| Error::Lex(c, i))?)
                } else if fractional {
                    Value::Float64(s.parse::<f64>().map_err(|_| Error::Lex(c, i))?)
                } else {
                    Value::Int64(s.parse::<i64>().map_err(|_| Error::Lex(c, i))?)
                };

                out.push(Tok::Num(value));
            }
            _ => {
                if is_sym_start(ch) {
                    let mut s = String::new();
                    while let Some(&c2) = it.peek() {
                        if is_sym_continue(c2) {
                            s.push(c2);
                            it.next();
                            i += 1;
                        } else {
                            break;
                        }
                    }

                    out.push(Tok::Sym(s));
                } else {
                    return Err(Error::Lex(ch, i));
                }
            }
        }
    }

    if out.len() > MAX_TOKENS {
        return Err(Error::Limit("too many tokens"));
    }

    out.push(Tok::Eof);

    Ok(out)
}

fn digit_follows(it: &std::iter::Peekable<std::str::Chars<'_>>) -> bool {
    let mut ahead = it.clone();
    ahead.next();
    matches!(ahead.next(), Some(c) if c.is_ascii_digit())
}

pub fn is_sym_start(c: char) -> bool {
    matches!(c, 'a'..='z' | 'A'..='Z' | '_' | '+' | '-' | '*' | '/' | '=' | '<' | '>')
}

pub fn is_sym_continue(c: char) -> bool {
    is_sym_start(c) || c.is_ascii_digit()
}

// Parser: program := forms*
fn parse(tokens: &[Tok]) -> Result<Vec<SExpr>, Error> {
    let mut q: VecDeque<Tok> = tokens.to_vec().into();
    let mut forms = Vec::new();

    while let Some(t) = q.front() {
        match t {
            Tok::Eof => break,
            _ => forms.push(parse_one_limited(&mut q, 0)?),
        }
    }

    Ok(forms)
}

fn parse_one_limited(q: &mut VecDeque<Tok>, depth: usize) -> Result<SExpr, Error> {
    if depth > MAX_PARSE_DEPTH {
        return Err(Error::Limit("parse depth exceeded"));
    }

    let t = q.pop_front().ok_or(Error::Eof)?;
    match t {
        Tok::LParen => {
            let mut items = Vec::new();
            loop {
                match q.front() {
                    Some(Tok::RParen) => {
                        q.pop_front();
                        break;
                    }
                    Some(Tok::Eof) => return Err(Error::Eof),
                    _ => items.push(parse_one_limited(q, depth + 1)?),
                }
            }

            Ok(SExpr::List(items))
        }
        Tok::RParen => Err(Error::Unmatched),
        Tok::Num(v) => Ok(SExpr::Num(v)),
        Tok::Sym(s) => Ok(SExpr::Sym(s)),
        Tok::Eof => Err(Error::Eof),
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! Compiler for the rv-lisp language.
//!
//! Source text is lexed and parsed into s-expressions, shaped into an
//! owned syntax tree, and compiled in two strictly ordered passes:
//! attribution (scope resolution, type determination, register
//! allocation, constant interning, tail marking) followed by code
//! generation (opcode emission with backpatched jump targets). The
//! result is a bytecode image for a register-based VM; the VM itself
//! lives behind the [`bytecode::CodeSink`] boundary and is not part of
//! this crate.

pub mod bytecode;
pub mod compiler;
pub mod logging;

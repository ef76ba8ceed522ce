// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! Code generation pass: one walk over the attributed tree, in
//! declaration order, emitting to the external code sink.
//!
//! Each declaration is staged in an [`Asm`] buffer and flushed only
//! once every patch site inside it is resolved, so a failure never
//! leaves a truncated unit visible as valid output. Jump targets are
//! absolute code offsets, written as placeholders and backpatched
//! once the skipped block's size is known.
//!
//! Execution starts at code offset 0: every function body is
//! preceded by a jump over it, so top-level expressions run in
//! declaration order and fall through to the final halt. A function's
//! table address is the offset just past that jump.
//!
//! Generation reads only what attribution computed; any inconsistency
//! found here is a defect and aborts as [`Error::Internal`].

use crate::bytecode::{CodeSink, Op, PATCH_PLACEHOLDER};
use crate::compiler::ast::{Decl, Expr, ExprKind, FunctionDef};
use crate::compiler::context::CompileCtx;
use crate::compiler::Error;

/// Staging buffer for one declaration's code.
struct Asm {
    base: u32,
    buf: Vec<u8>,
    unresolved: Vec<usize>,
}

/// Buffer position of a placeholder jump target.
struct PatchSite(usize);

impl Asm {
    fn new(base: u32) -> Self {
        Self {
            base,
            buf: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    /// Absolute code offset of the next emitted byte.
    fn here(&self) -> u32 {
        self.base + self.buf.len() as u32
    }

    fn push(&mut self, op: &Op) {
        op.encode(&mut self.buf);
    }

    fn emit_jmp(&mut self) -> PatchSite {
        self.push(&Op::Jmp {
            target: PATCH_PLACEHOLDER,
        });
        self.record_site()
    }

    fn emit_jmp_false(&mut self, cond: u8) -> PatchSite {
        self.push(&Op::JmpFalse {
            cond,
            target: PATCH_PLACEHOLDER,
        });
        self.record_site()
    }

    fn record_site(&mut self) -> PatchSite {
        let at = self.buf.len() - 4;
        self.unresolved.push(at);
        PatchSite(at)
    }

    fn patch(&mut self, site: PatchSite, target: u32) -> Result<(), Error> {
        let PatchSite(at) = site;
        let pos = self
            .unresolved
            .iter()
            .position(|&p| p == at)
            .ok_or(Error::Internal("patch site resolved twice"))?;
        self.unresolved.swap_remove(pos);

        self.buf[at..at + 4].copy_from_slice(&target.to_le_bytes());

        Ok(())
    }

    fn flush(self, sink: &mut dyn CodeSink, code_offset: &mut u32) -> Result<(), Error> {
        if !self.unresolved.is_empty() {
            return Err(Error::Internal("unresolved patch site at flush"));
        }

        sink.emit(&self.buf)?;
        *code_offset += self.buf.len() as u32;

        Ok(())
    }
}

pub fn generate(
    ctx: &mut CompileCtx,
    decls: &[Decl],
    sink: &mut dyn CodeSink,
) -> Result<(), Error> {
    for decl in decls {
        match decl {
            Decl::Function(f) => gen_function(ctx, f, sink)?,
            Decl::Expr(e) => {
                let mut asm = Asm::new(ctx.code_offset);
                gen_expr(ctx, &mut asm, e)?;
                asm.flush(sink, &mut ctx.code_offset)?;
            }
        }
    }

    let mut asm = Asm::new(ctx.code_offset);
    asm.push(&Op::Halt);
    asm.flush(sink, &mut ctx.code_offset)?;

    for entry in ctx.funcs.entries() {
        if entry.addr.is_none() {
            return Err(Error::Internal("function address unresolved after generation"));
        }
    }

    sink.finalize(ctx.consts.values(), ctx.funcs.entries())?;

    Ok(())
}

fn gen_function(ctx: &mut CompileCtx, f: &FunctionDef, sink: &mut dyn CodeSink) -> Result<(), Error> {
    let mut asm = Asm::new(ctx.code_offset);

    // Top-level flow jumps over the body; the function's address is
    // the offset just past this jump.
    let over = asm.emit_jmp();
    let entry = asm.here();

    let id = ctx
        .funcs
        .lookup(&f.name)
        .map(|(id, _)| id)
        .ok_or(Error::Internal("function missing from table"))?;
    ctx.funcs.set_addr(id, entry);

    // Parameter setup is implicit: the call instruction seeds the
    // frame registers 0..arity in declaration order.
    for expr in &f.body {
        gen_expr(ctx, &mut asm, expr)?;
    }

    let tail = f
        .body
        .last()
        .ok_or(Error::Internal("empty function body past attribution"))?;
    asm.push(&Op::Ret {
        src: tail.attr.reg,
    });

    let after = asm.here();
    asm.patch(over, after)?;

    asm.flush(sink, &mut ctx.code_offset)
}

fn gen_expr(ctx: &mut CompileCtx, asm: &mut Asm, expr: &Expr) -> Result<(), Error> {
    match &expr.kind {
        ExprKind::Literal { cp_idx, .. } => {
            let Some(idx) = *cp_idx else {
                return Err(Error::Internal("literal not interned"));
            };

            asm.push(&Op::LoadConst {
                dst: expr.attr.reg,
                idx,
            });
        }
        // The value already lives in the symbol's register.
        ExprKind::Var(_) => {}
        ExprKind::Binary { op, lhs, rhs } => {
            gen_expr(ctx, asm, lhs)?;
            gen_expr(ctx, asm, rhs)?;

            // Comparisons included, the opcode is selected by the
            // unified operand type.
            let ty = lhs
                .attr
                .ty
                .ok_or(Error::Internal("operand not attributed"))?;

            asm.push(&Op::Bin {
                op: *op,
                ty,
                dst: expr.attr.reg,
                a: lhs.attr.reg,
                b: rhs.attr.reg,
            });
        }
        ExprKind::Unary { op, operand } => {
            gen_expr(ctx, asm, operand)?;

            let ty = operand
                .attr
                .ty
                .ok_or(Error::Internal("operand not attributed"))?;

            asm.push(&Op::Un {
                op: *op,
                ty,
                dst: expr.attr.reg,
                a: operand.attr.reg,
            });
        }
        ExprKind::If {
            cond,
            then_arm,
            else_arm,
        } => {
            gen_expr(ctx, asm, cond)?;

            let skip_then = asm.emit_jmp_false(cond.attr.reg);

            gen_expr(ctx, asm, then_arm)?;
            emit_move(ctx, asm, expr.attr.reg, then_arm.attr.reg);
            let skip_else = asm.emit_jmp();

            // False branch starts right after the jump-over.
            let else_at = asm.here();
            asm.patch(skip_then, else_at)?;

            gen_expr(ctx, asm, else_arm)?;
            emit_move(ctx, asm, expr.attr.reg, else_arm.attr.reg);

            let join = asm.here();
            asm.patch(skip_else, join)?;
        }
        ExprKind::Let { bindings, body } => {
            for (_, value) in bindings {
                gen_expr(ctx, asm, value)?;
            }

            // The let's value sits in the last body expression's
            // register; no move is needed.
            for expr in body {
                gen_expr(ctx, asm, expr)?;
            }
        }
        ExprKind::Call { callee, args } => {
            if args.len() > u8::MAX as usize {
                return Err(Error::Internal("call argument count exceeds encoding"));
            }

            for arg in args {
                gen_expr(ctx, asm, arg)?;
            }

            let id = ctx
                .funcs
                .lookup(callee)
                .map(|(id, _)| id)
                .ok_or(Error::Internal("callee missing from table"))?;

            asm.push(&Op::Call {
                func: id,
                dst: expr.attr.reg,
                args: args.iter().map(|a| a.attr.reg).collect(),
            });
        }
    }

    Ok(())
}

fn emit_move(ctx: &mut CompileCtx, asm: &mut Asm, dst: u8, src: u8) {
    if dst == src {
        ctx.movs_elided += 1;
        return;
    }

    asm.push(&Op::Mov { dst, src });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeWriter;

    #[test]
    fn flush_refuses_unresolved_patches() {
        let mut asm = Asm::new(0);
        let _site = asm.emit_jmp();

        let mut sink = BytecodeWriter::new(Vec::new());
        let err = asm.flush(&mut sink, &mut 0).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn patch_site_resolves_once() {
        let mut asm = Asm::new(0);
        let site = asm.emit_jmp();
        asm.patch(site, 9).unwrap();

        let err = asm.patch(PatchSite(1), 9).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn patched_target_lands_in_the_buffer() {
        let mut asm = Asm::new(10);
        let site = asm.emit_jmp_false(3);
        asm.patch(site, 0xAABBCCDD).unwrap();

        // jmp_false: opcode, cond, then the 4 target bytes.
        assert_eq!(&asm.buf[2..6], &0xAABBCCDDu32.to_le_bytes());
    }
}

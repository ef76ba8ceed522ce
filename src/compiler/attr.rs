// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! Attribution pass: one recursive walk per top-level declaration.
//!
//! The walk binds symbols, determines each expression's value type,
//! allocates result registers, interns literals into the constant
//! pool and marks tail positions. Children are attributed before
//! their parent, except binding constructs, whose names enter the
//! scope table before the body so references inside it resolve.
//!
//! Type rules: operand types must be equal, or the narrower operand
//! must itself be a literal, which is then promoted along the chain
//! int64 -> float32 -> float64 and re-interned at the wider type.
//! There is no runtime conversion opcode, so nothing else unifies.
//!
//! Register discipline: a node owns its result register unless it
//! borrows a variable's; owned operand registers are released (or
//! reused as the destination) when the consuming node finishes, and
//! non-tail statement results are released after their statement.

use crate::compiler::ast::{Decl, Expr, ExprKind, FunctionDef, Type, UnOp};
use crate::compiler::context::CompileCtx;
use crate::compiler::scope::{ScopeTable, Symbol};
use crate::compiler::Error;

/// Value produced by attributing one expression: its type, the
/// register that will hold it, and whether this node owns that
/// register (false for plain variable references).
#[derive(Clone, Copy, Debug)]
struct Slot {
    ty: Type,
    reg: u8,
    owned: bool,
}

pub fn attribute(ctx: &mut CompileCtx, decl: &mut Decl) -> Result<(), Error> {
    match decl {
        Decl::Function(f) => attr_function(ctx, f),
        Decl::Expr(e) => {
            // Top-level expressions run in the entry frame; their
            // results are computed and discarded.
            ctx.regs.reset();

            let mut scope = ScopeTable::new();
            scope.push_scope();

            let slot = attr_expr(ctx, &mut scope, e)?;
            free_slot(ctx, slot);

            Ok(())
        }
    }
}

fn attr_function(ctx: &mut CompileCtx, f: &mut FunctionDef) -> Result<(), Error> {
    if f.body.is_empty() {
        return Err(Error::MissingTailExpression(f.name.clone()));
    }

    ctx.regs.reset();

    let mut scope = ScopeTable::new();
    scope.push_scope();

    // Parameters take the first registers of the frame; the call
    // instruction seeds them in declaration order.
    for p in &f.params {
        let reg = ctx.regs.alloc()?;
        scope.declare(
            &p.name,
            Symbol {
                reg,
                ty: p.ty,
                owns_reg: true,
            },
        )?;
    }

    let last = f.body.len() - 1;
    for (i, expr) in f.body.iter_mut().enumerate() {
        if i == last {
            mark_tail(expr);
        }

        let slot = attr_expr(ctx, &mut scope, expr)?;

        if i == last && slot.ty != f.ret {
            // The tail value becomes the return value; a literal tail
            // may still widen to the declared return type.
            if !(slot.ty.rank() < f.ret.rank() && promote_literal(ctx, expr, f.ret)?) {
                return Err(Error::TypeMismatch {
                    expected: f.ret,
                    found: slot.ty,
                });
            }
        }

        free_slot(ctx, slot);
    }

    scope.pop_scope(&mut ctx.regs);

    Ok(())
}

/// Mark `expr` as tail and propagate into positions whose value
/// becomes the construct's result: both branches of a conditional and
/// the last body expression of a let.
fn mark_tail(expr: &mut Expr) {
    expr.attr.is_tail = true;

    match &mut expr.kind {
        ExprKind::If {
            then_arm, else_arm, ..
        } => {
            mark_tail(then_arm);
            mark_tail(else_arm);
        }
        ExprKind::Let { body, .. } => {
            if let Some(tail) = body.last_mut() {
                mark_tail(tail);
            }
        }
        _ => {}
    }
}

fn attr_expr(ctx: &mut CompileCtx, scope: &mut ScopeTable, expr: &mut Expr) -> Result<Slot, Error> {
    let slot = match &mut expr.kind {
        ExprKind::Literal { value, cp_idx } => {
            let (idx, _) = ctx.consts.intern(*value)?;
            *cp_idx = Some(idx);

            Slot {
                ty: value.ty(),
                reg: ctx.regs.alloc()?,
                owned: true,
            }
        }
        ExprKind::Var(name) => {
            let sym = scope.resolve(name)?;

            Slot {
                ty: sym.ty,
                reg: sym.reg,
                owned: false,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let op = *op;
            let l = attr_expr(ctx, scope, lhs)?;
            let r = attr_expr(ctx, scope, rhs)?;

            let operand_ty = unify(ctx, &mut **lhs, l.ty, &mut **rhs, r.ty)?;
            let ty = if op.is_comparison() {
                Type::Int64
            } else {
                operand_ty
            };

            // Prefer producing into an owned operand register.
            let reg = if l.owned {
                if r.owned {
                    ctx.regs.free_reg(r.reg);
                }
                ctx.regs_reused += 1;
                l.reg
            } else if r.owned {
                ctx.regs_reused += 1;
                r.reg
            } else {
                ctx.regs.alloc()?
            };

            Slot {
                ty,
                reg,
                owned: true,
            }
        }
        ExprKind::Unary { op, operand } => {
            let op = *op;
            let o = attr_expr(ctx, scope, operand)?;

            let ty = match op {
                UnOp::Neg => o.ty,
                UnOp::Not => {
                    if o.ty != Type::Int64 {
                        return Err(Error::TypeMismatch {
                            expected: Type::Int64,
                            found: o.ty,
                        });
                    }
                    Type::Int64
                }
            };

            let reg = if o.owned {
                ctx.regs_reused += 1;
                o.reg
            } else {
                ctx.regs.alloc()?
            };

            Slot {
                ty,
                reg,
                owned: true,
            }
        }
        ExprKind::If {
            cond,
            then_arm,
            else_arm,
        } => {
            let c = attr_expr(ctx, scope, cond)?;
            if c.ty != Type::Int64 {
                return Err(Error::TypeMismatch {
                    expected: Type::Int64,
                    found: c.ty,
                });
            }

            // The branch instruction consumes the condition before
            // either arm runs, so its register is free for the arms.
            free_slot(ctx, c);

            // The result register lives across both arms.
            let reg = ctx.regs.alloc()?;

            let t = attr_expr(ctx, scope, then_arm)?;
            free_slot(ctx, t);

            let e = attr_expr(ctx, scope, else_arm)?;
            free_slot(ctx, e);

            let ty = unify(ctx, &mut **then_arm, t.ty, &mut **else_arm, e.ty)?;

            Slot {
                ty,
                reg,
                owned: true,
            }
        }
        ExprKind::Let { bindings, body } => {
            scope.push_scope();

            // Bound expressions are attributed before their name is
            // declared; the symbol adopts the value's register, so an
            // alias of an outer variable borrows instead of owning.
            for (name, value) in bindings.iter_mut() {
                let v = attr_expr(ctx, scope, value)?;
                scope.declare(
                    name,
                    Symbol {
                        reg: v.reg,
                        ty: v.ty,
                        owns_reg: v.owned,
                    },
                )?;
            }

            let last = body.len().saturating_sub(1);
            let mut result: Option<Slot> = None;
            for (i, expr) in body.iter_mut().enumerate() {
                let slot = attr_expr(ctx, scope, expr)?;
                if i == last {
                    result = Some(slot);
                } else {
                    free_slot(ctx, slot);
                }
            }

            let result = result.ok_or(Error::Internal("let body empty past syntax"))?;

            // Release the frame's registers, keeping the result
            // alive. A result borrowed from one of this frame's own
            // bindings takes over that register.
            let frame = scope.pop_frame();
            let mut owned = result.owned;
            for sym in frame.values() {
                if !sym.owns_reg {
                    continue;
                }

                if sym.reg == result.reg {
                    if !result.owned {
                        owned = true;
                    }
                } else {
                    ctx.regs.free_reg(sym.reg);
                }
            }

            Slot {
                ty: result.ty,
                reg: result.reg,
                owned,
            }
        }
        ExprKind::Call { callee, args } => {
            let (arity, ret) = match ctx.funcs.lookup(callee) {
                Some((_, entry)) => (entry.arity, entry.ret),
                None => return Err(Error::UnresolvedSymbol(callee.clone())),
            };

            if args.len() != arity {
                return Err(Error::ArityMismatch {
                    name: callee.clone(),
                    expects: arity,
                    got: args.len(),
                });
            }

            let mut slots = Vec::with_capacity(args.len());
            for arg in args.iter_mut() {
                slots.push(attr_expr(ctx, scope, arg)?);
            }

            // Argument registers are read at the call instruction and
            // die there; the first owned one doubles as destination.
            let mut reg: Option<u8> = None;
            for s in &slots {
                if !s.owned {
                    continue;
                }

                if reg.is_none() {
                    reg = Some(s.reg);
                } else {
                    ctx.regs.free_reg(s.reg);
                }
            }

            let reg = match reg {
                Some(r) => {
                    ctx.regs_reused += 1;
                    r
                }
                None => ctx.regs.alloc()?,
            };

            Slot {
                ty: ret,
                reg,
                owned: true,
            }
        }
    };

    expr.attr.ty = Some(slot.ty);
    expr.attr.reg = slot.reg;

    Ok(slot)
}

/// Unify two operand (or branch) types: equal types pass through; a
/// narrower literal widens along the promotion chain and re-interns.
fn unify(
    ctx: &mut CompileCtx,
    a: &mut Expr,
    a_ty: Type,
    b: &mut Expr,
    b_ty: Type,
) -> Result<Type, Error> {
    if a_ty == b_ty {
        return Ok(a_ty);
    }

    if a_ty.rank() < b_ty.rank() && promote_literal(ctx, a, b_ty)? {
        return Ok(b_ty);
    }

    if b_ty.rank() < a_ty.rank() && promote_literal(ctx, b, a_ty)? {
        return Ok(a_ty);
    }

    Err(Error::TypeMismatch {
        expected: a_ty,
        found: b_ty,
    })
}

/// Widen a literal node to `to`, re-interning its value. The entry
/// interned at the narrower type stays in the pool; indices are never
/// removed or renumbered. Returns false for non-literals.
fn promote_literal(ctx: &mut CompileCtx, expr: &mut Expr, to: Type) -> Result<bool, Error> {
    let promoted = match &mut expr.kind {
        ExprKind::Literal { value, cp_idx } => match value.promote(to) {
            Some(widened) => {
                *value = widened;
                let (idx, _) = ctx.consts.intern(widened)?;
                *cp_idx = Some(idx);
                true
            }
            None => false,
        },
        _ => false,
    };

    if promoted {
        expr.attr.ty = Some(to);
    }

    Ok(promoted)
}

fn free_slot(ctx: &mut CompileCtx, slot: Slot) {
    if slot.owned {
        ctx.regs.free_reg(slot.reg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{Program, Value};
    use crate::compiler::syntax;
    use crate::compiler::{lex, parse};

    fn attributed(src: &str) -> Vec<Decl> {
        let toks = lex(src).unwrap();
        let forms = parse(&toks).unwrap();
        let mut decls = syntax::build_program(forms).unwrap();

        let mut ctx = CompileCtx::new();
        for decl in &decls {
            if let Decl::Function(f) = decl {
                ctx.funcs.declare(&f.name, f.params.len(), f.ret).unwrap();
            }
        }
        for decl in &mut decls {
            attribute(&mut ctx, decl).unwrap();
        }

        decls
    }

    fn body_of(decls: &[Decl]) -> &[Expr] {
        match &decls[0] {
            Decl::Function(f) => &f.body,
            Decl::Expr(_) => panic!("expected a function"),
        }
    }

    #[test]
    fn only_last_body_expression_is_tail() {
        let decls = attributed("(defun f (x) (+ x 1) (* x 2))");
        let body = body_of(&decls);

        assert!(!body[0].attr.is_tail);
        assert!(body[1].attr.is_tail);
    }

    #[test]
    fn tail_propagates_into_conditional_branches() {
        let decls = attributed("(defun f (x) (if (> x 0) (+ x 1) (- x 1)))");
        let body = body_of(&decls);

        let ExprKind::If {
            then_arm, else_arm, ..
        } = &body[0].kind
        else {
            panic!("expected a conditional");
        };

        assert!(body[0].attr.is_tail);
        assert!(then_arm.attr.is_tail);
        assert!(else_arm.attr.is_tail);
    }

    #[test]
    fn literal_operand_promotes_to_float() {
        let decls = attributed("(defun (f float64) ((x float64)) (+ x 1))");
        let body = body_of(&decls);

        assert_eq!(body[0].attr.ty, Some(Type::Float64));

        let ExprKind::Binary { rhs, .. } = &body[0].kind else {
            panic!("expected a binary op");
        };
        let ExprKind::Literal { value, .. } = &rhs.kind else {
            panic!("expected a literal");
        };
        assert_eq!(*value, Value::Float64(1.0));
    }

    #[test]
    fn variable_reference_borrows_its_symbol_register() {
        let decls = attributed("(defun f (x) (let ((y x)) y))");
        let body = body_of(&decls);

        // x is parameter 0; the alias chain never allocates.
        assert_eq!(body[0].attr.reg, 0);
    }

    #[test]
    fn comparison_yields_int64() {
        let decls = attributed("(defun f ((x float64)) (if (< x 2.0) 1 0))");
        let body = body_of(&decls);
        let ExprKind::If { cond, .. } = &body[0].kind else {
            panic!("expected a conditional");
        };

        assert_eq!(cond.attr.ty, Some(Type::Int64));
    }

    #[test]
    fn program_attribute_then_generate_order_is_enforced() {
        let toks = lex("(+ 1 2)").unwrap();
        let forms = parse(&toks).unwrap();
        let decls = syntax::build_program(forms).unwrap();
        let mut program = Program::new(decls);

        program.attribute_tree().unwrap();
        let err = program.attribute_tree().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! Shapes parsed s-expressions into the owned syntax tree.

use crate::compiler::ast::{BinOp, Decl, Expr, ExprKind, FunctionDef, Param, Type, UnOp, Value};
use crate::compiler::Error;

#[derive(Clone, Debug, PartialEq)]
pub enum Tok {
    LParen,
    RParen,
    Num(Value),
    Sym(String),
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SExpr {
    Num(Value),
    Sym(String),
    List(Vec<SExpr>),
}

pub fn build_program(forms: Vec<SExpr>) -> Result<Vec<Decl>, Error> {
    let mut decls = Vec::with_capacity(forms.len());

    for form in forms {
        match form {
            SExpr::List(items)
                if matches!(items.first(), Some(SExpr::Sym(s)) if s == "defun") =>
            {
                decls.push(Decl::Function(build_defun(&items[1..])?));
            }
            other => decls.push(Decl::Expr(build_expr(other)?)),
        }
    }

    Ok(decls)
}

// (defun name (params...) body...)
// (defun (name ret-type) (params...) body...)
// param := name | (name type)
fn build_defun(rest: &[SExpr]) -> Result<FunctionDef, Error> {
    if rest.len() < 2 {
        return Err(Error::Syntax("defun: name and parameter list".into()));
    }

    let (name, ret) = match &rest[0] {
        SExpr::Sym(s) => (s.clone(), Type::Int64),
        SExpr::List(h) => match h.as_slice() {
            [SExpr::Sym(s), SExpr::Sym(ty)] => (s.clone(), type_name(ty)?),
            _ => return Err(Error::Syntax("defun: name".into())),
        },
        _ => return Err(Error::Syntax("defun: name".into())),
    };

    let params = match &rest[1] {
        SExpr::List(items) => items
            .iter()
            .map(|p| match p {
                SExpr::Sym(s) => Ok(Param {
                    name: s.clone(),
                    ty: Type::Int64,
                }),
                SExpr::List(kv) => match kv.as_slice() {
                    [SExpr::Sym(s), SExpr::Sym(ty)] => Ok(Param {
                        name: s.clone(),
                        ty: type_name(ty)?,
                    }),
                    _ => Err(Error::Syntax("defun: param".into())),
                },
                _ => Err(Error::Syntax("defun: param".into())),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(Error::Syntax("defun: parameter list".into())),
    };

    // An empty body parses; attribution reports it as a missing tail
    // expression.
    let body = rest[2..]
        .iter()
        .cloned()
        .map(build_expr)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FunctionDef {
        name,
        params,
        ret,
        body,
    })
}

fn build_expr(form: SExpr) -> Result<Expr, Error> {
    match form {
        SExpr::Num(value) => Ok(Expr::new(ExprKind::Literal {
            value,
            cp_idx: None,
        })),
        SExpr::Sym(name) => Ok(Expr::new(ExprKind::Var(name))),
        SExpr::List(items) => {
            let mut items = items.into_iter();
            let head = items.next().ok_or_else(|| Error::Syntax("empty form".into()))?;
            let rest: Vec<SExpr> = items.collect();

            let SExpr::Sym(head) = head else {
                return Err(Error::Syntax("expected operator or function name".into()));
            };

            match head.as_str() {
                "defun" => Err(Error::Syntax("defun: only allowed at top level".into())),
                "let" => build_let(rest),
                "if" => build_if(rest),
                "not" => {
                    let [operand] = try_arity::<1>(&head, rest)?;
                    Ok(Expr::new(ExprKind::Unary {
                        op: UnOp::Not,
                        operand: Box::new(build_expr(operand)?),
                    }))
                }
                "-" if rest.len() == 1 => {
                    let [operand] = try_arity::<1>(&head, rest)?;
                    Ok(Expr::new(ExprKind::Unary {
                        op: UnOp::Neg,
                        operand: Box::new(build_expr(operand)?),
                    }))
                }
                _ => match bin_op(&head) {
                    Some(op) => {
                        let [lhs, rhs] = try_arity::<2>(&head, rest)?;
                        Ok(Expr::new(ExprKind::Binary {
                            op,
                            lhs: Box::new(build_expr(lhs)?),
                            rhs: Box::new(build_expr(rhs)?),
                        }))
                    }
                    None => Ok(Expr::new(ExprKind::Call {
                        callee: head,
                        args: rest
                            .into_iter()
                            .map(build_expr)
                            .collect::<Result<Vec<_>, _>>()?,
                    })),
                },
            }
        }
    }
}

// (let ((name expr)...) body...)
fn build_let(rest: Vec<SExpr>) -> Result<Expr, Error> {
    let mut rest = rest.into_iter();
    let binds = match rest.next() {
        Some(SExpr::List(pairs)) => pairs,
        _ => return Err(Error::Syntax("let: bindings".into())),
    };

    let bindings = binds
        .into_iter()
        .map(|pair| match pair {
            SExpr::List(kv) => {
                let [name, value]: [SExpr; 2] = kv
                    .try_into()
                    .map_err(|_| Error::Syntax("let: pair".into()))?;
                let SExpr::Sym(name) = name else {
                    return Err(Error::Syntax("let: name".into()));
                };
                Ok((name, build_expr(value)?))
            }
            _ => Err(Error::Syntax("let: pair".into())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let body = rest.map(build_expr).collect::<Result<Vec<_>, _>>()?;
    if body.is_empty() {
        return Err(Error::Syntax("let: empty body".into()));
    }

    Ok(Expr::new(ExprKind::Let { bindings, body }))
}

// (if cond then else)
fn build_if(rest: Vec<SExpr>) -> Result<Expr, Error> {
    let [cond, then_arm, else_arm] = try_arity::<3>("if", rest)?;

    Ok(Expr::new(ExprKind::If {
        cond: Box::new(build_expr(cond)?),
        then_arm: Box::new(build_expr(then_arm)?),
        else_arm: Box::new(build_expr(else_arm)?),
    }))
}

fn try_arity<const N: usize>(head: &str, rest: Vec<SExpr>) -> Result<[SExpr; N], Error> {
    let got = rest.len();
    rest.try_into()
        .map_err(|_| Error::Syntax(format!("{head}: expected {N} operands (got {got})")))
}

fn bin_op(sym: &str) -> Option<BinOp> {
    Some(match sym {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "=" => BinOp::Eq,
        "/=" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        _ => return None,
    })
}

fn type_name(sym: &str) -> Result<Type, Error> {
    match sym {
        "int64" => Ok(Type::Int64),
        "float32" => Ok(Type::Float32),
        "float64" => Ok(Type::Float64),
        other => Err(Error::Syntax(format!("unknown type '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{lex, Error};

    fn forms(src: &str) -> Vec<SExpr> {
        let toks = lex(src).unwrap();
        crate::compiler::parse(&toks).unwrap()
    }

    #[test]
    fn defun_shapes_params_and_ret() {
        let decls = build_program(forms("(defun (f float64) ((x float64) y) x)")).unwrap();
        let Decl::Function(f) = &decls[0] else {
            panic!("expected function");
        };

        assert_eq!(f.name, "f");
        assert_eq!(f.ret, Type::Float64);
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.params[0].ty, Type::Float64);
        assert_eq!(f.params[1].ty, Type::Int64);
    }

    #[test]
    fn nested_defun_is_rejected() {
        let err = build_program(forms("(let ((x (defun g () 1))) x)")).unwrap_err();
        assert!(matches!(err, Error::Syntax(msg) if msg.contains("defun")));
    }

    #[test]
    fn unary_minus_is_negation() {
        let decls = build_program(forms("(- 3)")).unwrap();
        let Decl::Expr(e) = &decls[0] else {
            panic!("expected expression");
        };
        assert!(matches!(
            e.kind,
            ExprKind::Unary {
                op: UnOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn if_requires_both_branches() {
        let err = build_program(forms("(if (> 1 2) 1)")).unwrap_err();
        assert!(matches!(err, Error::Syntax(msg) if msg.contains("if")));
    }

    #[test]
    fn let_requires_a_body() {
        let err = build_program(forms("(let ((x 1)))")).unwrap_err();
        assert!(matches!(err, Error::Syntax(msg) if msg.contains("let")));
    }
}

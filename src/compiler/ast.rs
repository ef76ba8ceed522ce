// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! Owned syntax tree and the program root.
//!
//! Every node kind is a closed enum variant; children are held by
//! `Box`/`Vec` so the tree has single ownership and no back-edges.
//! Attribution fills the per-node [`Attr`] in place; generation reads
//! it and never touches scope state.

use std::fmt::{self, Display};

use crate::bytecode::CodeSink;
use crate::compiler::context::CompileCtx;
use crate::compiler::{attr, codegen, Error};

/// Value types known to the VM, ordered by promotion rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Int64,
    Float32,
    Float64,
}

impl Type {
    /// Position in the promotion chain int64 -> float32 -> float64.
    pub fn rank(self) -> u8 {
        match self {
            Type::Int64 => 0,
            Type::Float32 => 1,
            Type::Float64 => 2,
        }
    }

    /// Stable index used by the typed-opcode encoding.
    pub fn index(self) -> u8 {
        self.rank()
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int64 => f.write_str("int64"),
            Type::Float32 => f.write_str("float32"),
            Type::Float64 => f.write_str("float64"),
        }
    }
}

/// A typed literal value, as interned into the constant pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Int64(i64),
    Float32(f32),
    Float64(f64),
}

impl Value {
    pub fn ty(self) -> Type {
        match self {
            Value::Int64(_) => Type::Int64,
            Value::Float32(_) => Type::Float32,
            Value::Float64(_) => Type::Float64,
        }
    }

    /// Bit pattern used for pool deduplication and encoding. Floats
    /// compare by bits, so 0.0 and -0.0 are distinct entries.
    pub fn bits(self) -> u64 {
        match self {
            Value::Int64(v) => v as u64,
            Value::Float32(v) => v.to_bits() as u64,
            Value::Float64(v) => v.to_bits(),
        }
    }

    /// Widen to `to` along the promotion chain. Returns `None` for a
    /// narrowing or same-rank conversion; promotion never narrows.
    pub fn promote(self, to: Type) -> Option<Value> {
        if self.ty().rank() >= to.rank() {
            return None;
        }

        Some(match (self, to) {
            (Value::Int64(v), Type::Float32) => Value::Float32(v as f32),
            (Value::Int64(v), Type::Float64) => Value::Float64(v as f64),
            (Value::Float32(v), Type::Float64) => Value::Float64(v as f64),
            _ => return None,
        })
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int64(v) => write!(f, "{v}:int64"),
            Value::Float32(v) => write!(f, "{v}:float32"),
            Value::Float64(v) => write!(f, "{v}:float64"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Comparisons produce an int64 0/1 regardless of operand type.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn index(self) -> u8 {
        match self {
            BinOp::Add => 0,
            BinOp::Sub => 1,
            BinOp::Mul => 2,
            BinOp::Div => 3,
            BinOp::Eq => 4,
            BinOp::Ne => 5,
            BinOp::Lt => 6,
            BinOp::Le => 7,
            BinOp::Gt => 8,
            BinOp::Ge => 9,
        }
    }

}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// Attribution results carried by every expression node.
#[derive(Clone, Copy, Debug, Default)]
pub struct Attr {
    /// Inferred value type; `None` until attribution ran.
    pub ty: Option<Type>,
    /// Register holding the node's value within its function frame.
    pub reg: u8,
    /// True for the final expression of a function body and, through
    /// propagation, the final expression of each branch of a tail
    /// conditional.
    pub is_tail: bool,
}

#[derive(Debug)]
pub enum ExprKind {
    Literal {
        value: Value,
        /// Constant-pool index, assigned on interning.
        cp_idx: Option<u16>,
    },
    Var(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_arm: Box<Expr>,
        else_arm: Box<Expr>,
    },
    Let {
        bindings: Vec<(String, Expr)>,
        body: Vec<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub attr: Attr,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            kind,
            attr: Attr::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    /// Declared return type; the body's tail expression must match.
    pub ret: Type,
    pub body: Vec<Expr>,
}

/// A top-level declaration: a function definition or an expression
/// evaluated (and discarded) in the program's entry sequence.
#[derive(Debug)]
pub enum Decl {
    Function(FunctionDef),
    Expr(Expr),
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Parsed,
    Attributed,
    Generated,
}

/// Root aggregate: owns the ordered top-level declarations and the
/// compilation context, and enforces the attribute-then-generate
/// ordering. Generation cannot run twice, nor before attribution.
#[derive(Debug)]
pub struct Program {
    decls: Vec<Decl>,
    ctx: CompileCtx,
    phase: Phase,
}

impl Program {
    pub fn new(decls: Vec<Decl>) -> Self {
        Self {
            decls,
            ctx: CompileCtx::new(),
            phase: Phase::Parsed,
        }
    }

    pub fn ctx(&self) -> &CompileCtx {
        &self.ctx
    }

    /// Run the attribution pass over every declaration, in order.
    ///
    /// Function signatures are registered up front so forward and
    /// mutually-recursive calls resolve while bodies are attributed.
    /// The first error aborts the pass; a partially attributed tree is
    /// never valid and cannot proceed to generation.
    pub fn attribute_tree(&mut self) -> Result<(), Error> {
        if self.phase != Phase::Parsed {
            return Err(Error::Internal("attribution pass re-entered"));
        }

        for decl in &self.decls {
            if let Decl::Function(f) = decl {
                self.ctx.funcs.declare(&f.name, f.params.len(), f.ret)?;
            }
        }

        for decl in &mut self.decls {
            attr::attribute(&mut self.ctx, decl)?;
        }

        self.phase = Phase::Attributed;

        Ok(())
    }

    /// Run the code generator over the attributed tree, streaming to
    /// `sink` and finalizing the constant pool and function table.
    pub fn generate_code(&mut self, sink: &mut dyn CodeSink) -> Result<(), Error> {
        if self.phase != Phase::Attributed {
            return Err(Error::Internal(
                "generation requires a freshly attributed tree",
            ));
        }

        // Block re-entry even if generation fails partway.
        self.phase = Phase::Generated;

        codegen::generate(&mut self.ctx, &self.decls, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_widens_only() {
        assert_eq!(
            Value::Int64(5).promote(Type::Float64),
            Some(Value::Float64(5.0))
        );
        assert_eq!(
            Value::Float32(1.5).promote(Type::Float64),
            Some(Value::Float64(1.5))
        );
        assert_eq!(Value::Float64(1.0).promote(Type::Float32), None);
        assert_eq!(Value::Int64(1).promote(Type::Int64), None);
    }

    #[test]
    fn value_bits_distinguish_types() {
        // Same numeral, different type: distinct pool identities.
        let int = Value::Int64(1);
        let dbl = Value::Float64(1.0);
        assert_ne!((int.ty(), int.bits()), (dbl.ty(), dbl.bits()));
    }

    #[test]
    fn generate_before_attribute_is_rejected() {
        let mut program = Program::new(Vec::new());
        let mut sink = crate::bytecode::BytecodeWriter::new(Vec::new());
        let err = program.generate_code(&mut sink).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn generate_twice_is_rejected() {
        let mut program = Program::new(Vec::new());
        program.attribute_tree().unwrap();

        let mut sink = crate::bytecode::BytecodeWriter::new(Vec::new());
        program.generate_code(&mut sink).unwrap();

        let mut sink = crate::bytecode::BytecodeWriter::new(Vec::new());
        let err = program.generate_code(&mut sink).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}

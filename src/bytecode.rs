// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! VM-facing bytecode contract.
//!
//! Instructions are byte-encoded with fixed-size operands so jump
//! targets can be patched in place. Arithmetic and comparison opcodes
//! are typed: the byte is derived from the (operator, value type)
//! pair. Operand registers are read before the destination is
//! written, so an instruction may reuse an operand register as `dst`.
//!
//! A call lists its argument registers explicitly; the VM seeds the
//! callee frame registers `0..argc` from them and writes the return
//! value into the caller's `dst` register.
//!
//! Container layout produced by [`BytecodeWriter`]:
//!
//! ```text
//! [code][constant pool][function table][trailer]
//! ```
//!
//! The pool section is a u16 entry count followed by tag byte +
//! 8-byte little-endian payload per entry. The function section is a
//! u16 entry count followed by length-prefixed name, u32 address, u8
//! arity and u8 return-type tag per entry. The trailer carries the
//! two section offsets (u64 each), a Blake3 digest of everything
//! before the trailer, and the magic `RVL1`.

use std::fmt::{self, Display};
use std::io;

use thiserror::Error;

use crate::compiler::ast::{BinOp, Type, UnOp, Value};
use crate::compiler::context::FuncEntry;

pub const MAGIC: &[u8; 4] = b"RVL1";

/// Unpatched jump target. Must never survive into flushed code.
pub const PATCH_PLACEHOLDER: u32 = u32::MAX;

const OP_HALT: u8 = 0x00;
const OP_LOAD_CONST: u8 = 0x01;
const OP_MOV: u8 = 0x02;
const OP_RET: u8 = 0x03;
const OP_JMP: u8 = 0x04;
const OP_JMP_FALSE: u8 = 0x05;
const OP_CALL: u8 = 0x06;
const OP_BIN_BASE: u8 = 0x10;
const OP_BIN_END: u8 = 0x2D;
const OP_NEG_BASE: u8 = 0x30;
const OP_NOT: u8 = 0x33;

const BIN_OPS: [BinOp; 10] = [
    BinOp::Add,
    BinOp::Sub,
    BinOp::Mul,
    BinOp::Div,
    BinOp::Eq,
    BinOp::Ne,
    BinOp::Lt,
    BinOp::Le,
    BinOp::Gt,
    BinOp::Ge,
];

const TYPES: [Type; 3] = [Type::Int64, Type::Float32, Type::Float64];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Halt,
    LoadConst {
        dst: u8,
        idx: u16,
    },
    Mov {
        dst: u8,
        src: u8,
    },
    Ret {
        src: u8,
    },
    Jmp {
        target: u32,
    },
    JmpFalse {
        cond: u8,
        target: u32,
    },
    Call {
        func: u16,
        dst: u8,
        args: Vec<u8>,
    },
    Bin {
        op: BinOp,
        ty: Type,
        dst: u8,
        a: u8,
        b: u8,
    },
    Un {
        op: UnOp,
        ty: Type,
        dst: u8,
        a: u8,
    },
}

impl Op {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Op::Halt => out.push(OP_HALT),
            Op::LoadConst { dst, idx } => {
                out.push(OP_LOAD_CONST);
                out.push(dst);
                out.extend_from_slice(&idx.to_le_bytes());
            }
            Op::Mov { dst, src } => {
                out.push(OP_MOV);
                out.push(dst);
                out.push(src);
            }
            Op::Ret { src } => {
                out.push(OP_RET);
                out.push(src);
            }
            Op::Jmp { target } => {
                out.push(OP_JMP);
                out.extend_from_slice(&target.to_le_bytes());
            }
            Op::JmpFalse { cond, target } => {
                out.push(OP_JMP_FALSE);
                out.push(cond);
                out.extend_from_slice(&target.to_le_bytes());
            }
            Op::Call {
                func,
                dst,
                ref args,
            } => {
                out.push(OP_CALL);
                out.extend_from_slice(&func.to_le_bytes());
                out.push(dst);
                out.push(args.len() as u8);
                out.extend_from_slice(args);
            }
            Op::Bin { op, ty, dst, a, b } => {
                out.push(OP_BIN_BASE + op.index() * 3 + ty.index());
                out.push(dst);
                out.push(a);
                out.push(b);
            }
            Op::Un { op, ty, dst, a } => {
                let byte = match op {
                    UnOp::Neg => OP_NEG_BASE + ty.index(),
                    UnOp::Not => OP_NOT,
                };
                out.push(byte);
                out.push(dst);
                out.push(a);
            }
        }
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Halt => f.write_str("halt"),
            Op::LoadConst { dst, idx } => write!(f, "load_const r{dst}, c#{idx}"),
            Op::Mov { dst, src } => write!(f, "mov r{dst}, r{src}"),
            Op::Ret { src } => write!(f, "ret r{src}"),
            Op::Jmp { target } => write!(f, "jmp @{target}"),
            Op::JmpFalse { cond, target } => write!(f, "jmp_false r{cond}, @{target}"),
            Op::Call { func, dst, args } => {
                write!(f, "call f#{func} -> r{dst}, args [")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "r{a}")?;
                }
                f.write_str("]")
            }
            Op::Bin { op, ty, dst, a, b } => {
                write!(f, "{}.{ty} r{dst}, r{a}, r{b}", bin_name(*op))
            }
            Op::Un { op, ty, dst, a } => match op {
                UnOp::Neg => write!(f, "neg.{ty} r{dst}, r{a}"),
                UnOp::Not => write!(f, "not r{dst}, r{a}"),
            },
        }
    }
}

fn bin_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Div => "div",
        BinOp::Eq => "eq",
        BinOp::Ne => "ne",
        BinOp::Lt => "lt",
        BinOp::Le => "le",
        BinOp::Gt => "gt",
        BinOp::Ge => "ge",
    }
}

/// External consumer of generated code. The instruction stream
/// arrives incrementally through [`CodeSink::emit`]; the constant
/// pool and function table are finalized exactly once, after all
/// code was written.
pub trait CodeSink {
    fn emit(&mut self, code: &[u8]) -> io::Result<()>;

    fn finalize(&mut self, consts: &[Value], funcs: &[FuncEntry]) -> io::Result<()>;
}

/// Streams the container format into any [`io::Write`], hashing
/// everything before the trailer into a Blake3 digest.
#[derive(Debug)]
pub struct BytecodeWriter<W: io::Write> {
    out: W,
    hasher: blake3::Hasher,
    code_len: u64,
}

impl<W: io::Write> BytecodeWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            hasher: blake3::Hasher::new(),
            code_len: 0,
        }
    }

    pub fn code_len(&self) -> u64 {
        self.code_len
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_hashed(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.hasher.update(bytes);
        self.out.write_all(bytes)
    }
}

impl<W: io::Write> CodeSink for BytecodeWriter<W> {
    fn emit(&mut self, code: &[u8]) -> io::Result<()> {
        self.code_len += code.len() as u64;
        self.write_hashed(code)
    }

    fn finalize(&mut self, consts: &[Value], funcs: &[FuncEntry]) -> io::Result<()> {
        let pool_off = self.code_len;

        let mut pool = Vec::with_capacity(2 + consts.len() * 9);
        pool.extend_from_slice(&(consts.len() as u16).to_le_bytes());
        for value in consts {
            pool.push(value.ty().index());
            pool.extend_from_slice(&value.bits().to_le_bytes());
        }
        let funcs_off = pool_off + pool.len() as u64;
        self.write_hashed(&pool)?;

        let mut table = Vec::new();
        table.extend_from_slice(&(funcs.len() as u16).to_le_bytes());
        for entry in funcs {
            let addr = entry.addr.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unresolved address for function '{}'", entry.name),
                )
            })?;

            let arity = u8::try_from(entry.arity).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("function '{}' arity exceeds u8", entry.name),
                )
            })?;

            table.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            table.extend_from_slice(entry.name.as_bytes());
            table.extend_from_slice(&addr.to_le_bytes());
            table.push(arity);
            table.push(entry.ret.index());
        }
        self.write_hashed(&table)?;

        let digest = *self.hasher.finalize().as_bytes();
        self.out.write_all(&pool_off.to_le_bytes())?;
        self.out.write_all(&funcs_off.to_le_bytes())?;
        self.out.write_all(&digest)?;
        self.out.write_all(MAGIC)?;
        self.out.flush()
    }
}

#[derive(Debug, Error)]
pub enum DisasmError {
    #[error("bad opcode 0x{0:02x} at offset {1}")]
    BadOpcode(u8, usize),
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
}

/// A decoded instruction and the code offset it starts at.
#[derive(Clone, Debug)]
pub struct Instr {
    pub offset: u32,
    pub op: Op,
}

/// Decode an instruction stream back into [`Op`]s. Used by the CLI
/// dump listing and by tests that check patched jump targets with
/// instruction-length arithmetic.
pub fn disassemble(code: &[u8]) -> Result<Vec<Instr>, DisasmError> {
    fn take<'a>(
        code: &'a [u8],
        at: &mut usize,
        start: usize,
        n: usize,
    ) -> Result<&'a [u8], DisasmError> {
        let bytes = code
            .get(*at..*at + n)
            .ok_or(DisasmError::Truncated(start))?;
        *at += n;
        Ok(bytes)
    }

    let mut out = Vec::new();
    let mut at = 0usize;

    while at < code.len() {
        let start = at;
        let byte = code[at];
        at += 1;

        let op = match byte {
            OP_HALT => Op::Halt,
            OP_LOAD_CONST => {
                let b = take(code, &mut at, start, 3)?;
                Op::LoadConst {
                    dst: b[0],
                    idx: u16::from_le_bytes([b[1], b[2]]),
                }
            }
            OP_MOV => {
                let b = take(code, &mut at, start, 2)?;
                Op::Mov {
                    dst: b[0],
                    src: b[1],
                }
            }
            OP_RET => {
                let b = take(code, &mut at, start, 1)?;
                Op::Ret { src: b[0] }
            }
            OP_JMP => {
                let b = take(code, &mut at, start, 4)?;
                Op::Jmp {
                    target: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                }
            }
            OP_JMP_FALSE => {
                let b = take(code, &mut at, start, 5)?;
                Op::JmpFalse {
                    cond: b[0],
                    target: u32::from_le_bytes([b[1], b[2], b[3], b[4]]),
                }
            }
            OP_CALL => {
                let head = take(code, &mut at, start, 4)?;
                let func = u16::from_le_bytes([head[0], head[1]]);
                let dst = head[2];
                let argc = head[3] as usize;
                let args = take(code, &mut at, start, argc)?.to_vec();
                Op::Call { func, dst, args }
            }
            OP_BIN_BASE..=OP_BIN_END => {
                let rel = byte - OP_BIN_BASE;
                let op = BIN_OPS[(rel / 3) as usize];
                let ty = TYPES[(rel % 3) as usize];
                let b = take(code, &mut at, start, 3)?;
                Op::Bin {
                    op,
                    ty,
                    dst: b[0],
                    a: b[1],
                    b: b[2],
                }
            }
            OP_NEG_BASE..=OP_NOT => {
                let (op, ty) = if byte == OP_NOT {
                    (UnOp::Not, Type::Int64)
                } else {
                    (UnOp::Neg, TYPES[(byte - OP_NEG_BASE) as usize])
                };
                let b = take(code, &mut at, start, 2)?;
                Op::Un {
                    op,
                    ty,
                    dst: b[0],
                    a: b[1],
                }
            }
            other => return Err(DisasmError::BadOpcode(other, start)),
        };

        out.push(Instr {
            offset: start as u32,
            op,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let ops = vec![
            Op::LoadConst { dst: 0, idx: 3 },
            Op::Bin {
                op: BinOp::Gt,
                ty: Type::Int64,
                dst: 0,
                a: 0,
                b: 1,
            },
            Op::JmpFalse {
                cond: 0,
                target: 42,
            },
            Op::Call {
                func: 1,
                dst: 2,
                args: vec![3, 4],
            },
            Op::Un {
                op: UnOp::Neg,
                ty: Type::Float64,
                dst: 1,
                a: 1,
            },
            Op::Ret { src: 2 },
            Op::Halt,
        ];

        let mut code = Vec::new();
        for op in &ops {
            op.encode(&mut code);
        }

        let decoded = disassemble(&code).unwrap();
        let back: Vec<Op> = decoded.into_iter().map(|i| i.op).collect();
        assert_eq!(back, ops);
    }

    #[test]
    fn typed_opcodes_are_distinct() {
        let mut int_add = Vec::new();
        Op::Bin {
            op: BinOp::Add,
            ty: Type::Int64,
            dst: 0,
            a: 0,
            b: 1,
        }
        .encode(&mut int_add);

        let mut dbl_add = Vec::new();
        Op::Bin {
            op: BinOp::Add,
            ty: Type::Float64,
            dst: 0,
            a: 0,
            b: 1,
        }
        .encode(&mut dbl_add);

        assert_ne!(int_add[0], dbl_add[0]);
    }

    #[test]
    fn writer_trailer_carries_offsets_and_magic() {
        let mut w = BytecodeWriter::new(Vec::new());
        w.emit(&[OP_HALT]).unwrap();
        w.finalize(
            &[Value::Int64(7)],
            &[FuncEntry {
                name: "f".to_string(),
                arity: 0,
                ret: Type::Int64,
                addr: Some(0),
            }],
        )
        .unwrap();

        let image = w.into_inner();
        assert_eq!(&image[image.len() - 4..], MAGIC);

        let pool_off = u64::from_le_bytes(image[image.len() - 52..image.len() - 44].try_into().unwrap());
        assert_eq!(pool_off, 1);

        // Pool entry: count, then tag + payload.
        assert_eq!(&image[1..3], &1u16.to_le_bytes());
        assert_eq!(image[3], Type::Int64.index());
    }

    #[test]
    fn writer_rejects_unresolved_function() {
        let mut w = BytecodeWriter::new(Vec::new());
        let err = w
            .finalize(
                &[],
                &[FuncEntry {
                    name: "f".to_string(),
                    arity: 0,
                    ret: Type::Int64,
                    addr: None,
                }],
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

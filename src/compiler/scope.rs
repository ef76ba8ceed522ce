// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

//! Scope stack used by the attribution pass.
//!
//! The table is owned by the pass and threaded by reference through
//! the tree walk; nodes never retain scope state after attribution.

use std::collections::BTreeMap;

use crate::compiler::ast::Type;
use crate::compiler::context::RegAlloc;
use crate::compiler::Error;

/// A named storage slot. Created on declaration, read-only thereafter.
#[derive(Clone, Copy, Debug)]
pub struct Symbol {
    pub reg: u8,
    pub ty: Type,
    /// Whether scope exit releases the register. False when a let
    /// binding aliases a register owned elsewhere.
    pub owns_reg: bool,
}

/// Nested name-to-symbol mapping. Lookup walks innermost to
/// outermost; names are unique within one frame, shadowing across
/// frames is legal.
#[derive(Debug, Default)]
pub struct ScopeTable {
    frames: Vec<BTreeMap<String, Symbol>>,
}

impl ScopeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scope(&mut self) {
        self.frames.push(BTreeMap::new());
    }

    /// Pop the innermost frame, releasing every register it owns.
    pub fn pop_scope(&mut self, regs: &mut RegAlloc) {
        for sym in self.pop_frame().values() {
            if sym.owns_reg {
                regs.free_reg(sym.reg);
            }
        }
    }

    /// Pop the innermost frame without touching registers. Callers
    /// that keep a result alive past the frame free selectively.
    pub fn pop_frame(&mut self) -> BTreeMap<String, Symbol> {
        self.frames.pop().unwrap_or_default()
    }

    pub fn declare(&mut self, name: &str, sym: Symbol) -> Result<(), Error> {
        let frame = self
            .frames
            .last_mut()
            .ok_or(Error::Internal("declare without an active scope"))?;

        if frame.contains_key(name) {
            return Err(Error::DuplicateSymbol(name.to_string()));
        }

        frame.insert(name.to_string(), sym);

        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Symbol, Error> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .copied()
            .ok_or_else(|| Error::UnresolvedSymbol(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(reg: u8) -> Symbol {
        Symbol {
            reg,
            ty: Type::Int64,
            owns_reg: true,
        }
    }

    #[test]
    fn duplicate_in_same_scope_errors() {
        let mut scope = ScopeTable::new();
        scope.push_scope();
        scope.declare("x", sym(0)).unwrap();

        let err = scope.declare("x", sym(1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateSymbol(name) if name == "x"));
    }

    #[test]
    fn shadowing_across_scopes_is_legal() {
        let mut scope = ScopeTable::new();
        scope.push_scope();
        scope.declare("x", sym(0)).unwrap();

        scope.push_scope();
        scope.declare("x", sym(1)).unwrap();
        assert_eq!(scope.resolve("x").unwrap().reg, 1);

        let mut regs = RegAlloc::new();
        scope.pop_scope(&mut regs);
        assert_eq!(scope.resolve("x").unwrap().reg, 0);
    }

    #[test]
    fn resolve_outside_any_binding_errors() {
        let mut scope = ScopeTable::new();
        scope.push_scope();

        let err = scope.resolve("y").unwrap_err();
        assert!(matches!(err, Error::UnresolvedSymbol(name) if name == "y"));
    }

    #[test]
    fn pop_releases_owned_registers_only() {
        let mut regs = RegAlloc::new();
        let r0 = regs.alloc().unwrap();
        let r1 = regs.alloc().unwrap();

        let mut scope = ScopeTable::new();
        scope.push_scope();
        scope
            .declare(
                "owned",
                Symbol {
                    reg: r0,
                    ty: Type::Int64,
                    owns_reg: true,
                },
            )
            .unwrap();
        scope
            .declare(
                "alias",
                Symbol {
                    reg: r1,
                    ty: Type::Int64,
                    owns_reg: false,
                },
            )
            .unwrap();

        scope.pop_scope(&mut regs);

        // r0 came back to the free list, r1 did not.
        assert_eq!(regs.alloc().unwrap(), r0);
        assert_ne!(regs.alloc().unwrap(), r1);
    }
}

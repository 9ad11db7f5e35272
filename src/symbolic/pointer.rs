//! Symbolic pointers with provable displacement arithmetic.
//!
//! A [`Pointer`] wraps a symbolic byte-address expression, normalized into a stripped
//! base plus a constant byte displacement. Two pointers with the same stripped base are
//! provably related and subtract to a constant; pointers with different bases have an
//! unknown relation, which is what drives alias failures in the memory store.

use std::fmt;

use crate::symbolic::{
    expr::{ExprKind, SymbolicExpr},
    ops::SymbolicOp,
};

/// A symbolic byte address, split into stripped base and constant displacement.
#[derive(Debug, Clone)]
pub struct Pointer {
    /// The full address expression.
    base: SymbolicExpr,
    /// The address with constant displacements peeled off; `None` for absolute
    /// (fully constant) addresses.
    stripped: Option<SymbolicExpr>,
    /// Constant byte displacement from the stripped base.
    offset: i64,
}

impl Pointer {
    /// Parses a pointer from an address expression.
    ///
    /// The expression is simplified first so that chained displacements
    /// (`(base + 8) - 16`) collapse into a single constant before peeling.
    #[must_use]
    pub fn new(address: &SymbolicExpr) -> Self {
        let simplified = address.simplify(false);
        let mut stripped = simplified.clone();
        let mut offset: i64 = 0;
        loop {
            match stripped.kind() {
                ExprKind::Constant(_) => {
                    offset = offset.wrapping_add(stripped.as_i64().unwrap_or(0));
                    return Pointer {
                        base: simplified,
                        stripped: None,
                        offset,
                    };
                }
                ExprKind::Binary {
                    op: SymbolicOp::Add,
                    lhs,
                    rhs,
                } => {
                    if let Some(c) = rhs.as_i64() {
                        offset = offset.wrapping_add(c);
                        stripped = lhs.clone();
                        continue;
                    }
                    break;
                }
                ExprKind::Binary {
                    op: SymbolicOp::Sub,
                    lhs,
                    rhs,
                } => {
                    if let Some(c) = rhs.as_i64() {
                        offset = offset.wrapping_sub(c);
                        stripped = lhs.clone();
                        continue;
                    }
                    break;
                }
                _ => break,
            }
        }
        Pointer {
            base: simplified,
            stripped: Some(stripped),
            offset,
        }
    }

    /// The full address expression.
    #[must_use]
    pub fn base(&self) -> &SymbolicExpr {
        &self.base
    }

    /// The constant byte displacement from the stripped base.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Returns this pointer advanced by a constant number of bytes.
    #[must_use]
    pub fn advanced(&self, bytes: i64) -> Pointer {
        Pointer::new(&(&self.base + bytes))
    }

    /// Subtracts two pointers, yielding the byte distance when provably related.
    ///
    /// Related means both share the same stripped base (or both are absolute); the
    /// result is then `self - other` in bytes. Unrelated pointers return `None`.
    #[must_use]
    pub fn sub(&self, other: &Pointer) -> Option<i64> {
        match (&self.stripped, &other.stripped) {
            (None, None) => Some(self.offset.wrapping_sub(other.offset)),
            (Some(a), Some(b)) if a.equals(b) => Some(self.offset.wrapping_sub(other.offset)),
            _ => None,
        }
    }
}

/// Matches `A + U` or `A - U` with `U` an integral constant, returning `(A, ±U)`.
///
/// This is the single-step splitter the re-emitter uses to peel a constant displacement
/// off a packed base address before translating it into a `str` base operand. Unlike
/// [`Pointer::new`] it does not recurse and does not simplify its input.
#[must_use]
pub fn split_displacement(expr: &SymbolicExpr) -> Option<(SymbolicExpr, i64)> {
    if let ExprKind::Binary { op, lhs, rhs } = expr.kind() {
        if let Some(c) = rhs.as_i64() {
            match op {
                SymbolicOp::Add => return Some((lhs.clone(), c)),
                SymbolicOp::Sub => return Some((lhs.clone(), c.wrapping_neg())),
                _ => {}
            }
        }
    }
    None
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.sub(other) == Some(0)
    }
}

impl Eq for Pointer {}

impl std::hash::Hash for Pointer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.stripped.as_ref().map_or(0, SymbolicExpr::hash));
        state.write_i64(self.offset);
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)
    }
}

//! Symbolic variables: the leaves of expression trees.
//!
//! A [`SymbolicVariable`] names a value the analyzer cannot (or does not) look through:
//! the content of a register or a memory location *at a given point* of the instruction
//! stream. The binding point ([`Origin`]) makes variables from different segments
//! distinct even when they name the same register.

use std::fmt;

use crate::{
    ir::RegisterDesc,
    symbolic::{
        bits::splitmix64,
        expr::{ExprKind, SymbolicExpr},
        ops::SymbolicOp,
    },
};

/// The instruction-stream position a variable's value binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin {
    /// Entry address of the block the position lies in.
    pub vip: u64,
    /// Instruction index within the block.
    pub index: usize,
}

/// A memory-backed variable: the value at a symbolic pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryVariable {
    /// Symbolic address of the location.
    pub base: SymbolicExpr,
    /// Width of the value in bits.
    pub bit_count: u32,
}

/// What a variable refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableKind {
    /// A register slice.
    Register(RegisterDesc),
    /// A memory location.
    Memory(MemoryVariable),
}

/// A symbolic variable: a register slice or memory location at a binding point.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicVariable {
    /// Binding point of the value.
    pub at: Origin,
    /// Referent of the variable.
    pub kind: VariableKind,
}

impl SymbolicVariable {
    /// Creates a register variable.
    #[must_use]
    pub fn register(at: Origin, desc: RegisterDesc) -> Self {
        SymbolicVariable {
            at,
            kind: VariableKind::Register(desc),
        }
    }

    /// Creates a memory variable.
    #[must_use]
    pub fn memory(at: Origin, base: SymbolicExpr, bit_count: u32) -> Self {
        SymbolicVariable {
            at,
            kind: VariableKind::Memory(MemoryVariable { base, bit_count }),
        }
    }

    /// Width of the variable's value in bits.
    #[must_use]
    pub fn bit_count(&self) -> u32 {
        match &self.kind {
            VariableKind::Register(r) => r.bit_count,
            VariableKind::Memory(m) => m.bit_count,
        }
    }

    /// Checks if this variable names a memory location.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self.kind, VariableKind::Memory(_))
    }

    /// Returns the memory referent, if any.
    #[must_use]
    pub fn mem(&self) -> Option<&MemoryVariable> {
        match &self.kind {
            VariableKind::Memory(m) => Some(m),
            VariableKind::Register(_) => None,
        }
    }

    /// Returns the register referent, if any.
    #[must_use]
    pub fn reg(&self) -> Option<&RegisterDesc> {
        match &self.kind {
            VariableKind::Register(r) => Some(r),
            VariableKind::Memory(_) => None,
        }
    }

    /// Rebuilds a memory variable around a new base address, preserving the binding
    /// point and width. For register variables this is an identity clone.
    #[must_use]
    pub fn with_base(&self, base: SymbolicExpr) -> Self {
        match &self.kind {
            VariableKind::Memory(m) => SymbolicVariable::memory(self.at, base, m.bit_count),
            VariableKind::Register(_) => self.clone(),
        }
    }

    /// Structural hash of the variable, stable across clones.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut h = splitmix64(self.at.vip ^ (self.at.index as u64).rotate_left(17));
        match &self.kind {
            VariableKind::Register(r) => {
                h ^= splitmix64(
                    u64::from(r.flags.bits())
                        | (u64::from(r.index) << 16)
                        | (u64::from(r.bit_offset) << 48)
                        | (u64::from(r.bit_count) << 56),
                );
            }
            VariableKind::Memory(m) => {
                h = h.rotate_left(32);
                h ^= splitmix64(m.base.hash() ^ u64::from(m.bit_count));
            }
        }
        splitmix64(h)
    }
}

impl fmt::Display for SymbolicVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            VariableKind::Register(r) => write!(f, "{r}@{}", self.at.index),
            VariableKind::Memory(m) => {
                write!(f, "[{}]#{}@{}", m.base, m.bit_count, self.at.index)
            }
        }
    }
}

/// Rewrites sliced-register arithmetic back into sub-register variables.
///
/// The symbolic stores hand out bit-exact values built from shifts and masks of whole
/// register variables. Before translation back to operand form those patterns are packed
/// into plain sub-register variables so they can be expressed as register operands
/// instead of computed through temporaries:
///
/// - `reg >> c`            becomes the slice `[c, width)` of `reg`, zero-extended
/// - `(reg >> c) & fill(n)` becomes the slice `[c, c + n)`, zero-extended
/// - `reg & fill(n)`        becomes the slice `[0, n)`, zero-extended
/// - a truncating cast of `reg` becomes the low slice of matching width
///
/// Memory-variable bases are packed recursively. Expressions without such patterns are
/// returned unchanged.
#[must_use]
pub fn pack_all(expr: &SymbolicExpr) -> SymbolicExpr {
    expr.transform(&mut |e| {
        let width = e.bit_count();
        match e.kind() {
            ExprKind::Binary { op, lhs, rhs } => {
                match op {
                    SymbolicOp::Shr => {
                        let c = rhs.as_u64()?;
                        let (var, reg) = register_leaf(lhs)?;
                        let c = u32::try_from(c).ok()?;
                        if c == 0 || c >= reg.bit_count {
                            return None;
                        }
                        let slice = reg.select(reg.bit_count - c, reg.bit_offset + c);
                        let packed =
                            SymbolicExpr::variable(SymbolicVariable::register(var.at, slice));
                        Some(packed.resize(width, false))
                    }
                    SymbolicOp::And => {
                        // The mask may sit on either side after canonicalization.
                        let (mask, value) = if rhs.is_constant() {
                            (rhs.as_u64()?, lhs)
                        } else {
                            (lhs.as_u64()?, rhs)
                        };
                        let n = low_fill_width(mask)?;
                        let (var, reg) = match value.kind() {
                            // (reg >> c) & fill(n)
                            ExprKind::Binary {
                                op: SymbolicOp::Shr,
                                lhs: inner,
                                rhs: amount,
                            } => {
                                let shift = u32::try_from(amount.as_u64()?).ok()?;
                                let (var, reg) = register_leaf(inner)?;
                                if shift == 0 || shift + n > reg.bit_count {
                                    return None;
                                }
                                (var.clone(), reg.select(n, reg.bit_offset + shift))
                            }
                            // reg & fill(n)
                            _ => {
                                let (var, reg) = register_leaf(value)?;
                                if n >= reg.bit_count {
                                    return None;
                                }
                                (var.clone(), reg.select(n, reg.bit_offset))
                            }
                        };
                        let packed =
                            SymbolicExpr::variable(SymbolicVariable::register(var.at, reg));
                        Some(packed.resize(width, false))
                    }
                    _ => None,
                }
            }
            ExprKind::Cast {
                signed: false,
                operand,
            } if width < operand.bit_count() => {
                let (var, reg) = register_leaf(operand)?;
                let slice = reg.select(width, reg.bit_offset);
                Some(SymbolicExpr::variable(SymbolicVariable::register(
                    var.at, slice,
                )))
            }
            _ => None,
        }
    })
}

/// Extracts a register variable leaf, looking through zero-extending casts.
fn register_leaf(expr: &SymbolicExpr) -> Option<(&SymbolicVariable, RegisterDesc)> {
    match expr.kind() {
        ExprKind::Variable(v) => v.reg().map(|r| (v, *r)),
        ExprKind::Cast {
            signed: false,
            operand,
        } if expr.bit_count() >= operand.bit_count() => register_leaf(operand),
        _ => None,
    }
}

/// If `mask` is a contiguous low-bit fill, returns its width.
fn low_fill_width(mask: u64) -> Option<u32> {
    if mask == 0 || (mask & mask.wrapping_add(1)) != 0 {
        return None;
    }
    Some(64 - mask.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RegisterDesc;

    fn origin() -> Origin {
        Origin { vip: 0x1000, index: 0 }
    }

    fn reg_var(bit_count: u32) -> SymbolicExpr {
        SymbolicExpr::variable(SymbolicVariable::register(
            origin(),
            RegisterDesc::virtual_reg(1, bit_count),
        ))
    }

    #[test]
    fn test_hash_distinguishes_origin() {
        let a = SymbolicVariable::register(origin(), RegisterDesc::virtual_reg(1, 64));
        let b = SymbolicVariable::register(
            Origin { vip: 0x1000, index: 3 },
            RegisterDesc::virtual_reg(1, 64),
        );
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn test_with_base_preserves_width_and_origin() {
        let base = reg_var(64);
        let var = SymbolicVariable::memory(origin(), base, 32);
        let new_base = reg_var(64);
        let rebuilt = var.with_base(new_base.clone());
        assert_eq!(rebuilt.bit_count(), 32);
        assert_eq!(rebuilt.at, var.at);
        assert!(rebuilt.mem().unwrap().base.equals(&new_base));
    }

    #[test]
    fn test_pack_shifted_register() {
        let e = &reg_var(64) >> &SymbolicExpr::constant(8, 64);
        let packed = pack_all(&e.simplify(false));
        // Expect a zero-extended slice [8, 64) of the register.
        let mut found = false;
        packed.enumerate(&mut |sub| {
            if let ExprKind::Variable(v) = sub.kind() {
                if let Some(r) = v.reg() {
                    if r.bit_offset == 8 && r.bit_count == 56 {
                        found = true;
                    }
                }
            }
        });
        assert!(found, "packed form should contain the slice: {packed}");
    }

    #[test]
    fn test_pack_masked_shift_to_single_bit() {
        let shifted = &reg_var(64) >> &SymbolicExpr::constant(6, 64);
        let bit = &shifted & &SymbolicExpr::constant(1, 64);
        let packed = pack_all(&bit.simplify(false));
        let mut found = false;
        packed.enumerate(&mut |sub| {
            if let ExprKind::Variable(v) = sub.kind() {
                if let Some(r) = v.reg() {
                    if r.bit_offset == 6 && r.bit_count == 1 {
                        found = true;
                    }
                }
            }
        });
        assert!(found, "packed form should contain the 1-bit slice: {packed}");
    }

    #[test]
    fn test_pack_leaves_unrelated_expressions() {
        let e = &reg_var(64) + &SymbolicExpr::constant(4, 64);
        let simplified = e.simplify(false);
        assert!(pack_all(&simplified).equals(&simplified));
    }
}

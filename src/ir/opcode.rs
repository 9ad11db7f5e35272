//! Opcode set and static descriptors for the virtual instruction list IR.
//!
//! Every opcode carries a descriptor describing its operand arity, how each operand is
//! accessed, and the traits the analyzer keys on: whether the instruction branches,
//! touches memory, is inherently volatile, or needs arithmetic wider than 64 bits.

use std::fmt;

use strum::{EnumCount, EnumIter};

/// How an instruction accesses one of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandAccess {
    /// Operand is only read; registers and immediates are both accepted.
    Read,
    /// Operand is written; must be a writable register.
    Write,
    /// Operand is read and then written; must be a writable register.
    ReadWrite,
}

/// The opcode of a virtual instruction.
///
/// Binary arithmetic uses two-operand read-modify-write form (`add d, s` computes
/// `d := d + s`). Comparisons (`te`..`tule`) write a 1-bit result into a separate
/// destination. `vemit` and `vpinstr` are opaque volatile instructions that the symbolic
/// VM cannot model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
#[allow(missing_docs)]
pub enum Op {
    Nop,
    // Data movement
    Mov,
    Movsx,
    Str,
    Ldd,
    // Arithmetic
    Neg,
    Add,
    Sub,
    Mul,
    Mulhi,
    Imul,
    Imulhi,
    Div,
    Idiv,
    Rem,
    Irem,
    // Bitwise
    Not,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Rol,
    Ror,
    // Comparisons (1-bit destination)
    Te,
    Tne,
    Tg,
    Tge,
    Tl,
    Tle,
    Tug,
    Tuge,
    Tul,
    Tule,
    // Control flow
    Js,
    Jmp,
    Vexit,
    Vxcall,
    // Opaque
    Vemit,
    Vpinstr,
}

impl Op {
    /// Returns the textual mnemonic of the opcode.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::Mov => "mov",
            Op::Movsx => "movsx",
            Op::Str => "str",
            Op::Ldd => "ldd",
            Op::Neg => "neg",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Mulhi => "mulhi",
            Op::Imul => "imul",
            Op::Imulhi => "imulhi",
            Op::Div => "div",
            Op::Idiv => "idiv",
            Op::Rem => "rem",
            Op::Irem => "irem",
            Op::Not => "not",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Rol => "rol",
            Op::Ror => "ror",
            Op::Te => "te",
            Op::Tne => "tne",
            Op::Tg => "tg",
            Op::Tge => "tge",
            Op::Tl => "tl",
            Op::Tle => "tle",
            Op::Tug => "tug",
            Op::Tuge => "tuge",
            Op::Tul => "tul",
            Op::Tule => "tule",
            Op::Js => "js",
            Op::Jmp => "jmp",
            Op::Vexit => "vexit",
            Op::Vxcall => "vxcall",
            Op::Vemit => "vemit",
            Op::Vpinstr => "vpinstr",
        }
    }

    /// Returns the access pattern of each operand, in operand order.
    #[must_use]
    pub fn operand_access(&self) -> &'static [OperandAccess] {
        use OperandAccess::{Read, ReadWrite, Write};
        match self {
            Op::Nop | Op::Vpinstr => &[],
            Op::Mov | Op::Movsx => &[Write, Read],
            // str base, offset, value
            Op::Str => &[Read, Read, Read],
            // ldd dest, base, offset
            Op::Ldd => &[Write, Read, Read],
            Op::Neg | Op::Not => &[ReadWrite],
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Mulhi
            | Op::Imul
            | Op::Imulhi
            | Op::Div
            | Op::Idiv
            | Op::Rem
            | Op::Irem
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Shl
            | Op::Shr
            | Op::Rol
            | Op::Ror => &[ReadWrite, Read],
            Op::Te
            | Op::Tne
            | Op::Tg
            | Op::Tge
            | Op::Tl
            | Op::Tle
            | Op::Tug
            | Op::Tuge
            | Op::Tul
            | Op::Tule => &[Write, Read, Read],
            // js cc, dst_taken, dst_fallthrough
            Op::Js => &[Read, Read, Read],
            Op::Jmp | Op::Vexit | Op::Vxcall | Op::Vemit => &[Read],
        }
    }

    /// Checks if this opcode transfers control.
    #[must_use]
    pub fn is_branching(&self) -> bool {
        matches!(self, Op::Js | Op::Jmp | Op::Vexit | Op::Vxcall)
    }

    /// Checks if this opcode reads memory.
    #[must_use]
    pub fn reads_memory(&self) -> bool {
        matches!(self, Op::Ldd)
    }

    /// Checks if this opcode writes memory.
    #[must_use]
    pub fn writes_memory(&self) -> bool {
        matches!(self, Op::Str)
    }

    /// Checks if this opcode is inherently volatile (never modelable symbolically).
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        matches!(self, Op::Vemit | Op::Vpinstr)
    }

    /// Checks if this opcode needs an intermediate wider than 64 bits.
    #[must_use]
    pub fn is_high_arithmetic(&self) -> bool {
        matches!(self, Op::Mulhi | Op::Imulhi)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_descriptor_consistency() {
        for op in Op::iter() {
            // Branching opcodes never write registers.
            if op.is_branching() {
                assert!(op
                    .operand_access()
                    .iter()
                    .all(|a| *a == OperandAccess::Read));
            }
            // Memory traits are mutually exclusive here.
            assert!(!(op.reads_memory() && op.writes_memory()));
        }
    }

    #[test]
    fn test_branching_set() {
        assert!(Op::Jmp.is_branching());
        assert!(Op::Js.is_branching());
        assert!(Op::Vexit.is_branching());
        assert!(Op::Vxcall.is_branching());
        assert!(!Op::Mov.is_branching());
    }

    #[test]
    fn test_volatile_set() {
        assert!(Op::Vemit.is_volatile());
        assert!(Op::Vpinstr.is_volatile());
        assert!(!Op::Str.is_volatile());
    }

    #[test]
    fn test_mnemonics_unique() {
        let mut seen = std::collections::HashSet::new();
        for op in Op::iter() {
            assert!(seen.insert(op.mnemonic()), "duplicate {}", op.mnemonic());
        }
    }
}

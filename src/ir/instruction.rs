//! Checked instruction construction and accessors.
//!
//! An [`Instruction`] couples an opcode with validated operands and the stack tracking
//! state (`sp_offset`, `sp_index`) stamped by the owning block at append time. Validation
//! happens at construction so downstream passes can rely on descriptor/operand agreement.

use std::fmt;

use crate::{
    ir::{
        opcode::{Op, OperandAccess},
        operand::Operand,
        register::RegisterDesc,
    },
    Error, Result,
};

/// A single virtual instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The opcode.
    pub op: Op,
    /// Validated operand list matching the opcode descriptor.
    pub operands: Vec<Operand>,
    /// Stack pointer displacement at this instruction, relative to instance `sp_index`.
    pub sp_offset: i64,
    /// Instance index of the stack pointer this instruction references.
    pub sp_index: u32,
    /// Explicitly volatile, beyond what the opcode implies.
    pub explicit_volatile: bool,
}

impl Instruction {
    /// Creates a new instruction after validating the operands against the opcode
    /// descriptor.
    ///
    /// # Arguments
    ///
    /// * `op` - The opcode.
    /// * `operands` - Operand list; count and kinds must match [`Op::operand_access`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInstruction`] if the operand count is wrong, a written
    /// operand is not a writable register, or an operand has zero width.
    pub fn new(op: Op, operands: Vec<Operand>) -> Result<Self> {
        let access = op.operand_access();
        if operands.len() != access.len() {
            return Err(Error::InvalidInstruction {
                message: format!(
                    "{} expects {} operands, got {}",
                    op,
                    access.len(),
                    operands.len()
                ),
            });
        }
        for (i, (operand, access)) in operands.iter().zip(access).enumerate() {
            if operand.bit_count() == 0 || operand.bit_count() > 64 {
                return Err(Error::InvalidOperand {
                    message: format!("operand {i} of {op} has width {}", operand.bit_count()),
                });
            }
            if matches!(*access, OperandAccess::Write | OperandAccess::ReadWrite) {
                match operand {
                    Operand::Register(r) if r.is_read_only() => {
                        return Err(Error::InvalidInstruction {
                            message: format!("{op} writes read-only register {r}"),
                        });
                    }
                    Operand::Register(_) => {}
                    Operand::Immediate(_) => {
                        return Err(Error::InvalidInstruction {
                            message: format!("{op} writes immediate operand {i}"),
                        });
                    }
                }
            }
        }
        // Memory displacement operands must be immediates.
        if let Some((_, disp)) = memory_operand_indices(op) {
            if !operands[disp].is_immediate() {
                return Err(Error::InvalidInstruction {
                    message: format!("{op} displacement operand must be an immediate"),
                });
            }
        }
        Ok(Instruction {
            op,
            operands,
            sp_offset: 0,
            sp_index: 0,
            explicit_volatile: false,
        })
    }

    /// Checks whether this instruction is volatile, either by opcode or explicitly.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.op.is_volatile() || self.explicit_volatile
    }

    /// Marks the instruction explicitly volatile and returns it.
    #[must_use]
    pub fn volatile(mut self) -> Self {
        self.explicit_volatile = true;
        self
    }

    /// Returns the memory location accessed by this instruction, if any, as
    /// `(base register, displacement)`.
    #[must_use]
    pub fn memory_location(&self) -> Option<(&RegisterDesc, i64)> {
        let (base, disp) = memory_operand_indices(self.op)?;
        let reg = self.operands[base].reg()?;
        let imm = self.operands[disp].immediate()?;
        Some((reg, imm.value))
    }

    /// Returns a mutable handle on the displacement of the accessed memory location.
    #[must_use]
    pub fn memory_displacement_mut(&mut self) -> Option<&mut i64> {
        let (_, disp) = memory_operand_indices(self.op)?;
        match &mut self.operands[disp] {
            Operand::Immediate(i) => Some(&mut i.value),
            Operand::Register(_) => None,
        }
    }

    /// Checks whether this instruction writes the given register identity through a
    /// non-branching destination operand.
    #[must_use]
    pub fn writes_register(&self, desc: &RegisterDesc) -> bool {
        if self.op.is_branching() {
            return false;
        }
        self.operands
            .iter()
            .zip(self.op.operand_access())
            .any(|(operand, access)| {
                matches!(*access, OperandAccess::Write | OperandAccess::ReadWrite)
                    && operand.reg().is_some_and(|r| r.id() == desc.id())
            })
    }
}

/// Operand indices of `(base, displacement)` for memory-touching opcodes.
fn memory_operand_indices(op: Op) -> Option<(usize, usize)> {
    match op {
        Op::Str => Some((0, 1)),
        Op::Ldd => Some((1, 2)),
        _ => None,
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.mnemonic())?;
        for (i, operand) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {operand}")?;
            } else {
                write!(f, ", {operand}")?;
            }
        }
        Ok(())
    }
}

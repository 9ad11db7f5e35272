//! Virtual instruction list IR: registers, operands, opcodes, instructions, and blocks.
//!
//! This is the representation the symbolic analyzer consumes and re-emits. The design
//! follows the usual virtual instruction list shape: a small RISC-like opcode set with
//! bit-granular register slices, explicit memory instructions addressed as
//! `base + displacement`, and stack pointer tracking threaded through every instruction
//! so stack slots can be addressed relative to the block entry.

mod block;
mod instruction;
mod opcode;
mod operand;
mod register;

pub use block::{BasicBlock, InstrIter, RoutineId};
pub use instruction::Instruction;
pub use opcode::{Op, OperandAccess};
pub use operand::{Immediate, Operand};
pub use register::{RegisterDesc, RegisterFlags, RegisterId};

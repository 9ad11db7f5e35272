use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers the error conditions that can occur while constructing, validating, and
/// rewriting virtual instruction list IR. Modeling outcomes of the symbolic virtual machine
/// (alias failures, un-modelable instructions) are **not** errors; they are ordinary values of
/// [`crate::analysis::VmExitReason`] and drive segmentation instead of failing.
///
/// # Error Categories
///
/// ## IR Construction Errors
/// - [`Error::InvalidInstruction`] - Operand list does not match the opcode descriptor
/// - [`Error::InvalidOperand`] - An operand is malformed (zero width, bad span, wrong kind)
///
/// ## Analysis Errors
/// - [`Error::StaleAnalysis`] - An analysis was applied to a block it was not built from
/// - [`Error::LockError`] - Thread synchronization failure in the shared analysis cache
///
/// # Examples
///
/// ```rust
/// use vmscope::ir::{BasicBlock, RoutineId};
///
/// let mut block = BasicBlock::new(RoutineId(1), 0x1000);
/// let r0 = block.tmp(64);
///
/// // Emitting through the checked builders surfaces IR errors early.
/// match block.jmp(r0) {
///     Ok(_) => {}
///     Err(e) => eprintln!("emission failed: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The operand list handed to an instruction constructor does not match its opcode.
    ///
    /// Raised when the operand count is wrong, a write destination is an immediate or a
    /// read-only register, or a displacement operand of a memory instruction is not an
    /// immediate. The message names the opcode and the offending operand.
    #[error("Invalid instruction - {message}")]
    InvalidInstruction {
        /// Description of the mismatch between opcode descriptor and operands
        message: String,
    },

    /// A single operand is malformed independent of any instruction context.
    ///
    /// Covers zero-width immediates, register spans exceeding 64 bits, and similar
    /// structural defects.
    #[error("Invalid operand - {message}")]
    InvalidOperand {
        /// Description of the structural defect
        message: String,
    },

    /// A cached analysis was asked to rewrite a block it was not computed from.
    ///
    /// `update` records the entry address of the analyzed block; `reemit` refuses to
    /// materialize into a block with a different entry.
    #[error("Stale analysis - built from block {expected:#x}, applied to {actual:#x}")]
    StaleAnalysis {
        /// Entry address the analysis was built from
        expected: u64,
        /// Entry address of the block the caller passed in
        actual: u64,
    },

    /// A lock required for the operation was poisoned by a panicking thread.
    #[error("Failed to acquire lock for synchronized analysis access")]
    LockError,
}

/// Specialized `Result` type with [`crate::Error`] as the error variant, used throughout
/// the crate.
pub type Result<T> = std::result::Result<T, Error>;

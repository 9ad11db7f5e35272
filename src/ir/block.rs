//! Basic blocks of the virtual instruction list.
//!
//! A [`BasicBlock`] owns an ordered instruction sequence together with the stack tracking
//! state the IR threads through it: the running stack pointer displacement (`sp_offset`),
//! the stack pointer instance counter (`sp_index`, bumped whenever an instruction writes
//! `$sp` directly), and the allocator counter for block-local temporaries.
//!
//! Instructions are appended through checked emitters. The *policy* append stamps the
//! block's current stack state onto the instruction and applies the stack pointer
//! instancing rule; the *non-policy* append ([`BasicBlock::push_raw`]) preserves the
//! instruction's own stamps and is used when replaying instructions that were already
//! normalized, such as segment suffixes.

use std::fmt;

use crate::{
    ir::{
        instruction::Instruction,
        opcode::Op,
        operand::Operand,
        register::RegisterDesc,
    },
    Result,
};

/// Identity of the routine owning a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutineId(pub u64);

/// A straight-line instruction sequence ending in at most one branch.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Routine this block belongs to.
    pub owner: RoutineId,
    /// Virtual instruction pointer of the block entry.
    pub entry_vip: u64,
    /// The instruction sequence.
    instructions: Vec<Instruction>,
    /// Stack pointer displacement at the block tail.
    pub sp_offset: i64,
    /// Stack pointer instance counter at the block tail.
    pub sp_index: u32,
    /// Allocation counter for block-local temporaries.
    pub last_temporary_index: u32,
}

impl BasicBlock {
    /// Creates an empty block.
    #[must_use]
    pub fn new(owner: RoutineId, entry_vip: u64) -> Self {
        BasicBlock {
            owner,
            entry_vip,
            instructions: Vec::new(),
            sp_offset: 0,
            sp_index: 0,
            last_temporary_index: 0,
        }
    }

    /// Number of instructions in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Checks if the block has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Returns the instruction at `index`, if in bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    /// Returns the instruction sequence.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns an iterator over the instructions.
    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Returns a cursor at the given instruction index.
    #[must_use]
    pub fn at(&self, index: usize) -> InstrIter<'_> {
        InstrIter { block: self, index }
    }

    /// Allocates a fresh block-local temporary of the given width.
    #[must_use]
    pub fn tmp(&mut self, bit_count: u32) -> RegisterDesc {
        self.last_temporary_index += 1;
        RegisterDesc::temporary(self.last_temporary_index, bit_count)
    }

    /// Appends an instruction under the stack tracking policy.
    ///
    /// The block's current `sp_offset`/`sp_index` are stamped onto the instruction. If
    /// the instruction writes the stack pointer directly, subsequent instructions
    /// reference a new stack pointer instance with a reset displacement.
    pub fn push(&mut self, mut instruction: Instruction) {
        instruction.sp_offset = self.sp_offset;
        instruction.sp_index = self.sp_index;
        let resets_sp = instruction.writes_register(&RegisterDesc::stack_pointer());
        self.instructions.push(instruction);
        if resets_sp {
            self.sp_index += 1;
            self.sp_offset = 0;
        }
    }

    /// Appends an instruction without normalization, preserving its own stack stamps.
    pub fn push_raw(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Shifts the stack pointer by a compile-time constant.
    pub fn shift_sp(&mut self, delta: i64) {
        self.sp_offset += delta;
    }

    /// Replaces this block's contents and stack state with another block's, keeping the
    /// identity (`owner`, `entry_vip`) of `self`.
    pub fn assign(&mut self, other: BasicBlock) {
        self.instructions = other.instructions;
        self.sp_offset = other.sp_offset;
        self.sp_index = other.sp_index;
        self.last_temporary_index = other.last_temporary_index;
    }

    /// Validates, stamps, and appends an instruction built from raw parts.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInstruction`] if the operands do not match the
    /// opcode descriptor.
    pub fn emplace(&mut self, op: Op, operands: Vec<Operand>) -> Result<&mut Self> {
        let instruction = Instruction::new(op, operands)?;
        self.push(instruction);
        Ok(self)
    }

    /// Emits `mov dest, src`.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn mov(
        &mut self,
        dest: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<&mut Self> {
        self.emplace(Op::Mov, vec![dest.into(), src.into()])
    }

    /// Emits `movsx dest, src` (sign-extending move).
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn movsx(
        &mut self,
        dest: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<&mut Self> {
        self.emplace(Op::Movsx, vec![dest.into(), src.into()])
    }

    /// Emits `str base, offset, value`, storing `value` at `[base + offset]`.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn str(
        &mut self,
        base: impl Into<Operand>,
        offset: i64,
        value: impl Into<Operand>,
    ) -> Result<&mut Self> {
        self.emplace(
            Op::Str,
            vec![base.into(), Operand::imm(offset, 64), value.into()],
        )
    }

    /// Emits `ldd dest, base, offset`, loading `dest` from `[base + offset]`.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn ldd(
        &mut self,
        dest: impl Into<Operand>,
        base: impl Into<Operand>,
        offset: i64,
    ) -> Result<&mut Self> {
        self.emplace(
            Op::Ldd,
            vec![dest.into(), base.into(), Operand::imm(offset, 64)],
        )
    }

    /// Emits a two-operand arithmetic or bitwise instruction `op dest, src`.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn arith(
        &mut self,
        op: Op,
        dest: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<&mut Self> {
        self.emplace(op, vec![dest.into(), src.into()])
    }

    /// Emits `jmp target`.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn jmp(&mut self, target: impl Into<Operand>) -> Result<&mut Self> {
        self.emplace(Op::Jmp, vec![target.into()])
    }

    /// Emits `js cc, taken, fallthrough`.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn js(
        &mut self,
        cc: impl Into<Operand>,
        taken: impl Into<Operand>,
        fallthrough: impl Into<Operand>,
    ) -> Result<&mut Self> {
        self.emplace(Op::Js, vec![cc.into(), taken.into(), fallthrough.into()])
    }

    /// Emits `vexit target`, leaving virtualized execution.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn vexit(&mut self, target: impl Into<Operand>) -> Result<&mut Self> {
        self.emplace(Op::Vexit, vec![target.into()])
    }

    /// Emits `vxcall target`, calling out of virtualized execution.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn vxcall(&mut self, target: impl Into<Operand>) -> Result<&mut Self> {
        self.emplace(Op::Vxcall, vec![target.into()])
    }
}

impl std::ops::Index<usize> for BasicBlock {
    type Output = Instruction;

    fn index(&self, index: usize) -> &Instruction {
        &self.instructions[index]
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {:#x}:", self.entry_vip)?;
        for ins in &self.instructions {
            writeln!(f, "  {ins}")?;
        }
        Ok(())
    }
}

/// A cheap cursor into a block's instruction sequence.
///
/// Carries the owning block and an index; dereferencing past the end is represented by
/// [`InstrIter::is_end`] rather than a sentinel instruction.
#[derive(Debug, Clone, Copy)]
pub struct InstrIter<'a> {
    block: &'a BasicBlock,
    index: usize,
}

impl<'a> InstrIter<'a> {
    /// The block this cursor points into.
    #[must_use]
    pub fn block(&self) -> &'a BasicBlock {
        self.block
    }

    /// Index of the referenced instruction.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Checks if the cursor is one past the last instruction.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.index >= self.block.len()
    }

    /// The referenced instruction; `None` at the end position.
    #[must_use]
    pub fn instr(&self) -> Option<&'a Instruction> {
        self.block.get(self.index)
    }

    /// Returns a cursor advanced by one instruction.
    #[must_use]
    pub fn next(&self) -> InstrIter<'a> {
        InstrIter {
            block: self.block,
            index: self.index + 1,
        }
    }
}

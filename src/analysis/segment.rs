//! Symbolic segments: the unit of modeled execution.
//!
//! A [`SymbolicSegment`] is a maximal contiguous run of block instructions whose effects
//! the symbolic VM captured without an alias or modeling failure, together with the
//! machine state accumulated over that run, the live-in references the run consumed, the
//! suffix of un-modelable instructions to replay after it, and (for stream-end
//! segments) the recorded branch facts.
//!
//! The segment itself implements [`SymbolicVm`]: reads consult the stores and fall back
//! to symbolic initial values bound at `segment_begin`, tracking every bit read before
//! being written; `execute` intercepts branches and volatile instructions before
//! delegating to the generic dispatch.

use std::collections::BTreeMap;

use crate::{
    analysis::vm::{self, execute_default, SymbolicVm, VmExitReason},
    ir::{BasicBlock, Instruction, Op, Operand, RegisterDesc, RegisterId},
    symbolic::{
        fill, MemoryStore, Origin, Pointer, RegisterStore, SymbolicExpr, SymbolicVariable,
    },
};

/// One segment of a block's symbolic analysis.
#[derive(Debug, Clone)]
pub struct SymbolicSegment {
    /// Index of the first modeled instruction.
    pub segment_begin: usize,
    /// Index one past the last instruction belonging to the segment (suffix included).
    pub segment_end: usize,
    /// Instructions inside the segment range that were not modeled and must be replayed
    /// literally after the modeled effects.
    pub suffix: Vec<usize>,
    /// Why the VM stopped; `None` while the segment is still being built.
    pub exit_reason: Option<VmExitReason>,

    /// Branch leaves virtualized execution (`vexit`/`vxcall`).
    pub is_branch_real: bool,
    /// Real branch is a `vexit` rather than a `vxcall`.
    pub is_branch_exiting: bool,
    /// Condition of a conditional branch, if any.
    pub branch_cc: Option<SymbolicExpr>,
    /// Branch targets; one for unconditional/real branches, two for conditional.
    pub branch_targets: Vec<SymbolicExpr>,

    /// Register state accumulated over the modeled instructions.
    pub register_state: RegisterStore,
    /// Memory state accumulated over the modeled instructions.
    pub memory_state: MemoryStore,

    /// Register bits read before being written, per register identity.
    pub register_references: BTreeMap<RegisterId, u64>,
    /// Memory bits read before being written, per pointer.
    pub memory_references: Vec<(Pointer, u64)>,

    origin: Origin,
}

impl SymbolicSegment {
    /// Creates an empty segment beginning at `begin` in `block`.
    #[must_use]
    pub fn new(block: &BasicBlock, begin: usize) -> Self {
        SymbolicSegment {
            segment_begin: begin,
            segment_end: begin,
            suffix: Vec::new(),
            exit_reason: None,
            is_branch_real: false,
            is_branch_exiting: false,
            branch_cc: None,
            branch_targets: Vec::new(),
            register_state: RegisterStore::new(),
            memory_state: MemoryStore::new(),
            register_references: BTreeMap::new(),
            memory_references: Vec::new(),
            origin: Origin {
                vip: block.entry_vip,
                index: begin,
            },
        }
    }

    /// The binding point of this segment's initial values.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Runs the VM over `block` from the segment's begin position.
    ///
    /// Returns the index one past the last consumed instruction and the exit reason.
    pub fn run(&mut self, block: &BasicBlock) -> (usize, VmExitReason) {
        vm::run(self, block, self.segment_begin)
    }

    /// Checks whether the segment modeled no state at all.
    #[must_use]
    pub fn is_state_empty(&self) -> bool {
        self.register_state.is_empty() && self.memory_state.is_empty()
    }

    /// The symbolic value a register had when the segment began.
    #[must_use]
    pub fn initial_register(&self, desc: &RegisterDesc) -> SymbolicExpr {
        SymbolicExpr::variable(SymbolicVariable::register(self.origin, *desc))
    }

    /// Reads a register from the segment state without reference tracking.
    ///
    /// This is the post-build read used by the re-emitter; live-in bookkeeping only
    /// applies to reads performed through the VM interface while the segment is built.
    #[must_use]
    pub fn register_value(&self, desc: &RegisterDesc) -> SymbolicExpr {
        self.register_state.read(desc, self.origin).0
    }

    /// Converts a branch operand into an expression.
    ///
    /// Registers are traced through the segment state (stack pointer reads include the
    /// instruction's displacement); immediates become constants of their declared width.
    fn convert_branch_operand(&mut self, ins: &Instruction, index: usize) -> SymbolicExpr {
        match &ins.operands[index] {
            Operand::Register(reg) => {
                let value = self.read_register(reg);
                if reg.is_stack_pointer() {
                    &value + ins.sp_offset
                } else {
                    value
                }
            }
            Operand::Immediate(imm) => SymbolicExpr::constant(imm.value, imm.bit_count),
        }
    }

    fn track_memory_reference(&mut self, ptr: &Pointer, mask: u64) {
        for (existing, bits) in &mut self.memory_references {
            if existing == ptr {
                *bits |= mask;
                return;
            }
        }
        self.memory_references.push((ptr.clone(), mask));
    }
}

impl SymbolicVm for SymbolicSegment {
    fn read_register(&mut self, desc: &RegisterDesc) -> SymbolicExpr {
        let (value, known) = self.register_state.read(desc, self.origin);
        let requested = desc.get_mask();
        if requested & !known != 0 {
            *self.register_references.entry(desc.id()).or_insert(0) |= requested & !known;
        }
        value
    }

    fn read_memory(&mut self, address: &SymbolicExpr, byte_count: u32) -> SymbolicExpr {
        let size = byte_count * 8;
        let ptr = Pointer::new(address);
        let (value, known) = self.memory_state.read(&ptr, size, self.origin);
        if fill(size) & !known != 0 {
            self.track_memory_reference(&ptr, fill(size) & !known);
        }
        value
    }

    fn write_register(&mut self, desc: &RegisterDesc, value: SymbolicExpr) {
        self.register_state.write(desc, value);
    }

    fn write_memory(&mut self, address: &SymbolicExpr, value: SymbolicExpr) -> bool {
        self.memory_state.write(Pointer::new(address), value)
    }

    fn execute(&mut self, ins: &Instruction) -> Option<VmExitReason> {
        // Branching instructions record facts without mutating state.
        if ins.op.is_branching() {
            match ins.op {
                Op::Vexit | Op::Vxcall => {
                    let target = self.convert_branch_operand(ins, 0);
                    self.branch_targets.push(target);
                    self.is_branch_real = true;
                    self.is_branch_exiting = ins.op == Op::Vexit;
                    self.branch_cc = None;
                }
                Op::Jmp => {
                    let target = self.convert_branch_operand(ins, 0);
                    self.branch_targets.push(target);
                    self.is_branch_real = false;
                    self.branch_cc = None;
                }
                Op::Js => {
                    let taken = self.convert_branch_operand(ins, 1);
                    let fallthrough = self.convert_branch_operand(ins, 2);
                    self.branch_targets.push(taken);
                    self.branch_targets.push(fallthrough);
                    self.is_branch_real = false;
                    self.branch_cc = Some(self.convert_branch_operand(ins, 0));
                }
                _ => unreachable!("branching opcode outside the enumerated set"),
            }
            return Some(VmExitReason::StreamEnd);
        }

        // Volatile instructions cannot be modeled.
        if ins.is_volatile() {
            return Some(VmExitReason::UnknownInstruction);
        }

        // Nor can instructions touching volatile registers, the undefined sink aside.
        for operand in &ins.operands {
            if let Operand::Register(reg) = operand {
                if reg.is_volatile() && !reg.is_undefined() {
                    return Some(VmExitReason::UnknownInstruction);
                }
            }
        }

        execute_default(self, ins)
    }
}

//! Per-block symbolic analysis: segmentation, pre-simplification, and re-emission.
//!
//! [`SymbolicAnalysis`] is the cached analysis of one basic block. `update` drives the
//! symbolic VM over the block and splits it into [`SymbolicSegment`]s wherever modeling
//! stops; `prepare` simplifies the stored expressions and recovers conditional branches
//! hidden inside arithmetized computed jumps; `reemit` materializes the post-state of
//! every segment back into IR, replacing the block with a semantically equivalent,
//! simplified rendition.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::{
    analysis::{
        segment::SymbolicSegment,
        translator::BatchTranslator,
        vm::VmExitReason,
    },
    ir::{BasicBlock, Instruction, Op, Operand, RegisterDesc, RegisterId},
    symbolic::{
        bit_enum, lsb, msb, pack_all, split_displacement, Pointer, SymbolicExpr,
    },
    Error, Result,
};

/// Tunables of the symbolic analyzer.
///
/// The defaults reproduce the canonical behavior; the knobs exist because the right
/// trade-offs are workload-dependent.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Maximum number of modified flag bits emitted as individual 1-bit moves.
    ///
    /// A partially modified flags register with at most this many changed bits is
    /// written bit by bit, preserving the untouched bits without a full read-modify-
    /// write. Beyond the threshold one aggregate move is cheaper.
    pub flags_mov_threshold: u32,

    /// Attempt to recover conditional branches from computed jumps during `prepare`.
    pub branch_recovery: bool,

    /// Minimum expression depth of a jump target before recovery is attempted.
    ///
    /// Constants and plain traced registers sit at depth 1; anything that could hide an
    /// arithmetized select is deeper.
    pub branch_recovery_min_depth: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            flags_mov_threshold: 4,
            branch_recovery: true,
            branch_recovery_min_depth: 2,
        }
    }
}

/// Cached symbolic analysis of a basic block.
///
/// # Example
///
/// ```rust
/// use vmscope::analysis::SymbolicAnalysis;
/// use vmscope::ir::{BasicBlock, Operand, RegisterDesc, RoutineId};
///
/// let mut block = BasicBlock::new(RoutineId(1), 0x1000);
/// let r0 = RegisterDesc::virtual_reg(0, 64);
/// block.mov(r0, Operand::imm(1, 64))?;
/// block.arith(vmscope::ir::Op::Add, r0, Operand::imm(2, 64))?;
/// block.vexit(r0)?;
///
/// let mut analysis = SymbolicAnalysis::new();
/// analysis.update(&block);
/// analysis.prepare(true);
/// analysis.reemit(&mut block)?;
///
/// // The arithmetic folded into a single constant move.
/// assert_eq!(block.len(), 2);
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct SymbolicAnalysis {
    config: AnalyzerConfig,
    segments: Vec<SymbolicSegment>,
    source_vip: Option<u64>,
    dirty: bool,
}

impl SymbolicAnalysis {
    /// Creates an analysis with default configuration.
    #[must_use]
    pub fn new() -> Self {
        SymbolicAnalysis::default()
    }

    /// Creates an analysis with an explicit configuration.
    #[must_use]
    pub fn with_config(config: AnalyzerConfig) -> Self {
        SymbolicAnalysis {
            config,
            ..SymbolicAnalysis::default()
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// The ordered segments of the last `update`.
    #[must_use]
    pub fn segments(&self) -> &[SymbolicSegment] {
        &self.segments
    }

    /// Iterates the segments in order.
    pub fn iter(&self) -> std::slice::Iter<'_, SymbolicSegment> {
        self.segments.iter()
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Checks if the analysis holds no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Checks whether downstream consumers must discard cached results.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flags the analysis as invalidated.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Union of every segment's register live-in bits.
    ///
    /// Reference maps are tracked per segment; callers that need a whole-block view
    /// union them explicitly through this accessor.
    #[must_use]
    pub fn register_references(&self) -> BTreeMap<RegisterId, u64> {
        let mut union: BTreeMap<RegisterId, u64> = BTreeMap::new();
        for seg in &self.segments {
            for (id, mask) in &seg.register_references {
                *union.entry(*id).or_insert(0) |= mask;
            }
        }
        union
    }

    /// Union of every segment's memory live-in bits.
    #[must_use]
    pub fn memory_references(&self) -> Vec<(Pointer, u64)> {
        let mut union: Vec<(Pointer, u64)> = Vec::new();
        for seg in &self.segments {
            for (ptr, mask) in &seg.memory_references {
                if let Some(entry) = union.iter_mut().find(|(p, _)| p == ptr) {
                    entry.1 |= mask;
                } else {
                    union.push((ptr.clone(), *mask));
                }
            }
        }
        union
    }

    /// Rebuilds the segmentation of `block`.
    ///
    /// Discards all previous segments, then repeatedly runs the symbolic VM: a stream
    /// end closes the final segment; an alias failure opens the next segment at the
    /// failing instruction; any other modeling stop appends the instruction to the
    /// current suffix, folding away segments that modeled no state, so only the first
    /// segment may be state-empty.
    pub fn update(&mut self, block: &BasicBlock) {
        self.segments.clear();
        self.source_vip = Some(block.entry_vip);
        self.dirty = false;

        let mut index = 0;
        while index < block.len() {
            let mut seg = SymbolicSegment::new(block, index);
            let (next, reason) = seg.run(block);
            seg.segment_end = next;
            seg.exit_reason = Some(reason);

            match reason {
                VmExitReason::StreamEnd => {
                    self.segments.push(seg);
                    break;
                }
                VmExitReason::AliasFailure => {
                    self.segments.push(seg);
                    index = next;
                }
                VmExitReason::HighArithmetic | VmExitReason::UnknownInstruction => {
                    index = next + 1;
                    // A stop with no modeled state only deserves its own segment at the
                    // very start of the block; otherwise the offending instruction rides
                    // along as suffix of the previous segment.
                    if seg.is_state_empty() && !self.segments.is_empty() {
                        let prev = self.segments.last_mut().expect("checked non-empty");
                        prev.suffix.push(next);
                        prev.segment_end = index;
                    } else {
                        seg.suffix.push(next);
                        seg.segment_end = index;
                        self.segments.push(seg);
                    }
                }
            }
        }
    }

    /// Pre-simplifies all stored expressions and recovers hidden conditional branches.
    ///
    /// Idempotent: a second call finds everything already in simplified form.
    pub fn prepare(&mut self, pack: bool) {
        for seg in &mut self.segments {
            for (_, value) in seg.register_state.iter_mut() {
                value.simplify(pack);
            }
            for (_, value) in seg.memory_state.iter_mut() {
                *value = value.simplify(pack);
            }

            if seg.branch_targets.is_empty() {
                continue;
            }
            for target in &mut seg.branch_targets {
                *target = target.simplify(true);
            }
            if let Some(cc) = &mut seg.branch_cc {
                *cc = cc.simplify(true);
            }

            if self.config.branch_recovery
                && seg.branch_cc.is_none()
                && seg.branch_targets.len() == 1
                && seg.branch_targets[0].depth() > self.config.branch_recovery_min_depth
            {
                recover_conditional(seg);
            }
        }
    }

    /// Emits equivalent code into `block`, replacing its contents.
    ///
    /// The block must be the one the analysis was built from. A fresh temporary block
    /// seeded with the original's identity is filled segment by segment (register
    /// writes, memory writes, stack adjustment, suffix replay, branch) and finally
    /// assigned over the input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleAnalysis`] when `block` is not the analyzed block, and
    /// propagates instruction validation failures from emission. Contract violations
    /// (malformed branch facts, writes to unwritable registers) panic.
    pub fn reemit(&mut self, block: &mut BasicBlock) -> Result<()> {
        let source = self.source_vip.unwrap_or(block.entry_vip);
        if source != block.entry_vip {
            return Err(Error::StaleAnalysis {
                expected: source,
                actual: block.entry_vip,
            });
        }

        let mut temporary = BasicBlock::new(block.owner, block.entry_vip);
        temporary.last_temporary_index = block.last_temporary_index;

        let sp = RegisterDesc::stack_pointer();
        let mut buffer: Vec<Instruction> = Vec::new();
        // Offset mapping the source stack frame into the temporary's current stack
        // pointer instance. Converting a dynamic constant-delta SP write into a static
        // shift skews the frames by that delta until the next dynamic write realigns
        // them.
        let mut frame_delta = 0i64;
        for seg in &self.segments {
            let mut translator = BatchTranslator::new();
            buffer.clear();

            // Register writes, stack pointer excluded.
            for (id, value) in seg.register_state.iter() {
                if value.bitmap == 0 || id.flags.contains(crate::ir::RegisterFlags::STACK_POINTER)
                {
                    continue;
                }
                let low = lsb(value.bitmap).expect("non-zero bitmap");
                let high = msb(value.bitmap).expect("non-zero bitmap");
                let key = RegisterDesc {
                    flags: id.flags,
                    index: id.index,
                    bit_count: high + 1 - low,
                    bit_offset: low,
                };

                // A lightly modified flags register is written bit by bit.
                if key.is_flags() && value.bitmap.count_ones() <= self.config.flags_mov_threshold
                {
                    let mut bits = Vec::new();
                    bit_enum(value.bitmap, |i| bits.push(i));
                    for i in bits {
                        let expr = pack_all(value.bit(i).expect("bitmap bit has entry"));
                        let operand = translator.translate(&mut temporary, &expr)?;
                        let operand = shield(&mut temporary, seg, operand)?;
                        buffer.push(Instruction::new(
                            Op::Mov,
                            vec![Operand::Register(key.select(1, i)), operand],
                        )?);
                    }
                    continue;
                }

                assert!(
                    !key.is_stack_pointer() && !key.is_read_only(),
                    "register write target must be writable"
                );
                let expr = pack_all(&seg.register_value(&key).simplify(true));
                let operand = translator.translate(&mut temporary, &expr)?;
                let operand = shield(&mut temporary, seg, operand)?;
                buffer.push(Instruction::new(
                    Op::Mov,
                    vec![Operand::Register(key), operand],
                )?);
            }

            // Memory writes.
            let sp_initial = Pointer::new(&seg.initial_register(&sp));
            for (ptr, value) in seg.memory_state.iter() {
                let packed = pack_all(value);
                let value_op = translator.translate(&mut temporary, &packed)?;
                let value_op = shield(&mut temporary, seg, value_op)?;

                if let Some(displacement) = ptr.sub(&sp_initial) {
                    buffer.push(Instruction::new(
                        Op::Str,
                        vec![
                            Operand::Register(sp),
                            Operand::imm(displacement, 64),
                            value_op,
                        ],
                    )?);
                    continue;
                }

                let mut base = pack_all(ptr.base());
                let mut offset = 0i64;
                if !base.is_constant() {
                    if let Some((stripped, displacement)) = split_displacement(&base) {
                        base = stripped;
                        offset = displacement;
                    }
                }
                let base_op = translator.translate(&mut temporary, &base)?;
                let base_op = shield(&mut temporary, seg, base_op)?;
                let base_op = translator.materialize(&mut temporary, base_op)?;
                buffer.push(Instruction::new(
                    Op::Str,
                    vec![base_op, Operand::imm(offset, 64), value_op],
                )?);
            }

            // Branch requirements become operands before the buffer lands.
            let mut target_ops = Vec::new();
            let mut cc_op = None;
            for target in &seg.branch_targets {
                let packed = pack_all(target);
                let operand = translator.translate(&mut temporary, &packed)?;
                target_ops.push(shield(&mut temporary, seg, operand)?);
            }
            if let Some(cc) = &seg.branch_cc {
                let packed = pack_all(cc);
                let operand = translator.translate(&mut temporary, &packed)?;
                cc_op = Some(shield(&mut temporary, seg, operand)?);
            }

            for ins in buffer.drain(..) {
                temporary.push(ins);
            }

            // Stack pointer change, preferring a static shift.
            if seg
                .register_state
                .get(&sp.id())
                .is_some_and(|v| v.bitmap != 0)
            {
                let new_sp = seg.register_value(&sp);
                let delta = (&new_sp - &seg.initial_register(&sp)).simplify(false);
                if let Some(d) = delta.as_i64() {
                    temporary.shift_sp(d);
                    frame_delta += d;
                } else {
                    let packed = pack_all(&new_sp.simplify(true));
                    let operand = translator.translate(&mut temporary, &packed)?;
                    let operand = shield(&mut temporary, seg, operand)?;
                    temporary.mov(sp, operand)?;
                    // The dynamic write realigns both frames at a fresh instance.
                    frame_delta = 0;
                }
            }

            // Replay the suffix, rebasing its stack bookkeeping.
            if let Some(&front) = seg.suffix.first() {
                let sp_index_d =
                    i64::from(temporary.sp_index) - i64::from(block[front].sp_index);
                for &idx in &seg.suffix {
                    let mut ins = block[idx].clone();
                    ins.sp_index = u32::try_from(i64::from(ins.sp_index) + sp_index_d)
                        .expect("stack instance rebasing stays non-negative");
                    ins.sp_offset += frame_delta;
                    if ins.op.reads_memory() {
                        let sp_based = ins
                            .memory_location()
                            .is_some_and(|(base, _)| base.is_stack_pointer());
                        if sp_based {
                            if let Some(disp) = ins.memory_displacement_mut() {
                                *disp += frame_delta;
                            }
                        }
                    }
                    let realigns = ins.writes_register(&sp);
                    let (sp_index, sp_offset) = (ins.sp_index, ins.sp_offset);
                    temporary.push_raw(ins);
                    if realigns {
                        // The replayed write opens the same fresh instance in both
                        // frames.
                        temporary.sp_index = sp_index + 1;
                        temporary.sp_offset = 0;
                        frame_delta = 0;
                    } else {
                        temporary.sp_index = sp_index;
                        temporary.sp_offset = sp_offset;
                    }
                }
            }

            // Mid-block stack state mirrors the source at the segment boundary.
            if seg.segment_end > seg.segment_begin {
                temporary.sp_offset = block[seg.segment_end - 1].sp_offset + frame_delta;
            }

            // Branch emission.
            if !target_ops.is_empty() {
                if seg.is_branch_real {
                    assert!(
                        seg.branch_cc.is_none() && target_ops.len() == 1,
                        "real branch carries exactly one target and no condition"
                    );
                    if seg.is_branch_exiting {
                        temporary.vexit(target_ops[0])?;
                    } else {
                        temporary.vxcall(target_ops[0])?;
                    }
                } else if seg.branch_cc.is_some() {
                    assert!(target_ops.len() == 2, "conditional branch has two targets");
                    match cc_op.expect("condition translated above") {
                        Operand::Register(cc) => {
                            temporary.js(cc, target_ops[0], target_ops[1])?;
                        }
                        Operand::Immediate(imm) => {
                            // Constant condition folds into the taken edge.
                            let target = if imm.as_u64() != 0 {
                                target_ops[0]
                            } else {
                                target_ops[1]
                            };
                            temporary.jmp(target)?;
                        }
                    }
                } else {
                    assert!(target_ops.len() == 1, "unconditional branch has one target");
                    temporary.jmp(target_ops[0])?;
                }
                temporary.sp_offset = block.sp_offset + frame_delta;
            }
        }

        // The rewrite invalidates every expression keyed on the old block content.
        self.mark_dirty();

        block.assign(temporary);
        Ok(())
    }

    /// Renders the per-segment state for inspection.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, seg) in self.segments.iter().enumerate() {
            let _ = writeln!(
                out,
                "[segment {i}: {}..{}]",
                seg.segment_begin, seg.segment_end
            );
            let _ = writeln!(out, "- # memory ops:   {}", seg.memory_state.len());
            let _ = writeln!(out, "- # register ops: {}", seg.register_state.len());
            let _ = writeln!(
                out,
                "- stack pointer:  {}",
                seg.register_value(&RegisterDesc::stack_pointer()).simplify(true)
            );
            for (ptr, value) in seg.memory_state.iter() {
                let _ = writeln!(out, "{ptr} => {value}");
            }
            for (id, mask) in &seg.register_references {
                let _ = writeln!(out, "ref: REG {id} & {mask:#x}");
            }
            for (ptr, mask) in &seg.memory_references {
                let _ = writeln!(out, "ref: MEM [{ptr}] & {mask:#x}");
            }
            match seg.exit_reason {
                Some(VmExitReason::StreamEnd) => {
                    let _ = writeln!(out, "exit due to stream end");
                    let kind = if seg.is_branch_real {
                        if seg.is_branch_exiting {
                            "real exit"
                        } else {
                            "real call"
                        }
                    } else {
                        "virtual branch"
                    };
                    match (&seg.branch_cc, seg.branch_targets.as_slice()) {
                        (Some(cc), [taken, fallthrough]) => {
                            let _ = writeln!(out, "{kind} => {cc} ? {taken} : {fallthrough}");
                        }
                        (_, targets) => {
                            let rendered: Vec<String> =
                                targets.iter().map(ToString::to_string).collect();
                            let _ = writeln!(out, "{kind} => {}", rendered.join(", "));
                        }
                    }
                }
                Some(reason) => {
                    let _ = writeln!(out, "exit due to {reason}");
                }
                None => {
                    let _ = writeln!(out, "exit reason not yet determined");
                }
            }
            for &idx in &seg.suffix {
                let _ = writeln!(out, " + suffix instruction {idx}");
            }
        }
        out
    }
}

/// Snapshots a bare register operand through a temporary when the segment overwrites it.
///
/// Buffered stores and the trailing branch consume their operands *after* the register
/// moves land; a source register that this segment also writes would be read stale.
/// Emitting the snapshot at translation time places it ahead of the buffer flush, where
/// the register still holds its segment-entry value.
fn shield(
    block: &mut BasicBlock,
    seg: &SymbolicSegment,
    operand: Operand,
) -> Result<Operand> {
    if let Operand::Register(reg) = operand {
        let clobbered = seg
            .register_state
            .get(&reg.id())
            .is_some_and(|v| v.bitmap & reg.get_mask() != 0);
        if clobbered {
            let tmp = block.tmp(reg.bit_count);
            block.mov(tmp, operand)?;
            return Ok(Operand::Register(tmp));
        }
    }
    Ok(operand)
}

/// Attempts to prove a computed jump is an arithmetized conditional branch.
///
/// Scans the sub-expressions of the single target (decaying through memory-variable
/// bases) for a proven 1-bit condition `e`. For each candidate, the target is rewritten
/// twice: once substituting `e = 1` (and its inverse with 0), once the other way
/// around, matching occurrences by value fingerprint before structural equality. The
/// candidate is accepted only when *both* rewrites simplified the target to a different
/// expression, at which point the segment becomes a conditional branch with the two
/// rewritten targets.
fn recover_conditional(seg: &mut SymbolicSegment) {
    let statement = seg.branch_targets[0].clone();
    let original_hash = statement.hash();

    let mut found: Option<(SymbolicExpr, SymbolicExpr, SymbolicExpr)> = None;
    statement.enumerate(&mut |candidate| {
        if found.is_some() || candidate.is_constant() || !candidate.is_one_bit() {
            return;
        }

        let approx = candidate.approximate();
        let inv_approx = approx.inverted();
        // The logical inverse of a 0-or-1 value, regardless of its storage width.
        let inverse = candidate ^ &SymbolicExpr::constant_u64(1, candidate.bit_count());

        let rewrite = |expected: bool| -> SymbolicExpr {
            statement
                .transform(&mut |node| {
                    if !node.is_one_bit() {
                        return None;
                    }
                    let node_approx = node.approximate();
                    if node_approx == approx && node.equals(candidate) {
                        Some(SymbolicExpr::constant_u64(
                            u64::from(expected),
                            node.bit_count(),
                        ))
                    } else if node_approx == inv_approx && node.equals(&inverse) {
                        Some(SymbolicExpr::constant_u64(
                            u64::from(!expected),
                            node.bit_count(),
                        ))
                    } else {
                        None
                    }
                })
                .simplify(true)
        };

        let taken = rewrite(true);
        let fallthrough = rewrite(false);
        if taken.hash() != original_hash && fallthrough.hash() != original_hash {
            found = Some((candidate.clone(), taken, fallthrough));
        }
    });

    if let Some((cc, taken, fallthrough)) = found {
        seg.branch_cc = Some(cc);
        seg.branch_targets = vec![taken, fallthrough];
    }
}

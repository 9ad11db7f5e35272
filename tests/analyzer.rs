//! Symbolic block analyzer integration tests.
//!
//! These tests drive the complete pipeline through the public API:
//! 1. Build a basic block with the checked emitters
//! 2. `update` - segment the block through the symbolic VM
//! 3. `prepare` - simplify and recover branches
//! 4. `reemit` - materialize the simplified block
//! 5. Verify segmentation invariants and end-to-end rewriting results

use vmscope::{
    analysis::{SymbolicAnalysis, SymbolicSegment, VmExitReason},
    ir::{BasicBlock, Op, Operand, RegisterDesc, RegisterFlags, RoutineId},
};

/// A full-width virtual register.
fn reg(index: u32) -> RegisterDesc {
    RegisterDesc::virtual_reg(index, 64)
}

/// A volatile register that the VM refuses to model.
fn volatile_reg(index: u32) -> RegisterDesc {
    let mut r = RegisterDesc::virtual_reg(index, 64);
    r.flags |= RegisterFlags::VOLATILE;
    r
}

/// A fresh block with a fixed identity.
fn block() -> BasicBlock {
    BasicBlock::new(RoutineId(1), 0x1000)
}

/// Runs the full `update → prepare → reemit` pipeline in place.
fn rewrite(block: &mut BasicBlock) -> SymbolicAnalysis {
    let mut analysis = SymbolicAnalysis::new();
    analysis.update(block);
    analysis.prepare(true);
    analysis.reemit(block).expect("reemit succeeds");
    analysis
}

/// Models a block that must fit into one stream-end segment.
fn single_segment_state(block: &BasicBlock) -> SymbolicSegment {
    let mut seg = SymbolicSegment::new(block, 0);
    let (_, reason) = seg.run(block);
    assert_eq!(reason, VmExitReason::StreamEnd);
    seg
}

/// Checks the segmentation invariants: exact iterator coverage in order, suffixes inside
/// their segment, and no foldable state-empty segment after the first.
fn assert_segmentation_invariants(analysis: &SymbolicAnalysis, block_len: usize) {
    let segments = analysis.segments();
    assert!(!segments.is_empty());
    assert_eq!(segments[0].segment_begin, 0);
    assert_eq!(segments.last().unwrap().segment_end, block_len);
    for pair in segments.windows(2) {
        assert_eq!(pair[0].segment_end, pair[1].segment_begin);
    }
    for (i, seg) in segments.iter().enumerate() {
        assert!(seg.segment_begin < seg.segment_end);
        for &idx in &seg.suffix {
            assert!(seg.segment_begin <= idx && idx < seg.segment_end);
        }
        let foldable = matches!(
            seg.exit_reason,
            Some(VmExitReason::UnknownInstruction) | Some(VmExitReason::HighArithmetic)
        );
        if i > 0 && foldable {
            assert!(!seg.is_state_empty(), "segment {i} should have been folded");
        }
    }
}

#[test]
fn test_pure_arithmetic_block_folds_to_constant() {
    let mut b = block();
    b.mov(reg(0), Operand::imm(1, 64)).unwrap();
    b.arith(Op::Add, reg(0), Operand::imm(2, 64)).unwrap();
    b.vexit(reg(0)).unwrap();

    let analysis = rewrite(&mut b);
    assert_eq!(analysis.len(), 1);
    assert_segmentation_invariants(&analysis, 3);

    // mov r0, 3 ; vexit 3
    assert_eq!(b.len(), 2);
    assert_eq!(b[0].op, Op::Mov);
    assert_eq!(b[0].operands[0], Operand::Register(reg(0)));
    assert_eq!(b[0].operands[1], Operand::imm(3, 64));
    assert_eq!(b[1].op, Op::Vexit);
    assert_eq!(b[1].operands[0], Operand::imm(3, 64));
}

#[test]
fn test_stack_spill_reload_forwards_value() {
    let sp = RegisterDesc::stack_pointer();
    let mut b = block();
    b.str(sp, -8, reg(1)).unwrap();
    b.ldd(reg(2), sp, -8).unwrap();
    b.vexit(reg(2)).unwrap();

    let analysis = rewrite(&mut b);
    assert_eq!(analysis.len(), 1);

    // The reload collapsed into a register move and the exit consumes r1 directly.
    assert_eq!(b.len(), 3);
    assert_eq!(b[0].op, Op::Mov);
    assert_eq!(b[0].operands[0], Operand::Register(reg(2)));
    assert_eq!(b[0].operands[1], Operand::Register(reg(1)));
    assert_eq!(b[1].op, Op::Str);
    let (base, disp) = b[1].memory_location().unwrap();
    assert!(base.is_stack_pointer());
    assert_eq!(disp, -8);
    assert_eq!(b[1].operands[2], Operand::Register(reg(1)));
    assert_eq!(b[2].op, Op::Vexit);
    assert_eq!(b[2].operands[0], Operand::Register(reg(1)));
}

#[test]
fn test_alias_failure_splits_segments() {
    let sp = RegisterDesc::stack_pointer();
    let mut b = block();
    b.str(sp, -8, Operand::imm(1, 64)).unwrap();
    b.str(reg(7), 0, Operand::imm(2, 64)).unwrap();
    b.ldd(reg(0), sp, -8).unwrap();
    b.vexit(reg(0)).unwrap();

    let mut analysis = SymbolicAnalysis::new();
    analysis.update(&b);
    assert_segmentation_invariants(&analysis, 4);

    assert_eq!(analysis.len(), 2);
    let first = &analysis.segments()[0];
    assert_eq!(first.exit_reason, Some(VmExitReason::AliasFailure));
    assert_eq!(first.segment_end, 1);
    assert_eq!(first.memory_state.len(), 1);
    assert!(first.suffix.is_empty());

    let second = &analysis.segments()[1];
    assert_eq!(second.segment_begin, 1);
    assert_eq!(second.exit_reason, Some(VmExitReason::StreamEnd));
    assert_eq!(second.memory_state.len(), 1);

    analysis.prepare(true);
    analysis.reemit(&mut b).unwrap();

    // Segment 1 materializes the stack store first; segment 2 re-expresses the
    // unrelated store and the load that could not see through it.
    assert_eq!(b[0].op, Op::Str);
    assert!(b[0].memory_location().unwrap().0.is_stack_pointer());
    let strs = b.iter().filter(|i| i.op == Op::Str).count();
    assert_eq!(strs, 2);
    assert!(b.iter().any(|i| i.op == Op::Ldd));
    assert_eq!(b[b.len() - 1].op, Op::Vexit);
}

#[test]
fn test_volatile_fence_becomes_suffix() {
    let mut b = block();
    b.mov(reg(0), Operand::imm(1, 64)).unwrap();
    b.emplace(Op::Vpinstr, vec![]).unwrap();
    b.mov(reg(1), reg(0)).unwrap();
    b.vexit(reg(1)).unwrap();

    let mut analysis = SymbolicAnalysis::new();
    analysis.update(&b);
    assert_segmentation_invariants(&analysis, 4);

    assert_eq!(analysis.len(), 2);
    let first = &analysis.segments()[0];
    assert_eq!(first.exit_reason, Some(VmExitReason::UnknownInstruction));
    assert_eq!(first.suffix, vec![1]);
    assert_eq!(first.segment_end, 2);

    analysis.prepare(true);
    analysis.reemit(&mut b).unwrap();

    // mov r0, 1 ; vpinstr ; mov r1, r0 ; vexit r0
    assert_eq!(b.len(), 4);
    assert_eq!(b[0].op, Op::Mov);
    assert_eq!(b[0].operands[1], Operand::imm(1, 64));
    assert_eq!(b[1].op, Op::Vpinstr);
    assert_eq!(b[2].op, Op::Mov);
    assert_eq!(b[2].operands[0], Operand::Register(reg(1)));
    assert_eq!(b[2].operands[1], Operand::Register(reg(0)));
    assert_eq!(b[3].op, Op::Vexit);
    assert_eq!(b[3].operands[0], Operand::Register(reg(0)));
}

#[test]
fn test_computed_jump_recovers_conditional_branch() {
    // jmp (cc*T1 + (1-cc)*T2) with a 1-bit cc register.
    let cc = RegisterDesc::virtual_reg(1, 1);
    let t_true = reg(2);
    let t_taken = reg(3);
    let one_minus = reg(4);
    let t_other = reg(5);

    let mut b = block();
    b.mov(t_true, cc).unwrap();
    b.mov(t_taken, Operand::imm(0x2000, 64)).unwrap();
    b.arith(Op::Mul, t_taken, t_true).unwrap();
    b.mov(one_minus, Operand::imm(1, 64)).unwrap();
    b.arith(Op::Sub, one_minus, t_true).unwrap();
    b.mov(t_other, Operand::imm(0x3000, 64)).unwrap();
    b.arith(Op::Mul, t_other, one_minus).unwrap();
    b.arith(Op::Add, t_taken, t_other).unwrap();
    b.jmp(t_taken).unwrap();

    let mut analysis = SymbolicAnalysis::new();
    analysis.update(&b);
    analysis.prepare(true);

    let seg = &analysis.segments()[0];
    assert!(seg.branch_cc.is_some(), "condition should be recovered");
    assert_eq!(seg.branch_targets.len(), 2);
    assert_eq!(seg.branch_targets[0].as_u64(), Some(0x2000));
    assert_eq!(seg.branch_targets[1].as_u64(), Some(0x3000));

    analysis.reemit(&mut b).unwrap();

    let last = &b[b.len() - 1];
    assert_eq!(last.op, Op::Js);
    assert!(last.operands[0].is_register());
    assert_eq!(last.operands[1], Operand::imm(0x2000, 64));
    assert_eq!(last.operands[2], Operand::imm(0x3000, 64));
}

#[test]
fn test_branch_recovery_equivalence_for_both_values() {
    // Recovery must pick targets equal to the computed jump evaluated at cc = 1 and
    // cc = 0 respectively; with constant targets that is directly checkable.
    let cc = RegisterDesc::virtual_reg(1, 1);
    let acc = reg(2);
    let zx = reg(3);
    let inv = reg(4);
    let other = reg(5);

    let mut b = block();
    b.mov(zx, cc).unwrap();
    b.mov(acc, Operand::imm(0x40, 64)).unwrap();
    b.arith(Op::Mul, acc, zx).unwrap();
    b.mov(inv, Operand::imm(1, 64)).unwrap();
    b.arith(Op::Sub, inv, zx).unwrap();
    b.mov(other, Operand::imm(0x80, 64)).unwrap();
    b.arith(Op::Mul, other, inv).unwrap();
    b.arith(Op::Add, acc, other).unwrap();
    b.jmp(acc).unwrap();

    let mut analysis = SymbolicAnalysis::new();
    analysis.update(&b);
    analysis.prepare(true);

    let seg = &analysis.segments()[0];
    // cc = 1 selects 0x40, cc = 0 selects 0x80.
    assert_eq!(seg.branch_targets[0].as_u64(), Some(0x40));
    assert_eq!(seg.branch_targets[1].as_u64(), Some(0x80));
}

#[test]
fn test_sp_shift_normalizes_dynamic_write() {
    let sp = RegisterDesc::stack_pointer();
    let mut b = block();
    b.arith(Op::Sub, sp, Operand::imm(16, 64)).unwrap();
    // A volatile load below the new stack top rides along as suffix.
    b.ldd(volatile_reg(9), sp, 8).unwrap();
    b.mov(reg(0), Operand::imm(1, 64)).unwrap();
    b.vexit(reg(0)).unwrap();

    let analysis = rewrite(&mut b);
    assert_eq!(analysis.len(), 2);

    // The dynamic subtraction became a static shift: no sub instruction remains and
    // the block tail reflects the displacement.
    assert!(b.iter().all(|i| i.op != Op::Sub));
    assert_eq!(b.sp_offset, -16);
    assert_eq!(b.sp_index, 0);

    // The replayed suffix load was rebased into the shifted frame.
    let load = &b[0];
    assert_eq!(load.op, Op::Ldd);
    assert_eq!(load.sp_offset, -16);
    assert_eq!(load.sp_index, 0);
    let (base, disp) = load.memory_location().unwrap();
    assert!(base.is_stack_pointer());
    assert_eq!(disp, -8);
}

#[test]
fn test_reemit_soundness_register_state() {
    // Drive the source and the re-emitted block through the same symbolic VM and
    // compare the final values of every architectural register the block touches.
    let mut b = block();
    b.mov(reg(0), reg(1)).unwrap();
    b.arith(Op::Add, reg(0), reg(2)).unwrap();
    b.arith(Op::Xor, reg(2), reg(0)).unwrap();
    b.arith(Op::Shl, reg(2), Operand::imm(3, 64)).unwrap();
    b.vexit(reg(2)).unwrap();

    let before = single_segment_state(&b);
    rewrite(&mut b);
    let after = single_segment_state(&b);

    for r in [reg(0), reg(2)] {
        let old = before.register_value(&r).simplify(true);
        let new = after.register_value(&r).simplify(true);
        assert!(
            old.equals(&new),
            "register {r} diverged: {old} vs {new}"
        );
    }
    let old_target = before.branch_targets[0].simplify(true);
    let new_target = after.branch_targets[0].simplify(true);
    assert!(old_target.equals(&new_target));
}

#[test]
fn test_reemit_soundness_memory_state() {
    let sp = RegisterDesc::stack_pointer();
    let mut b = block();
    b.str(sp, -8, reg(1)).unwrap();
    b.str(sp, -16, Operand::imm(7, 64)).unwrap();
    b.vexit(reg(0)).unwrap();

    let before = single_segment_state(&b);
    rewrite(&mut b);
    let after = single_segment_state(&b);

    let sp_initial_before = before.initial_register(&sp);
    let sp_initial_after = after.initial_register(&sp);
    assert_eq!(before.memory_state.len(), after.memory_state.len());
    for (ptr, value) in before.memory_state.iter() {
        let displacement = ptr
            .sub(&vmscope::symbolic::Pointer::new(&sp_initial_before))
            .expect("stack-relative entry");
        let found = after.memory_state.iter().find(|(p, _)| {
            p.sub(&vmscope::symbolic::Pointer::new(&sp_initial_after)) == Some(displacement)
        });
        let (_, new_value) = found.expect("entry preserved");
        assert!(value.simplify(true).equals(&new_value.simplify(true)));
    }
}

#[test]
fn test_rewriting_twice_preserves_semantics() {
    // A second rewrite may materialize different temporaries, but the architectural
    // state and the branch target must not move.
    let mut b = block();
    b.mov(reg(0), Operand::imm(5, 64)).unwrap();
    b.arith(Op::Add, reg(0), reg(1)).unwrap();
    b.vexit(reg(0)).unwrap();

    rewrite(&mut b);
    let first = single_segment_state(&b);
    let first_r0 = first.register_value(&reg(0)).simplify(true);
    let first_target = first.branch_targets[0].simplify(true);

    rewrite(&mut b);
    let second = single_segment_state(&b);
    let second_r0 = second.register_value(&reg(0)).simplify(true);
    let second_target = second.branch_targets[0].simplify(true);

    assert!(first_r0.equals(&second_r0));
    assert!(first_target.equals(&second_target));
}

#[test]
fn test_flags_bits_written_individually() {
    let flags = RegisterDesc::flags_reg();
    let mut b = block();
    // Two comparison results land in individual flag bits.
    b.emplace(
        Op::Te,
        vec![
            Operand::Register(flags.select(1, 6)),
            Operand::Register(reg(1)),
            Operand::Register(reg(2)),
        ],
    )
    .unwrap();
    b.emplace(
        Op::Tul,
        vec![
            Operand::Register(flags.select(1, 0)),
            Operand::Register(reg(1)),
            Operand::Register(reg(2)),
        ],
    )
    .unwrap();
    b.vexit(reg(0)).unwrap();

    let analysis = rewrite(&mut b);
    assert_eq!(analysis.len(), 1);

    // Two 1-bit moves into the flags register, not one wide read-modify-write.
    let flag_movs: Vec<_> = b
        .iter()
        .filter(|i| {
            i.op == Op::Mov
                && i.operands[0]
                    .reg()
                    .is_some_and(|r| r.is_flags() && r.bit_count == 1)
        })
        .collect();
    assert_eq!(flag_movs.len(), 2);
    let offsets: Vec<u32> = flag_movs
        .iter()
        .map(|i| i.operands[0].reg().unwrap().bit_offset)
        .collect();
    assert!(offsets.contains(&0) && offsets.contains(&6));
}

#[test]
fn test_high_arithmetic_rides_as_suffix() {
    let mut b = block();
    b.mov(reg(0), Operand::imm(3, 64)).unwrap();
    b.arith(Op::Mulhi, reg(1), reg(0)).unwrap();
    b.mov(reg(2), Operand::imm(4, 64)).unwrap();
    b.vexit(reg(2)).unwrap();

    let mut analysis = SymbolicAnalysis::new();
    analysis.update(&b);
    assert_segmentation_invariants(&analysis, 4);

    assert_eq!(analysis.len(), 2);
    let first = &analysis.segments()[0];
    assert_eq!(first.exit_reason, Some(VmExitReason::HighArithmetic));
    assert_eq!(first.suffix, vec![1]);

    analysis.prepare(true);
    analysis.reemit(&mut b).unwrap();
    assert!(b.iter().any(|i| i.op == Op::Mulhi));
    assert_eq!(b[b.len() - 1].op, Op::Vexit);
}

#[test]
fn test_whole_block_reference_union() {
    let mut b = block();
    b.arith(Op::Add, reg(0), reg(1)).unwrap();
    b.emplace(Op::Vpinstr, vec![]).unwrap();
    b.arith(Op::Add, reg(2), reg(3)).unwrap();
    b.vexit(reg(2)).unwrap();

    let mut analysis = SymbolicAnalysis::new();
    analysis.update(&b);

    let union = analysis.register_references();
    for r in [reg(0), reg(1), reg(3)] {
        assert_eq!(union.get(&r.id()), Some(&u64::MAX), "missing live-in {r}");
    }
}

#[test]
fn test_constant_condition_folds_to_unconditional_jump() {
    // A js whose condition traces to a constant re-emits as a jmp to the taken edge.
    let cc = RegisterDesc::virtual_reg(1, 1);
    let mut b = block();
    b.mov(cc, Operand::imm(1, 1)).unwrap();
    b.js(cc, Operand::imm(0x2000, 64), Operand::imm(0x3000, 64))
        .unwrap();

    rewrite(&mut b);

    let last = &b[b.len() - 1];
    assert_eq!(last.op, Op::Jmp);
    assert_eq!(last.operands[0], Operand::imm(0x2000, 64));
}

#[test]
fn test_overwritten_source_register_is_snapshotted() {
    // r1 reads r0's entry value while r0 itself is rewritten; the rewritten block must
    // still move the old value.
    let mut b = block();
    b.mov(reg(1), reg(0)).unwrap();
    b.mov(reg(0), Operand::imm(5, 64)).unwrap();
    b.vexit(reg(1)).unwrap();

    let before = single_segment_state(&b);
    rewrite(&mut b);
    let after = single_segment_state(&b);

    let old = before.register_value(&reg(1)).simplify(true);
    let new = after.register_value(&reg(1)).simplify(true);
    assert!(old.equals(&new), "r1 diverged: {old} vs {new}");
    let folded = after.register_value(&reg(0)).simplify(true);
    assert_eq!(folded.as_u64(), Some(5));
}

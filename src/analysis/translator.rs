//! Batch translation of symbolic expressions back into operand form.
//!
//! The [`BatchTranslator`] converts expressions into operands against a block under
//! construction, emitting whatever materialization instructions are needed (loads for
//! memory variables, arithmetic into temporaries for compound expressions) and caching
//! results so shared subtrees are materialized once.
//!
//! Inputs are expected to be packed first (see [`crate::symbolic::pack_all`]) so that
//! register slices arrive as plain sub-register variables rather than shift/mask
//! arithmetic.

use rustc_hash::FxHashMap;

use crate::{
    ir::{BasicBlock, Op, Operand},
    symbolic::{split_displacement, ExprKind, SymbolicExpr, SymbolicOp, VariableKind},
    Result,
};

/// Expression-to-operand translator bound to one re-emission pass.
#[derive(Debug, Default)]
pub struct BatchTranslator {
    cache: FxHashMap<u64, Operand>,
}

impl BatchTranslator {
    /// Creates an empty translator.
    #[must_use]
    pub fn new() -> Self {
        BatchTranslator::default()
    }

    /// Translates `expr` into an operand, emitting materialization code into `block`.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures from the emitted materialization code.
    pub fn translate(&mut self, block: &mut BasicBlock, expr: &SymbolicExpr) -> Result<Operand> {
        if let Some(operand) = self.cache.get(&expr.hash()) {
            return Ok(*operand);
        }
        let operand = match expr.kind() {
            ExprKind::Constant(_) => Operand::imm(
                expr.as_i64().expect("constant node"),
                expr.bit_count(),
            ),

            ExprKind::Variable(var) => match &var.kind {
                VariableKind::Register(reg) => Operand::Register(*reg),
                VariableKind::Memory(mem) => {
                    // Load the location into a temporary.
                    let (base_expr, displacement) = split_displacement(&mem.base)
                        .unwrap_or_else(|| (mem.base.clone(), 0));
                    let base = self.translate(block, &base_expr)?;
                    let base = self.materialize(block, base)?;
                    let dest = block.tmp(mem.bit_count);
                    block.ldd(dest, base, displacement)?;
                    Operand::Register(dest)
                }
            },

            ExprKind::Cast { signed, operand } => {
                let inner = self.translate(block, operand)?;
                let dest = block.tmp(expr.bit_count());
                if *signed {
                    block.movsx(dest, inner)?;
                } else {
                    block.mov(dest, inner)?;
                }
                Operand::Register(dest)
            }

            ExprKind::Unary { op, operand } => {
                let inner = self.translate(block, operand)?;
                let dest = block.tmp(expr.bit_count());
                block.mov(dest, inner)?;
                let opcode = match op {
                    SymbolicOp::Neg => Op::Neg,
                    SymbolicOp::Not => Op::Not,
                    _ => unreachable!("unary node carries a unary operation"),
                };
                block.emplace(opcode, vec![Operand::Register(dest)])?;
                Operand::Register(dest)
            }

            ExprKind::Binary { op, lhs, rhs } => {
                let lhs_op = self.translate(block, lhs)?;
                let rhs_op = self.translate(block, rhs)?;
                if op.is_comparison() {
                    let dest = block.tmp(1);
                    block.emplace(comparison_opcode(*op), vec![
                        Operand::Register(dest),
                        lhs_op,
                        rhs_op,
                    ])?;
                    Operand::Register(dest)
                } else {
                    let dest = block.tmp(expr.bit_count());
                    block.mov(dest, lhs_op)?;
                    block.arith(binary_opcode(*op), dest, rhs_op)?;
                    Operand::Register(dest)
                }
            }
        };
        self.cache.insert(expr.hash(), operand);
        Ok(operand)
    }

    /// Forces an operand into register form, emitting a `mov` for immediates.
    ///
    /// # Errors
    ///
    /// Propagates instruction validation failures.
    pub fn materialize(&mut self, block: &mut BasicBlock, operand: Operand) -> Result<Operand> {
        match operand {
            Operand::Register(_) => Ok(operand),
            Operand::Immediate(imm) => {
                let dest = block.tmp(imm.bit_count);
                block.mov(dest, operand)?;
                Ok(Operand::Register(dest))
            }
        }
    }
}

fn binary_opcode(op: SymbolicOp) -> Op {
    match op {
        SymbolicOp::Add => Op::Add,
        SymbolicOp::Sub => Op::Sub,
        SymbolicOp::Mul => Op::Mul,
        SymbolicOp::DivU => Op::Div,
        SymbolicOp::DivS => Op::Idiv,
        SymbolicOp::RemU => Op::Rem,
        SymbolicOp::RemS => Op::Irem,
        SymbolicOp::And => Op::And,
        SymbolicOp::Or => Op::Or,
        SymbolicOp::Xor => Op::Xor,
        SymbolicOp::Shl => Op::Shl,
        SymbolicOp::Shr => Op::Shr,
        SymbolicOp::Rol => Op::Rol,
        SymbolicOp::Ror => Op::Ror,
        _ => unreachable!("not expressible as a two-operand instruction"),
    }
}

fn comparison_opcode(op: SymbolicOp) -> Op {
    match op {
        SymbolicOp::Eq => Op::Te,
        SymbolicOp::Ne => Op::Tne,
        SymbolicOp::GtS => Op::Tg,
        SymbolicOp::GeS => Op::Tge,
        SymbolicOp::LtS => Op::Tl,
        SymbolicOp::LeS => Op::Tle,
        SymbolicOp::GtU => Op::Tug,
        SymbolicOp::GeU => Op::Tuge,
        SymbolicOp::LtU => Op::Tul,
        SymbolicOp::LeU => Op::Tule,
        _ => unreachable!("not a comparison"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{RegisterDesc, RoutineId},
        symbolic::{Origin, SymbolicVariable},
    };

    fn origin() -> Origin {
        Origin { vip: 0, index: 0 }
    }

    fn reg_var(i: u32) -> SymbolicExpr {
        SymbolicExpr::variable(SymbolicVariable::register(
            origin(),
            RegisterDesc::virtual_reg(i, 64),
        ))
    }

    #[test]
    fn test_constant_translates_to_immediate() {
        let mut block = BasicBlock::new(RoutineId(0), 0);
        let mut tr = BatchTranslator::new();
        let op = tr
            .translate(&mut block, &SymbolicExpr::constant(-8, 64))
            .unwrap();
        assert_eq!(op, Operand::imm(-8, 64));
        assert!(block.is_empty());
    }

    #[test]
    fn test_register_variable_translates_directly() {
        let mut block = BasicBlock::new(RoutineId(0), 0);
        let mut tr = BatchTranslator::new();
        let op = tr.translate(&mut block, &reg_var(3)).unwrap();
        assert_eq!(op, Operand::Register(RegisterDesc::virtual_reg(3, 64)));
        assert!(block.is_empty());
    }

    #[test]
    fn test_compound_expression_materializes() {
        let mut block = BasicBlock::new(RoutineId(0), 0);
        let mut tr = BatchTranslator::new();
        let e = (&reg_var(1) + &SymbolicExpr::constant(4, 64)).simplify(false);
        let op = tr.translate(&mut block, &e).unwrap();

        // mov tmp, r1; add tmp, 4
        assert_eq!(block.len(), 2);
        assert_eq!(block[0].op, Op::Mov);
        assert_eq!(block[1].op, Op::Add);
        assert!(op.is_register());
    }

    #[test]
    fn test_shared_subtree_translated_once() {
        let mut block = BasicBlock::new(RoutineId(0), 0);
        let mut tr = BatchTranslator::new();
        let e = (&reg_var(1) + &SymbolicExpr::constant(4, 64)).simplify(false);
        let a = tr.translate(&mut block, &e).unwrap();
        let emitted = block.len();
        let b = tr.translate(&mut block, &e).unwrap();
        assert_eq!(a, b);
        assert_eq!(block.len(), emitted);
    }

    #[test]
    fn test_memory_variable_emits_load() {
        let mut block = BasicBlock::new(RoutineId(0), 0);
        let mut tr = BatchTranslator::new();
        let address = (&reg_var(2) + &SymbolicExpr::constant(0x10, 64)).simplify(false);
        let load = SymbolicExpr::variable(SymbolicVariable::memory(origin(), address, 64));
        let op = tr.translate(&mut block, &load).unwrap();

        assert!(op.is_register());
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].op, Op::Ldd);
        let (base, disp) = block[0].memory_location().unwrap();
        assert_eq!(base.index, 2);
        assert_eq!(disp, 0x10);
    }

    #[test]
    fn test_comparison_translates_to_test_opcode() {
        let mut block = BasicBlock::new(RoutineId(0), 0);
        let mut tr = BatchTranslator::new();
        let e = SymbolicExpr::binary(SymbolicOp::Eq, reg_var(0), reg_var(1));
        let op = tr.translate(&mut block, &e).unwrap();

        assert_eq!(block.len(), 1);
        assert_eq!(block[0].op, Op::Te);
        assert_eq!(op.bit_count(), 1);
    }

    #[test]
    fn test_materialize_immediate() {
        let mut block = BasicBlock::new(RoutineId(0), 0);
        let mut tr = BatchTranslator::new();
        let op = tr
            .materialize(&mut block, Operand::imm(0x1000, 64))
            .unwrap();
        assert!(op.is_register());
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].op, Op::Mov);
    }
}

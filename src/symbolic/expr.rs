//! Symbolic expression trees.
//!
//! [`SymbolicExpr`] is an immutable, reference-counted expression of a fixed bit width.
//! Nodes precompute their structural hash, depth, and a [`KnownBits`] approximation at
//! construction, so sharing a subtree is free and equality checks are cheap.
//! Transformations never mutate in place; they produce new nodes and re-share unchanged
//! children.

use std::{fmt, sync::Arc};

use rustc_hash::FxHashMap;

use crate::symbolic::{
    bits::{fill, splitmix64, Approximation, KnownBits, APPROX_SEEDS},
    ops::SymbolicOp,
    variable::{SymbolicVariable, VariableKind},
};

/// Node payload of a symbolic expression.
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// A constant, masked to the node width.
    Constant(u64),
    /// A symbolic variable leaf.
    Variable(SymbolicVariable),
    /// A unary operation.
    Unary {
        /// The operation (Neg or Not).
        op: SymbolicOp,
        /// The operand.
        operand: SymbolicExpr,
    },
    /// A binary operation.
    Binary {
        /// The operation.
        op: SymbolicOp,
        /// The left operand.
        lhs: SymbolicExpr,
        /// The right operand.
        rhs: SymbolicExpr,
    },
    /// A resize to the node width.
    Cast {
        /// Sign-extending if true, zero-extending otherwise.
        signed: bool,
        /// The operand being resized.
        operand: SymbolicExpr,
    },
}

#[derive(Debug)]
struct ExprNode {
    kind: ExprKind,
    bit_count: u32,
    hash: u64,
    depth: u32,
    value: KnownBits,
}

/// An immutable, reference-counted symbolic expression of fixed bit width.
///
/// # Example
///
/// ```rust
/// use vmscope::symbolic::SymbolicExpr;
///
/// let a = SymbolicExpr::constant(5, 64);
/// let b = SymbolicExpr::constant(7, 64);
/// let sum = (&a + &b).simplify(false);
/// assert_eq!(sum.as_u64(), Some(12));
/// ```
#[derive(Clone, Debug)]
pub struct SymbolicExpr {
    node: Arc<ExprNode>,
}

impl SymbolicExpr {
    fn make(kind: ExprKind, bit_count: u32) -> Self {
        let (hash, depth, value) = analyze(&kind, bit_count);
        SymbolicExpr {
            node: Arc::new(ExprNode {
                kind,
                bit_count,
                hash,
                depth,
                value,
            }),
        }
    }

    /// Creates a constant expression of the given width.
    #[must_use]
    pub fn constant(value: i64, bit_count: u32) -> Self {
        Self::constant_u64(value as u64, bit_count)
    }

    /// Creates a constant expression from a raw bit pattern.
    #[must_use]
    pub fn constant_u64(value: u64, bit_count: u32) -> Self {
        Self::make(ExprKind::Constant(value & fill(bit_count)), bit_count)
    }

    /// Creates a variable expression; the width comes from the variable.
    #[must_use]
    pub fn variable(var: SymbolicVariable) -> Self {
        let width = var.bit_count();
        Self::make(ExprKind::Variable(var), width)
    }

    /// Creates a unary operation expression.
    #[must_use]
    pub fn unary(op: SymbolicOp, operand: SymbolicExpr) -> Self {
        let width = operand.bit_count();
        Self::make(ExprKind::Unary { op, operand }, width)
    }

    /// Creates a binary operation expression.
    ///
    /// Operand widths are normalized: shifts keep the left operand's width and resize
    /// the amount to it, comparisons produce a 1-bit result over the common operand
    /// width, and all other operations zero-extend the narrower operand.
    #[must_use]
    pub fn binary(op: SymbolicOp, lhs: SymbolicExpr, rhs: SymbolicExpr) -> Self {
        if op.is_shift() {
            let width = lhs.bit_count();
            let rhs = rhs.resize(width, false);
            return Self::make(ExprKind::Binary { op, lhs, rhs }, width);
        }
        let common = lhs.bit_count().max(rhs.bit_count());
        let lhs = lhs.resize(common, false);
        let rhs = rhs.resize(common, false);
        let width = if op.is_comparison() { 1 } else { common };
        Self::make(ExprKind::Binary { op, lhs, rhs }, width)
    }

    /// Resizes the expression to `bit_count`, zero- or sign-extending when growing.
    ///
    /// Constant operands fold immediately; a same-width resize is the identity.
    #[must_use]
    pub fn resize(&self, bit_count: u32, signed: bool) -> SymbolicExpr {
        if bit_count == self.bit_count() {
            return self.clone();
        }
        if let Some(v) = self.as_u64() {
            let widened = if signed && bit_count > self.bit_count() {
                sign_extend(v, self.bit_count())
            } else {
                v
            };
            return Self::constant_u64(widened, bit_count);
        }
        Self::make(
            ExprKind::Cast {
                signed,
                operand: self.clone(),
            },
            bit_count,
        )
    }

    /// The node payload.
    #[must_use]
    pub fn kind(&self) -> &ExprKind {
        &self.node.kind
    }

    /// Width of the expression in bits.
    #[must_use]
    pub fn bit_count(&self) -> u32 {
        self.node.bit_count
    }

    /// Structural hash of the expression.
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.node.hash
    }

    /// Height of the expression tree (leaves have depth 1).
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.node.depth
    }

    /// Known-bit information computed at construction.
    #[must_use]
    pub fn value(&self) -> KnownBits {
        self.node.value
    }

    /// Checks if this expression is a constant node.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.node.kind, ExprKind::Constant(_))
    }

    /// Checks if this expression is a variable leaf.
    #[must_use]
    pub fn is_variable(&self) -> bool {
        matches!(self.node.kind, ExprKind::Variable(_))
    }

    /// Returns the variable, if this is a variable leaf.
    #[must_use]
    pub fn as_variable(&self) -> Option<&SymbolicVariable> {
        match &self.node.kind {
            ExprKind::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the raw bit pattern, if this is a constant node.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self.node.kind {
            ExprKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the constant sign-extended from the node width, if any.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_u64().map(|v| sign_extend(v, self.bit_count()) as i64)
    }

    /// Checks whether the value is proven to be 0 or 1, with 1 possible.
    ///
    /// This is the candidate-condition test of branch recovery: the union of the unknown
    /// mask and the known-one mask must be exactly bit 0.
    #[must_use]
    pub fn is_one_bit(&self) -> bool {
        (self.node.value.unknown_mask() | self.node.value.one) == 1
    }

    /// Structural equality.
    ///
    /// Hash inequality short-circuits; equal hashes are confirmed by a deep compare.
    #[must_use]
    pub fn equals(&self, other: &SymbolicExpr) -> bool {
        if Arc::ptr_eq(&self.node, &other.node) {
            return true;
        }
        if self.node.hash != other.node.hash || self.node.bit_count != other.node.bit_count {
            return false;
        }
        match (&self.node.kind, &other.node.kind) {
            (ExprKind::Constant(a), ExprKind::Constant(b)) => a == b,
            (ExprKind::Variable(a), ExprKind::Variable(b)) => variables_equal(a, b),
            (
                ExprKind::Unary { op: oa, operand: a },
                ExprKind::Unary { op: ob, operand: b },
            ) => oa == ob && a.equals(b),
            (
                ExprKind::Binary {
                    op: oa,
                    lhs: la,
                    rhs: ra,
                },
                ExprKind::Binary {
                    op: ob,
                    lhs: lb,
                    rhs: rb,
                },
            ) => oa == ob && la.equals(lb) && ra.equals(rb),
            (
                ExprKind::Cast {
                    signed: sa,
                    operand: a,
                },
                ExprKind::Cast {
                    signed: sb,
                    operand: b,
                },
            ) => sa == sb && a.equals(b),
            _ => false,
        }
    }

    /// Visits this expression and every sub-expression, pre-order.
    ///
    /// Memory-variable base addresses are traversed as well, so conditions hidden behind
    /// a load's address computation are reachable.
    pub fn enumerate(&self, f: &mut dyn FnMut(&SymbolicExpr)) {
        f(self);
        match &self.node.kind {
            ExprKind::Constant(_) => {}
            ExprKind::Variable(v) => {
                if let Some(m) = v.mem() {
                    m.base.enumerate(f);
                }
            }
            ExprKind::Unary { operand, .. } | ExprKind::Cast { operand, .. } => {
                operand.enumerate(f);
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                lhs.enumerate(f);
                rhs.enumerate(f);
            }
        }
    }

    /// Rewrites the expression bottom-up.
    ///
    /// Children are transformed first, the node is rebuilt if any child changed, and the
    /// visitor is then offered the rebuilt node; returning `Some` replaces it. Memory
    /// variables whose base address changes are rebuilt with the new base, preserving
    /// their width and binding point.
    #[must_use]
    pub fn transform(
        &self,
        f: &mut dyn FnMut(&SymbolicExpr) -> Option<SymbolicExpr>,
    ) -> SymbolicExpr {
        let rebuilt = match &self.node.kind {
            ExprKind::Constant(_) => self.clone(),
            ExprKind::Variable(v) => match v.mem() {
                Some(m) => {
                    let base = m.base.transform(f);
                    if base.equals(&m.base) {
                        self.clone()
                    } else {
                        SymbolicExpr::variable(v.with_base(base))
                    }
                }
                None => self.clone(),
            },
            ExprKind::Unary { op, operand } => {
                let o = operand.transform(f);
                if o.equals(operand) {
                    self.clone()
                } else {
                    SymbolicExpr::unary(*op, o)
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let l = lhs.transform(f);
                let r = rhs.transform(f);
                if l.equals(lhs) && r.equals(rhs) {
                    self.clone()
                } else {
                    SymbolicExpr::binary(*op, l, r)
                }
            }
            ExprKind::Cast { signed, operand } => {
                let o = operand.transform(f);
                if o.equals(operand) {
                    self.clone()
                } else {
                    o.resize(self.bit_count(), *signed)
                }
            }
        };
        f(&rebuilt).unwrap_or(rebuilt)
    }

    /// Computes the value fingerprint of the expression.
    ///
    /// The expression is evaluated under each fixed sample assignment; variables take
    /// pseudo-random values derived from their hash, so structurally distinct leaves get
    /// distinct samples while clones agree.
    #[must_use]
    pub fn approximate(&self) -> Approximation {
        let mut values = [0u64; 4];
        for (slot, seed) in values.iter_mut().zip(APPROX_SEEDS) {
            *slot = self.eval_with(seed);
        }
        Approximation { values }
    }

    fn eval_with(&self, seed: u64) -> u64 {
        match &self.node.kind {
            ExprKind::Constant(v) => *v,
            ExprKind::Variable(v) => splitmix64(v.hash() ^ seed) & fill(self.bit_count()),
            ExprKind::Unary { op, operand } => {
                op.evaluate_unary(operand.eval_with(seed), self.bit_count())
            }
            ExprKind::Binary { op, lhs, rhs } => {
                op.evaluate(lhs.eval_with(seed), rhs.eval_with(seed), lhs.bit_count())
            }
            ExprKind::Cast { signed, operand } => {
                let v = operand.eval_with(seed);
                let v = if *signed {
                    sign_extend(v, operand.bit_count())
                } else {
                    v
                };
                v & fill(self.bit_count())
            }
        }
    }

    /// Simplifies the expression bottom-up.
    ///
    /// Applies constant folding, operator identities, and linear-term normalization of
    /// addition chains (which canonicalizes pointer arithmetic). With `pack` set,
    /// additional rules re-pack arithmetized booleans into compact forms.
    #[must_use]
    pub fn simplify(&self, pack: bool) -> SymbolicExpr {
        match &self.node.kind {
            ExprKind::Constant(_) | ExprKind::Variable(_) => self.clone(),
            ExprKind::Cast { signed, operand } => {
                fold_cast(*signed, operand.simplify(pack), self.bit_count())
            }
            ExprKind::Unary { op, operand } => {
                fold_unary(*op, operand.simplify(pack), self.bit_count())
            }
            ExprKind::Binary { op, lhs, rhs } => fold_binary(
                *op,
                lhs.simplify(pack),
                rhs.simplify(pack),
                self.bit_count(),
                pack,
            ),
        }
    }
}

impl PartialEq for SymbolicExpr {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for SymbolicExpr {}

impl std::hash::Hash for SymbolicExpr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.node.hash);
    }
}

/// Deep variable comparison used by [`SymbolicExpr::equals`].
fn variables_equal(a: &SymbolicVariable, b: &SymbolicVariable) -> bool {
    if a.at != b.at {
        return false;
    }
    match (&a.kind, &b.kind) {
        (VariableKind::Register(ra), VariableKind::Register(rb)) => ra == rb,
        (VariableKind::Memory(ma), VariableKind::Memory(mb)) => {
            ma.bit_count == mb.bit_count && ma.base.equals(&mb.base)
        }
        _ => false,
    }
}

fn sign_extend(v: u64, width: u32) -> u64 {
    if width >= 64 {
        return v;
    }
    let shift = 64 - width;
    (((v << shift) as i64) >> shift) as u64
}

fn analyze(kind: &ExprKind, bit_count: u32) -> (u64, u32, KnownBits) {
    const TAG_CONST: u64 = 0x01;
    const TAG_VAR: u64 = 0x02;
    const TAG_UNARY: u64 = 0x03;
    const TAG_BINARY: u64 = 0x04;
    const TAG_CAST: u64 = 0x05;
    let w = u64::from(bit_count);
    match kind {
        ExprKind::Constant(v) => (
            splitmix64(TAG_CONST ^ v.rotate_left(8) ^ (w << 1)),
            1,
            KnownBits::constant(*v, bit_count),
        ),
        ExprKind::Variable(var) => {
            let depth = var.mem().map_or(1, |m| m.base.depth() + 1);
            (
                splitmix64(TAG_VAR ^ var.hash() ^ (w << 1)),
                depth,
                KnownBits::unknown(bit_count),
            )
        }
        ExprKind::Unary { op, operand } => (
            splitmix64(TAG_UNARY ^ ((*op as u64) << 8) ^ operand.hash().rotate_left(16) ^ w),
            operand.depth() + 1,
            KnownBits::unary(*op, operand.value(), bit_count),
        ),
        ExprKind::Binary { op, lhs, rhs } => (
            splitmix64(
                TAG_BINARY
                    ^ ((*op as u64) << 8)
                    ^ lhs.hash().rotate_left(16)
                    ^ rhs.hash().rotate_left(40)
                    ^ w,
            ),
            lhs.depth().max(rhs.depth()) + 1,
            KnownBits::binary(*op, lhs.value(), rhs.value(), bit_count),
        ),
        ExprKind::Cast { signed, operand } => (
            splitmix64(TAG_CAST ^ u64::from(*signed) << 8 ^ operand.hash().rotate_left(16) ^ w),
            operand.depth() + 1,
            operand.value().cast(*signed, operand.bit_count(), bit_count),
        ),
    }
}

fn fold_cast(signed: bool, operand: SymbolicExpr, width: u32) -> SymbolicExpr {
    if width == operand.bit_count() {
        return operand;
    }
    if operand.is_constant() {
        return operand.resize(width, signed);
    }
    // Collapse chains of zero-extending resizes.
    if !signed {
        if let ExprKind::Cast {
            signed: false,
            operand: inner,
        } = operand.kind()
        {
            if operand.bit_count() >= inner.bit_count() {
                return constant_checked(inner.clone().resize(width, false));
            }
        }
    }
    constant_checked(operand.resize(width, signed))
}

fn fold_unary(op: SymbolicOp, operand: SymbolicExpr, width: u32) -> SymbolicExpr {
    if let Some(v) = operand.as_u64() {
        return SymbolicExpr::constant_u64(op.evaluate_unary(v, width), width);
    }
    if let ExprKind::Unary {
        op: inner_op,
        operand: inner,
    } = operand.kind()
    {
        if *inner_op == op {
            // ~~x and -(-x) cancel.
            return inner.clone();
        }
    }
    constant_checked(SymbolicExpr::unary(op, operand))
}

fn fold_binary(
    op: SymbolicOp,
    lhs: SymbolicExpr,
    rhs: SymbolicExpr,
    width: u32,
    pack: bool,
) -> SymbolicExpr {
    if let (Some(a), Some(b)) = (lhs.as_u64(), rhs.as_u64()) {
        return SymbolicExpr::constant_u64(op.evaluate(a, b, lhs.bit_count()), width);
    }

    match op {
        SymbolicOp::Add | SymbolicOp::Sub => return fold_linear(op, &lhs, &rhs, width),
        SymbolicOp::Mul => {
            if rhs.as_u64() == Some(0) || lhs.as_u64() == Some(0) {
                return SymbolicExpr::constant_u64(0, width);
            }
            if rhs.as_u64() == Some(1) {
                return lhs;
            }
            if lhs.as_u64() == Some(1) {
                return rhs;
            }
        }
        SymbolicOp::And => {
            if let Some(c) = rhs.as_u64().or_else(|| lhs.as_u64()) {
                let other = if rhs.is_constant() { &lhs } else { &rhs };
                let possible = !other.value().zero;
                if c & possible == possible {
                    return other.clone();
                }
                if c & possible == 0 {
                    return SymbolicExpr::constant_u64(0, width);
                }
            }
            if lhs.equals(&rhs) {
                return lhs;
            }
        }
        SymbolicOp::Or => {
            if rhs.as_u64() == Some(0) {
                return lhs;
            }
            if lhs.as_u64() == Some(0) {
                return rhs;
            }
            if let Some(c) = rhs.as_u64().or_else(|| lhs.as_u64()) {
                if c == fill(width) {
                    return SymbolicExpr::constant_u64(c, width);
                }
            }
            if lhs.equals(&rhs) {
                return lhs;
            }
        }
        SymbolicOp::Xor => {
            if rhs.as_u64() == Some(0) {
                return lhs;
            }
            if lhs.as_u64() == Some(0) {
                return rhs;
            }
            if lhs.equals(&rhs) {
                return SymbolicExpr::constant_u64(0, width);
            }
        }
        SymbolicOp::Shl | SymbolicOp::Shr => {
            if rhs.as_u64() == Some(0) {
                return lhs;
            }
            if let Some(c) = rhs.as_u64() {
                if c >= u64::from(width) {
                    return SymbolicExpr::constant_u64(0, width);
                }
            }
            if lhs.as_u64() == Some(0) {
                return SymbolicExpr::constant_u64(0, width);
            }
        }
        SymbolicOp::Rol | SymbolicOp::Ror => {
            if rhs.as_u64() == Some(0) {
                return lhs;
            }
        }
        SymbolicOp::DivU | SymbolicOp::DivS => {
            if rhs.as_u64() == Some(1) {
                return lhs;
            }
        }
        SymbolicOp::RemU | SymbolicOp::RemS => {
            if rhs.as_u64() == Some(1) {
                return SymbolicExpr::constant_u64(0, width);
            }
        }
        SymbolicOp::Eq => {
            if lhs.equals(&rhs) {
                return SymbolicExpr::constant_u64(1, 1);
            }
            if pack {
                if let Some(e) = pack_eq_zero(&lhs, &rhs) {
                    return e;
                }
            }
        }
        SymbolicOp::Ne => {
            if lhs.equals(&rhs) {
                return SymbolicExpr::constant_u64(0, 1);
            }
            if pack {
                // x != 0 with x provably 0-or-1 is just the low bit of x.
                if rhs.as_u64() == Some(0) && lhs.is_one_bit() {
                    return lhs.resize(1, false);
                }
            }
        }
        SymbolicOp::LeS | SymbolicOp::LeU | SymbolicOp::GeS | SymbolicOp::GeU => {
            if lhs.equals(&rhs) {
                return SymbolicExpr::constant_u64(1, 1);
            }
        }
        SymbolicOp::LtS | SymbolicOp::LtU | SymbolicOp::GtS | SymbolicOp::GtU => {
            if lhs.equals(&rhs) {
                return SymbolicExpr::constant_u64(0, 1);
            }
        }
        _ => {}
    }

    // With pack enabled, masking a proven 0-or-1 value with 1 is the identity.
    if pack && op == SymbolicOp::And {
        if rhs.as_u64() == Some(1) && lhs.is_one_bit() {
            return lhs;
        }
        if lhs.as_u64() == Some(1) && rhs.is_one_bit() {
            return rhs;
        }
    }

    // Canonical operand order for commutative operations.
    let result = if op.is_commutative() && lhs.hash() > rhs.hash() {
        SymbolicExpr::binary(op, rhs, lhs)
    } else {
        SymbolicExpr::binary(op, lhs, rhs)
    };
    constant_checked(result)
}

/// Folds any node whose known-bit analysis pins every bit.
fn constant_checked(e: SymbolicExpr) -> SymbolicExpr {
    if !e.is_constant() && e.value().is_constant() {
        return SymbolicExpr::constant_u64(e.value().value(), e.bit_count());
    }
    e
}

/// `x == 0` for a proven 0-or-1 `x` packs into `x ^ 1` at one bit.
fn pack_eq_zero(lhs: &SymbolicExpr, rhs: &SymbolicExpr) -> Option<SymbolicExpr> {
    let value = if rhs.as_u64() == Some(0) {
        lhs
    } else if lhs.as_u64() == Some(0) {
        rhs
    } else {
        return None;
    };
    if !value.is_one_bit() {
        return None;
    }
    Some(SymbolicExpr::binary(
        SymbolicOp::Xor,
        value.resize(1, false),
        SymbolicExpr::constant_u64(1, 1),
    ))
}

/// Flattens an addition/subtraction chain, cancels equal terms with opposite signs,
/// folds constants, and rebuilds a canonical sum.
///
/// The canonical form keeps non-constant terms sorted by hash with any constant attached
/// last, which both enables hash-based equality of commuted sums and leaves pointer
/// arithmetic in the `base ± displacement` shape the re-emitter matches on.
fn fold_linear(op: SymbolicOp, lhs: &SymbolicExpr, rhs: &SymbolicExpr, width: u32) -> SymbolicExpr {
    let mut terms: Vec<(SymbolicExpr, i64)> = Vec::new();
    let mut index: FxHashMap<u64, usize> = FxHashMap::default();
    let mut constant: u64 = 0;

    fn collect(
        e: &SymbolicExpr,
        sign: i64,
        terms: &mut Vec<(SymbolicExpr, i64)>,
        index: &mut FxHashMap<u64, usize>,
        constant: &mut u64,
        width: u32,
    ) {
        match e.kind() {
            ExprKind::Constant(v) => {
                let signed = if sign >= 0 { *v } else { v.wrapping_neg() };
                *constant = constant.wrapping_add(signed);
            }
            ExprKind::Binary {
                op: SymbolicOp::Add,
                lhs,
                rhs,
            } if e.bit_count() == width => {
                collect(lhs, sign, terms, index, constant, width);
                collect(rhs, sign, terms, index, constant, width);
            }
            ExprKind::Binary {
                op: SymbolicOp::Sub,
                lhs,
                rhs,
            } if e.bit_count() == width => {
                collect(lhs, sign, terms, index, constant, width);
                collect(rhs, -sign, terms, index, constant, width);
            }
            ExprKind::Unary {
                op: SymbolicOp::Neg,
                operand,
            } if e.bit_count() == width => {
                collect(operand, -sign, terms, index, constant, width);
            }
            _ => {
                if let Some(&i) = index.get(&e.hash()) {
                    if terms[i].0.equals(e) {
                        terms[i].1 += sign;
                        return;
                    }
                }
                index.insert(e.hash(), terms.len());
                terms.push((e.clone(), sign));
            }
        }
    }

    collect(lhs, 1, &mut terms, &mut index, &mut constant, width);
    let rhs_sign = if op == SymbolicOp::Sub { -1 } else { 1 };
    collect(rhs, rhs_sign, &mut terms, &mut index, &mut constant, width);

    terms.retain(|(_, coeff)| *coeff != 0);
    terms.sort_by_key(|(t, _)| t.hash());

    let mut result: Option<SymbolicExpr> = None;
    for (term, coeff) in terms {
        let magnitude = coeff.unsigned_abs();
        let scaled = if magnitude > 1 {
            SymbolicExpr::binary(
                SymbolicOp::Mul,
                term,
                SymbolicExpr::constant_u64(magnitude, width),
            )
        } else {
            term
        };
        result = Some(match result {
            None if coeff > 0 => scaled,
            None => SymbolicExpr::unary(SymbolicOp::Neg, scaled),
            Some(acc) if coeff > 0 => SymbolicExpr::binary(SymbolicOp::Add, acc, scaled),
            Some(acc) => SymbolicExpr::binary(SymbolicOp::Sub, acc, scaled),
        });
    }

    let constant = constant & fill(width);
    match result {
        None => SymbolicExpr::constant_u64(constant, width),
        Some(acc) if constant == 0 => acc,
        Some(acc) => {
            let signed = sign_extend(constant, width) as i64;
            if signed < 0 {
                SymbolicExpr::binary(
                    SymbolicOp::Sub,
                    acc,
                    SymbolicExpr::constant_u64(signed.unsigned_abs(), width),
                )
            } else {
                SymbolicExpr::binary(SymbolicOp::Add, acc, SymbolicExpr::constant_u64(constant, width))
            }
        }
    }
}

impl fmt::Display for SymbolicExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node.kind {
            ExprKind::Constant(v) => {
                let signed = sign_extend(*v, self.bit_count()) as i64;
                if signed < 0 {
                    write!(f, "-{:#x}", signed.unsigned_abs())
                } else {
                    write!(f, "{v:#x}")
                }
            }
            ExprKind::Variable(v) => write!(f, "{v}"),
            ExprKind::Unary { op, operand } => write!(f, "{op}({operand})"),
            ExprKind::Binary { op, lhs, rhs } => write!(f, "({lhs} {op} {rhs})"),
            ExprKind::Cast { signed, operand } => {
                let tag = if *signed { "sx" } else { "zx" };
                write!(f, "{tag}{}({operand})", self.bit_count())
            }
        }
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl std::ops::$trait<&SymbolicExpr> for &SymbolicExpr {
            type Output = SymbolicExpr;

            fn $method(self, rhs: &SymbolicExpr) -> SymbolicExpr {
                SymbolicExpr::binary($op, self.clone(), rhs.clone())
            }
        }
    };
}

impl_binary_op!(Add, add, SymbolicOp::Add);
impl_binary_op!(Sub, sub, SymbolicOp::Sub);
impl_binary_op!(Mul, mul, SymbolicOp::Mul);
impl_binary_op!(BitAnd, bitand, SymbolicOp::And);
impl_binary_op!(BitOr, bitor, SymbolicOp::Or);
impl_binary_op!(BitXor, bitxor, SymbolicOp::Xor);
impl_binary_op!(Shl, shl, SymbolicOp::Shl);
impl_binary_op!(Shr, shr, SymbolicOp::Shr);

impl std::ops::Add<i64> for &SymbolicExpr {
    type Output = SymbolicExpr;

    fn add(self, rhs: i64) -> SymbolicExpr {
        let width = self.bit_count();
        SymbolicExpr::binary(
            SymbolicOp::Add,
            self.clone(),
            SymbolicExpr::constant(rhs, width),
        )
    }
}

impl std::ops::Neg for &SymbolicExpr {
    type Output = SymbolicExpr;

    fn neg(self) -> SymbolicExpr {
        SymbolicExpr::unary(SymbolicOp::Neg, self.clone())
    }
}

impl std::ops::Not for &SymbolicExpr {
    type Output = SymbolicExpr;

    fn not(self) -> SymbolicExpr {
        SymbolicExpr::unary(SymbolicOp::Not, self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::RegisterDesc,
        symbolic::variable::{Origin, SymbolicVariable},
    };

    fn var(index: u32) -> SymbolicExpr {
        SymbolicExpr::variable(SymbolicVariable::register(
            Origin { vip: 0, index: 0 },
            RegisterDesc::virtual_reg(index, 64),
        ))
    }

    #[test]
    fn test_constant_folding() {
        let e = &(&SymbolicExpr::constant(1, 64) + &SymbolicExpr::constant(2, 64))
            * &SymbolicExpr::constant(3, 64);
        assert_eq!(e.simplify(false).as_u64(), Some(9));
    }

    #[test]
    fn test_identities() {
        let x = var(0);
        assert!((&x + &SymbolicExpr::constant(0, 64)).simplify(false).equals(&x));
        assert!((&x ^ &x).simplify(false).as_u64() == Some(0));
        assert!((&x & &x).simplify(false).equals(&x));
        assert!(
            (&x * &SymbolicExpr::constant(0, 64)).simplify(false).as_u64() == Some(0)
        );
        assert!((&x << &SymbolicExpr::constant(0, 64)).simplify(false).equals(&x));
    }

    #[test]
    fn test_linear_cancellation() {
        let x = var(0);
        let y = var(1);
        // (x + y) - x simplifies to y.
        let e = &(&x + &y) - &x;
        assert!(e.simplify(false).equals(&y));
        // (x + 8) - (x + 3) simplifies to 5.
        let a = &x + 8;
        let b = &x + 3;
        assert_eq!((&a - &b).simplify(false).as_u64(), Some(5));
    }

    #[test]
    fn test_commuted_sums_canonicalize() {
        let x = var(0);
        let y = var(1);
        let a = (&x + &y).simplify(false);
        let b = (&y + &x).simplify(false);
        assert_eq!(a.hash(), b.hash());
        assert!(a.equals(&b));
    }

    #[test]
    fn test_arithmetized_select_collapses() {
        // cc*T1 + (1-cc)*T2 under cc = 1 folds to T1.
        let t1 = SymbolicExpr::constant(0x1000, 64);
        let t2 = SymbolicExpr::constant(0x2000, 64);
        let one = SymbolicExpr::constant(1, 64);
        let cc = SymbolicExpr::constant(1, 64);
        let e = &(&cc * &t1) + &(&(&one - &cc) * &t2);
        assert_eq!(e.simplify(false).as_u64(), Some(0x1000));
    }

    #[test]
    fn test_depth() {
        let x = var(0);
        assert_eq!(x.depth(), 1);
        assert_eq!((&x + &var(1)).depth(), 2);
        assert_eq!(SymbolicExpr::constant(3, 64).depth(), 1);
    }

    #[test]
    fn test_one_bit_detection() {
        let x = var(0);
        let cmp = SymbolicExpr::binary(SymbolicOp::Eq, x.clone(), var(1));
        assert!(cmp.is_one_bit());
        assert!(!x.is_one_bit());
        let masked = &x & &SymbolicExpr::constant(1, 64);
        assert!(masked.is_one_bit());
        // Zero is provably 0-or-1 but can never be 1.
        assert!(!SymbolicExpr::constant(0, 1).is_one_bit());
    }

    #[test]
    fn test_transform_substitution() {
        let x = var(0);
        let y = var(1);
        let e = &(&x + &y) * &x;
        let replaced = e.transform(&mut |sub| {
            if sub.equals(&x) {
                Some(SymbolicExpr::constant(2, 64))
            } else {
                None
            }
        });
        assert_eq!(replaced.simplify(false).as_u64(), None);
        // Substitute y as well to get a full constant.
        let replaced = replaced.transform(&mut |sub| {
            if sub.equals(&y) {
                Some(SymbolicExpr::constant(3, 64))
            } else {
                None
            }
        });
        assert_eq!(replaced.simplify(false).as_u64(), Some(10));
    }

    #[test]
    fn test_transform_rebuilds_memory_base() {
        let addr = &var(0) + 8;
        let load = SymbolicExpr::variable(SymbolicVariable::memory(
            Origin { vip: 0, index: 2 },
            addr,
            32,
        ));
        let rebased = load.transform(&mut |sub| {
            if sub.equals(&var(0)) {
                Some(SymbolicExpr::constant(0x4000, 64))
            } else {
                None
            }
        });
        let v = rebased.as_variable().expect("still a variable");
        assert_eq!(v.bit_count(), 32);
        assert_eq!(
            v.mem().unwrap().base.simplify(false).as_u64(),
            Some(0x4008)
        );
    }

    #[test]
    fn test_enumerate_descends_into_memory_base() {
        let inner = var(3);
        let load = SymbolicExpr::variable(SymbolicVariable::memory(
            Origin { vip: 0, index: 0 },
            inner.clone(),
            64,
        ));
        let mut hit = false;
        load.enumerate(&mut |e| {
            if e.equals(&inner) {
                hit = true;
            }
        });
        assert!(hit);
    }

    #[test]
    fn test_approximation_distinguishes_and_matches() {
        let x = var(0);
        let y = var(1);
        assert_eq!(x.approximate(), x.clone().approximate());
        assert_ne!(x.approximate(), y.approximate());

        let cmp = SymbolicExpr::binary(SymbolicOp::Eq, x.clone(), y.clone());
        let ne = SymbolicExpr::binary(SymbolicOp::Ne, x, y);
        assert_eq!(cmp.approximate().inverted(), ne.approximate());
    }

    #[test]
    fn test_resize_folds_constants() {
        let c = SymbolicExpr::constant(-1, 8);
        assert_eq!(c.resize(16, true).as_u64(), Some(0xFFFF));
        assert_eq!(c.resize(16, false).as_u64(), Some(0xFF));
        assert_eq!(c.resize(4, false).as_u64(), Some(0xF));
    }

    #[test]
    fn test_pack_boolean_rules() {
        let x = var(0);
        let bit = (&x & &SymbolicExpr::constant(1, 64)).simplify(false);
        // (x & 1) != 0 packs to the low bit.
        let ne = SymbolicExpr::binary(SymbolicOp::Ne, bit.clone(), SymbolicExpr::constant(0, 64));
        let packed = ne.simplify(true);
        assert_eq!(packed.bit_count(), 1);
        assert!(!packed.is_constant());
    }
}

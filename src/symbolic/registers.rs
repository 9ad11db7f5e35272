//! Partial-bit register state.
//!
//! The register store tracks written register bits at single-bit granularity. Each
//! register maps to a [`PartialValue`]: a bitmap of covered bits plus a linear store
//! indexed by bit position, where entry `i` holds the expression whose *low bit* defines
//! register bit `i`. A write of `v` at offset `o` and size `s` therefore populates
//! entries `o + k` with `v >> k`; a read reconstructs the requested span by merging
//! maximal runs that shift out of one underlying value, falling back to the symbolic
//! initial value for uncovered bits.

use std::collections::BTreeMap;

use crate::{
    ir::{RegisterDesc, RegisterId},
    symbolic::{
        bits::{bit_enum, fill},
        expr::{ExprKind, SymbolicExpr},
        ops::SymbolicOp,
        variable::{Origin, SymbolicVariable},
    },
};

/// Bit-granular value of one register.
#[derive(Debug, Clone)]
pub struct PartialValue {
    /// Mask of bits that have been written.
    pub bitmap: u64,
    /// Per-bit expressions; `linear[i]` defines register bit `i` through its low bit.
    linear: Vec<Option<SymbolicExpr>>,
}

impl PartialValue {
    fn new() -> Self {
        PartialValue {
            bitmap: 0,
            linear: vec![None; 64],
        }
    }

    /// The expression defining bit `i`, if that bit was written.
    #[must_use]
    pub fn bit(&self, i: u32) -> Option<&SymbolicExpr> {
        self.linear.get(i as usize).and_then(Option::as_ref)
    }

    /// Simplifies every covered bit expression in place.
    pub fn simplify(&mut self, pack: bool) {
        let linear = &mut self.linear;
        bit_enum(self.bitmap, |i| {
            if let Some(e) = &linear[i as usize] {
                linear[i as usize] = Some(e.simplify(pack));
            }
        });
    }
}

/// Alias-free register state of a segment.
#[derive(Debug, Clone, Default)]
pub struct RegisterStore {
    map: BTreeMap<RegisterId, PartialValue>,
}

impl RegisterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        RegisterStore::default()
    }

    /// Number of registers with written bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Checks if no register was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The partial value of a register, if any bit of it was written.
    #[must_use]
    pub fn get(&self, id: &RegisterId) -> Option<&PartialValue> {
        self.map.get(id)
    }

    /// Iterates registers in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&RegisterId, &PartialValue)> {
        self.map.iter()
    }

    /// Iterates registers mutably in identity order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&RegisterId, &mut PartialValue)> {
        self.map.iter_mut()
    }

    /// Writes `value` to the span addressed by `desc`.
    ///
    /// The value is resized to the span width; each covered bit records the value
    /// shifted down so its low bit lines up.
    pub fn write(&mut self, desc: &RegisterDesc, value: SymbolicExpr) {
        let value = value.resize(desc.bit_count, false);
        let entry = self.map.entry(desc.id()).or_insert_with(PartialValue::new);
        for k in 0..desc.bit_count {
            let i = (desc.bit_offset + k) as usize;
            let e = if k == 0 {
                value.clone()
            } else {
                &value >> &SymbolicExpr::constant_u64(u64::from(k), value.bit_count())
            };
            entry.linear[i] = Some(e);
        }
        entry.bitmap |= desc.get_mask();
    }

    /// Reads the span addressed by `desc`, reconstructing from covered bits.
    ///
    /// Returns the reconstructed expression and the `known` mask (in absolute register
    /// bit positions) of bits backed by writes. Uncovered bits decay to the symbolic
    /// initial value of the register at `origin`.
    #[must_use]
    pub fn read(&self, desc: &RegisterDesc, origin: Origin) -> (SymbolicExpr, u64) {
        let span_end = desc.bit_offset + desc.bit_count;
        let pv = self.map.get(&desc.id());
        let covered = |i: u32| pv.is_some_and(|v| v.bitmap & (1u64 << i) != 0);

        let mut pieces: Vec<(SymbolicExpr, u32)> = Vec::new();
        let mut known = 0u64;
        let mut p = desc.bit_offset;
        while p < span_end {
            if covered(p) {
                let pv = pv.expect("covered bit implies entry");
                let first = pv.bit(p).expect("bitmap bit implies linear entry").clone();
                let (base, k0) = underlying(&first);
                let mut run = 1;
                while p + run < span_end && covered(p + run) {
                    let stored = pv.bit(p + run).expect("bitmap bit implies linear entry");
                    if !matches_shift(stored, &base, k0 + u64::from(run)) {
                        break;
                    }
                    run += 1;
                }
                known |= fill(run) << p;
                pieces.push((first.resize(run, false), p - desc.bit_offset));
                p += run;
            } else {
                let mut gap = 1;
                while p + gap < span_end && !covered(p + gap) {
                    gap += 1;
                }
                let initial = SymbolicExpr::variable(SymbolicVariable::register(
                    origin,
                    desc.select(gap, p),
                ));
                pieces.push((initial, p - desc.bit_offset));
                p += gap;
            }
        }

        (compose(pieces, desc.bit_count), known)
    }
}

/// Splits `e` into `(base, shift)` such that `e == base >> shift`.
fn underlying(e: &SymbolicExpr) -> (SymbolicExpr, u64) {
    if let ExprKind::Binary {
        op: SymbolicOp::Shr,
        lhs,
        rhs,
    } = e.kind()
    {
        if let Some(c) = rhs.as_u64() {
            return (lhs.clone(), c);
        }
    }
    (e.clone(), 0)
}

/// Checks whether `stored` is `base >> shift`, tolerating prior simplification.
fn matches_shift(stored: &SymbolicExpr, base: &SymbolicExpr, shift: u64) -> bool {
    let candidate = if shift == 0 {
        base.clone()
    } else {
        base >> &SymbolicExpr::constant_u64(shift, base.bit_count())
    };
    if stored.hash() == candidate.hash() && stored.equals(&candidate) {
        return true;
    }
    let simplified = candidate.simplify(false);
    stored.hash() == simplified.hash() && stored.equals(&simplified)
}

/// Assembles positioned pieces into one expression of `width` bits.
fn compose(pieces: Vec<(SymbolicExpr, u32)>, width: u32) -> SymbolicExpr {
    let mut result: Option<SymbolicExpr> = None;
    for (piece, rel) in pieces {
        let mut placed = piece.resize(width, false);
        if rel != 0 {
            placed = &placed << &SymbolicExpr::constant_u64(u64::from(rel), width);
        }
        result = Some(match result {
            None => placed,
            Some(acc) => &acc | &placed,
        });
    }
    result.unwrap_or_else(|| SymbolicExpr::constant_u64(0, width))
}

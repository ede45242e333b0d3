//! Ledger coverage: the scalar that competing branches are compared by.
//!
//! Coverage is a short vector of per-slot sums of rooted output amounts. Each
//! milestone derives its coverage from its baseline branch's vector by
//! shifting it by the slot distance and adding its own delta (the sum of
//! newly rooted amounts in its past cone). The comparison scalar `sum()`
//! dilutes older slots by halving per position.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::COVERAGE_HISTORY_SLOTS;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCoverage([u64; COVERAGE_HISTORY_SLOTS]);

impl LedgerCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coverage vector with only the current slot filled.
    pub fn from_delta(delta: u64) -> Self {
        let mut ret = Self::default();
        ret.0[0] = delta;
        ret
    }

    /// Derive the next coverage: shift by `slots` positions (zero-fill) and
    /// accumulate `delta` into the current slot. `slots == 0` keeps
    /// accumulating within the same slot.
    pub fn make_next(&self, slots: usize, delta: u64) -> Self {
        let mut ret = Self::default();
        for (i, v) in self.0.iter().enumerate() {
            if i + slots < COVERAGE_HISTORY_SLOTS {
                ret.0[i + slots] = *v;
            }
        }
        ret.0[0] = ret.0[0].saturating_add(delta);
        ret
    }

    /// Comparison scalar: older slots count for half per step of age.
    pub fn sum(&self) -> u64 {
        self.0
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, v)| acc.saturating_add(v >> i))
    }

    /// The raw current-slot component.
    pub fn latest_delta(&self) -> u64 {
        self.0[0]
    }
}

impl fmt::Display for LedgerCoverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "] sum: {}", self.sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_delta_and_sum() {
        let c = LedgerCoverage::from_delta(1_000);
        assert_eq!(c.sum(), 1_000);
        assert_eq!(c.latest_delta(), 1_000);
    }

    #[test]
    fn make_next_shifts_and_dilutes() {
        let c = LedgerCoverage::from_delta(1_000);
        let next = c.make_next(1, 500);
        // 500 current + 1000 diluted by one position
        assert_eq!(next.sum(), 500 + 500);
        assert_eq!(next.latest_delta(), 500);
    }

    #[test]
    fn make_next_same_slot_accumulates() {
        let c = LedgerCoverage::from_delta(1_000);
        let next = c.make_next(0, 200);
        assert_eq!(next.latest_delta(), 1_200);
    }

    #[test]
    fn old_slots_fall_off() {
        let c = LedgerCoverage::from_delta(1 << 32);
        let far = c.make_next(COVERAGE_HISTORY_SLOTS, 1);
        assert_eq!(far.sum(), 1);
    }
}

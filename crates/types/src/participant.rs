//! Participant records.

use crate::Amount;
use serde::{Deserialize, Serialize};

/// Per-participant ledger state.
///
/// An entry is created on first contribution or registration and lives
/// until explicit administrative removal prior to allocation. The
/// `allocation` and `has_claimed` fields are written exactly once each:
/// at calculation time and at claim time respectively.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Accumulated contributed amount.
    pub contributed: Amount,
    /// Whether the participant currently appears in the registry.
    pub is_registered: bool,
    /// Computed share of the distributable pool; zero until calculated,
    /// zeroed again by the claim.
    pub allocation: Amount,
    /// Set in the same operation that zeroes a nonzero allocation.
    pub has_claimed: bool,
    /// Set in the same operation that zeroes a refunded contribution.
    pub refunded: bool,
}

impl Participant {
    /// A freshly registered participant with an initial contribution.
    pub fn registered(contributed: Amount) -> Self {
        Self {
            contributed,
            is_registered: true,
            ..Self::default()
        }
    }
}

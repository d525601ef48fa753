//! Tranche shared data model.
//!
//! This crate holds the data types the contribution ledger and the
//! settlement engine exchange: participant identities, checked amounts,
//! the distribution phase machine, entry-policy configuration, and the
//! event model. It is pure data with no I/O and no collaborators.

#![deny(unsafe_code)]

mod event;
mod participant;
mod phase;
mod policy;

pub use event::{EventEnvelope, SettlementEvent};
pub use participant::Participant;
pub use phase::DistributionPhase;
pub use policy::{ContributionBounds, EntryPolicy};

use serde::{Deserialize, Serialize};

/// A unique external participant key (address-equivalent).
///
/// An identity whose string is empty or whitespace-only is the null
/// identity and is rejected by every ledger operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity. Intended for tests and tooling.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_null(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the asset held in custody and distributed to claimants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_null(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value amount in minor units.
///
/// All arithmetic on amounts inside the ledger goes through the checked
/// helpers; overflow is surfaced as an error, never wrapped.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// Saturating subtraction, for rollback paths where the operand is
    /// known not to exceed `self`.
    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    /// Saturating addition, for rollback paths restoring a value that
    /// was previously subtracted.
    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

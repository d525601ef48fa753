//! Distribution phase machine.

use serde::{Deserialize, Serialize};

/// The lifecycle phase of a distribution round.
///
/// Transitions move strictly forward except for the reversible
/// `ClaimOpen ⇄ ClaimClosed` pair:
///
/// ```text
/// Collecting → AllocationCalculated → ClaimEnabled → ClaimOpen ⇄ ClaimClosed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionPhase {
    /// Contributions are being accepted; nothing is allocated yet.
    Collecting,
    /// Allocations are computed and the ledger is frozen.
    AllocationCalculated,
    /// Claiming is enabled but the window has not been opened yet.
    ClaimEnabled,
    /// Participants may claim.
    ClaimOpen,
    /// The window is closed; it may be re-opened.
    ClaimClosed,
}

impl DistributionPhase {
    /// True once `calculate_allocations` has run; the ledger no longer
    /// accepts contribution mutations.
    pub fn is_calculated(&self) -> bool {
        !matches!(self, DistributionPhase::Collecting)
    }

    pub fn is_claim_open(&self) -> bool {
        matches!(self, DistributionPhase::ClaimOpen)
    }
}

impl std::fmt::Display for DistributionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DistributionPhase::Collecting => "collecting",
            DistributionPhase::AllocationCalculated => "allocation-calculated",
            DistributionPhase::ClaimEnabled => "claim-enabled",
            DistributionPhase::ClaimOpen => "claim-open",
            DistributionPhase::ClaimClosed => "claim-closed",
        };
        write!(f, "{name}")
    }
}

//! Event model for external auditability.
//!
//! Every observable state transition emits one of these. Emission is
//! observability only; correctness never depends on a sink seeing an
//! event.

use crate::{Amount, AssetId, Identity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An emitted event with its id and wall-clock timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub event: SettlementEvent,
}

impl EventEnvelope {
    /// Wrap an event with a fresh id and the current time.
    pub fn now(event: SettlementEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            event,
        }
    }
}

/// State transitions observable from outside the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementEvent {
    ContributionRecorded {
        identity: Identity,
        amount: Amount,
        new_total: Amount,
    },
    ContributionsBatchSet {
        entries: usize,
        total_contributed: Amount,
    },
    ContributionUpdated {
        identity: Identity,
        previous: Amount,
        current: Amount,
    },
    ContributorRemoved {
        identity: Identity,
        amount: Amount,
    },
    MinPerParticipantSet {
        min: Amount,
    },
    MaxPerParticipantSet {
        max: Amount,
    },
    HardCapSet {
        hard_cap: Amount,
    },
    AllocationsCalculated {
        participants: usize,
        total_contributed: Amount,
        distributable_pool: Amount,
        total_allocated: Amount,
    },
    ClaimEnabled,
    ClaimPeriodOpened,
    ClaimPeriodClosed,
    Claimed {
        identity: Identity,
        amount: Amount,
    },
    RefundsAllowedSet {
        allowed: bool,
    },
    Refunded {
        identity: Identity,
        amount: Amount,
    },
    DistributionAssetSet {
        asset: AssetId,
    },
    UnclaimedWithdrawn {
        to: Identity,
        amount: Amount,
    },
    ContributionsWithdrawn {
        to: Identity,
        amount: Amount,
    },
}

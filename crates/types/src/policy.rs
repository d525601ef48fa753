//! Entry-policy configuration.
//!
//! One parameterized ledger serves both entry modes found in the wild:
//! self-service deposits under min/max/hard-cap bounds, and
//! administrator-batch-only ledgers with no per-participant bounds.

use crate::Amount;
use serde::{Deserialize, Serialize};

/// Bounds applied to self-service contributions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionBounds {
    /// A participant's accumulated contribution must reach at least this.
    pub min_per_participant: Amount,
    /// A participant's accumulated contribution may not exceed this.
    pub max_per_participant: Amount,
    /// The aggregate total may not exceed this.
    pub hard_cap: Amount,
}

/// Selects which mutation paths a ledger accepts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPolicy {
    /// Participants deposit for themselves, subject to bounds.
    SelfService(ContributionBounds),
    /// An administrator records contributions in batches; no
    /// per-participant bounds apply.
    Administered {
        /// Maximum number of entries accepted per batch.
        max_batch_size: usize,
    },
}

impl EntryPolicy {
    pub fn is_self_service(&self) -> bool {
        matches!(self, EntryPolicy::SelfService(_))
    }

    pub fn bounds(&self) -> Option<&ContributionBounds> {
        match self {
            EntryPolicy::SelfService(bounds) => Some(bounds),
            EntryPolicy::Administered { .. } => None,
        }
    }

    pub fn max_batch_size(&self) -> Option<usize> {
        match self {
            EntryPolicy::SelfService(_) => None,
            EntryPolicy::Administered { max_batch_size } => Some(*max_batch_size),
        }
    }
}

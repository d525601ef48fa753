//! The contribution ledger: owned mutable store plus every mutation.

use std::collections::{HashMap, HashSet};
use tracing::debug;
use tranche_types::{Amount, EntryPolicy, Identity, Participant};

use crate::error::{BoundConflict, LedgerError, LedgerResult, LimitKind};
use crate::registry::Registry;

/// What a successful `contribute` changed, sufficient to undo it when
/// the external debit that follows fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContributionReceipt {
    pub identity: Identity,
    pub amount: Amount,
    /// The participant's accumulated total after this contribution.
    pub new_total: Amount,
    pub newly_registered: bool,
}

/// What a successful refund changed, sufficient to undo it when the
/// external credit that follows fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefundReceipt {
    pub identity: Identity,
    pub amount: Amount,
}

/// The owned contribution store: participants, registry, aggregate
/// total, and entry-policy configuration.
///
/// Invariants maintained across every operation:
/// - `total_contributed` equals the sum of all recorded contributions;
/// - registry membership and `is_registered` agree, with no duplicates;
/// - under a self-service policy, every nonzero contribution sits in
///   `[min_per_participant, max_per_participant]` and the total never
///   exceeds the hard cap;
/// - once locked, no contribution-side mutation is accepted.
#[derive(Clone, Debug)]
pub struct ContributionLedger {
    participants: HashMap<Identity, Participant>,
    registry: Registry,
    total_contributed: Amount,
    policy: EntryPolicy,
    locked: bool,
}

impl ContributionLedger {
    pub fn new(policy: EntryPolicy) -> LedgerResult<Self> {
        match &policy {
            EntryPolicy::SelfService(bounds) => {
                if bounds.min_per_participant.is_zero()
                    || bounds.max_per_participant.is_zero()
                    || bounds.hard_cap.is_zero()
                {
                    return Err(LedgerError::InvalidAmount);
                }
                if bounds.min_per_participant > bounds.max_per_participant {
                    return Err(LedgerError::InvariantViolation {
                        conflict: BoundConflict {
                            bound: "min-per-participant",
                            requested: bounds.min_per_participant,
                            recorded: bounds.max_per_participant,
                            identity: None,
                        },
                    });
                }
            }
            EntryPolicy::Administered { max_batch_size } => {
                if *max_batch_size == 0 {
                    return Err(LedgerError::InvalidBatchSize);
                }
            }
        }
        Ok(Self {
            participants: HashMap::new(),
            registry: Registry::new(),
            total_contributed: Amount::ZERO,
            policy,
            locked: false,
        })
    }

    // ── accessors ───────────────────────────────────────────────────

    pub fn policy(&self) -> &EntryPolicy {
        &self.policy
    }

    pub fn total_contributed(&self) -> Amount {
        self.total_contributed
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn registered_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, identity: &Identity) -> bool {
        self.registry.contains(identity)
    }

    pub fn participant(&self, identity: &Identity) -> Option<&Participant> {
        self.participants.get(identity)
    }

    /// The participant's accumulated contribution, zero if unknown.
    pub fn contribution_of(&self, identity: &Identity) -> Amount {
        self.participants
            .get(identity)
            .map(|p| p.contributed)
            .unwrap_or(Amount::ZERO)
    }

    /// Iterate registered participants in registry order.
    pub fn iter_registered(&self) -> impl Iterator<Item = (&Identity, &Participant)> {
        self.registry
            .iter()
            .filter_map(|id| self.participants.get(id).map(|p| (id, p)))
    }

    /// Freeze the contribution side. Called once at calculation time;
    /// there is no unlock.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    fn ensure_unlocked(&self) -> LedgerResult<()> {
        if self.locked {
            return Err(LedgerError::ContributionsLocked);
        }
        Ok(())
    }

    // ── self-service path ───────────────────────────────────────────

    /// Record a self-service contribution.
    ///
    /// Validates identity, amount, per-participant bounds on the
    /// resulting accumulated total, and the aggregate hard cap, then
    /// registers the identity if this is its first contribution and
    /// applies the addition. The returned receipt undoes exactly this
    /// mutation via [`revert_contribution`](Self::revert_contribution).
    pub fn contribute(
        &mut self,
        identity: &Identity,
        amount: Amount,
    ) -> LedgerResult<ContributionReceipt> {
        self.ensure_unlocked()?;
        let bounds = match &self.policy {
            EntryPolicy::SelfService(bounds) => *bounds,
            EntryPolicy::Administered { .. } => {
                return Err(LedgerError::EntryModeMismatch {
                    operation: "contribute",
                })
            }
        };
        if identity.is_null() {
            return Err(LedgerError::InvalidIdentity);
        }
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }

        let previous = self.contribution_of(identity);
        let new_total = previous
            .checked_add(amount)
            .ok_or(LedgerError::AmountOverflow)?;
        if new_total < bounds.min_per_participant {
            return Err(LedgerError::LimitViolation {
                identity: identity.clone(),
                kind: LimitKind::BelowMinimum {
                    resulting: new_total,
                    min: bounds.min_per_participant,
                },
            });
        }
        if new_total > bounds.max_per_participant {
            return Err(LedgerError::LimitViolation {
                identity: identity.clone(),
                kind: LimitKind::AboveMaximum {
                    resulting: new_total,
                    max: bounds.max_per_participant,
                },
            });
        }
        let aggregate = self
            .total_contributed
            .checked_add(amount)
            .ok_or(LedgerError::AmountOverflow)?;
        if aggregate > bounds.hard_cap {
            return Err(LedgerError::LimitViolation {
                identity: identity.clone(),
                kind: LimitKind::HardCapExceeded {
                    resulting: aggregate,
                    hard_cap: bounds.hard_cap,
                },
            });
        }

        let newly_registered = self.registry.insert(identity.clone());
        if newly_registered {
            self.participants
                .insert(identity.clone(), Participant::registered(amount));
        } else if let Some(participant) = self.participants.get_mut(identity) {
            participant.contributed = new_total;
        }
        self.total_contributed = aggregate;

        debug!(identity = %identity, amount = amount.0, new_total = new_total.0, "recorded contribution");
        Ok(ContributionReceipt {
            identity: identity.clone(),
            amount,
            new_total,
            newly_registered,
        })
    }

    /// Undo a contribution whose external debit failed. Restores the
    /// exact state prior to the matching [`contribute`](Self::contribute).
    pub fn revert_contribution(&mut self, receipt: &ContributionReceipt) {
        if receipt.newly_registered {
            self.registry.remove(&receipt.identity);
            self.participants.remove(&receipt.identity);
        } else if let Some(participant) = self.participants.get_mut(&receipt.identity) {
            participant.contributed = participant.contributed.saturating_sub(receipt.amount);
        }
        self.total_contributed = self.total_contributed.saturating_sub(receipt.amount);
        debug!(identity = %receipt.identity, amount = receipt.amount.0, "reverted contribution");
    }

    /// Zero a participant's contribution for a refund, conserving the
    /// aggregate total. The registry entry survives; the `refunded`
    /// marker makes the refund exactly-once.
    pub fn apply_refund(&mut self, identity: &Identity) -> LedgerResult<RefundReceipt> {
        self.ensure_unlocked()?;
        if !self.policy.is_self_service() {
            return Err(LedgerError::EntryModeMismatch {
                operation: "refund",
            });
        }
        let participant =
            self.participants
                .get_mut(identity)
                .ok_or_else(|| LedgerError::NotAContributor {
                    identity: identity.clone(),
                })?;
        if participant.contributed.is_zero() {
            return Err(LedgerError::NothingToRefund {
                identity: identity.clone(),
            });
        }
        if participant.refunded {
            return Err(LedgerError::AlreadyRefunded {
                identity: identity.clone(),
            });
        }
        let amount = participant.contributed;
        participant.contributed = Amount::ZERO;
        participant.refunded = true;
        self.total_contributed = self.total_contributed.saturating_sub(amount);

        debug!(identity = %identity, amount = amount.0, "refunded contribution");
        Ok(RefundReceipt {
            identity: identity.clone(),
            amount,
        })
    }

    /// Undo a refund whose external credit failed.
    pub fn revert_refund(&mut self, receipt: &RefundReceipt) {
        if let Some(participant) = self.participants.get_mut(&receipt.identity) {
            participant.contributed = receipt.amount;
            participant.refunded = false;
        }
        self.total_contributed = self.total_contributed.saturating_add(receipt.amount);
        debug!(identity = %receipt.identity, amount = receipt.amount.0, "reverted refund");
    }

    // ── administrative path ─────────────────────────────────────────

    /// Replace the listed participants' contributions wholesale.
    ///
    /// The whole batch is validated before anything mutates: length
    /// mismatch, batch size, null identities, zero amounts, duplicate
    /// identities, and aggregate overflow all reject the batch with the
    /// ledger untouched. Application then proceeds entry by entry.
    pub fn batch_set(
        &mut self,
        identities: &[Identity],
        amounts: &[Amount],
    ) -> LedgerResult<usize> {
        self.ensure_unlocked()?;
        let max_batch_size = match &self.policy {
            EntryPolicy::Administered { max_batch_size } => *max_batch_size,
            EntryPolicy::SelfService(_) => {
                return Err(LedgerError::EntryModeMismatch {
                    operation: "batch_set",
                })
            }
        };
        if identities.len() != amounts.len() {
            return Err(LedgerError::ArrayLengthMismatch {
                identities: identities.len(),
                amounts: amounts.len(),
            });
        }
        if identities.len() > max_batch_size {
            return Err(LedgerError::BatchTooLarge {
                len: identities.len(),
                max: max_batch_size,
            });
        }

        let mut seen = HashSet::with_capacity(identities.len());
        let mut projected = self.total_contributed;
        for (identity, amount) in identities.iter().zip(amounts) {
            if identity.is_null() {
                return Err(LedgerError::InvalidIdentity);
            }
            if amount.is_zero() {
                return Err(LedgerError::InvalidAmount);
            }
            if !seen.insert(identity) {
                return Err(LedgerError::DuplicateInBatch {
                    identity: identity.clone(),
                });
            }
            // Dry-run the total adjustment so overflow rejects the
            // batch before any entry is written.
            projected = projected
                .saturating_sub(self.contribution_of(identity))
                .checked_add(*amount)
                .ok_or(LedgerError::AmountOverflow)?;
        }

        for (identity, amount) in identities.iter().zip(amounts) {
            let previous = self.contribution_of(identity);
            if self.registry.insert(identity.clone()) {
                self.participants
                    .insert(identity.clone(), Participant::registered(*amount));
            } else if let Some(participant) = self.participants.get_mut(identity) {
                participant.contributed = *amount;
            }
            self.total_contributed = self
                .total_contributed
                .saturating_sub(previous)
                .saturating_add(*amount);
        }

        debug!(
            entries = identities.len(),
            total = self.total_contributed.0,
            "applied contribution batch"
        );
        Ok(identities.len())
    }

    /// Administrative correction: replace one participant's recorded
    /// contribution. Rejects zero; use
    /// [`remove_contributor`](Self::remove_contributor) instead.
    /// Returns the previous amount.
    pub fn update_contribution(
        &mut self,
        identity: &Identity,
        new_amount: Amount,
    ) -> LedgerResult<Amount> {
        self.ensure_unlocked()?;
        if identity.is_null() {
            return Err(LedgerError::InvalidIdentity);
        }
        if new_amount.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }
        let previous = match self.participants.get(identity) {
            Some(participant) => participant.contributed,
            None => {
                return Err(LedgerError::NotAContributor {
                    identity: identity.clone(),
                })
            }
        };
        let adjusted_total = self
            .total_contributed
            .saturating_sub(previous)
            .checked_add(new_amount)
            .ok_or(LedgerError::AmountOverflow)?;

        // Under a self-service policy an administrative correction must
        // still leave the ledger inside its declared bounds.
        if let Some(bounds) = self.policy.bounds() {
            if new_amount < bounds.min_per_participant {
                return Err(LedgerError::LimitViolation {
                    identity: identity.clone(),
                    kind: LimitKind::BelowMinimum {
                        resulting: new_amount,
                        min: bounds.min_per_participant,
                    },
                });
            }
            if new_amount > bounds.max_per_participant {
                return Err(LedgerError::LimitViolation {
                    identity: identity.clone(),
                    kind: LimitKind::AboveMaximum {
                        resulting: new_amount,
                        max: bounds.max_per_participant,
                    },
                });
            }
            if adjusted_total > bounds.hard_cap {
                return Err(LedgerError::LimitViolation {
                    identity: identity.clone(),
                    kind: LimitKind::HardCapExceeded {
                        resulting: adjusted_total,
                        hard_cap: bounds.hard_cap,
                    },
                });
            }
        }

        if let Some(participant) = self.participants.get_mut(identity) {
            participant.contributed = new_amount;
        }
        self.total_contributed = adjusted_total;

        debug!(identity = %identity, previous = previous.0, current = new_amount.0, "updated contribution");
        Ok(previous)
    }

    /// Administrative correction: excise a participant entirely.
    /// Returns the removed amount.
    pub fn remove_contributor(&mut self, identity: &Identity) -> LedgerResult<Amount> {
        self.ensure_unlocked()?;
        if identity.is_null() {
            return Err(LedgerError::InvalidIdentity);
        }
        let participant =
            self.participants
                .remove(identity)
                .ok_or_else(|| LedgerError::NotAContributor {
                    identity: identity.clone(),
                })?;
        self.registry.remove(identity);
        self.total_contributed = self.total_contributed.saturating_sub(participant.contributed);

        debug!(identity = %identity, amount = participant.contributed.0, "removed contributor");
        Ok(participant.contributed)
    }

    // ── bound setters ───────────────────────────────────────────────

    /// Lower or raise the per-participant minimum. Rejects a value that
    /// would strand an existing nonzero contribution below it.
    pub fn set_min_per_participant(&mut self, min: Amount) -> LedgerResult<()> {
        self.ensure_unlocked()?;
        let bounds = self.bounds_for("set_min_per_participant")?;
        if min.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }
        if min > bounds.max_per_participant {
            return Err(LedgerError::InvariantViolation {
                conflict: BoundConflict {
                    bound: "min-per-participant",
                    requested: min,
                    recorded: bounds.max_per_participant,
                    identity: None,
                },
            });
        }
        if let Some((identity, participant)) = self
            .iter_registered()
            .find(|(_, p)| !p.contributed.is_zero() && p.contributed < min)
        {
            return Err(LedgerError::InvariantViolation {
                conflict: BoundConflict {
                    bound: "min-per-participant",
                    requested: min,
                    recorded: participant.contributed,
                    identity: Some(identity.clone()),
                },
            });
        }
        if let EntryPolicy::SelfService(bounds) = &mut self.policy {
            bounds.min_per_participant = min;
        }
        debug!(min = min.0, "set minimum per participant");
        Ok(())
    }

    /// Raise or lower the per-participant maximum. Rejects a value any
    /// existing contribution already exceeds.
    pub fn set_max_per_participant(&mut self, max: Amount) -> LedgerResult<()> {
        self.ensure_unlocked()?;
        let bounds = self.bounds_for("set_max_per_participant")?;
        if max.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }
        if max < bounds.min_per_participant {
            return Err(LedgerError::InvariantViolation {
                conflict: BoundConflict {
                    bound: "max-per-participant",
                    requested: max,
                    recorded: bounds.min_per_participant,
                    identity: None,
                },
            });
        }
        if let Some((identity, participant)) =
            self.iter_registered().find(|(_, p)| p.contributed > max)
        {
            return Err(LedgerError::InvariantViolation {
                conflict: BoundConflict {
                    bound: "max-per-participant",
                    requested: max,
                    recorded: participant.contributed,
                    identity: Some(identity.clone()),
                },
            });
        }
        if let EntryPolicy::SelfService(bounds) = &mut self.policy {
            bounds.max_per_participant = max;
        }
        debug!(max = max.0, "set maximum per participant");
        Ok(())
    }

    /// Change the hard cap. Rejects a value below the current total.
    pub fn set_hard_cap(&mut self, hard_cap: Amount) -> LedgerResult<()> {
        self.ensure_unlocked()?;
        self.bounds_for("set_hard_cap")?;
        if hard_cap.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }
        if hard_cap < self.total_contributed {
            return Err(LedgerError::InvariantViolation {
                conflict: BoundConflict {
                    bound: "hard-cap",
                    requested: hard_cap,
                    recorded: self.total_contributed,
                    identity: None,
                },
            });
        }
        if let EntryPolicy::SelfService(bounds) = &mut self.policy {
            bounds.hard_cap = hard_cap;
        }
        debug!(hard_cap = hard_cap.0, "set hard cap");
        Ok(())
    }

    fn bounds_for(
        &self,
        operation: &'static str,
    ) -> LedgerResult<tranche_types::ContributionBounds> {
        self.policy
            .bounds()
            .copied()
            .ok_or(LedgerError::EntryModeMismatch { operation })
    }

    // ── settlement-side mutations ───────────────────────────────────
    //
    // These are called by the settlement engine once the ledger is
    // frozen; phase gating lives there.

    /// Write a participant's computed allocation.
    pub fn allocate(&mut self, identity: &Identity, allocation: Amount) -> LedgerResult<()> {
        let participant =
            self.participants
                .get_mut(identity)
                .ok_or_else(|| LedgerError::NotAContributor {
                    identity: identity.clone(),
                })?;
        participant.allocation = allocation;
        Ok(())
    }

    /// Consume a participant's allocation exactly once: zero it and set
    /// `has_claimed` in the same mutation. Returns the claimed amount.
    pub fn claim_allocation(&mut self, identity: &Identity) -> LedgerResult<Amount> {
        let participant =
            self.participants
                .get_mut(identity)
                .ok_or_else(|| LedgerError::NotAContributor {
                    identity: identity.clone(),
                })?;
        if participant.has_claimed || participant.allocation.is_zero() {
            return Err(LedgerError::NothingToClaim {
                identity: identity.clone(),
            });
        }
        let amount = participant.allocation;
        participant.allocation = Amount::ZERO;
        participant.has_claimed = true;
        Ok(amount)
    }

    /// Undo a claim whose external credit failed, restoring the
    /// allocation as claimable.
    pub fn revert_claim(&mut self, identity: &Identity, amount: Amount) {
        if let Some(participant) = self.participants.get_mut(identity) {
            participant.allocation = amount;
            participant.has_claimed = false;
        }
    }
}

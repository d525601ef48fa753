use thiserror::Error;
use tranche_types::{Amount, Identity};

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Which limit a rejected contribution would have violated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitKind {
    BelowMinimum { resulting: Amount, min: Amount },
    AboveMaximum { resulting: Amount, max: Amount },
    HardCapExceeded { resulting: Amount, hard_cap: Amount },
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::BelowMinimum { resulting, min } => {
                write!(f, "resulting total {resulting} is below the minimum {min}")
            }
            LimitKind::AboveMaximum { resulting, max } => {
                write!(f, "resulting total {resulting} is above the maximum {max}")
            }
            LimitKind::HardCapExceeded {
                resulting,
                hard_cap,
            } => {
                write!(
                    f,
                    "aggregate total {resulting} would exceed the hard cap {hard_cap}"
                )
            }
        }
    }
}

/// A bound change that would invalidate already-recorded state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundConflict {
    /// Which bound was being changed.
    pub bound: &'static str,
    /// The requested new value.
    pub requested: Amount,
    /// The recorded value the request conflicts with.
    pub recorded: Amount,
    /// The participant holding the conflicting contribution, if the
    /// conflict is per-participant rather than aggregate.
    pub identity: Option<Identity>,
}

impl std::fmt::Display for BoundConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.identity {
            Some(identity) => write!(
                f,
                "{} of {} conflicts with recorded contribution {} of {}",
                self.bound, self.requested, self.recorded, identity
            ),
            None => write!(
                f,
                "{} of {} conflicts with recorded value {}",
                self.bound, self.requested, self.recorded
            ),
        }
    }
}

/// Ledger-layer errors. Every variant carries the context a caller
/// needs to diagnose the rejection without replaying the call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("identity is null")]
    InvalidIdentity,

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("batch size limit must be positive")]
    InvalidBatchSize,

    #[error("amount arithmetic overflowed")]
    AmountOverflow,

    #[error("contribution limit violated for {identity}: {kind}")]
    LimitViolation { identity: Identity, kind: LimitKind },

    #[error("batch of {len} entries exceeds the maximum batch size {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("batch arrays differ in length: {identities} identities, {amounts} amounts")]
    ArrayLengthMismatch { identities: usize, amounts: usize },

    #[error("identity {identity} appears more than once in the batch")]
    DuplicateInBatch { identity: Identity },

    #[error("{identity} is not a registered contributor")]
    NotAContributor { identity: Identity },

    #[error("contributions are locked: allocations have been calculated")]
    ContributionsLocked,

    #[error("{operation} is not available under the configured entry policy")]
    EntryModeMismatch { operation: &'static str },

    #[error("bound change rejected: {conflict}")]
    InvariantViolation { conflict: BoundConflict },

    #[error("{identity} has no contribution to refund")]
    NothingToRefund { identity: Identity },

    #[error("{identity} has already been refunded")]
    AlreadyRefunded { identity: Identity },

    #[error("{identity} has nothing to claim")]
    NothingToClaim { identity: Identity },
}

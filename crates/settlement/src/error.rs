use thiserror::Error;
use tranche_ledger::LedgerError;
use tranche_types::{Amount, AssetId, DistributionPhase, Identity};

use crate::custody::CustodyError;

/// Result type for settlement operations.
pub type SettlementResult<T> = Result<T, SettlementError>;

/// Engine-layer errors. Ledger-layer rejections pass through
/// transparently so callers see one taxonomy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("caller {caller} is not an authorized administrator")]
    Unauthorized { caller: Identity },

    #[error("operations are suspended")]
    OperationsSuspended,

    #[error("{identity} is not on the allow list")]
    NotWhitelisted { identity: Identity },

    #[error("allocations have already been calculated")]
    AlreadyCalculated,

    #[error("allocations have not been calculated")]
    NotCalculated,

    #[error("no contributions have been recorded")]
    NoContributions,

    #[error("the custody balance for {asset} is zero")]
    NoPoolBalance { asset: AssetId },

    #[error("allocated {allocated} exceeds the distributable pool {pool}")]
    PoolExceeded { allocated: Amount, pool: Amount },

    #[error("claiming has not been enabled")]
    ClaimingNotEnabled,

    #[error("the claim window is closed")]
    ClaimWindowClosed,

    #[error("the claim window is active")]
    ClaimWindowActive,

    #[error("refunds are not allowed")]
    RefundsNotAllowed,

    #[error("no valid distribution asset is configured")]
    InvalidAsset,

    #[error("{operation} is illegal in phase {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: DistributionPhase,
    },

    #[error("value transfer failed: {0}")]
    TransferFailed(#[from] CustodyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

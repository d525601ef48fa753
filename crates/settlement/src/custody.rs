//! Value-custody collaborator.
//!
//! The engine never moves value itself; it instructs a custody provider
//! to pull contributions in, release claims and refunds out, and report
//! the custody balance that becomes the distributable pool. The
//! in-memory adapter is deterministic and test-friendly; production
//! embeddings supply their own provider.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tranche_types::{Amount, AssetId, Identity};

/// Errors from a custody provider. Always fatal to the enclosing
/// engine operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CustodyError {
    #[error("insufficient funds for {identity}: required {required} {asset}, available {available}")]
    InsufficientFunds {
        identity: Identity,
        asset: AssetId,
        required: Amount,
        available: Amount,
    },

    #[error("transfer rejected: {0}")]
    Rejected(String),

    #[error("custody backend error: {0}")]
    Backend(String),
}

/// Moves value between participant accounts and the custody vault.
#[async_trait]
pub trait CustodyProvider: Send + Sync {
    /// Pull `amount` of `asset` from `from` into custody.
    async fn debit(
        &self,
        from: &Identity,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), CustodyError>;

    /// Release `amount` of `asset` from custody to `to`.
    async fn credit(
        &self,
        to: &Identity,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), CustodyError>;

    /// The amount of `asset` currently held in custody.
    async fn balance_of(&self, asset: &AssetId) -> Result<Amount, CustodyError>;
}

/// In-memory custody adapter: participant accounts plus one vault per
/// asset.
#[derive(Debug, Default)]
pub struct InMemoryCustody {
    accounts: RwLock<HashMap<(Identity, AssetId), Amount>>,
    vault: RwLock<HashMap<AssetId, Amount>>,
}

impl InMemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a participant's external account.
    pub fn fund_account(
        &self,
        identity: &Identity,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), CustodyError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| CustodyError::Backend("accounts lock poisoned".to_string()))?;
        let balance = accounts
            .entry((identity.clone(), asset.clone()))
            .or_insert(Amount::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| CustodyError::Backend("account balance overflow".to_string()))?;
        Ok(())
    }

    /// Deposit directly into the vault, e.g. to seed the distributable
    /// pool before calculation.
    pub fn deposit_to_vault(&self, asset: &AssetId, amount: Amount) -> Result<(), CustodyError> {
        let mut vault = self
            .vault
            .write()
            .map_err(|_| CustodyError::Backend("vault lock poisoned".to_string()))?;
        let balance = vault.entry(asset.clone()).or_insert(Amount::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| CustodyError::Backend("vault balance overflow".to_string()))?;
        Ok(())
    }

    pub fn account_balance(
        &self,
        identity: &Identity,
        asset: &AssetId,
    ) -> Result<Amount, CustodyError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| CustodyError::Backend("accounts lock poisoned".to_string()))?;
        Ok(accounts
            .get(&(identity.clone(), asset.clone()))
            .copied()
            .unwrap_or(Amount::ZERO))
    }

    pub fn vault_balance(&self, asset: &AssetId) -> Result<Amount, CustodyError> {
        let vault = self
            .vault
            .read()
            .map_err(|_| CustodyError::Backend("vault lock poisoned".to_string()))?;
        Ok(vault.get(asset).copied().unwrap_or(Amount::ZERO))
    }
}

#[async_trait]
impl CustodyProvider for InMemoryCustody {
    async fn debit(
        &self,
        from: &Identity,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), CustodyError> {
        {
            let mut accounts = self
                .accounts
                .write()
                .map_err(|_| CustodyError::Backend("accounts lock poisoned".to_string()))?;
            let balance = accounts
                .entry((from.clone(), asset.clone()))
                .or_insert(Amount::ZERO);
            let remaining =
                balance
                    .checked_sub(amount)
                    .ok_or_else(|| CustodyError::InsufficientFunds {
                        identity: from.clone(),
                        asset: asset.clone(),
                        required: amount,
                        available: *balance,
                    })?;
            *balance = remaining;
        }
        self.deposit_to_vault(asset, amount)
    }

    async fn credit(
        &self,
        to: &Identity,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), CustodyError> {
        {
            let mut vault = self
                .vault
                .write()
                .map_err(|_| CustodyError::Backend("vault lock poisoned".to_string()))?;
            let balance = vault.entry(asset.clone()).or_insert(Amount::ZERO);
            let remaining =
                balance
                    .checked_sub(amount)
                    .ok_or_else(|| CustodyError::InsufficientFunds {
                        identity: to.clone(),
                        asset: asset.clone(),
                        required: amount,
                        available: *balance,
                    })?;
            *balance = remaining;
        }
        self.fund_account(to, asset, amount)
    }

    async fn balance_of(&self, asset: &AssetId) -> Result<Amount, CustodyError> {
        self.vault_balance(asset)
    }
}

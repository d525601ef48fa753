//! The settlement engine: phase machine, allocation arithmetic, and the
//! claim lifecycle over a wrapped contribution ledger.
//!
//! Every operation acquires one exclusive lock for its whole duration,
//! including across custody calls. That lock is the reentrancy defense:
//! operations serialize in arrival order, and no caller can observe
//! state older than the state a concurrent operation is about to expose
//! to an external transfer. Balance-affecting fields are written before
//! the transfer is issued; a failed transfer rolls the write back while
//! the intermediate state is still unobservable.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tranche_ledger::{ContributionLedger, LedgerError};
use tranche_types::{
    Amount, AssetId, DistributionPhase, EventEnvelope, Identity, Participant, SettlementEvent,
};

use crate::custody::CustodyProvider;
use crate::error::{SettlementError, SettlementResult};
use crate::events::{EventSink, TracingEventSink};
use crate::policy::{AdminPolicy, AllowAll, AllowList, PauseSwitch, PauseToggle};

/// A point-in-time view of the engine, for dashboards and tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSummary {
    pub phase: DistributionPhase,
    pub participants: usize,
    pub total_contributed: Amount,
    pub distributable_pool: Amount,
    pub total_allocated: Amount,
    pub refunds_allowed: bool,
}

struct EngineState {
    ledger: ContributionLedger,
    phase: DistributionPhase,
    contribution_asset: AssetId,
    distribution_asset: Option<AssetId>,
    distributable_pool: Amount,
    total_allocated: Amount,
    claim_ever_opened: bool,
    refunds_allowed: bool,
}

/// The allocation settlement engine.
///
/// Owns the contribution ledger for the duration of a distribution
/// round and drives it through the phase machine:
///
/// ```text
/// Collecting → AllocationCalculated → ClaimEnabled → ClaimOpen ⇄ ClaimClosed
/// ```
pub struct SettlementEngine {
    state: Mutex<EngineState>,
    custody: Arc<dyn CustodyProvider>,
    admin: Arc<dyn AdminPolicy>,
    allow_list: Arc<dyn AllowList>,
    pause: Arc<dyn PauseSwitch>,
    events: Arc<dyn EventSink>,
}

impl SettlementEngine {
    /// Create an engine in the `Collecting` phase.
    ///
    /// Contributions and refunds move `contribution_asset`; the
    /// distribution asset is configured separately before calculation.
    /// Defaults: every identity is allow-listed, operations are not
    /// suspended, and events go to the tracing subscriber.
    pub fn new(
        ledger: ContributionLedger,
        contribution_asset: AssetId,
        custody: Arc<dyn CustodyProvider>,
        admin: Arc<dyn AdminPolicy>,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState {
                ledger,
                phase: DistributionPhase::Collecting,
                contribution_asset,
                distribution_asset: None,
                distributable_pool: Amount::ZERO,
                total_allocated: Amount::ZERO,
                claim_ever_opened: false,
                refunds_allowed: false,
            }),
            custody,
            admin,
            allow_list: Arc::new(AllowAll),
            pause: Arc::new(PauseToggle::new()),
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_allow_list(mut self, allow_list: Arc<dyn AllowList>) -> Self {
        self.allow_list = allow_list;
        self
    }

    pub fn with_pause_switch(mut self, pause: Arc<dyn PauseSwitch>) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Configure the distribution asset at construction time instead of
    /// through [`set_distribution_asset`](Self::set_distribution_asset).
    pub fn with_distribution_asset(mut self, asset: AssetId) -> Self {
        self.state.get_mut().distribution_asset = Some(asset);
        self
    }

    // ── guards ──────────────────────────────────────────────────────

    fn ensure_active(&self) -> SettlementResult<()> {
        if self.pause.is_suspended() {
            return Err(SettlementError::OperationsSuspended);
        }
        Ok(())
    }

    fn ensure_admin(&self, caller: &Identity) -> SettlementResult<()> {
        if !self.admin.is_authorized_admin(caller) {
            return Err(SettlementError::Unauthorized {
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    async fn emit(&self, event: SettlementEvent) {
        self.events.emit(EventEnvelope::now(event)).await;
    }

    // ── observation ─────────────────────────────────────────────────

    pub async fn phase(&self) -> DistributionPhase {
        self.state.lock().await.phase
    }

    pub async fn total_contributed(&self) -> Amount {
        self.state.lock().await.ledger.total_contributed()
    }

    pub async fn participant(&self, identity: &Identity) -> Option<Participant> {
        self.state.lock().await.ledger.participant(identity).cloned()
    }

    /// A participant's current (unclaimed) allocation, zero if unknown.
    pub async fn allocation_of(&self, identity: &Identity) -> Amount {
        self.state
            .lock()
            .await
            .ledger
            .participant(identity)
            .map(|p| p.allocation)
            .unwrap_or(Amount::ZERO)
    }

    pub async fn summary(&self) -> EngineSummary {
        let state = self.state.lock().await;
        EngineSummary {
            phase: state.phase,
            participants: state.ledger.registered_count(),
            total_contributed: state.ledger.total_contributed(),
            distributable_pool: state.distributable_pool,
            total_allocated: state.total_allocated,
            refunds_allowed: state.refunds_allowed,
        }
    }

    // ── collection: self-service path ───────────────────────────────

    /// Record a contribution from `caller` and pull the funds into
    /// custody. The debit is the final step; if it fails the ledger is
    /// restored and the operation reports `TransferFailed`.
    pub async fn contribute(
        &self,
        caller: &Identity,
        amount: Amount,
        proof: &[u8],
    ) -> SettlementResult<Amount> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if state.ledger.is_locked() {
            return Err(LedgerError::ContributionsLocked.into());
        }
        if !self.allow_list.verify(caller, proof) {
            return Err(SettlementError::NotWhitelisted {
                identity: caller.clone(),
            });
        }
        let asset = state.contribution_asset.clone();
        let receipt = state.ledger.contribute(caller, amount)?;
        if let Err(err) = self.custody.debit(caller, &asset, amount).await {
            state.ledger.revert_contribution(&receipt);
            warn!(identity = %caller, amount = amount.0, error = %err, "contribution debit failed, ledger restored");
            return Err(SettlementError::TransferFailed(err));
        }
        self.emit(SettlementEvent::ContributionRecorded {
            identity: caller.clone(),
            amount,
            new_total: receipt.new_total,
        })
        .await;
        Ok(receipt.new_total)
    }

    /// Return `caller`'s entire contribution from custody. Legal only
    /// while collecting and after the administrator has allowed
    /// refunds; exactly-once per participant.
    pub async fn refund(&self, caller: &Identity) -> SettlementResult<Amount> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if !state.refunds_allowed {
            return Err(SettlementError::RefundsNotAllowed);
        }
        let asset = state.contribution_asset.clone();
        let receipt = state.ledger.apply_refund(caller)?;
        if let Err(err) = self.custody.credit(caller, &asset, receipt.amount).await {
            state.ledger.revert_refund(&receipt);
            warn!(identity = %caller, amount = receipt.amount.0, error = %err, "refund credit failed, ledger restored");
            return Err(SettlementError::TransferFailed(err));
        }
        self.emit(SettlementEvent::Refunded {
            identity: caller.clone(),
            amount: receipt.amount,
        })
        .await;
        Ok(receipt.amount)
    }

    // ── collection: administrative path ─────────────────────────────

    /// Replace the listed participants' recorded contributions.
    pub async fn batch_set(
        &self,
        caller: &Identity,
        identities: &[Identity],
        amounts: &[Amount],
    ) -> SettlementResult<usize> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        let entries = state.ledger.batch_set(identities, amounts)?;
        self.emit(SettlementEvent::ContributionsBatchSet {
            entries,
            total_contributed: state.ledger.total_contributed(),
        })
        .await;
        Ok(entries)
    }

    /// Correct one participant's recorded contribution. Returns the
    /// previous amount.
    pub async fn update_contribution(
        &self,
        caller: &Identity,
        identity: &Identity,
        new_amount: Amount,
    ) -> SettlementResult<Amount> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        let previous = state.ledger.update_contribution(identity, new_amount)?;
        self.emit(SettlementEvent::ContributionUpdated {
            identity: identity.clone(),
            previous,
            current: new_amount,
        })
        .await;
        Ok(previous)
    }

    /// Excise a participant. Returns the removed amount.
    pub async fn remove_contributor(
        &self,
        caller: &Identity,
        identity: &Identity,
    ) -> SettlementResult<Amount> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        let amount = state.ledger.remove_contributor(identity)?;
        self.emit(SettlementEvent::ContributorRemoved {
            identity: identity.clone(),
            amount,
        })
        .await;
        Ok(amount)
    }

    pub async fn set_min_per_participant(
        &self,
        caller: &Identity,
        min: Amount,
    ) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        state.ledger.set_min_per_participant(min)?;
        self.emit(SettlementEvent::MinPerParticipantSet { min }).await;
        Ok(())
    }

    pub async fn set_max_per_participant(
        &self,
        caller: &Identity,
        max: Amount,
    ) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        state.ledger.set_max_per_participant(max)?;
        self.emit(SettlementEvent::MaxPerParticipantSet { max }).await;
        Ok(())
    }

    pub async fn set_hard_cap(&self, caller: &Identity, hard_cap: Amount) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        state.ledger.set_hard_cap(hard_cap)?;
        self.emit(SettlementEvent::HardCapSet { hard_cap }).await;
        Ok(())
    }

    /// Allow or disallow refunds while collecting. Refunds and
    /// settlement are mutually exclusive once calculation freezes the
    /// ledger.
    pub async fn set_refunds_allowed(
        &self,
        caller: &Identity,
        allowed: bool,
    ) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if state.phase.is_calculated() {
            return Err(SettlementError::AlreadyCalculated);
        }
        state.refunds_allowed = allowed;
        self.emit(SettlementEvent::RefundsAllowedSet { allowed }).await;
        Ok(())
    }

    /// Configure the asset that will be distributed. Legal only before
    /// calculation and before the claim window has ever been opened.
    pub async fn set_distribution_asset(
        &self,
        caller: &Identity,
        asset: AssetId,
    ) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if state.claim_ever_opened {
            return Err(SettlementError::ClaimWindowActive);
        }
        if state.phase.is_calculated() {
            return Err(SettlementError::AlreadyCalculated);
        }
        if asset.is_null() {
            return Err(SettlementError::InvalidAsset);
        }
        state.distribution_asset = Some(asset.clone());
        self.emit(SettlementEvent::DistributionAssetSet { asset }).await;
        Ok(())
    }

    // ── settlement ──────────────────────────────────────────────────

    /// Freeze the ledger and compute every participant's proportional
    /// share of the distributable pool.
    ///
    /// The pool is the custody balance of the distribution asset,
    /// sampled exactly once here. Each share is a single floor
    /// division in 128-bit intermediate arithmetic, so truncation can
    /// only under-allocate; the `PoolExceeded` check guards against
    /// implementation error, not a reachable runtime condition.
    /// Returns the total allocated.
    pub async fn calculate_allocations(&self, caller: &Identity) -> SettlementResult<Amount> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if state.phase.is_calculated() {
            return Err(SettlementError::AlreadyCalculated);
        }
        let asset = state
            .distribution_asset
            .clone()
            .ok_or(SettlementError::InvalidAsset)?;
        let total = state.ledger.total_contributed();
        if total.is_zero() {
            return Err(SettlementError::NoContributions);
        }
        let pool = self
            .custody
            .balance_of(&asset)
            .await
            .map_err(SettlementError::TransferFailed)?;
        if pool.is_zero() {
            return Err(SettlementError::NoPoolBalance { asset });
        }

        // Compute every share before writing any, so a defensive
        // failure leaves the engine still in `Collecting`.
        let mut shares = Vec::with_capacity(state.ledger.registered_count());
        let mut total_allocated = Amount::ZERO;
        for (identity, participant) in state.ledger.iter_registered() {
            if participant.contributed.is_zero() {
                continue;
            }
            let share = proportional_share(participant.contributed, pool, total);
            total_allocated = total_allocated
                .checked_add(share)
                .ok_or(LedgerError::AmountOverflow)?;
            shares.push((identity.clone(), share));
        }
        if total_allocated > pool {
            error!(
                allocated = total_allocated.0,
                pool = pool.0,
                "computed allocations exceed the pool"
            );
            return Err(SettlementError::PoolExceeded {
                allocated: total_allocated,
                pool,
            });
        }

        for (identity, share) in &shares {
            state.ledger.allocate(identity, *share)?;
        }
        state.ledger.lock();
        state.phase = DistributionPhase::AllocationCalculated;
        state.distributable_pool = pool;
        state.total_allocated = total_allocated;

        info!(
            participants = shares.len(),
            total_contributed = total.0,
            pool = pool.0,
            allocated = total_allocated.0,
            "allocations calculated"
        );
        self.emit(SettlementEvent::AllocationsCalculated {
            participants: shares.len(),
            total_contributed: total,
            distributable_pool: pool,
            total_allocated,
        })
        .await;
        Ok(total_allocated)
    }

    /// Flip the claim-enabled flag. Legal only immediately after
    /// calculation.
    pub async fn enable_claim(&self, caller: &Identity) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        match state.phase {
            DistributionPhase::AllocationCalculated => {}
            DistributionPhase::Collecting => return Err(SettlementError::NotCalculated),
            phase => {
                return Err(SettlementError::InvalidPhase {
                    operation: "enable_claim",
                    phase,
                })
            }
        }
        state.phase = DistributionPhase::ClaimEnabled;
        self.emit(SettlementEvent::ClaimEnabled).await;
        Ok(())
    }

    /// Open (or re-open) the claim window.
    pub async fn open_claim_period(&self, caller: &Identity) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        match state.phase {
            DistributionPhase::ClaimEnabled | DistributionPhase::ClaimClosed => {}
            DistributionPhase::Collecting => return Err(SettlementError::NotCalculated),
            DistributionPhase::AllocationCalculated => {
                return Err(SettlementError::ClaimingNotEnabled)
            }
            phase => {
                return Err(SettlementError::InvalidPhase {
                    operation: "open_claim_period",
                    phase,
                })
            }
        }
        state.phase = DistributionPhase::ClaimOpen;
        state.claim_ever_opened = true;
        self.emit(SettlementEvent::ClaimPeriodOpened).await;
        Ok(())
    }

    /// Close the claim window. It may be re-opened later.
    pub async fn close_claim_period(&self, caller: &Identity) -> SettlementResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        if !state.phase.is_claim_open() {
            return Err(SettlementError::InvalidPhase {
                operation: "close_claim_period",
                phase: state.phase,
            });
        }
        state.phase = DistributionPhase::ClaimClosed;
        self.emit(SettlementEvent::ClaimPeriodClosed).await;
        Ok(())
    }

    /// Claim `caller`'s allocation, exactly once, while the window is
    /// open.
    ///
    /// The allocation is zeroed and `has_claimed` set before the
    /// custody credit is issued; if the credit fails, the write is
    /// rolled back under the still-held operation lock and the claim
    /// remains claimable. Rounding dust is never paid out here; it
    /// stays in the pool for the administrative sweep.
    pub async fn claim(&self, caller: &Identity) -> SettlementResult<Amount> {
        self.ensure_active()?;
        let mut state = self.state.lock().await;
        match state.phase {
            DistributionPhase::ClaimOpen => {}
            DistributionPhase::Collecting | DistributionPhase::AllocationCalculated => {
                return Err(SettlementError::ClaimingNotEnabled)
            }
            DistributionPhase::ClaimEnabled | DistributionPhase::ClaimClosed => {
                return Err(SettlementError::ClaimWindowClosed)
            }
        }
        let asset = state
            .distribution_asset
            .clone()
            .ok_or(SettlementError::InvalidAsset)?;
        let amount = state.ledger.claim_allocation(caller)?;
        if let Err(err) = self.custody.credit(caller, &asset, amount).await {
            state.ledger.revert_claim(caller, amount);
            warn!(identity = %caller, amount = amount.0, error = %err, "claim credit failed, allocation restored");
            return Err(SettlementError::TransferFailed(err));
        }
        debug!(identity = %caller, amount = amount.0, "allocation claimed");
        self.emit(SettlementEvent::Claimed {
            identity: caller.clone(),
            amount,
        })
        .await;
        Ok(amount)
    }

    /// Sweep the entire residual distribution-asset balance to the
    /// administrator. Legal once calculated and while the claim window
    /// is not open; correctness relies on successful claims having
    /// already debited custody, so the sweep moves the whole remainder
    /// rather than a computed figure.
    pub async fn withdraw_unclaimed(&self, caller: &Identity) -> SettlementResult<Amount> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let state = self.state.lock().await;
        match state.phase {
            DistributionPhase::Collecting => return Err(SettlementError::NotCalculated),
            DistributionPhase::ClaimOpen => return Err(SettlementError::ClaimWindowActive),
            _ => {}
        }
        let asset = state
            .distribution_asset
            .clone()
            .ok_or(SettlementError::InvalidAsset)?;
        let remaining = self
            .custody
            .balance_of(&asset)
            .await
            .map_err(SettlementError::TransferFailed)?;
        if remaining.is_zero() {
            return Err(SettlementError::NoPoolBalance { asset });
        }
        self.custody
            .credit(caller, &asset, remaining)
            .await
            .map_err(SettlementError::TransferFailed)?;
        info!(to = %caller, amount = remaining.0, "unclaimed balance withdrawn");
        self.emit(SettlementEvent::UnclaimedWithdrawn {
            to: caller.clone(),
            amount: remaining,
        })
        .await;
        Ok(remaining)
    }

    /// Sweep the collected contribution-asset balance to the
    /// administrator once collection is over.
    pub async fn withdraw_contributions(&self, caller: &Identity) -> SettlementResult<Amount> {
        self.ensure_admin(caller)?;
        self.ensure_active()?;
        let state = self.state.lock().await;
        if !state.phase.is_calculated() {
            return Err(SettlementError::NotCalculated);
        }
        let asset = state.contribution_asset.clone();
        let collected = self
            .custody
            .balance_of(&asset)
            .await
            .map_err(SettlementError::TransferFailed)?;
        if collected.is_zero() {
            return Err(SettlementError::NoPoolBalance { asset });
        }
        self.custody
            .credit(caller, &asset, collected)
            .await
            .map_err(SettlementError::TransferFailed)?;
        info!(to = %caller, amount = collected.0, "collected contributions withdrawn");
        self.emit(SettlementEvent::ContributionsWithdrawn {
            to: caller.clone(),
            amount: collected,
        })
        .await;
        Ok(collected)
    }
}

/// One floor division per participant; truncation can only lose value
/// to dust, never create it.
fn proportional_share(contributed: Amount, pool: Amount, total: Amount) -> Amount {
    if total.is_zero() {
        return Amount::ZERO;
    }
    let share = (contributed.0 as u128 * pool.0 as u128) / (total.0 as u128);
    Amount(u64::try_from(share).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{CustodyError, InMemoryCustody};
    use crate::events::RecordingEventSink;
    use crate::policy::{SingleAdmin, StaticAllowList};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tranche_types::{ContributionBounds, EntryPolicy};

    fn admin() -> Identity {
        Identity::new("admin")
    }

    fn usd() -> AssetId {
        AssetId::new("USD")
    }

    fn tok() -> AssetId {
        AssetId::new("TOK")
    }

    fn id(name: &str) -> Identity {
        Identity::new(name)
    }

    fn self_service_ledger(min: u64, max: u64, cap: u64) -> ContributionLedger {
        ContributionLedger::new(EntryPolicy::SelfService(ContributionBounds {
            min_per_participant: Amount(min),
            max_per_participant: Amount(max),
            hard_cap: Amount(cap),
        }))
        .expect("valid bounds")
    }

    fn administered_ledger(max_batch_size: usize) -> ContributionLedger {
        ContributionLedger::new(EntryPolicy::Administered { max_batch_size })
            .expect("valid policy")
    }

    struct Harness {
        engine: SettlementEngine,
        custody: Arc<InMemoryCustody>,
        events: Arc<RecordingEventSink>,
        pause: Arc<PauseToggle>,
    }

    fn harness(ledger: ContributionLedger) -> Harness {
        let custody = Arc::new(InMemoryCustody::new());
        let events = Arc::new(RecordingEventSink::new());
        let pause = Arc::new(PauseToggle::new());
        let engine = SettlementEngine::new(
            ledger,
            usd(),
            custody.clone(),
            Arc::new(SingleAdmin::new(admin())),
        )
        .with_pause_switch(pause.clone())
        .with_event_sink(events.clone())
        .with_distribution_asset(tok());
        Harness {
            engine,
            custody,
            events,
            pause,
        }
    }

    async fn fund_and_contribute(h: &Harness, name: &str, amount: u64) {
        let identity = id(name);
        h.custody
            .fund_account(&identity, &usd(), Amount(amount))
            .unwrap();
        h.engine
            .contribute(&identity, Amount(amount), b"")
            .await
            .unwrap();
    }

    /// Custody wrapper whose debit/credit legs can be switched off.
    #[derive(Default)]
    struct FlakyCustody {
        inner: InMemoryCustody,
        fail_debit: AtomicBool,
        fail_credit: AtomicBool,
    }

    #[async_trait]
    impl CustodyProvider for FlakyCustody {
        async fn debit(
            &self,
            from: &Identity,
            asset: &AssetId,
            amount: Amount,
        ) -> Result<(), CustodyError> {
            if self.fail_debit.load(Ordering::SeqCst) {
                return Err(CustodyError::Rejected("debit leg disabled".to_string()));
            }
            self.inner.debit(from, asset, amount).await
        }

        async fn credit(
            &self,
            to: &Identity,
            asset: &AssetId,
            amount: Amount,
        ) -> Result<(), CustodyError> {
            if self.fail_credit.load(Ordering::SeqCst) {
                return Err(CustodyError::Rejected("credit leg disabled".to_string()));
            }
            self.inner.credit(to, asset, amount).await
        }

        async fn balance_of(&self, asset: &AssetId) -> Result<Amount, CustodyError> {
            self.inner.balance_of(asset).await
        }
    }

    #[tokio::test]
    async fn full_lifecycle_distributes_exact_proportions() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;
        fund_and_contribute(&h, "bob", 200).await;
        fund_and_contribute(&h, "carol", 300).await;
        h.custody.deposit_to_vault(&tok(), Amount(900)).unwrap();

        let allocated = h.engine.calculate_allocations(&admin()).await.unwrap();
        assert_eq!(allocated, Amount(900));
        assert_eq!(h.engine.allocation_of(&id("alice")).await, Amount(150));
        assert_eq!(h.engine.allocation_of(&id("bob")).await, Amount(300));
        assert_eq!(h.engine.allocation_of(&id("carol")).await, Amount(450));

        h.engine.enable_claim(&admin()).await.unwrap();
        h.engine.open_claim_period(&admin()).await.unwrap();

        assert_eq!(h.engine.claim(&id("alice")).await.unwrap(), Amount(150));
        assert_eq!(h.engine.claim(&id("bob")).await.unwrap(), Amount(300));
        assert_eq!(h.engine.claim(&id("carol")).await.unwrap(), Amount(450));

        assert_eq!(
            h.custody.account_balance(&id("alice"), &tok()).unwrap(),
            Amount(150)
        );
        assert_eq!(h.custody.vault_balance(&tok()).unwrap(), Amount::ZERO);

        let summary = h.engine.summary().await;
        assert_eq!(summary.phase, DistributionPhase::ClaimOpen);
        assert_eq!(summary.total_allocated, Amount(900));
        assert_eq!(summary.distributable_pool, Amount(900));
    }

    #[tokio::test]
    async fn rounding_dust_stays_in_pool_and_is_swept() {
        let h = harness(administered_ledger(10));
        h.engine
            .batch_set(
                &admin(),
                &[id("a"), id("b"), id("c")],
                &[Amount(1), Amount(1), Amount(1)],
            )
            .await
            .unwrap();
        h.custody.deposit_to_vault(&tok(), Amount(10)).unwrap();

        let allocated = h.engine.calculate_allocations(&admin()).await.unwrap();
        assert_eq!(allocated, Amount(9));
        for name in ["a", "b", "c"] {
            assert_eq!(h.engine.allocation_of(&id(name)).await, Amount(3));
        }

        h.engine.enable_claim(&admin()).await.unwrap();
        h.engine.open_claim_period(&admin()).await.unwrap();
        for name in ["a", "b", "c"] {
            h.engine.claim(&id(name)).await.unwrap();
        }
        assert_eq!(h.custody.vault_balance(&tok()).unwrap(), Amount(1));

        h.engine.close_claim_period(&admin()).await.unwrap();
        let swept = h.engine.withdraw_unclaimed(&admin()).await.unwrap();
        assert_eq!(swept, Amount(1));
        assert_eq!(
            h.custody.account_balance(&admin(), &tok()).unwrap(),
            Amount(1)
        );
    }

    #[tokio::test]
    async fn claim_is_exactly_once() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;
        h.custody.deposit_to_vault(&tok(), Amount(100)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        h.engine.enable_claim(&admin()).await.unwrap();
        h.engine.open_claim_period(&admin()).await.unwrap();

        h.engine.claim(&id("alice")).await.unwrap();
        let err = h.engine.claim(&id("alice")).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Ledger(LedgerError::NothingToClaim { .. })
        ));
    }

    #[tokio::test]
    async fn claim_respects_phase_gating() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;

        assert_eq!(
            h.engine.claim(&id("alice")).await.unwrap_err(),
            SettlementError::ClaimingNotEnabled
        );

        h.custody.deposit_to_vault(&tok(), Amount(100)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        assert_eq!(
            h.engine.claim(&id("alice")).await.unwrap_err(),
            SettlementError::ClaimingNotEnabled
        );

        h.engine.enable_claim(&admin()).await.unwrap();
        assert_eq!(
            h.engine.claim(&id("alice")).await.unwrap_err(),
            SettlementError::ClaimWindowClosed
        );

        h.engine.open_claim_period(&admin()).await.unwrap();
        h.engine.close_claim_period(&admin()).await.unwrap();
        assert_eq!(
            h.engine.claim(&id("alice")).await.unwrap_err(),
            SettlementError::ClaimWindowClosed
        );

        // The open/close pair may cycle; a re-opened window pays out.
        h.engine.open_claim_period(&admin()).await.unwrap();
        assert_eq!(h.engine.claim(&id("alice")).await.unwrap(), Amount(100));
    }

    #[tokio::test]
    async fn calculate_allocations_preconditions_and_idempotence() {
        let h = harness(self_service_ledger(10, 500, 1000));
        assert_eq!(
            h.engine.calculate_allocations(&admin()).await.unwrap_err(),
            SettlementError::NoContributions
        );

        fund_and_contribute(&h, "alice", 100).await;
        assert!(matches!(
            h.engine.calculate_allocations(&admin()).await.unwrap_err(),
            SettlementError::NoPoolBalance { .. }
        ));

        h.custody.deposit_to_vault(&tok(), Amount(50)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        assert_eq!(
            h.engine.calculate_allocations(&admin()).await.unwrap_err(),
            SettlementError::AlreadyCalculated
        );
    }

    #[tokio::test]
    async fn ledger_is_frozen_after_calculation() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;
        h.custody.deposit_to_vault(&tok(), Amount(50)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();

        h.custody
            .fund_account(&id("alice"), &usd(), Amount(100))
            .unwrap();
        assert_eq!(
            h.engine
                .contribute(&id("alice"), Amount(50), b"")
                .await
                .unwrap_err(),
            SettlementError::Ledger(LedgerError::ContributionsLocked)
        );
        assert_eq!(
            h.engine
                .update_contribution(&admin(), &id("alice"), Amount(50))
                .await
                .unwrap_err(),
            SettlementError::Ledger(LedgerError::ContributionsLocked)
        );
        assert_eq!(
            h.engine
                .remove_contributor(&admin(), &id("alice"))
                .await
                .unwrap_err(),
            SettlementError::Ledger(LedgerError::ContributionsLocked)
        );
    }

    #[tokio::test]
    async fn failed_debit_leaves_ledger_unchanged() {
        let custody = Arc::new(FlakyCustody::default());
        custody
            .inner
            .fund_account(&id("alice"), &usd(), Amount(100))
            .unwrap();
        custody.fail_debit.store(true, Ordering::SeqCst);

        let engine = SettlementEngine::new(
            self_service_ledger(10, 500, 1000),
            usd(),
            custody.clone(),
            Arc::new(SingleAdmin::new(admin())),
        )
        .with_distribution_asset(tok());

        let err = engine
            .contribute(&id("alice"), Amount(100), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::TransferFailed(_)));
        assert_eq!(engine.total_contributed().await, Amount::ZERO);
        assert!(engine.participant(&id("alice")).await.is_none());

        // The same contribution succeeds once the leg recovers.
        custody.fail_debit.store(false, Ordering::SeqCst);
        engine
            .contribute(&id("alice"), Amount(100), b"")
            .await
            .unwrap();
        assert_eq!(engine.total_contributed().await, Amount(100));
    }

    #[tokio::test]
    async fn failed_claim_credit_keeps_allocation_claimable() {
        let custody = Arc::new(FlakyCustody::default());
        custody
            .inner
            .fund_account(&id("alice"), &usd(), Amount(100))
            .unwrap();
        custody.inner.deposit_to_vault(&tok(), Amount(100)).unwrap();

        let engine = SettlementEngine::new(
            self_service_ledger(10, 500, 1000),
            usd(),
            custody.clone(),
            Arc::new(SingleAdmin::new(admin())),
        )
        .with_distribution_asset(tok());

        engine
            .contribute(&id("alice"), Amount(100), b"")
            .await
            .unwrap();
        engine.calculate_allocations(&admin()).await.unwrap();
        engine.enable_claim(&admin()).await.unwrap();
        engine.open_claim_period(&admin()).await.unwrap();

        custody.fail_credit.store(true, Ordering::SeqCst);
        let err = engine.claim(&id("alice")).await.unwrap_err();
        assert!(matches!(err, SettlementError::TransferFailed(_)));

        let participant = engine.participant(&id("alice")).await.unwrap();
        assert!(!participant.has_claimed);
        assert_eq!(participant.allocation, Amount(100));

        custody.fail_credit.store(false, Ordering::SeqCst);
        assert_eq!(engine.claim(&id("alice")).await.unwrap(), Amount(100));
    }

    #[tokio::test]
    async fn pause_gates_every_mutating_operation() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;
        h.pause.pause().unwrap();

        assert_eq!(
            h.engine
                .contribute(&id("alice"), Amount(10), b"")
                .await
                .unwrap_err(),
            SettlementError::OperationsSuspended
        );
        assert_eq!(
            h.engine.calculate_allocations(&admin()).await.unwrap_err(),
            SettlementError::OperationsSuspended
        );
        assert_eq!(
            h.engine.claim(&id("alice")).await.unwrap_err(),
            SettlementError::OperationsSuspended
        );
        assert_eq!(
            h.engine
                .set_hard_cap(&admin(), Amount(2000))
                .await
                .unwrap_err(),
            SettlementError::OperationsSuspended
        );

        h.pause.unpause().unwrap();
        h.engine
            .set_hard_cap(&admin(), Amount(2000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn administrative_operations_require_authorization() {
        let h = harness(administered_ledger(10));
        let mallory = id("mallory");

        let err = h
            .engine
            .batch_set(&mallory, &[id("a")], &[Amount(10)])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SettlementError::Unauthorized {
                caller: mallory.clone()
            }
        );
        assert!(matches!(
            h.engine.calculate_allocations(&mallory).await.unwrap_err(),
            SettlementError::Unauthorized { .. }
        ));
        assert!(matches!(
            h.engine.withdraw_unclaimed(&mallory).await.unwrap_err(),
            SettlementError::Unauthorized { .. }
        ));
    }

    #[tokio::test]
    async fn contribute_consults_the_allow_list() {
        let custody = Arc::new(InMemoryCustody::new());
        custody
            .fund_account(&id("bob"), &usd(), Amount(100))
            .unwrap();
        let engine = SettlementEngine::new(
            self_service_ledger(10, 500, 1000),
            usd(),
            custody,
            Arc::new(SingleAdmin::new(admin())),
        )
        .with_allow_list(Arc::new(StaticAllowList::new([id("alice")])));

        let err = engine
            .contribute(&id("bob"), Amount(100), b"proof")
            .await
            .unwrap_err();
        assert_eq!(err, SettlementError::NotWhitelisted { identity: id("bob") });
    }

    #[tokio::test]
    async fn refunds_are_gated_and_exactly_once() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;

        assert_eq!(
            h.engine.refund(&id("alice")).await.unwrap_err(),
            SettlementError::RefundsNotAllowed
        );

        h.engine.set_refunds_allowed(&admin(), true).await.unwrap();
        assert_eq!(h.engine.refund(&id("alice")).await.unwrap(), Amount(100));
        assert_eq!(
            h.custody.account_balance(&id("alice"), &usd()).unwrap(),
            Amount(100)
        );
        assert_eq!(h.engine.total_contributed().await, Amount::ZERO);

        assert!(matches!(
            h.engine.refund(&id("alice")).await.unwrap_err(),
            SettlementError::Ledger(LedgerError::NothingToRefund { .. })
        ));
    }

    #[tokio::test]
    async fn refund_toggle_is_locked_by_calculation() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;
        h.custody.deposit_to_vault(&tok(), Amount(50)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();

        assert_eq!(
            h.engine
                .set_refunds_allowed(&admin(), true)
                .await
                .unwrap_err(),
            SettlementError::AlreadyCalculated
        );
    }

    #[tokio::test]
    async fn distribution_asset_reconfiguration_is_gated() {
        let h = harness(self_service_ledger(10, 500, 1000));

        assert_eq!(
            h.engine
                .set_distribution_asset(&admin(), AssetId::new("  "))
                .await
                .unwrap_err(),
            SettlementError::InvalidAsset
        );
        h.engine
            .set_distribution_asset(&admin(), AssetId::new("TOK2"))
            .await
            .unwrap();

        fund_and_contribute(&h, "alice", 100).await;
        h.custody
            .deposit_to_vault(&AssetId::new("TOK2"), Amount(50))
            .unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        assert_eq!(
            h.engine
                .set_distribution_asset(&admin(), tok())
                .await
                .unwrap_err(),
            SettlementError::AlreadyCalculated
        );

        // Once the window has ever been opened, even a closed window
        // rejects reconfiguration.
        h.engine.enable_claim(&admin()).await.unwrap();
        h.engine.open_claim_period(&admin()).await.unwrap();
        h.engine.close_claim_period(&admin()).await.unwrap();
        assert_eq!(
            h.engine
                .set_distribution_asset(&admin(), tok())
                .await
                .unwrap_err(),
            SettlementError::ClaimWindowActive
        );
    }

    #[tokio::test]
    async fn withdraw_unclaimed_is_gated_by_phase() {
        let h = harness(self_service_ledger(10, 500, 1000));
        assert_eq!(
            h.engine.withdraw_unclaimed(&admin()).await.unwrap_err(),
            SettlementError::NotCalculated
        );

        fund_and_contribute(&h, "alice", 100).await;
        h.custody.deposit_to_vault(&tok(), Amount(50)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        h.engine.enable_claim(&admin()).await.unwrap();
        h.engine.open_claim_period(&admin()).await.unwrap();

        assert_eq!(
            h.engine.withdraw_unclaimed(&admin()).await.unwrap_err(),
            SettlementError::ClaimWindowActive
        );

        h.engine.close_claim_period(&admin()).await.unwrap();
        assert_eq!(
            h.engine.withdraw_unclaimed(&admin()).await.unwrap(),
            Amount(50)
        );
    }

    #[tokio::test]
    async fn withdraw_contributions_sweeps_collected_funds() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;
        fund_and_contribute(&h, "bob", 200).await;

        assert_eq!(
            h.engine.withdraw_contributions(&admin()).await.unwrap_err(),
            SettlementError::NotCalculated
        );

        h.custody.deposit_to_vault(&tok(), Amount(50)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        assert_eq!(
            h.engine.withdraw_contributions(&admin()).await.unwrap(),
            Amount(300)
        );
        assert_eq!(
            h.custody.account_balance(&admin(), &usd()).unwrap(),
            Amount(300)
        );
    }

    #[tokio::test]
    async fn administered_round_supports_corrections_before_settlement() {
        let h = harness(administered_ledger(10));
        h.engine
            .batch_set(
                &admin(),
                &[id("a"), id("b"), id("c")],
                &[Amount(100), Amount(200), Amount(100)],
            )
            .await
            .unwrap();
        h.engine
            .update_contribution(&admin(), &id("b"), Amount(300))
            .await
            .unwrap();
        h.engine.remove_contributor(&admin(), &id("c")).await.unwrap();
        assert_eq!(h.engine.total_contributed().await, Amount(400));

        h.custody.deposit_to_vault(&tok(), Amount(600)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        assert_eq!(h.engine.allocation_of(&id("a")).await, Amount(150));
        assert_eq!(h.engine.allocation_of(&id("b")).await, Amount(450));
        assert_eq!(h.engine.allocation_of(&id("c")).await, Amount::ZERO);
    }

    #[tokio::test]
    async fn events_trace_the_round_in_order() {
        let h = harness(self_service_ledger(10, 500, 1000));
        fund_and_contribute(&h, "alice", 100).await;
        h.custody.deposit_to_vault(&tok(), Amount(100)).unwrap();
        h.engine.calculate_allocations(&admin()).await.unwrap();
        h.engine.enable_claim(&admin()).await.unwrap();
        h.engine.open_claim_period(&admin()).await.unwrap();
        h.engine.claim(&id("alice")).await.unwrap();

        let events = h.events.events();
        assert!(matches!(
            events[0],
            SettlementEvent::ContributionRecorded { .. }
        ));
        assert!(matches!(
            events[1],
            SettlementEvent::AllocationsCalculated { .. }
        ));
        assert_eq!(events[2], SettlementEvent::ClaimEnabled);
        assert_eq!(events[3], SettlementEvent::ClaimPeriodOpened);
        assert!(matches!(events[4], SettlementEvent::Claimed { .. }));
    }

    #[test]
    fn proportional_share_worked_examples() {
        let total = Amount(600);
        let pool = Amount(900);
        assert_eq!(proportional_share(Amount(100), pool, total), Amount(150));
        assert_eq!(proportional_share(Amount(200), pool, total), Amount(300));
        assert_eq!(proportional_share(Amount(300), pool, total), Amount(450));

        // floor(1 * 10 / 3) per participant, dust of 1 retained.
        assert_eq!(proportional_share(Amount(1), Amount(10), Amount(3)), Amount(3));
    }

    proptest! {
        #[test]
        fn allocations_never_exceed_the_pool(
            contributions in proptest::collection::vec(1..1_000_000_000u64, 1..32),
            pool in 1..u64::MAX / 2
        ) {
            let total = contributions.iter().try_fold(0u64, |acc, c| acc.checked_add(*c));
            prop_assume!(total.is_some());
            let total = Amount(total.unwrap_or(0));
            let pool = Amount(pool);

            let mut allocated: u128 = 0;
            for contributed in &contributions {
                let share = proportional_share(Amount(*contributed), pool, total);
                allocated += share.0 as u128;
            }
            prop_assert!(allocated <= pool.0 as u128);
        }
    }
}

use super::state::{
    AccountNonceState, CommitOutcome, NonceReservation, ReservationId, ResyncReport,
};
use super::NonceEvent;
use crate::config::NonceConfig;
use crate::error::{NonceError, ProviderError};
use crate::logging::LogEmoji;
use crate::provider::ChainProvider;
use crate::retry::retry_async;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

type AccountSlot = Arc<Mutex<Option<AccountNonceState>>>;

/// Concurrency-safe nonce reservation ledger, one critical section per account
pub struct NonceManager {
    provider: Arc<dyn ChainProvider>,
    config: NonceConfig,
    accounts: DashMap<Address, AccountSlot>,
    next_id: AtomicU64,
    events: broadcast::Sender<NonceEvent>,
}

impl NonceManager {
    pub fn new(provider: Arc<dyn ChainProvider>, config: NonceConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            provider,
            config,
            accounts: DashMap::new(),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn config(&self) -> &NonceConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NonceEvent> {
        self.events.subscribe()
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.accounts.iter().map(|e| *e.key()).collect()
    }

    fn slot(&self, account: Address) -> AccountSlot {
        Arc::clone(
            self.accounts
                .entry(account)
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    fn existing_slot(&self, account: Address) -> Result<AccountSlot, NonceError> {
        self.accounts
            .get(&account)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(NonceError::UnknownAccount { account })
    }

    fn issue_id(&self) -> ReservationId {
        ReservationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn publish(&self, events: impl IntoIterator<Item = NonceEvent>) {
        for event in events {
            match &event {
                NonceEvent::Drift { account, invalidated, confirmed } => warn!(
                    account = ?account,
                    ?invalidated,
                    confirmed,
                    "{} Nonce drift: reservations consumed externally",
                    LogEmoji::WARNING
                ),
                NonceEvent::ChainBehind { account, confirmed, tracked } => warn!(
                    account = ?account,
                    confirmed,
                    tracked,
                    "Provider nonce behind ledger, keeping ledger"
                ),
                NonceEvent::ReservationExpired { account, nonce, id } => warn!(
                    account = ?account,
                    nonce,
                    reservation = %id,
                    "{} Reservation TTL elapsed, nonce held until resync",
                    LogEmoji::CLOCK
                ),
                other => debug!(event = ?other, "nonce ledger event"),
            }
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    async fn read_confirmed(&self, account: Address) -> Result<u64, ProviderError> {
        let provider = Arc::clone(&self.provider);
        retry_async(&self.config.retry, None, ProviderError::is_transient, |_| {
            let provider = Arc::clone(&provider);
            async move { provider.confirmed_nonce(account).await }
        })
        .await
    }

    /// Sync under the held account lock
    async fn sync_locked(
        &self,
        account: Address,
        ledger: &mut Option<AccountNonceState>,
    ) -> Result<ResyncReport, NonceError> {
        let confirmed = self.read_confirmed(account).await?;
        let now = Instant::now();

        let report = match ledger {
            Some(state) => state.reconcile(confirmed, now),
            None => {
                *ledger = Some(AccountNonceState::new(account, confirmed, now));
                info!(account = ?account, confirmed, "{} Nonce ledger initialised", LogEmoji::NONCE);
                ResyncReport {
                    account,
                    previous_base: confirmed,
                    confirmed,
                    invalidated: Vec::new(),
                    confirmed_commits: 0,
                    events: Vec::new(),
                }
            }
        };
        self.publish(report.events.iter().cloned());
        Ok(report)
    }

    async fn ensure_synced(
        &self,
        account: Address,
        ledger: &mut Option<AccountNonceState>,
    ) -> Result<(), NonceError> {
        let (must_sync, should_sync) = match ledger.as_ref() {
            None => (true, true),
            Some(state) => (
                state.needs_resync,
                state.last_sync_time.elapsed() >= self.config.resync_interval(),
            ),
        };

        if !(must_sync || should_sync) {
            return Ok(());
        }
        match self.sync_locked(account, ledger).await {
            Ok(_) => Ok(()),
            Err(e) if !must_sync => {
                debug!(account = ?account, "Periodic resync failed, using current ledger: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reserve the next nonce for `account`
    pub async fn reserve(&self, account: Address) -> Result<NonceReservation, NonceError> {
        self.reserve_with_ttl(account, self.config.reservation_ttl()).await
    }

    /// Reserve a nonce that stays held until `hold_until` plus the configured
    /// TTL, for callers that may still broadcast up to that instant
    pub async fn reserve_until(
        &self,
        account: Address,
        hold_until: Instant,
    ) -> Result<NonceReservation, NonceError> {
        let ttl = self.config.reservation_ttl() + hold_until.saturating_duration_since(Instant::now());
        self.reserve_with_ttl(account, ttl).await
    }

    async fn reserve_with_ttl(
        &self,
        account: Address,
        ttl: Duration,
    ) -> Result<NonceReservation, NonceError> {
        let slot = self.slot(account);
        let mut ledger = slot.lock().await;

        // Expiry flags the ledger, so it runs before the sync that frees the slots
        let expired = match ledger.as_mut() {
            Some(state) => state.expire(Instant::now()),
            None => Vec::new(),
        };
        self.publish(expired);
        self.ensure_synced(account, &mut ledger).await?;

        let state = ledger
            .as_mut()
            .ok_or(NonceError::UnknownAccount { account })?;
        let reservation = state.reserve(self.issue_id(), ttl, self.config.max_inflight, Instant::now());
        drop(ledger);

        let reservation = reservation?;
        debug!(
            account = ?account,
            nonce = reservation.nonce,
            reservation = %reservation.id,
            "{} Nonce reserved",
            LogEmoji::NONCE
        );
        Ok(reservation)
    }

    /// Mark a reservation committed. Idempotent for the same token.
    pub async fn commit(
        &self,
        reservation: &NonceReservation,
        tx_hash: H256,
    ) -> Result<CommitOutcome, NonceError> {
        let slot = self.existing_slot(reservation.account)?;
        let mut ledger = slot.lock().await;
        let state = ledger.as_mut().ok_or(NonceError::UnknownAccount {
            account: reservation.account,
        })?;

        let outcome = state.commit(reservation.id, reservation.nonce, tx_hash)?;
        if outcome == CommitOutcome::CommittedBehindGap {
            warn!(
                account = ?reservation.account,
                nonce = reservation.nonce,
                gaps = ?state.gaps(),
                "Committed above an unresolved gap, resync required"
            );
        }
        Ok(outcome)
    }

    /// Give a reservation back. The top nonce is reused at once, lower ones become gaps.
    pub async fn release(&self, reservation: &NonceReservation) -> Result<(), NonceError> {
        let slot = self.existing_slot(reservation.account)?;
        let mut ledger = slot.lock().await;
        let state = ledger.as_mut().ok_or(NonceError::UnknownAccount {
            account: reservation.account,
        })?;

        let events = state.release(reservation.id, reservation.nonce)?;
        drop(ledger);
        debug!(
            account = ?reservation.account,
            nonce = reservation.nonce,
            "Nonce released"
        );
        self.publish(events);
        Ok(())
    }

    /// Re-read the confirmed nonce and reconcile the ledger
    pub async fn resync(&self, account: Address) -> Result<ResyncReport, NonceError> {
        let slot = self.slot(account);
        let mut ledger = slot.lock().await;
        self.sync_locked(account, &mut ledger).await
    }

    /// Block new reservations until the next successful resync
    pub async fn flag_drift(&self, account: Address) {
        let Ok(slot) = self.existing_slot(account) else {
            return;
        };
        let mut ledger = slot.lock().await;
        if let Some(state) = ledger.as_mut() {
            state.needs_resync = true;
            warn!(account = ?account, "{} Drift suspected, resync forced", LogEmoji::WARNING);
        }
    }

    /// Reserve the lowest tracked gap so a filler transaction can close it
    pub async fn backfill_gap(
        &self,
        account: Address,
    ) -> Result<Option<NonceReservation>, NonceError> {
        let slot = self.existing_slot(account)?;
        let mut ledger = slot.lock().await;
        let state = ledger
            .as_mut()
            .ok_or(NonceError::UnknownAccount { account })?;

        let filled = state.backfill(self.issue_id(), self.config.reservation_ttl(), Instant::now());
        drop(ledger);

        Ok(filled.map(|(reservation, event)| {
            self.publish([event]);
            reservation
        }))
    }

    /// Expire every reservation past its TTL. Returns how many expired.
    pub async fn sweep_expired(&self) -> usize {
        let slots: Vec<AccountSlot> = self.accounts.iter().map(|e| Arc::clone(e.value())).collect();
        let now = Instant::now();
        let mut expired = 0;

        for slot in slots {
            let mut ledger = slot.lock().await;
            if let Some(state) = ledger.as_mut() {
                let events = state.expire(now);
                drop(ledger);
                expired += events
                    .iter()
                    .filter(|e| matches!(e, NonceEvent::ReservationExpired { .. }))
                    .count();
                self.publish(events);
            }
        }
        expired
    }

    async fn resync_due(&self) {
        let interval = self.config.resync_interval();
        for account in self.accounts() {
            let due = match self.accounts.get(&account).map(|s| Arc::clone(s.value())) {
                Some(slot) => {
                    let ledger = slot.lock().await;
                    ledger
                        .as_ref()
                        .map(|s| s.needs_resync || s.last_sync_time.elapsed() >= interval)
                        .unwrap_or(false)
                }
                None => false,
            };
            if due {
                if let Err(e) = self.resync(account).await {
                    warn!(account = ?account, "Background nonce resync failed: {}", e);
                }
            }
        }
    }

    /// TTL sweeps and periodic resyncs in the background
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
                manager.resync_due().await;
            }
        })
    }

    /// Snapshot of one account's ledger
    pub async fn get_account_state(&self, account: Address) -> Option<AccountNonceState> {
        let slot = self.accounts.get(&account).map(|s| Arc::clone(s.value()))?;
        let ledger = slot.lock().await;
        ledger.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::ReservationStatus;
    use crate::retry::RetryPolicy;
    use crate::testing::MockChainProvider;

    fn config() -> NonceConfig {
        NonceConfig {
            reservation_ttl_ms: 5_000,
            max_inflight: 8,
            resync_interval_ms: 60_000,
            maintenance_interval_ms: 500,
            retry: RetryPolicy::none(),
        }
    }

    fn setup(confirmed: u64) -> (Arc<MockChainProvider>, NonceManager, Address) {
        let provider = Arc::new(MockChainProvider::new());
        let account = Address::repeat_byte(0x11);
        provider.set_nonce(account, confirmed);
        let manager = NonceManager::new(provider.clone(), config());
        (provider, manager, account)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reserve_syncs_from_chain() {
        let (provider, manager, account) = setup(42);

        let a = manager.reserve(account).await.unwrap();
        let b = manager.reserve(account).await.unwrap();

        assert_eq!((a.nonce, b.nonce), (42, 43));
        assert_ne!(a.id, b.id);
        assert_eq!(provider.nonce_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_and_diagnostics() {
        let (_, manager, account) = setup(0);
        let a = manager.reserve(account).await.unwrap();
        let b = manager.reserve(account).await.unwrap();
        manager.reserve(account).await.unwrap();

        manager.release(&b).await.unwrap();
        let state = manager.get_account_state(account).await.unwrap();
        assert_eq!(state.gaps(), vec![1]);
        assert_eq!(state.next_nonce(), 3);

        manager.commit(&a, H256::repeat_byte(7)).await.unwrap();
        let state = manager.get_account_state(account).await.unwrap();
        assert_eq!(state.reservations[&0].status, ReservationStatus::Committed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_flag_forces_resync() {
        let (provider, manager, account) = setup(10);
        let mut events = manager.subscribe();
        manager.reserve(account).await.unwrap();

        // External transaction consumed nonce 10
        provider.set_nonce(account, 11);
        manager.flag_drift(account).await;

        let next = manager.reserve(account).await.unwrap();
        assert_eq!(next.nonce, 11);
        assert_eq!(provider.nonce_calls(), 2);

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            NonceEvent::Drift {
                account,
                invalidated: vec![10],
                confirmed: 11
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_failure_blocks_flagged_account() {
        let (provider, manager, account) = setup(3);
        manager.reserve(account).await.unwrap();
        manager.flag_drift(account).await;
        provider.set_offline(true);

        assert!(matches!(
            manager.reserve(account).await,
            Err(NonceError::Provider(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_resync_failure_is_tolerated() {
        let (provider, manager, account) = setup(3);
        let first = manager.reserve(account).await.unwrap();
        manager.commit(&first, H256::repeat_byte(1)).await.unwrap();
        provider.set_offline(true);
        tokio::time::advance(Duration::from_secs(61)).await;

        // Ledger stale but not flagged: keep going on local state
        assert_eq!(manager.reserve(account).await.unwrap().nonce, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_expires_abandoned_reservations() {
        let (_, manager, account) = setup(20);
        let manager = Arc::new(manager);
        let mut events = manager.subscribe();
        manager.reserve(account).await.unwrap();

        let handle = manager.spawn_maintenance(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(5_600)).await;

        let event = events.recv().await.unwrap();
        assert!(matches!(event, NonceEvent::ReservationExpired { nonce: 20, .. }));
        assert_eq!(manager.reserve(account).await.unwrap().nonce, 20);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_until_outlives_base_ttl() {
        let (_, manager, account) = setup(30);
        let held = manager
            .reserve_until(account, Instant::now() + Duration::from_secs(20))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(manager.sweep_expired().await, 0);
        assert_eq!(manager.reserve(account).await.unwrap().nonce, 31);
        manager.commit(&held, H256::repeat_byte(3)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_after_expiry_is_refused() {
        let (provider, manager, account) = setup(30);
        let late = manager.reserve(account).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(manager.sweep_expired().await, 1);

        assert!(matches!(
            manager.commit(&late, H256::repeat_byte(4)).await,
            Err(NonceError::Expired { nonce: 30, .. })
        ));
        // Held until the chain says whether it landed
        assert_eq!(manager.get_account_state(account).await.unwrap().next_nonce(), 31);

        provider.set_nonce(account, 31);
        assert_eq!(manager.reserve(account).await.unwrap().nonce, 31);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_gap_returns_lowest() {
        let (_, manager, account) = setup(0);
        let a = manager.reserve(account).await.unwrap();
        manager.reserve(account).await.unwrap();
        manager.release(&a).await.unwrap();

        let filler = manager.backfill_gap(account).await.unwrap().unwrap();
        assert_eq!(filler.nonce, 0);
        assert!(manager.backfill_gap(account).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_account_errors() {
        let (_, manager, _) = setup(0);
        let stranger = Address::repeat_byte(0x99);
        assert!(matches!(
            manager.backfill_gap(stranger).await,
            Err(NonceError::UnknownAccount { .. })
        ));
        assert!(manager.get_account_state(stranger).await.is_none());
    }
}

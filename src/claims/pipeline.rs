use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use once_cell::sync::Lazy;
use prometheus::{register_counter, register_gauge, register_int_counter, Counter, Gauge, IntCounter};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::claims::{
    Claim, ClaimError, ClaimHooks, ClaimInfo, ClaimProgress, ClaimRejection, ClaimStatus,
};
use crate::config::{ChainConfig, ClaimsConfig};
use crate::database::SessionStore;
use crate::notifications::NotificationHub;
use crate::session::{SessionData, SessionStatus};
use crate::utils::amount::parse_base_amount;
use crate::wallet::WalletManager;

static QUEUED_CLAIMS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("queued_claims", "Claims waiting in the settlement queue").unwrap()
});

static PENDING_CLAIMS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("pending_claims", "Claims awaiting chain confirmation").unwrap()
});

static CONFIRMED_CLAIMS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("confirmed_claims_total", "Claims settled on-chain").unwrap()
});

static FAILED_CLAIMS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("failed_claims_total", "Claims that ended in failure").unwrap()
});

static DISPENSED_BASE_UNITS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "dispensed_base_units_total",
        "Base units dispensed by confirmed claims"
    )
    .unwrap()
});

struct HistoryEntry {
    info: ClaimInfo,
    expires_at: Instant,
}

#[derive(Default)]
struct PipelineState {
    /// Claims awaiting dispatch, ascending by claim index; only the head
    /// is dequeued.
    queue: VecDeque<ClaimInfo>,
    /// Live claims by session, used to detect double-claim races.
    by_session: HashMap<String, ClaimInfo>,
    /// Broadcast claims awaiting confirmation, by tx hash.
    pending: HashMap<String, ClaimInfo>,
    /// Settled claims kept around for status queries.
    history: BTreeMap<u64, HistoryEntry>,
    last_processed_idx: u64,
    last_confirmed_idx: u64,
    next_claim_idx: u64,
}

/// Owns the claim state machine: queue intake, the periodic drain tick,
/// confirmation watchers and crash recovery.
///
/// All shared collections sit behind one mutex which is never held across
/// a chain RPC or database write.
pub struct ClaimPipeline {
    store: Arc<dyn SessionStore>,
    wallet: Arc<WalletManager>,
    hub: Arc<NotificationHub>,
    hooks: Arc<dyn ClaimHooks>,
    config: ClaimsConfig,
    address_prefix: String,
    min_gas_amount: u128,
    /// Recorded as `tx_fee` on confirmed claims; the receipt's actual fee
    /// is not parsed.
    fee_display: String,
    state: StdMutex<PipelineState>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl ClaimPipeline {
    pub fn new(
        store: Arc<dyn SessionStore>,
        wallet: Arc<WalletManager>,
        hub: Arc<NotificationHub>,
        hooks: Arc<dyn ClaimHooks>,
        config: ClaimsConfig,
        chain: &ChainConfig,
    ) -> Self {
        let fee_display = wallet.gas_fee().amount.amount.to_string();

        Self {
            store,
            wallet,
            hub,
            hooks,
            config,
            address_prefix: chain.address_prefix.clone(),
            min_gas_amount: chain.min_gas_amount,
            fee_display,
            state: StdMutex::new(PipelineState {
                next_claim_idx: 1,
                ..PipelineState::default()
            }),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reinstates persisted claiming sessions after a restart: queued and
    /// processing claims go back to the queue, pending claims get a fresh
    /// confirmation watcher. Unknown substatuses are logged and dropped.
    #[instrument(level = "info", skip_all)]
    pub async fn restore(self: &Arc<Self>) -> anyhow::Result<()> {
        let sessions = self.store.sessions_by_status(SessionStatus::Claiming).await?;

        let mut queue = Vec::new();
        let mut pending = HashMap::new();
        let mut max_idx = 0u64;

        for session in sessions {
            let Some(claim) = session.claim.clone() else {
                error!(session = %session.id, "Claiming session has no claim record, dropping");
                continue;
            };

            let info = ClaimInfo {
                session_id: session.id,
                target_addr: session.target_addr,
                amount: session.drop_amount,
                claim,
            };
            max_idx = max_idx.max(info.claim.claim_idx);

            match info.claim.status {
                ClaimStatus::Queue | ClaimStatus::Processing => queue.push(info),
                ClaimStatus::Pending => match info.claim.tx_hash.clone() {
                    Some(hash) => {
                        pending.insert(hash, info);
                    }
                    None => {
                        error!(
                            session = %info.session_id,
                            "Pending claim without tx hash, dropping"
                        );
                    }
                },
                status => {
                    error!(
                        session = %info.session_id,
                        ?status,
                        "Unexpected claim status in claiming session, dropping"
                    );
                }
            }
        }

        queue.sort_by_key(|info| info.claim.claim_idx);

        let watchers: Vec<ClaimInfo> = pending.values().cloned().collect();

        {
            let mut state = self.lock_state();
            state.last_processed_idx = pending
                .values()
                .map(|info| info.claim.claim_idx)
                .max()
                .unwrap_or(0);
            for info in &queue {
                state
                    .by_session
                    .insert(info.session_id.clone(), info.clone());
            }
            for info in pending.values() {
                state
                    .by_session
                    .insert(info.session_id.clone(), info.clone());
            }
            state.queue = queue.into();
            state.pending = pending;
            state.next_claim_idx = max_idx + 1;
        }

        for info in watchers {
            self.spawn_watcher(info);
        }

        let (queued, pending) = self.counts();
        info!(queued, pending, "Restored claim pipeline state");
        self.update_gauges();

        Ok(())
    }

    /// Validates and enqueues a claim for `session`.
    #[instrument(level = "info", skip_all, fields(session = %session.id))]
    pub async fn create_claim(&self, session: SessionData) -> Result<ClaimInfo, ClaimError> {
        if session.status != SessionStatus::Claimable {
            return Err(ClaimError::NotClaimable);
        }

        let amount =
            parse_base_amount(&session.drop_amount).map_err(|_| ClaimError::AmountTooLow)?;
        if amount < self.config.min_amount {
            return Err(ClaimError::AmountTooLow);
        }
        if amount > self.config.max_amount {
            return Err(ClaimError::AmountTooHigh);
        }

        if !session.target_addr.starts_with(&self.address_prefix) {
            return Err(ClaimError::InvalidAddress);
        }

        // Allocate the index and reserve the session slot atomically so a
        // concurrent claim for the same session loses the race.
        let info = {
            let mut state = self.lock_state();
            if state.by_session.contains_key(&session.id) {
                return Err(ClaimError::RaceClaiming);
            }

            let claim_idx = state.next_claim_idx;
            state.next_claim_idx += 1;

            let info = ClaimInfo {
                session_id: session.id.clone(),
                target_addr: session.target_addr.clone(),
                amount: session.drop_amount.clone(),
                claim: Claim::new(claim_idx),
            };
            state
                .by_session
                .insert(session.id.clone(), info.clone());
            info
        };

        if let Err(err) = self.hooks.before_claim(&session).await {
            self.lock_state().by_session.remove(&session.id);
            return Err(match err.downcast::<ClaimRejection>() {
                Ok(rejection) => ClaimError::Rejected(rejection.0),
                Err(other) => ClaimError::Internal(other),
            });
        }

        let mut session = session;
        session.status = SessionStatus::Claiming;
        session.claim = Some(info.claim.clone());
        if let Err(err) = self.store.update_session(&session).await {
            self.lock_state().by_session.remove(&session.id);
            return Err(err.into());
        }

        self.lock_state().queue.push_back(info.clone());
        self.update_gauges();

        info!(
            claim_idx = info.claim.claim_idx,
            target = %info.target_addr,
            amount = %info.amount,
            "Claim queued"
        );

        Ok(info)
    }

    /// Drains the queue head-first while the wallet is funded and the
    /// pending window has room. Single-flight: a tick that starts while a
    /// previous one is still running is skipped.
    pub async fn tick(self: &Arc<Self>) {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            return;
        };

        let before = self.progress();
        self.prune_history();

        loop {
            let wallet_state = self.wallet.state();
            if !wallet_state.ready || wallet_state.native_balance <= self.min_gas_amount {
                break;
            }

            let claim = {
                let mut state = self.lock_state();
                if state.pending.len() >= self.config.max_pending {
                    None
                } else if let Some(info) = state.queue.pop_front() {
                    // Never decreases, even when recovery left lower
                    // indices queued behind higher pending ones.
                    state.last_processed_idx =
                        state.last_processed_idx.max(info.claim.claim_idx);
                    Some(info)
                } else {
                    None
                }
            };

            match claim {
                // Sequential within a tick; the state lock is not held
                // across the broadcast.
                Some(info) => self.process_one(info).await,
                None => break,
            }
        }

        self.update_gauges();
        self.emit_progress_since(before);
    }

    async fn process_one(self: &Arc<Self>, mut info: ClaimInfo) {
        match self.broadcast_claim(&mut info).await {
            Ok(()) => {
                // Invariant: a pending claim always carries its tx hash.
                let hash = info.claim.tx_hash.clone().unwrap_or_default();
                {
                    let mut state = self.lock_state();
                    state.pending.insert(hash, info.clone());
                    state
                        .by_session
                        .insert(info.session_id.clone(), info.clone());
                }

                if let Err(err) = self
                    .store
                    .update_claim_data(&info.session_id, &info.claim)
                    .await
                {
                    warn!(session = %info.session_id, %err, "Failed to persist pending claim");
                }

                self.spawn_watcher(info);
            }
            Err(message) => self.fail_claim(info, message).await,
        }
    }

    /// Broadcast step with explicit outcome: `Ok` means the claim moved
    /// to pending (hash recorded on `info`), `Err` carries the failure
    /// message. The caller persists and evicts.
    async fn broadcast_claim(&self, info: &mut ClaimInfo) -> Result<(), String> {
        let wallet_state = self.wallet.state();
        if !wallet_state.ready {
            return Err("Network RPC is currently unreachable.".to_string());
        }
        if wallet_state.native_balance <= self.min_gas_amount {
            return Err("Faucet wallet is out of gas funds.".to_string());
        }

        info.claim.status = ClaimStatus::Processing;
        if let Err(err) = self
            .store
            .update_claim_data(&info.session_id, &info.claim)
            .await
        {
            // Best effort; the transfer still goes out.
            warn!(session = %info.session_id, %err, "Failed to persist processing claim");
        }

        let amount = parse_base_amount(&info.amount)
            .map_err(|err| format!("Processing Exception: {err}"))?;

        match self.wallet.send_tokens(&info.target_addr, amount).await {
            Ok(transfer) => {
                info.claim.status = ClaimStatus::Pending;
                info.claim.tx_hash = Some(transfer.tx_hash);
                Ok(())
            }
            Err(err) => Err(format!("Processing Exception: {err}")),
        }
    }

    fn spawn_watcher(self: &Arc<Self>, info: ClaimInfo) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.watch_confirmation(info).await;
        });
    }

    /// Waits for the broadcast transaction to land. Absent or failed
    /// transactions fail the claim; a successful one confirms it and
    /// raises the confirmed watermark.
    #[instrument(level = "debug", skip_all, fields(claim_idx = info.claim.claim_idx))]
    async fn watch_confirmation(self: Arc<Self>, mut info: ClaimInfo) {
        let before = self.progress();

        let Some(hash) = info.claim.tx_hash.clone() else {
            self.fail_claim(info, "Transaction failed".to_string()).await;
            return;
        };

        let result = self
            .wallet
            .wait_for_tx(
                &hash,
                self.config.confirm_timeout,
                self.config.confirm_poll_interval,
            )
            .await;

        match result {
            Ok(Some(tx)) if tx.code == 0 => {
                info.claim.status = ClaimStatus::Confirmed;
                info.claim.tx_height = Some(tx.height);
                info.claim.tx_fee = Some(self.fee_display.clone());

                {
                    let mut state = self.lock_state();
                    // Out-of-order confirmations raise, never lower, the
                    // watermark.
                    state.last_confirmed_idx =
                        state.last_confirmed_idx.max(info.claim.claim_idx);
                }

                self.evict(&info);
                self.persist_terminal(&info, SessionStatus::Finished).await;

                self.hooks.session_claimed(&info).await;
                CONFIRMED_CLAIMS.inc();
                if let Ok(amount) = parse_base_amount(&info.amount) {
                    DISPENSED_BASE_UNITS.inc_by(amount as f64);
                }

                info!(
                    session = %info.session_id,
                    %hash,
                    height = tx.height,
                    "Claim confirmed"
                );
            }
            Ok(Some(tx)) => {
                warn!(session = %info.session_id, %hash, code = tx.code, "Transaction failed on-chain");
                self.fail_claim(info, "Transaction failed".to_string()).await;
            }
            Ok(None) => {
                self.fail_claim(info, "confirmation timeout".to_string())
                    .await;
            }
            Err(err) => {
                warn!(session = %info.session_id, %hash, %err, "Confirmation watch aborted");
                self.fail_claim(info, "Transaction failed".to_string()).await;
            }
        }

        self.update_gauges();
        self.emit_progress_since(before);
    }

    async fn fail_claim(&self, mut info: ClaimInfo, message: String) {
        warn!(
            session = %info.session_id,
            claim_idx = info.claim.claim_idx,
            %message,
            "Claim failed"
        );

        info.claim.status = ClaimStatus::Failed;
        info.claim.tx_error = Some(message);

        self.evict(&info);
        self.persist_terminal(&info, SessionStatus::Failed).await;
        FAILED_CLAIMS.inc();
    }

    /// Removes a terminal claim from the live maps and parks it in the
    /// history, keyed by claim index.
    fn evict(&self, info: &ClaimInfo) {
        let mut state = self.lock_state();
        state.by_session.remove(&info.session_id);
        if let Some(hash) = &info.claim.tx_hash {
            state.pending.remove(hash);
        }
        state.history.insert(
            info.claim.claim_idx,
            HistoryEntry {
                info: info.clone(),
                expires_at: Instant::now() + self.config.history_retention,
            },
        );
    }

    async fn persist_terminal(&self, info: &ClaimInfo, status: SessionStatus) {
        match self.store.session(&info.session_id).await {
            Ok(Some(mut session)) => {
                session.status = status;
                session.claim = Some(info.claim.clone());
                if let Err(err) = self.store.update_session(&session).await {
                    error!(session = %info.session_id, %err, "Failed to persist settled claim");
                }
            }
            Ok(None) => {
                error!(session = %info.session_id, "Settled claim for unknown session");
                if let Err(err) = self
                    .store
                    .update_claim_data(&info.session_id, &info.claim)
                    .await
                {
                    error!(session = %info.session_id, %err, "Failed to persist settled claim");
                }
            }
            Err(err) => {
                error!(session = %info.session_id, %err, "Failed to load session for settlement");
            }
        }
    }

    fn prune_history(&self) {
        let now = Instant::now();
        self.lock_state()
            .history
            .retain(|_, entry| entry.expires_at > now);
    }

    fn emit_progress_since(&self, before: ClaimProgress) {
        let after = self.progress();
        if after != before {
            self.hub.broadcast(after);
        }
    }

    #[must_use]
    pub fn progress(&self) -> ClaimProgress {
        let state = self.lock_state();
        ClaimProgress {
            processed_idx: state.last_processed_idx,
            confirmed_idx: state.last_confirmed_idx,
        }
    }

    /// Sum of the amounts committed to queued claims.
    #[must_use]
    pub fn queued_amount(&self) -> u128 {
        self.lock_state()
            .queue
            .iter()
            .filter_map(|info| parse_base_amount(&info.amount).ok())
            .sum()
    }

    /// The live claim of a session, if any.
    #[must_use]
    pub fn live_claim(&self, session_id: &str) -> Option<ClaimInfo> {
        self.lock_state().by_session.get(session_id).cloned()
    }

    /// A claim by index, terminal claims included while they stay in the
    /// history window.
    #[must_use]
    pub fn claim_by_idx(&self, claim_idx: u64) -> Option<ClaimInfo> {
        let state = self.lock_state();
        state
            .queue
            .iter()
            .chain(state.pending.values())
            .find(|info| info.claim.claim_idx == claim_idx)
            .cloned()
            .or_else(|| state.history.get(&claim_idx).map(|entry| entry.info.clone()))
    }

    /// Snapshot of queue, pending and (unless `queue_only`) history
    /// claims, ascending by claim index.
    #[must_use]
    pub fn transaction_queue(&self, queue_only: bool) -> Vec<ClaimInfo> {
        let state = self.lock_state();
        let mut claims: Vec<ClaimInfo> = state.queue.iter().cloned().collect();
        claims.extend(state.pending.values().cloned());
        if !queue_only {
            claims.extend(state.history.values().map(|entry| entry.info.clone()));
        }
        claims.sort_by_key(|info| info.claim.claim_idx);
        claims
    }

    /// `(queued, pending)` lengths.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock_state();
        (state.queue.len(), state.pending.len())
    }

    /// Clears the broadcast slot on shutdown; in-flight watchers are
    /// allowed to finish.
    pub fn dispose(&self) {
        self.hub.reset();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().expect("pipeline state lock poisoned")
    }

    fn update_gauges(&self) {
        let (queued, pending) = self.counts();
        QUEUED_CLAIMS.set(queued as f64);
        PENDING_CLAIMS.set(pending as f64);
    }
}

use std::sync::Arc;

use tokio::time::Instant;
use tracing::instrument;

use crate::chain::GrpcConnector;
use crate::claims::pipeline::ClaimPipeline;
use crate::claims::{ClaimError, ClaimHooks, NoopHooks};
use crate::config::Config;
use crate::database::{Database, SessionStore};
use crate::notifications::NotificationHub;
use crate::refill::RefillController;
use crate::server::data::{
    FaucetStatusEntry, FaucetStatusResponse, QueueEntry, QueueStatusResponse,
    SessionStatusResponse,
};
use crate::session::SessionData;
use crate::status::StatusRegistry;
use crate::wallet::WalletManager;

/// The assembled settlement service. Components receive their
/// collaborators here, at construction; tests build the same graph around
/// fakes.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn SessionStore>,
    pub wallet: Arc<WalletManager>,
    pub pipeline: Arc<ClaimPipeline>,
    pub hub: Arc<NotificationHub>,
    pub refill: Arc<RefillController>,
    pub status: Arc<StatusRegistry>,
    queue_cache: tokio::sync::Mutex<Option<(Instant, QueueStatusResponse)>>,
}

impl App {
    /// Connects the database and wires the component graph. The wallet is
    /// not connected yet; the wallet monitor task brings it up and keeps
    /// retrying while the chain is unreachable.
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let database = Database::new(&config.database).await?;
        let store: Arc<dyn SessionStore> = Arc::new(database);

        Self::assemble(config, store, Arc::new(NoopHooks))
    }

    /// Builds the graph around an existing store and hook chain.
    pub fn assemble(
        config: Config,
        store: Arc<dyn SessionStore>,
        hooks: Arc<dyn ClaimHooks>,
    ) -> anyhow::Result<Arc<Self>> {
        let status = Arc::new(StatusRegistry::new());
        let connector = Arc::new(GrpcConnector::new(config.chain.clone()));

        let wallet = Arc::new(WalletManager::new(
            config.chain.clone(),
            &config.claims,
            connector,
            status.clone(),
        )?);

        let hub = Arc::new(NotificationHub::new());

        let pipeline = Arc::new(ClaimPipeline::new(
            store.clone(),
            wallet.clone(),
            hub.clone(),
            hooks,
            config.claims.clone(),
            &config.chain,
        ));

        let refill = Arc::new(RefillController::new(
            wallet.clone(),
            store.clone(),
            pipeline.clone(),
            config.refill.clone(),
            &config.chain,
            &config.claims,
        ));

        Ok(Arc::new(Self {
            config,
            store,
            wallet,
            pipeline,
            hub,
            refill,
            status,
            queue_cache: tokio::sync::Mutex::new(None),
        }))
    }

    /// Reinstates persisted claims. Called once at startup, before the
    /// queue tick starts.
    pub async fn restore(self: &Arc<Self>) -> anyhow::Result<()> {
        self.pipeline.restore().await
    }

    /// Accepts a claim for the session and returns its status object.
    pub async fn claim_reward(&self, session_id: &str) -> Result<SessionStatusResponse, ClaimError> {
        let session = self
            .store
            .session(session_id)
            .await?
            .ok_or(ClaimError::UnknownSession)?;

        let info = self.pipeline.create_claim(session.clone()).await?;

        let mut session = session;
        session.status = crate::session::SessionStatus::Claiming;
        session.claim = Some(info.claim.clone());

        Ok(self.session_response(&session, true))
    }

    pub async fn session_status(
        &self,
        session_id: &str,
        details: bool,
    ) -> Result<SessionStatusResponse, ClaimError> {
        let mut session = self
            .store
            .session(session_id)
            .await?
            .ok_or(ClaimError::UnknownSession)?;

        // Live claims are fresher in memory than in storage.
        if let Some(live) = self.pipeline.live_claim(session_id) {
            session.claim = Some(live.claim);
        }

        Ok(self.session_response(&session, details))
    }

    /// Aggregated queue snapshot, cached for the configured window.
    pub async fn queue_status(&self) -> QueueStatusResponse {
        let mut cache = self.queue_cache.lock().await;
        if let Some((at, cached)) = cache.as_ref() {
            if at.elapsed() < self.config.server.queue_status_cache {
                return cached.clone();
            }
        }

        let (queued, pending) = self.pipeline.counts();
        let progress = self.pipeline.progress();
        let response = QueueStatusResponse {
            queued,
            pending,
            processed_idx: progress.processed_idx,
            confirmed_idx: progress.confirmed_idx,
            queued_amount: self.pipeline.queued_amount().to_string(),
            claims: self
                .pipeline
                .transaction_queue(false)
                .into_iter()
                .map(|info| QueueEntry {
                    idx: info.claim.claim_idx,
                    time: info.claim.claim_time,
                    amount: info.amount,
                    status: info.claim.status,
                    tx_hash: info.claim.tx_hash,
                })
                .collect(),
        };

        *cache = Some((Instant::now(), response.clone()));
        response
    }

    pub fn faucet_status(&self) -> FaucetStatusResponse {
        FaucetStatusResponse {
            status: self
                .status
                .snapshot()
                .into_iter()
                .map(|(key, report)| FaucetStatusEntry {
                    key,
                    level: report.level,
                    message: report.message,
                })
                .collect(),
        }
    }

    fn session_response(&self, session: &SessionData, details: bool) -> SessionStatusResponse {
        let claim = session.claim.as_ref();

        SessionStatusResponse {
            session: session.id.clone(),
            status: session.status,
            start_time: session.created_at.timestamp(),
            claim_idx: claim.map(|c| c.claim_idx),
            claim_status: claim.map(|c| c.status),
            claim_message: claim.and_then(|c| c.tx_error.clone()),
            tx_hash: claim.and_then(|c| c.tx_hash.clone()),
            tx_height: claim.and_then(|c| c.tx_height),
            tx_fee: claim.and_then(|c| c.tx_fee.clone()),
            target_addr: details.then(|| session.target_addr.clone()),
            amount: details.then(|| session.drop_amount.clone()),
        }
    }
}

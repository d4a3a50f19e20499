use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::chain::Coin;
use crate::claims::pipeline::ClaimPipeline;
use crate::config::{ChainConfig, ClaimsConfig, RefillConfig};
use crate::database::SessionStore;
use crate::wallet::WalletManager;

/// Minimum spacing between two acting invocations, regardless of outcome.
const ATTEMPT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
struct RefillState {
    last_attempt: Option<Instant>,
    last_success: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Refill,
    Overflow { amount: u128 },
}

/// Keeps the wallet's available token balance inside the configured band
/// by withdrawing from, or depositing to, the treasury contract.
///
/// Available balance is the wallet token balance minus the amounts
/// committed to claimable sessions and queued claims.
pub struct RefillController {
    wallet: Arc<WalletManager>,
    store: Arc<dyn SessionStore>,
    pipeline: Arc<ClaimPipeline>,
    config: RefillConfig,
    denom: String,
    confirm_timeout: Duration,
    confirm_poll_interval: Duration,
    state: Mutex<RefillState>,
    flight: tokio::sync::Mutex<()>,
}

impl RefillController {
    pub fn new(
        wallet: Arc<WalletManager>,
        store: Arc<dyn SessionStore>,
        pipeline: Arc<ClaimPipeline>,
        config: RefillConfig,
        chain: &ChainConfig,
        claims: &ClaimsConfig,
    ) -> Self {
        Self {
            wallet,
            store,
            pipeline,
            config,
            denom: chain.denom.clone(),
            confirm_timeout: claims.confirm_timeout,
            confirm_poll_interval: claims.confirm_poll_interval,
            state: Mutex::new(RefillState::default()),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Evaluates the balance band and issues at most one treasury
    /// transaction. Single-flight: concurrent invocations collapse into
    /// the one already running. Failures are logged only; the next
    /// scheduled invocation is the retry.
    #[instrument(level = "debug", skip_all)]
    pub async fn maybe_refill(&self) -> anyhow::Result<()> {
        let Some(contract) = self.contract() else {
            return Ok(());
        };

        let Ok(_guard) = self.flight.try_lock() else {
            return Ok(());
        };

        {
            let state = self.lock_state();
            let now = Instant::now();
            if let Some(last) = state.last_attempt {
                if now.duration_since(last) < ATTEMPT_COOLDOWN {
                    return Ok(());
                }
            }
            if let Some(last) = state.last_success {
                if now.duration_since(last) < self.config.cooldown {
                    return Ok(());
                }
            }
        }

        let wallet_state = self.wallet.state();
        if !wallet_state.ready {
            return Ok(());
        }

        let available = self.available_balance(wallet_state.token_balance).await?;

        let action = if available > self.config.overflow_amount {
            Action::Overflow {
                amount: available - self.config.overflow_amount,
            }
        } else if available < self.config.threshold {
            Action::Refill
        } else {
            return Ok(());
        };

        self.lock_state().last_attempt = Some(Instant::now());

        let transfer = match &action {
            Action::Refill => {
                info!(%available, amount = %self.config.amount, "Withdrawing from treasury");
                let msg = serde_json::json!({
                    "withdraw": { "amount": self.config.amount.to_string() }
                });
                self.wallet.execute_contract(&contract, &msg, vec![]).await
            }
            Action::Overflow { amount } => {
                info!(%available, %amount, "Depositing overflow to treasury");
                let msg = serde_json::json!({ "deposit": {} });
                let funds = vec![Coin {
                    denom: self.denom.clone(),
                    amount: *amount,
                }];
                self.wallet.execute_contract(&contract, &msg, funds).await
            }
        };

        let transfer = match transfer {
            Ok(transfer) => transfer,
            Err(err) => {
                warn!(%err, "Treasury transaction broadcast failed");
                return Ok(());
            }
        };

        match self
            .wallet
            .wait_for_tx(
                &transfer.tx_hash,
                self.confirm_timeout,
                self.confirm_poll_interval,
            )
            .await
        {
            Ok(Some(tx)) if tx.code == 0 => {
                self.lock_state().last_success = Some(Instant::now());
                self.wallet.load_wallet_state().await;
                info!(hash = %transfer.tx_hash, "Treasury transaction confirmed");
            }
            Ok(Some(tx)) => {
                warn!(hash = %transfer.tx_hash, code = tx.code, "Treasury transaction failed");
            }
            Ok(None) => {
                warn!(hash = %transfer.tx_hash, "Treasury transaction confirmation timed out");
            }
            Err(err) => {
                warn!(hash = %transfer.tx_hash, %err, "Treasury confirmation watch aborted");
            }
        }

        Ok(())
    }

    fn contract(&self) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        self.config.contract.clone()
    }

    async fn available_balance(&self, token_balance: u128) -> anyhow::Result<u128> {
        let unclaimed = self.store.unclaimed_balance().await?;
        let queued = self.pipeline.queued_amount();

        Ok(token_balance
            .saturating_sub(unclaimed)
            .saturating_sub(queued))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefillState> {
        self.state.lock().expect("refill state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chain::testing::MockChain;
    use crate::claims::NoopHooks;
    use crate::database::testing::MemoryStore;
    use crate::notifications::NotificationHub;
    use crate::session::SessionStatus;
    use crate::test_utils::{chain_config, claimable_session, claims_config, ready_wallet};

    struct Fixture {
        controller: RefillController,
        chain: Arc<MockChain>,
        store: Arc<MemoryStore>,
        wallet: Arc<WalletManager>,
    }

    fn refill_config() -> RefillConfig {
        RefillConfig {
            enabled: true,
            contract: Some("wasm1treasury".to_string()),
            amount: 100_000_000,
            threshold: 50_000_000,
            overflow_amount: 200_000_000,
            cooldown: Duration::from_secs(3600),
        }
    }

    async fn fixture(config: RefillConfig) -> Fixture {
        // A contract token keeps the token balance independent of the
        // native (gas) balance in these tests.
        let (wallet, chain) = ready_wallet(false).await;
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(ClaimPipeline::new(
            store.clone(),
            wallet.clone(),
            Arc::new(NotificationHub::new()),
            Arc::new(NoopHooks),
            claims_config(),
            &chain_config(false),
        ));

        let controller = RefillController::new(
            wallet.clone(),
            store.clone(),
            pipeline,
            config,
            &chain_config(false),
            &claims_config(),
        );

        Fixture {
            controller,
            chain,
            store,
            wallet,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_deposits_excess_and_respects_cooldown() {
        let f = fixture(refill_config()).await;

        // token balance ten times the overflow bound, nothing committed
        f.chain.set_balances(0, 1_000_000_000, 2_000_000_000);
        f.wallet.load_wallet_state().await;
        f.chain.set_tx_result("MOCKTX1", 0, 10);

        f.controller.maybe_refill().await.unwrap();

        let executes = f.chain.executes();
        assert_eq!(executes.len(), 1);
        assert_eq!(executes[0].0, "wasm1treasury");
        assert_eq!(executes[0].1, serde_json::json!({ "deposit": {} }));
        assert_eq!(executes[0].2.len(), 1);
        assert_eq!(executes[0].2[0].amount, 2_000_000_000 - 200_000_000);
        assert_eq!(executes[0].2[0].denom, "ustake");

        // success recorded; an immediate re-invocation is a no-op
        f.controller.maybe_refill().await.unwrap();
        assert_eq!(f.chain.executes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_withdraws_when_below_threshold() {
        let f = fixture(refill_config()).await;

        f.chain.set_balances(0, 1_000_000_000, 10_000_000);
        f.wallet.load_wallet_state().await;
        f.chain.set_tx_result("MOCKTX1", 0, 10);

        f.controller.maybe_refill().await.unwrap();

        let executes = f.chain.executes();
        assert_eq!(executes.len(), 1);
        assert_eq!(
            executes[0].1,
            serde_json::json!({ "withdraw": { "amount": "100000000" } })
        );
        assert!(executes[0].2.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn committed_amounts_reduce_available_balance() {
        let f = fixture(refill_config()).await;

        // 60M in the wallet, 55M of it committed to a claimable session:
        // available 5M, below the 50M threshold.
        f.chain.set_balances(0, 1_000_000_000, 60_000_000);
        f.wallet.load_wallet_state().await;
        f.store.insert({
            let mut s = claimable_session("c1", "55000000");
            s.status = SessionStatus::Claimable;
            s
        });
        f.chain.set_tx_result("MOCKTX1", 0, 10);

        f.controller.maybe_refill().await.unwrap();

        let executes = f.chain.executes();
        assert_eq!(executes.len(), 1);
        assert!(executes[0].1.get("withdraw").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn inside_band_is_a_noop() {
        let f = fixture(refill_config()).await;

        f.chain.set_balances(0, 1_000_000_000, 100_000_000);
        f.wallet.load_wallet_state().await;

        f.controller.maybe_refill().await.unwrap();

        assert!(f.chain.executes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_controller_is_a_noop() {
        let mut config = refill_config();
        config.enabled = false;
        let f = fixture(config).await;

        f.chain.set_balances(0, 1_000_000_000, 2_000_000_000);
        f.wallet.load_wallet_state().await;

        f.controller.maybe_refill().await.unwrap();
        assert!(f.chain.executes().is_empty());

        let mut config = refill_config();
        config.contract = None;
        let f = fixture(config).await;

        f.chain.set_balances(0, 1_000_000_000, 2_000_000_000);
        f.wallet.load_wallet_state().await;

        f.controller.maybe_refill().await.unwrap();
        assert!(f.chain.executes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cooldown_gates_failed_attempts() {
        let f = fixture(refill_config()).await;

        f.chain.set_balances(0, 1_000_000_000, 10_000_000);
        f.wallet.load_wallet_state().await;
        // the withdraw lands on-chain but fails, so no success is recorded
        f.chain.set_tx_result("MOCKTX1", 5, 10);

        f.controller.maybe_refill().await.unwrap();
        assert_eq!(f.chain.executes().len(), 1);

        // within the attempt cooldown nothing happens, success or not
        f.controller.maybe_refill().await.unwrap();
        assert_eq!(f.chain.executes().len(), 1);

        // past the attempt cooldown the controller retries
        tokio::time::sleep(ATTEMPT_COOLDOWN + Duration::from_secs(1)).await;
        f.chain.set_tx_result("MOCKTX2", 0, 11);
        f.controller.maybe_refill().await.unwrap();
        assert_eq!(f.chain.executes().len(), 2);
    }
}

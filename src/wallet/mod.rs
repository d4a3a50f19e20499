use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::chain::{ChainClient, ChainConnector, ChainError, Coin, GasFee, TxResult};
use crate::config::{ChainConfig, ClaimsConfig};
use crate::status::{StatusLevel, StatusRegistry, StatusReport};

/// Immutable snapshot of the hot wallet. Replaced atomically, never
/// mutated in place by observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletState {
    pub ready: bool,
    pub sequence: u64,
    pub token_balance: u128,
    pub native_balance: u128,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet is not ready")]
    NotReady,
    #[error("transaction broadcast failed: {0}")]
    Broadcast(String),
    #[error("chain rpc error: {0}")]
    Chain(#[from] ChainError),
}

/// Handle to a broadcast-accepted transfer awaiting inclusion.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub tx_hash: String,
}

/// Owns the signing identity and the chain clients, publishes the latest
/// [`WalletState`] and executes transfers on behalf of the pipeline.
///
/// After every accepted broadcast the local snapshot is debited
/// optimistically (sequence and balances); the periodic
/// [`WalletManager::load_wallet_state`] is the reconciling authority.
pub struct WalletManager {
    config: ChainConfig,
    min_balance: u128,
    low_balance_threshold: u128,
    fee: GasFee,
    connector: Arc<dyn ChainConnector>,
    status: Arc<StatusRegistry>,
    client: RwLock<Option<Arc<dyn ChainClient>>>,
    state: RwLock<WalletState>,
    last_refresh: RwLock<Option<Instant>>,
    reload_requested: AtomicBool,
    reload_notify: Notify,
}

impl WalletManager {
    pub fn new(
        config: ChainConfig,
        claims: &ClaimsConfig,
        connector: Arc<dyn ChainConnector>,
        status: Arc<StatusRegistry>,
    ) -> anyhow::Result<Self> {
        let fee = GasFee {
            amount: Coin {
                denom: config.denom.clone(),
                amount: config.fee_amount()?,
            },
            gas_limit: config.gas_limit,
        };

        Ok(Self {
            min_balance: claims.min_balance,
            low_balance_threshold: claims.low_balance_threshold,
            fee,
            connector,
            status,
            config,
            client: RwLock::new(None),
            state: RwLock::new(WalletState::default()),
            last_refresh: RwLock::new(None),
            reload_requested: AtomicBool::new(false),
            reload_notify: Notify::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> WalletState {
        *self.state.read().expect("wallet state lock poisoned")
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    #[must_use]
    pub fn last_refresh(&self) -> Option<Instant> {
        *self
            .last_refresh
            .read()
            .expect("wallet refresh lock poisoned")
    }

    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.client()
            .ok()
            .map(|client| client.address().to_owned())
    }

    /// The flat fee attached to every transaction this wallet signs.
    #[must_use]
    pub fn gas_fee(&self) -> &GasFee {
        &self.fee
    }

    fn client(&self) -> Result<Arc<dyn ChainClient>, WalletError> {
        self.client
            .read()
            .expect("wallet client lock poisoned")
            .clone()
            .ok_or(WalletError::NotReady)
    }

    fn set_client(&self, client: Option<Arc<dyn ChainClient>>) {
        *self.client.write().expect("wallet client lock poisoned") = client;
    }

    /// Connects the chain clients if necessary and loads the first wallet
    /// snapshot. Idempotent; the caller retries on error.
    #[instrument(level = "debug", skip_all)]
    pub async fn try_initialize(&self) -> anyhow::Result<()> {
        if self.client().is_err() {
            match self.connector.connect().await {
                Ok(client) => {
                    info!(address = client.address(), "Wallet connected");
                    self.set_client(Some(client));
                }
                Err(err) => {
                    self.publish_status(WalletState::default());
                    return Err(err.into());
                }
            }
        }

        self.load_wallet_state().await;

        if self.is_ready() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("wallet state refresh failed"))
        }
    }

    /// Queries sequence and balances and replaces the snapshot. On any
    /// failure a not-ready snapshot with zeroed balances is published.
    /// Always bumps the refresh timestamp and republishes status.
    pub async fn load_wallet_state(&self) {
        let snapshot = match self.query_state().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "Failed to refresh wallet state");
                WalletState::default()
            }
        };

        *self.state.write().expect("wallet state lock poisoned") = snapshot;
        *self
            .last_refresh
            .write()
            .expect("wallet refresh lock poisoned") = Some(Instant::now());
        self.publish_status(snapshot);
    }

    async fn query_state(&self) -> Result<WalletState, WalletError> {
        let client = self.client()?;
        let address = client.address().to_owned();

        let sequence = client.account_sequence().await?;
        let native_balance = client.native_balance(&address, &self.config.denom).await?;

        let token_balance = if self.config.is_native_token {
            native_balance
        } else {
            let contract = self
                .config
                .contract_address
                .as_deref()
                .ok_or(WalletError::NotReady)?;
            let response = client
                .query_contract_smart(
                    contract,
                    &serde_json::json!({ "balance": { "address": address } }),
                )
                .await?;
            let balance = response
                .get("balance")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            crate::utils::amount::parse_base_amount(balance).map_err(ChainError::BalanceParse)?
        };

        Ok(WalletState {
            ready: true,
            sequence,
            token_balance,
            native_balance,
        })
    }

    /// Sends `amount` of the faucet token to `recipient`: a bank send for
    /// a native token, a `transfer {}` execute for a contract token.
    #[instrument(level = "debug", skip(self))]
    pub async fn send_tokens(
        &self,
        recipient: &str,
        amount: u128,
    ) -> Result<PendingTransfer, WalletError> {
        let state = self.state();
        if !state.ready {
            return Err(WalletError::NotReady);
        }
        let client = self.client()?;

        let result = if self.config.is_native_token {
            client
                .bank_send(
                    recipient,
                    Coin {
                        denom: self.config.denom.clone(),
                        amount,
                    },
                    &self.fee,
                    state.sequence,
                )
                .await
        } else {
            let contract = self
                .config
                .contract_address
                .as_deref()
                .ok_or(WalletError::NotReady)?;
            let msg = serde_json::json!({
                "transfer": { "recipient": recipient, "amount": amount.to_string() }
            });
            client
                .execute_contract(contract, &msg, vec![], &self.fee, state.sequence)
                .await
        };

        let tx_hash = result.map_err(|err| WalletError::Broadcast(err.to_string()))?;

        let fee_amount = self.fee.amount.amount;
        let is_native = self.config.is_native_token;
        self.apply_debit(|state| {
            state.sequence += 1;
            state.token_balance = state.token_balance.saturating_sub(amount);
            state.native_balance = state.native_balance.saturating_sub(fee_amount);
            if is_native {
                state.native_balance = state.native_balance.saturating_sub(amount);
            }
        });

        debug!(%tx_hash, "Transfer broadcast");

        Ok(PendingTransfer { tx_hash })
    }

    /// Executes an arbitrary contract message with optional attached
    /// funds, using the wallet's configured fee.
    #[instrument(level = "debug", skip(self, msg))]
    pub async fn execute_contract(
        &self,
        contract: &str,
        msg: &serde_json::Value,
        funds: Vec<Coin>,
    ) -> Result<PendingTransfer, WalletError> {
        let state = self.state();
        if !state.ready {
            return Err(WalletError::NotReady);
        }
        let client = self.client()?;

        let tx_hash = client
            .execute_contract(contract, msg, funds, &self.fee, state.sequence)
            .await
            .map_err(|err| WalletError::Broadcast(err.to_string()))?;

        let fee_amount = self.fee.amount.amount;
        self.apply_debit(|state| {
            state.sequence += 1;
            state.native_balance = state.native_balance.saturating_sub(fee_amount);
        });

        Ok(PendingTransfer { tx_hash })
    }

    /// Read-through balance query of an external address. Never cached.
    pub async fn wallet_balance(&self, address: &str) -> Result<u128, WalletError> {
        let client = self.client()?;
        Ok(client.native_balance(address, &self.config.denom).await?)
    }

    /// Polls the read-only client for `hash` until the chain knows the
    /// transaction or `timeout` elapses. Transient lookup errors keep the
    /// poll going; `None` means the wait timed out.
    pub async fn wait_for_tx(
        &self,
        hash: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<TxResult>, WalletError> {
        let client = self.client()?;
        let deadline = Instant::now() + timeout;

        loop {
            match client.get_tx(hash).await {
                Ok(Some(tx)) => return Ok(Some(tx)),
                Ok(None) => {}
                Err(err) => debug!(%hash, %err, "Transaction lookup failed, retrying"),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Formats a base-unit amount for humans, truncated to three
    /// fractional digits.
    #[must_use]
    pub fn readable_amount(&self, amount: u128) -> String {
        format_units(amount, self.config.decimals, &self.config.symbol)
    }

    /// Requests a fresh client construction. Picked up by the wallet
    /// monitor task.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
        self.reload_notify.notify_one();
    }

    pub async fn reload_signalled(&self) {
        self.reload_notify.notified().await;
    }

    /// Drops the current clients so the monitor reconnects; resets the
    /// refresh timestamp so downstream consumers re-evaluate.
    pub fn begin_reload(&self) {
        if self.reload_requested.swap(false, Ordering::SeqCst) {
            info!("Wallet reload requested, reconnecting chain clients");
        }
        self.set_client(None);
        *self
            .last_refresh
            .write()
            .expect("wallet refresh lock poisoned") = None;
        let mut state = self.state.write().expect("wallet state lock poisoned");
        state.ready = false;
    }

    fn apply_debit(&self, debit: impl FnOnce(&mut WalletState)) {
        let mut state = self.state.write().expect("wallet state lock poisoned");
        let mut next = *state;
        debit(&mut next);
        *state = next;
    }

    fn publish_status(&self, state: WalletState) {
        let report = if !state.ready {
            StatusReport::new(StatusLevel::Error, "Cannot connect to network")
        } else if state.token_balance <= self.min_balance
            || state.native_balance <= self.config.min_gas_amount
        {
            StatusReport::new(StatusLevel::Error, "The faucet is out of funds!")
        } else if state.token_balance <= self.low_balance_threshold {
            StatusReport::new(
                StatusLevel::Warning,
                format!(
                    "The faucet is running low on funds! Balance: {}",
                    self.readable_amount(state.token_balance)
                ),
            )
        } else {
            StatusReport::new(StatusLevel::Info, "")
        };

        self.status.set("wallet", report);
    }
}

/// `amount / 10^decimals`, truncated (not rounded) to three fractional
/// digits, suffixed with the symbol.
#[must_use]
pub fn format_units(amount: u128, decimals: u32, symbol: &str) -> String {
    let scale = 10u128.pow(decimals);
    let int = amount / scale;
    let frac = amount % scale;

    let frac3 = if decimals >= 3 {
        frac / 10u128.pow(decimals - 3)
    } else {
        frac * 10u128.pow(3 - decimals)
    };

    if frac3 == 0 {
        return format!("{int} {symbol}");
    }

    let mut frac_str = format!("{frac3:03}");
    while frac_str.ends_with('0') {
        frac_str.pop();
    }

    format!("{int}.{frac_str} {symbol}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chain::testing::{MockChain, MockConnector};
    use crate::test_utils::{chain_config, claims_config};

    async fn ready_wallet(is_native: bool) -> (Arc<WalletManager>, Arc<MockChain>) {
        let chain = Arc::new(MockChain::new("wasm1faucet"));
        chain.set_balances(7, 1_000_000_000, 500_000_000);

        let wallet = Arc::new(
            WalletManager::new(
                chain_config(is_native),
                &claims_config(),
                Arc::new(MockConnector::new(chain.clone())),
                Arc::new(StatusRegistry::new()),
            )
            .unwrap(),
        );
        wallet.try_initialize().await.unwrap();

        (wallet, chain)
    }

    #[test]
    fn readable_amount_truncates() {
        assert_eq!(format_units(1234, 3, "SYM"), "1.234 SYM");
        assert_eq!(format_units(1239, 3, "SYM"), "1.239 SYM");
        assert_eq!(format_units(1, 3, "SYM"), "0.001 SYM");
        assert_eq!(format_units(0, 3, "SYM"), "0 SYM");
        // truncation, not rounding
        assert_eq!(format_units(1_999_999, 6, "SYM"), "1.999 SYM");
        assert_eq!(format_units(1_500_000, 6, "SYM"), "1.5 SYM");
        assert_eq!(format_units(42, 0, "SYM"), "42 SYM");
        assert_eq!(format_units(12, 1, "SYM"), "1.2 SYM");
    }

    #[tokio::test]
    async fn send_tokens_requires_ready_wallet() {
        let chain = Arc::new(MockChain::new("wasm1faucet"));
        let wallet = WalletManager::new(
            chain_config(true),
            &claims_config(),
            Arc::new(MockConnector::new(chain)),
            Arc::new(StatusRegistry::new()),
        )
        .unwrap();

        let err = wallet.send_tokens("wasm1target", 1_000).await.unwrap_err();
        assert!(matches!(err, WalletError::NotReady));
    }

    #[tokio::test]
    async fn native_send_applies_optimistic_debits() {
        let (wallet, chain) = ready_wallet(true).await;

        wallet.send_tokens("wasm1target", 1_000_000).await.unwrap();
        wallet.send_tokens("wasm1target", 2_000_000).await.unwrap();

        let state = wallet.state();
        // sequence advanced once per accepted broadcast
        assert_eq!(state.sequence, 9);
        // native token: amount + gas debited from the native balance
        assert_eq!(state.native_balance, 1_000_000_000 - 3_000_000 - 2 * 200);
        assert_eq!(state.token_balance, 1_000_000_000 - 3_000_000);

        // each broadcast was signed with the tracked sequence
        assert_eq!(
            chain
                .sends()
                .iter()
                .map(|(_, _, seq)| *seq)
                .collect::<Vec<_>>(),
            vec![7, 8]
        );
    }

    #[tokio::test]
    async fn contract_send_debits_token_and_gas_separately() {
        let (wallet, chain) = ready_wallet(false).await;

        wallet.send_tokens("wasm1target", 1_000_000).await.unwrap();

        let state = wallet.state();
        assert_eq!(state.sequence, 8);
        assert_eq!(state.token_balance, 500_000_000 - 1_000_000);
        assert_eq!(state.native_balance, 1_000_000_000 - 200);

        let executes = chain.executes();
        assert_eq!(executes.len(), 1);
        assert_eq!(executes[0].0, "wasm1contract");
        assert_eq!(
            executes[0].1,
            serde_json::json!({
                "transfer": { "recipient": "wasm1target", "amount": "1000000" }
            })
        );
    }

    #[tokio::test]
    async fn broadcast_failure_leaves_state_untouched() {
        let (wallet, chain) = ready_wallet(true).await;
        chain.fail_broadcast("out of gas");

        let before = wallet.state();
        let err = wallet.send_tokens("wasm1target", 1_000).await.unwrap_err();

        assert!(matches!(err, WalletError::Broadcast(_)));
        assert_eq!(wallet.state(), before);
    }

    #[tokio::test]
    async fn refresh_overwrites_optimistic_debits() {
        let (wallet, chain) = ready_wallet(true).await;

        wallet.send_tokens("wasm1target", 1_000_000).await.unwrap();
        assert_eq!(wallet.state().sequence, 8);

        chain.set_balances(8, 999_000_000, 999_000_000);
        wallet.load_wallet_state().await;

        let state = wallet.state();
        assert_eq!(state.sequence, 8);
        assert_eq!(state.native_balance, 999_000_000);
    }

    #[tokio::test]
    async fn failed_refresh_publishes_not_ready() {
        let status = Arc::new(StatusRegistry::new());
        let chain = Arc::new(MockChain::new("wasm1faucet"));
        chain.set_balances(0, 1_000_000_000, 1_000_000_000);

        let wallet = WalletManager::new(
            chain_config(true),
            &claims_config(),
            Arc::new(MockConnector::new(chain.clone())),
            status.clone(),
        )
        .unwrap();
        wallet.try_initialize().await.unwrap();
        assert!(wallet.is_ready());

        chain.fail_queries(true);
        wallet.load_wallet_state().await;

        assert!(!wallet.is_ready());
        assert_eq!(wallet.state(), WalletState::default());
        let report = status.get("wallet").unwrap();
        assert_eq!(report.level, StatusLevel::Error);
        assert_eq!(report.message, "Cannot connect to network");
    }

    #[tokio::test]
    async fn status_ladder_tracks_balances() {
        let status = Arc::new(StatusRegistry::new());
        let chain = Arc::new(MockChain::new("wasm1faucet"));
        chain.set_balances(0, 1_000_000_000, 1_000_000_000);

        let wallet = WalletManager::new(
            chain_config(true),
            &claims_config(),
            Arc::new(MockConnector::new(chain.clone())),
            status.clone(),
        )
        .unwrap();
        wallet.try_initialize().await.unwrap();
        assert_eq!(status.get("wallet").unwrap().level, StatusLevel::Info);

        // native token: the token balance mirrors the native balance, so
        // park both inside the warning band
        chain.set_balances(0, 20_000, 20_000);
        wallet.load_wallet_state().await;
        let report = status.get("wallet").unwrap();
        assert_eq!(report.level, StatusLevel::Warning);
        assert!(report.message.contains("running low"));

        // native balance at the gas floor
        chain.set_balances(0, 1_000, 1_000_000_000);
        wallet.load_wallet_state().await;
        let report = status.get("wallet").unwrap();
        assert_eq!(report.level, StatusLevel::Error);
        assert_eq!(report.message, "The faucet is out of funds!");
    }
}

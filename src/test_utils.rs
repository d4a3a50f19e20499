use std::sync::Arc;

use chrono::Utc;

use crate::chain::testing::{MockChain, MockConnector};
use crate::config::{default, ChainConfig, ClaimsConfig};
use crate::session::{SessionData, SessionStatus};
use crate::status::StatusRegistry;
use crate::wallet::WalletManager;

pub fn chain_config(is_native: bool) -> ChainConfig {
    ChainConfig {
        rpc_host: "http://localhost:9090".to_string(),
        address_prefix: "wasm".to_string(),
        wallet_mnemonic: String::new(),
        gas_price: default::gas_price(),
        denom: "ustake".to_string(),
        decimals: 6,
        symbol: "STAKE".to_string(),
        is_native_token: is_native,
        contract_address: (!is_native).then(|| "wasm1contract".to_string()),
        gas_amount: Some(200),
        gas_limit: default::gas_limit(),
        min_gas_amount: 1_000,
    }
}

pub fn claims_config() -> ClaimsConfig {
    ClaimsConfig {
        min_amount: 1_000,
        max_amount: 10_000_000,
        max_pending: 5,
        min_balance: 5_000,
        low_balance_threshold: 50_000,
        tick_interval: default::tick_interval(),
        confirm_timeout: default::confirm_timeout(),
        confirm_poll_interval: default::confirm_poll_interval(),
        history_retention: default::history_retention(),
    }
}

pub fn claimable_session(id: &str, amount: &str) -> SessionData {
    SessionData {
        id: id.to_string(),
        status: SessionStatus::Claimable,
        target_addr: "wasm1target".to_string(),
        drop_amount: amount.to_string(),
        created_at: Utc::now(),
        claim: None,
    }
}

/// A connected wallet backed by a [`MockChain`] with generous balances.
pub async fn ready_wallet(is_native: bool) -> (Arc<WalletManager>, Arc<MockChain>) {
    let chain = Arc::new(MockChain::new("wasm1faucet"));
    chain.set_balances(0, 1_000_000_000, 1_000_000_000);

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

/// Polls `cond` until it holds; panics after ~20 simulated seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod grpc;

pub use grpc::{GrpcChain, GrpcConnector};

/// A denominated base-unit amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub denom: String,
    pub amount: u128,
}

/// Flat fee attached to a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasFee {
    pub amount: Coin,
    pub gas_limit: u64,
}

/// Result of a transaction lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub hash: String,
    pub height: i64,
    /// Zero means the transaction executed successfully.
    pub code: u32,
    pub raw_log: String,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("chain rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("transaction rejected at broadcast (code {code}): {log}")]
    Broadcast { code: u32, log: String },
    #[error("invalid wallet mnemonic")]
    InvalidMnemonic,
    #[error("invalid chain id: {0}")]
    ChainId(String),
    #[error("account not found on chain")]
    MissingAccount,
    #[error("malformed account response: {0}")]
    AccountDecode(#[from] cosmrs::proto::prost::DecodeError),
    #[error("encoding error: {0}")]
    Encoding(#[from] cosmrs::ErrorReport),
    #[error("malformed contract response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed balance amount: {0}")]
    BalanceParse(#[from] crate::utils::amount::AmountParseError),
}

/// The subset of chain operations the settlement core uses: account
/// lookup, balance queries, bank send, contract execute, smart query and
/// transaction lookup.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Bech32 address of the signing wallet.
    fn address(&self) -> &str;

    /// Current account sequence (nonce) of the signing wallet.
    async fn account_sequence(&self) -> Result<u64, ChainError>;

    async fn native_balance(&self, address: &str, denom: &str) -> Result<u128, ChainError>;

    async fn query_contract_smart(
        &self,
        contract: &str,
        query: &serde_json::Value,
    ) -> Result<serde_json::Value, ChainError>;

    /// Broadcasts a bank send signed at `sequence`. Returns the tx hash.
    async fn bank_send(
        &self,
        recipient: &str,
        coin: Coin,
        fee: &GasFee,
        sequence: u64,
    ) -> Result<String, ChainError>;

    /// Broadcasts a contract execute signed at `sequence`. Returns the tx
    /// hash.
    async fn execute_contract(
        &self,
        contract: &str,
        msg: &serde_json::Value,
        funds: Vec<Coin>,
        fee: &GasFee,
        sequence: u64,
    ) -> Result<String, ChainError>;

    /// Looks a transaction up by hash. `None` means the chain does not
    /// know it (yet).
    async fn get_tx(&self, hash: &str) -> Result<Option<TxResult>, ChainError>;
}

/// Builds [`ChainClient`]s. The wallet's initialization retry loop and the
/// reload signal both construct fresh clients through this.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ChainClient>, ChainError>;
}

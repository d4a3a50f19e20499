use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database;
use crate::session::SessionData;

pub mod pipeline;

/// State of a claim inside the settlement pipeline.
///
/// `Confirmed` and `Failed` are terminal; a claim never leaves a terminal
/// state and never re-enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Queue,
    Processing,
    Pending,
    Confirmed,
    Failed,
}

impl ClaimStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub claim_idx: u64,
    pub status: ClaimStatus,
    /// Unix seconds, set once at creation.
    pub claim_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_fee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_error: Option<String>,
}

impl Claim {
    #[must_use]
    pub fn new(claim_idx: u64) -> Self {
        Self {
            claim_idx,
            status: ClaimStatus::Queue,
            claim_time: Utc::now().timestamp(),
            tx_hash: None,
            tx_height: None,
            tx_fee: None,
            tx_error: None,
        }
    }
}

/// A claim together with the session it settles for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimInfo {
    pub session_id: String,
    pub target_addr: String,
    /// Base-unit integer string; never converted through floating point.
    pub amount: String,
    pub claim: Claim,
}

/// The progress watermark published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimProgress {
    pub processed_idx: u64,
    pub confirmed_idx: u64,
}

/// Client-visible claim errors plus the internal wrappers surfaced to
/// operators through logs.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("session not found")]
    UnknownSession,
    #[error("session is not claimable")]
    NotClaimable,
    #[error("drop amount is below the configured minimum")]
    AmountTooLow,
    #[error("drop amount is above the configured maximum")]
    AmountTooHigh,
    #[error("target address does not match the expected address prefix")]
    InvalidAddress,
    #[error("session is already claiming")]
    RaceClaiming,
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Database(#[from] database::Error),
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

/// Raised by a [`ClaimHooks::before_claim`] implementation to veto a claim
/// with a client-visible message. Any other hook failure is wrapped as
/// [`ClaimError::Internal`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ClaimRejection(pub String);

/// Extension points invoked around claim settlement.
#[async_trait]
pub trait ClaimHooks: Send + Sync {
    /// Runs before a claim is accepted into the queue.
    async fn before_claim(&self, session: &SessionData) -> anyhow::Result<()>;

    /// Runs after a claim confirms on chain.
    async fn session_claimed(&self, info: &ClaimInfo);
}

/// Default hook chain: accepts everything, records nothing.
pub struct NoopHooks;

#[async_trait]
impl ClaimHooks for NoopHooks {
    async fn before_claim(&self, _session: &SessionData) -> anyhow::Result<()> {
        Ok(())
    }

    async fn session_claimed(&self, _info: &ClaimInfo) {}
}

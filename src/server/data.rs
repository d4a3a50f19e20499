use serde::{Deserialize, Serialize};

use crate::claims::ClaimStatus;
use crate::session::SessionStatus;
use crate::status::StatusLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRewardRequest {
    pub session: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatusQuery {
    pub session: String,
    #[serde(default)]
    pub details: Option<u8>,
}

impl SessionStatusQuery {
    #[must_use]
    pub fn wants_details(&self) -> bool {
        self.details.is_some_and(|d| d != 0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimSocketQuery {
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session: String,
    pub status: SessionStatus,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_idx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_status: Option<ClaimStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_fee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub idx: u64,
    pub time: i64,
    pub amount: String,
    pub status: ClaimStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub queued: usize,
    pub pending: usize,
    pub processed_idx: u64,
    pub confirmed_idx: u64,
    pub queued_amount: String,
    pub claims: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetStatusEntry {
    pub key: String,
    pub level: StatusLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetStatusResponse {
    pub status: Vec<FaucetStatusEntry>,
}

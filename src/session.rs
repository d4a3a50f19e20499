use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claims::Claim;

/// Lifecycle state of a faucet session.
///
/// Everything before `Claimable` is managed by the upstream session
/// modules; the settlement pipeline only transitions sessions between
/// `Claimable`, `Claiming` and the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Claimable,
    Claiming,
    Finished,
    Failed,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Claimable => "claimable",
            Self::Claiming => "claiming",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "claimable" => Some(Self::Claimable),
            "claiming" => Some(Self::Claiming),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub id: String,
    pub status: SessionStatus,
    pub target_addr: String,
    /// Base-unit integer string committed to this session.
    pub drop_amount: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
}

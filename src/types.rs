/// Core Domain Types
///
/// Entities persisted by the block store plus the small value types shared
/// between the engine, the detector and the API. Hex fields are always
/// normalised lowercase `0x…` strings; amounts travel as decimal strings.

use serde::{Deserialize, Serialize};

/// A canonical chain entry, keyed by height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub chain_id: u64,
}

/// A decoded ERC-20-style Transfer log, persisted alongside its block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub from_address: String,
    pub to_address: String,
    /// Non-negative integer as decimal digits, up to 78 of them (2^256 - 1).
    pub amount: String,
    pub token_address: String,
}

/// Named record of the highest durably synced block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub block_number: u64,
    pub block_hash: String,
    pub synced_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Lifecycle state a processor reports in its sync_status row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Active,
    Paused,
    Error,
    Complete,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Active => "active",
            SyncState::Paused => "paused",
            SyncState::Error => "error",
            SyncState::Complete => "complete",
        }
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SyncState::Active),
            "paused" => Ok(SyncState::Paused),
            "error" => Ok(SyncState::Error),
            "complete" => Ok(SyncState::Complete),
            other => Err(format!("unknown sync state: {other}")),
        }
    }
}

/// Per-processor progress row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub processor_name: String,
    pub last_processed_block: Option<u64>,
    pub last_processed_hash: Option<String>,
    pub target_block: Option<u64>,
    pub synced_percent: f64,
    pub state: SyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A contiguous range of missing block numbers, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub lo: u64,
    pub hi: u64,
}

impl Gap {
    pub fn len(&self) -> u64 {
        self.hi - self.lo + 1
    }

    pub fn is_empty(&self) -> bool {
        self.hi < self.lo
    }
}

/// Height + hash pair, used when comparing local and remote tips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub number: u64,
    pub hash: String,
}

// API Type Definitions
//
// Serializable envelopes for the read API. Field names follow the JSON
// conventions the frontends already consume (camelCase where multi-word).

use serde::{Deserialize, Serialize};

use crate::sync::EngineState;
use crate::types::{Block, SyncStatus, Transfer};

/// Paginated list envelope.
#[derive(Serialize, Debug, Clone)]
pub struct Paged<T> {
    pub page: u64,
    #[serde(rename = "totalPages")]
    pub total_pages: u64,
    #[serde(rename = "itemsOnPage")]
    pub items_on_page: u64,
    pub items: Vec<T>,
}

#[derive(Serialize, Debug, Clone)]
pub struct BlockView {
    pub number: u64,
    pub hash: String,
    #[serde(rename = "parentHash")]
    pub parent_hash: String,
    pub timestamp: u64,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
}

impl From<Block> for BlockView {
    fn from(block: Block) -> Self {
        Self {
            number: block.number,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp,
            chain_id: block.chain_id,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct TransferView {
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: u64,
    pub from: String,
    pub to: String,
    /// Exact decimal digits, never a float.
    pub amount: String,
    #[serde(rename = "tokenAddress")]
    pub token_address: String,
}

impl From<Transfer> for TransferView {
    fn from(transfer: Transfer) -> Self {
        Self {
            block_number: transfer.block_number,
            transaction_hash: transfer.transaction_hash,
            log_index: transfer.log_index,
            from: transfer.from_address,
            to: transfer.to_address,
            amount: transfer.amount,
            token_address: transfer.token_address,
        }
    }
}

/// Single block with its transfers.
#[derive(Serialize, Debug, Clone)]
pub struct BlockDetail {
    #[serde(flatten)]
    pub block: BlockView,
    pub transfers: Vec<TransferView>,
}

#[derive(Serialize, Debug, Clone)]
pub struct StatusView {
    pub state: EngineState,
    #[serde(rename = "chainTip")]
    pub chain_tip: u64,
    #[serde(rename = "localTip")]
    pub local_tip: Option<u64>,
    #[serde(rename = "targetBlock")]
    pub target_block: u64,
    pub lag: u64,
    #[serde(rename = "lastSyncAt")]
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor: Option<SyncStatus>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Common page/limit query parameters.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

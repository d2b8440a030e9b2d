//! chainsync - EVM-chain block indexer
//!
//! Follows a chain over JSON-RPC, persists canonical blocks and ERC-20-style
//! Transfer logs into PostgreSQL, and serves the result over a read-only
//! HTTP API. The sync engine holds one invariant under provider flakiness
//! and reorgs: the local chain is always a prefix of the canonical chain.

pub mod api;
pub mod config;
pub mod constants;
pub mod decode;
pub mod error;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod reorg;
pub mod retry;
pub mod rpc;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod validate;

#[cfg(test)]
mod testing;

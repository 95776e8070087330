//! Patrol - Bittensor transaction subgraphs
//!
//! Reads block events from a Subtensor archive node, decodes balance
//! transfers and stake movements, and assembles the transaction subgraph
//! around an account. Subgraphs handed in by peers are validated against
//! the chain and scored.

pub mod cache;
pub mod config;
pub mod rpc;
pub mod runtime;
pub mod types;

// Chain access
pub mod client;
pub mod codec;
pub mod fetcher;
pub mod owner;

// Decoding and graph assembly
pub mod decoder;
pub mod protocol;
pub mod subgraph;

// Validation and scoring
pub mod keys;
pub mod records;
pub mod scoring;
pub mod store;
pub mod targets;
pub mod validation;

pub mod cli;

#[cfg(test)]
mod testing;

// Re-export the main types for convenience
pub use client::ChainClient;
pub use decoder::EventDecoder;
pub use fetcher::EventFetcher;
pub use protocol::{Edge, GraphPayload, Node};
pub use records::{MinerKey, MinerScoreRecord};
pub use scoring::MinerScoring;
pub use store::{MinerScoreRepository, RocksScoreRepository};
pub use subgraph::SubgraphBuilder;
pub use targets::{Target, TargetGenerator};

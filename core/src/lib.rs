//! Core swap-lifecycle engine for the BTC <-> smart-chain intermediary node.
//!
//! This crate is the hard part of the node: the per-direction state machines,
//! the authorization-signature protocol between user and intermediary, the
//! on-chain escrow interaction layer, the chain-event watcher, the
//! crash-recoverable persistence layer, and the supervisor that ties
//! Lightning HTLC state, Bitcoin inclusion proofs, and smart-chain escrow
//! state together.
//!
//! External collaborators (HTTP surface, price oracle, Lightning node RPC,
//! Bitcoin full-node RPC, BTC relay synchronizer) are reached through the
//! traits in [`escrow`] and [`lightning`]; this crate never talks to the
//! network directly except through those seams.

pub mod auth;
pub mod btc_proof;
pub mod error;
pub mod escrow;
pub mod lightning;
pub mod nonce;
pub mod state_machines;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod watcher;

pub use error::{Error, Result};
pub use store::{Predicate, SwapStore, Value};
pub use types::{Direction, EscrowTerms, SwapKey, SwapRecord};

//! Concrete implementations of the core engine's out-of-scope collaborator
//! traits (§1 "treated as external collaborators") — the price oracle, the
//! Lightning node RPC client, and the smart-chain transaction
//! builder/submitter/vault. This is where those seams actually terminate so
//! the binary is runnable end-to-end (SPEC_FULL §6).

pub mod chain;
pub mod lightning;
pub mod price;

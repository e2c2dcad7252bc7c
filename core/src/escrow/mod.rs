//! The escrow contract adapter (§4.B): deterministic address derivation,
//! the instruction-building `ChainAdapter` trait, and the tx-data scratch
//! side-table.

pub mod addresses;
pub mod contract;
pub mod scratch;
pub mod types;

pub use contract::{ActionSubmitter, ChainAdapter, EventHistory, NativeTransferClient, SolanaEscrowAdapter, TxStatus, TxSubmission, VaultBalance};
pub use types::{Action, CommitStatus, FeeRate, SlottedSignature, SwapData, SwapType};

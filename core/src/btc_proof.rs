//! Bitcoin Proof Builder (§4.E): turns a confirmed Bitcoin transaction into
//! a Merkle inclusion proof plus a committed BTC-relay header reference,
//! synchronizing the relay first if it hasn't caught up yet.
//!
//! The builder never sends transactions itself; [`ProofBatch`] is handed
//! back to the supervisor, which appends it to whatever it's already
//! building and submits the whole batch.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use std::collections::BTreeMap;

/// A confirmed Bitcoin transaction as reported by the Bitcoin full-node RPC
/// collaborator (§4.E).
#[derive(Debug, Clone)]
pub struct ConfirmedTx {
    pub blockhash: BlockHash,
    pub txid: Txid,
    pub hex: String,
    pub confirmations: u32,
    pub block_height: u64,
}

/// `{reversed_txid, pos, merkle[]}` (§4.E).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub reversed_txid: [u8; 32],
    pub pos: u32,
    pub merkle: Vec<[u8; 32]>,
}

/// A header the BTC-relay program has already stored, identified however
/// the relay program addresses its headers (height is always present;
/// `relay_handle` carries whatever relay-specific reference — header hash,
/// PDA, etc. — a claim instruction needs to point at it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedHeader {
    pub block_height: u64,
    pub relay_handle: Vec<u8>,
}

/// What the BTC-relay synchronizer hands back: extra transactions to run
/// (to post missing headers) plus the headers it computed along the way,
/// keyed by height, so the builder can find the one covering our tx without
/// waiting for those transactions to confirm (§4.E step 2).
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub transactions: Vec<Vec<u8>>,
    pub computed_headers: BTreeMap<u64, CommittedHeader>,
}

/// The BTC-relay program, read-only side (§4.E step 1).
#[async_trait]
pub trait BtcRelay: Send + Sync {
    /// A stored header matching `blockhash` whose relay height is at least
    /// `min_height`, if any.
    async fn find_header(&self, blockhash: &BlockHash, min_height: u64) -> Result<Option<CommittedHeader>>;
}

/// The relay synchronizer, an external collaborator per §1 (§4.E step 2).
#[async_trait]
pub trait BtcRelaySynchronizer: Send + Sync {
    async fn synchronize(&self) -> Result<SyncResult>;
}

/// The Bitcoin full-node RPC collaborator's block-txid listing, needed to
/// compute the Merkle branch for a transaction within its block.
#[async_trait]
pub trait BitcoinBlockSource: Send + Sync {
    async fn block_txids(&self, blockhash: &BlockHash) -> Result<Vec<Txid>>;
}

pub struct ProofBuilder<R: BtcRelay, S: BtcRelaySynchronizer, B: BitcoinBlockSource> {
    relay: R,
    synchronizer: Option<S>,
    block_source: B,
}

/// Everything the supervisor needs to finish an on-chain-proof claim: the
/// Merkle proof, the header it proves against, and any extra transactions
/// the relay synchronizer produced that must land first.
#[derive(Debug, Clone)]
pub struct ProofBatch {
    pub merkle_proof: MerkleProof,
    pub committed_header: CommittedHeader,
    pub extra_transactions: Vec<Vec<u8>>,
}

impl<R: BtcRelay, S: BtcRelaySynchronizer, B: BitcoinBlockSource> ProofBuilder<R, S, B> {
    pub fn new(relay: R, synchronizer: Option<S>, block_source: B) -> Self {
        Self {
            relay,
            synchronizer,
            block_source,
        }
    }

    pub async fn build(&self, tx: &ConfirmedTx, vout: u32, confirmations_required: u16) -> Result<ProofBatch> {
        let min_height = tx.block_height + confirmations_required as u64 - 1;

        if let Some(header) = self.relay.find_header(&tx.blockhash, min_height).await? {
            let merkle_proof = self.build_merkle_proof(tx, vout).await?;
            return Ok(ProofBatch {
                merkle_proof,
                committed_header: header,
                extra_transactions: Vec::new(),
            });
        }

        if let Some(synchronizer) = &self.synchronizer {
            let sync_result = synchronizer.synchronize().await?;
            if let Some(header) = sync_result.computed_headers.get(&tx.block_height).cloned() {
                let merkle_proof = self.build_merkle_proof(tx, vout).await?;
                return Ok(ProofBatch {
                    merkle_proof,
                    committed_header: header,
                    extra_transactions: sync_result.transactions,
                });
            }
        }

        Err(Error::RelayNotSynced)
    }

    async fn build_merkle_proof(&self, tx: &ConfirmedTx, vout: u32) -> Result<MerkleProof> {
        let _ = vout; // the proof covers the whole transaction, not a single output
        let txids = self.block_source.block_txids(&tx.blockhash).await?;
        let index = txids
            .iter()
            .position(|t| *t == tx.txid)
            .ok_or_else(|| Error::Terminal(format!("txid {} not found in its own block", tx.txid)))?;

        let leaves: Vec<[u8; 32]> = txids.iter().map(|t| *t.as_raw_hash().as_byte_array()).collect();
        let merkle = merkle_branch(&leaves, index);

        let mut reversed_txid = *tx.txid.as_raw_hash().as_byte_array();
        reversed_txid.reverse();

        Ok(MerkleProof {
            reversed_txid,
            pos: index as u32,
            merkle,
        })
    }
}

fn sha256d(left: [u8; 32], right: [u8; 32]) -> [u8; 32] {
    use bitcoin::hashes::sha256d;
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left);
    buf[32..].copy_from_slice(&right);
    *sha256d::Hash::hash(&buf).as_byte_array()
}

/// Standard bottom-up Merkle branch: at each layer, record the sibling of
/// the current node, then fold the layer in half (duplicating the last
/// element if the layer has odd length, as Bitcoin's own merkle root
/// algorithm does).
fn merkle_branch(leaves: &[[u8; 32]], index: usize) -> Vec<[u8; 32]> {
    let mut branch = Vec::new();
    let mut idx = index;
    let mut layer = leaves.to_vec();

    while layer.len() > 1 {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        let sibling = *layer.get(sibling_idx).unwrap_or(&layer[idx]);
        branch.push(sibling);

        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        let mut i = 0;
        while i < layer.len() {
            let left = layer[i];
            let right = *layer.get(i + 1).unwrap_or(&left);
            next.push(sha256d(left, right));
            i += 2;
        }
        layer = next;
        idx /= 2;
    }

    branch
}

/// Sends the intermediary's own on-chain Bitcoin payment for the TO_BTC
/// direction and reports on it, the Bitcoin-side mirror of
/// [`crate::lightning::LnPaymentClient`]. `send_to_address` broadcasts; the
/// machine polls `confirmed_tx` until `confirmations_required` is met
/// before handing the result to [`ProofBuilder`].
#[async_trait]
pub trait BtcPaymentClient: Send + Sync {
    async fn send_to_address(&self, address: &str, amount_sats: u64) -> Result<Txid>;
    async fn confirmed_tx(&self, txid: &Txid) -> Result<Option<ConfirmedTx>>;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeBtcPaymentClient {
        confirmed: Mutex<Option<ConfirmedTx>>,
    }

    impl FakeBtcPaymentClient {
        pub fn new(confirmed: Option<ConfirmedTx>) -> Self {
            Self {
                confirmed: Mutex::new(confirmed),
            }
        }

        pub fn set_confirmed(&self, confirmed: ConfirmedTx) {
            *self.confirmed.lock().unwrap() = Some(confirmed);
        }
    }

    #[async_trait]
    impl BtcPaymentClient for FakeBtcPaymentClient {
        async fn send_to_address(&self, _address: &str, _amount_sats: u64) -> Result<Txid> {
            let confirmed = self.confirmed.lock().unwrap();
            Ok(confirmed.as_ref().map(|c| c.txid).unwrap_or_else(|| {
                use bitcoin::hashes::Hash;
                Txid::from_raw_hash(bitcoin::hashes::sha256d::Hash::all_zeros())
            }))
        }

        async fn confirmed_tx(&self, txid: &Txid) -> Result<Option<ConfirmedTx>> {
            let confirmed = self.confirmed.lock().unwrap();
            Ok(confirmed.clone().filter(|c| c.txid == *txid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_branch_of_single_leaf_is_empty() {
        let leaf = [7u8; 32];
        assert!(merkle_branch(&[leaf], 0).is_empty());
    }

    #[test]
    fn merkle_branch_of_two_leaves_has_one_sibling() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let branch = merkle_branch(&[a, b], 0);
        assert_eq!(branch, vec![b]);
        let branch = merkle_branch(&[a, b], 1);
        assert_eq!(branch, vec![a]);
    }

    #[test]
    fn odd_leaf_count_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        // layer 0: [a, b, c, c(dup)] -> branch[0] for index 2 is its duplicate sibling c
        let branch = merkle_branch(&[a, b, c], 2);
        assert_eq!(branch[0], c);
    }
}

//! TO_BTC (§4.G "Other machines"): the user commits a smart-chain escrow,
//! the intermediary pays a Bitcoin on-chain address, then claims the escrow
//! once its own payment is confirmed, using the §4.E proof path.

use crate::btc_proof::{BtcPaymentClient, ProofBuilder, BtcRelay, BtcRelaySynchronizer, BitcoinBlockSource};
use crate::error::{Error, Result};
use crate::escrow::scratch::{ScratchAccountInfo, ScratchTable};
use crate::escrow::{ActionSubmitter, ChainAdapter, FeeRate};
use crate::state_machines::{Clock, LeaseRegistry};
use crate::store::SwapStore;
use crate::types::{
    Artifacts, ChainId, ChainKind, EscrowTerms, Metadata, SwapKey, SwapRecord, SwapState, ToBtcState,
    CURRENT_SCHEMA_VERSION,
};
use bitcoin::hashes::Hash;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;

pub const PAY_LEASE_SECS: u64 = 30;

pub struct ToBtcMachine<B, R, Y, K, C, S>
where
    B: BtcPaymentClient,
    R: BtcRelay,
    Y: BtcRelaySynchronizer,
    K: BitcoinBlockSource,
    C: ChainAdapter,
    S: ActionSubmitter,
{
    store: Arc<SwapStore>,
    btc: Arc<B>,
    proofs: Arc<ProofBuilder<R, Y, K>>,
    scratch: Arc<ScratchTable>,
    chain: Arc<C>,
    submitter: Arc<S>,
    leases: Arc<LeaseRegistry>,
    clock: Arc<dyn Clock>,
    signer: Pubkey,
}

impl<B, R, Y, K, C, S> ToBtcMachine<B, R, Y, K, C, S>
where
    B: BtcPaymentClient,
    R: BtcRelay,
    Y: BtcRelaySynchronizer,
    K: BitcoinBlockSource,
    C: ChainAdapter,
    S: ActionSubmitter,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SwapStore>,
        btc: Arc<B>,
        proofs: Arc<ProofBuilder<R, Y, K>>,
        scratch: Arc<ScratchTable>,
        chain: Arc<C>,
        submitter: Arc<S>,
        leases: Arc<LeaseRegistry>,
        clock: Arc<dyn Clock>,
        signer: Pubkey,
    ) -> Self {
        Self {
            store,
            btc,
            proofs,
            scratch,
            chain,
            submitter,
            leases,
            clock,
            signer,
        }
    }

    /// Records the quote against the user-supplied Bitcoin destination
    /// address.
    pub async fn create(
        &self,
        chain_id: ChainId,
        chain_kind: ChainKind,
        terms: EscrowTerms,
        destination_address: String,
    ) -> Result<SwapRecord> {
        let mut metadata = Metadata::default();
        metadata.mark("requestReceived", self.clock.now_unix());

        let record = SwapRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            key: SwapKey::new(terms.payment_hash, terms.sequence).into(),
            chain_id,
            chain_kind,
            state: SwapState::ToBtc(ToBtcState::Created),
            terms,
            artifacts: Artifacts {
                counterparty_destination: Some(destination_address),
                ..Default::default()
            },
            metadata,
        };
        self.store.save(&record).await?;
        Ok(record)
    }

    /// CREATED → COMMITED: the watcher observed the user's Initialize event.
    pub async fn on_escrow_observed(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, ToBtcState::Created).await?;
        record.state = SwapState::ToBtc(ToBtcState::Commited);
        record.metadata.mark("escrowObserved", self.clock.now_unix());
        self.store.save(&record).await?;
        Ok(record)
    }

    /// COMMITED → PAYING: broadcasts the on-chain Bitcoin payment.
    pub async fn pay(&self, key: SwapKey) -> Result<SwapRecord> {
        let now = self.clock.now_unix();
        let lease = self.leases.try_acquire(key, now, PAY_LEASE_SECS)?;

        let mut record = match self.load_in_state(key, ToBtcState::Commited).await {
            Ok(r) => r,
            Err(e) => {
                lease.release();
                return Err(e);
            }
        };

        let destination = record
            .artifacts
            .counterparty_destination
            .clone()
            .ok_or_else(|| Error::Terminal("missing destination address".to_string()))?;
        let amount_sats = record.terms.amount as u64;

        let result = match self.btc.send_to_address(&destination, amount_sats).await {
            Ok(txid) => {
                record.state = SwapState::ToBtc(ToBtcState::Paying);
                record.artifacts.tx_ids.insert("btc".to_string(), txid.to_string());
                self.store.save(&record).await?;
                Ok(record)
            }
            Err(e) => Err(e),
        };
        lease.release();
        result
    }

    /// PAYING → PAID once the outbound Bitcoin payment has
    /// `confirmations_required` confirmations.
    pub async fn on_btc_confirmed(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, ToBtcState::Paying).await?;
        let txid_str = record
            .artifacts
            .tx_ids
            .get("btc")
            .cloned()
            .ok_or_else(|| Error::Terminal("missing btc tx id".to_string()))?;
        let txid: bitcoin::Txid = txid_str
            .parse()
            .map_err(|e| Error::Terminal(format!("corrupt stored txid {txid_str}: {e}")))?;

        let Some(confirmed) = self.btc.confirmed_tx(&txid).await? else {
            return Ok(record);
        };
        if (confirmed.confirmations as u16) < record.terms.confirmations_required {
            return Ok(record);
        }

        record.state = SwapState::ToBtc(ToBtcState::Paid);
        self.store.save(&record).await?;
        Ok(record)
    }

    /// PAID → CLAIMED: builds the Merkle proof for the node's own payment,
    /// writes it to a scratch account, and claims the escrow.
    pub async fn claim(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, ToBtcState::Paid).await?;
        let txid_str = record
            .artifacts
            .tx_ids
            .get("btc")
            .cloned()
            .ok_or_else(|| Error::Terminal("missing btc tx id".to_string()))?;
        let txid: bitcoin::Txid = txid_str
            .parse()
            .map_err(|e| Error::Terminal(format!("corrupt stored txid {txid_str}: {e}")))?;
        let confirmed = self
            .btc
            .confirmed_tx(&txid)
            .await?
            .ok_or_else(|| Error::Terminal(format!("payment {txid} no longer confirmed")))?;

        let fee_rate = FeeRate {
            micro_lamports_per_cu: 0,
            needs_wrapped_native_ata_init: false,
            wrapped_native_ata_balance: None,
        };

        let batch = self
            .proofs
            .build(&confirmed, 0, record.terms.confirmations_required)
            .await?;
        let scratch_account = self
            .chain
            .tx_data_account(&batch.merkle_proof.reversed_txid, &self.signer);

        self.scratch
            .record(
                scratch_account,
                ScratchAccountInfo {
                    reversed_txid: batch.merkle_proof.reversed_txid,
                    signer: self.signer.to_string(),
                    created_at_unix: self.clock.now_unix(),
                },
            )
            .await?;
        let write_action = self
            .chain
            .write_tx_data(&scratch_account, &self.signer, &batch, fee_rate)
            .await?;
        self.submitter.submit(&write_action).await?;

        let secret = *confirmed.txid.as_raw_hash().as_byte_array();
        let claim_action = self.chain.claim(&record.terms, secret, fee_rate).await?;
        let submission = self.submitter.submit(&claim_action).await?;

        record.state = SwapState::ToBtc(ToBtcState::Claimed);
        record.artifacts.tx_ids.insert("claim".to_string(), submission.tx_id);
        self.store.save(&record).await?;
        self.store.remove(key).await?;

        let close_action = self.chain.close_data_account(&scratch_account, &self.signer, fee_rate).await?;
        self.submitter.submit(&close_action).await?;
        self.scratch.forget(&scratch_account).await?;

        Ok(record)
    }

    /// Refunds a COMMITED, PAYING, or PAID record whose Bitcoin leg stalled
    /// past the escrow's expiry.
    pub async fn refund(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        if !matches!(
            record.state,
            SwapState::ToBtc(ToBtcState::Commited) | SwapState::ToBtc(ToBtcState::Paying) | SwapState::ToBtc(ToBtcState::Paid)
        ) {
            return Err(Error::Validation(format!(
                "cannot refund to_btc record in state {:?}",
                record.state
            )));
        }

        let fee_rate = FeeRate {
            micro_lamports_per_cu: 0,
            needs_wrapped_native_ata_init: false,
            wrapped_native_ata_balance: None,
        };
        let action = self.chain.refund(&record.terms, record.terms.expiry, None, fee_rate).await?;
        let submission = self.submitter.submit(&action).await?;

        record.state = SwapState::ToBtc(ToBtcState::Refunded);
        record.artifacts.tx_ids.insert("refund".to_string(), submission.tx_id);
        self.store.save(&record).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// Only legal from CREATED.
    pub async fn cancel(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, ToBtcState::Created).await?;
        record.state = SwapState::ToBtc(ToBtcState::Canceled);
        self.store.save(&record).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    async fn load_in_state(&self, key: SwapKey, expected: ToBtcState) -> Result<SwapRecord> {
        let record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        if record.state != SwapState::ToBtc(expected) {
            return Err(Error::Validation(format!(
                "expected state {:?}, found {:?}",
                expected, record.state
            )));
        }
        Ok(record)
    }
}

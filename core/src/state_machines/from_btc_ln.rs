//! FROM_BTC_LN (§4.G "Other machines", non-trusted variant): the user sends
//! Lightning BTC, the intermediary opens an HTLC-kind smart-chain escrow for
//! the counterparty to claim directly. Unlike FROM_BTC_LN_TRUSTED, the
//! intermediary never reveals the secret itself — it watches for the
//! counterparty's own Claim event, which reveals the secret on chain, and
//! only then settles its own hold invoice with it (§3 Invariant 3).

use crate::error::{Error, Result};
use crate::escrow::{ActionSubmitter, ChainAdapter, FeeRate, SwapData, SwapType};
use crate::lightning::LnAdapter;
use crate::state_machines::{Clock, LeaseRegistry};
use crate::store::SwapStore;
use crate::types::{
    Artifacts, ChainId, ChainKind, EscrowTerms, FromBtcState, Metadata, SwapKey, SwapRecord, SwapState,
    CURRENT_SCHEMA_VERSION,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const COMMIT_LEASE_SECS: u64 = 30;

pub struct FromBtcLnMachine<L: LnAdapter, C: ChainAdapter, S: ActionSubmitter> {
    store: Arc<SwapStore>,
    ln: Arc<L>,
    chain: Arc<C>,
    submitter: Arc<S>,
    leases: Arc<LeaseRegistry>,
    clock: Arc<dyn Clock>,
}

impl<L: LnAdapter, C: ChainAdapter, S: ActionSubmitter> FromBtcLnMachine<L, C, S> {
    pub fn new(
        store: Arc<SwapStore>,
        ln: Arc<L>,
        chain: Arc<C>,
        submitter: Arc<S>,
        leases: Arc<LeaseRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ln,
            chain,
            submitter,
            leases,
            clock,
        }
    }

    pub async fn create(
        &self,
        chain_id: ChainId,
        chain_kind: ChainKind,
        mut terms: EscrowTerms,
        invoice: String,
    ) -> Result<SwapRecord> {
        terms.kind = crate::types::SwapKind::Htlc;
        let mut metadata = Metadata::default();
        metadata.mark("requestReceived", self.clock.now_unix());
        metadata.mark("invoiceCreated", self.clock.now_unix());

        let record = SwapRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            key: SwapKey::new(terms.payment_hash, terms.sequence).into(),
            chain_id,
            chain_kind,
            state: SwapState::FromBtcLn(FromBtcState::Created),
            terms,
            artifacts: Artifacts {
                invoice: Some(invoice),
                ..Default::default()
            },
            metadata,
        };
        self.store.save(&record).await?;
        Ok(record)
    }

    /// CREATED → RECEIVED on the hold invoice's first `is_held = true`.
    pub async fn on_htlc_received(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcState::Created).await?;
        record.state = SwapState::FromBtcLn(FromBtcState::Received);
        record.metadata.mark("htlcReceived", self.clock.now_unix());
        self.store.save(&record).await?;
        Ok(record)
    }

    /// RECEIVED → COMMITED: opens the HTLC escrow under a 30-second lease,
    /// the same re-check discipline as FROM_BTC_LN_TRUSTED's RECEIVED → SENT
    /// step (§5).
    pub async fn commit(&self, key: SwapKey, txo_hash: [u8; 32], auth_expiry: u64) -> Result<SwapRecord> {
        let now = self.clock.now_unix();
        let lease = self.leases.try_acquire(key, now, COMMIT_LEASE_SECS)?;

        let record = match self.load_in_state(key, FromBtcState::Received).await {
            Ok(r) => r,
            Err(e) => {
                lease.release();
                return Err(e);
            }
        };

        let fee_rate = FeeRate {
            micro_lamports_per_cu: 0,
            needs_wrapped_native_ata_init: false,
            wrapped_native_ata_balance: None,
        };
        let swap_data = SwapData {
            kind: SwapType::Htlc,
            confirmations: record.terms.confirmations_required,
            nonce: record.terms.escrow_nonce,
            hash: record.terms.payment_hash,
            pay_in: record.terms.pay_in,
            pay_out: record.terms.pay_out,
            amount: record.terms.amount as u64,
            expiry: record.terms.expiry,
            sequence: record.terms.sequence,
        };
        let action = if record.terms.pay_in {
            self.chain
                .offerer_initialize_pay_in(&record.terms, swap_data, txo_hash, auth_expiry, fee_rate)
                .await
        } else {
            self.chain
                .offerer_initialize(
                    &record.terms,
                    swap_data,
                    record.terms.security_deposit as u64,
                    record.terms.claimer_bounty as u64,
                    txo_hash,
                    auth_expiry,
                    fee_rate,
                )
                .await
        };

        let mut record = record;
        let result = match action {
            Ok(action) => match self.submitter.submit(&action).await {
                Ok(submission) => {
                    record.state = SwapState::FromBtcLn(FromBtcState::Commited);
                    record.artifacts.tx_ids.insert("init".to_string(), submission.tx_id);
                    self.store.save(&record).await?;
                    Ok(record)
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        lease.release();
        result
    }

    /// COMMITED → CLAIMED: the watcher observed the counterparty's Claim
    /// event, which carries the `secret` that unlocked the escrow. Verifies
    /// the secret actually hashes to this swap's `payment_hash` before
    /// trusting it, then settles the held Lightning invoice.
    pub async fn on_claim_observed(&self, key: SwapKey, secret: [u8; 32]) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcState::Commited).await?;
        let derived: [u8; 32] = Sha256::digest(secret).into();
        if derived != key.payment_hash {
            return Err(Error::SwapDataVerification {
                payment_hash: hex::encode(key.payment_hash),
                reason: "claimed secret does not hash to payment_hash".to_string(),
            });
        }

        self.ln.settle_hold_invoice(secret).await?;
        record.state = SwapState::FromBtcLn(FromBtcState::Claimed);
        record.artifacts.secret = Some(secret);
        record.metadata.mark("claimed", self.clock.now_unix());
        self.store.save(&record).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// COMMITED → REFUNDED: the watcher observed a Refund event (the
    /// counterparty never claimed before expiry); cancel the now-moot hold
    /// invoice.
    pub async fn on_refund_observed(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcState::Commited).await?;
        record.state = SwapState::FromBtcLn(FromBtcState::Refunded);
        self.store.save(&record).await?;
        self.ln.cancel_hold_invoice(key.payment_hash).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// Only legal from {CREATED, RECEIVED} (§3 Invariant 4).
    pub async fn cancel_swap_and_invoice(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        if !matches!(record.state, SwapState::FromBtcLn(FromBtcState::Created) | SwapState::FromBtcLn(FromBtcState::Received)) {
            return Err(Error::Validation(format!(
                "cannot cancel from_btc_ln record in state {:?}",
                record.state
            )));
        }
        record.state = SwapState::FromBtcLn(FromBtcState::Canceled);
        self.store.save(&record).await?;
        self.ln.cancel_hold_invoice(key.payment_hash).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    async fn load_in_state(&self, key: SwapKey, expected: FromBtcState) -> Result<SwapRecord> {
        let record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        if record.state != SwapState::FromBtcLn(expected) {
            return Err(Error::Validation(format!(
                "expected state {:?}, found {:?}",
                expected, record.state
            )));
        }
        Ok(record)
    }
}

//! TO_BTC_LN (§4.G "Other machines"): the user commits a smart-chain escrow,
//! the intermediary pays the user-supplied Lightning invoice, then claims
//! the escrow with the payment's preimage.

use crate::error::{Error, Result};
use crate::escrow::{ActionSubmitter, ChainAdapter, FeeRate};
use crate::lightning::{LnPaymentClient, LnPaymentStatus};
use crate::state_machines::{Clock, LeaseRegistry};
use crate::store::SwapStore;
use crate::types::{
    Artifacts, ChainId, ChainKind, EscrowTerms, Metadata, SwapKey, SwapRecord, SwapState, ToBtcState,
    CURRENT_SCHEMA_VERSION,
};
use std::sync::Arc;

pub const PAY_LEASE_SECS: u64 = 30;

pub struct ToBtcLnMachine<L: LnPaymentClient, C: ChainAdapter, S: ActionSubmitter> {
    store: Arc<SwapStore>,
    ln: Arc<L>,
    chain: Arc<C>,
    submitter: Arc<S>,
    leases: Arc<LeaseRegistry>,
    clock: Arc<dyn Clock>,
}

impl<L: LnPaymentClient, C: ChainAdapter, S: ActionSubmitter> ToBtcLnMachine<L, C, S> {
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

    /// Records the quote against the counterparty-supplied BOLT-11 invoice
    /// (its decoded payment hash is expected to already be `terms.payment_hash`
    /// — the invoice pre-check the pipeline runs before commit, §4.H step 5).
    pub async fn create(
        &self,
        chain_id: ChainId,
        chain_kind: ChainKind,
        terms: EscrowTerms,
        destination_invoice: String,
    ) -> Result<SwapRecord> {
        let mut metadata = Metadata::default();
        metadata.mark("requestReceived", self.clock.now_unix());

        let record = SwapRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            key: SwapKey::new(terms.payment_hash, terms.sequence).into(),
            chain_id,
            chain_kind,
            state: SwapState::ToBtcLn(ToBtcState::Created),
            terms,
            artifacts: Artifacts {
                invoice: Some(destination_invoice),
                ..Default::default()
            },
            metadata,
        };
        self.store.save(&record).await?;
        Ok(record)
    }

    /// CREATED → COMMITED: the watcher observed the user's own Initialize
    /// event for this `(payment_hash, sequence)`.
    pub async fn on_escrow_observed(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, ToBtcState::Created).await?;
        record.state = SwapState::ToBtcLn(ToBtcState::Commited);
        record.metadata.mark("escrowObserved", self.clock.now_unix());
        self.store.save(&record).await?;
        Ok(record)
    }

    /// COMMITED → PAYING: acquire the 30-second lease, initiate the outbound
    /// Lightning payment (§5 re-check discipline: bail without mutating if
    /// another task already moved the record).
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

        let invoice = record
            .artifacts
            .invoice
            .clone()
            .ok_or_else(|| Error::Terminal("missing destination invoice".to_string()))?;

        let result = match self.ln.pay_invoice(&invoice).await {
            Ok(payment) => {
                record.state = SwapState::ToBtcLn(ToBtcState::Paying);
                record.artifacts.tx_ids.insert("ln_payment".to_string(), payment.tracking_id);
                self.store.save(&record).await?;
                Ok(record)
            }
            Err(e) => Err(e),
        };
        lease.release();
        result
    }

    /// PAYING → {PAID on success, stay on in-flight}. A failed payment does
    /// not refund immediately (§4.G: "REFUNDED (LN failed, wait for expiry,
    /// refund)") — it is left in PAYING for [`Self::process_past_swap`] to
    /// refund once `terms.expiry` has actually passed, the same
    /// `CommitStatus`-gated reconciliation the on-chain directions use.
    pub async fn on_payment_status(&self, key: SwapKey) -> Result<SwapRecord> {
        let record = self.load_in_state(key, ToBtcState::Paying).await?;
        let tracking_id = record
            .artifacts
            .tx_ids
            .get("ln_payment")
            .cloned()
            .ok_or_else(|| Error::Terminal("missing ln_payment tracking id".to_string()))?;
        let payment = self.ln.payment_status(&tracking_id).await?;

        match payment.status {
            LnPaymentStatus::InFlight | LnPaymentStatus::Failed => Ok(record),
            LnPaymentStatus::Succeeded => {
                let mut record = record;
                let preimage = payment
                    .preimage
                    .ok_or_else(|| Error::Terminal("succeeded payment carries no preimage".to_string()))?;
                record.state = SwapState::ToBtcLn(ToBtcState::Paid);
                record.artifacts.secret = Some(preimage);
                self.store.save(&record).await?;
                Ok(record)
            }
        }
    }

    /// Startup / periodic reconciliation: refunds a PAYING record once its
    /// expiry has passed, whether the Lightning leg failed outright or
    /// merely never resolved. Mirrors [`crate::state_machines::from_btc::FromBtcMachine::process_past_swap`]'s
    /// expiry gate rather than `to_btc_ln`'s own chain-status read, since the
    /// blocking leg here is the Lightning payment, not the escrow.
    pub async fn process_past_swap(&self, key: SwapKey, now_unix: u64) -> Result<()> {
        let record = match self.store.load(key).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        if record.state.is_terminal() {
            return Ok(());
        }
        if record.state != SwapState::ToBtcLn(ToBtcState::Paying) {
            return Ok(());
        }
        let is_expired = !record.terms.expiry_is_height() && now_unix >= record.terms.expiry;
        if is_expired {
            self.refund(key).await?;
        }
        Ok(())
    }

    /// PAID → CLAIMED: claims the smart-chain escrow with the payment
    /// preimage.
    pub async fn claim(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, ToBtcState::Paid).await?;
        let preimage = record
            .artifacts
            .secret
            .ok_or_else(|| Error::Terminal("no preimage recorded to claim with".to_string()))?;
        let fee_rate = FeeRate {
            micro_lamports_per_cu: 0,
            needs_wrapped_native_ata_init: false,
            wrapped_native_ata_balance: None,
        };
        let action = self.chain.claim(&record.terms, preimage, fee_rate).await?;
        let submission = self.submitter.submit(&action).await?;

        record.state = SwapState::ToBtcLn(ToBtcState::Claimed);
        record.artifacts.tx_ids.insert("claim".to_string(), submission.tx_id);
        self.store.save(&record).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// Refunds a COMMITED or PAYING record whose Lightning leg failed or
    /// stalled past the escrow's expiry.
    pub async fn refund(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        if !matches!(record.state, SwapState::ToBtcLn(ToBtcState::Commited) | SwapState::ToBtcLn(ToBtcState::Paying)) {
            return Err(Error::Validation(format!(
                "cannot refund to_btc_ln record in state {:?}",
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

        record.state = SwapState::ToBtcLn(ToBtcState::Refunded);
        record.artifacts.tx_ids.insert("refund".to_string(), submission.tx_id);
        self.store.save(&record).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// Only legal from CREATED (§3 Invariant 4 — for this direction the
    /// pre-commit stage is CREATED alone; COMMITED already has the user's
    /// funds locked).
    pub async fn cancel(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, ToBtcState::Created).await?;
        record.state = SwapState::ToBtcLn(ToBtcState::Canceled);
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
        if record.state != SwapState::ToBtcLn(expected) {
            return Err(Error::Validation(format!(
                "expected state {:?}, found {:?}",
                expected, record.state
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::TxStatus;
    use crate::lightning::fake::FakeLnPaymentClient;
    use crate::state_machines::test_support::{FakeActionSubmitter, FakeChainAdapter};
    use crate::state_machines::FakeClock;
    use crate::types::SwapKind;
    use std::sync::atomic::AtomicU64;

    fn terms() -> EscrowTerms {
        EscrowTerms {
            offerer_address: "offerer".to_string(),
            claimer_address: "claimer".to_string(),
            token_address: "token".to_string(),
            amount: 100_000,
            payment_hash: [8; 32],
            sequence: 0,
            expiry: 2_000_000_000,
            confirmations_required: 1,
            escrow_nonce: 0,
            pay_in: true,
            pay_out: true,
            kind: SwapKind::Htlc,
            security_deposit: 0,
            claimer_bounty: 0,
            txo_hash: None,
        }
    }

    async fn setup(
        ln_outcome: LnPaymentStatus,
    ) -> ToBtcLnMachine<FakeLnPaymentClient, FakeChainAdapter, FakeActionSubmitter> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SwapStore::new(dir.path()));
        store.init().await.unwrap();
        std::mem::forget(dir);
        let ln = Arc::new(FakeLnPaymentClient::new(ln_outcome, [9u8; 32]));
        let chain = Arc::new(FakeChainAdapter::new());
        let submitter = Arc::new(FakeActionSubmitter::new(TxStatus::Success));
        let leases = Arc::new(LeaseRegistry::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock(AtomicU64::new(1_000)));
        ToBtcLnMachine::new(store, ln, chain, submitter, leases, clock)
    }

    #[tokio::test]
    async fn happy_path_reaches_claimed() {
        let machine = setup(LnPaymentStatus::Succeeded).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc_destination".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        machine.on_escrow_observed(key).await.unwrap();
        let record = machine.pay(key).await.unwrap();
        assert_eq!(record.state, SwapState::ToBtcLn(ToBtcState::Paying));

        let record = machine.on_payment_status(key).await.unwrap();
        assert_eq!(record.state, SwapState::ToBtcLn(ToBtcState::Paid));

        let record = machine.claim(key).await.unwrap();
        assert_eq!(record.state, SwapState::ToBtcLn(ToBtcState::Claimed));
        assert!(machine.store.load(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_payment_before_expiry_does_not_refund() {
        let machine = setup(LnPaymentStatus::Failed).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc_destination".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        machine.on_escrow_observed(key).await.unwrap();
        machine.pay(key).await.unwrap();
        let record = machine.on_payment_status(key).await.unwrap();
        assert_eq!(record.state, SwapState::ToBtcLn(ToBtcState::Paying), "must wait for expiry before refunding");

        machine.process_past_swap(key, 1_000).await.unwrap();
        assert_eq!(
            machine.store.load(key).await.unwrap().unwrap().state,
            SwapState::ToBtcLn(ToBtcState::Paying),
            "process_past_swap before expiry must not refund either"
        );
    }

    #[tokio::test]
    async fn failed_payment_past_expiry_refunds_on_reconciliation() {
        let machine = setup(LnPaymentStatus::Failed).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc_destination".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        machine.on_escrow_observed(key).await.unwrap();
        machine.pay(key).await.unwrap();
        machine.on_payment_status(key).await.unwrap();

        machine.process_past_swap(key, terms().expiry + 1).await.unwrap();
        assert!(machine.store.load(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_rejected_once_committed() {
        let machine = setup(LnPaymentStatus::Succeeded).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc_destination".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();
        machine.on_escrow_observed(key).await.unwrap();

        assert!(machine.cancel(key).await.is_err());
    }
}

//! TO_BTC_LN_TRUSTED (§4.G "Other machines" skeleton, mirrored from
//! FROM_BTC_LN_TRUSTED): the user sends a trusted smart-chain native-token
//! transfer directly to the intermediary (no escrow PDA — the deposit is the
//! commitment), the intermediary pays a Lightning invoice the user supplied.
//!
//! States and transitions reuse [`FromBtcLnTrustedState`]'s codes with the
//! legs swapped: RECEIVED is the native deposit landing instead of the HTLC,
//! SENT is the outbound LN payment instead of the outbound transfer.

use crate::error::{Error, Result};
use crate::escrow::NativeTransferClient;
use crate::lightning::{LnPayment, LnPaymentClient, LnPaymentStatus};
use crate::state_machines::{Clock, LeaseRegistry};
use crate::store::SwapStore;
use crate::types::{
    Artifacts, ChainId, ChainKind, EscrowTerms, FromBtcLnTrustedState, Metadata, SwapKey, SwapKind, SwapRecord,
    SwapState, CURRENT_SCHEMA_VERSION,
};
use std::sync::Arc;

/// How long a record may sit in RECEIVED under an exclusive lease before
/// another path may attempt the `pay` transition (§5).
pub const PAY_LEASE_SECS: u64 = 30;

pub struct ToBtcLnTrustedMachine<L: LnPaymentClient, T: NativeTransferClient> {
    store: Arc<SwapStore>,
    ln: Arc<L>,
    transfer: Arc<T>,
    leases: Arc<LeaseRegistry>,
    clock: Arc<dyn Clock>,
}

impl<L: LnPaymentClient, T: NativeTransferClient> ToBtcLnTrustedMachine<L, T> {
    pub fn new(
        store: Arc<SwapStore>,
        ln: Arc<L>,
        transfer: Arc<T>,
        leases: Arc<LeaseRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ln,
            transfer,
            leases,
            clock,
        }
    }

    /// Pre-commit phase: persist a CREATED record awaiting the user's
    /// on-chain deposit. `destination_invoice` is the BOLT-11 this machine
    /// will pay once the deposit lands; `refund_address` is where a failed
    /// LN payment sends the deposit back to.
    pub async fn create(
        &self,
        chain_id: ChainId,
        chain_kind: ChainKind,
        terms: EscrowTerms,
        destination_invoice: String,
        refund_address: String,
    ) -> Result<SwapRecord> {
        let mut record_terms = terms;
        record_terms.kind = SwapKind::Htlc;

        let mut metadata = Metadata::default();
        metadata.mark("requestReceived", self.clock.now_unix());

        let record = SwapRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            key: SwapKey::new(record_terms.payment_hash, record_terms.sequence).into(),
            chain_id,
            chain_kind,
            state: SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Created),
            terms: record_terms,
            artifacts: Artifacts {
                invoice: Some(destination_invoice),
                counterparty_destination: Some(refund_address),
                ..Default::default()
            },
            metadata,
        };
        self.store.save(&record).await?;
        Ok(record)
    }

    /// CREATED → RECEIVED: the caller observed the user's trusted deposit
    /// land with sufficient confirmations (out of scope here — §1: the
    /// deposit watcher is a collaborator the supervisor owns).
    pub async fn on_deposit_confirmed(&self, key: SwapKey, tx_id: String) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcLnTrustedState::Created).await?;
        record.state = SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Received);
        record.artifacts.tx_ids.insert("deposit".to_string(), tx_id);
        record.metadata.mark("depositConfirmed", self.clock.now_unix());
        self.store.save(&record).await?;
        Ok(record)
    }

    /// RECEIVED → SENT: acquire the 30s lease, pay the invoice, persist
    /// before releasing (§5 re-check-after-suspension).
    pub async fn pay(&self, key: SwapKey) -> Result<SwapRecord> {
        let now = self.clock.now_unix();
        let lease = self.leases.try_acquire(key, now, PAY_LEASE_SECS)?;

        let record = self.load_in_state(key, FromBtcLnTrustedState::Received).await;
        let mut record = match record {
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

        let payment = self.ln.pay_invoice(&invoice).await;

        let still_received = self
            .store
            .load(key)
            .await?
            .map(|r| r.state == SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Received))
            .unwrap_or(false);
        if !still_received {
            lease.release();
            return self
                .store
                .load(key)
                .await?
                .ok_or_else(|| Error::SwapNotFound(key.to_string()));
        }

        let result = match payment {
            Ok(payment) => {
                record.state = SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Sent);
                record.artifacts.tx_ids.insert("ln_payment".to_string(), payment.tracking_id);
                self.store.save(&record).await?;
                Ok(record)
            }
            Err(e) => Err(e),
        };
        lease.release();
        result
    }

    /// SENT → {CONFIRMED on success, REFUNDED on failure}; no-op while
    /// in flight (§4.G signal mirrored from TO_BTC_LN's `on_payment_status`).
    pub async fn on_payment_status(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcLnTrustedState::Sent).await?;
        let tracking_id = record
            .artifacts
            .tx_ids
            .get("ln_payment")
            .cloned()
            .ok_or_else(|| Error::Terminal("missing ln_payment tracking id".to_string()))?;

        let payment: LnPayment = self.ln.payment_status(&tracking_id).await?;
        match payment.status {
            LnPaymentStatus::InFlight => Ok(record),
            LnPaymentStatus::Succeeded => {
                record.state = SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Confirmed);
                record.metadata.mark("lnPaymentConfirmed", self.clock.now_unix());
                self.store.save(&record).await?;
                self.settle(record).await
            }
            LnPaymentStatus::Failed => self.refund(key).await,
        }
    }

    /// CONFIRMED → SETTLED: terminal, nothing further to hand off since the
    /// deposit already belongs to the intermediary.
    async fn settle(&self, mut record: SwapRecord) -> Result<SwapRecord> {
        record.state = SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Settled);
        record.metadata.mark("settled", self.clock.now_unix());
        self.store.save(&record).await?;
        self.store.remove(record.key()).await?;
        Ok(record)
    }

    /// Legal from RECEIVED (deposit landed but payment never attempted) or
    /// SENT (the LN payment failed): sends the deposit back to the address
    /// the request supplied.
    pub async fn refund(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        let legal = matches!(
            record.state,
            SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Received)
                | SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Sent)
        );
        if !legal {
            return Err(Error::Validation(format!("refund illegal from state {:?}", record.state)));
        }

        let refund_address = record
            .artifacts
            .counterparty_destination
            .clone()
            .ok_or_else(|| Error::Terminal("missing refund address".to_string()))?;
        let submission = self
            .transfer
            .submit_transfer(&refund_address, record.terms.amount, crate::escrow::FeeRate {
                micro_lamports_per_cu: 0,
                needs_wrapped_native_ata_init: false,
                wrapped_native_ata_balance: None,
            })
            .await?;

        record.state = SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Refunded);
        record.artifacts.tx_ids.insert("refund".to_string(), submission.tx_id);
        self.store.save(&record).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// Only legal from CREATED, before any deposit has landed (§4.G
    /// "Cancellation").
    pub async fn cancel(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcLnTrustedState::Created).await?;
        record.state = SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Canceled);
        self.store.save(&record).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// Startup / periodic reconciliation: re-polls the LN payment for any
    /// record stuck in SENT (§4.G "Past-swap reconciliation").
    pub async fn process_past_swap(&self, key: SwapKey) -> Result<()> {
        let record = match self.store.load(key).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        if record.state.is_terminal() {
            return Ok(());
        }
        if record.state == SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Sent) {
            self.on_payment_status(key).await?;
        }
        Ok(())
    }

    async fn load_in_state(&self, key: SwapKey, expected: FromBtcLnTrustedState) -> Result<SwapRecord> {
        let record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        if record.state != SwapState::ToBtcLnTrusted(expected) {
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
    use crate::escrow::TxSubmission;
    use crate::lightning::fake::FakeLnPaymentClient;
    use crate::state_machines::FakeClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct FakeTransfer;

    #[async_trait]
    impl NativeTransferClient for FakeTransfer {
        async fn submit_transfer(
            &self,
            _to: &str,
            _amount: u128,
            _fee_rate: crate::escrow::FeeRate,
        ) -> Result<TxSubmission> {
            Ok(TxSubmission {
                tx_id: "refund-tx".to_string(),
                raw_tx: vec![9],
            })
        }

        async fn tx_status(&self, _tx_id: &str) -> Result<crate::escrow::TxStatus> {
            Ok(crate::escrow::TxStatus::Success)
        }
    }

    fn terms() -> EscrowTerms {
        EscrowTerms {
            offerer_address: "offerer".to_string(),
            claimer_address: "claimer".to_string(),
            token_address: "token".to_string(),
            amount: 100_000,
            payment_hash: [4; 32],
            sequence: 0,
            expiry: 2_000_000_000,
            confirmations_required: 1,
            escrow_nonce: 0,
            pay_in: true,
            pay_out: false,
            kind: SwapKind::Htlc,
            security_deposit: 0,
            claimer_bounty: 0,
            txo_hash: None,
        }
    }

    async fn setup(
        outcome: LnPaymentStatus,
    ) -> ToBtcLnTrustedMachine<FakeLnPaymentClient, FakeTransfer> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SwapStore::new(dir.path()));
        store.init().await.unwrap();
        std::mem::forget(dir);

        ToBtcLnTrustedMachine::new(
            store,
            Arc::new(FakeLnPaymentClient::new(outcome, [5; 32])),
            Arc::new(FakeTransfer),
            Arc::new(LeaseRegistry::new()),
            Arc::new(FakeClock(AtomicU64::new(1_000))),
        )
    }

    #[tokio::test]
    async fn happy_path_reaches_settled_and_removes_record() {
        let machine = setup(LnPaymentStatus::Succeeded).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc1...".to_string(),
                "refund-address".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        machine.on_deposit_confirmed(key, "deposit-tx".to_string()).await.unwrap();
        let record = machine.pay(key).await.unwrap();
        assert_eq!(record.state, SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Sent));

        let record = machine.on_payment_status(key).await.unwrap();
        assert_eq!(record.state, SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Settled));
        assert!(machine.store.load(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_payment_refunds_the_deposit() {
        let machine = setup(LnPaymentStatus::Failed).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc1...".to_string(),
                "refund-address".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        machine.on_deposit_confirmed(key, "deposit-tx".to_string()).await.unwrap();
        machine.pay(key).await.unwrap();

        let record = machine.on_payment_status(key).await.unwrap();
        assert_eq!(record.state, SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Refunded));
        assert!(machine.store.load(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_rejected_once_deposit_received() {
        let machine = setup(LnPaymentStatus::InFlight).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc1...".to_string(),
                "refund-address".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        machine.on_deposit_confirmed(key, "deposit-tx".to_string()).await.unwrap();
        assert!(machine.cancel(key).await.is_err());
    }

    /// §8 property 7: a fresh machine instance over the same on-disk store
    /// (standing in for a process restart) finishes an outbound payment
    /// left in SENT by a prior instance.
    #[tokio::test]
    async fn process_past_swap_recovers_a_sent_record_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SwapStore::new(dir.path()));
        store.init().await.unwrap();
        let transfer = Arc::new(FakeTransfer);
        let leases = Arc::new(LeaseRegistry::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock(AtomicU64::new(1_000)));

        let machine = ToBtcLnTrustedMachine::new(
            store.clone(),
            Arc::new(FakeLnPaymentClient::new(LnPaymentStatus::InFlight, [5; 32])),
            transfer.clone(),
            leases.clone(),
            clock.clone(),
        );
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(),
                "lnbc1...".to_string(),
                "refund-address".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();
        machine.on_deposit_confirmed(key, "deposit-tx".to_string()).await.unwrap();
        machine.pay(key).await.unwrap();
        assert_eq!(
            store.load(key).await.unwrap().unwrap().state,
            SwapState::ToBtcLnTrusted(FromBtcLnTrustedState::Sent)
        );
        // The process dies here without ever learning the payment settled.
        drop(machine);

        let restarted = ToBtcLnTrustedMachine::new(
            store.clone(),
            Arc::new(FakeLnPaymentClient::new(LnPaymentStatus::Succeeded, [5; 32])),
            transfer,
            leases,
            clock,
        );
        restarted.process_past_swap(key).await.unwrap();

        assert!(store.load(key).await.unwrap().is_none(), "settled records are removed");
    }
}

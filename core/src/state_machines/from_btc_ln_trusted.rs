//! FROM_BTC_LN_TRUSTED (§4.G): the user sends Lightning BTC, the
//! intermediary sends a smart-chain native-token transfer to a
//! user-supplied destination address.

use crate::error::{Error, Result};
use crate::escrow::{NativeTransferClient, TxStatus, VaultBalance};
use crate::lightning::{HoldInvoiceRequest, LnAdapter};
use crate::state_machines::{Clock, LeaseRegistry};
use crate::store::SwapStore;
use crate::types::{
    Artifacts, ChainId, ChainKind, EscrowTerms, FromBtcLnTrustedState, Metadata, SwapKey, SwapKind, SwapRecord,
    SwapState, CURRENT_SCHEMA_VERSION,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// How long a record may sit in RECEIVED under an exclusive lease before
/// another path may attempt the transition (§5).
pub const SEND_LEASE_SECS: u64 = 30;
/// Default hold-invoice expiry if the caller doesn't override it (§5
/// `invoice_timeout_seconds`).
pub const DEFAULT_INVOICE_TIMEOUT_SECS: u64 = 90;

pub struct FromBtcLnTrustedMachine<L: LnAdapter, T: NativeTransferClient, V: VaultBalance> {
    store: Arc<SwapStore>,
    ln: Arc<L>,
    transfer: Arc<T>,
    vault: Arc<V>,
    leases: Arc<LeaseRegistry>,
    clock: Arc<dyn Clock>,
}

impl<L: LnAdapter, T: NativeTransferClient, V: VaultBalance> FromBtcLnTrustedMachine<L, T, V> {
    pub fn new(
        store: Arc<SwapStore>,
        ln: Arc<L>,
        transfer: Arc<T>,
        vault: Arc<V>,
        leases: Arc<LeaseRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ln,
            transfer,
            vault,
            leases,
            clock,
        }
    }

    /// Pre-commit phase: generate the secret, create the hold invoice,
    /// persist a CREATED record.
    pub async fn create(
        &self,
        chain_id: ChainId,
        chain_kind: ChainKind,
        mut terms: EscrowTerms,
        destination_address: String,
        description: String,
    ) -> Result<SwapRecord> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let payment_hash: [u8; 32] = Sha256::digest(secret).into();
        terms.payment_hash = payment_hash;
        terms.kind = SwapKind::Htlc;

        let now = self.clock.now_unix();
        let expires_at_unix = now + DEFAULT_INVOICE_TIMEOUT_SECS;

        let invoice = self
            .ln
            .create_hold_invoice(HoldInvoiceRequest {
                description,
                cltv_delta: 144,
                expires_at_unix,
                payment_hash,
                mtokens: terms.amount as u64 * 1000,
            })
            .await?;

        let mut metadata = Metadata::default();
        metadata.mark("requestReceived", now);
        metadata.mark("invoiceCreated", now);

        let record = SwapRecord {
            schema_version: CURRENT_SCHEMA_VERSION,
            key: SwapKey::new(payment_hash, terms.sequence).into(),
            chain_id,
            chain_kind,
            state: SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Created),
            terms,
            artifacts: Artifacts {
                invoice: Some(invoice),
                secret: Some(secret),
                counterparty_destination: Some(destination_address),
                ..Default::default()
            },
            metadata,
        };
        self.store.save(&record).await?;
        Ok(record)
    }

    /// CREATED → RECEIVED, or → CANCELED if the vault balance re-check
    /// fails. Driven by `on_htlc_received` once the invoice is first
    /// observed `is_held = true` (§4.G).
    pub async fn on_htlc_received(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcLnTrustedState::Created).await?;

        record.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Received);
        record.metadata.mark("htlcReceived", self.clock.now_unix());
        self.store.save(&record).await?;

        let balance = self.vault.balance(&record.terms.token_address).await?;
        if balance < record.terms.amount {
            return self.cancel_swap_and_invoice(record.key()).await;
        }
        Ok(record)
    }

    /// RECEIVED → SENT: acquire the 30s lease, submit the native transfer,
    /// persist before releasing the lease. Re-entry protection: if the
    /// record is no longer in RECEIVED by the time this runs, bail without
    /// mutating (§5 "re-check state after every suspension").
    pub async fn send(&self, key: SwapKey) -> Result<SwapRecord> {
        let now = self.clock.now_unix();
        let lease = self.leases.try_acquire(key, now, SEND_LEASE_SECS)?;

        let record = self.load_in_state(key, FromBtcLnTrustedState::Received).await;
        let mut record = match record {
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

        let submission = self
            .transfer
            .submit_transfer(&destination, record.terms.amount, crate::escrow::FeeRate {
                micro_lamports_per_cu: 0,
                needs_wrapped_native_ata_init: false,
                wrapped_native_ata_balance: None,
            })
            .await;

        // Re-check before mutating: another task may have transitioned this
        // record while the transfer RPC was in flight.
        let still_received = self
            .store
            .load(key)
            .await?
            .map(|r| r.state == SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Received))
            .unwrap_or(false);
        if !still_received {
            lease.release();
            return self
                .store
                .load(key)
                .await?
                .ok_or_else(|| Error::SwapNotFound(key.to_string()));
        }

        let result = match submission {
            Ok(submission) => {
                record.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Sent);
                record.artifacts.tx_ids.insert("commit".to_string(), submission.tx_id);
                record.artifacts.raw_tx = Some(submission.raw_tx);
                self.store.save(&record).await?;
                Ok(record)
            }
            Err(e) => Err(e),
        };
        lease.release();
        result
    }

    /// SENT → {RECEIVED on `not_found`, REFUNDED on `reverted`, CONFIRMED on
    /// `success`} (§4.G).
    pub async fn on_commit_status(&self, key: SwapKey, status: TxStatus) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcLnTrustedState::Sent).await?;
        match status {
            TxStatus::NotFound => {
                // Clears the tx artifact to allow retry.
                record.artifacts.tx_ids.remove("commit");
                record.artifacts.raw_tx = None;
                record.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Received);
                self.store.save(&record).await?;
                Ok(record)
            }
            TxStatus::Reverted => {
                record.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Refunded);
                self.store.save(&record).await?;
                self.ln.cancel_hold_invoice(record.key().payment_hash).await?;
                Ok(record)
            }
            TxStatus::Success => {
                record.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Confirmed);
                self.store.save(&record).await?;
                self.settle(record).await
            }
            TxStatus::Pending => Ok(record),
        }
    }

    /// CONFIRMED → SETTLED: settle the hold invoice with the recorded
    /// secret (only now is the pre-image allowed to reach the Lightning
    /// node, per §3 Invariant 3 / §8 property 2), then remove the record.
    async fn settle(&self, mut record: SwapRecord) -> Result<SwapRecord> {
        let secret = record
            .artifacts
            .secret
            .ok_or_else(|| Error::Terminal("record has no secret to settle with".to_string()))?;
        self.ln.settle_hold_invoice(secret).await?;

        record.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Settled);
        record.metadata.mark("settled", self.clock.now_unix());
        self.store.save(&record).await?;
        self.store.remove(record.key()).await?;
        Ok(record)
    }

    /// Only legal from RECEIVED (§4.G "Cancellation").
    pub async fn cancel_swap_and_invoice(&self, key: SwapKey) -> Result<SwapRecord> {
        let mut record = self.load_in_state(key, FromBtcLnTrustedState::Received).await?;
        record.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Canceled);
        self.store.save(&record).await?;
        self.ln.cancel_hold_invoice(key.payment_hash).await?;
        self.store.remove(key).await?;
        Ok(record)
    }

    /// Startup / periodic reconciliation for every non-terminal record
    /// (§4.G "Past-swap reconciliation"; §8 property 7 "crash recovery").
    pub async fn process_past_swap(&self, key: SwapKey) -> Result<()> {
        let record = match self.store.load(key).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        if record.state.is_terminal() {
            return Ok(());
        }

        if record.state == SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Sent) {
            // The transfer was submitted before a restart (or is merely
            // slow); re-poll its outcome rather than waiting indefinitely
            // for a caller who may never ask again.
            if let Some(tx_id) = record.artifacts.tx_ids.get("commit").cloned() {
                let status = self.transfer.tx_status(&tx_id).await?;
                self.on_commit_status(key, status).await?;
            }
            return Ok(());
        }

        let invoice = self.ln.get_invoice(key.payment_hash).await?;
        if invoice.is_held {
            self.on_htlc_received(key).await?;
        } else if invoice.is_canceled || self.clock.now_unix() >= invoice.expires_at_unix {
            if record.state == SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Created) {
                let mut r = record;
                r.state = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Canceled);
                self.store.save(&r).await?;
                self.store.remove(key).await?;
            }
        }
        // Else: resubscribe is left to the caller, which owns the
        // subscription lifetime (the adapter detaches after first `held`).
        Ok(())
    }

    async fn load_in_state(&self, key: SwapKey, expected: FromBtcLnTrustedState) -> Result<SwapRecord> {
        let record = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::SwapNotFound(key.to_string()))?;
        if record.state != SwapState::FromBtcLnTrusted(expected) {
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
    use crate::lightning::fake::FakeLnAdapter;
    use crate::state_machines::FakeClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    struct FakeTransfer {
        status: Mutex<TxStatus>,
    }

    #[async_trait]
    impl NativeTransferClient for FakeTransfer {
        async fn submit_transfer(&self, _to: &str, _amount: u128, _fee_rate: crate::escrow::FeeRate) -> Result<TxSubmission> {
            Ok(TxSubmission {
                tx_id: "tx1".to_string(),
                raw_tx: vec![1, 2, 3],
            })
        }

        async fn tx_status(&self, _tx_id: &str) -> Result<TxStatus> {
            Ok(*self.status.lock().unwrap())
        }
    }

    struct FakeVault {
        balance: u128,
    }

    #[async_trait]
    impl VaultBalance for FakeVault {
        async fn balance(&self, _token: &str) -> Result<u128> {
            Ok(self.balance)
        }
    }

    fn terms(amount: u128) -> EscrowTerms {
        EscrowTerms {
            offerer_address: "offerer".to_string(),
            claimer_address: "claimer".to_string(),
            token_address: "token".to_string(),
            amount,
            payment_hash: [0; 32],
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
        balance: u128,
    ) -> (
        FromBtcLnTrustedMachine<FakeLnAdapter, FakeTransfer, FakeVault>,
        Arc<FakeLnAdapter>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SwapStore::new(dir.path()));
        store.init().await.unwrap();
        let ln = Arc::new(FakeLnAdapter::new(vec![]));
        let transfer = Arc::new(FakeTransfer {
            status: Mutex::new(TxStatus::Success),
        });
        let vault = Arc::new(FakeVault { balance });
        let leases = Arc::new(LeaseRegistry::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock(AtomicU64::new(1_000)));
        let machine = FromBtcLnTrustedMachine::new(store, ln.clone(), transfer, vault, leases, clock);
        // Keep the tempdir alive for the duration of the test by leaking it;
        // these are short-lived process-local tests.
        std::mem::forget(dir);
        (machine, ln)
    }

    #[tokio::test]
    async fn happy_path_reaches_settled_and_removes_record() {
        let (machine, ln) = setup(1_000_000).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(100_000),
                "0x1111".to_string(),
                "swap".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        ln.mark_held(key.payment_hash);
        let record = machine.on_htlc_received(key).await.unwrap();
        assert_eq!(record.state, SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Received));

        let record = machine.send(key).await.unwrap();
        assert_eq!(record.state, SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Sent));

        let record = machine.on_commit_status(key, TxStatus::Success).await.unwrap();
        assert_eq!(record.state, SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Settled));

        let invoice = ln.get_invoice(key.payment_hash).await.unwrap();
        assert!(invoice.is_confirmed);
    }

    #[tokio::test]
    async fn insufficient_balance_cancels_instead_of_sending() {
        let (machine, ln) = setup(10).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(100_000),
                "0x1111".to_string(),
                "swap".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        ln.mark_held(key.payment_hash);
        let record = machine.on_htlc_received(key).await.unwrap();
        assert_eq!(record.state, SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Canceled));

        let invoice = ln.get_invoice(key.payment_hash).await.unwrap();
        assert!(invoice.is_canceled);
    }

    #[tokio::test]
    async fn reverted_commit_refunds_and_cancels_invoice() {
        let (machine, ln) = setup(1_000_000).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(100_000),
                "0x1111".to_string(),
                "swap".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        ln.mark_held(key.payment_hash);
        machine.on_htlc_received(key).await.unwrap();
        machine.send(key).await.unwrap();

        let record = machine.on_commit_status(key, TxStatus::Reverted).await.unwrap();
        assert_eq!(record.state, SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Refunded));
    }

    #[tokio::test]
    async fn not_found_rewinds_to_received_and_clears_tx_artifact() {
        let (machine, ln) = setup(1_000_000).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(100_000),
                "0x1111".to_string(),
                "swap".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();

        ln.mark_held(key.payment_hash);
        machine.on_htlc_received(key).await.unwrap();
        machine.send(key).await.unwrap();

        let record = machine.on_commit_status(key, TxStatus::NotFound).await.unwrap();
        assert_eq!(record.state, SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Received));
        assert!(record.artifacts.tx_ids.get("commit").is_none());
    }

    #[tokio::test]
    async fn lease_blocks_concurrent_send() {
        let (machine, ln) = setup(1_000_000).await;
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(100_000),
                "0x1111".to_string(),
                "swap".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();
        ln.mark_held(key.payment_hash);
        machine.on_htlc_received(key).await.unwrap();

        let lease = machine.leases.try_acquire(key, 1_000, SEND_LEASE_SECS).unwrap();
        assert!(machine.send(key).await.is_err());
        lease.release();
    }

    /// §8 property 7: a fresh machine instance over the same on-disk store
    /// (standing in for a process restart) finishes a swap left mid-flight
    /// by a prior instance.
    #[tokio::test]
    async fn process_past_swap_recovers_a_sent_record_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SwapStore::new(dir.path()));
        store.init().await.unwrap();
        let ln = Arc::new(FakeLnAdapter::new(vec![]));
        let transfer = Arc::new(FakeTransfer {
            status: Mutex::new(TxStatus::Pending),
        });
        let vault = Arc::new(FakeVault { balance: 1_000_000 });
        let leases = Arc::new(LeaseRegistry::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock(AtomicU64::new(1_000)));

        let machine = FromBtcLnTrustedMachine::new(
            store.clone(),
            ln.clone(),
            transfer.clone(),
            vault.clone(),
            leases.clone(),
            clock.clone(),
        );
        let record = machine
            .create(
                ChainId("sol-mainnet".to_string()),
                ChainKind::Sol,
                terms(100_000),
                "0x1111".to_string(),
                "swap".to_string(),
            )
            .await
            .unwrap();
        let key = record.key();
        ln.mark_held(key.payment_hash);
        machine.on_htlc_received(key).await.unwrap();
        machine.send(key).await.unwrap();
        assert_eq!(
            store.load(key).await.unwrap().unwrap().state,
            SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Sent)
        );
        // The process dies here; `machine` is dropped without ever learning
        // the transfer went through.
        drop(machine);

        *transfer.status.lock().unwrap() = TxStatus::Success;
        let restarted = FromBtcLnTrustedMachine::new(store.clone(), ln, transfer, vault, leases, clock);
        restarted.process_past_swap(key).await.unwrap();

        assert!(store.load(key).await.unwrap().is_none(), "settled records are removed");
    }
}

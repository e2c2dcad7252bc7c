//! Per-direction swap state machines (§4.G).
//!
//! All six directions share the pre-commit phase — quote, admission
//! checks, create the record, start — and the concurrency discipline of §5:
//! every suspension point is followed by a re-check of the record's current
//! `state` before any mutation. [`FromBtcLnTrustedMachine`] is specified in
//! full; the others follow the same shape with different signals.

pub mod from_btc;
pub mod from_btc_ln;
pub mod from_btc_ln_trusted;
pub mod to_btc;
pub mod to_btc_ln;
pub mod to_btc_ln_trusted;

pub use from_btc_ln_trusted::FromBtcLnTrustedMachine;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::types::SwapKey;

/// Abstracts wall-clock time so tests can drive it deterministically instead
/// of racing `SystemTime::now()`.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs()
    }
}

#[cfg(test)]
pub struct FakeClock(pub std::sync::atomic::AtomicU64);

#[cfg(test)]
impl Clock for FakeClock {
    fn now_unix(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// The 30-second exclusive record lease from §5: while a record is in
/// RECEIVED with an outstanding lease, no other path may transition it; the
/// lease auto-expires, and every mutation re-checks `state` regardless of
/// whether it holds the lease or observed it expire.
pub struct LeaseRegistry {
    leases: Mutex<HashMap<SwapKey, u64>>,
}

impl Default for LeaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to acquire an exclusive lease on `key` for `duration_secs`.
    /// Fails if another lease is active and not yet expired.
    pub fn try_acquire(&self, key: SwapKey, now_unix: u64, duration_secs: u64) -> Result<LeaseGuard<'_>> {
        let mut leases = self.leases.lock().unwrap();
        if let Some(expires_at) = leases.get(&key) {
            if *expires_at > now_unix {
                return Err(Error::Leased(key.to_string()));
            }
        }
        leases.insert(key, now_unix + duration_secs);
        Ok(LeaseGuard { registry: self, key })
    }
}

/// Released explicitly via [`LeaseGuard::release`] on callback completion,
/// or implicitly by timeout if the holder never calls it — both are safe
/// because every mutation re-checks `state` (§5).
pub struct LeaseGuard<'a> {
    registry: &'a LeaseRegistry,
    key: SwapKey,
}

impl LeaseGuard<'_> {
    pub fn release(self) {
        self.registry.leases.lock().unwrap().remove(&self.key);
    }
}

/// Shared fakes for the FROM_BTC / FROM_BTC_LN / TO_BTC / TO_BTC_LN machine
/// tests, so each machine's test module doesn't re-implement the nine-method
/// [`crate::escrow::ChainAdapter`] trait from scratch.
#[cfg(test)]
pub mod test_support {
    use crate::error::Result;
    use crate::escrow::{Action, ActionSubmitter, ChainAdapter, CommitStatus, FeeRate, SwapData, TxStatus, TxSubmission};
    use crate::types::EscrowTerms;
    use async_trait::async_trait;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::Signature;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// A `ChainAdapter` whose `get_commit_status` answer for a given
    /// `payment_hash` is set directly by the test, and whose instruction
    /// builders return empty no-op actions (the machines under test only
    /// care that an `Action` was produced and handed to the submitter, not
    /// its contents).
    pub struct FakeChainAdapter {
        statuses: Mutex<BTreeMap<[u8; 32], CommitStatus>>,
    }

    impl Default for FakeChainAdapter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FakeChainAdapter {
        pub fn new() -> Self {
            Self {
                statuses: Mutex::new(BTreeMap::new()),
            }
        }

        pub fn set_status(&self, payment_hash: [u8; 32], status: CommitStatus) {
            self.statuses.lock().unwrap().insert(payment_hash, status);
        }
    }

    #[async_trait]
    impl ChainAdapter for FakeChainAdapter {
        type Tx = ();
        type Signer = ();
        type PreFetchData = ();
        type PreFetchVerification = ();

        async fn offerer_initialize_pay_in(
            &self,
            _terms: &EscrowTerms,
            _swap_data: SwapData,
            _txo_hash: [u8; 32],
            _auth_expiry: u64,
            _fee_rate: FeeRate,
        ) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        async fn offerer_initialize(
            &self,
            _terms: &EscrowTerms,
            _swap_data: SwapData,
            _security_deposit: u64,
            _claimer_bounty: u64,
            _txo_hash: [u8; 32],
            _auth_expiry: u64,
            _fee_rate: FeeRate,
        ) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        async fn claim(&self, _terms: &EscrowTerms, _secret: [u8; 32], _fee_rate: FeeRate) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        async fn refund(
            &self,
            _terms: &EscrowTerms,
            _auth_expiry: u64,
            _cooperative_signature: Option<Signature>,
            _fee_rate: FeeRate,
        ) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        async fn deposit(&self, _signer: &Pubkey, _token: &Pubkey, _amount: u64, _fee_rate: FeeRate) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        async fn withdraw(&self, _signer: &Pubkey, _token: &Pubkey, _amount: u64, _fee_rate: FeeRate) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        async fn close_data_account(&self, _scratch_account: &Pubkey, _signer: &Pubkey, _fee_rate: FeeRate) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        async fn write_tx_data(
            &self,
            _scratch_account: &Pubkey,
            _signer: &Pubkey,
            _proof: &crate::btc_proof::ProofBatch,
            _fee_rate: FeeRate,
        ) -> Result<Action> {
            Ok(Action::new(vec![], 0))
        }

        fn tx_data_account(&self, reversed_txid: &[u8; 32], _signer: &Pubkey) -> Pubkey {
            Pubkey::new_from_array(*reversed_txid)
        }

        async fn get_commit_status(&self, terms: &EscrowTerms, _caller_is_offerer: bool, _now_unix: u64) -> Result<CommitStatus> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(&terms.payment_hash)
                .copied()
                .unwrap_or(CommitStatus::NotCommited))
        }
    }

    /// An `ActionSubmitter` whose next `tx_status` answer is fixed at
    /// construction and can be changed mid-test via `set_status`.
    pub struct FakeActionSubmitter {
        status: Mutex<TxStatus>,
        next_tx_id: Mutex<u64>,
    }

    impl FakeActionSubmitter {
        pub fn new(status: TxStatus) -> Self {
            Self {
                status: Mutex::new(status),
                next_tx_id: Mutex::new(0),
            }
        }

        pub fn set_status(&self, status: TxStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    #[async_trait]
    impl ActionSubmitter for FakeActionSubmitter {
        async fn submit(&self, _action: &Action) -> Result<TxSubmission> {
            let mut next = self.next_tx_id.lock().unwrap();
            let tx_id = format!("tx{next}");
            *next += 1;
            Ok(TxSubmission {
                tx_id,
                raw_tx: vec![0],
            })
        }

        async fn tx_status(&self, _tx_id: &str) -> Result<TxStatus> {
            Ok(*self.status.lock().unwrap())
        }
    }
}

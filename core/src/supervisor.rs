//! Swap Handler Supervisor (§4.H): one instance per direction, running
//! `start()`/`handle_request()`/`on_chain_event()`/a periodic tick over that
//! direction's state machine.
//!
//! [`Supervisor`] below wires [`crate::state_machines::from_btc_ln_trusted::FromBtcLnTrustedMachine`],
//! the direction `spec.md` §4.G specifies in full. The other five
//! directions are wired the same way — a supervisor struct bundling that
//! direction's machine plus its own prefetch collaborators, running the
//! identical seven-step admission pipeline below — over
//! [`crate::state_machines::from_btc::FromBtcMachine`],
//! [`crate::state_machines::from_btc_ln::FromBtcLnMachine`],
//! [`crate::state_machines::to_btc::ToBtcMachine`], and
//! [`crate::state_machines::to_btc_ln::ToBtcLnMachine`] respectively.

use crate::error::{Error, Result};
use crate::escrow::{NativeTransferClient, VaultBalance};
use crate::lightning::{has_sufficient_inbound_liquidity, ChannelsSnapshot, LnAdapter};
use crate::state_machines::from_btc_ln_trusted::FromBtcLnTrustedMachine;
use crate::state_machines::{Clock, LeaseRegistry};
use crate::store::SwapStore;
use crate::types::{ChainId, ChainKind, Direction, EscrowTerms, FromBtcLnTrustedState, SwapKey, SwapKind, SwapRecord, SwapState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative cancellation for one `handle_request` run (§4.H, §5
/// "Cancellation"): every prefetch carries a clone of the same
/// [`AbortSignal`]; the first failure calls [`AbortController::abort`],
/// which wakes every sibling still waiting.
pub struct AbortController {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            aborted: self.aborted.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if !self.is_aborted() {
            self.notify.notified().await;
        }
    }
}

/// Runs `fut` to completion, aborting `controller` if it fails so every
/// sibling prefetch sharing the signal bails out, and itself bailing out
/// early if a sibling already aborted (§4.H "any failure aborts all peers").
async fn prefetch<F, T>(controller: &AbortController, signal: AbortSignal, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        res = fut => {
            if res.is_err() {
                controller.abort();
            }
            res
        }
        _ = signal.wait() => Err(Error::Terminal("admission aborted by a sibling prefetch".to_string())),
    }
}

/// The result of pricing a requested amount (§4.H step 4): `amount_bd` in
/// the Bitcoin-side unit, the fee in both units, and the total the vault
/// must be able to cover.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub amount_bd: u128,
    pub swap_fee: u128,
    pub swap_fee_in_token: u128,
    pub total_in_token: u128,
}

/// External pricing collaborator (§1, §4.H step 3/4) — out of scope to
/// implement here, reached through this narrow seam.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn quote(&self, token: &str, amount: u128, exact_out: bool) -> Result<Quote>;
}

/// Per-token min/max admission bounds (§4.H step 2).
#[derive(Debug, Clone, Copy)]
pub struct TokenBounds {
    pub min_amount: u128,
    pub max_amount: u128,
}

impl TokenBounds {
    pub fn check(&self, amount: u128) -> Result<()> {
        if amount < self.min_amount || amount > self.max_amount {
            return Err(Error::Validation(format!(
                "amount {amount} outside bounds [{}, {}]",
                self.min_amount, self.max_amount
            )));
        }
        Ok(())
    }
}

/// `POST /createInvoice` request body (§6), pre-parse/validate.
#[derive(Debug, Clone)]
pub struct CreateInvoiceRequest {
    pub chain_id: ChainId,
    pub chain_kind: ChainKind,
    pub token_address: String,
    pub destination_address: String,
    pub amount: u128,
    pub exact_out: bool,
    pub description: String,
}

impl CreateInvoiceRequest {
    fn validate(&self) -> Result<()> {
        if self.amount == 0 {
            return Err(Error::Validation("amount must be positive".to_string()));
        }
        if self.destination_address.trim().is_empty() {
            return Err(Error::Validation("destination address is required".to_string()));
        }
        if self.token_address.trim().is_empty() {
            return Err(Error::Validation("token address is required".to_string()));
        }
        Ok(())
    }
}

/// The FROM_BTC_LN_TRUSTED supervisor (§4.H): admits requests, wires the
/// hold-invoice subscription that drives the machine's post-commit phase,
/// and runs `process_past_swap` on start and every tick.
pub struct Supervisor<L, T, V, P>
where
    L: LnAdapter + 'static,
    T: NativeTransferClient,
    V: VaultBalance,
    P: PriceOracle,
{
    machine: Arc<FromBtcLnTrustedMachine<L, T, V>>,
    store: Arc<SwapStore>,
    ln: Arc<L>,
    vault: Arc<V>,
    price: Arc<P>,
    clock: Arc<dyn Clock>,
    bounds: TokenBounds,
    intermediary_address: String,
}

impl<L, T, V, P> Supervisor<L, T, V, P>
where
    L: LnAdapter + 'static,
    T: NativeTransferClient + 'static,
    V: VaultBalance + 'static,
    P: PriceOracle,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SwapStore>,
        ln: Arc<L>,
        transfer: Arc<T>,
        vault: Arc<V>,
        price: Arc<P>,
        leases: Arc<LeaseRegistry>,
        clock: Arc<dyn Clock>,
        bounds: TokenBounds,
        intermediary_address: String,
    ) -> Self {
        let machine = Arc::new(FromBtcLnTrustedMachine::new(
            store.clone(),
            ln.clone(),
            transfer,
            vault.clone(),
            leases,
            clock.clone(),
        ));
        Self {
            machine,
            store,
            ln,
            vault,
            price,
            clock,
            bounds,
            intermediary_address,
        }
    }

    /// Loads every FROM_BTC_LN_TRUSTED record and reconciles it against live
    /// collaborator state (§4.H "load records for this direction, run
    /// `process_past_swaps()`").
    pub async fn start(&self) -> Result<()> {
        let records = self.store.load_direction(Direction::FromBtcLnTrusted).await?;
        for record in records {
            if record.state.is_terminal() {
                continue;
            }
            if let Err(e) = self.machine.process_past_swap(record.key()).await {
                tracing::warn!(key = %record.key(), error = %e, "process_past_swap failed on start");
            }
        }
        Ok(())
    }

    /// The seven-step admission pipeline (§4.H).
    pub async fn handle_request(&self, req: CreateInvoiceRequest) -> Result<SwapRecord> {
        // 1. parse/validate.
        req.validate()?;
        // 2. amount bounds.
        self.bounds.check(req.amount)?;

        // 3. parallel prefetches, all sharing one abort signal.
        let controller = AbortController::new();
        let (quote, balance, channels) = tokio::join!(
            prefetch(
                &controller,
                controller.signal(),
                self.price.quote(&req.token_address, req.amount, req.exact_out),
            ),
            prefetch(
                &controller,
                controller.signal(),
                self.vault.balance(&req.token_address),
            ),
            prefetch(&controller, controller.signal(), self.ln.channels_snapshot(true)),
        );
        let quote = quote?;
        let balance = balance?;
        let channels: ChannelsSnapshot = channels?;

        // 5. balance check — must happen before any invoice/record is
        // created (§8 property 8 "balance-check short-circuits admission").
        if balance < quote.total_in_token {
            return Err(Error::Validation(format!(
                "insufficient vault balance: have {balance}, need {}",
                quote.total_in_token
            )));
        }
        let amount_msat = quote.amount_bd as u64 * 1000;
        if !has_sufficient_inbound_liquidity(&channels, amount_msat) {
            return Err(Error::Terminal("Not enough LN inbound liquidity".to_string()));
        }

        // 6. quote the escrow terms, create the hold invoice, persist.
        let now = self.clock.now_unix();
        let terms = EscrowTerms {
            offerer_address: self.intermediary_address.clone(),
            claimer_address: req.destination_address.clone(),
            token_address: req.token_address.clone(),
            amount: quote.total_in_token,
            payment_hash: [0; 32],
            sequence: 0,
            expiry: now + 3600,
            confirmations_required: 0,
            escrow_nonce: 0,
            pay_in: false,
            pay_out: false,
            kind: SwapKind::Htlc,
            security_deposit: 0,
            claimer_bounty: 0,
            txo_hash: None,
        };
        let record = self
            .machine
            .create(req.chain_id, req.chain_kind, terms, req.destination_address, req.description)
            .await?;

        // 7. subscribe to the invoice's held transition; drive the rest of
        // the machine from a detached task once it fires.
        self.spawn_invoice_watch(record.key());

        Ok(record)
    }

    fn spawn_invoice_watch(&self, key: SwapKey) {
        let machine = self.machine.clone();
        let ln = self.ln.clone();
        tokio::spawn(async move {
            let mut subscription = match ln.subscribe(key.payment_hash).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "failed to subscribe to hold invoice");
                    return;
                }
            };
            match subscription.wait_for_held().await {
                Ok(true) => {
                    if let Err(e) = machine.on_htlc_received(key).await {
                        tracing::warn!(%key, error = %e, "on_htlc_received failed");
                        return;
                    }
                    if let Err(e) = machine.send(key).await {
                        tracing::warn!(%key, error = %e, "send failed");
                    }
                }
                Ok(false) => {
                    if let Err(e) = machine.cancel_swap_and_invoice(key).await {
                        tracing::debug!(%key, error = %e, "cancel_swap_and_invoice no-op or already terminal");
                    }
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "hold invoice subscription failed");
                }
            }
        });
    }

    /// Re-runs past-swap reconciliation for every open record (§4.H
    /// "Periodic tick").
    pub async fn tick(&self) -> Result<()> {
        let records = self.store.load_direction(Direction::FromBtcLnTrusted).await?;
        for record in records {
            if record.state.is_terminal() {
                continue;
            }
            if let Err(e) = self.machine.process_past_swap(record.key()).await {
                tracing::warn!(key = %record.key(), error = %e, "process_past_swap failed on tick");
            }
        }
        Ok(())
    }

    /// FROM_BTC_LN_TRUSTED never commits a smart-chain escrow (the payout is
    /// a direct native transfer), so it has no chain events to dispatch;
    /// kept to satisfy the supervisor contract uniformly across directions
    /// (the on-chain directions' supervisors route
    /// `crate::escrow::types::EscrowEvent::{Initialize,Claim,Refund}` here to
    /// their own machine's `on_escrow_observed`/`on_claim_observed`/
    /// `on_refund_observed`).
    pub fn on_chain_event(&self, event: &crate::escrow::types::EscrowEvent) {
        tracing::debug!(?event, "ignored: FROM_BTC_LN_TRUSTED has no on-chain escrow");
    }

    /// For `GET /getInvoiceStatus` (§6): the protocol-level status code for
    /// `key`'s current state, plus a `tx_id` once one exists. `Ok(None)` if
    /// no such record is on file (already settled-and-removed, or unknown).
    pub async fn record_status(&self, key: SwapKey) -> Result<Option<(u32, Option<String>)>> {
        let record = match self.store.load(key).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let tx_id = record
            .artifacts
            .tx_ids
            .get("commit")
            .or_else(|| record.artifacts.tx_ids.get("ln_payment"))
            .cloned();
        Ok(Some((status_code(&record.state), tx_id)))
    }
}

/// Maps a [`SwapState`] to the protocol-level status code `spec.md` §6
/// specifies (`10000 success, 10001 expired/canceled, 10010 unpaid, 10011
/// htlc received, 10012 tx sent`).
pub fn status_code(state: &SwapState) -> u32 {
    match state {
        SwapState::FromBtcLnTrusted(s) | SwapState::ToBtcLnTrusted(s) => match s {
            FromBtcLnTrustedState::Canceled | FromBtcLnTrustedState::Refunded => 10001,
            FromBtcLnTrustedState::Created => 10010,
            FromBtcLnTrustedState::Received => 10011,
            FromBtcLnTrustedState::Sent => 10012,
            FromBtcLnTrustedState::Confirmed | FromBtcLnTrustedState::Settled => 10000,
        },
        _ => 10010,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::TxStatus;
    use crate::lightning::fake::FakeLnAdapter;
    use crate::lightning::Channel;
    use crate::state_machines::FakeClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    struct FakeTransfer;
    #[async_trait]
    impl NativeTransferClient for FakeTransfer {
        async fn submit_transfer(
            &self,
            _to: &str,
            _amount: u128,
            _fee_rate: crate::escrow::FeeRate,
        ) -> Result<crate::escrow::TxSubmission> {
            Ok(crate::escrow::TxSubmission {
                tx_id: "tx0".to_string(),
                raw_tx: vec![0],
            })
        }
        async fn tx_status(&self, _tx_id: &str) -> Result<TxStatus> {
            Ok(TxStatus::Success)
        }
    }

    struct FakeVault(StdMutex<u128>);
    #[async_trait]
    impl VaultBalance for FakeVault {
        async fn balance(&self, _token: &str) -> Result<u128> {
            Ok(*self.0.lock().unwrap())
        }
    }

    struct FakePriceOracle;
    #[async_trait]
    impl PriceOracle for FakePriceOracle {
        async fn quote(&self, _token: &str, amount: u128, _exact_out: bool) -> Result<Quote> {
            let swap_fee = amount / 100;
            Ok(Quote {
                amount_bd: amount,
                swap_fee,
                swap_fee_in_token: swap_fee,
                total_in_token: amount + swap_fee,
            })
        }
    }

    fn request(amount: u128) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            chain_id: ChainId("sol-mainnet".to_string()),
            chain_kind: ChainKind::Sol,
            token_address: "token".to_string(),
            destination_address: "dest-address".to_string(),
            amount,
            exact_out: false,
            description: "swap".to_string(),
        }
    }

    async fn setup(
        vault_balance: u128,
        channels: Vec<Channel>,
    ) -> Supervisor<FakeLnAdapter, FakeTransfer, FakeVault, FakePriceOracle> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SwapStore::new(dir.path()));
        store.init().await.unwrap();
        std::mem::forget(dir);

        Supervisor::new(
            store,
            Arc::new(FakeLnAdapter::new(channels)),
            Arc::new(FakeTransfer),
            Arc::new(FakeVault(StdMutex::new(vault_balance))),
            Arc::new(FakePriceOracle),
            Arc::new(LeaseRegistry::new()),
            Arc::new(FakeClock(AtomicU64::new(1_000))) as Arc<dyn Clock>,
            TokenBounds {
                min_amount: 1_000,
                max_amount: 1_000_000,
            },
            "intermediary-address".to_string(),
        )
    }

    #[tokio::test]
    async fn insufficient_balance_rejects_before_creating_record() {
        let supervisor = setup(10, vec![Channel { active: true, remote_balance_msat: 1_000_000_000 }]).await;
        let err = supervisor.handle_request(request(100_000)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(supervisor.store.load_direction(Direction::FromBtcLnTrusted).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insufficient_inbound_liquidity_rejects() {
        let supervisor = setup(10_000_000, vec![Channel { active: true, remote_balance_msat: 10 }]).await;
        let err = supervisor.handle_request(request(100_000)).await.unwrap_err();
        assert!(matches!(err, Error::Terminal(_)));
    }

    #[tokio::test]
    async fn amount_outside_bounds_rejected() {
        let supervisor = setup(10_000_000, vec![Channel { active: true, remote_balance_msat: 1_000_000_000 }]).await;
        let err = supervisor.handle_request(request(1)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn happy_path_creates_record_and_watches_invoice() {
        let supervisor = setup(10_000_000, vec![Channel { active: true, remote_balance_msat: 1_000_000_000 }]).await;
        let record = supervisor.handle_request(request(100_000)).await.unwrap();
        assert_eq!(record.terms.amount, 101_000);

        let loaded = supervisor.store.load(record.key()).await.unwrap();
        assert!(loaded.is_some());
    }
}

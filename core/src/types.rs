//! The swap data model: [`SwapRecord`] and everything it is built from.
//!
//! A `SwapRecord` is identified by `(payment_hash, sequence)` and mutated
//! only by the state machine for its direction, the event watcher on a
//! matching chain event, or the supervisor's sweep timer (see `store` for the
//! persistence contract and `state_machines` for the transitions).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Serde helper: serialize/deserialize `[u8; 32]` as a hex string.
pub(crate) mod hex_bytes32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Serde helper: big integers carried as base-10 strings on the wire (§6).
pub(crate) mod amount_string {
    use super::*;

    pub fn serialize<S>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which side of the swap originates on Bitcoin, and whether it settles over
/// Lightning or on-chain, and whether the Lightning leg is "trusted"
/// (intermediary moves funds to a user-supplied address rather than the
/// counterparty claiming an on-chain escrow itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    FromBtc,
    ToBtc,
    FromBtcLn,
    ToBtcLn,
    FromBtcLnTrusted,
    ToBtcLnTrusted,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::FromBtc => "FROM_BTC",
            Direction::ToBtc => "TO_BTC",
            Direction::FromBtcLn => "FROM_BTC_LN",
            Direction::ToBtcLn => "TO_BTC_LN",
            Direction::FromBtcLnTrusted => "FROM_BTC_LN_TRUSTED",
            Direction::ToBtcLnTrusted => "TO_BTC_LN_TRUSTED",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a configured smart chain instance (e.g. a specific Solana
/// cluster). The wire `type` discriminator steering deserialization (`"sol"`,
/// `"evm"`, ...) lives on [`ChainKind`]; `ChainId` is the operator-assigned
/// name of one such chain (there may be more than one Solana cluster
/// configured, for instance a mainnet and a devnet escrow program).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId(pub String);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The wire-level chain family discriminator (§6 "a `type` discriminator
/// steering the deserialization constructor").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Sol,
    Evm,
}

/// `SwapType` on the wire (§6). The canonical serialized name is always the
/// Rust variant name (Open Question 2 resolution): `ChainTxhash` is produced
/// on serialize; the legacy string `"chainTxhash"` is accepted as an alias on
/// deserialize only, never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapKind {
    Htlc,
    Chain,
    ChainNonced,
    #[serde(alias = "chainTxhash")]
    ChainTxhash,
}

impl SwapKind {
    /// `true` for the on-chain-proof kinds, which require a BTC-relay verify
    /// instruction and a tx-data scratch account at claim time (§4.B).
    pub fn requires_tx_data(&self) -> bool {
        matches!(self, SwapKind::Chain | SwapKind::ChainNonced | SwapKind::ChainTxhash)
    }
}

/// The terms of an escrow as agreed at quote time, immutable for the life of
/// the swap (§3 `EscrowTerms`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowTerms {
    pub offerer_address: String,
    pub claimer_address: String,
    pub token_address: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
    #[serde(with = "hex_bytes32")]
    pub payment_hash: [u8; 32],
    pub sequence: u64,
    /// Unix seconds, or a block height if below `EXPIRY_HEIGHT_THRESHOLD`.
    pub expiry: u64,
    pub confirmations_required: u16,
    pub escrow_nonce: u64,
    /// `true`: offerer funds are pulled from their ATA. `false`: debited from
    /// their LP vault.
    pub pay_in: bool,
    /// `true`: claimer funds are pushed to their ATA. `false`: credited to
    /// their LP vault.
    pub pay_out: bool,
    pub kind: SwapKind,
    #[serde(with = "amount_string")]
    pub security_deposit: u128,
    #[serde(with = "amount_string")]
    pub claimer_bounty: u128,
    #[serde(default, with = "opt_hex_bytes32")]
    pub txo_hash: Option<[u8; 32]>,
}

/// A value below this is interpreted as a block height rather than a Unix
/// timestamp when reading `expiry` (mirrors how the escrow program itself
/// discriminates the two encodings of the same field).
pub const EXPIRY_HEIGHT_THRESHOLD: u64 = 500_000_000;

impl EscrowTerms {
    pub fn expiry_is_height(&self) -> bool {
        self.expiry < EXPIRY_HEIGHT_THRESHOLD
    }
}

mod opt_hex_bytes32 {
    use super::*;

    pub fn serialize<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| {
            let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
            bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
        })
        .transpose()
    }
}

/// On-chain/Lightning artifacts accumulated as a swap progresses (§3
/// `Artifacts`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    /// BOLT-11 invoice string, for LN-side directions.
    pub invoice: Option<String>,
    /// Transaction ids keyed by role: `init`, `commit`, `claim`, `refund`.
    #[serde(default)]
    pub tx_ids: BTreeMap<String, String>,
    /// Raw signed smart-chain transaction kept around for retry after a
    /// `not_found` chain report.
    pub raw_tx: Option<Vec<u8>>,
    /// The secret pre-image (LN-trusted flows only). Present in the record
    /// from creation, but never placed on the wire or handed to the
    /// Lightning node before the relevant invariant in §3 is satisfied.
    #[serde(default, with = "opt_hex_bytes32")]
    pub secret: Option<[u8; 32]>,
    /// Counterparty's destination address (LN-trusted: where the
    /// intermediary sends the native-token payout).
    pub counterparty_destination: Option<String>,
}

/// Timestamped milestones and the original request snapshot (§3
/// `Metadata`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Milestone name -> unix-seconds timestamp. Keys mirror the prose in
    /// §3: `requestReceived`, `priceCalculated`, `balanceChecked`,
    /// `invoiceCreated`, `htlcReceived`, ...
    #[serde(default)]
    pub milestones: BTreeMap<String, u64>,
    /// The original request body, kept for audit/replay diagnostics.
    pub request_snapshot: Option<serde_json::Value>,
}

impl Metadata {
    pub fn mark(&mut self, milestone: &str, now_unix: u64) {
        self.milestones.insert(milestone.to_string(), now_unix);
    }
}

/// The `(payment_hash, sequence)` identity of a swap record, and the
/// canonical store key format from §4.A / §6: `hex(payment_hash) || "_" ||
/// hex_u64_le(sequence)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapKey {
    pub payment_hash: [u8; 32],
    pub sequence: u64,
}

impl SwapKey {
    pub fn new(payment_hash: [u8; 32], sequence: u64) -> Self {
        Self {
            payment_hash,
            sequence,
        }
    }

    /// `<hex(payment_hash)>_<hex_u64_le(sequence)>`, matching the on-disk
    /// filename stem at `<dir>/<key>.json`.
    pub fn store_key(&self) -> String {
        format!(
            "{}_{}",
            hex::encode(self.payment_hash),
            hex::encode(self.sequence.to_le_bytes())
        )
    }

    /// Parse a store key back into its components. Used by `load_all` to
    /// rehydrate from a directory listing.
    pub fn parse(key: &str) -> Option<Self> {
        let (hash_hex, seq_hex) = key.split_once('_')?;
        let payment_hash: [u8; 32] = hex::decode(hash_hex).ok()?.try_into().ok()?;
        let seq_bytes = hex::decode(seq_hex).ok()?;
        let seq_bytes: [u8; 8] = seq_bytes.try_into().ok()?;
        Some(Self {
            payment_hash,
            sequence: u64::from_le_bytes(seq_bytes),
        })
    }
}

impl std::fmt::Display for SwapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.store_key())
    }
}

/// Integer state codes, kept stable across releases because they are
/// persisted (§4.G).
pub trait StateCode {
    fn code(&self) -> i8;
    fn is_failed(&self) -> bool;
    fn is_initiated(&self) -> bool;
    fn is_success(&self) -> bool;
}

/// States for [`Direction::FromBtcLnTrusted`] (§4.G, table reproduced
/// verbatim: codes are part of the persisted format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromBtcLnTrustedState {
    Refunded = -2,
    Canceled = -1,
    Created = 0,
    Received = 1,
    Sent = 2,
    Confirmed = 3,
    Settled = 4,
}

impl StateCode for FromBtcLnTrustedState {
    fn code(&self) -> i8 {
        *self as i8
    }
    fn is_failed(&self) -> bool {
        matches!(self, Self::Refunded | Self::Canceled)
    }
    fn is_initiated(&self) -> bool {
        !matches!(self, Self::Created)
    }
    fn is_success(&self) -> bool {
        matches!(self, Self::Settled)
    }
}

/// States for [`Direction::FromBtc`] and [`Direction::FromBtcLn`]: the
/// on-chain-settling and non-trusted-Lightning variants share this shape
/// (§4.G "Other machines").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromBtcState {
    Refunded = -2,
    Canceled = -1,
    Created = 0,
    Received = 1,
    Commited = 2,
    Claimed = 3,
}

impl StateCode for FromBtcState {
    fn code(&self) -> i8 {
        *self as i8
    }
    fn is_failed(&self) -> bool {
        matches!(self, Self::Refunded | Self::Canceled)
    }
    fn is_initiated(&self) -> bool {
        !matches!(self, Self::Created)
    }
    fn is_success(&self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// States for [`Direction::ToBtc`] and [`Direction::ToBtcLn`] (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToBtcState {
    Refunded = -2,
    Canceled = -1,
    Created = 0,
    Commited = 1,
    Paying = 2,
    Paid = 3,
    Claimed = 4,
}

impl StateCode for ToBtcState {
    fn code(&self) -> i8 {
        *self as i8
    }
    fn is_failed(&self) -> bool {
        matches!(self, Self::Refunded | Self::Canceled)
    }
    fn is_initiated(&self) -> bool {
        !matches!(self, Self::Created)
    }
    fn is_success(&self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// The swap's current state, tagged by direction so a record can only ever
/// hold a state that is valid for its own direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapState {
    FromBtcLnTrusted(FromBtcLnTrustedState),
    ToBtcLnTrusted(FromBtcLnTrustedState),
    FromBtc(FromBtcState),
    FromBtcLn(FromBtcState),
    ToBtc(ToBtcState),
    ToBtcLn(ToBtcState),
}

impl SwapState {
    pub fn direction(&self) -> Direction {
        match self {
            SwapState::FromBtcLnTrusted(_) => Direction::FromBtcLnTrusted,
            SwapState::ToBtcLnTrusted(_) => Direction::ToBtcLnTrusted,
            SwapState::FromBtc(_) => Direction::FromBtc,
            SwapState::FromBtcLn(_) => Direction::FromBtcLn,
            SwapState::ToBtc(_) => Direction::ToBtc,
            SwapState::ToBtcLn(_) => Direction::ToBtcLn,
        }
    }

    pub fn code(&self) -> i8 {
        match self {
            SwapState::FromBtcLnTrusted(s) | SwapState::ToBtcLnTrusted(s) => s.code(),
            SwapState::FromBtc(s) | SwapState::FromBtcLn(s) => s.code(),
            SwapState::ToBtc(s) | SwapState::ToBtcLn(s) => s.code(),
        }
    }

    pub fn is_failed(&self) -> bool {
        match self {
            SwapState::FromBtcLnTrusted(s) | SwapState::ToBtcLnTrusted(s) => s.is_failed(),
            SwapState::FromBtc(s) | SwapState::FromBtcLn(s) => s.is_failed(),
            SwapState::ToBtc(s) | SwapState::ToBtcLn(s) => s.is_failed(),
        }
    }

    pub fn is_initiated(&self) -> bool {
        match self {
            SwapState::FromBtcLnTrusted(s) | SwapState::ToBtcLnTrusted(s) => s.is_initiated(),
            SwapState::FromBtc(s) | SwapState::FromBtcLn(s) => s.is_initiated(),
            SwapState::ToBtc(s) | SwapState::ToBtcLn(s) => s.is_initiated(),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            SwapState::FromBtcLnTrusted(s) | SwapState::ToBtcLnTrusted(s) => s.is_success(),
            SwapState::FromBtc(s) | SwapState::FromBtcLn(s) => s.is_success(),
            SwapState::ToBtc(s) | SwapState::ToBtcLn(s) => s.is_success(),
        }
    }

    /// `true` once the record has reached any terminal state — a
    /// supervisor's tick skips these rather than re-running reconciliation
    /// on them (§3 "Lifecycle").
    pub fn is_terminal(&self) -> bool {
        self.is_failed() || self.is_success()
    }
}

/// The primary persisted entity (§3 `SwapRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord {
    /// Schema version discriminant, so an unknown on-disk format is rejected
    /// at load with a descriptive error rather than silently misread.
    pub schema_version: u32,
    pub key: SwapKeyWire,
    pub chain_id: ChainId,
    pub chain_kind: ChainKind,
    pub state: SwapState,
    pub terms: EscrowTerms,
    pub artifacts: Artifacts,
    pub metadata: Metadata,
}

/// [`SwapKey`] in its serializable form (the native type deliberately has no
/// `Serialize`/`Deserialize` derive of its own so a raw hex roundtrip never
/// accidentally bypasses [`SwapKey::store_key`]'s formatting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapKeyWire {
    #[serde(with = "hex_bytes32")]
    pub payment_hash: [u8; 32],
    pub sequence: u64,
}

impl From<SwapKey> for SwapKeyWire {
    fn from(k: SwapKey) -> Self {
        Self {
            payment_hash: k.payment_hash,
            sequence: k.sequence,
        }
    }
}

impl From<&SwapKeyWire> for SwapKey {
    fn from(k: &SwapKeyWire) -> Self {
        SwapKey::new(k.payment_hash, k.sequence)
    }
}

/// Current schema version written by this build. Bump when `SwapRecord`'s
/// shape changes in a way old records can't deserialize into directly.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

impl SwapRecord {
    pub fn key(&self) -> SwapKey {
        SwapKey::from(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_key_store_key_roundtrip() {
        let key = SwapKey::new([0x42; 32], 7);
        let formatted = key.store_key();
        assert_eq!(
            formatted,
            format!("{}_{}", "42".repeat(32), hex::encode(7u64.to_le_bytes()))
        );
        assert_eq!(SwapKey::parse(&formatted), Some(key));
    }

    #[test]
    fn from_btc_ln_trusted_codes_are_stable() {
        assert_eq!(FromBtcLnTrustedState::Refunded.code(), -2);
        assert_eq!(FromBtcLnTrustedState::Canceled.code(), -1);
        assert_eq!(FromBtcLnTrustedState::Created.code(), 0);
        assert_eq!(FromBtcLnTrustedState::Received.code(), 1);
        assert_eq!(FromBtcLnTrustedState::Sent.code(), 2);
        assert_eq!(FromBtcLnTrustedState::Confirmed.code(), 3);
        assert_eq!(FromBtcLnTrustedState::Settled.code(), 4);
    }

    #[test]
    fn cancellation_only_legal_before_commit() {
        let created = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Created);
        let received = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Received);
        let sent = SwapState::FromBtcLnTrusted(FromBtcLnTrustedState::Sent);
        assert!(!created.is_terminal());
        assert!(!received.is_terminal());
        assert!(!sent.is_terminal());
    }
}

//! Wire types for the escrow program (§6 "On-chain instruction surface").

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

/// `SwapType` as encoded in an instruction's `SwapData` (distinct from
/// [`crate::types::SwapKind`], which is the wire enum used by the store and
/// the HTTP surface; this is the exact four-byte-discriminant shape the
/// program expects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapType {
    Htlc,
    Chain,
    ChainNonced,
    ChainTxhash,
}

impl From<crate::types::SwapKind> for SwapType {
    fn from(kind: crate::types::SwapKind) -> Self {
        match kind {
            crate::types::SwapKind::Htlc => SwapType::Htlc,
            crate::types::SwapKind::Chain => SwapType::Chain,
            crate::types::SwapKind::ChainNonced => SwapType::ChainNonced,
            crate::types::SwapKind::ChainTxhash => SwapType::ChainTxhash,
        }
    }
}

/// The on-chain `SwapData` instruction argument (§6): `{kind, confirmations,
/// nonce, hash, payIn, payOut, amount, expiry, sequence}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapData {
    pub kind: SwapType,
    pub confirmations: u16,
    pub nonce: u64,
    pub hash: [u8; 32],
    pub pay_in: bool,
    pub pay_out: bool,
    pub amount: u64,
    pub expiry: u64,
    pub sequence: u64,
}

impl SwapData {
    /// Borsh-style little-endian packing of the struct, in field order, the
    /// shape an Anchor-style program instruction expects.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 2 + 8 + 32 + 1 + 1 + 8 + 8 + 8);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.confirmations.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.hash);
        buf.push(self.pay_in as u8);
        buf.push(self.pay_out as u8);
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.expiry.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf
    }
}

/// Result of [`super::contract::EscrowContract::get_commit_status`] (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Commited,
    Refundable,
    Expired,
    NotCommited,
    Paid,
}

/// One Initialize/Claim/Refund event emitted by the program and decoded by
/// the watcher (§6 "Emitted events").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowEvent {
    Initialize {
        hash: [u8; 32],
        txo_hash: [u8; 32],
        nonce: u64,
        kind: SwapType,
        sequence: u64,
    },
    Refund {
        hash: [u8; 32],
        sequence: u64,
    },
    Claim {
        hash: [u8; 32],
        secret: [u8; 32],
        sequence: u64,
    },
}

/// A decoded on-chain instruction plus its compute-unit estimate and any
/// extra signer it needs beyond the primary offerer/claimer key (§4.B "yields
/// an Action").
#[derive(Debug, Clone)]
pub struct Action {
    pub instructions: Vec<solana_sdk::instruction::Instruction>,
    pub compute_unit_budget: u32,
    pub extra_signer: Option<Pubkey>,
}

impl Action {
    pub fn new(instructions: Vec<solana_sdk::instruction::Instruction>, compute_unit_budget: u32) -> Self {
        Self {
            instructions,
            compute_unit_budget,
            extra_signer: None,
        }
    }

    pub fn with_extra_signer(mut self, signer: Pubkey) -> Self {
        self.extra_signer = Some(signer);
        self
    }
}

/// The fee-rate string's parsed form (§4.B "Fee-rate encoding"): a priority
/// fee in micro-lamports/CU, plus an optional wrapped-native ATA hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRate {
    pub micro_lamports_per_cu: u64,
    /// `true` if the wrapped-native ATA still needs to be created.
    pub needs_wrapped_native_ata_init: bool,
    /// Big-int balance already held in the wrapped-native ATA, if known.
    pub wrapped_native_ata_balance: Option<u128>,
}

impl FeeRate {
    /// Parses `"<fee>#<a>;<b>"` where `a ∈ {0,1}` and `b` is a base-10
    /// big-int, or bare `"<fee>"` with no suffix.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (fee_part, suffix) = match s.split_once('#') {
            Some((fee, suffix)) => (fee, Some(suffix)),
            None => (s, None),
        };
        let micro_lamports_per_cu: u64 = fee_part
            .parse()
            .map_err(|_| crate::Error::Validation(format!("invalid fee-rate: {s}")))?;

        let (needs_wrapped_native_ata_init, wrapped_native_ata_balance) = match suffix {
            Some(suffix) => {
                let (a, b) = suffix
                    .split_once(';')
                    .ok_or_else(|| crate::Error::Validation(format!("invalid fee-rate suffix: {s}")))?;
                let needs_init = match a {
                    "0" => false,
                    "1" => true,
                    _ => return Err(crate::Error::Validation(format!("invalid fee-rate suffix flag: {s}"))),
                };
                let balance: u128 = b
                    .parse()
                    .map_err(|_| crate::Error::Validation(format!("invalid fee-rate suffix balance: {s}")))?;
                (needs_init, Some(balance))
            }
            None => (false, None),
        };

        Ok(Self {
            micro_lamports_per_cu,
            needs_wrapped_native_ata_init,
            wrapped_native_ata_balance,
        })
    }

    /// Re-emits the same string form this was parsed from (§4.B "A helper
    /// parses and re-emits this").
    pub fn to_wire_string(&self) -> String {
        match self.wrapped_native_ata_balance {
            Some(balance) => format!(
                "{}#{};{}",
                self.micro_lamports_per_cu,
                self.needs_wrapped_native_ata_init as u8,
                balance
            ),
            None => self.micro_lamports_per_cu.to_string(),
        }
    }
}

/// A pending signature plus the slot that produced the recent blockhash it
/// was signed over (§4.C init-auth wire format `"{slot};{hex(sig)}"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlottedSignature {
    pub slot: u64,
    pub signature: Signature,
}

impl SlottedSignature {
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (slot_str, sig_hex) = s
            .split_once(';')
            .ok_or_else(|| crate::Error::Validation(format!("invalid slotted signature: {s}")))?;
        let slot: u64 = slot_str
            .parse()
            .map_err(|_| crate::Error::Validation(format!("invalid slot in signature: {s}")))?;
        let sig_bytes =
            hex::decode(sig_hex).map_err(|e| crate::Error::Validation(format!("invalid signature hex: {e}")))?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|e| crate::Error::Validation(format!("invalid signature bytes: {e}")))?;
        Ok(Self { slot, signature })
    }

    pub fn to_wire_string(&self) -> String {
        format!("{};{}", self.slot, hex::encode(self.signature.as_ref()))
    }
}

//! The Auth-Signature Protocol (§4.C): time-bounded authorizations the
//! offerer and claimer exchange before committing or refunding a swap.
//!
//! Two kinds are signed: **init-auth**, produced by the claimer before the
//! offerer commits, and **refund-auth**, produced by the claimer before a
//! cooperative early refund. Both bind to `(prefix, timeout, swap_terms)` so
//! a signature cannot be replayed against a different swap or after its
//! window closes.

use crate::error::{Error, Result};
use crate::escrow::SlottedSignature;
use crate::types::EscrowTerms;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Grace period an init-auth's `timeout` must clear `now` by.
pub const AUTH_GRACE_PERIOD_SECS: u64 = 300;
/// Grace period a claim must clear the swap's expiry by, and the grace
/// period before unilateral refund becomes available.
pub const CLAIM_GRACE_PERIOD_SECS: u64 = 600;
pub const REFUND_GRACE_PERIOD_SECS: u64 = 600;
/// How many slots a signed blockhash remains valid for on the smart chain.
pub const TX_SLOT_VALIDITY: u64 = 151;
/// Safety margin subtracted from `TX_SLOT_VALIDITY` so a signature is
/// rejected slightly before the chain itself would reject the blockhash.
pub const SIGNATURE_SLOT_BUFFER: u64 = 20;
/// Approximate wall-clock duration of one slot.
pub const SLOT_TIME: std::time::Duration = std::time::Duration::from_millis(400);

/// Whether an init-auth is for the actual `offererInitialize*` call (subject
/// to the additional expiry/claim-window check) or for a lighter-weight
/// `claim_initialize` pre-check that skips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitAuthPurpose {
    Initialize,
    ClaimInitialize,
}

/// A produced init-auth: `{prefix, timeout, signature}` where `signature`
/// wire-encodes as `"{slot};{hex(sig)}"` (§4.C).
#[derive(Debug, Clone)]
pub struct InitAuth {
    pub prefix: String,
    pub timeout: u64,
    pub signature: SlottedSignature,
}

/// Sign the deterministic transaction message (constructed by the caller via
/// [`crate::escrow::ChainAdapter`] against `slot`'s blockhash) with the
/// claimer's key.
pub fn sign_init(signing_key: &SigningKey, prefix: &str, timeout: u64, slot: u64, message: &[u8]) -> InitAuth {
    let signature = signing_key.sign(message);
    InitAuth {
        prefix: prefix.to_string(),
        timeout,
        signature: SlottedSignature {
            slot,
            signature: solana_sdk::signature::Signature::from(signature.to_bytes()),
        },
    }
}

/// Verify a produced init-auth. `processed_slot` is the chain's current
/// processed slot (not finalized — finalized is only used for the terminal
/// expiry decision, see [`is_signature_expired`]).
pub fn verify_init(
    public_key: &VerifyingKey,
    auth: &InitAuth,
    expected_prefix: &str,
    message: &[u8],
    processed_slot: u64,
    now_unix: u64,
    purpose: InitAuthPurpose,
    terms: Option<&EscrowTerms>,
) -> Result<()> {
    if auth.prefix != expected_prefix {
        return Err(Error::AuthExpired(format!(
            "prefix mismatch: expected {expected_prefix}, got {}",
            auth.prefix
        )));
    }
    if auth.timeout < now_unix + AUTH_GRACE_PERIOD_SECS {
        return Err(Error::AuthExpired("timeout too close to now".to_string()));
    }
    if auth.signature.slot + TX_SLOT_VALIDITY < SIGNATURE_SLOT_BUFFER + processed_slot + 1 {
        // Guards the identical subtraction-underflow-free form of
        // `slot + TX_SLOT_VALIDITY - SIGNATURE_SLOT_BUFFER > processed_slot`.
        return Err(Error::AuthExpired("signature slot window expired".to_string()));
    }

    let sig_bytes: [u8; 64] = auth
        .signature
        .signature
        .as_ref()
        .try_into()
        .map_err(|_| Error::SignatureVerification("malformed signature length".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);
    public_key
        .verify(message, &signature)
        .map_err(|e| Error::SignatureVerification(e.to_string()))?;

    if purpose == InitAuthPurpose::Initialize {
        if let Some(terms) = terms {
            let min_expiry = now_unix + AUTH_GRACE_PERIOD_SECS + CLAIM_GRACE_PERIOD_SECS;
            if !terms.expiry_is_height() && terms.expiry < min_expiry {
                return Err(Error::AuthExpired(
                    "swap would expire before the counterparty can safely claim".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// `true` iff `slot + TX_SLOT_VALIDITY - SIGNATURE_SLOT_BUFFER <=
/// finalized_slot` — i.e. the signature's blockhash window has closed for
/// good. Callers making a **terminal** decision (e.g. "give up and refund")
/// must pass a finalized slot reading, never processed, so the decision is
/// never reverted by a chain reorganization (§4.C).
pub fn is_signature_expired(slot: u64, finalized_slot: u64) -> bool {
    slot + TX_SLOT_VALIDITY <= SIGNATURE_SLOT_BUFFER + finalized_slot
}

/// Builds the refund-auth message: `sha256(prefix || amount_le_u64 ||
/// expiry_le_u64 || sequence_le_u64 || payment_hash || timeout_le_u64)`
/// (§4.C).
pub fn refund_auth_message(prefix: &str, amount: u64, expiry: u64, sequence: u64, payment_hash: &[u8; 32], timeout: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(amount.to_le_bytes());
    hasher.update(expiry.to_le_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(payment_hash);
    hasher.update(timeout.to_le_bytes());
    hasher.finalize().into()
}

/// Sign a refund-auth message with the claimer's key.
pub fn sign_refund(signing_key: &SigningKey, message: &[u8; 32]) -> Signature {
    signing_key.sign(message)
}

/// Verify a refund-auth signature against the claimer's public key. The
/// refund transaction itself must separately include an on-chain Ed25519
/// verify instruction carrying the same message and signature (§4.C); that
/// instruction is built by [`crate::escrow::ChainAdapter::refund`].
pub fn verify_refund(public_key: &VerifyingKey, message: &[u8; 32], signature: &Signature) -> Result<()> {
    public_key
        .verify(message, signature)
        .map_err(|e| Error::SignatureVerification(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn init_auth_is_deterministic_for_same_inputs() {
        let signing_key = keypair();
        let message = b"deterministic-init-tx-bytes";
        let a = sign_init(&signing_key, "refund_auth", 1_700_000_300, 1000, message);
        let b = sign_init(&signing_key, "refund_auth", 1_700_000_300, 1000, message);
        assert_eq!(a.signature.signature.as_ref(), b.signature.signature.as_ref());
    }

    #[test]
    fn init_auth_rejects_timeout_too_close_to_now() {
        let signing_key = keypair();
        let public_key = signing_key.verifying_key();
        let message = b"msg";
        let auth = sign_init(&signing_key, "prefix", 100, 1000, message);
        let err = verify_init(&public_key, &auth, "prefix", message, 1000, 0, InitAuthPurpose::ClaimInitialize, None)
            .unwrap_err();
        assert!(matches!(err, Error::AuthExpired(_)));
    }

    #[test]
    fn init_auth_rejects_expired_slot_window() {
        let signing_key = keypair();
        let public_key = signing_key.verifying_key();
        let message = b"msg";
        let now = 0;
        let slot = 1000;
        let auth = sign_init(&signing_key, "prefix", now + AUTH_GRACE_PERIOD_SECS, slot, message);

        // At slot S + 152 the window (slot + 151 - 20 = slot + 131) has
        // closed, matching the literal scenario in §8 scenario 5.
        let processed_slot = slot + 152;
        let err = verify_init(
            &public_key,
            &auth,
            "prefix",
            message,
            processed_slot,
            now,
            InitAuthPurpose::ClaimInitialize,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AuthExpired(_)));
    }

    #[test]
    fn init_auth_accepts_valid_signature_within_window() {
        let signing_key = keypair();
        let public_key = signing_key.verifying_key();
        let message = b"msg";
        let now = 0;
        let slot = 1000;
        let auth = sign_init(&signing_key, "prefix", now + AUTH_GRACE_PERIOD_SECS + 1, slot, message);

        verify_init(
            &public_key,
            &auth,
            "prefix",
            message,
            slot + 10,
            now,
            InitAuthPurpose::ClaimInitialize,
            None,
        )
        .unwrap();
    }

    #[test]
    fn init_requires_claim_window_before_expiry() {
        let signing_key = keypair();
        let public_key = signing_key.verifying_key();
        let message = b"msg";
        let now = 0;
        let slot = 1000;
        let auth = sign_init(&signing_key, "prefix", now + AUTH_GRACE_PERIOD_SECS + 1, slot, message);

        let terms = EscrowTerms {
            offerer_address: "o".into(),
            claimer_address: "c".into(),
            token_address: "t".into(),
            amount: 1,
            payment_hash: [0; 32],
            sequence: 0,
            expiry: AUTH_GRACE_PERIOD_SECS, // too soon: less than grace+claim
            confirmations_required: 1,
            escrow_nonce: 0,
            pay_in: true,
            pay_out: true,
            kind: crate::types::SwapKind::Htlc,
            security_deposit: 0,
            claimer_bounty: 0,
            txo_hash: None,
        };

        let err = verify_init(
            &public_key,
            &auth,
            "prefix",
            message,
            slot + 10,
            now,
            InitAuthPurpose::Initialize,
            Some(&terms),
        )
        .unwrap_err();
        assert!(matches!(err, Error::AuthExpired(_)));
    }

    #[test]
    fn refund_auth_roundtrips() {
        let signing_key = keypair();
        let public_key = signing_key.verifying_key();
        let message = refund_auth_message("refund", 1000, 2_000_000_000, 0, &[1; 32], 1_700_000_300);
        let signature = sign_refund(&signing_key, &message);
        verify_refund(&public_key, &message, &signature).unwrap();
    }

    #[test]
    fn refund_auth_rejects_tampered_message() {
        let signing_key = keypair();
        let public_key = signing_key.verifying_key();
        let message = refund_auth_message("refund", 1000, 2_000_000_000, 0, &[1; 32], 1_700_000_300);
        let signature = sign_refund(&signing_key, &message);
        let tampered = refund_auth_message("refund", 1001, 2_000_000_000, 0, &[1; 32], 1_700_000_300);
        assert!(verify_refund(&public_key, &tampered, &signature).is_err());
    }

    #[test]
    fn finalized_slot_expiry_is_independent_of_processed() {
        assert!(!is_signature_expired(1000, 1000));
        assert!(is_signature_expired(1000, 1000 + TX_SLOT_VALIDITY));
    }
}

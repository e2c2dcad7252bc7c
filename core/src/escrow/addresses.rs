//! Deterministic address derivation for the escrow program's accounts
//! (§4.B).

use solana_sdk::pubkey::Pubkey;

const SEED_VAULT_AUTHORITY: &[u8] = b"authority";
const SEED_VAULT: &[u8] = b"vault";
const SEED_USER_VAULT: &[u8] = b"user_vault";
const SEED_ESCROW_STATE: &[u8] = b"escrow";
const SEED_TX_DATA: &[u8] = b"tx_data";

/// The escrow program's singleton vault authority PDA.
pub fn swap_vault_authority(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[SEED_VAULT_AUTHORITY], program_id)
}

/// The per-token vault PDA.
pub fn swap_vault(program_id: &Pubkey, token: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[SEED_VAULT, token.as_ref()], program_id)
}

/// The per-(user, token) LP balance and reputation PDA.
pub fn swap_user_vault(program_id: &Pubkey, user: &Pubkey, token: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[SEED_USER_VAULT, user.as_ref(), token.as_ref()], program_id)
}

/// The per-swap escrow state PDA, keyed by `payment_hash`.
pub fn swap_escrow_state(program_id: &Pubkey, payment_hash: &[u8; 32]) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[SEED_ESCROW_STATE, payment_hash], program_id)
}

/// The ephemeral scratch account used to write a Bitcoin inclusion proof
/// blob for an on-chain-proof claim, keyed by the reversed Bitcoin txid and
/// the signer that created it (§4.B "Tx-data scratch protocol").
pub fn swap_tx_data(program_id: &Pubkey, reversed_txid: &[u8; 32], signer: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[SEED_TX_DATA, reversed_txid, signer.as_ref()], program_id)
}

/// The offerer's or claimer's associated token account for `token`.
pub fn associated_token_account(owner: &Pubkey, token: &Pubkey) -> Pubkey {
    spl_associated_token_account::get_associated_token_address(owner, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escrow_state_is_deterministic_per_payment_hash() {
        let program_id = Pubkey::new_unique();
        let hash_a = [1u8; 32];
        let hash_b = [2u8; 32];

        let (a1, _) = swap_escrow_state(&program_id, &hash_a);
        let (a2, _) = swap_escrow_state(&program_id, &hash_a);
        let (b, _) = swap_escrow_state(&program_id, &hash_b);

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn tx_data_address_depends_on_signer() {
        let program_id = Pubkey::new_unique();
        let txid = [3u8; 32];
        let signer_a = Pubkey::new_unique();
        let signer_b = Pubkey::new_unique();

        let (a, _) = swap_tx_data(&program_id, &txid, &signer_a);
        let (b, _) = swap_tx_data(&program_id, &txid, &signer_b);
        assert_ne!(a, b);
    }
}

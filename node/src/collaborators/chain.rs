//! Smart-chain collaborators (§1 "the low-level smart-chain transaction
//! builder and fee estimator"): signs and submits the [`Action`]s
//! [`swap_node_core::escrow::ChainAdapter`] builds, and answers the vault
//! balance / native-transfer seams the trusted directions use directly.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use std::str::FromStr;
use std::sync::Arc;
use swap_node_core::escrow::{Action, ActionSubmitter, FeeRate, NativeTransferClient, TxStatus, TxSubmission, VaultBalance};
use swap_node_core::{Error, Result};

fn transient(collaborator: &'static str, e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Transient {
        collaborator,
        source: anyhow::Error::new(e),
    }
}

/// Signs with the intermediary's own keypair and submits via `solana-client`.
/// Fee-rate-driven compute-unit-price instructions are already embedded in
/// the [`Action`] by [`swap_node_core::escrow::SolanaEscrowAdapter`]; this
/// collaborator just adds a recent blockhash, signs, and sends.
pub struct SolanaActionSubmitter {
    rpc: Arc<RpcClient>,
    payer: Arc<Keypair>,
}

impl SolanaActionSubmitter {
    pub fn new(rpc: Arc<RpcClient>, payer: Arc<Keypair>) -> Self {
        Self { rpc, payer }
    }

    async fn build_and_send(&self, instructions: Vec<solana_sdk::instruction::Instruction>) -> Result<TxSubmission> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| transient("solana_rpc", e))?;
        let tx = Transaction::new_signed_with_payer(&instructions, Some(&self.payer.pubkey()), &[self.payer.as_ref()], blockhash);
        let signature = self
            .rpc
            .send_transaction(&tx)
            .await
            .map_err(|e| transient("solana_rpc", e))?;
        Ok(TxSubmission {
            tx_id: signature.to_string(),
            raw_tx: bincode::serialize(&tx).map_err(|e| Error::Terminal(format!("serializing transaction: {e}")))?,
        })
    }

    async fn status_of(&self, tx_id: &str) -> Result<TxStatus> {
        let signature = Signature::from_str(tx_id).map_err(|e| Error::Terminal(format!("invalid signature {tx_id}: {e}")))?;
        let statuses = self
            .rpc
            .get_signature_statuses(&[signature])
            .await
            .map_err(|e| transient("solana_rpc", e))?
            .value;
        match statuses.into_iter().next().flatten() {
            None => Ok(TxStatus::NotFound),
            Some(status) => {
                if status.err.is_some() {
                    Ok(TxStatus::Reverted)
                } else if status.satisfies_commitment(CommitmentConfig::confirmed()) {
                    Ok(TxStatus::Success)
                } else {
                    Ok(TxStatus::Pending)
                }
            }
        }
    }
}

#[async_trait]
impl ActionSubmitter for SolanaActionSubmitter {
    async fn submit(&self, action: &Action) -> Result<TxSubmission> {
        self.build_and_send(action.instructions.clone()).await
    }

    async fn tx_status(&self, tx_id: &str) -> Result<TxStatus> {
        self.status_of(tx_id).await
    }
}

/// The intermediary's own direct native-currency transfers, for the
/// FROM_BTC_LN_TRUSTED / TO_BTC_LN_TRUSTED directions, which move funds
/// without going through the escrow program at all.
pub struct SolanaNativeTransferClient {
    rpc: Arc<RpcClient>,
    payer: Arc<Keypair>,
}

impl SolanaNativeTransferClient {
    pub fn new(rpc: Arc<RpcClient>, payer: Arc<Keypair>) -> Self {
        Self { rpc, payer }
    }
}

#[async_trait]
impl NativeTransferClient for SolanaNativeTransferClient {
    async fn submit_transfer(&self, to: &str, amount: u128, _fee_rate: FeeRate) -> Result<TxSubmission> {
        let to_pubkey = Pubkey::from_str(to).map_err(|e| Error::Validation(format!("invalid destination address {to}: {e}")))?;
        let lamports: u64 = amount.try_into().map_err(|_| Error::Validation(format!("amount {amount} overflows u64 lamports")))?;
        let ix = system_instruction::transfer(&self.payer.pubkey(), &to_pubkey, lamports);

        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| transient("solana_rpc", e))?;
        let tx = Transaction::new_signed_with_payer(&[ix], Some(&self.payer.pubkey()), &[self.payer.as_ref()], blockhash);
        let signature = self
            .rpc
            .send_transaction(&tx)
            .await
            .map_err(|e| transient("solana_rpc", e))?;
        Ok(TxSubmission {
            tx_id: signature.to_string(),
            raw_tx: bincode::serialize(&tx).map_err(|e| Error::Terminal(format!("serializing transaction: {e}")))?,
        })
    }

    async fn tx_status(&self, tx_id: &str) -> Result<TxStatus> {
        let submitter = SolanaActionSubmitter::new(self.rpc.clone(), self.payer.clone());
        submitter.status_of(tx_id).await
    }
}

/// Reads the intermediary's live balance before admitting a request (§4.H
/// step 5, §5 "a fresh read before signing").
pub struct SolanaVaultBalance {
    rpc: Arc<RpcClient>,
    payer: Pubkey,
}

impl SolanaVaultBalance {
    pub fn new(rpc: Arc<RpcClient>, payer: Pubkey) -> Self {
        Self { rpc, payer }
    }
}

#[async_trait]
impl VaultBalance for SolanaVaultBalance {
    async fn balance(&self, token: &str) -> Result<u128> {
        if token.is_empty() || token == "native" {
            let lamports = self.rpc.get_balance(&self.payer).await.map_err(|e| transient("solana_rpc", e))?;
            return Ok(lamports as u128);
        }

        let mint = Pubkey::from_str(token).map_err(|e| Error::Validation(format!("invalid token mint {token}: {e}")))?;
        let ata = spl_associated_token_account::get_associated_token_address(&self.payer, &mint);
        let balance = self
            .rpc
            .get_token_account_balance(&ata)
            .await
            .map_err(|e| transient("solana_rpc", e))?;
        balance
            .amount
            .parse::<u128>()
            .map_err(|e| Error::Terminal(format!("parsing token balance {}: {e}", balance.amount)))
    }
}

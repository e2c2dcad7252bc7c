//! The tx-data scratch-account side-table (§4.B "Tx-data scratch
//! protocol").
//!
//! Every scratch account the adapter creates to hold a chunked Bitcoin
//! inclusion proof is recorded here before the creating transaction is sent,
//! so it can be swept (closed, rent reclaimed) even if the process crashes
//! before the claim completes. Per SPEC_FULL §4.B this is swept both at
//! startup and on the supervisor's periodic tick, not only "on next start".

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const FILE_NAME: &str = "scratch_accounts.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchAccountInfo {
    #[serde(with = "crate::types::hex_bytes32")]
    pub reversed_txid: [u8; 32],
    pub signer: String,
    pub created_at_unix: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScratchFile {
    accounts: BTreeMap<String, ScratchAccountInfo>,
}

/// A durable, append-mostly table of outstanding scratch accounts.
pub struct ScratchTable {
    path: PathBuf,
}

impl ScratchTable {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(FILE_NAME),
        }
    }

    async fn read(&self) -> Result<ScratchFile> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ScratchFile::default()),
            Err(e) => Err(Error::Store(format!("reading scratch table: {e}"))),
        }
    }

    async fn write(&self, file: &ScratchFile) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(file)?)
            .await
            .map_err(|e| Error::Store(format!("writing scratch table: {e}")))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Store(format!("renaming scratch table: {e}")))?;
        Ok(())
    }

    /// Record a newly created scratch account, before the creating
    /// transaction is submitted.
    pub async fn record(&self, account: Pubkey, info: ScratchAccountInfo) -> Result<()> {
        let mut file = self.read().await?;
        file.accounts.insert(account.to_string(), info);
        self.write(&file).await
    }

    /// Drop an entry once its account has been closed on chain.
    pub async fn forget(&self, account: &Pubkey) -> Result<()> {
        let mut file = self.read().await?;
        file.accounts.remove(&account.to_string());
        self.write(&file).await
    }

    /// All currently-outstanding scratch accounts, for the sweep.
    pub async fn list(&self) -> Result<Vec<(Pubkey, ScratchAccountInfo)>> {
        let file = self.read().await?;
        file.accounts
            .into_iter()
            .map(|(k, v)| {
                let pubkey: Pubkey = k
                    .parse()
                    .map_err(|_| Error::Store(format!("corrupt scratch table key {k}")))?;
                Ok((pubkey, v))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_and_forget_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let table = ScratchTable::new(dir.path());

        let account = Pubkey::new_unique();
        table
            .record(
                account,
                ScratchAccountInfo {
                    reversed_txid: [1; 32],
                    signer: "signer".to_string(),
                    created_at_unix: 1000,
                },
            )
            .await
            .unwrap();

        let listed = table.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, account);

        table.forget(&account).await.unwrap();
        assert!(table.list().await.unwrap().is_empty());
    }
}

//! Per-chain nonce tracker (§6): `<dir>/nonce.json` — `{ token: { nonce,
//! claim_nonce } }`.
//!
//! `escrow_nonce` (in [`crate::types::EscrowTerms`]) and the claim-side
//! nonce used by `ChainNonced`-kind swaps are drawn from here rather than
//! kept as module-level mutable state (§9 "Global mutable state" — re-
//! expressed as an explicit context object threaded through the
//! supervisor).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenNonces {
    pub nonce: u64,
    pub claim_nonce: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NonceFile {
    #[serde(flatten)]
    per_token: BTreeMap<String, TokenNonces>,
}

/// Durable, serialized-access allocator for escrow/claim nonces, one
/// sequence per token address.
pub struct NonceTracker {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NonceTracker {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("nonce.json"),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<NonceFile> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NonceFile::default()),
            Err(e) => Err(Error::Store(format!("reading nonce file: {e}"))),
        }
    }

    async fn write(&self, file: &NonceFile) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(file)?)
            .await
            .map_err(|e| Error::Store(format!("writing nonce file: {e}")))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Store(format!("renaming nonce file: {e}")))?;
        Ok(())
    }

    /// Allocates and returns the next escrow nonce for `token`, persisting
    /// the increment before returning so two concurrent allocations for the
    /// same token can never collide.
    pub async fn next_escrow_nonce(&self, token: &str) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let entry = file.per_token.entry(token.to_string()).or_default();
        let allocated = entry.nonce;
        entry.nonce += 1;
        self.write(&file).await?;
        Ok(allocated)
    }

    /// Allocates and returns the next claim nonce for `token`.
    pub async fn next_claim_nonce(&self, token: &str) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let entry = file.per_token.entry(token.to_string()).or_default();
        let allocated = entry.claim_nonce;
        entry.claim_nonce += 1;
        self.write(&file).await?;
        Ok(allocated)
    }

    pub async fn current(&self, token: &str) -> Result<TokenNonces> {
        let file = self.read().await?;
        Ok(file.per_token.get(token).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonces_increment_independently_per_token() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = NonceTracker::new(dir.path());

        assert_eq!(tracker.next_escrow_nonce("token-a").await.unwrap(), 0);
        assert_eq!(tracker.next_escrow_nonce("token-a").await.unwrap(), 1);
        assert_eq!(tracker.next_escrow_nonce("token-b").await.unwrap(), 0);

        let current = tracker.current("token-a").await.unwrap();
        assert_eq!(current.nonce, 2);
    }

    #[tokio::test]
    async fn claim_nonce_is_independent_of_escrow_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = NonceTracker::new(dir.path());

        tracker.next_escrow_nonce("token-a").await.unwrap();
        assert_eq!(tracker.next_claim_nonce("token-a").await.unwrap(), 0);

        let current = tracker.current("token-a").await.unwrap();
        assert_eq!(current.nonce, 1);
        assert_eq!(current.claim_nonce, 1);
    }
}

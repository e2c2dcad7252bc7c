//! Node configuration: defaults layered with an optional TOML file (§6
//! ambient stack — `config`/`toml`, the way the rest of the pack loads
//! service configuration).

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/swaps"),
        }
    }
}

/// Admission bounds and the intermediary's own on-chain identity (§4.H
/// step 2/6).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdmissionConfig {
    pub min_amount: u128,
    pub max_amount: u128,
    pub intermediary_address: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_amount: 10_000,
            max_amount: 100_000_000,
            intermediary_address: String::new(),
        }
    }
}

/// Lightning node collaborator endpoint (§4.F) — an LND-style REST proxy.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LightningConfig {
    pub rest_base_url: String,
    pub macaroon_hex: String,
}

impl Default for LightningConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://127.0.0.1:8080".to_string(),
            macaroon_hex: String::new(),
        }
    }
}

/// Smart-chain RPC endpoint and escrow program id (§4.B).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub program_id: String,
    /// Path to the intermediary's own signing keypair (Solana CLI JSON format).
    pub keypair_path: PathBuf,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            ws_url: "ws://127.0.0.1:8900".to_string(),
            program_id: String::new(),
            keypair_path: PathBuf::from("./keypair.json"),
        }
    }
}

/// Bitcoin relay / block-source endpoint (§4.E).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BtcConfig {
    pub rpc_url: String,
    pub relay_poll_secs: u64,
}

impl Default for BtcConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8332".to_string(),
            relay_poll_secs: 30,
        }
    }
}

/// Pricing collaborator (§1, §4.H step 3/4).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PriceConfig {
    pub base_url: String,
    pub swap_fee_bps: u64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://127.0.0.1:9090".to_string(),
            swap_fee_bps: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NodeConfig {
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub admission: AdmissionConfig,
    pub lightning: LightningConfig,
    pub chain: ChainConfig,
    pub btc: BtcConfig,
    pub price: PriceConfig,
}

impl NodeConfig {
    /// Layers defaults under an optional TOML file at `path` (missing file
    /// is not an error — defaults alone are a valid, if unusable-in-prod,
    /// configuration).
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let candidate = PathBuf::from(path);
        if candidate.exists() {
            tracing::info!(path, "loading node configuration");
            builder = builder.add_source(File::with_name(path.trim_end_matches(".toml")));
        } else {
            tracing::warn!(path, "no configuration file found, using defaults");
        }

        builder.build()?.try_deserialize()
    }
}

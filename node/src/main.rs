use clap::Parser;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signer::keypair::read_keypair_file;
use solana_sdk::signer::Signer;
use std::sync::Arc;
use swap_node::collaborators::chain::{SolanaNativeTransferClient, SolanaVaultBalance};
use swap_node::collaborators::lightning::LndRestAdapter;
use swap_node::collaborators::price::HttpPriceOracle;
use swap_node::config::NodeConfig;
use swap_node::http::{self, NodeSupervisor};
use swap_node::logging;
use swap_node_core::state_machines::{LeaseRegistry, SystemClock};
use swap_node_core::store::SwapStore;
use swap_node_core::supervisor::TokenBounds;
use tracing::{error, info};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "BTC <-> smart-chain intermediary node", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.debug);

    let config = NodeConfig::load(&args.config).unwrap_or_else(|e| {
        eprintln!("failed to load configuration: {e}");
        std::process::exit(1);
    });

    info!(addr = %config.http.listen_addr, "starting swap-node");

    let keypair = read_keypair_file(&config.chain.keypair_path)
        .map_err(|e| anyhow::anyhow!("reading keypair at {}: {e}", config.chain.keypair_path.display()))?;
    info!(pubkey = %keypair.pubkey(), "loaded intermediary signing key");
    let payer = Arc::new(keypair);

    let rpc = Arc::new(RpcClient::new_with_commitment(config.chain.rpc_url.clone(), CommitmentConfig::confirmed()));

    let ln = Arc::new(LndRestAdapter::new(config.lightning.rest_base_url.clone(), config.lightning.macaroon_hex.clone()));
    let transfer = Arc::new(SolanaNativeTransferClient::new(rpc.clone(), payer.clone()));
    let vault = Arc::new(SolanaVaultBalance::new(rpc.clone(), payer.pubkey()));
    let price = Arc::new(HttpPriceOracle::new(config.price.base_url.clone(), config.price.swap_fee_bps));

    let store = Arc::new(SwapStore::new(config.store.dir.clone()));
    store.init().await?;

    let leases = Arc::new(LeaseRegistry::new());
    let clock = Arc::new(SystemClock) as Arc<dyn swap_node_core::state_machines::Clock>;
    let bounds = TokenBounds {
        min_amount: config.admission.min_amount,
        max_amount: config.admission.max_amount,
    };

    let supervisor = Arc::new(NodeSupervisor::new(
        store,
        ln,
        transfer,
        vault,
        price,
        leases,
        clock,
        bounds,
        config.admission.intermediary_address.clone(),
    ));

    supervisor.start().await?;

    let tick_supervisor = supervisor.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Err(e) = tick_supervisor.tick().await {
                error!(error = %e, "periodic tick failed");
            }
        }
    });

    let addr = config
        .http
        .listen_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {}: {e}", config.http.listen_addr))?;
    http::serve(supervisor, addr).await
}

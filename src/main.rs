// sol-lp-agent - Autonomous WSOL liquidity-provision agent for
// constant-product AMM pools: discover, screen, score, enter, monitor, exit.

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use solana_sdk::signer::Signer;
use tokio::sync::watch;

mod amm_state;
mod backend;
mod blacklist;
mod config;
mod display;
mod errors;
mod exit_evaluator;
mod external_apis;
mod positions;
mod price_oracle;
mod recovery;
mod safety_screen;
mod scheduler;
mod scorer;
mod wallet;

use backend::{ExecutionBackend, LiveBackend, SimulatedBackend};
use config::Config;
use external_apis::{FiatPriceClient, PoolDirectory, TokenSafetyClient};
use positions::StatePaths;
use price_oracle::{lamports_to_sol, PriceOracle};
use safety_screen::SafetyScreen;
use scheduler::Engine;

const EXIT_CODE_CONFIG: i32 = 1;
const EXIT_CODE_KEYSTORE: i32 = 2;
const EXIT_CODE_BACKEND: i32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("💧 sol-lp-agent starting");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_CODE_CONFIG);
        }
    };
    info!(
        "⚙️ trading={} dry_run={} max_positions={} stop_loss={:.1}% take_profit={:.1}%",
        config.trading_enabled,
        config.dry_run,
        config.max_concurrent_positions,
        config.stop_loss_pct,
        config.take_profit_pct
    );

    let paths = StatePaths::in_dir(&config.state_dir);

    let backend: Arc<dyn ExecutionBackend> = if config.dry_run {
        info!("🧪 Dry-run mode: simulated backend, no real transactions");
        Arc::new(SimulatedBackend::with_price_walk())
    } else {
        let keypair = match wallet::load_keypair(&config.wallet_keypair_path) {
            Ok(keypair) => keypair,
            Err(e) => {
                error!("{}", e);
                std::process::exit(EXIT_CODE_KEYSTORE);
            }
        };
        Arc::new(LiveBackend::new(
            &config.rpc_url,
            keypair.pubkey(),
            config.executor_cmd.clone(),
            config.backend_timeout(),
        ))
    };

    // Startup probe; the backend retries transients internally, so a
    // failure here means the RPC endpoint is genuinely unreachable.
    match backend.native_balance().await {
        Ok(lamports) => info!("💰 Wallet balance: {} SOL", lamports_to_sol(lamports as u128)),
        Err(e) => {
            error!("backend unreachable at startup: {}", e);
            std::process::exit(EXIT_CODE_BACKEND);
        }
    }

    let directory = Arc::new(PoolDirectory::new());
    let oracle = Arc::new(PriceOracle::new(FiatPriceClient::new(
        config.coingecko_api_key.clone(),
    )));
    let safety = Arc::new(SafetyScreen::new(TokenSafetyClient::new()));

    let engine_state = match recovery::run_recovery(&config, &backend, &directory, &paths).await {
        Ok(engine_state) => engine_state,
        Err(e) => {
            error!("startup reconciliation failed: {}", e);
            std::process::exit(EXIT_CODE_BACKEND);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown requested; workers will finish their current iteration");
            let _ = stop_tx.send(true);
        }
    });

    let engine = Engine::new(
        config,
        engine_state,
        backend,
        oracle,
        directory,
        safety,
        paths,
        stop_rx,
    );
    engine.run().await
}

// Startup reconciliation, run synchronously before any worker starts:
// rehydrate persisted state, let the operator choose to keep tracking or
// force-close, unwrap native dust, sell orphan tokens left behind by a
// failed exit, close ghost positions, and reclaim rent from empty token
// accounts.

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use rust_decimal::Decimal;

use crate::backend::{ExecutionBackend, SwapDirection};
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::errors::EngineError;
use crate::external_apis::{PoolDirectory, WSOL_MINT};
use crate::positions::{
    append_trade, load_state, save_state, ClosedTrade, ExitReason, Position, PositionStore,
    StatePaths,
};
use crate::price_oracle::lamports_to_sol;
use crate::scheduler::EngineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorChoice {
    Track,
    CloseAll,
}

fn ask_operator(open_count: usize) -> OperatorChoice {
    print!(
        "Restored {} open position(s). [t]rack them or [c]lose all now? [t] ",
        open_count
    );
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_ok()
        && line.trim().eq_ignore_ascii_case("c")
    {
        OperatorChoice::CloseAll
    } else {
        OperatorChoice::Track
    }
}

pub async fn run_recovery(
    config: &Config,
    backend: &Arc<dyn ExecutionBackend>,
    directory: &PoolDirectory,
    paths: &StatePaths,
) -> Result<EngineState, EngineError> {
    info!("🔄 Startup reconciliation");

    let mut store = PositionStore::new();
    let mut blacklist = Blacklist::new();
    if let Some(app_state) = load_state(paths)? {
        blacklist = Blacklist::restore(app_state.cooldowns, app_state.blacklist);
        store.restore(app_state.open_positions)?;
    }

    let choice = if store.open_count() == 0 || config.recovery_auto || !io::stdin().is_terminal()
    {
        OperatorChoice::Track
    } else {
        ask_operator(store.open_count())
    };

    let flows = config.dry_run || config.trading_enabled;
    let now = Utc::now();

    // 1. Unwrap any wrapped-native dust back to SOL.
    if flows {
        match backend.unwrap_native().await {
            Ok(amount) if amount > Decimal::ZERO => {
                info!("💧 Unwrapped {:.6} SOL of wrapped dust", amount);
            }
            Ok(_) => {}
            Err(e) => warn!("unwrap during recovery failed: {}", e),
        }
    }

    // 2. Ghost check over every restored position: two bulk reads total.
    let restored = store.open_positions();
    if !restored.is_empty() {
        let pairs: Vec<(String, String)> = restored
            .iter()
            .map(|p| (p.pool_id.clone(), p.lp_mint.clone()))
            .collect();
        match backend.lp_value_batch(&pairs).await {
            Ok(valuations) => {
                for position in &restored {
                    let ghost = valuations
                        .get(&position.pool_id)
                        .map(|v| v.lp_balance_raw == 0)
                        .unwrap_or(false);
                    if ghost {
                        warn!(
                            "👻 {} has zero LP on chain; closing as ghost",
                            position.pool_id
                        );
                        if let Some(taken) = store.begin_close(&position.position_id) {
                            let trade =
                                ClosedTrade::new(taken, now, Decimal::ZERO, ExitReason::Ghost);
                            store.record_closed(&trade);
                            blacklist.record_exit(
                                &position.pool_id,
                                ExitReason::Ghost,
                                now,
                                &config.cooldown_tiers_sec,
                                config.permanent_blacklist_strikes,
                            );
                            if let Err(e) = append_trade(paths, &trade) {
                                warn!("trade log append failed: {}", e);
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("ghost check skipped, valuation failed: {}", e),
        }
    }

    // 3. Sell orphan tokens: anything held that is neither WSOL nor part of
    // a tracked position points at an exit that died halfway.
    if flows {
        sweep_orphans(config, backend, directory, &store).await;
    }

    // 4. Operator asked for a clean slate: close everything that survived
    // the ghost check.
    if choice == OperatorChoice::CloseAll && flows {
        for position in store.open_positions() {
            info!("🔒 Force-closing {} on operator request", position.pool_id);
            let exit_value = match close_position(config, backend, &position).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("force-close failed for {}: {}", position.pool_id, e);
                    continue;
                }
            };
            if let Some(taken) = store.begin_close(&position.position_id) {
                let trade = ClosedTrade::new(taken, now, exit_value, ExitReason::Manual);
                store.record_closed(&trade);
                blacklist.record_exit(
                    &position.pool_id,
                    ExitReason::Manual,
                    now,
                    &config.cooldown_tiers_sec,
                    config.permanent_blacklist_strikes,
                );
                if let Err(e) = append_trade(paths, &trade) {
                    warn!("trade log append failed: {}", e);
                }
            }
        }
    }

    // 5. Reclaim rent, keeping accounts for mints still in play.
    if flows {
        let mut keep: Vec<String> = vec![WSOL_MINT.to_string()];
        for position in store.open_positions() {
            keep.push(position.token_mint.clone());
            keep.push(position.lp_mint.clone());
        }
        match backend.close_empty_accounts(&keep).await {
            Ok((closed, rent)) if closed > 0 => {
                info!("🧹 Closed {} empty accounts, reclaimed {:.6} SOL", closed, rent);
            }
            Ok(_) => {}
            Err(e) => warn!("account cleanup failed: {}", e),
        }
    }

    let mut state = EngineState::new(store, blacklist);
    state.wallet_sol = match backend.native_balance().await {
        Ok(lamports) => lamports_to_sol(lamports as u128),
        Err(e) => {
            warn!("wallet balance read failed during recovery: {}", e);
            Decimal::ZERO
        }
    };

    save_state(paths, &state.to_app_state(now))?;
    info!(
        "✅ Reconciliation done: {} live positions, {} banned pools",
        state.store.open_count(),
        state.blacklist.banned_count()
    );
    Ok(state)
}

/// Sells every non-WSOL holding that no tracked position accounts for.
/// The pool for each orphan mint is looked up in the directory; tokens
/// with no WSOL pool stay put and are reported.
async fn sweep_orphans(
    config: &Config,
    backend: &Arc<dyn ExecutionBackend>,
    directory: &PoolDirectory,
    store: &PositionStore,
) {
    let holdings = match backend.list_tokens().await {
        Ok(holdings) => holdings,
        Err(e) => {
            warn!("orphan sweep skipped, token listing failed: {}", e);
            return;
        }
    };

    let tracked: Vec<String> = store
        .open_positions()
        .iter()
        .flat_map(|p| [p.token_mint.clone(), p.lp_mint.clone()])
        .collect();
    let orphans: Vec<(String, u64)> = holdings
        .into_iter()
        .filter(|(mint, raw)| *raw > 0 && mint != WSOL_MINT && !tracked.contains(mint))
        .collect();
    if orphans.is_empty() {
        return;
    }

    let pools = match directory.list_wsol_pools().await {
        Ok(pools) => pools,
        Err(e) => {
            warn!("orphan sweep skipped, pool listing failed: {}", e);
            return;
        }
    };

    for (mint, raw) in orphans {
        let pool = pools.iter().find(|p| p.risk_mint() == mint);
        match pool {
            Some(pool) => {
                info!("🧹 Selling orphan balance of {} ({} raw)", mint, raw);
                if let Err(e) = backend
                    .swap(&pool.pool_id, 0, config.slippage_pct, SwapDirection::Sell)
                    .await
                {
                    warn!("orphan sell failed for {}: {}", mint, e);
                }
            }
            None => warn!("no WSOL pool found for orphan mint {}; leaving it", mint),
        }
    }
}

async fn close_position(
    config: &Config,
    backend: &Arc<dyn ExecutionBackend>,
    position: &Position,
) -> Result<Decimal, EngineError> {
    let before = backend.native_balance().await?;
    backend
        .remove_liquidity(&position.pool_id, config.slippage_pct)
        .await?;
    if let Err(e) = backend
        .swap(&position.pool_id, 0, config.slippage_pct, SwapDirection::Sell)
        .await
    {
        warn!("token leg sell failed for {}: {}", position.pool_id, e);
    }
    let after = backend.native_balance().await?;
    Ok(lamports_to_sol(after.saturating_sub(before) as u128))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimPool, SimulatedBackend};
    use crate::config::SCHEMA_VERSION;
    use crate::positions::AppState;
    use crate::price_oracle::PoolReserves;
    use uuid::Uuid;

    fn test_paths() -> StatePaths {
        let dir = std::env::temp_dir().join(format!("lp-agent-recovery-{}", Uuid::new_v4()));
        StatePaths::in_dir(dir.to_str().unwrap())
    }

    fn sim_pool(lp_mint: &str, token_mint: &str) -> SimPool {
        SimPool {
            reserves: PoolReserves {
                base_vault: 50_000_000_000,
                quote_vault: 100_000_000_000,
                base_open_orders: 0,
                quote_open_orders: 0,
                base_need_take_pnl: 0,
                quote_need_take_pnl: 0,
                lp_circulating: 10_000_000_000,
                base_decimals: 6,
                quote_decimals: 9,
                base_is_wsol: false,
            },
            lp_mint: lp_mint.to_string(),
            token_mint: token_mint.to_string(),
        }
    }

    fn position(pool_id: &str, lp_mint: &str, token_mint: &str, lp_raw: u64) -> Position {
        Position::new(
            pool_id.to_string(),
            lp_mint.to_string(),
            token_mint.to_string(),
            "TKN".to_string(),
            1.0,
            Decimal::ONE,
            lp_raw,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn restart_recovery_full_scenario() {
        let paths = test_paths();
        let config = Config::default(); // dry-run on -> flows enabled

        let backend = Arc::new(SimulatedBackend::new());
        backend.seed_pool("pool-live", sim_pool("lp-live", "tok-live")).await;
        backend.seed_pool("pool-ghost", sim_pool("lp-ghost", "tok-ghost")).await;
        backend.set_lp_balance("lp-live", 5_000_000).await;
        backend.set_lp_balance("lp-ghost", 0).await;
        // wrapped dust + an empty account to clean up
        backend.set_wsol(500_000_000).await;
        backend.add_empty_account("stale-mint").await;

        let state = AppState {
            schema_version: SCHEMA_VERSION,
            open_positions: vec![
                position("pool-live", "lp-live", "tok-live", 5_000_000),
                position("pool-ghost", "lp-ghost", "tok-ghost", 7_000_000),
            ],
            cooldowns: vec![],
            blacklist: vec![],
            last_saved_at: Utc::now(),
        };
        save_state(&paths, &state).unwrap();

        let backend_dyn: Arc<dyn ExecutionBackend> = backend.clone();
        let engine_state = run_recovery(&config, &backend_dyn, &PoolDirectory::new(), &paths)
            .await
            .unwrap();

        // one live position survives, the ghost is closed and banned
        assert_eq!(engine_state.store.open_count(), 1);
        assert!(engine_state.store.has_pool("pool-live"));
        assert!(engine_state.blacklist.is_banned("pool-ghost"));
        // wrapped dust was unwrapped
        assert_eq!(backend.balance(WSOL_MINT).await.unwrap(), 0);
        // the stale empty account is gone
        let (closed_again, _) = backend.close_empty_accounts(&[]).await.unwrap();
        assert_eq!(closed_again, 0);
        // persisted state reflects the reconciliation
        let reloaded = load_state(&paths).unwrap().unwrap();
        assert_eq!(reloaded.open_positions.len(), 1);
        assert_eq!(reloaded.blacklist.len(), 1);
        // the ghost close reached the trade log
        let log = std::fs::read_to_string(&paths.trade_log).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("GHOST"));
    }

    #[tokio::test]
    async fn orphan_token_from_failed_exit_is_sold() {
        let paths = test_paths();
        let config = Config::default();

        let backend = Arc::new(SimulatedBackend::new());
        backend.seed_pool("pool-orphan", sim_pool("lp-orphan", "tok-orphan")).await;
        // leftover token balance from an exit that died after remove-liquidity
        backend.set_token_balance("tok-orphan", 2_000_000).await;

        let listing = vec![crate::external_apis::Pool {
            pool_id: "pool-orphan".into(),
            lp_mint: "lp-orphan".into(),
            base_mint: "tok-orphan".into(),
            quote_mint: WSOL_MINT.into(),
            base_symbol: "ORP".into(),
            quote_symbol: "WSOL".into(),
            base_decimals: 6,
            quote_decimals: 9,
            tvl_usd: 50_000.0,
            volume_24h_usd: 10_000.0,
            apr_24h_pct: 12.0,
            burn_pct: 80.0,
            fee_tier_bps: 25,
        }];
        let directory = PoolDirectory::with_cached_listing(listing);

        let backend_dyn: Arc<dyn ExecutionBackend> = backend.clone();
        run_recovery(&config, &backend_dyn, &directory, &paths)
            .await
            .unwrap();

        assert_eq!(backend.balance("tok-orphan").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recovery_with_no_state_file_starts_clean() {
        let paths = test_paths();
        let config = Config::default();
        let backend: Arc<dyn ExecutionBackend> = Arc::new(SimulatedBackend::new());
        let engine_state = run_recovery(&config, &backend, &PoolDirectory::new(), &paths)
            .await
            .unwrap();
        assert_eq!(engine_state.store.open_count(), 0);
        assert_eq!(engine_state.blacklist.banned_count(), 0);
    }
}

// The position-management engine: four cooperating workers over one shared
// state region guarded by a single mutex.
//
//   display          every DISPLAY_SEC      snapshot + render, no backend
//   position-update  every POSITION_CHECK_SEC  batch valuation -> exits
//   pool-scan        every POOL_SCAN_SEC    directory -> screen -> score
//   entry-worker     on demand              drains the entry buffer serially
//
// Sells fan out in parallel (independent positions cannot fail each other);
// entries stay sequential because concurrent add-liquidity calls compete
// for the same wallet reserve. The mutex guards state reads/writes only —
// every backend and HTTP call is issued with the lock released. Hard
// timeouts and transient retries live inside the backend implementations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Mutex};

use crate::backend::{ExecutionBackend, SwapDirection};
use crate::blacklist::Blacklist;
use crate::config::{Config, SCHEMA_VERSION};
use crate::display::{self, DisplaySnapshot};
use crate::errors::EngineError;
use crate::exit_evaluator::{self, ExitDecision};
use crate::external_apis::{Pool, PoolDirectory};
use crate::positions::{
    append_trade, save_state, AppState, ClosedTrade, ExitReason, Position, PositionStore,
    StatePaths,
};
use crate::price_oracle::{lamports_to_sol, sol_to_lamports, PriceOracle};
use crate::safety_screen::SafetyScreen;
use crate::scorer::{self, Score};

const ENTRY_QUEUE_CAP: usize = 8;
const EVENT_FEED_CAP: usize = 20;

pub const EXIT_CODE_INVARIANT: i32 = 4;

// ============================================================================
// SHARED STATE
// ============================================================================

/// Everything the workers share, owned by one mutex.
pub struct EngineState {
    pub store: PositionStore,
    pub blacklist: Blacklist,
    pub wallet_sol: Decimal,
    pub sol_usd: Option<f64>,
    pub scans_completed: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub recent_events: VecDeque<String>,
}

impl EngineState {
    pub fn new(store: PositionStore, blacklist: Blacklist) -> Self {
        Self {
            store,
            blacklist,
            wallet_sol: Decimal::ZERO,
            sol_usd: None,
            scans_completed: 0,
            last_scan_at: None,
            recent_events: VecDeque::new(),
        }
    }

    pub fn push_event(&mut self, event: String) {
        info!("{}", event);
        self.recent_events.push_back(event);
        while self.recent_events.len() > EVENT_FEED_CAP {
            self.recent_events.pop_front();
        }
    }

    pub fn to_app_state(&self, now: DateTime<Utc>) -> AppState {
        AppState {
            schema_version: SCHEMA_VERSION,
            open_positions: self.store.open_positions(),
            cooldowns: self.blacklist.cooldown_entries(),
            blacklist: self.blacklist.blacklist_entries(),
            last_saved_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntryCandidate {
    pub pool: Pool,
    pub score: Score,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct Engine {
    pub config: Config,
    pub state: Arc<Mutex<EngineState>>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub oracle: Arc<PriceOracle>,
    pub directory: Arc<PoolDirectory>,
    pub safety: Arc<SafetyScreen>,
    pub paths: StatePaths,
    stop: watch::Receiver<bool>,
    in_flight_sells: AtomicUsize,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        state: EngineState,
        backend: Arc<dyn ExecutionBackend>,
        oracle: Arc<PriceOracle>,
        directory: Arc<PoolDirectory>,
        safety: Arc<SafetyScreen>,
        paths: StatePaths,
        stop: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Arc::new(Mutex::new(state)),
            backend,
            oracle,
            directory,
            safety,
            paths,
            stop,
            in_flight_sells: AtomicUsize::new(0),
        })
    }

    /// Entries and exits run only with trading on or in dry-run mode (the
    /// backend is simulated there). With both off the agent observes only.
    fn flows_enabled(&self) -> bool {
        self.config.dry_run || self.config.trading_enabled
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let (entry_tx, entry_rx) = mpsc::channel::<EntryCandidate>(ENTRY_QUEUE_CAP);

        info!("🚀 Starting engine workers");
        let handles = vec![
            tokio::spawn(self.clone().display_loop()),
            tokio::spawn(self.clone().position_update_loop()),
            tokio::spawn(self.clone().pool_scan_loop(entry_tx)),
            tokio::spawn(self.clone().entry_loop(entry_rx)),
        ];

        futures_util::future::join_all(handles).await;

        // Let in-flight sells confirm before the final snapshot.
        while self.in_flight_sells.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.snapshot().await;
        info!("👋 Engine stopped; open positions remain tracked on disk");
        Ok(())
    }

    /// Serializes under the lock, writes with the lock released.
    pub async fn snapshot(&self) {
        let app_state = {
            let state = self.state.lock().await;
            state.to_app_state(Utc::now())
        };
        if let Err(e) = save_state(&self.paths, &app_state) {
            error!("failed to persist state: {}", e);
        }
    }

    fn fatal(&self, err: &EngineError) -> ! {
        error!("💀 {}; persisting state and exiting", err);
        let app_state = {
            // best effort from a sync context: try_lock is fine, the worker
            // that found the violation is the one holding nothing here
            match self.state.try_lock() {
                Ok(state) => Some(state.to_app_state(Utc::now())),
                Err(_) => None,
            }
        };
        if let Some(app_state) = app_state {
            let _ = save_state(&self.paths, &app_state);
        }
        std::process::exit(EXIT_CODE_INVARIANT);
    }

    // ========================================================================
    // DISPLAY WORKER
    // ========================================================================

    async fn display_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.display_period());
        let mut stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = {
                        let state = self.state.lock().await;
                        DisplaySnapshot {
                            now: Utc::now(),
                            trading_enabled: self.config.trading_enabled,
                            dry_run: self.config.dry_run,
                            wallet_sol: state.wallet_sol,
                            sol_usd: state.sol_usd,
                            open_positions: state.store.open_positions(),
                            in_flight_sells: self.in_flight_sells.load(Ordering::SeqCst),
                            trades_closed: state.store.trades_closed,
                            realized_pnl_sol: state.store.realized_pnl_sol,
                            banned_pools: state.blacklist.banned_count(),
                            cooling_pools: state.blacklist.cooling_count(Utc::now()),
                            scans_completed: state.scans_completed,
                            last_scan_at: state.last_scan_at,
                            recent_events: state.recent_events.iter().cloned().collect(),
                        }
                    };
                    display::render(&snapshot);
                }
                // Display exits immediately; it owns nothing in flight.
                _ = stop.changed() => break,
            }
        }
    }

    // ========================================================================
    // POSITION-UPDATE WORKER
    // ========================================================================

    async fn position_update_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.position_check_period());
        let mut stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.clone().update_positions_once().await {
                        if e.is_fatal() {
                            self.fatal(&e);
                        }
                        warn!("position update tick failed: {}", e);
                    }
                }
                _ = stop.changed() => break,
            }
        }
        self.snapshot().await;
    }

    /// One position-update tick: batch valuation, metric refresh, exit
    /// arbitration, parallel sell dispatch.
    pub async fn update_positions_once(self: Arc<Self>) -> Result<(), EngineError> {
        let positions = {
            let state = self.state.lock().await;
            state.store.open_positions()
        };
        if positions.is_empty() {
            return Ok(());
        }

        let pairs: Vec<(String, String)> = positions
            .iter()
            .map(|p| (p.pool_id.clone(), p.lp_mint.clone()))
            .collect();
        let valuations = self.backend.lp_value_batch(&pairs).await?;

        let now = Utc::now();
        let mut exits: Vec<(Position, ExitReason)> = Vec::new();
        let mut ratios: Vec<(String, f64)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            for position in &positions {
                let valuation = match valuations.get(&position.pool_id) {
                    Some(valuation) => valuation,
                    // A pool missing from the batch is a transient read
                    // problem, not a ghost; skip it this tick.
                    None => continue,
                };
                let pnl = exit_evaluator::pnl_pct(position.entry_amount_sol, valuation.value_sol);
                let il = exit_evaluator::il_pct(position.entry_price_ratio, valuation.price_ratio);
                state.store.update_metrics(
                    &position.position_id,
                    valuation.value_sol,
                    valuation.price_ratio,
                    pnl,
                    il,
                    now,
                );
                ratios.push((position.pool_id.clone(), valuation.price_ratio));

                let updated = match state.store.get(&position.position_id) {
                    Some(updated) => updated.clone(),
                    None => continue,
                };
                match exit_evaluator::evaluate(
                    &updated,
                    valuation.lp_balance_raw,
                    now,
                    &self.config,
                ) {
                    ExitDecision::Hold => {}
                    ExitDecision::Exit(reason) => {
                        if reason != ExitReason::Ghost && !self.flows_enabled() {
                            debug!(
                                "exit {} signalled for {} but trading is disabled",
                                reason, updated.pool_id
                            );
                            continue;
                        }
                        // Remove from the open set before dispatch: no other
                        // worker may observe this position as open once its
                        // sell is in flight.
                        if let Some(taken) = state.store.begin_close(&updated.position_id) {
                            exits.push((taken, reason));
                        }
                    }
                }
            }
        }

        for (pool_id, ratio) in ratios {
            self.oracle.record_ratio(&pool_id, now.timestamp(), ratio).await;
        }

        for (position, reason) in exits {
            self.in_flight_sells.fetch_add(1, Ordering::SeqCst);
            let engine = self.clone();
            tokio::spawn(async move {
                engine.clone().execute_exit(position, reason).await;
                engine.in_flight_sells.fetch_sub(1, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    /// Runs one exit to completion. The position is already out of the open
    /// set; a failed sell puts it back (still-open until the chain confirms
    /// otherwise).
    async fn execute_exit(self: Arc<Self>, position: Position, reason: ExitReason) {
        let exit_value = if reason == ExitReason::Ghost {
            // Nothing left to sell; the pool is gone.
            Decimal::ZERO
        } else {
            match self.sell_position(&position).await {
                Ok(value) => value,
                Err(e) => {
                    error!(
                        "sell failed for {} ({}); keeping position open: {}",
                        position.pool_id, reason, e
                    );
                    let mut state = self.state.lock().await;
                    if state.store.open(position.clone()).is_ok() {
                        state.push_event(format!(
                            "⚠️ sell failed for {}; position restored",
                            position.token_symbol
                        ));
                    }
                    return;
                }
            }
        };
        self.finalize_exit(position, reason, exit_value).await;
    }

    async fn sell_position(&self, position: &Position) -> Result<Decimal, EngineError> {
        let before = self.backend.native_balance().await?;
        self.backend
            .remove_liquidity(&position.pool_id, self.config.slippage_pct)
            .await?;
        // Sell the token leg back to native. A failure here is not fatal to
        // the close: the orphan sweep picks the token up at next startup.
        if let Err(e) = self
            .backend
            .swap(&position.pool_id, 0, self.config.slippage_pct, SwapDirection::Sell)
            .await
        {
            warn!(
                "token leg sell failed for {} (will be swept at restart): {}",
                position.pool_id, e
            );
        }
        let after = self.backend.native_balance().await?;
        Ok(lamports_to_sol(after.saturating_sub(before) as u128))
    }

    async fn finalize_exit(&self, position: Position, reason: ExitReason, exit_value: Decimal) {
        let now = Utc::now();
        let pool_id = position.pool_id.clone();
        let trade = ClosedTrade::new(position, now, exit_value, reason);

        let app_state = {
            let mut state = self.state.lock().await;
            state.store.record_closed(&trade);
            state.blacklist.record_exit(
                &pool_id,
                reason,
                now,
                &self.config.cooldown_tiers_sec,
                self.config.permanent_blacklist_strikes,
            );
            state.blacklist.prune(now);
            state.push_event(format!(
                "💰 Closed {} [{}] {:+.2}% -> {:.4} SOL",
                trade.position.token_symbol, reason, trade.realized_pnl_pct, exit_value
            ));
            state.to_app_state(now)
        };

        if let Err(e) = save_state(&self.paths, &app_state) {
            error!("failed to persist state after exit: {}", e);
        }
        if let Err(e) = append_trade(&self.paths, &trade) {
            error!("failed to append trade log: {}", e);
        }
        self.oracle.forget_pool(&pool_id).await;
    }

    // ========================================================================
    // POOL-SCAN WORKER
    // ========================================================================

    async fn pool_scan_loop(self: Arc<Self>, entry_tx: mpsc::Sender<EntryCandidate>) {
        let mut interval = tokio::time::interval(self.config.pool_scan_period());
        let mut stop = self.stop.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once(&entry_tx).await {
                        if e.is_fatal() {
                            self.fatal(&e);
                        }
                        warn!("pool scan failed: {}", e);
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    /// One scan cycle: directory, threshold prefilter, eligibility, safety
    /// screen, scoring, then enqueue onto the bounded entry buffer.
    pub async fn scan_once(
        &self,
        entry_tx: &mpsc::Sender<EntryCandidate>,
    ) -> Result<(), EngineError> {
        let pools = self.directory.list_wsol_pools().await?;

        // Ambient refreshes ride the scan tick: fiat price and wallet level.
        let sol_usd = self.oracle.sol_usd().await.ok();
        let wallet_sol = match self.backend.native_balance().await {
            Ok(lamports) => lamports_to_sol(lamports as u128),
            Err(e) => {
                warn!("wallet balance read failed: {}", e);
                self.state.lock().await.wallet_sol
            }
        };

        let now = Utc::now();
        let mut admitted: Vec<EntryCandidate> = Vec::new();
        let mut rejected = 0usize;

        for pool in &pools {
            if self.stopped() {
                break;
            }
            {
                let state = self.state.lock().await;
                if state.store.has_pool(&pool.pool_id)
                    || !state.blacklist.is_eligible(&pool.pool_id, now)
                {
                    continue;
                }
            }
            if let Some(reason) = scorer::prefilter(pool, &self.config) {
                debug!("prefilter dropped {}: {}", pool.pool_id, reason);
                continue;
            }

            match self
                .safety
                .screen(pool, self.backend.as_ref(), &self.config)
                .await
            {
                Ok(report) if report.passed() => {
                    let il_factor = self.oracle.il_safety_factor(&pool.pool_id).await;
                    let mut score = scorer::score_pool(pool, il_factor);
                    score.sized_amount_sol = scorer::size_position(
                        score.score,
                        pool.tvl_usd,
                        wallet_sol,
                        &self.config,
                    );
                    admitted.push(EntryCandidate {
                        pool: pool.clone(),
                        score,
                    });
                }
                Ok(report) => {
                    rejected += 1;
                    info!(
                        "🛑 {} ({}) rejected: {}",
                        pool.pool_id,
                        pool.risk_symbol(),
                        report.reasons.join("; ")
                    );
                }
                Err(e) => {
                    warn!("safety screen failed for {}: {}", pool.pool_id, e);
                }
            }
        }

        admitted.sort_by(|a, b| {
            b.score
                .score
                .partial_cmp(&a.score.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut enqueued = 0usize;
        {
            let mut state = self.state.lock().await;
            state.wallet_sol = wallet_sol;
            state.sol_usd = sol_usd;
            state.scans_completed += 1;
            state.last_scan_at = Some(now);

            let queued = ENTRY_QUEUE_CAP - entry_tx.capacity();
            let slots = self
                .config
                .max_concurrent_positions
                .saturating_sub(state.store.open_count() + queued);
            for candidate in admitted.iter().take(slots) {
                match entry_tx.try_send(candidate.clone()) {
                    Ok(()) => enqueued += 1,
                    Err(_) => break,
                }
            }
            state.push_event(format!(
                "🔍 Scan: {} pools, {} admitted, {} rejected, {} queued",
                pools.len(),
                admitted.len(),
                rejected,
                enqueued
            ));
        }
        Ok(())
    }

    // ========================================================================
    // ENTRY WORKER
    // ========================================================================

    async fn entry_loop(self: Arc<Self>, mut entry_rx: mpsc::Receiver<EntryCandidate>) {
        let mut stop = self.stop.clone();
        loop {
            tokio::select! {
                candidate = entry_rx.recv() => {
                    match candidate {
                        Some(candidate) => {
                            // Entries run strictly one at a time.
                            if let Err(e) = self.clone().try_enter(candidate).await {
                                if e.is_fatal() {
                                    self.fatal(&e);
                                }
                                warn!("entry failed: {}", e);
                            }
                        }
                        None => break,
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    /// Opens one position: half the size swaps into the token, the rest
    /// pairs into the pool, then the fresh LP balance is read back off
    /// chain and recorded.
    pub async fn try_enter(self: Arc<Self>, candidate: EntryCandidate) -> Result<(), EngineError> {
        let pool = &candidate.pool;
        let sized = candidate.score.sized_amount_sol;
        let now = Utc::now();

        let sol_usd = {
            // Conditions may have shifted since the scan; re-check at
            // dequeue time.
            let state = self.state.lock().await;
            if state.store.has_pool(&pool.pool_id) {
                return Ok(());
            }
            if !state.blacklist.is_eligible(&pool.pool_id, now) {
                debug!("{} became ineligible while queued", pool.pool_id);
                return Ok(());
            }
            if state.store.open_count() >= self.config.max_concurrent_positions {
                debug!("at position capacity; dropping {}", pool.pool_id);
                return Ok(());
            }
            state.sol_usd
        };

        if !self.flows_enabled() {
            debug!("trading disabled; skipping entry into {}", pool.pool_id);
            return Ok(());
        }

        self.backend.ensure_pool(pool, sol_usd).await?;

        let buy_lamports = sol_to_lamports(sized) / 2;
        if buy_lamports == 0 {
            return Err(EngineError::Validation(format!(
                "sized amount {} too small to split",
                sized
            )));
        }

        self.backend
            .swap(
                &pool.pool_id,
                buy_lamports,
                self.config.slippage_pct,
                SwapDirection::Buy,
            )
            .await?;

        let outcome = match self
            .backend
            .add_liquidity(&pool.pool_id, self.config.slippage_pct)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Funds moved in the swap but the deposit failed: surface
                // the intermediate state; the restart sweep sells the token.
                let mut state = self.state.lock().await;
                state.push_event(format!(
                    "⚠️ Entry into {} half-completed; token will be swept at restart",
                    pool.risk_symbol()
                ));
                return Err(e);
            }
        };

        let valuation = self
            .backend
            .lp_value(&pool.pool_id, &outcome.lp_mint)
            .await?;
        if valuation.lp_balance_raw == 0 {
            return Err(EngineError::BackendExec {
                message: format!(
                    "add-liquidity confirmed but LP balance is zero for {}",
                    pool.pool_id
                ),
                signatures: outcome.signatures,
            });
        }

        let mut position = Position::new(
            pool.pool_id.clone(),
            outcome.lp_mint.clone(),
            pool.risk_mint().to_string(),
            pool.risk_symbol().to_string(),
            valuation.price_ratio,
            sized,
            valuation.lp_balance_raw,
            now,
        );
        position.last_value_sol = valuation.value_sol;

        let app_state = {
            let mut state = self.state.lock().await;
            state.store.open(position)?;
            state.push_event(format!(
                "🟢 Opened {} with {:.4} SOL (score {:.1})",
                pool.risk_symbol(),
                sized,
                candidate.score.score
            ));
            state.to_app_state(now)
        };
        self.oracle
            .record_ratio(&pool.pool_id, now.timestamp(), valuation.price_ratio)
            .await;
        if let Err(e) = save_state(&self.paths, &app_state) {
            error!("failed to persist state after entry: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimPool, SimulatedBackend};
    use crate::external_apis::{FiatPriceClient, TokenSafetyClient, WSOL_MINT};
    use crate::price_oracle::PoolReserves;
    use uuid::Uuid;

    fn test_paths() -> StatePaths {
        let dir = std::env::temp_dir().join(format!("lp-agent-sched-{}", Uuid::new_v4()));
        StatePaths::in_dir(dir.to_str().unwrap())
    }

    fn sim_pool(wsol: u64, token: u64, lp: u64, lp_mint: &str, token_mint: &str) -> SimPool {
        SimPool {
            reserves: PoolReserves {
                base_vault: token,
                quote_vault: wsol,
                base_open_orders: 0,
                quote_open_orders: 0,
                base_need_take_pnl: 0,
                quote_need_take_pnl: 0,
                lp_circulating: lp,
                base_decimals: 6,
                quote_decimals: 9,
                base_is_wsol: false,
            },
            lp_mint: lp_mint.to_string(),
            token_mint: token_mint.to_string(),
        }
    }

    async fn engine_with(
        backend: Arc<SimulatedBackend>,
        config: Config,
    ) -> (Arc<Engine>, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let engine = Engine::new(
            config,
            EngineState::new(PositionStore::new(), Blacklist::new()),
            backend,
            Arc::new(PriceOracle::new(FiatPriceClient::new(None))),
            Arc::new(PoolDirectory::new()),
            Arc::new(SafetyScreen::new(TokenSafetyClient::new())),
            test_paths(),
            stop_rx,
        );
        (engine, stop_tx)
    }

    fn open_position(pool_id: &str, lp_mint: &str, entry_sol: Decimal, lp_raw: u64) -> Position {
        Position::new(
            pool_id.to_string(),
            lp_mint.to_string(),
            format!("{}-token", pool_id),
            "TKN".to_string(),
            1.0,
            entry_sol,
            lp_raw,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn ghost_position_closes_and_bans() {
        let backend = Arc::new(SimulatedBackend::new());
        backend
            .seed_pool(
                "pool-a",
                sim_pool(100_000_000_000, 50_000_000, 10_000_000, "lp-a", "tok-a"),
            )
            .await;
        // LP balance on chain is zero: the pool was drained.
        backend.set_lp_balance("lp-a", 0).await;

        let (engine, _stop) = engine_with(backend, Config::default()).await;
        {
            let mut state = engine.state.lock().await;
            state
                .store
                .open(open_position("pool-a", "lp-a", Decimal::ONE, 1_000_000_000))
                .unwrap();
        }

        engine.clone().update_positions_once().await.unwrap();
        // ghost finalization runs on a spawned task
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = engine.state.lock().await;
        assert_eq!(state.store.open_count(), 0);
        assert!(state.blacklist.is_banned("pool-a"));
        assert_eq!(state.store.trades_closed, 1);
    }

    #[tokio::test]
    async fn stop_loss_exit_sells_and_applies_cooldown() {
        let mut config = Config::default();
        config.trading_enabled = true; // sim backend, flows on
        let backend = Arc::new(SimulatedBackend::new());
        backend
            .seed_pool(
                "pool-a",
                sim_pool(100_000_000_000, 50_000_000_000, 10_000_000_000, "lp-a", "tok-a"),
            )
            .await;
        backend.set_lp_balance("lp-a", 10_000_000).await;

        let (engine, _stop) = engine_with(backend.clone(), config).await;
        {
            let mut state = engine.state.lock().await;
            // entry priced far above what the LP share is worth now
            state
                .store
                .open(open_position("pool-a", "lp-a", Decimal::new(100, 0), 10_000_000))
                .unwrap();
        }

        engine.clone().update_positions_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let state = engine.state.lock().await;
        assert_eq!(state.store.open_count(), 0);
        assert_eq!(state.blacklist.strikes("pool-a"), 1);
        assert!(!state.blacklist.is_eligible("pool-a", Utc::now()));
        // the sell actually ran against the sim chain
        assert_eq!(backend.balance("lp-a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closing_position_not_observable_as_open() {
        let backend = Arc::new(SimulatedBackend::new());
        backend
            .seed_pool(
                "pool-a",
                sim_pool(100_000_000_000, 50_000_000, 10_000_000, "lp-a", "tok-a"),
            )
            .await;
        backend.set_lp_balance("lp-a", 0).await; // ghost -> immediate close path

        let (engine, _stop) = engine_with(backend, Config::default()).await;
        {
            let mut state = engine.state.lock().await;
            state
                .store
                .open(open_position("pool-a", "lp-a", Decimal::ONE, 1_000))
                .unwrap();
        }

        engine.clone().update_positions_once().await.unwrap();
        // Immediately after the tick returns (sell still possibly in
        // flight), the position must already be gone from the open set.
        let state = engine.state.lock().await;
        assert!(!state.store.has_pool("pool-a"));
        assert_eq!(state.store.open_count(), 0);
    }

    #[tokio::test]
    async fn exit_suppressed_when_trading_disabled() {
        let mut config = Config::default();
        config.dry_run = false;
        config.trading_enabled = false;
        let backend = Arc::new(SimulatedBackend::new());
        backend
            .seed_pool(
                "pool-a",
                sim_pool(100_000_000_000, 50_000_000_000, 10_000_000_000, "lp-a", "tok-a"),
            )
            .await;
        backend.set_lp_balance("lp-a", 10_000_000).await;

        let (engine, _stop) = engine_with(backend, config).await;
        {
            let mut state = engine.state.lock().await;
            state
                .store
                .open(open_position("pool-a", "lp-a", Decimal::new(100, 0), 10_000_000))
                .unwrap();
        }

        engine.clone().update_positions_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Deep stop-loss, but no transaction may run: position stays.
        let state = engine.state.lock().await;
        assert_eq!(state.store.open_count(), 1);
    }

    #[tokio::test]
    async fn entry_flow_opens_position_and_persists() {
        let mut config = Config::default();
        config.min_position_sol = Decimal::new(1, 1); // 0.1 SOL
        let backend = Arc::new(SimulatedBackend::new());

        let (engine, _stop) = engine_with(backend.clone(), config).await;

        let pool = Pool {
            pool_id: "pool-x".into(),
            lp_mint: "lp-x".into(),
            base_mint: "tok-x".into(),
            quote_mint: WSOL_MINT.into(),
            base_symbol: "XTK".into(),
            quote_symbol: "WSOL".into(),
            base_decimals: 6,
            quote_decimals: 9,
            tvl_usd: 300_000.0,
            volume_24h_usd: 150_000.0,
            apr_24h_pct: 60.0,
            burn_pct: 99.0,
            fee_tier_bps: 25,
        };
        let il_factor = 50.0;
        let mut score = scorer::score_pool(&pool, il_factor);
        score.sized_amount_sol = Decimal::new(5, 1); // 0.5 SOL

        engine
            .clone()
            .try_enter(EntryCandidate { pool, score })
            .await
            .unwrap();

        let state = engine.state.lock().await;
        assert_eq!(state.store.open_count(), 1);
        let position = &state.store.open_positions()[0];
        assert_eq!(position.pool_id, "pool-x");
        assert!(position.entry_lp_raw > 0);
        assert_eq!(position.entry_amount_sol, Decimal::new(5, 1));
        // persisted snapshot exists and round-trips
        let restored = crate::positions::load_state(&engine.paths).unwrap().unwrap();
        assert_eq!(restored.open_positions.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_entry_is_dropped_at_dequeue() {
        let backend = Arc::new(SimulatedBackend::new());
        let (engine, _stop) = engine_with(backend, Config::default()).await;
        {
            let mut state = engine.state.lock().await;
            state
                .store
                .open(open_position("pool-x", "lp-x", Decimal::ONE, 1_000))
                .unwrap();
        }

        let pool = Pool {
            pool_id: "pool-x".into(),
            lp_mint: "lp-x".into(),
            base_mint: "tok-x".into(),
            quote_mint: WSOL_MINT.into(),
            base_symbol: "XTK".into(),
            quote_symbol: "WSOL".into(),
            base_decimals: 6,
            quote_decimals: 9,
            tvl_usd: 300_000.0,
            volume_24h_usd: 150_000.0,
            apr_24h_pct: 60.0,
            burn_pct: 99.0,
            fee_tier_bps: 25,
        };
        let score = scorer::score_pool(&pool, 50.0);
        engine
            .clone()
            .try_enter(EntryCandidate { pool, score })
            .await
            .unwrap();

        // still exactly one position; the duplicate was silently dropped
        let state = engine.state.lock().await;
        assert_eq!(state.store.open_count(), 1);
    }
}

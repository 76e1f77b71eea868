// Durable position model and the store that owns it. The store is the
// single source of truth for open positions; the scheduler lends it out
// under the engine mutex. Snapshots are atomic (write-to-temp + rename),
// closed trades append one JSON line each to the trade history file.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blacklist::{BlacklistEntry, CooldownEntry};
use crate::config::SCHEMA_VERSION;
use crate::errors::EngineError;

// ============================================================================
// DOMAIN TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Time,
    Il,
    Ghost,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::Time => "TIME",
            ExitReason::Il => "IL",
            ExitReason::Ghost => "GHOST",
            ExitReason::Manual => "MANUAL",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub pool_id: String,
    pub lp_mint: String,
    pub token_mint: String,
    pub token_symbol: String,
    pub entry_price_ratio: f64,
    pub entry_amount_sol: Decimal,
    pub entry_lp_raw: u64,
    pub opened_at: DateTime<Utc>,
    pub last_value_sol: Decimal,
    pub last_price_ratio: f64,
    pub last_pnl_pct: f64,
    pub last_il_pct: f64,
    pub last_updated_at: DateTime<Utc>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool_id: String,
        lp_mint: String,
        token_mint: String,
        token_symbol: String,
        entry_price_ratio: f64,
        entry_amount_sol: Decimal,
        entry_lp_raw: u64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id: Uuid::new_v4().to_string(),
            pool_id,
            lp_mint,
            token_mint,
            token_symbol,
            entry_price_ratio,
            entry_amount_sol,
            entry_lp_raw,
            opened_at,
            last_value_sol: entry_amount_sol,
            last_price_ratio: entry_price_ratio,
            last_pnl_pct: 0.0,
            last_il_pct: 0.0,
            last_updated_at: opened_at,
        }
    }

    pub fn hold_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    #[serde(flatten)]
    pub position: Position,
    pub closed_at: DateTime<Utc>,
    pub exit_value_sol: Decimal,
    pub realized_pnl_pct: f64,
    /// Estimated from the P&L residual; instrumentation only.
    pub fees_collected_sol: Decimal,
    pub hold_seconds: i64,
    pub exit_reason: ExitReason,
}

impl ClosedTrade {
    pub fn new(
        position: Position,
        closed_at: DateTime<Utc>,
        exit_value_sol: Decimal,
        exit_reason: ExitReason,
    ) -> Self {
        let entry = position.entry_amount_sol;
        let realized_pnl_pct = if entry.is_zero() {
            0.0
        } else {
            (((exit_value_sol - entry) / entry) * Decimal::from(100))
                .to_f64()
                .unwrap_or(0.0)
        };
        // Fee estimate: whatever the exit returned beyond the IL-adjusted
        // entry is attributed to collected fees. Floored at zero.
        let il_multiplier = Decimal::try_from(1.0 + position.last_il_pct / 100.0)
            .unwrap_or(Decimal::ONE);
        let fees_collected_sol = (exit_value_sol - entry * il_multiplier).max(Decimal::ZERO);
        let hold_seconds = position.hold_seconds(closed_at);
        Self {
            position,
            closed_at,
            exit_value_sol,
            realized_pnl_pct,
            fees_collected_sol,
            hold_seconds,
            exit_reason,
        }
    }
}

/// The serialized root document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    pub schema_version: u32,
    pub open_positions: Vec<Position>,
    pub cooldowns: Vec<CooldownEntry>,
    pub blacklist: Vec<BlacklistEntry>,
    pub last_saved_at: DateTime<Utc>,
}

// ============================================================================
// POSITION STORE
// ============================================================================

#[derive(Default)]
pub struct PositionStore {
    open: HashMap<String, Position>,
    pool_index: HashMap<String, String>,
    pub trades_closed: u64,
    pub realized_pnl_sol: Decimal,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new position, enforcing the one-open-position-per-pool
    /// invariant. A duplicate is an InvariantViolation, not a skip: two
    /// live positions on one pool means the entry discipline broke.
    pub fn open(&mut self, position: Position) -> Result<(), EngineError> {
        if self.pool_index.contains_key(&position.pool_id) {
            return Err(EngineError::Invariant(format!(
                "duplicate open position for pool {}",
                position.pool_id
            )));
        }
        if position.entry_lp_raw == 0 {
            return Err(EngineError::Invariant(format!(
                "position for pool {} opened with zero LP",
                position.pool_id
            )));
        }
        self.pool_index
            .insert(position.pool_id.clone(), position.position_id.clone());
        self.open.insert(position.position_id.clone(), position);
        Ok(())
    }

    /// Removes the position from the open set and hands it to the caller.
    /// Other workers stop observing it as open the moment this returns;
    /// the sell executes against the returned value.
    pub fn begin_close(&mut self, position_id: &str) -> Option<Position> {
        let position = self.open.remove(position_id)?;
        self.pool_index.remove(&position.pool_id);
        Some(position)
    }

    pub fn record_closed(&mut self, trade: &ClosedTrade) {
        self.trades_closed += 1;
        self.realized_pnl_sol += trade.exit_value_sol - trade.position.entry_amount_sol;
    }

    /// O(1) metric refresh from the position-update worker.
    pub fn update_metrics(
        &mut self,
        position_id: &str,
        value_sol: Decimal,
        price_ratio: f64,
        pnl_pct: f64,
        il_pct: f64,
        now: DateTime<Utc>,
    ) {
        if let Some(position) = self.open.get_mut(position_id) {
            position.last_value_sol = value_sol;
            position.last_price_ratio = price_ratio;
            position.last_pnl_pct = pnl_pct;
            position.last_il_pct = il_pct;
            position.last_updated_at = now;
        }
    }

    pub fn get(&self, position_id: &str) -> Option<&Position> {
        self.open.get(position_id)
    }

    pub fn has_pool(&self, pool_id: &str) -> bool {
        self.pool_index.contains_key(pool_id)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.open.values().cloned().collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        positions
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn restore(&mut self, positions: Vec<Position>) -> Result<(), EngineError> {
        for position in positions {
            self.open(position)?;
        }
        Ok(())
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_file: PathBuf,
    pub trade_log: PathBuf,
}

impl StatePaths {
    pub fn in_dir(dir: &str) -> Self {
        let dir = Path::new(dir);
        Self {
            state_file: dir.join("app_state.json"),
            trade_log: dir.join("trade_history.jsonl"),
        }
    }
}

/// Atomic snapshot: serialize to a sibling temp file, fsync, rename over
/// the live document.
pub fn save_state(paths: &StatePaths, state: &AppState) -> Result<(), EngineError> {
    if let Some(parent) = paths.state_file.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::Persistence(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| EngineError::Persistence(e.to_string()))?;

    let tmp = paths.state_file.with_extension("json.tmp");
    {
        let mut file =
            fs::File::create(&tmp).map_err(|e| EngineError::Persistence(e.to_string()))?;
        file.write_all(json.as_bytes())
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        file.sync_all()
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
    }
    fs::rename(&tmp, &paths.state_file).map_err(|e| EngineError::Persistence(e.to_string()))
}

/// Loads the persisted document. Corruption or a schema mismatch moves the
/// file aside and starts fresh rather than guessing at live positions.
pub fn load_state(paths: &StatePaths) -> Result<Option<AppState>, EngineError> {
    let raw = match fs::read_to_string(&paths.state_file) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::Persistence(e.to_string())),
    };

    match serde_json::from_str::<AppState>(&raw) {
        Ok(state) if state.schema_version == SCHEMA_VERSION => {
            info!(
                "💾 Restored state: {} open positions, {} cooldowns, {} blacklisted",
                state.open_positions.len(),
                state.cooldowns.len(),
                state.blacklist.len()
            );
            Ok(Some(state))
        }
        Ok(state) => {
            warn!(
                "⚠️ State schema mismatch (file {}, engine {}); backing up and starting fresh",
                state.schema_version, SCHEMA_VERSION
            );
            back_up_state_file(paths)?;
            Ok(None)
        }
        Err(e) => {
            warn!("⚠️ State file unreadable ({}); backing up and starting fresh", e);
            back_up_state_file(paths)?;
            Ok(None)
        }
    }
}

fn back_up_state_file(paths: &StatePaths) -> Result<(), EngineError> {
    let backup = paths
        .state_file
        .with_extension(format!("json.corrupt-{}", Utc::now().timestamp()));
    fs::rename(&paths.state_file, &backup).map_err(|e| EngineError::Persistence(e.to_string()))
}

/// Appends one closed trade as a single JSON line.
pub fn append_trade(paths: &StatePaths, trade: &ClosedTrade) -> Result<(), EngineError> {
    if let Some(parent) = paths.trade_log.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::Persistence(e.to_string()))?;
    }
    let line = serde_json::to_string(trade).map_err(|e| EngineError::Persistence(e.to_string()))?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.trade_log)
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
    writeln!(file, "{}", line).map_err(|e| EngineError::Persistence(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample_position(pool_id: &str) -> Position {
        Position::new(
            pool_id.to_string(),
            format!("{}-lp", pool_id),
            format!("{}-mint", pool_id),
            "TKN".to_string(),
            1.25,
            Decimal::new(5, 1),
            1_000_000_000,
            Utc::now(),
        )
    }

    fn temp_paths() -> StatePaths {
        let dir = std::env::temp_dir().join(format!("lp-agent-test-{}", Uuid::new_v4()));
        StatePaths::in_dir(dir.to_str().unwrap())
    }

    #[test]
    fn rejects_duplicate_pool() {
        let mut store = PositionStore::new();
        store.open(sample_position("pool-a")).unwrap();
        let err = store.open(sample_position("pool-a")).unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[test]
    fn rejects_zero_lp_entry() {
        let mut store = PositionStore::new();
        let mut position = sample_position("pool-a");
        position.entry_lp_raw = 0;
        assert!(store.open(position).is_err());
    }

    #[test]
    fn begin_close_removes_from_open_set() {
        let mut store = PositionStore::new();
        let position = sample_position("pool-a");
        let id = position.position_id.clone();
        store.open(position).unwrap();

        let taken = store.begin_close(&id).unwrap();
        assert_eq!(taken.pool_id, "pool-a");
        assert_eq!(store.open_count(), 0);
        assert!(!store.has_pool("pool-a"));
        // a second close of the same id is a no-op
        assert!(store.begin_close(&id).is_none());
    }

    #[test]
    fn state_round_trips_through_disk() {
        let paths = temp_paths();
        let state = AppState {
            schema_version: SCHEMA_VERSION,
            open_positions: vec![sample_position("pool-a"), sample_position("pool-b")],
            cooldowns: vec![],
            blacklist: vec![],
            last_saved_at: Utc::now(),
        };
        save_state(&paths, &state).unwrap();
        let restored = load_state(&paths).unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            serde_json::to_string(&restored).unwrap()
        );
    }

    #[test]
    fn corrupt_state_is_backed_up_not_fatal() {
        let paths = temp_paths();
        fs::create_dir_all(paths.state_file.parent().unwrap()).unwrap();
        fs::write(&paths.state_file, "{ not json").unwrap();
        assert!(load_state(&paths).unwrap().is_none());
        // original file was moved aside
        assert!(!paths.state_file.exists());
    }

    #[test]
    fn schema_mismatch_starts_fresh() {
        let paths = temp_paths();
        let state = AppState {
            schema_version: SCHEMA_VERSION + 9,
            open_positions: vec![],
            cooldowns: vec![],
            blacklist: vec![],
            last_saved_at: Utc::now(),
        };
        save_state(&paths, &state).unwrap();
        assert!(load_state(&paths).unwrap().is_none());
    }

    #[test]
    fn trade_log_appends_lines() {
        let paths = temp_paths();
        let trade = ClosedTrade::new(
            sample_position("pool-a"),
            Utc::now(),
            Decimal::new(6, 1),
            ExitReason::TakeProfit,
        );
        append_trade(&paths, &trade).unwrap();
        append_trade(&paths, &trade).unwrap();
        let raw = fs::read_to_string(&paths.trade_log).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let parsed: ClosedTrade = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.exit_reason, ExitReason::TakeProfit);
    }

    #[test]
    fn realized_pnl_math() {
        let mut position = sample_position("pool-a");
        position.entry_amount_sol = Decimal::new(10, 1); // 1.0 SOL
        let trade = ClosedTrade::new(
            position,
            Utc::now(),
            Decimal::new(13, 1), // 1.3 SOL back
            ExitReason::TakeProfit,
        );
        assert!((trade.realized_pnl_pct - 30.0).abs() < 1e-9);
    }
}

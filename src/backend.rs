// Execution backend: the contract the engine holds against the swap/LP
// machinery. Two implementations live here. SimulatedBackend is a full
// in-memory AMM used for dry-run mode and tests. LiveBackend reads chain
// state over RPC and hands capital-moving operations to a per-call executor
// subprocess that speaks JSON on stdout, awaiting confirmation before it
// returns.
//
// Both honor the contract rules: balances are read on chain at call time
// (never trusted from the caller), transient network failures retry with
// exponential backoff, and partial success is surfaced, never swallowed.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::pubkey::Pubkey;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::amm_state::{decode_amm_state, decode_open_orders, decode_token_account};
use crate::errors::{classify_rpc, EngineError};
use crate::external_apis::WSOL_MINT;
use crate::price_oracle::{lamports_to_sol, PoolReserves};

const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const ATA_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

/// Rent reclaimed per closed token account, in SOL.
const TOKEN_ACCOUNT_RENT_SOL: &str = "0.00203928";

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

// ============================================================================
// CONTRACT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    Buy,
    Sell,
}

#[derive(Debug, Clone)]
pub struct LpValuation {
    pub value_sol: Decimal,
    pub price_ratio: f64,
    pub lp_balance_raw: u64,
}

#[derive(Debug, Clone)]
pub struct AddLiquidityOutcome {
    pub signatures: Vec<String>,
    pub lp_mint: String,
}

#[derive(Debug, Clone)]
pub struct LpHolders {
    /// (owner address, raw LP amount), largest first, top ~20.
    pub holders: Vec<(String, u64)>,
    pub supply: u64,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn add_liquidity(
        &self,
        pool_id: &str,
        slippage_pct: f64,
    ) -> Result<AddLiquidityOutcome, EngineError>;

    /// Removes the wallet's entire on-chain LP balance for the pool.
    async fn remove_liquidity(
        &self,
        pool_id: &str,
        slippage_pct: f64,
    ) -> Result<Vec<String>, EngineError>;

    /// `amount_in` of 0 in Sell direction means sell the whole balance.
    async fn swap(
        &self,
        pool_id: &str,
        amount_in: u64,
        slippage_pct: f64,
        direction: SwapDirection,
    ) -> Result<Vec<String>, EngineError>;

    async fn lp_value(&self, pool_id: &str, lp_mint: &str) -> Result<LpValuation, EngineError>;

    /// Batch valuation; implementations stay within two bulk reads.
    async fn lp_value_batch(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<String, LpValuation>, EngineError>;

    async fn balance(&self, mint: &str) -> Result<u64, EngineError>;

    async fn native_balance(&self) -> Result<u64, EngineError>;

    async fn list_tokens(&self) -> Result<Vec<(String, u64)>, EngineError>;

    /// Closes empty token accounts in batches of at most 20 per
    /// transaction, keeping the given mints. Returns (closed, rent SOL).
    async fn close_empty_accounts(&self, keep: &[String]) -> Result<(u32, Decimal), EngineError>;

    /// Unwraps any wrapped-native balance; returns the SOL recovered.
    async fn unwrap_native(&self) -> Result<Decimal, EngineError>;

    async fn lp_holders(&self, lp_mint: &str) -> Result<LpHolders, EngineError>;

    /// Provisioning hook for dry-run mode: the simulated backend materializes
    /// a pool it has not seen before from listing data. No-op on a live
    /// backend, where pools already exist on chain.
    async fn ensure_pool(
        &self,
        _pool: &crate::external_apis::Pool,
        _sol_usd: Option<f64>,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Retry wrapper for remote reads: exponential backoff on transient
/// failures only, each attempt under a hard wall-clock timeout.
pub async fn with_retry<T, F, Fut>(
    op_name: &str,
    timeout: Duration,
    mut call: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
    let mut attempt = 1;
    loop {
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(
                    "⚠️ {} attempt {}/{} failed ({}); retrying in {:?}",
                    op_name, attempt, RETRY_ATTEMPTS, e, delay
                );
            }
            Ok(Err(e)) => return Err(e),
            Err(_) if attempt < RETRY_ATTEMPTS => {
                warn!(
                    "⚠️ {} attempt {}/{} timed out after {:?}; retrying",
                    op_name, attempt, RETRY_ATTEMPTS, timeout
                );
            }
            Err(_) => {
                return Err(EngineError::NetworkTransient(format!(
                    "{} timed out after {:?}",
                    op_name, timeout
                )))
            }
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}

// ============================================================================
// SIMULATED BACKEND (dry-run + tests)
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimPool {
    pub reserves: PoolReserves,
    pub lp_mint: String,
    pub token_mint: String,
}

#[derive(Default)]
struct SimState {
    pools: HashMap<String, SimPool>,
    lamports: u64,
    wsol_raw: u64,
    token_balances: HashMap<String, u64>,
    lp_balances: HashMap<String, u64>,
    lp_holders: HashMap<String, LpHolders>,
    empty_accounts: Vec<String>,
}

/// In-memory constant-product backend. Deterministic unless the price walk
/// is enabled, in which case reserves drift a little on every valuation.
pub struct SimulatedBackend {
    state: RwLock<SimState>,
    price_walk: bool,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SimState {
                lamports: 10_000_000_000, // 10 SOL to play with
                ..SimState::default()
            }),
            price_walk: false,
        }
    }

    pub fn with_price_walk() -> Self {
        let mut backend = Self::new();
        backend.price_walk = true;
        backend
    }

    pub async fn seed_pool(&self, pool_id: &str, pool: SimPool) {
        self.state
            .write()
            .await
            .pools
            .insert(pool_id.to_string(), pool);
    }

    pub async fn set_lamports(&self, lamports: u64) {
        self.state.write().await.lamports = lamports;
    }

    pub async fn set_wsol(&self, raw: u64) {
        self.state.write().await.wsol_raw = raw;
    }

    pub async fn set_token_balance(&self, mint: &str, raw: u64) {
        self.state
            .write()
            .await
            .token_balances
            .insert(mint.to_string(), raw);
    }

    pub async fn set_lp_balance(&self, lp_mint: &str, raw: u64) {
        self.state
            .write()
            .await
            .lp_balances
            .insert(lp_mint.to_string(), raw);
    }

    pub async fn set_lp_holders(&self, lp_mint: &str, holders: LpHolders) {
        self.state
            .write()
            .await
            .lp_holders
            .insert(lp_mint.to_string(), holders);
    }

    pub async fn add_empty_account(&self, mint: &str) {
        self.state
            .write()
            .await
            .empty_accounts
            .push(mint.to_string());
    }

    pub async fn lamports(&self) -> u64 {
        self.state.read().await.lamports
    }

    fn sig() -> Vec<String> {
        vec![format!("sim-{}", uuid::Uuid::new_v4())]
    }

    fn valuation(pool: &SimPool, lp_raw: u64) -> LpValuation {
        LpValuation {
            value_sol: lamports_to_sol(pool.reserves.lp_value_lamports(lp_raw)),
            price_ratio: pool.reserves.price_ratio(),
            lp_balance_raw: lp_raw,
        }
    }

    fn drift(reserves: &mut PoolReserves) {
        let mut rng = rand::thread_rng();
        let bps: i64 = rng.gen_range(-30..=30);
        let vault = reserves.quote_vault as i128;
        let adjusted = vault + vault * bps as i128 / 10_000;
        reserves.quote_vault = adjusted.max(1) as u64;
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn add_liquidity(
        &self,
        pool_id: &str,
        _slippage_pct: f64,
    ) -> Result<AddLiquidityOutcome, EngineError> {
        let mut state = self.state.write().await;
        let pool = state.pools.get(pool_id).cloned().ok_or_else(|| {
            EngineError::BackendExec {
                message: format!("unknown pool {}", pool_id),
                signatures: vec![],
            }
        })?;

        // Pair the wallet's token balance with matching SOL, on-chain
        // balances only.
        let token_raw = *state.token_balances.get(&pool.token_mint).unwrap_or(&0);
        if token_raw == 0 {
            return Err(EngineError::BackendExec {
                message: "no token balance to deposit".to_string(),
                signatures: vec![],
            });
        }
        let reserves = &pool.reserves;
        let (wsol_reserve, token_reserve) = if reserves.base_is_wsol {
            (reserves.effective_base(), reserves.effective_quote())
        } else {
            (reserves.effective_quote(), reserves.effective_base())
        };
        if token_reserve == 0 || reserves.lp_circulating == 0 {
            return Err(EngineError::BackendExec {
                message: "pool has no liquidity".to_string(),
                signatures: vec![],
            });
        }
        let wsol_needed = (token_raw as u128 * wsol_reserve / token_reserve) as u64;
        if wsol_needed as u128 > state.lamports as u128 {
            return Err(EngineError::BackendExec {
                message: "insufficient SOL for paired deposit".to_string(),
                signatures: vec![],
            });
        }
        let lp_minted =
            (token_raw as u128 * reserves.lp_circulating as u128 / token_reserve) as u64;

        state.lamports -= wsol_needed;
        state.token_balances.insert(pool.token_mint.clone(), 0);
        *state.lp_balances.entry(pool.lp_mint.clone()).or_insert(0) += lp_minted;

        let entry = state.pools.get_mut(pool_id).unwrap();
        if entry.reserves.base_is_wsol {
            entry.reserves.base_vault += wsol_needed;
            entry.reserves.quote_vault += token_raw;
        } else {
            entry.reserves.quote_vault += wsol_needed;
            entry.reserves.base_vault += token_raw;
        }
        entry.reserves.lp_circulating += lp_minted;

        Ok(AddLiquidityOutcome {
            signatures: Self::sig(),
            lp_mint: pool.lp_mint,
        })
    }

    async fn remove_liquidity(
        &self,
        pool_id: &str,
        _slippage_pct: f64,
    ) -> Result<Vec<String>, EngineError> {
        let mut state = self.state.write().await;
        let pool = state.pools.get(pool_id).cloned().ok_or_else(|| {
            EngineError::BackendExec {
                message: format!("unknown pool {}", pool_id),
                signatures: vec![],
            }
        })?;
        // On-chain LP balance, not a caller-supplied figure.
        let lp_raw = *state.lp_balances.get(&pool.lp_mint).unwrap_or(&0);
        if lp_raw == 0 {
            return Err(EngineError::BackendExec {
                message: "no LP balance to remove".to_string(),
                signatures: vec![],
            });
        }
        let reserves = &pool.reserves;
        let lp_circulating = reserves.lp_circulating.max(1) as u128;
        let share_base = (lp_raw as u128 * reserves.effective_base() / lp_circulating) as u64;
        let share_quote = (lp_raw as u128 * reserves.effective_quote() / lp_circulating) as u64;
        let (wsol_out, token_out) = if reserves.base_is_wsol {
            (share_base, share_quote)
        } else {
            (share_quote, share_base)
        };

        state.lamports += wsol_out;
        *state
            .token_balances
            .entry(pool.token_mint.clone())
            .or_insert(0) += token_out;
        state.lp_balances.insert(pool.lp_mint.clone(), 0);

        let entry = state.pools.get_mut(pool_id).unwrap();
        if entry.reserves.base_is_wsol {
            entry.reserves.base_vault = entry.reserves.base_vault.saturating_sub(wsol_out);
            entry.reserves.quote_vault = entry.reserves.quote_vault.saturating_sub(token_out);
        } else {
            entry.reserves.quote_vault = entry.reserves.quote_vault.saturating_sub(wsol_out);
            entry.reserves.base_vault = entry.reserves.base_vault.saturating_sub(token_out);
        }
        entry.reserves.lp_circulating = entry.reserves.lp_circulating.saturating_sub(lp_raw);

        Ok(Self::sig())
    }

    async fn swap(
        &self,
        pool_id: &str,
        amount_in: u64,
        _slippage_pct: f64,
        direction: SwapDirection,
    ) -> Result<Vec<String>, EngineError> {
        let mut state = self.state.write().await;
        let pool = state.pools.get(pool_id).cloned().ok_or_else(|| {
            EngineError::BackendExec {
                message: format!("unknown pool {}", pool_id),
                signatures: vec![],
            }
        })?;
        let reserves = &pool.reserves;
        let (wsol_reserve, token_reserve) = if reserves.base_is_wsol {
            (reserves.effective_base(), reserves.effective_quote())
        } else {
            (reserves.effective_quote(), reserves.effective_base())
        };

        match direction {
            SwapDirection::Buy => {
                if amount_in == 0 || amount_in > state.lamports {
                    return Err(EngineError::BackendExec {
                        message: "insufficient SOL for buy".to_string(),
                        signatures: vec![],
                    });
                }
                // constant product with a 25 bps fee
                let in_after_fee = amount_in as u128 * 9_975 / 10_000;
                let out =
                    token_reserve * in_after_fee / (wsol_reserve + in_after_fee);
                state.lamports -= amount_in;
                *state
                    .token_balances
                    .entry(pool.token_mint.clone())
                    .or_insert(0) += out as u64;
                let entry = state.pools.get_mut(pool_id).unwrap();
                if entry.reserves.base_is_wsol {
                    entry.reserves.base_vault += amount_in;
                    entry.reserves.quote_vault =
                        entry.reserves.quote_vault.saturating_sub(out as u64);
                } else {
                    entry.reserves.quote_vault += amount_in;
                    entry.reserves.base_vault =
                        entry.reserves.base_vault.saturating_sub(out as u64);
                }
            }
            SwapDirection::Sell => {
                let held = *state.token_balances.get(&pool.token_mint).unwrap_or(&0);
                let amount = if amount_in == 0 { held } else { amount_in.min(held) };
                if amount == 0 {
                    return Err(EngineError::BackendExec {
                        message: "no token balance to sell".to_string(),
                        signatures: vec![],
                    });
                }
                let in_after_fee = amount as u128 * 9_975 / 10_000;
                let out = wsol_reserve * in_after_fee / (token_reserve + in_after_fee);
                state
                    .token_balances
                    .insert(pool.token_mint.clone(), held - amount);
                state.lamports += out as u64;
                let entry = state.pools.get_mut(pool_id).unwrap();
                if entry.reserves.base_is_wsol {
                    entry.reserves.base_vault =
                        entry.reserves.base_vault.saturating_sub(out as u64);
                    entry.reserves.quote_vault += amount;
                } else {
                    entry.reserves.quote_vault =
                        entry.reserves.quote_vault.saturating_sub(out as u64);
                    entry.reserves.base_vault += amount;
                }
            }
        }
        Ok(Self::sig())
    }

    async fn lp_value(&self, pool_id: &str, lp_mint: &str) -> Result<LpValuation, EngineError> {
        let mut state = self.state.write().await;
        if self.price_walk {
            if let Some(pool) = state.pools.get_mut(pool_id) {
                Self::drift(&mut pool.reserves);
            }
        }
        let pool = state.pools.get(pool_id).ok_or_else(|| {
            EngineError::NetworkPermanent(format!("unknown pool {}", pool_id))
        })?;
        let lp_raw = *state.lp_balances.get(lp_mint).unwrap_or(&0);
        Ok(Self::valuation(pool, lp_raw))
    }

    async fn lp_value_batch(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<String, LpValuation>, EngineError> {
        let mut out = HashMap::new();
        for (pool_id, lp_mint) in pairs {
            if let Ok(valuation) = self.lp_value(pool_id, lp_mint).await {
                out.insert(pool_id.clone(), valuation);
            }
        }
        Ok(out)
    }

    async fn balance(&self, mint: &str) -> Result<u64, EngineError> {
        let state = self.state.read().await;
        if mint == WSOL_MINT {
            return Ok(state.wsol_raw);
        }
        Ok(*state
            .token_balances
            .get(mint)
            .or_else(|| state.lp_balances.get(mint))
            .unwrap_or(&0))
    }

    async fn native_balance(&self) -> Result<u64, EngineError> {
        Ok(self.state.read().await.lamports)
    }

    async fn list_tokens(&self) -> Result<Vec<(String, u64)>, EngineError> {
        let state = self.state.read().await;
        let mut tokens: Vec<(String, u64)> = state
            .token_balances
            .iter()
            .filter(|(_, raw)| **raw > 0)
            .map(|(mint, raw)| (mint.clone(), *raw))
            .collect();
        if state.wsol_raw > 0 {
            tokens.push((WSOL_MINT.to_string(), state.wsol_raw));
        }
        tokens.sort();
        Ok(tokens)
    }

    async fn close_empty_accounts(&self, keep: &[String]) -> Result<(u32, Decimal), EngineError> {
        let mut state = self.state.write().await;
        let before = state.empty_accounts.len();
        state.empty_accounts.retain(|mint| keep.contains(mint));
        let closed = (before - state.empty_accounts.len()) as u32;
        let rent = Decimal::from_str(TOKEN_ACCOUNT_RENT_SOL).unwrap() * Decimal::from(closed);
        state.lamports += crate::price_oracle::sol_to_lamports(rent);
        Ok((closed, rent))
    }

    async fn unwrap_native(&self) -> Result<Decimal, EngineError> {
        let mut state = self.state.write().await;
        let raw = state.wsol_raw;
        state.wsol_raw = 0;
        state.lamports += raw;
        Ok(lamports_to_sol(raw as u128))
    }

    async fn lp_holders(&self, lp_mint: &str) -> Result<LpHolders, EngineError> {
        self.state
            .read()
            .await
            .lp_holders
            .get(lp_mint)
            .cloned()
            .ok_or_else(|| {
                EngineError::NetworkPermanent(format!("no holder data for {}", lp_mint))
            })
    }

    async fn ensure_pool(
        &self,
        pool: &crate::external_apis::Pool,
        sol_usd: Option<f64>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if state.pools.contains_key(&pool.pool_id) {
            return Ok(());
        }

        // Materialize reserves from the listing row: half the TVL sits on
        // the WSOL side, and the token side is scaled so the natural-unit
        // ratio starts at 1.0.
        let wsol_raw = match sol_usd {
            Some(px) if px > 0.0 => ((pool.tvl_usd / 2.0 / px) * 1e9) as u64,
            _ => 100_000_000_000, // 100 SOL when no fiat price is known
        }
        .max(1_000_000);

        let token_decimals = if pool.base_mint == WSOL_MINT {
            pool.quote_decimals
        } else {
            pool.base_decimals
        };
        let token_raw = if token_decimals <= 9 {
            wsol_raw / 10u64.pow((9 - token_decimals) as u32)
        } else {
            wsol_raw.saturating_mul(10u64.pow((token_decimals - 9) as u32))
        }
        .max(1);

        let base_is_wsol = pool.base_mint == WSOL_MINT;
        let (base_vault, quote_vault) = if base_is_wsol {
            (wsol_raw, token_raw)
        } else {
            (token_raw, wsol_raw)
        };

        state.pools.insert(
            pool.pool_id.clone(),
            SimPool {
                reserves: PoolReserves {
                    base_vault,
                    quote_vault,
                    base_open_orders: 0,
                    quote_open_orders: 0,
                    base_need_take_pnl: 0,
                    quote_need_take_pnl: 0,
                    lp_circulating: wsol_raw,
                    base_decimals: pool.base_decimals,
                    quote_decimals: pool.quote_decimals,
                    base_is_wsol,
                },
                lp_mint: pool.lp_mint.clone(),
                token_mint: pool.risk_mint().to_string(),
            },
        );
        Ok(())
    }
}

// ============================================================================
// LIVE BACKEND (RPC reads + executor subprocess)
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExecutorResponse {
    pub success: bool,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(rename = "lpMint")]
    pub lp_mint: Option<String>,
    pub amount: Option<String>,
    pub closed: Option<u32>,
    pub rent: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

pub struct LiveBackend {
    rpc: RpcClient,
    wallet: Pubkey,
    executor_cmd: Option<String>,
    timeout: Duration,
    /// pool_id -> decoded AMM keys; AMM key sets are immutable, so this
    /// cache only ever grows.
    amm_cache: RwLock<HashMap<String, crate::amm_state::AmmState>>,
}

impl LiveBackend {
    pub fn new(
        rpc_url: &str,
        wallet: Pubkey,
        executor_cmd: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            rpc: RpcClient::new(rpc_url.to_string()),
            wallet,
            executor_cmd,
            timeout,
            amm_cache: RwLock::new(HashMap::new()),
        }
    }

    fn ata_for(&self, mint: &Pubkey) -> Pubkey {
        let token_program = Pubkey::from_str(TOKEN_PROGRAM_ID).unwrap();
        let ata_program = Pubkey::from_str(ATA_PROGRAM_ID).unwrap();
        Pubkey::find_program_address(
            &[self.wallet.as_ref(), token_program.as_ref(), mint.as_ref()],
            &ata_program,
        )
        .0
    }

    fn parse_pubkey(raw: &str) -> Result<Pubkey, EngineError> {
        Pubkey::from_str(raw)
            .map_err(|e| EngineError::NetworkPermanent(format!("bad pubkey {}: {}", raw, e)))
    }

    async fn amm_state(
        &self,
        pool_id: &str,
    ) -> Result<crate::amm_state::AmmState, EngineError> {
        if let Some(state) = self.amm_cache.read().await.get(pool_id) {
            return Ok(state.clone());
        }
        let key = Self::parse_pubkey(pool_id)?;
        let account = with_retry("get amm account", self.timeout, || async {
            self.rpc.get_account(&key).await.map_err(classify_rpc)
        })
        .await?;
        let state = decode_amm_state(&account.data)?;
        self.amm_cache
            .write()
            .await
            .insert(pool_id.to_string(), state.clone());
        Ok(state)
    }

    /// Two bulk reads for N pools: the AMM accounts, then every vault,
    /// open-orders account and our LP token account. Issued sequentially;
    /// concurrent RPC multiplexing is not assumed safe.
    async fn reserves_batch(
        &self,
        pool_ids: &[String],
    ) -> Result<HashMap<String, (PoolReserves, u64)>, EngineError> {
        if pool_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let amm_keys: Vec<Pubkey> = pool_ids
            .iter()
            .map(|id| Self::parse_pubkey(id))
            .collect::<Result<_, _>>()?;

        let amm_accounts = with_retry("get amm accounts", self.timeout, || async {
            self.rpc
                .get_multiple_accounts(&amm_keys)
                .await
                .map_err(classify_rpc)
        })
        .await?;

        let mut states = Vec::new();
        let mut detail_keys = Vec::new();
        for (pool_id, account) in pool_ids.iter().zip(amm_accounts) {
            let account = account.ok_or_else(|| {
                EngineError::NetworkPermanent(format!("AMM account {} missing", pool_id))
            })?;
            let state = decode_amm_state(&account.data)?;
            detail_keys.push(state.base_vault);
            detail_keys.push(state.quote_vault);
            detail_keys.push(state.open_orders);
            detail_keys.push(self.ata_for(&state.lp_mint));
            states.push((pool_id.clone(), state));
        }

        let detail_accounts = with_retry("get pool detail accounts", self.timeout, || async {
            self.rpc
                .get_multiple_accounts(&detail_keys)
                .await
                .map_err(classify_rpc)
        })
        .await?;

        let wsol = Pubkey::from_str(WSOL_MINT).unwrap();
        let mut out = HashMap::new();
        for (i, (pool_id, state)) in states.into_iter().enumerate() {
            let base = i * 4;
            let base_vault = match &detail_accounts[base] {
                Some(account) => decode_token_account(&account.data)?.amount,
                None => 0,
            };
            let quote_vault = match &detail_accounts[base + 1] {
                Some(account) => decode_token_account(&account.data)?.amount,
                None => 0,
            };
            let (base_oo, quote_oo) = match &detail_accounts[base + 2] {
                Some(account) => {
                    let totals = decode_open_orders(&account.data)?;
                    (totals.base_total, totals.quote_total)
                }
                None => (0, 0),
            };
            let lp_balance_raw = match &detail_accounts[base + 3] {
                Some(account) => decode_token_account(&account.data)?.amount,
                None => 0,
            };

            let reserves = PoolReserves {
                base_vault,
                quote_vault,
                base_open_orders: base_oo,
                quote_open_orders: quote_oo,
                base_need_take_pnl: state.base_need_take_pnl,
                quote_need_take_pnl: state.quote_need_take_pnl,
                lp_circulating: state.lp_reserve,
                base_decimals: state.base_decimals,
                quote_decimals: state.quote_decimals,
                base_is_wsol: state.base_mint == wsol,
            };
            out.insert(pool_id, (reserves, lp_balance_raw));
        }
        Ok(out)
    }

    /// Spawns the configured executor for one capital-moving operation and
    /// parses its JSON reply. The child is awaited (and thereby reaped)
    /// under the backend timeout; confirmation happens inside the executor
    /// before it prints its response.
    async fn run_executor(&self, args: &[String]) -> Result<ExecutorResponse, EngineError> {
        let cmd = self.executor_cmd.as_ref().ok_or_else(|| {
            EngineError::BackendExec {
                message: "EXECUTOR_CMD not configured".to_string(),
                signatures: vec![],
            }
        })?;

        debug!("executor: {} {}", cmd, args.join(" "));
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(cmd).args(args).output(),
        )
        .await
        .map_err(|_| {
            EngineError::NetworkTransient(format!(
                "executor timed out after {:?}",
                self.timeout
            ))
        })?
        .map_err(|e| EngineError::BackendExec {
            message: format!("failed to spawn executor: {}", e),
            signatures: vec![],
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response: ExecutorResponse = serde_json::from_str(stdout.trim()).map_err(|e| {
            EngineError::BackendExec {
                message: format!(
                    "unparseable executor reply ({}): {}",
                    e,
                    String::from_utf8_lossy(&output.stderr)
                ),
                signatures: vec![],
            }
        })?;

        if !response.success {
            // Partial state is surfaced with everything the chain gave us.
            for line in &response.logs {
                error!("executor log: {}", line);
            }
            return Err(EngineError::BackendExec {
                message: response
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string()),
                signatures: response.signatures,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ExecutionBackend for LiveBackend {
    async fn add_liquidity(
        &self,
        pool_id: &str,
        slippage_pct: f64,
    ) -> Result<AddLiquidityOutcome, EngineError> {
        let response = self
            .run_executor(&[
                "add-liquidity".to_string(),
                pool_id.to_string(),
                "--slippage".to_string(),
                slippage_pct.to_string(),
            ])
            .await?;
        let lp_mint = match response.lp_mint {
            Some(lp_mint) => lp_mint,
            None => self.amm_state(pool_id).await?.lp_mint.to_string(),
        };
        info!("✅ add-liquidity confirmed: {:?}", response.signatures);
        Ok(AddLiquidityOutcome {
            signatures: response.signatures,
            lp_mint,
        })
    }

    async fn remove_liquidity(
        &self,
        pool_id: &str,
        slippage_pct: f64,
    ) -> Result<Vec<String>, EngineError> {
        let response = self
            .run_executor(&[
                "remove-liquidity".to_string(),
                pool_id.to_string(),
                "--slippage".to_string(),
                slippage_pct.to_string(),
            ])
            .await?;
        info!("✅ remove-liquidity confirmed: {:?}", response.signatures);
        Ok(response.signatures)
    }

    async fn swap(
        &self,
        pool_id: &str,
        amount_in: u64,
        slippage_pct: f64,
        direction: SwapDirection,
    ) -> Result<Vec<String>, EngineError> {
        let direction_arg = match direction {
            SwapDirection::Buy => "buy",
            SwapDirection::Sell => "sell",
        };
        let response = self
            .run_executor(&[
                "swap".to_string(),
                pool_id.to_string(),
                direction_arg.to_string(),
                "--amount".to_string(),
                amount_in.to_string(),
                "--slippage".to_string(),
                slippage_pct.to_string(),
            ])
            .await?;
        Ok(response.signatures)
    }

    async fn lp_value(&self, pool_id: &str, _lp_mint: &str) -> Result<LpValuation, EngineError> {
        let batch = self.reserves_batch(&[pool_id.to_string()]).await?;
        let (reserves, lp_balance_raw) = batch.get(pool_id).ok_or_else(|| {
            EngineError::NetworkPermanent(format!("no reserves for pool {}", pool_id))
        })?;
        Ok(LpValuation {
            value_sol: lamports_to_sol(reserves.lp_value_lamports(*lp_balance_raw)),
            price_ratio: reserves.price_ratio(),
            lp_balance_raw: *lp_balance_raw,
        })
    }

    async fn lp_value_batch(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<String, LpValuation>, EngineError> {
        let pool_ids: Vec<String> = pairs.iter().map(|(pool_id, _)| pool_id.clone()).collect();
        let batch = self.reserves_batch(&pool_ids).await?;
        Ok(batch
            .into_iter()
            .map(|(pool_id, (reserves, lp_balance_raw))| {
                let valuation = LpValuation {
                    value_sol: lamports_to_sol(reserves.lp_value_lamports(lp_balance_raw)),
                    price_ratio: reserves.price_ratio(),
                    lp_balance_raw,
                };
                (pool_id, valuation)
            })
            .collect())
    }

    async fn balance(&self, mint: &str) -> Result<u64, EngineError> {
        let mint = Self::parse_pubkey(mint)?;
        let ata = self.ata_for(&mint);
        let account = with_retry("get token account", self.timeout, || async {
            self.rpc.get_account(&ata).await.map_err(classify_rpc)
        })
        .await;
        match account {
            Ok(account) => Ok(decode_token_account(&account.data)?.amount),
            // Missing account is a zero balance, not a failure.
            Err(EngineError::NetworkPermanent(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn native_balance(&self) -> Result<u64, EngineError> {
        with_retry("get balance", self.timeout, || async {
            self.rpc.get_balance(&self.wallet).await.map_err(classify_rpc)
        })
        .await
    }

    async fn list_tokens(&self) -> Result<Vec<(String, u64)>, EngineError> {
        let token_program = Pubkey::from_str(TOKEN_PROGRAM_ID).unwrap();
        let accounts = with_retry("get token accounts", self.timeout, || async {
            self.rpc
                .get_token_accounts_by_owner(
                    &self.wallet,
                    TokenAccountsFilter::ProgramId(token_program),
                )
                .await
                .map_err(classify_rpc)
        })
        .await?;

        let mut tokens = Vec::new();
        for keyed in accounts {
            if let solana_account_decoder::UiAccountData::Json(parsed) = keyed.account.data {
                let info = &parsed.parsed["info"];
                let mint = info["mint"].as_str().unwrap_or_default().to_string();
                let amount = info["tokenAmount"]["amount"]
                    .as_str()
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .unwrap_or(0);
                if !mint.is_empty() && amount > 0 {
                    tokens.push((mint, amount));
                }
            }
        }
        Ok(tokens)
    }

    async fn close_empty_accounts(&self, keep: &[String]) -> Result<(u32, Decimal), EngineError> {
        let mut args = vec!["close-accounts".to_string()];
        if !keep.is_empty() {
            args.push("--keep".to_string());
            args.push(keep.join(","));
        }
        let response = self.run_executor(&args).await?;
        let closed = response.closed.unwrap_or(0);
        let rent = response
            .rent
            .as_deref()
            .and_then(|raw| Decimal::from_str(raw).ok())
            .unwrap_or(Decimal::ZERO);
        Ok((closed, rent))
    }

    async fn unwrap_native(&self) -> Result<Decimal, EngineError> {
        let response = self.run_executor(&["unwrap".to_string()]).await?;
        let amount = response
            .amount
            .as_deref()
            .and_then(|raw| Decimal::from_str(raw).ok())
            .unwrap_or(Decimal::ZERO);
        Ok(amount)
    }

    async fn lp_holders(&self, lp_mint: &str) -> Result<LpHolders, EngineError> {
        let mint = Self::parse_pubkey(lp_mint)?;

        let supply = with_retry("get token supply", self.timeout, || async {
            self.rpc.get_token_supply(&mint).await.map_err(classify_rpc)
        })
        .await?;
        let supply_raw = supply
            .amount
            .parse::<u64>()
            .map_err(|e| EngineError::NetworkPermanent(format!("bad supply: {}", e)))?;

        let largest = with_retry("get largest accounts", self.timeout, || async {
            self.rpc
                .get_token_largest_accounts(&mint)
                .await
                .map_err(classify_rpc)
        })
        .await?;

        // The largest-accounts call returns token accounts; resolve each to
        // its owner so the lock registry can classify it.
        let account_keys: Vec<Pubkey> = largest
            .iter()
            .map(|entry| Self::parse_pubkey(&entry.address))
            .collect::<Result<_, _>>()?;
        let accounts = with_retry("resolve holder owners", self.timeout, || async {
            self.rpc
                .get_multiple_accounts(&account_keys)
                .await
                .map_err(classify_rpc)
        })
        .await?;

        let mut holders = Vec::new();
        for (entry, account) in largest.iter().zip(accounts) {
            let raw = entry.amount.amount.parse::<u64>().unwrap_or(0);
            let owner = match account {
                Some(account) => decode_token_account(&account.data)?.owner.to_string(),
                None => entry.address.clone(),
            };
            holders.push((owner, raw));
        }
        Ok(LpHolders {
            holders,
            supply: supply_raw,
        })
    }
}

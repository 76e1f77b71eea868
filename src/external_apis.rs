// REST clients for the three external services the engine consumes:
// the Raydium v3 pool listing API (pool directory), the RugCheck token
// report API (token safety), and SOL/USD pricing (CoinGecko primary,
// Jupiter fallback). All responses are mirrored with serde structs; raw
// upstream field names are kept via rename attributes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{FIAT_CACHE_TTL_SEC, POOL_CACHE_TTL_SEC};
use crate::errors::{classify_http, classify_status, EngineError};

pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

const USER_AGENT: &str = "sol-lp-agent/0.4";
const POOL_PAGE_SIZE: usize = 500;
const POOL_FETCH_CAP: usize = 1000;
const TOKEN_REPORT_TTL_SEC: u64 = 300;

// ============================================================================
// POOL DIRECTORY TYPES
// ============================================================================

/// One WSOL-quoted constant-product pool, immutable within a scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub pool_id: String,
    pub lp_mint: String,
    pub base_mint: String,
    pub quote_mint: String,
    pub base_symbol: String,
    pub quote_symbol: String,
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub tvl_usd: f64,
    pub volume_24h_usd: f64,
    pub apr_24h_pct: f64,
    pub burn_pct: f64,
    pub fee_tier_bps: u32,
}

impl Pool {
    /// Mint of the risked (non-WSOL) side.
    pub fn risk_mint(&self) -> &str {
        if self.base_mint == WSOL_MINT {
            &self.quote_mint
        } else {
            &self.base_mint
        }
    }

    pub fn risk_symbol(&self) -> &str {
        if self.base_mint == WSOL_MINT {
            &self.quote_symbol
        } else {
            &self.base_symbol
        }
    }

    pub fn has_wsol_side(&self) -> bool {
        self.base_mint == WSOL_MINT || self.quote_mint == WSOL_MINT
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RaydiumListResponse {
    pub success: bool,
    pub data: RaydiumListData,
}

#[derive(Debug, Clone, Deserialize)]
struct RaydiumListData {
    #[serde(default)]
    pub count: u64,
    #[serde(rename = "hasNextPage", default)]
    pub has_next_page: bool,
    pub data: Vec<RaydiumPoolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct RaydiumPoolInfo {
    #[serde(rename = "type")]
    pub pool_type: String,
    pub id: String,
    #[serde(rename = "mintA")]
    pub mint_a: RaydiumMint,
    #[serde(rename = "mintB")]
    pub mint_b: RaydiumMint,
    #[serde(rename = "feeRate")]
    pub fee_rate: f64,
    pub tvl: f64,
    pub day: RaydiumDayStats,
    #[serde(rename = "lpMint")]
    pub lp_mint: RaydiumMint,
    #[serde(rename = "burnPercent", default)]
    pub burn_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct RaydiumMint {
    pub address: String,
    #[serde(default)]
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
struct RaydiumDayStats {
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub apr: f64,
}

// ============================================================================
// POOL DIRECTORY CLIENT
// ============================================================================

/// Fetches and caches the WSOL-quoted standard-pool listing. Failures fall
/// back to the last complete listing; the scheduler is never blocked on a
/// dead listing service.
pub struct PoolDirectory {
    client: Client,
    base_url: String,
    cache: RwLock<Option<(Instant, Vec<Pool>)>>,
}

impl PoolDirectory {
    pub fn new() -> Self {
        Self::with_base_url("https://api-v3.raydium.io".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            cache: RwLock::new(None),
        }
    }

    /// Directory pre-seeded with a listing, for tests that must not touch
    /// the network.
    #[cfg(test)]
    pub fn with_cached_listing(pools: Vec<Pool>) -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            cache: RwLock::new(Some((Instant::now(), pools))),
        }
    }

    pub async fn list_wsol_pools(&self) -> Result<Vec<Pool>, EngineError> {
        if let Some((fetched_at, pools)) = self.cache.read().await.as_ref() {
            if fetched_at.elapsed() < Duration::from_secs(POOL_CACHE_TTL_SEC) {
                debug!("pool directory: serving {} pools from cache", pools.len());
                return Ok(pools.clone());
            }
        }

        match self.fetch_all_pages().await {
            Ok(pools) => {
                info!("📋 Pool directory refreshed: {} WSOL pools", pools.len());
                *self.cache.write().await = Some((Instant::now(), pools.clone()));
                Ok(pools)
            }
            Err(e) => {
                if let Some((_, stale)) = self.cache.read().await.as_ref() {
                    warn!(
                        "⚠️ Pool listing fetch failed ({}); serving {} stale pools",
                        e,
                        stale.len()
                    );
                    return Ok(stale.clone());
                }
                Err(EngineError::Fetch(e.to_string()))
            }
        }
    }

    async fn fetch_all_pages(&self) -> Result<Vec<Pool>, EngineError> {
        let mut pools = Vec::new();
        let mut page = 1u32;

        loop {
            // The mint1 query narrows the listing server-side to pools with
            // a WSOL leg; the type filter keeps it to constant-product pools.
            let url = format!(
                "{}/pools/info/mint?mint1={}&poolType=standard&poolSortField=volume24h&sortType=desc&pageSize={}&page={}",
                self.base_url, WSOL_MINT, POOL_PAGE_SIZE, page
            );

            let response = self
                .client
                .get(&url)
                .header("User-Agent", USER_AGENT)
                .send()
                .await
                .map_err(classify_http)?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &text));
            }

            let listing: RaydiumListResponse = response.json().await.map_err(classify_http)?;
            if !listing.success {
                return Err(EngineError::NetworkPermanent(
                    "pool listing API reported success=false".into(),
                ));
            }

            let has_next = listing.data.has_next_page;
            for info in listing.data.data {
                if let Some(pool) = map_pool(info) {
                    pools.push(pool);
                }
            }

            if pools.len() >= POOL_FETCH_CAP || !has_next {
                break;
            }
            page += 1;
        }

        pools.truncate(POOL_FETCH_CAP);
        Ok(pools)
    }
}

fn map_pool(info: RaydiumPoolInfo) -> Option<Pool> {
    if !info.pool_type.eq_ignore_ascii_case("standard") {
        return None;
    }
    let pool = Pool {
        pool_id: info.id,
        lp_mint: info.lp_mint.address,
        base_mint: info.mint_a.address,
        quote_mint: info.mint_b.address,
        base_symbol: info.mint_a.symbol,
        quote_symbol: info.mint_b.symbol,
        base_decimals: info.mint_a.decimals,
        quote_decimals: info.mint_b.decimals,
        tvl_usd: info.tvl,
        volume_24h_usd: info.day.volume,
        apr_24h_pct: info.day.apr,
        burn_pct: info.burn_percent,
        fee_tier_bps: (info.fee_rate * 10_000.0).round() as u32,
    };
    // The mint1 filter is coarse; drop anything that slipped through.
    pool.has_wsol_side().then_some(pool)
}

// ============================================================================
// TOKEN SAFETY (RUGCHECK) TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenReport {
    #[serde(default)]
    pub score: f64,
    #[serde(rename = "score_normalised", default)]
    pub score_normalised: f64,
    #[serde(default)]
    pub risks: Vec<TokenRisk>,
    #[serde(rename = "topHolders", default)]
    pub top_holders: Vec<TokenHolder>,
    #[serde(rename = "totalHolders", default)]
    pub total_holders: u64,
    #[serde(rename = "freezeAuthority")]
    pub freeze_authority: Option<String>,
    #[serde(rename = "mintAuthority")]
    pub mint_authority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRisk {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub score: f64,
    /// "danger" | "warn" | "info"
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenHolder {
    pub address: String,
    #[serde(default)]
    pub pct: f64,
    #[serde(default)]
    pub insider: bool,
}

/// Client for the token-safety scoring service. Reports are cached briefly
/// so a pool re-screened within one scan window costs one remote read.
pub struct TokenSafetyClient {
    client: Client,
    base_url: String,
    cache: RwLock<HashMap<String, (Instant, TokenReport)>>,
}

impl TokenSafetyClient {
    pub fn new() -> Self {
        Self::with_base_url("https://api.rugcheck.xyz".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn token_report(&self, mint: &str) -> Result<TokenReport, EngineError> {
        if let Some((fetched_at, report)) = self.cache.read().await.get(mint) {
            if fetched_at.elapsed() < Duration::from_secs(TOKEN_REPORT_TTL_SEC) {
                return Ok(report.clone());
            }
        }

        let url = format!("{}/v1/tokens/{}/report", self.base_url, mint);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(classify_http)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let report: TokenReport = response.json().await.map_err(classify_http)?;
        self.cache
            .write()
            .await
            .insert(mint.to_string(), (Instant::now(), report.clone()));
        Ok(report)
    }
}

// ============================================================================
// FIAT PRICE (COINGECKO PRIMARY, JUPITER FALLBACK)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct CoinGeckoSimplePrice {
    pub solana: CoinGeckoUsd,
}

#[derive(Debug, Clone, Deserialize)]
struct CoinGeckoUsd {
    pub usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct JupiterPriceResponse {
    pub data: HashMap<String, JupiterPriceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct JupiterPriceEntry {
    pub price: String,
}

/// SOL/USD oracle with primary + fallback sources and a 60 s cache. A dead
/// pricing service degrades the USD column of the display, never the engine.
pub struct FiatPriceClient {
    client: Client,
    coingecko_api_key: Option<String>,
    cache: RwLock<Option<(Instant, f64)>>,
}

impl FiatPriceClient {
    pub fn new(coingecko_api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            coingecko_api_key,
            cache: RwLock::new(None),
        }
    }

    pub async fn sol_usd(&self) -> Result<f64, EngineError> {
        if let Some((fetched_at, price)) = *self.cache.read().await {
            if fetched_at.elapsed() < Duration::from_secs(FIAT_CACHE_TTL_SEC) {
                return Ok(price);
            }
        }

        let price = match self.fetch_coingecko().await {
            Ok(price) => price,
            Err(primary_err) => {
                warn!(
                    "⚠️ CoinGecko SOL/USD failed ({}); falling back to Jupiter",
                    primary_err
                );
                match self.fetch_jupiter().await {
                    Ok(price) => price,
                    Err(fallback_err) => {
                        if let Some((_, stale)) = *self.cache.read().await {
                            warn!("⚠️ Both fiat sources failed; serving stale SOL/USD");
                            return Ok(stale);
                        }
                        return Err(fallback_err);
                    }
                }
            }
        };

        *self.cache.write().await = Some((Instant::now(), price));
        Ok(price)
    }

    async fn fetch_coingecko(&self) -> Result<f64, EngineError> {
        let url = "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd";
        let mut request = self.client.get(url).header("User-Agent", USER_AGENT);
        if let Some(key) = &self.coingecko_api_key {
            request = request.header("x-cg-demo-api-key", key);
        }

        let response = request.send().await.map_err(classify_http)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: CoinGeckoSimplePrice = response.json().await.map_err(classify_http)?;
        Ok(parsed.solana.usd)
    }

    async fn fetch_jupiter(&self) -> Result<f64, EngineError> {
        let url = format!("https://lite-api.jup.ag/price/v2?ids={}", WSOL_MINT);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(classify_http)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: JupiterPriceResponse = response.json().await.map_err(classify_http)?;
        let entry = parsed.data.get(WSOL_MINT).ok_or_else(|| {
            EngineError::NetworkPermanent("Jupiter price response missing WSOL entry".into())
        })?;
        entry
            .price
            .parse::<f64>()
            .map_err(|e| EngineError::NetworkPermanent(format!("bad Jupiter price: {}", e)))
    }
}

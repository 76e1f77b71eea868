// Fixed-offset decoding of the on-chain accounts the live backend reads:
// the AMM v4 state account, the market open-orders account, and SPL token
// accounts. Amount fields stay u64 end-to-end; nothing here goes through
// floating point.
//
// The AMM v4 account is 752 bytes: 32 u64 config/state fields, the swap
// accumulators (u128/u64 mix), twelve pubkeys, the internal lp_reserve
// counter and 3 u64 of padding. Offsets below index into that layout.

use solana_sdk::pubkey::Pubkey;

use crate::errors::EngineError;

pub const AMM_STATE_LEN: usize = 752;
pub const TOKEN_ACCOUNT_LEN: usize = 165;
pub const OPEN_ORDERS_MIN_LEN: usize = 109;

const BASE_DECIMAL_OFFSET: usize = 32;
const QUOTE_DECIMAL_OFFSET: usize = 40;
const BASE_NEED_TAKE_PNL_OFFSET: usize = 192;
const QUOTE_NEED_TAKE_PNL_OFFSET: usize = 200;
const BASE_VAULT_OFFSET: usize = 336;
const QUOTE_VAULT_OFFSET: usize = 368;
const BASE_MINT_OFFSET: usize = 400;
const QUOTE_MINT_OFFSET: usize = 432;
const LP_MINT_OFFSET: usize = 464;
const OPEN_ORDERS_OFFSET: usize = 496;
const LP_RESERVE_OFFSET: usize = 720;

// Serum open-orders: 5-byte header + accountFlags(8) + market(32) + owner(32),
// then nativeCoinFree/Total and nativePcFree/Total as u64.
const OO_NATIVE_BASE_TOTAL_OFFSET: usize = 85;
const OO_NATIVE_QUOTE_TOTAL_OFFSET: usize = 101;

// SPL token account: mint(32) + owner(32) + amount(8) + ...
const TOKEN_MINT_OFFSET: usize = 0;
const TOKEN_OWNER_OFFSET: usize = 32;
const TOKEN_AMOUNT_OFFSET: usize = 64;

/// Fields of the AMM state account the oracle and backend need.
#[derive(Debug, Clone)]
pub struct AmmState {
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub base_need_take_pnl: u64,
    pub quote_need_take_pnl: u64,
    pub base_vault: Pubkey,
    pub quote_vault: Pubkey,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
    pub lp_mint: Pubkey,
    pub open_orders: Pubkey,
    /// The AMM's internal LP accounting counter. This, not the LP mint
    /// supply, is the circulating figure: burned LP shrinks the mint supply
    /// below what the AMM still accounts for.
    pub lp_reserve: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOrdersTotals {
    pub base_total: u64,
    pub quote_total: u64,
}

#[derive(Debug, Clone)]
pub struct TokenAccount {
    pub mint: Pubkey,
    pub owner: Pubkey,
    pub amount: u64,
}

fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn read_pubkey(data: &[u8], offset: usize) -> Pubkey {
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&data[offset..offset + 32]);
    Pubkey::new_from_array(buf)
}

pub fn decode_amm_state(data: &[u8]) -> Result<AmmState, EngineError> {
    if data.len() < AMM_STATE_LEN {
        return Err(EngineError::NetworkPermanent(format!(
            "AMM state account too short: {} bytes",
            data.len()
        )));
    }
    Ok(AmmState {
        base_decimals: read_u64_le(data, BASE_DECIMAL_OFFSET) as u8,
        quote_decimals: read_u64_le(data, QUOTE_DECIMAL_OFFSET) as u8,
        base_need_take_pnl: read_u64_le(data, BASE_NEED_TAKE_PNL_OFFSET),
        quote_need_take_pnl: read_u64_le(data, QUOTE_NEED_TAKE_PNL_OFFSET),
        base_vault: read_pubkey(data, BASE_VAULT_OFFSET),
        quote_vault: read_pubkey(data, QUOTE_VAULT_OFFSET),
        base_mint: read_pubkey(data, BASE_MINT_OFFSET),
        quote_mint: read_pubkey(data, QUOTE_MINT_OFFSET),
        lp_mint: read_pubkey(data, LP_MINT_OFFSET),
        open_orders: read_pubkey(data, OPEN_ORDERS_OFFSET),
        lp_reserve: read_u64_le(data, LP_RESERVE_OFFSET),
    })
}

pub fn decode_open_orders(data: &[u8]) -> Result<OpenOrdersTotals, EngineError> {
    if data.len() < OPEN_ORDERS_MIN_LEN {
        return Err(EngineError::NetworkPermanent(format!(
            "open-orders account too short: {} bytes",
            data.len()
        )));
    }
    Ok(OpenOrdersTotals {
        base_total: read_u64_le(data, OO_NATIVE_BASE_TOTAL_OFFSET),
        quote_total: read_u64_le(data, OO_NATIVE_QUOTE_TOTAL_OFFSET),
    })
}

pub fn decode_token_account(data: &[u8]) -> Result<TokenAccount, EngineError> {
    if data.len() < TOKEN_ACCOUNT_LEN {
        return Err(EngineError::NetworkPermanent(format!(
            "token account too short: {} bytes",
            data.len()
        )));
    }
    Ok(TokenAccount {
        mint: read_pubkey(data, TOKEN_MINT_OFFSET),
        owner: read_pubkey(data, TOKEN_OWNER_OFFSET),
        amount: read_u64_le(data, TOKEN_AMOUNT_OFFSET),
    })
}

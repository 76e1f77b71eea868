// Terminal status renderer. The display worker snapshots engine state
// under the lock and renders here afterwards; nothing in this module
// touches the backend or the network.

use chrono::{DateTime, Utc};
use colored::*;
use rust_decimal::Decimal;

use crate::positions::Position;

#[derive(Debug, Clone)]
pub struct DisplaySnapshot {
    pub now: DateTime<Utc>,
    pub trading_enabled: bool,
    pub dry_run: bool,
    pub wallet_sol: Decimal,
    pub sol_usd: Option<f64>,
    pub open_positions: Vec<Position>,
    pub in_flight_sells: usize,
    pub trades_closed: u64,
    pub realized_pnl_sol: Decimal,
    pub banned_pools: usize,
    pub cooling_pools: usize,
    pub scans_completed: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub recent_events: Vec<String>,
}

fn format_age(seconds: i64) -> String {
    let hours = seconds / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else {
        format!("{}m{:02}s", minutes, seconds % 60)
    }
}

fn pnl_colored(pnl_pct: f64) -> ColoredString {
    let text = format!("{:+.2}%", pnl_pct);
    if pnl_pct >= 0.0 {
        text.bright_green()
    } else {
        text.bright_red()
    }
}

pub fn render(snapshot: &DisplaySnapshot) {
    println!("\n{}", "=".repeat(80).bright_black());

    let mode = if snapshot.dry_run {
        "DRY RUN".bright_yellow().bold()
    } else if snapshot.trading_enabled {
        "LIVE".bright_green().bold()
    } else {
        "PAUSED".bright_red().bold()
    };
    let usd = snapshot
        .sol_usd
        .map(|px| format!("${:.2}", px))
        .unwrap_or_else(|| "--".to_string());
    println!(
        "{} LP agent [{}] | {} | wallet {} SOL | SOL {}",
        "💧".bright_cyan(),
        mode,
        snapshot.now.format("%H:%M:%S UTC"),
        format!("{:.4}", snapshot.wallet_sol).bright_white().bold(),
        usd.bright_black(),
    );
    println!(
        "   open {} | selling {} | closed {} | realized {} SOL | banned {} | cooling {} | scans {}",
        snapshot.open_positions.len().to_string().bright_white(),
        snapshot.in_flight_sells,
        snapshot.trades_closed,
        format!("{:+.4}", snapshot.realized_pnl_sol),
        snapshot.banned_pools,
        snapshot.cooling_pools,
        snapshot.scans_completed,
    );
    println!("{}", "-".repeat(80).bright_black());

    if snapshot.open_positions.is_empty() {
        println!("   {}", "no open positions".bright_black());
    } else {
        println!(
            "   {:<10} {:>8} {:>12} {:>12} {:>9} {:>9}",
            "TOKEN".bright_black(),
            "AGE".bright_black(),
            "ENTRY SOL".bright_black(),
            "VALUE SOL".bright_black(),
            "P&L".bright_black(),
            "IL".bright_black(),
        );
        for position in &snapshot.open_positions {
            let age = format_age(position.hold_seconds(snapshot.now));
            println!(
                "   {:<10} {:>8} {:>12} {:>12} {:>9} {:>9}",
                position.token_symbol.bright_cyan(),
                age,
                format!("{:.4}", position.entry_amount_sol),
                format!("{:.4}", position.last_value_sol).bright_white(),
                pnl_colored(position.last_pnl_pct),
                format!("{:.2}%", position.last_il_pct).yellow(),
            );
        }
    }

    if !snapshot.recent_events.is_empty() {
        println!("{}", "-".repeat(80).bright_black());
        for event in snapshot.recent_events.iter().rev().take(5) {
            println!("   {} {}", "·".bright_black(), event.bright_black());
        }
    }
    println!("{}", "=".repeat(80).bright_black());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_formatting() {
        assert_eq!(format_age(59), "0m59s");
        assert_eq!(format_age(61), "1m01s");
        assert_eq!(format_age(3_600), "1h00m");
        assert_eq!(format_age(93_780), "26h03m");
    }
}

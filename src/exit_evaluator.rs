// Exit arbitration. Five predicates, fixed order, first match wins:
// GHOST -> STOP_LOSS -> TAKE_PROFIT -> IL -> TIME. Ghost is a correctness
// condition (a zero-LP position must stop being treated as live), stop-loss
// pre-empts take-profit under fast reversals, IL is the risk gate, and the
// hold-time cap keeps capital from stranding.

use chrono::{DateTime, Utc};
use num_traits::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::positions::{ExitReason, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    Exit(ExitReason),
}

/// P&L against the SOL put in, in percent.
pub fn pnl_pct(entry_amount_sol: Decimal, value_sol: Decimal) -> f64 {
    if entry_amount_sol.is_zero() {
        return 0.0;
    }
    (((value_sol - entry_amount_sol) / entry_amount_sol) * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}

/// Closed-form constant-product impermanent loss versus holding:
/// IL = 2·√r/(1+r) − 1 for r = last/entry. Always ≤ 0.
pub fn il_pct(entry_price_ratio: f64, last_price_ratio: f64) -> f64 {
    if entry_price_ratio <= 0.0 || last_price_ratio <= 0.0 {
        return 0.0;
    }
    let r = last_price_ratio / entry_price_ratio;
    (2.0 * r.sqrt() / (1.0 + r) - 1.0) * 100.0
}

pub fn evaluate(
    position: &Position,
    lp_balance_raw: u64,
    now: DateTime<Utc>,
    config: &Config,
) -> ExitDecision {
    if lp_balance_raw == 0 {
        return ExitDecision::Exit(ExitReason::Ghost);
    }
    if position.last_pnl_pct <= config.stop_loss_pct {
        return ExitDecision::Exit(ExitReason::StopLoss);
    }
    if position.last_pnl_pct >= config.take_profit_pct {
        return ExitDecision::Exit(ExitReason::TakeProfit);
    }
    if position.last_il_pct <= config.max_il_pct {
        return ExitDecision::Exit(ExitReason::Il);
    }
    let held_hours = position.hold_seconds(now) as f64 / 3_600.0;
    if held_hours >= config.max_hold_hours {
        return ExitDecision::Exit(ExitReason::Time);
    }
    ExitDecision::Hold
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn position_with(pnl: f64, il: f64, age_hours: i64) -> Position {
        let opened = Utc::now() - Duration::hours(age_hours);
        let mut position = Position::new(
            "pool-a".to_string(),
            "lp".to_string(),
            "mint".to_string(),
            "TKN".to_string(),
            1.0,
            Decimal::ONE,
            1_000,
            opened,
        );
        position.last_pnl_pct = pnl;
        position.last_il_pct = il;
        position
    }

    #[test]
    fn holds_inside_all_thresholds() {
        let config = Config::default();
        let position = position_with(2.0, -1.0, 1);
        assert_eq!(
            evaluate(&position, 1_000, Utc::now(), &config),
            ExitDecision::Hold
        );
    }

    #[test]
    fn each_predicate_fires_alone() {
        let config = Config::default();
        let now = Utc::now();

        let sl = position_with(-20.0, 0.0, 1);
        assert_eq!(
            evaluate(&sl, 1, now, &config),
            ExitDecision::Exit(ExitReason::StopLoss)
        );

        let tp = position_with(30.0, 0.0, 1);
        assert_eq!(
            evaluate(&tp, 1, now, &config),
            ExitDecision::Exit(ExitReason::TakeProfit)
        );

        let il = position_with(0.0, -12.0, 1);
        assert_eq!(
            evaluate(&il, 1, now, &config),
            ExitDecision::Exit(ExitReason::Il)
        );

        let old = position_with(0.0, 0.0, 49);
        assert_eq!(
            evaluate(&old, 1, now, &config),
            ExitDecision::Exit(ExitReason::Time)
        );
    }

    #[test]
    fn ghost_wins_over_everything() {
        let config = Config::default();
        let position = position_with(-99.0, -50.0, 999);
        assert_eq!(
            evaluate(&position, 0, Utc::now(), &config),
            ExitDecision::Exit(ExitReason::Ghost)
        );
    }

    #[test]
    fn stop_loss_wins_over_time() {
        // Simultaneously past stop-loss and max hold: capital protection
        // names the exit.
        let config = Config::default();
        let position = position_with(-20.0, 0.0, 100);
        assert_eq!(
            evaluate(&position, 1, Utc::now(), &config),
            ExitDecision::Exit(ExitReason::StopLoss)
        );
    }

    #[test]
    fn adding_triggers_never_changes_the_reason() {
        // Monotonicity: once STOP_LOSS is chosen, tripping IL and TIME on
        // the next tick still yields STOP_LOSS.
        let config = Config::default();
        let now = Utc::now();
        let t0 = position_with(-20.0, 0.0, 1);
        let first = evaluate(&t0, 1, now, &config);

        let t1 = position_with(-25.0, -15.0, 100);
        let second = evaluate(&t1, 1, now, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn il_formula_closed_form() {
        assert!((il_pct(1.0, 1.0)).abs() < 1e-12);
        // r = 4: 2·2/5 − 1 = −0.2
        assert!((il_pct(1.0, 4.0) + 20.0).abs() < 1e-9);
        // symmetric in direction: r and 1/r give the same IL
        assert!((il_pct(1.0, 4.0) - il_pct(4.0, 1.0)).abs() < 1e-9);
        // never positive
        for r in [0.1, 0.5, 0.9, 1.1, 2.0, 10.0] {
            assert!(il_pct(1.0, r) <= 0.0);
        }
    }

    #[test]
    fn pnl_math() {
        assert!((pnl_pct(Decimal::ONE, Decimal::new(13, 1)) - 30.0).abs() < 1e-9);
        assert!((pnl_pct(Decimal::ONE, Decimal::new(7, 1)) + 30.0).abs() < 1e-9);
        assert_eq!(pnl_pct(Decimal::ZERO, Decimal::ONE), 0.0);
    }
}

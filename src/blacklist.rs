// Progressive pool blacklist. Every exit leaves a cooldown; consecutive
// stop-losses escalate through the tier table and promote to a permanent
// ban at the strike threshold. A ghost exit (rugged pool) bans instantly.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::positions::ExitReason;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub pool_id: String,
    pub since_ts: DateTime<Utc>,
    pub until_ts: DateTime<Utc>,
    pub consecutive_sl_strikes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub pool_id: String,
    pub reason: String,
    pub since_ts: DateTime<Utc>,
}

#[derive(Default)]
pub struct Blacklist {
    cooldowns: HashMap<String, CooldownEntry>,
    permanent: HashMap<String, BlacklistEntry>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(cooldowns: Vec<CooldownEntry>, blacklist: Vec<BlacklistEntry>) -> Self {
        Self {
            cooldowns: cooldowns
                .into_iter()
                .map(|c| (c.pool_id.clone(), c))
                .collect(),
            permanent: blacklist
                .into_iter()
                .map(|b| (b.pool_id.clone(), b))
                .collect(),
        }
    }

    /// Applies the escalation policy for one closed position.
    pub fn record_exit(
        &mut self,
        pool_id: &str,
        reason: ExitReason,
        now: DateTime<Utc>,
        tiers_sec: &[u64],
        permanent_strikes: u32,
    ) {
        if self.permanent.contains_key(pool_id) {
            return;
        }

        match reason {
            ExitReason::Ghost => {
                warn!("🚫 Pool {} permanently blacklisted: ghost position", pool_id);
                self.ban(pool_id, "ghost position (zero LP balance on chain)", now);
            }
            ExitReason::StopLoss => {
                let strikes = self
                    .cooldowns
                    .get(pool_id)
                    .map(|c| c.consecutive_sl_strikes)
                    .unwrap_or(0)
                    + 1;
                if strikes >= permanent_strikes {
                    warn!(
                        "🚫 Pool {} permanently blacklisted after {} consecutive stop-losses",
                        pool_id, strikes
                    );
                    self.ban(
                        pool_id,
                        &format!("{} consecutive stop-loss exits", strikes),
                        now,
                    );
                    return;
                }
                let tier_idx = ((strikes - 1) as usize).min(tiers_sec.len() - 1);
                let cooldown = tiers_sec[tier_idx];
                info!(
                    "⏳ Pool {} cooling down {}s (stop-loss strike {})",
                    pool_id, cooldown, strikes
                );
                self.set_cooldown(pool_id, now, cooldown, strikes);
            }
            ExitReason::TakeProfit => {
                // A winning exit clears the strike history.
                self.set_cooldown(pool_id, now, tiers_sec[0], 0);
            }
            ExitReason::Il | ExitReason::Time | ExitReason::Manual => {
                let strikes = self
                    .cooldowns
                    .get(pool_id)
                    .map(|c| c.consecutive_sl_strikes)
                    .unwrap_or(0);
                self.set_cooldown(pool_id, now, tiers_sec[0], strikes);
            }
        }
    }

    fn set_cooldown(&mut self, pool_id: &str, now: DateTime<Utc>, secs: u64, strikes: u32) {
        self.cooldowns.insert(
            pool_id.to_string(),
            CooldownEntry {
                pool_id: pool_id.to_string(),
                since_ts: now,
                until_ts: now + Duration::seconds(secs as i64),
                consecutive_sl_strikes: strikes,
            },
        );
    }

    fn ban(&mut self, pool_id: &str, reason: &str, now: DateTime<Utc>) {
        self.cooldowns.remove(pool_id);
        self.permanent.insert(
            pool_id.to_string(),
            BlacklistEntry {
                pool_id: pool_id.to_string(),
                reason: reason.to_string(),
                since_ts: now,
            },
        );
    }

    /// False while permanently banned or still inside a cooldown window.
    pub fn is_eligible(&self, pool_id: &str, now: DateTime<Utc>) -> bool {
        if self.permanent.contains_key(pool_id) {
            return false;
        }
        match self.cooldowns.get(pool_id) {
            Some(entry) => now >= entry.until_ts,
            None => true,
        }
    }

    pub fn is_banned(&self, pool_id: &str) -> bool {
        self.permanent.contains_key(pool_id)
    }

    pub fn strikes(&self, pool_id: &str) -> u32 {
        self.cooldowns
            .get(pool_id)
            .map(|c| c.consecutive_sl_strikes)
            .unwrap_or(0)
    }

    /// Expired cooldowns with no strike history carry no information; drop
    /// them before serializing. Strike counters outlive their windows.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.cooldowns
            .retain(|_, c| c.consecutive_sl_strikes > 0 || now < c.until_ts);
    }

    pub fn cooldown_entries(&self) -> Vec<CooldownEntry> {
        let mut entries: Vec<CooldownEntry> = self.cooldowns.values().cloned().collect();
        entries.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        entries
    }

    pub fn blacklist_entries(&self) -> Vec<BlacklistEntry> {
        let mut entries: Vec<BlacklistEntry> = self.permanent.values().cloned().collect();
        entries.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        entries
    }

    pub fn banned_count(&self) -> usize {
        self.permanent.len()
    }

    pub fn cooling_count(&self, now: DateTime<Utc>) -> usize {
        self.cooldowns.values().filter(|c| now < c.until_ts).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIERS: &[u64] = &[86_400, 172_800];

    #[test]
    fn stop_loss_escalates_through_tiers_then_bans() {
        let mut blacklist = Blacklist::new();
        let now = Utc::now();

        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        assert_eq!(blacklist.strikes("pool-a"), 1);
        let entry = &blacklist.cooldown_entries()[0];
        assert_eq!((entry.until_ts - entry.since_ts).num_seconds(), 86_400);

        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        assert_eq!(blacklist.strikes("pool-a"), 2);
        let entry = &blacklist.cooldown_entries()[0];
        assert_eq!((entry.until_ts - entry.since_ts).num_seconds(), 172_800);

        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        assert!(blacklist.is_banned("pool-a"));
        assert!(!blacklist.is_eligible("pool-a", now + Duration::days(365)));
    }

    #[test]
    fn take_profit_resets_strikes() {
        let mut blacklist = Blacklist::new();
        let now = Utc::now();
        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        assert_eq!(blacklist.strikes("pool-a"), 2);

        blacklist.record_exit("pool-a", ExitReason::TakeProfit, now, TIERS, 3);
        assert_eq!(blacklist.strikes("pool-a"), 0);
        // cooldown returned to tier 0
        let entry = &blacklist.cooldown_entries()[0];
        assert_eq!((entry.until_ts - entry.since_ts).num_seconds(), 86_400);
        // and the next stop-loss starts the ladder over
        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        assert_eq!(blacklist.strikes("pool-a"), 1);
    }

    #[test]
    fn ghost_bans_immediately() {
        let mut blacklist = Blacklist::new();
        let now = Utc::now();
        blacklist.record_exit("pool-a", ExitReason::Ghost, now, TIERS, 3);
        assert!(blacklist.is_banned("pool-a"));
    }

    #[test]
    fn il_and_time_leave_strikes_untouched() {
        let mut blacklist = Blacklist::new();
        let now = Utc::now();
        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        blacklist.record_exit("pool-a", ExitReason::Time, now, TIERS, 3);
        assert_eq!(blacklist.strikes("pool-a"), 1);
        blacklist.record_exit("pool-a", ExitReason::Il, now, TIERS, 3);
        assert_eq!(blacklist.strikes("pool-a"), 1);
    }

    #[test]
    fn eligibility_follows_cooldown_window() {
        let mut blacklist = Blacklist::new();
        let now = Utc::now();
        blacklist.record_exit("pool-a", ExitReason::Time, now, TIERS, 3);
        assert!(!blacklist.is_eligible("pool-a", now));
        assert!(!blacklist.is_eligible("pool-a", now + Duration::seconds(86_399)));
        assert!(blacklist.is_eligible("pool-a", now + Duration::seconds(86_400)));
        assert!(blacklist.is_eligible("pool-never-seen", now));
    }

    #[test]
    fn restore_round_trip() {
        let mut blacklist = Blacklist::new();
        let now = Utc::now();
        blacklist.record_exit("pool-a", ExitReason::StopLoss, now, TIERS, 3);
        blacklist.record_exit("pool-b", ExitReason::Ghost, now, TIERS, 3);

        let restored =
            Blacklist::restore(blacklist.cooldown_entries(), blacklist.blacklist_entries());
        assert_eq!(restored.strikes("pool-a"), 1);
        assert!(restored.is_banned("pool-b"));
    }

    #[test]
    fn prune_keeps_strike_history() {
        let mut blacklist = Blacklist::new();
        let now = Utc::now();
        blacklist.record_exit("strikes", ExitReason::StopLoss, now, TIERS, 3);
        blacklist.record_exit("clean", ExitReason::TakeProfit, now, TIERS, 3);

        blacklist.prune(now + Duration::days(30));
        assert_eq!(blacklist.strikes("strikes"), 1);
        assert!(blacklist.cooldown_entries().iter().all(|c| c.pool_id != "clean"));
    }
}

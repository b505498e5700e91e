//! Tier-driven user quotas with lazy counter rollover.

use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn parse(s: &str) -> Tier {
        match s.to_lowercase().as_str() {
            "premium" => Tier::Premium,
            "enterprise" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }
}

/// Per-tier quota ceilings.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotaPolicy {
    pub daily_minutes: f64,
    pub monthly_minutes: f64,
    pub max_file_size_mb: u64,
    pub concurrent_jobs: u32,
    pub api_calls_per_hour: u32,
    pub storage_gb: f64,
}

impl QuotaPolicy {
    pub fn for_tier(tier: Tier) -> QuotaPolicy {
        match tier {
            Tier::Free => QuotaPolicy {
                daily_minutes: 60.0,
                monthly_minutes: 600.0,
                max_file_size_mb: 50,
                concurrent_jobs: 2,
                api_calls_per_hour: 100,
                storage_gb: 1.0,
            },
            Tier::Premium => QuotaPolicy {
                daily_minutes: 480.0,
                monthly_minutes: 4800.0,
                max_file_size_mb: 500,
                concurrent_jobs: 10,
                api_calls_per_hour: 1000,
                storage_gb: 50.0,
            },
            Tier::Enterprise => QuotaPolicy {
                daily_minutes: 1440.0,
                monthly_minutes: 14_400.0,
                max_file_size_mb: 2000,
                concurrent_jobs: 50,
                api_calls_per_hour: 5000,
                storage_gb: 500.0,
            },
        }
    }
}

/// Running usage for one user. Daily/hourly counters reset lazily when a
/// read observes that the day or hour rolled over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub minutes_used_today: f64,
    pub minutes_used_month: f64,
    pub storage_used_gb: f64,
    pub api_calls_this_hour: u32,
    pub active_jobs: u32,
    pub last_reset: DateTime<Utc>,
}

impl QuotaUsage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            minutes_used_today: 0.0,
            minutes_used_month: 0.0,
            storage_used_gb: 0.0,
            api_calls_this_hour: 0,
            active_jobs: 0,
            last_reset: now,
        }
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        if now.date_naive() > self.last_reset.date_naive() {
            self.minutes_used_today = 0.0;
        }
        if now.date_naive().month() != self.last_reset.date_naive().month()
            || now.date_naive().year() != self.last_reset.date_naive().year()
        {
            self.minutes_used_month = 0.0;
        }
        if now.date_naive() != self.last_reset.date_naive() || now.hour() != self.last_reset.hour()
        {
            self.api_calls_this_hour = 0;
        }
        self.last_reset = now;
    }
}

/// What an operation is about to consume.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaRequest {
    pub minutes: f64,
    pub file_size_mb: f64,
    pub storage_gb: f64,
    pub jobs: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemainingQuota {
    pub daily_minutes: f64,
    pub monthly_minutes: f64,
    pub storage_gb: f64,
    pub concurrent_jobs: u32,
}

/// Quota check outcome. `violations` lists every failing rule, not just
/// the first.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub violations: Vec<String>,
    pub remaining: RemainingQuota,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaSummary {
    pub user_id: String,
    pub tier: Tier,
    pub usage: QuotaUsage,
    pub remaining: RemainingQuota,
    pub daily_percent: f64,
    pub monthly_percent: f64,
    pub storage_percent: f64,
    pub approaching_daily: bool,
    pub approaching_monthly: bool,
    pub approaching_storage: bool,
}

pub struct QuotaManager {
    enabled: bool,
    usage: DashMap<String, QuotaUsage>,
}

impl QuotaManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            usage: DashMap::new(),
        }
    }

    pub fn check(&self, user: &str, tier: Tier, request: QuotaRequest) -> QuotaDecision {
        self.check_at(user, tier, request, Utc::now())
    }

    pub fn check_at(
        &self,
        user: &str,
        tier: Tier,
        request: QuotaRequest,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        let policy = QuotaPolicy::for_tier(tier);
        if !self.enabled {
            return QuotaDecision {
                allowed: true,
                violations: Vec::new(),
                remaining: RemainingQuota {
                    daily_minutes: policy.daily_minutes,
                    monthly_minutes: policy.monthly_minutes,
                    storage_gb: policy.storage_gb,
                    concurrent_jobs: policy.concurrent_jobs,
                },
            };
        }

        let usage = self.usage_snapshot(user, now);
        let mut violations = Vec::new();

        if usage.minutes_used_today + request.minutes > policy.daily_minutes {
            violations.push("daily_minutes_exceeded".to_string());
        }
        if usage.minutes_used_month + request.minutes > policy.monthly_minutes {
            violations.push("monthly_minutes_exceeded".to_string());
        }
        if request.file_size_mb > policy.max_file_size_mb as f64 {
            violations.push("file_size_exceeded".to_string());
        }
        if usage.storage_used_gb + request.storage_gb > policy.storage_gb {
            violations.push("storage_exceeded".to_string());
        }
        if usage.active_jobs + request.jobs > policy.concurrent_jobs {
            violations.push("concurrent_jobs_exceeded".to_string());
        }

        QuotaDecision {
            allowed: violations.is_empty(),
            violations,
            remaining: RemainingQuota {
                daily_minutes: (policy.daily_minutes - usage.minutes_used_today).max(0.0),
                monthly_minutes: (policy.monthly_minutes - usage.minutes_used_month).max(0.0),
                storage_gb: (policy.storage_gb - usage.storage_used_gb).max(0.0),
                concurrent_jobs: policy.concurrent_jobs.saturating_sub(usage.active_jobs),
            },
        }
    }

    /// Record consumed transcription minutes, storage, and API calls.
    pub fn consume(&self, user: &str, minutes: f64, storage_gb: f64, api_calls: u32) {
        self.consume_at(user, minutes, storage_gb, api_calls, Utc::now())
    }

    pub fn consume_at(
        &self,
        user: &str,
        minutes: f64,
        storage_gb: f64,
        api_calls: u32,
        now: DateTime<Utc>,
    ) {
        if !self.enabled {
            return;
        }
        let mut entry = self
            .usage
            .entry(user.to_string())
            .or_insert_with(|| QuotaUsage::new(now));
        entry.roll_over(now);
        entry.minutes_used_today += minutes;
        entry.minutes_used_month += minutes;
        entry.storage_used_gb = (entry.storage_used_gb + storage_gb).max(0.0);
        entry.api_calls_this_hour += api_calls;
    }

    pub fn job_started(&self, user: &str) {
        if !self.enabled {
            return;
        }
        let mut entry = self
            .usage
            .entry(user.to_string())
            .or_insert_with(|| QuotaUsage::new(Utc::now()));
        entry.active_jobs += 1;
    }

    pub fn job_finished(&self, user: &str) {
        if !self.enabled {
            return;
        }
        if let Some(mut entry) = self.usage.get_mut(user) {
            entry.active_jobs = entry.active_jobs.saturating_sub(1);
        }
    }

    pub fn summary(&self, user: &str, tier: Tier) -> QuotaSummary {
        let now = Utc::now();
        let policy = QuotaPolicy::for_tier(tier);
        let usage = self.usage_snapshot(user, now);
        let daily_percent = percent(usage.minutes_used_today, policy.daily_minutes);
        let monthly_percent = percent(usage.minutes_used_month, policy.monthly_minutes);
        let storage_percent = percent(usage.storage_used_gb, policy.storage_gb);

        QuotaSummary {
            user_id: user.to_string(),
            tier,
            remaining: RemainingQuota {
                daily_minutes: (policy.daily_minutes - usage.minutes_used_today).max(0.0),
                monthly_minutes: (policy.monthly_minutes - usage.minutes_used_month).max(0.0),
                storage_gb: (policy.storage_gb - usage.storage_used_gb).max(0.0),
                concurrent_jobs: policy.concurrent_jobs.saturating_sub(usage.active_jobs),
            },
            usage,
            daily_percent,
            monthly_percent,
            storage_percent,
            approaching_daily: daily_percent > 80.0,
            approaching_monthly: monthly_percent > 80.0,
            approaching_storage: storage_percent > 80.0,
        }
    }

    fn usage_snapshot(&self, user: &str, now: DateTime<Utc>) -> QuotaUsage {
        let mut entry = self
            .usage
            .entry(user.to_string())
            .or_insert_with(|| QuotaUsage::new(now));
        entry.roll_over(now);
        entry.clone()
    }
}

fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        used / total * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_all_violations_enumerated() {
        let quotas = QuotaManager::new(true);
        quotas.consume("u1", 59.0, 0.9, 0);
        for _ in 0..2 {
            quotas.job_started("u1");
        }

        let decision = quotas.check(
            "u1",
            Tier::Free,
            QuotaRequest {
                minutes: 2.0,
                file_size_mb: 100.0,
                storage_gb: 0.5,
                jobs: 1,
            },
        );
        assert!(!decision.allowed);
        assert!(decision.violations.contains(&"daily_minutes_exceeded".to_string()));
        assert!(decision.violations.contains(&"file_size_exceeded".to_string()));
        assert!(decision.violations.contains(&"storage_exceeded".to_string()));
        assert!(decision
            .violations
            .contains(&"concurrent_jobs_exceeded".to_string()));
        assert!(decision.remaining.daily_minutes < 2.0);
    }

    #[test]
    fn test_daily_counter_rolls_over() {
        let quotas = QuotaManager::new(true);
        let day1 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();

        quotas.consume_at("u1", 60.0, 0.0, 0, day1);
        let denied = quotas.check_at("u1", Tier::Free, QuotaRequest { minutes: 1.0, ..Default::default() }, day1);
        assert!(!denied.allowed);

        let allowed = quotas.check_at("u1", Tier::Free, QuotaRequest { minutes: 1.0, ..Default::default() }, day2);
        assert!(allowed.allowed, "daily counter must reset on a new day");
    }

    #[test]
    fn test_monthly_counter_survives_day_roll() {
        let quotas = QuotaManager::new(true);
        let day1 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();

        quotas.consume_at("u1", 599.0, 0.0, 0, day1);
        let decision = quotas.check_at(
            "u1",
            Tier::Free,
            QuotaRequest { minutes: 2.0, ..Default::default() },
            day2,
        );
        assert!(decision
            .violations
            .contains(&"monthly_minutes_exceeded".to_string()));
    }

    #[test]
    fn test_disabled_allows_everything() {
        let quotas = QuotaManager::new(false);
        let decision = quotas.check(
            "u1",
            Tier::Free,
            QuotaRequest {
                minutes: 100_000.0,
                ..Default::default()
            },
        );
        assert!(decision.allowed);
    }

    #[test]
    fn test_job_counter_balance() {
        let quotas = QuotaManager::new(true);
        quotas.job_started("u1");
        quotas.job_started("u1");
        quotas.job_finished("u1");
        let summary = quotas.summary("u1", Tier::Free);
        assert_eq!(summary.usage.active_jobs, 1);
        quotas.job_finished("u1");
        quotas.job_finished("u1");
        let summary = quotas.summary("u1", Tier::Free);
        assert_eq!(summary.usage.active_jobs, 0);
    }

    #[test]
    fn test_summary_approaching_flag() {
        let quotas = QuotaManager::new(true);
        quotas.consume("u1", 50.0, 0.0, 0);
        let summary = quotas.summary("u1", Tier::Free);
        assert!(summary.approaching_daily);
        assert!(!summary.approaching_monthly);
    }
}

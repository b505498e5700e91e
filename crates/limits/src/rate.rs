//! Sliding-window rate limits and the concurrent-job counter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::LimitClass;

/// One rule: at most `limit` requests inside a `window_s`-second window.
/// `ConcurrentJobs` uses `limit` as the counter ceiling and no window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_s: u64,
}

fn default_rule(class: LimitClass) -> RateLimitRule {
    match class {
        LimitClass::ApiGeneral => RateLimitRule {
            limit: 100,
            window_s: 60,
        },
        LimitClass::ApiUpload => RateLimitRule {
            limit: 10,
            window_s: 60,
        },
        LimitClass::ApiTranscription => RateLimitRule {
            limit: 20,
            window_s: 3600,
        },
        LimitClass::ConcurrentJobs => RateLimitRule {
            limit: 5,
            window_s: 0,
        },
    }
}

/// Outcome of a rate check, including the retry hint when denied.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub class: LimitClass,
    pub limit: u32,
    pub current: u32,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,
}

impl RateDecision {
    fn allowed(class: LimitClass, limit: u32, current: u32) -> Self {
        Self {
            allowed: true,
            class,
            limit,
            current,
            remaining: limit.saturating_sub(current),
            retry_after_s: None,
        }
    }
}

struct Window {
    timestamps: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct RateLimiter {
    enabled: bool,
    rules: Vec<(LimitClass, RateLimitRule)>,
    windows: DashMap<(String, LimitClass), Mutex<Window>>,
    concurrent: DashMap<String, u32>,
}

impl RateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self::with_rules(
            enabled,
            LimitClass::ALL.iter().map(|c| (*c, default_rule(*c))).collect(),
        )
    }

    pub fn with_rules(enabled: bool, rules: Vec<(LimitClass, RateLimitRule)>) -> Self {
        Self {
            enabled,
            rules,
            windows: DashMap::new(),
            concurrent: DashMap::new(),
        }
    }

    fn rule(&self, class: LimitClass) -> RateLimitRule {
        self.rules
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, r)| *r)
            .unwrap_or_else(|| default_rule(class))
    }

    /// O(1) admission check. For time-based classes this records `cost`
    /// timestamps when allowed; for `ConcurrentJobs` it only reads the
    /// counter (use [`RateLimiter::try_acquire_job`] to take a slot).
    pub fn check(&self, user: &str, class: LimitClass, cost: u32) -> RateDecision {
        let rule = self.rule(class);
        if !self.enabled {
            return RateDecision::allowed(class, rule.limit, 0);
        }

        if class == LimitClass::ConcurrentJobs {
            let current = self.concurrent.get(user).map(|c| *c).unwrap_or(0);
            let allowed = current + cost <= rule.limit;
            return RateDecision {
                allowed,
                class,
                limit: rule.limit,
                current,
                remaining: rule.limit.saturating_sub(current),
                retry_after_s: (!allowed).then_some(0),
            };
        }

        let now = Instant::now();
        let window = Duration::from_secs(rule.window_s);
        let entry = self
            .windows
            .entry((user.to_string(), class))
            .or_insert_with(|| {
                Mutex::new(Window {
                    timestamps: VecDeque::new(),
                })
            });
        let mut state = entry.lock();
        state.prune(now, window);

        let current = state.timestamps.len() as u32;
        if current + cost <= rule.limit {
            for _ in 0..cost {
                state.timestamps.push_back(now);
            }
            return RateDecision::allowed(class, rule.limit, current + cost);
        }

        let retry_after_s = state
            .timestamps
            .front()
            .map(|oldest| {
                window
                    .saturating_sub(now.duration_since(*oldest))
                    .as_secs()
                    .max(1)
            })
            .unwrap_or(rule.window_s);
        tracing::debug!(user, class = %class, current, limit = rule.limit, "rate limit denied");
        RateDecision {
            allowed: false,
            class,
            limit: rule.limit,
            current,
            remaining: 0,
            retry_after_s: Some(retry_after_s),
        }
    }

    /// Take a concurrent-job slot; released when the returned guard drops,
    /// so acquire/release stay balanced across every exit path.
    pub fn try_acquire_job(self: &Arc<Self>, user: &str) -> Option<JobSlot> {
        let limit = self.rule(LimitClass::ConcurrentJobs).limit;
        if self.enabled {
            let mut entry = self.concurrent.entry(user.to_string()).or_insert(0);
            if *entry >= limit {
                return None;
            }
            *entry += 1;
        }
        Some(JobSlot {
            limiter: Arc::clone(self),
            user: user.to_string(),
        })
    }

    pub fn active_jobs(&self, user: &str) -> u32 {
        self.concurrent.get(user).map(|c| *c).unwrap_or(0)
    }

    fn release_job(&self, user: &str) {
        if !self.enabled {
            return;
        }
        if let Some(mut entry) = self.concurrent.get_mut(user) {
            *entry = entry.saturating_sub(1);
        }
    }

    /// Status of every class for one user.
    pub fn status(&self, user: &str) -> Vec<RateDecision> {
        LimitClass::ALL
            .iter()
            .map(|class| {
                let rule = self.rule(*class);
                if *class == LimitClass::ConcurrentJobs {
                    let current = self.active_jobs(user);
                    return RateDecision {
                        allowed: current < rule.limit,
                        class: *class,
                        limit: rule.limit,
                        current,
                        remaining: rule.limit.saturating_sub(current),
                        retry_after_s: None,
                    };
                }
                let current = self
                    .windows
                    .get(&(user.to_string(), *class))
                    .map(|w| {
                        let mut state = w.lock();
                        state.prune(Instant::now(), Duration::from_secs(rule.window_s));
                        state.timestamps.len() as u32
                    })
                    .unwrap_or(0);
                RateDecision {
                    allowed: current < rule.limit,
                    class: *class,
                    limit: rule.limit,
                    current,
                    remaining: rule.limit.saturating_sub(current),
                    retry_after_s: None,
                }
            })
            .collect()
    }
}

/// RAII concurrent-job slot.
pub struct JobSlot {
    limiter: Arc<RateLimiter>,
    user: String,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        self.limiter.release_job(&self.user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_denies_over_limit() {
        let limiter = Arc::new(RateLimiter::with_rules(
            true,
            vec![(
                LimitClass::ApiUpload,
                RateLimitRule {
                    limit: 3,
                    window_s: 60,
                },
            )],
        ));
        for _ in 0..3 {
            assert!(limiter.check("u1", LimitClass::ApiUpload, 1).allowed);
        }
        let denied = limiter.check("u1", LimitClass::ApiUpload, 1);
        assert!(!denied.allowed);
        assert!(denied.retry_after_s.is_some());
    }

    #[test]
    fn test_users_do_not_contend() {
        let limiter = Arc::new(RateLimiter::with_rules(
            true,
            vec![(
                LimitClass::ApiUpload,
                RateLimitRule {
                    limit: 1,
                    window_s: 60,
                },
            )],
        ));
        assert!(limiter.check("u1", LimitClass::ApiUpload, 1).allowed);
        assert!(limiter.check("u2", LimitClass::ApiUpload, 1).allowed);
        assert!(!limiter.check("u1", LimitClass::ApiUpload, 1).allowed);
    }

    #[test]
    fn test_job_slots_balance_on_drop() {
        let limiter = Arc::new(RateLimiter::with_rules(
            true,
            vec![(
                LimitClass::ConcurrentJobs,
                RateLimitRule {
                    limit: 2,
                    window_s: 0,
                },
            )],
        ));
        let a = limiter.try_acquire_job("u1").unwrap();
        let _b = limiter.try_acquire_job("u1").unwrap();
        assert!(limiter.try_acquire_job("u1").is_none());
        assert_eq!(limiter.active_jobs("u1"), 2);

        drop(a);
        assert_eq!(limiter.active_jobs("u1"), 1);
        assert!(limiter.try_acquire_job("u1").is_some());
    }

    #[test]
    fn test_disabled_allows_everything() {
        let limiter = Arc::new(RateLimiter::new(false));
        for _ in 0..1000 {
            assert!(limiter.check("u1", LimitClass::ApiGeneral, 1).allowed);
        }
    }

    #[test]
    fn test_default_table() {
        let limiter = Arc::new(RateLimiter::new(true));
        let status = limiter.status("u1");
        let general = status
            .iter()
            .find(|d| d.class == LimitClass::ApiGeneral)
            .unwrap();
        assert_eq!(general.limit, 100);
        let jobs = status
            .iter()
            .find(|d| d.class == LimitClass::ConcurrentJobs)
            .unwrap();
        assert_eq!(jobs.limit, 5);
    }
}

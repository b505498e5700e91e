//! Rate limiting and user quotas.
//!
//! Sliding-window counters per `(user, class)` for time-based classes and
//! a shared counter for concurrent jobs; tier-driven quotas with lazy
//! day/hour rollover. Different users never contend: state is partitioned
//! per user key.

mod quota;
mod rate;

pub use quota::{
    QuotaDecision, QuotaManager, QuotaPolicy, QuotaRequest, QuotaSummary, QuotaUsage,
    RemainingQuota, Tier,
};
pub use rate::{JobSlot, RateDecision, RateLimitRule, RateLimiter};

use serde::{Deserialize, Serialize};

/// Limit class declared by each user-facing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    ApiGeneral,
    ApiUpload,
    ApiTranscription,
    ConcurrentJobs,
}

impl LimitClass {
    pub const ALL: [LimitClass; 4] = [
        LimitClass::ApiGeneral,
        LimitClass::ApiUpload,
        LimitClass::ApiTranscription,
        LimitClass::ConcurrentJobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitClass::ApiGeneral => "api_general",
            LimitClass::ApiUpload => "api_upload",
            LimitClass::ApiTranscription => "api_transcription",
            LimitClass::ConcurrentJobs => "concurrent_jobs",
        }
    }
}

impl std::fmt::Display for LimitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Per-request cache outcome reporting.

use metrics::counter;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Bypass => "bypass",
        }
    }
}

/// Emits one event and one counter increment per served request.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    health_check_user_agent: String,
}

impl MetricsRecorder {
    pub fn new(health_check_user_agent: impl Into<String>) -> Self {
        Self {
            health_check_user_agent: health_check_user_agent.into(),
        }
    }

    /// Whether the requester is the configured health checker.
    pub fn is_likely_bot(&self, user_agent: Option<&str>) -> bool {
        user_agent.is_some_and(|agent| agent == self.health_check_user_agent)
    }

    pub fn record(&self, outcome: CacheOutcome, path: &str, is_likely_bot: bool) {
        counter!(
            "render_cache_requests_total",
            "outcome" => outcome.as_str(),
            "bot" => if is_likely_bot { "true" } else { "false" }
        )
        .increment(1);

        info!(
            target: "render_cache::requests",
            path,
            outcome = outcome.as_str(),
            is_likely_bot,
            "Render cache request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_check_agent_must_match_exactly() {
        let recorder = MetricsRecorder::new("render-cache-healthcheck");

        assert!(recorder.is_likely_bot(Some("render-cache-healthcheck")));
        assert!(!recorder.is_likely_bot(Some("render-cache-healthcheck/2")));
        assert!(!recorder.is_likely_bot(Some("Mozilla/5.0")));
        assert!(!recorder.is_likely_bot(None));
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(CacheOutcome::Hit.as_str(), "hit");
        assert_eq!(CacheOutcome::Miss.as_str(), "miss");
        assert_eq!(CacheOutcome::Bypass.as_str(), "bypass");
    }
}

//! Structural size checks over the cache's maps.
//!
//! Nothing here takes corrective action. Breaches are logged and counted so
//! unbounded growth shows up before it becomes an outage.

use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::coordinator::RenderCache;
use super::store::ApproxSize;

const DEFAULT_MAX_BASE_KEYS: usize = 5_000;
const DEFAULT_MAX_VARIANTS: usize = 20_000;
const DEFAULT_MAX_IN_FLIGHT: usize = 500;
const DEFAULT_MAX_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeakThresholds {
    pub max_base_keys: usize,
    pub max_variants: usize,
    pub max_in_flight: usize,
    pub max_bytes: usize,
}

impl Default for LeakThresholds {
    fn default() -> Self {
        Self {
            max_base_keys: DEFAULT_MAX_BASE_KEYS,
            max_variants: DEFAULT_MAX_VARIANTS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Point-in-time sizes of the cache structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub base_keys: usize,
    pub variants: usize,
    pub in_flight: usize,
    pub store_bytes: usize,
    pub store_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakMeasure {
    BaseKeys,
    Variants,
    InFlight,
    StoreBytes,
}

impl LeakMeasure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BaseKeys => "base_keys",
            Self::Variants => "variants",
            Self::InFlight => "in_flight",
            Self::StoreBytes => "store_bytes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeakBreach {
    pub measure: LeakMeasure,
    pub observed: usize,
    pub threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub stats: CacheStats,
    pub breaches: Vec<LeakBreach>,
}

impl LeakReport {
    pub fn is_healthy(&self) -> bool {
        self.breaches.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LeakMonitor {
    thresholds: LeakThresholds,
}

impl LeakMonitor {
    pub fn new(thresholds: LeakThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> LeakThresholds {
        self.thresholds
    }

    /// Compare `stats` against every threshold without recording anything.
    ///
    /// A value equal to its threshold is not a breach.
    pub fn evaluate(&self, stats: CacheStats) -> LeakReport {
        let measures = [
            (LeakMeasure::BaseKeys, stats.base_keys, self.thresholds.max_base_keys),
            (LeakMeasure::Variants, stats.variants, self.thresholds.max_variants),
            (LeakMeasure::InFlight, stats.in_flight, self.thresholds.max_in_flight),
            (LeakMeasure::StoreBytes, stats.store_bytes, self.thresholds.max_bytes),
        ];

        let breaches: Vec<LeakBreach> = measures
            .into_iter()
            .filter(|(_, observed, threshold)| observed > threshold)
            .map(|(measure, observed, threshold)| LeakBreach {
                measure,
                observed,
                threshold,
            })
            .collect();

        LeakReport { stats, breaches }
    }

    /// [`evaluate`](Self::evaluate), then publish the gauges and count and log every breach.
    pub fn check(&self, stats: CacheStats) -> LeakReport {
        gauge!("render_cache_base_keys").set(stats.base_keys as f64);
        gauge!("render_cache_variants").set(stats.variants as f64);
        gauge!("render_cache_in_flight").set(stats.in_flight as f64);
        gauge!("render_cache_store_bytes").set(stats.store_bytes as f64);

        let report = self.evaluate(stats);
        for breach in &report.breaches {
            counter!(
                "render_cache_leak_warnings_total",
                "measure" => breach.measure.as_str()
            )
            .increment(1);
            warn!(
                measure = breach.measure.as_str(),
                observed = breach.observed,
                threshold = breach.threshold,
                "Render cache structure exceeds its size threshold"
            );
        }

        if report.is_healthy() {
            debug!(
                base_keys = stats.base_keys,
                variants = stats.variants,
                in_flight = stats.in_flight,
                store_bytes = stats.store_bytes,
                "Render cache sizes within thresholds"
            );
        }

        report
    }
}

impl Default for LeakMonitor {
    fn default() -> Self {
        Self::new(LeakThresholds::default())
    }
}

/// Run the leak check on `interval`, skipping the immediate first tick.
pub fn spawn<O, E>(cache: RenderCache<O, E>, interval: Duration) -> JoinHandle<()>
where
    O: ApproxSize + Clone + Send + Sync + 'static,
    E: std::fmt::Display + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            cache.check_leaks();
        }
    })
}

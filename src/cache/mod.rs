//! Experiment-aware render cache.
//!
//! Caches expensive page outputs for anonymous requests. Each output is keyed
//! by its route and locale attributes ([`BaseKey`]) plus the experiment
//! variants it actually consulted ([`RelevantAllocation`]), so one stored
//! output is shared by every requester whose allocation agrees on those
//! experiments.
//!
//! - **Store**: byte- and age-bounded, evicts the oldest insertion first
//! - **VariantIndex**: base key → stored relevant allocations
//! - **RenderCache**: lookup, in-flight deduplication, render, store, prune
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_bytes = 268435456
//! max_age_seconds = 90
//! # ... see config.rs for all options
//! ```

mod allocation;
mod bypass;
mod config;
mod coordinator;
mod experiments;
mod index;
mod inflight;
mod keys;
mod lock;
pub mod maintenance;
mod metrics;
pub mod monitor;
mod store;

pub use allocation::{CompleteAllocation, ExperimentName, RelevantAllocation};
pub use bypass::{BypassPolicy, BypassReason};
pub use config::{CacheConfig, CacheConfigError};
pub use coordinator::{
    RenderCache, RenderFailure, Rendered, ServeOutcome, Served, SweepReport,
};
pub use experiments::{
    AllocationResolver, Epoch, Experiment, ExperimentRegistry, RegistryError, Variant,
    forbidden_char,
};
pub use index::VariantIndex;
pub use keys::{BaseKey, CompositeKey, PageRequest};
pub use self::metrics::{CacheOutcome, MetricsRecorder};
pub use monitor::{CacheStats, LeakBreach, LeakMeasure, LeakMonitor, LeakReport, LeakThresholds};
pub use store::{ApproxSize, CacheEntry, EvictionCause, RenderStore};

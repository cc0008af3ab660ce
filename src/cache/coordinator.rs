//! Render coordinator.
//!
//! [`RenderCache::get`] ties the pieces together: bypass classification,
//! variant lookup, joining an in-flight render, starting a new one, storing
//! its output and pruning stale index entries afterwards.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::allocation::{CompleteAllocation, RelevantAllocation};
use super::bypass::BypassReason;
use super::config::{CacheConfig, CacheConfigError};
use super::experiments::AllocationResolver;
use super::index::VariantIndex;
use super::inflight::{InFlightRegistry, RenderGuard, RenderOutput, SharedRender};
use super::keys::{BaseKey, CompositeKey, PageRequest};
use super::lock::mutex_lock;
use super::metrics::{CacheOutcome, MetricsRecorder};
use super::monitor::{CacheStats, LeakMonitor, LeakReport};
use super::store::{ApproxSize, CacheEntry, RenderStore};

const SOURCE: &str = "cache::coordinator";

/// What a render function hands back.
#[derive(Debug, Clone)]
pub struct Rendered<O> {
    pub output: O,
    /// The experiments the output depended on, with the variants used.
    pub relevant: RelevantAllocation,
    /// False when the output must be served but never stored.
    pub cacheable: bool,
    /// False when the output belongs to its requester alone, so concurrent
    /// compatible requests render their own instead of joining.
    pub shareable: bool,
}

impl<O> Rendered<O> {
    pub fn new(output: O, relevant: RelevantAllocation) -> Self {
        Self {
            output,
            relevant,
            cacheable: true,
            shareable: true,
        }
    }

    pub fn uncacheable(output: O, relevant: RelevantAllocation) -> Self {
        Self {
            output,
            relevant,
            cacheable: false,
            shareable: true,
        }
    }

    /// Output tied to the requester it was rendered for: neither stored nor joined.
    pub fn private(output: O, relevant: RelevantAllocation) -> Self {
        Self {
            output,
            relevant,
            cacheable: false,
            shareable: false,
        }
    }
}

/// Failure delivered to the originator of a render and to every joiner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderFailure<E> {
    #[error("render failed: {0}")]
    Render(E),
    #[error("render aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Served from the store.
    Hit,
    /// Shared the output of a compatible render already in progress.
    Joined,
    /// This request started the render.
    Rendered,
    /// Rendered fresh and never stored.
    Bypass(BypassReason),
}

impl ServeOutcome {
    pub fn cache_outcome(self) -> CacheOutcome {
        match self {
            Self::Hit | Self::Joined => CacheOutcome::Hit,
            Self::Rendered => CacheOutcome::Miss,
            Self::Bypass(_) => CacheOutcome::Bypass,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Served<O> {
    pub output: O,
    pub outcome: ServeOutcome,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: usize,
    pub pruned: usize,
}

struct CacheInner<O, E> {
    config: CacheConfig,
    resolver: Arc<dyn AllocationResolver>,
    store: RenderStore<O>,
    index: VariantIndex,
    in_flight: InFlightRegistry<O, E>,
    pending_prune: Arc<Mutex<HashSet<BaseKey>>>,
    recorder: MetricsRecorder,
    monitor: LeakMonitor,
}

enum Claim<O, E, F> {
    Cached(O),
    /// The joiner keeps its render function in case the owner's output is private.
    Joined(SharedRender<O, E>, F),
    Started(SharedRender<O, E>),
}

/// Cloneable handle to one render cache. Clones share all state.
pub struct RenderCache<O, E> {
    inner: Arc<CacheInner<O, E>>,
}

impl<O, E> Clone for RenderCache<O, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O, E> RenderCache<O, E>
where
    O: ApproxSize + Clone + Send + Sync + 'static,
    E: fmt::Display + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: CacheConfig,
        resolver: Arc<dyn AllocationResolver>,
    ) -> Result<Self, CacheConfigError> {
        config.validate()?;

        let store = RenderStore::new(config.max_bytes, config.max_age);
        let pending_prune = Arc::new(Mutex::new(HashSet::new()));
        let queue = Arc::clone(&pending_prune);
        store.on_evict(move |key: &CompositeKey, _cause| {
            mutex_lock(&queue, SOURCE, "queue_prune").insert(key.base.clone());
        });

        Ok(Self {
            inner: Arc::new(CacheInner {
                recorder: MetricsRecorder::new(config.health_check_user_agent.clone()),
                monitor: LeakMonitor::new(config.leak),
                config,
                resolver,
                store,
                index: VariantIndex::new(),
                in_flight: InFlightRegistry::new(),
                pending_prune,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Serve `request` for `identity`, rendering with `render` on a miss.
    ///
    /// `render` receives the requester's complete allocation and must report
    /// which experiments the output consulted.
    #[instrument(skip_all, fields(path = %request.path))]
    pub async fn get<F, Fut>(
        &self,
        request: &PageRequest,
        identity: &str,
        render: F,
    ) -> Result<Served<O>, RenderFailure<E>>
    where
        F: FnOnce(CompleteAllocation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Rendered<O>, E>> + Send + 'static,
    {
        let inner = &self.inner;
        let is_likely_bot = inner.recorder.is_likely_bot(request.user_agent.as_deref());
        let allocation = inner.resolver.resolve(identity);

        let bypass = if inner.config.enabled {
            inner.config.bypass.classify(request, is_likely_bot)
        } else {
            Some(BypassReason::Disabled)
        };
        if let Some(reason) = bypass {
            debug!(reason = reason.as_str(), "Bypassing render cache");
            inner
                .recorder
                .record(CacheOutcome::Bypass, &request.path, is_likely_bot);
            let rendered = render(allocation).await.map_err(RenderFailure::Render)?;
            return Ok(Served {
                output: rendered.output,
                outcome: ServeOutcome::Bypass(reason),
            });
        }

        let base = BaseKey::for_request(request);
        if let Some(output) = inner.lookup(&base, &allocation) {
            debug!(base_key = %base, "Render cache hit");
            inner
                .recorder
                .record(CacheOutcome::Hit, &request.path, is_likely_bot);
            return Ok(Served {
                output,
                outcome: ServeOutcome::Hit,
            });
        }

        match self.claim(base.clone(), allocation.clone(), render) {
            Claim::Cached(output) => {
                inner
                    .recorder
                    .record(CacheOutcome::Hit, &request.path, is_likely_bot);
                Ok(Served {
                    output,
                    outcome: ServeOutcome::Hit,
                })
            }
            Claim::Joined(handle, render) => {
                debug!("Joining in-flight render");
                let finished = handle.await?;
                if finished.shareable {
                    inner
                        .recorder
                        .record(CacheOutcome::Hit, &request.path, is_likely_bot);
                    return Ok(Served {
                        output: finished.output,
                        outcome: ServeOutcome::Joined,
                    });
                }

                debug!(base_key = %base, "Joined render was private to its owner, rendering again");
                inner
                    .recorder
                    .record(CacheOutcome::Miss, &request.path, is_likely_bot);
                let own = run_render(
                    Arc::clone(inner),
                    base,
                    allocation.clone(),
                    None,
                    deferred(render, allocation),
                )
                .await?;
                Ok(Served {
                    output: own.output,
                    outcome: ServeOutcome::Rendered,
                })
            }
            Claim::Started(handle) => {
                inner
                    .recorder
                    .record(CacheOutcome::Miss, &request.path, is_likely_bot);
                Ok(Served {
                    output: handle.await?.output,
                    outcome: ServeOutcome::Rendered,
                })
            }
        }
    }

    /// Join a compatible render, serve a just-finished one, or register a new one.
    ///
    /// The check and the registration happen under the in-flight mutex.
    /// `render` is only called once the registered render is first polled,
    /// which happens in the spawned task after the mutex is released.
    fn claim<F, Fut>(
        &self,
        base: BaseKey,
        allocation: CompleteAllocation,
        render: F,
    ) -> Claim<O, E, F>
    where
        F: FnOnce(CompleteAllocation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Rendered<O>, E>> + Send + 'static,
    {
        let mut slots = self.inner.in_flight.lock();
        if let Some(joined) = slots.find_compatible(&base, &allocation) {
            drop(slots);
            return Claim::Joined(joined, render);
        }
        if let Some(output) = self.inner.lookup(&base, &allocation) {
            drop(slots);
            return Claim::Cached(output);
        }

        let guard = self.inner.in_flight.reserve(base.clone());
        let id = guard.id();
        let task = run_render(
            Arc::clone(&self.inner),
            base.clone(),
            allocation.clone(),
            Some(guard),
            deferred(render, allocation.clone()),
        );
        let handle: SharedRender<O, E> = task.boxed().shared();
        slots.register(&base, id, &allocation, handle.clone());
        drop(slots);

        info!(base_key = %base, "Render started");
        tokio::spawn(handle.clone());
        Claim::Started(handle)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    /// Measure structure sizes and warn on every threshold breach.
    pub fn check_leaks(&self) -> LeakReport {
        self.inner.monitor.check(self.inner.stats())
    }

    /// Measure structure sizes against the thresholds. Records no metrics and logs nothing.
    pub fn leak_report(&self) -> LeakReport {
        self.inner.monitor.evaluate(self.inner.stats())
    }

    pub fn leak_monitor(&self) -> &LeakMonitor {
        &self.inner.monitor
    }

    /// Purge expired entries, then prune every base key queued by evictions.
    pub fn sweep(&self) -> SweepReport {
        let purged = self.inner.store.purge_expired();
        let pruned = self.inner.prune_pending(None);
        if purged > 0 || pruned > 0 {
            debug!(purged, pruned, "Render cache sweep");
        }
        SweepReport { purged, pruned }
    }

    /// Drop every stored output and index entry. In-flight renders are untouched.
    pub fn clear(&self) -> usize {
        let cleared = self.inner.store.clear();
        self.inner.index.clear();
        mutex_lock(&self.inner.pending_prune, SOURCE, "clear").clear();
        info!(cleared, "Render cache cleared");
        cleared
    }
}

impl<O, E> CacheInner<O, E>
where
    O: ApproxSize + Clone + Send + Sync + 'static,
    E: fmt::Display + Clone + Send + Sync + 'static,
{
    fn lookup(&self, base: &BaseKey, allocation: &CompleteAllocation) -> Option<O> {
        let relevant = self.index.find_compatible(base, allocation)?;
        let entry = self.store.get(&CompositeKey::new(base.clone(), relevant))?;
        Some(entry.output)
    }

    fn insert(&self, base: &BaseKey, allocation: &CompleteAllocation, rendered: &Rendered<O>) {
        if !allocation.satisfies(&rendered.relevant) {
            warn!(
                base_key = %base,
                relevant = %rendered.relevant,
                "Render reported variants outside the requester allocation; output not stored"
            );
            return;
        }

        let key = CompositeKey::new(base.clone(), rendered.relevant.clone());
        self.store.set(key, CacheEntry::new(rendered.output.clone()));
        self.index
            .record_variant(base.clone(), rendered.relevant.clone());
    }

    /// Prune queued base keys plus `extra`. Returns dropped index entries.
    fn prune_pending(&self, extra: Option<&BaseKey>) -> usize {
        let mut queued = mem::take(&mut *mutex_lock(&self.pending_prune, SOURCE, "prune"));
        if let Some(base) = extra {
            queued.insert(base.clone());
        }

        queued
            .iter()
            .map(|base| {
                self.index.prune(base, |relevant| {
                    self.store
                        .contains(&CompositeKey::new(base.clone(), relevant.clone()))
                })
            })
            .sum()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            base_keys: self.index.base_key_count(),
            variants: self.index.variant_count(),
            in_flight: self.in_flight.len(),
            store_bytes: self.store.total_bytes(),
            store_entries: self.store.len(),
        }
    }
}

async fn run_render<O, E, Fut>(
    inner: Arc<CacheInner<O, E>>,
    base: BaseKey,
    allocation: CompleteAllocation,
    guard: Option<RenderGuard<O, E>>,
    render: Fut,
) -> Result<RenderOutput<O>, RenderFailure<E>>
where
    O: ApproxSize + Clone + Send + Sync + 'static,
    E: fmt::Display + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Rendered<O>, E>> + Send + 'static,
{
    let started = Instant::now();
    let result = match AssertUnwindSafe(render).catch_unwind().await {
        Ok(Ok(rendered)) => {
            if rendered.cacheable {
                inner.insert(&base, &allocation, &rendered);
            } else {
                debug!(base_key = %base, "Render marked uncacheable");
            }
            info!(
                base_key = %base,
                relevant = %rendered.relevant,
                cached = rendered.cacheable,
                shared = rendered.shareable,
                "Render finished"
            );
            Ok(RenderOutput {
                output: rendered.output,
                shareable: rendered.shareable,
            })
        }
        Ok(Err(err)) => {
            counter!("render_cache_render_failures_total").increment(1);
            warn!(base_key = %base, error = %err, "Render failed");
            Err(RenderFailure::Render(err))
        }
        Err(payload) => {
            counter!("render_cache_render_failures_total").increment(1);
            let message = panic_message(payload);
            warn!(base_key = %base, panic = %message, "Render panicked");
            Err(RenderFailure::Aborted(message))
        }
    };
    histogram!("render_cache_render_ms").record(started.elapsed().as_secs_f64() * 1000.0);

    drop(guard);
    inner.prune_pending(Some(&base));
    result
}

/// Postpone calling `render` until the returned future is first polled.
async fn deferred<O, E, F, Fut>(
    render: F,
    allocation: CompleteAllocation,
) -> Result<Rendered<O>, E>
where
    F: FnOnce(CompleteAllocation) -> Fut,
    Fut: Future<Output = Result<Rendered<O>, E>>,
{
    render(allocation).await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "render panicked".to_string()
    }
}

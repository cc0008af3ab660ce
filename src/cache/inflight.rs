//! Registry of renders currently in progress.
//!
//! Each entry is keyed by base key and carries the owner's complete
//! allocation. A later request joins an entry when its own complete
//! allocation satisfies the owner's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, Shared};

use super::allocation::{CompleteAllocation, RelevantAllocation};
use super::coordinator::RenderFailure;
use super::keys::BaseKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::inflight";

/// What a finished render hands to its owner and every joiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RenderOutput<O> {
    pub(crate) output: O,
    /// Joiners render on their own when this is false.
    pub(crate) shareable: bool,
}

/// Completion handle shared by the owner of a render and every joiner.
pub(crate) type SharedRender<O, E> =
    Shared<BoxFuture<'static, Result<RenderOutput<O>, RenderFailure<E>>>>;

struct InFlightRender<O, E> {
    id: u64,
    /// The owner's complete allocation, used as the allocation so far.
    allocation: RelevantAllocation,
    handle: SharedRender<O, E>,
}

type RenderMap<O, E> = HashMap<BaseKey, Vec<InFlightRender<O, E>>>;

pub(crate) struct InFlightRegistry<O, E> {
    renders: Arc<Mutex<RenderMap<O, E>>>,
    next_id: AtomicU64,
}

impl<O, E> InFlightRegistry<O, E>
where
    O: Clone,
    E: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            renders: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve an id and the guard that removes its entry on drop.
    ///
    /// The guard may be created before the entry is registered; dropping it
    /// without registering is a no-op.
    pub(crate) fn reserve(&self, base: BaseKey) -> RenderGuard<O, E> {
        RenderGuard {
            base,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            renders: Arc::clone(&self.renders),
        }
    }

    /// Take the registry mutex for an atomic check-and-register.
    pub(crate) fn lock(&self) -> InFlightSlots<'_, O, E> {
        InFlightSlots {
            renders: mutex_lock(&self.renders, SOURCE, "lock"),
        }
    }

    /// Outstanding renders across every base key.
    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.renders, SOURCE, "len")
            .values()
            .map(Vec::len)
            .sum()
    }
}

pub(crate) struct InFlightSlots<'a, O, E> {
    renders: MutexGuard<'a, RenderMap<O, E>>,
}

impl<O, E> InFlightSlots<'_, O, E>
where
    O: Clone,
    E: Clone,
{
    /// Handle of the first in-flight render whose owner allocation `allocation` satisfies.
    pub(crate) fn find_compatible(
        &self,
        base: &BaseKey,
        allocation: &CompleteAllocation,
    ) -> Option<SharedRender<O, E>> {
        self.renders
            .get(base)?
            .iter()
            .find(|render| allocation.satisfies(&render.allocation))
            .map(|render| render.handle.clone())
    }

    pub(crate) fn register(
        &mut self,
        base: &BaseKey,
        id: u64,
        allocation: &CompleteAllocation,
        handle: SharedRender<O, E>,
    ) {
        self.renders
            .entry(base.clone())
            .or_default()
            .push(InFlightRender {
                id,
                allocation: allocation.as_relevant(),
                handle,
            });
    }
}

/// Removes its in-flight entry when dropped, including on panic.
pub(crate) struct RenderGuard<O, E> {
    base: BaseKey,
    id: u64,
    renders: Arc<Mutex<RenderMap<O, E>>>,
}

impl<O, E> RenderGuard<O, E> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl<O, E> Drop for RenderGuard<O, E> {
    fn drop(&mut self) {
        let mut renders = mutex_lock(&self.renders, SOURCE, "release");
        if let Some(entries) = renders.get_mut(&self.base) {
            entries.retain(|render| render.id != self.id);
            if entries.is_empty() {
                renders.remove(&self.base);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::cache::keys::PageRequest;

    type Registry = InFlightRegistry<String, String>;

    fn base(path: &str) -> BaseKey {
        BaseKey::for_request(&PageRequest::new(path))
    }

    fn complete(pairs: &[(&str, &str)]) -> CompleteAllocation {
        pairs.iter().copied().collect()
    }

    fn ready(output: &str) -> SharedRender<String, String> {
        let output = output.to_string();
        async move {
            Ok(RenderOutput {
                output,
                shareable: true,
            })
        }
        .boxed()
        .shared()
    }

    #[tokio::test]
    async fn joiners_need_the_owner_allocation() {
        let registry = Registry::new();
        let guard = registry.reserve(base("/"));
        let owner = complete(&[("buttonColor", "red"), ("layout", "A")]);
        registry
            .lock()
            .register(&base("/"), guard.id(), &owner, ready("page"));

        let slots = registry.lock();
        let joined = slots
            .find_compatible(&base("/"), &owner)
            .expect("identical allocation joins");
        assert!(
            slots
                .find_compatible(&base("/"), &complete(&[("buttonColor", "red"), ("layout", "B")]))
                .is_none()
        );
        assert!(slots.find_compatible(&base("/other"), &owner).is_none());
        drop(slots);

        assert_eq!(
            joined.await.map(|finished| finished.output),
            Ok("page".to_string())
        );
    }

    #[test]
    fn dropping_the_guard_removes_only_its_entry() {
        let registry = Registry::new();
        let first = registry.reserve(base("/"));
        let second = registry.reserve(base("/"));
        {
            let mut slots = registry.lock();
            slots.register(&base("/"), first.id(), &complete(&[("layout", "A")]), ready("a"));
            slots.register(&base("/"), second.id(), &complete(&[("layout", "B")]), ready("b"));
        }
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);
        assert!(
            registry
                .lock()
                .find_compatible(&base("/"), &complete(&[("layout", "B")]))
                .is_some()
        );

        drop(second);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn unregistered_guard_drop_is_a_no_op() {
        let registry = Registry::new();
        let kept = registry.reserve(base("/"));
        registry
            .lock()
            .register(&base("/"), kept.id(), &complete(&[]), ready("kept"));

        drop(registry.reserve(base("/")));
        assert_eq!(registry.len(), 1);
    }
}

//! Background sweep of expired outputs and stale index entries.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::coordinator::RenderCache;
use super::store::ApproxSize;

/// Run [`RenderCache::sweep`] on `interval`, skipping the immediate first tick.
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
            cache.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::{
        CacheConfig, ExperimentRegistry, PageRequest, RelevantAllocation, Rendered,
    };

    #[tokio::test(start_paused = true)]
    async fn sweep_task_purges_expired_outputs() {
        let config = CacheConfig {
            max_age: Duration::from_secs(5),
            ..CacheConfig::default()
        };
        let cache: RenderCache<String, String> =
            RenderCache::new(config, Arc::new(ExperimentRegistry::new())).expect("valid config");

        cache
            .get(&PageRequest::new("/"), "client-1", |_| async {
                Ok(Rendered::new("page".to_string(), RelevantAllocation::new()))
            })
            .await
            .expect("render succeeds");
        assert_eq!(cache.stats().store_entries, 1);

        let handle = spawn(cache.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        let stats = cache.stats();
        assert_eq!(stats.store_entries, 0);
        assert_eq!(stats.base_keys, 0);
        handle.abort();
    }
}

//! Variant index.
//!
//! Records, per base key, which relevant allocations have been stored, so a
//! lookup can find an output compatible with a requester's complete
//! allocation without knowing in advance which experiments mattered.

use std::collections::HashMap;
use std::sync::RwLock;

use super::allocation::{CompleteAllocation, RelevantAllocation};
use super::keys::BaseKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::index";

pub struct VariantIndex {
    variants: RwLock<HashMap<BaseKey, Vec<RelevantAllocation>>>,
}

impl VariantIndex {
    pub fn new() -> Self {
        Self {
            variants: RwLock::new(HashMap::new()),
        }
    }

    /// Record a stored allocation. Returns `false` when it was already recorded.
    pub fn record_variant(&self, base: BaseKey, relevant: RelevantAllocation) -> bool {
        let mut variants = rw_write(&self.variants, SOURCE, "record_variant");
        let recorded = variants.entry(base).or_default();
        if recorded.contains(&relevant) {
            return false;
        }
        recorded.push(relevant);
        true
    }

    /// First recorded allocation the complete allocation satisfies.
    pub fn find_compatible(
        &self,
        base: &BaseKey,
        allocation: &CompleteAllocation,
    ) -> Option<RelevantAllocation> {
        let variants = rw_read(&self.variants, SOURCE, "find_compatible");
        variants
            .get(base)?
            .iter()
            .find(|relevant| allocation.satisfies(relevant))
            .cloned()
    }

    /// Drop recorded allocations for which `is_live` is false.
    ///
    /// The base key is removed once nothing remains. Returns how many
    /// allocations were dropped.
    pub fn prune<F>(&self, base: &BaseKey, mut is_live: F) -> usize
    where
        F: FnMut(&RelevantAllocation) -> bool,
    {
        let mut variants = rw_write(&self.variants, SOURCE, "prune");
        let Some(recorded) = variants.get_mut(base) else {
            return 0;
        };

        let before = recorded.len();
        recorded.retain(|relevant| is_live(relevant));
        let dropped = before - recorded.len();
        if recorded.is_empty() {
            variants.remove(base);
        }
        dropped
    }

    pub fn base_keys(&self) -> Vec<BaseKey> {
        rw_read(&self.variants, SOURCE, "base_keys")
            .keys()
            .cloned()
            .collect()
    }

    pub fn base_key_count(&self) -> usize {
        rw_read(&self.variants, SOURCE, "base_key_count").len()
    }

    /// Relevant allocations summed over every base key.
    pub fn variant_count(&self) -> usize {
        rw_read(&self.variants, SOURCE, "variant_count")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn clear(&self) {
        rw_write(&self.variants, SOURCE, "clear").clear();
    }
}

impl Default for VariantIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::PageRequest;

    fn base(path: &str) -> BaseKey {
        BaseKey::for_request(&PageRequest::new(path))
    }

    fn relevant(pairs: &[(&str, &str)]) -> RelevantAllocation {
        pairs.iter().copied().collect()
    }

    fn complete(pairs: &[(&str, &str)]) -> CompleteAllocation {
        pairs.iter().copied().collect()
    }

    #[test]
    fn record_variant_deduplicates() {
        let index = VariantIndex::new();
        assert!(index.record_variant(base("/"), relevant(&[("layout", "A")])));
        assert!(!index.record_variant(base("/"), relevant(&[("layout", "A")])));
        assert!(index.record_variant(base("/"), relevant(&[("layout", "B")])));

        assert_eq!(index.base_key_count(), 1);
        assert_eq!(index.variant_count(), 2);
    }

    #[test]
    fn find_compatible_prefers_first_recorded() {
        let index = VariantIndex::new();
        index.record_variant(base("/"), relevant(&[("buttonColor", "red")]));
        index.record_variant(base("/"), RelevantAllocation::new());

        let requester = complete(&[("buttonColor", "red"), ("layout", "A")]);
        assert_eq!(
            index.find_compatible(&base("/"), &requester),
            Some(relevant(&[("buttonColor", "red")]))
        );

        let other = complete(&[("buttonColor", "blue"), ("layout", "A")]);
        assert_eq!(
            index.find_compatible(&base("/"), &other),
            Some(RelevantAllocation::new())
        );
    }

    #[test]
    fn find_compatible_is_scoped_to_the_base_key() {
        let index = VariantIndex::new();
        index.record_variant(base("/a"), RelevantAllocation::new());

        assert!(index.find_compatible(&base("/b"), &complete(&[])).is_none());
    }

    #[test]
    fn prune_drops_dead_allocations_and_empty_keys() {
        let index = VariantIndex::new();
        let red = relevant(&[("buttonColor", "red")]);
        let blue = relevant(&[("buttonColor", "blue")]);
        index.record_variant(base("/"), red.clone());
        index.record_variant(base("/"), blue.clone());

        assert_eq!(index.prune(&base("/"), |candidate| *candidate == blue), 1);
        assert_eq!(index.variant_count(), 1);

        assert_eq!(index.prune(&base("/"), |_| false), 1);
        assert_eq!(index.base_key_count(), 0);
        assert_eq!(index.prune(&base("/"), |_| false), 0);
    }
}

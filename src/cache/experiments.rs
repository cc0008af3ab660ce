//! Experiment registry and deterministic variant assignment.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use super::allocation::{CompleteAllocation, ExperimentName};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::experiments";

/// Registry epoch. Bumped whenever the set of registered experiments changes.
pub type Epoch = u64;

/// Computes the complete allocation for a requester.
///
/// Implementations must be deterministic: the same identity against the same
/// experiment set always yields the same allocation.
pub trait AllocationResolver: Send + Sync {
    fn resolve(&self, identity: &str) -> CompleteAllocation;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Variant {
    pub label: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Experiment {
    pub name: ExperimentName,
    pub variants: Vec<Variant>,
}

impl Experiment {
    /// Experiment whose variants all carry the same weight.
    pub fn uniform(name: impl Into<ExperimentName>, labels: &[&str]) -> Self {
        Self {
            name: name.into(),
            variants: labels
                .iter()
                .map(|label| Variant {
                    label: (*label).to_string(),
                    weight: 1,
                })
                .collect(),
        }
    }

    pub fn weighted(name: impl Into<ExperimentName>, variants: &[(&str, u32)]) -> Self {
        Self {
            name: name.into(),
            variants: variants
                .iter()
                .map(|(label, weight)| Variant {
                    label: (*label).to_string(),
                    weight: *weight,
                })
                .collect(),
        }
    }

    fn total_weight(&self) -> u64 {
        self.variants.iter().map(|v| u64::from(v.weight)).sum()
    }

    /// Pick a variant for `identity`, or `None` when no variant carries weight.
    pub fn assign(&self, identity: &str) -> Option<&str> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.name.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(identity.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let mut bucket = u64::from_be_bytes(prefix) % total;

        for variant in &self.variants {
            let weight = u64::from(variant.weight);
            if bucket < weight {
                return Some(variant.label.as_str());
            }
            bucket -= weight;
        }
        None
    }
}

/// First character of `value` that cannot travel in the allocation headers.
///
/// Names and labels are joined with `=`, `;` and `,` on the wire and must be
/// visible ASCII.
pub fn forbidden_char(value: &str) -> Option<char> {
    value
        .chars()
        .find(|c| !c.is_ascii_graphic() || matches!(c, '=' | ';' | ','))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("experiment `{name}` is already registered with different variants")]
    Conflict { name: ExperimentName },
    #[error("experiment `{name}` declares no variants")]
    NoVariants { name: ExperimentName },
    #[error("`{value}` contains `{found:?}`, which cannot appear in an allocation header")]
    ForbiddenChar { value: String, found: char },
}

/// Set of known experiments. Names are never reused with a different meaning.
pub struct ExperimentRegistry {
    experiments: RwLock<BTreeMap<ExperimentName, Experiment>>,
    epoch: AtomicU64,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self {
            experiments: RwLock::new(BTreeMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Build a registry from configured experiments, failing on the first invalid one.
    pub fn from_experiments(
        experiments: impl IntoIterator<Item = Experiment>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for experiment in experiments {
            registry.register(experiment)?;
        }
        Ok(registry)
    }

    /// Register an experiment and return the resulting epoch.
    ///
    /// Re-registering an identical experiment is a no-op.
    pub fn register(&self, experiment: Experiment) -> Result<Epoch, RegistryError> {
        if experiment.variants.is_empty() {
            return Err(RegistryError::NoVariants {
                name: experiment.name,
            });
        }
        let labels = experiment.variants.iter().map(|v| v.label.as_str());
        for value in std::iter::once(experiment.name.as_str()).chain(labels) {
            if let Some(found) = forbidden_char(value) {
                return Err(RegistryError::ForbiddenChar {
                    value: value.to_string(),
                    found,
                });
            }
        }

        let mut experiments = rw_write(&self.experiments, SOURCE, "register");
        if let Some(existing) = experiments.get(&experiment.name) {
            if *existing == experiment {
                return Ok(self.epoch());
            }
            return Err(RegistryError::Conflict {
                name: experiment.name,
            });
        }

        let name = experiment.name.clone();
        let variants = experiment.variants.len();
        experiments.insert(name.clone(), experiment);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        info!(experiment = %name, variants, epoch, "Experiment registered");
        Ok(epoch)
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.experiments, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AllocationResolver for ExperimentRegistry {
    fn resolve(&self, identity: &str) -> CompleteAllocation {
        let experiments = rw_read(&self.experiments, SOURCE, "resolve");
        experiments
            .values()
            .filter_map(|experiment| {
                experiment
                    .assign(identity)
                    .map(|label| (experiment.name.clone(), label.to_string()))
            })
            .collect()
    }
}

impl Default for ExperimentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

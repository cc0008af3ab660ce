//! Experiment variant allocations.
//!
//! A [`CompleteAllocation`] assigns a variant to every registered experiment
//! for one requester. A [`RelevantAllocation`] is the subset of it that one
//! rendered output actually consulted. The two are distinct types so a
//! complete allocation is never stored as if it were narrowed.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a single experiment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentName(String);

impl ExperimentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ExperimentName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExperimentName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for ExperimentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Variant choice for every registered experiment, for one requester.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CompleteAllocation(BTreeMap<ExperimentName, String>);

/// The experiments one rendered output depended on, with the variants used.
///
/// An empty relevant allocation is valid: the output did not depend on any
/// experiment and can be shared by every requester.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelevantAllocation(BTreeMap<ExperimentName, String>);

impl CompleteAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, experiment: impl Into<ExperimentName>, variant: impl Into<String>) {
        self.0.insert(experiment.into(), variant.into());
    }

    pub fn variant(&self, experiment: &str) -> Option<&str> {
        self.0.get(experiment).map(String::as_str)
    }

    /// True when every experiment in `relevant` is assigned here with the same variant.
    ///
    /// Experiments present here but absent from `relevant` never affect the result.
    pub fn satisfies(&self, relevant: &RelevantAllocation) -> bool {
        relevant
            .0
            .iter()
            .all(|(experiment, variant)| self.0.get(experiment) == Some(variant))
    }

    /// Keep only the named experiments. Names without an assignment are skipped.
    pub fn narrow<'a, I>(&self, experiments: I) -> RelevantAllocation
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut relevant = RelevantAllocation::new();
        for experiment in experiments {
            if let Some((name, variant)) = self.0.get_key_value(experiment) {
                relevant.0.insert(name.clone(), variant.clone());
            }
        }
        relevant
    }

    /// The whole allocation viewed as a relevance upper bound.
    pub fn as_relevant(&self) -> RelevantAllocation {
        RelevantAllocation(self.0.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExperimentName, &str)> {
        self.0.iter().map(|(name, variant)| (name, variant.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl RelevantAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, experiment: impl Into<ExperimentName>, variant: impl Into<String>) {
        self.0.insert(experiment.into(), variant.into());
    }

    pub fn variant(&self, experiment: &str) -> Option<&str> {
        self.0.get(experiment).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExperimentName, &str)> {
        self.0.iter().map(|(name, variant)| (name, variant.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn approx_size(&self) -> usize {
        self.0
            .iter()
            .map(|(name, variant)| name.as_str().len() + variant.len())
            .sum()
    }
}

impl<N, V> FromIterator<(N, V)> for CompleteAllocation
where
    N: Into<ExperimentName>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, variant)| (name.into(), variant.into()))
                .collect(),
        )
    }
}

impl<N, V> FromIterator<(N, V)> for RelevantAllocation
where
    N: Into<ExperimentName>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, variant)| (name.into(), variant.into()))
                .collect(),
        )
    }
}

impl fmt::Display for RelevantAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (name, variant)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={variant}")?;
        }
        f.write_str("}")
    }
}

//! Experiment-aware render cache for anonymous server-rendered page requests,
//! with the caching proxy that fronts an SSR origin.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;

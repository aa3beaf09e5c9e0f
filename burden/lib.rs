//! Gene-level rare-variant burden testing.
//!
//! The pipeline is a strictly forward sequence of pure stages:
//! variant frequency filtering, interval annotation, per-gene aggregation,
//! HWE-normalized PCA covariates, per-gene OLS regression and ranking.
//! [`pipeline::run`] composes them; each stage is also usable on its own.

pub mod aggregate;
pub mod config;
pub mod genotypes;
pub mod intervals;
pub mod phenotypes;
pub mod pipeline;
pub mod progress;
pub mod rank;
pub mod regression;
pub mod report;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod types;
pub mod variant_filter;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../map/mod.rs"]
pub mod map;

//! # Pipeline Configuration
//!
//! A single [`BurdenConfig`] value is built once (from defaults, an optional
//! TOML file and command-line overrides) and handed by reference to every
//! stage. Nothing in the crate reads process-wide settings.

use crate::map::DEFAULT_GRAM_BUDGET_BYTES;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_AF_THRESHOLD: f64 = 0.01;
pub const DEFAULT_NUM_PCS: usize = 3;

/// Tie-break applied when a variant falls inside more than one gene interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// The overlapping interval that appears first in the reference file.
    #[default]
    FirstInFile,
    /// The overlapping interval with the smallest start; file order breaks ties.
    LeftmostStart,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Allele frequency threshold must lie in (0, 1], got {0}")]
    InvalidThreshold(f64),
    #[error("PCA minor allele frequency cutoff must lie in [0, 0.5), got {0}")]
    InvalidPcaMaf(f64),
    #[error("Thread count must be positive when set")]
    InvalidThreads,
    #[error("Column '{0}' is listed more than once among phenotype and covariates")]
    DuplicateColumn(String),
    #[error("Column names must not be empty")]
    EmptyColumnName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BurdenConfig {
    /// Variants are retained only when their allele frequency is strictly below this value.
    pub af_threshold: f64,
    pub overlap_policy: OverlapPolicy,
    /// Number of principal components added as covariates. Zero disables PCA.
    pub num_pcs: usize,
    /// Variants whose minor allele frequency does not exceed this value are left out of PCA.
    pub pca_min_maf: f64,
    /// Largest dense sample covariance matrix PCA may allocate, in bytes. Zero lifts the limit.
    pub pca_gram_budget_bytes: u64,
    pub phenotype: String,
    pub covariates: Vec<String>,
    pub sample_id_column: String,
    pub threads: Option<usize>,
}

impl Default for BurdenConfig {
    fn default() -> Self {
        Self {
            af_threshold: DEFAULT_AF_THRESHOLD,
            overlap_policy: OverlapPolicy::default(),
            num_pcs: DEFAULT_NUM_PCS,
            pca_min_maf: 0.0,
            pca_gram_budget_bytes: DEFAULT_GRAM_BUDGET_BYTES,
            phenotype: "phenotype".to_string(),
            covariates: vec!["sex".to_string()],
            sample_id_column: "sample_id".to_string(),
            threads: None,
        }
    }
}

impl BurdenConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.af_threshold > 0.0 && self.af_threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold(self.af_threshold));
        }
        if !(self.pca_min_maf >= 0.0 && self.pca_min_maf < 0.5) {
            return Err(ConfigError::InvalidPcaMaf(self.pca_min_maf));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::InvalidThreads);
        }

        let mut seen = std::collections::HashSet::new();
        for name in std::iter::once(&self.phenotype)
            .chain(self.covariates.iter())
            .chain(std::iter::once(&self.sample_id_column))
        {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyColumnName);
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateColumn(name.clone()));
            }
        }
        Ok(())
    }

    /// Number of columns in the base design: intercept, covariates and PCs.
    pub fn base_design_width(&self) -> usize {
        1 + self.covariates.len() + self.num_pcs
    }
}

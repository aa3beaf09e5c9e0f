use crate::progress::{NoopProgress, PipelineStage, ProgressObserver};
use core::cmp::min;
use core::fmt;
use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use rayon::prelude::*;
use std::convert::Infallible;
use std::error::Error;
use std::ops::Range;

pub const HWE_VARIANCE_EPSILON: f64 = 1.0e-12;
pub const HWE_SCALE_FLOOR: f64 = 1.0e-6;
pub const EIGENVALUE_EPSILON: f64 = 1.0e-9;
pub const DEFAULT_BLOCK_WIDTH: usize = 2_048;
pub const DEFAULT_GRAM_BUDGET_BYTES: u64 = 8 * 1024 * 1024 * 1024;
const PARALLEL_STANDARDIZE_MIN_VARIANTS: usize = 32;

fn gram_matrix_size_bytes(n: usize) -> Option<u64> {
    let n = u64::try_from(n).ok()?;
    n.checked_mul(n)?.checked_mul(core::mem::size_of::<f64>() as u64)
}

/// Streams genotype dosages one block of variants at a time.
///
/// `next_block_into` writes variant-major data: variant `v` of the block
/// occupies `storage[v * n_samples..(v + 1) * n_samples]`. Missing calls are
/// written as NaN. It returns the number of variants written, zero once the
/// source is exhausted.
pub trait VariantBlockSource {
    type Error;

    fn n_samples(&self) -> usize;
    fn n_variants(&self) -> usize;
    fn reset(&mut self) -> Result<(), Self::Error>;
    fn next_block_into(
        &mut self,
        max_variants: usize,
        storage: &mut [f64],
    ) -> Result<usize, Self::Error>;
}

pub struct DenseBlockSource<'a> {
    data: &'a [f64],
    dims: (usize, usize),
    cursor: usize,
}

impl<'a> DenseBlockSource<'a> {
    pub fn new(data: &'a [f64], n_samples: usize, n_variants: usize) -> Result<Self, HwePcaError> {
        if n_samples == 0 {
            return Err(HwePcaError::InvalidInput(
                "DenseBlockSource: n_samples must be positive",
            ));
        }
        if n_variants == 0 {
            return Err(HwePcaError::InvalidInput(
                "DenseBlockSource: n_variants must be positive",
            ));
        }
        let expected = n_samples
            .checked_mul(n_variants)
            .ok_or(HwePcaError::InvalidInput("DenseBlockSource: dimension overflow"))?;
        if data.len() != expected {
            return Err(HwePcaError::InvalidInput(
                "DenseBlockSource: data length does not match dimensions",
            ));
        }
        Ok(Self {
            data,
            dims: (n_samples, n_variants),
            cursor: 0,
        })
    }
}

impl<'a> VariantBlockSource for DenseBlockSource<'a> {
    type Error = Infallible;

    fn n_samples(&self) -> usize {
        self.dims.0
    }

    fn n_variants(&self) -> usize {
        self.dims.1
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.cursor = 0;
        Ok(())
    }

    fn next_block_into(
        &mut self,
        max_variants: usize,
        storage: &mut [f64],
    ) -> Result<usize, Self::Error> {
        if max_variants == 0 {
            return Ok(0);
        }
        let remaining = self.n_variants().saturating_sub(self.cursor);
        if remaining == 0 {
            return Ok(0);
        }
        let ncols = min(max_variants, remaining);
        let nrows = self.n_samples();
        let len = nrows * ncols;
        let start = self.cursor * nrows;
        storage[..len].copy_from_slice(&self.data[start..start + len]);
        self.cursor += ncols;
        Ok(ncols)
    }
}

#[derive(Debug)]
pub enum HwePcaError {
    InvalidInput(&'static str),
    GramBudgetExceeded { n_samples: usize, budget_bytes: u64 },
    Source(Box<dyn Error + Send + Sync + 'static>),
    Eigen(String),
}

impl fmt::Display for HwePcaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwePcaError::InvalidInput(msg) => f.write_str(msg),
            HwePcaError::GramBudgetExceeded {
                n_samples,
                budget_bytes,
            } => write!(
                f,
                "{n_samples}x{n_samples} sample covariance matrix exceeds the memory budget of {budget_bytes} bytes"
            ),
            HwePcaError::Source(err) => write!(f, "source error: {err}"),
            HwePcaError::Eigen(msg) => f.write_str(msg),
        }
    }
}

impl Error for HwePcaError {}

fn source_error<E>(err: E) -> HwePcaError
where
    E: Error + Send + Sync + 'static,
{
    HwePcaError::Source(Box::new(err))
}

#[derive(Clone, Debug, PartialEq)]
pub struct FitOptions {
    pub components: usize,
    /// Variants whose minor allele frequency does not exceed this value are
    /// left out of the decomposition.
    pub min_maf: f64,
    pub block_width: usize,
    /// Upper bound on the dense sample-by-sample covariance matrix. Zero lifts it.
    pub gram_budget_bytes: u64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            components: 3,
            min_maf: 0.0,
            block_width: DEFAULT_BLOCK_WIDTH,
            gram_budget_bytes: DEFAULT_GRAM_BUDGET_BYTES,
        }
    }
}

/// Per-variant Hardy-Weinberg centering and scaling. A scale of zero marks a
/// variant excluded from the decomposition.
#[derive(Clone, Debug)]
pub struct HweScaler {
    frequencies: Vec<f64>,
    scales: Vec<f64>,
}

impl HweScaler {
    fn from_sums(sums: &[(f64, usize)], min_maf: f64) -> Self {
        let mut frequencies = Vec::with_capacity(sums.len());
        let mut scales = Vec::with_capacity(sums.len());
        for &(sum, calls) in sums {
            if calls == 0 {
                frequencies.push(0.0);
                scales.push(0.0);
                continue;
            }
            let mean_genotype = sum / calls as f64;
            let allele_freq = (mean_genotype / 2.0).clamp(0.0, 1.0);
            let maf = allele_freq.min(1.0 - allele_freq);
            let variance = 2.0 * allele_freq * (1.0 - allele_freq);

            frequencies.push(allele_freq);
            scales.push(if variance <= HWE_VARIANCE_EPSILON || maf <= min_maf {
                0.0
            } else {
                variance.sqrt().max(HWE_SCALE_FLOOR)
            });
        }
        Self {
            frequencies,
            scales,
        }
    }

    pub fn allele_frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn variant_scales(&self) -> &[f64] {
        &self.scales
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Variants that enter the decomposition.
    pub fn n_informative(&self) -> usize {
        self.scales.iter().filter(|&&s| s > 0.0).count()
    }

    /// Standardizes a variant-major block in place. Missing values become 0
    /// after centering; excluded variants become all zeros.
    pub(crate) fn standardize_block(
        &self,
        block: &mut [f64],
        n_samples: usize,
        variant_range: Range<usize>,
    ) {
        let freqs = &self.frequencies[variant_range.clone()];
        let scales = &self.scales[variant_range];
        debug_assert_eq!(block.len(), freqs.len() * n_samples);

        let apply = |(column, (&freq, &scale)): (&mut [f64], (&f64, &f64))| {
            if scale == 0.0 {
                column.fill(0.0);
                return;
            }
            let mean = 2.0 * freq;
            let inv = scale.recip();
            for value in column.iter_mut() {
                *value = if value.is_finite() {
                    (*value - mean) * inv
                } else {
                    0.0
                };
            }
        };

        if freqs.len() >= PARALLEL_STANDARDIZE_MIN_VARIANTS {
            block
                .par_chunks_mut(n_samples)
                .zip(freqs.par_iter().zip(scales.par_iter()))
                .for_each(apply);
        } else {
            block
                .chunks_mut(n_samples)
                .zip(freqs.iter().zip(scales.iter()))
                .for_each(apply);
        }
    }
}

fn sum_and_count_finite(values: &[f64]) -> (f64, usize) {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), &v| (sum + v, count + 1))
}

/// Principal components of the HWE-standardized genotype matrix.
///
/// With `Z` the `n × m` standardized matrix and `C = Z Zᵀ / (n − 1)`, the
/// explained variances are the leading eigenvalues of `C` and the sample
/// scores are `U·σ` with `σ = sqrt((n − 1)·λ)` the singular values of `Z`.
/// Each component is oriented so that its largest-magnitude score is
/// positive; orientation is stable within this crate only.
#[derive(Clone, Debug)]
pub struct HwePcaModel {
    n_samples: usize,
    n_variants: usize,
    scaler: HweScaler,
    eigenvalues: Vec<f64>,
    singular_values: Vec<f64>,
    total_variance: f64,
    sample_scores: Array2<f64>,
}

impl HwePcaModel {
    pub fn fit_k<S>(source: &mut S, components: usize) -> Result<Self, HwePcaError>
    where
        S: VariantBlockSource,
        S::Error: Error + Send + Sync + 'static,
    {
        let options = FitOptions {
            components,
            ..FitOptions::default()
        };
        Self::fit_with_options(source, &options, &NoopProgress)
    }

    pub fn fit_with_options<S>(
        source: &mut S,
        options: &FitOptions,
        progress: &dyn ProgressObserver,
    ) -> Result<Self, HwePcaError>
    where
        S: VariantBlockSource,
        S::Error: Error + Send + Sync + 'static,
    {
        let n_samples = source.n_samples();
        let n_variants_hint = source.n_variants();

        if n_samples < 2 {
            return Err(HwePcaError::InvalidInput(
                "HWE PCA requires at least two samples",
            ));
        }
        if options.components == 0 {
            return Err(HwePcaError::InvalidInput(
                "Requested component count must be at least one",
            ));
        }
        if !(0.0..0.5).contains(&options.min_maf) {
            return Err(HwePcaError::InvalidInput(
                "Minimum minor allele frequency must lie in [0, 0.5)",
            ));
        }
        if options.gram_budget_bytes > 0 {
            match gram_matrix_size_bytes(n_samples) {
                Some(bytes) if bytes <= options.gram_budget_bytes => {}
                _ => {
                    return Err(HwePcaError::GramBudgetExceeded {
                        n_samples,
                        budget_bytes: options.gram_budget_bytes,
                    });
                }
            }
        }

        let target_components = options.components.min(n_samples - 1);
        let block_capacity = options.block_width.max(1).min(n_variants_hint.max(1));
        let mut block_storage = vec![0.0f64; n_samples * block_capacity];

        progress.on_stage_start(PipelineStage::Covariates, 2 * n_variants_hint);

        // Pass 1: allele statistics.
        source.reset().map_err(source_error)?;
        let mut sums = Vec::with_capacity(n_variants_hint);
        loop {
            let filled = source
                .next_block_into(block_capacity, &mut block_storage)
                .map_err(source_error)?;
            if filled == 0 {
                break;
            }
            sums.extend(
                block_storage[..filled * n_samples]
                    .chunks(n_samples)
                    .map(sum_and_count_finite),
            );
            progress.on_stage_advance(PipelineStage::Covariates, filled);
        }
        let scaler = HweScaler::from_sums(&sums, options.min_maf);
        let n_variants = scaler.len();
        if n_variants == 0 {
            return Err(HwePcaError::InvalidInput(
                "HWE PCA requires at least one variant",
            ));
        }
        let informative = scaler.n_informative();
        if informative == 0 {
            return Err(HwePcaError::InvalidInput(
                "HWE PCA found no polymorphic variants above the frequency floor",
            ));
        }
        log::info!(
            "PCA input: {} of {} variants are informative across {} samples",
            informative,
            n_variants,
            n_samples
        );

        // Pass 2: blockwise Gram matrix Z Zᵀ.
        source.reset().map_err(source_error)?;
        let mut gram = Array2::<f64>::zeros((n_samples, n_samples));
        let mut offset = 0usize;
        loop {
            let filled = source
                .next_block_into(block_capacity, &mut block_storage)
                .map_err(source_error)?;
            if filled == 0 {
                break;
            }
            if offset + filled > n_variants {
                return Err(HwePcaError::InvalidInput(
                    "Variant source yielded more variants on the second pass",
                ));
            }
            let block = &mut block_storage[..filled * n_samples];
            scaler.standardize_block(block, n_samples, offset..offset + filled);
            let z_t = ArrayView2::from_shape((filled, n_samples), &*block)
                .map_err(|e| HwePcaError::Eigen(e.to_string()))?;
            general_mat_mul(1.0, &z_t.t(), &z_t, 1.0, &mut gram);
            offset += filled;
            progress.on_stage_advance(PipelineStage::Covariates, filled);
        }
        if offset != n_variants {
            return Err(HwePcaError::InvalidInput(
                "Variant source changed between passes",
            ));
        }

        let denom = (n_samples - 1) as f64;
        gram.mapv_inplace(|v| v / denom);
        let total_variance = gram.diag().sum();

        let (values, vectors) = gram
            .eigh(UPLO::Lower)
            .map_err(|e| HwePcaError::Eigen(e.to_string()))?;
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
        let kept: Vec<usize> = order
            .into_iter()
            .filter(|&idx| values[idx] > EIGENVALUE_EPSILON)
            .take(target_components)
            .collect();
        progress.on_stage_finish(PipelineStage::Covariates);

        if kept.is_empty() {
            return Err(HwePcaError::Eigen(
                "All eigenvalues are numerically zero; increase cohort size or review input data"
                    .into(),
            ));
        }
        if kept.len() < options.components {
            log::warn!(
                "Requested {} principal components but only {} are available",
                options.components,
                kept.len()
            );
        }

        let eigenvalues: Vec<f64> = kept.iter().map(|&idx| values[idx]).collect();
        let mut singular_values = Vec::with_capacity(kept.len());
        let mut sample_scores = Array2::<f64>::zeros((n_samples, kept.len()));
        for (mut column, &idx) in sample_scores.axis_iter_mut(Axis(1)).zip(&kept) {
            let sigma = (denom * values[idx]).sqrt();
            singular_values.push(sigma);
            column.assign(&vectors.column(idx));
            column *= sigma;
        }
        canonicalize_signs(&mut sample_scores);

        Ok(Self {
            n_samples,
            n_variants,
            scaler,
            eigenvalues,
            singular_values,
            total_variance,
            sample_scores,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_variants(&self) -> usize {
        self.n_variants
    }

    pub fn scaler(&self) -> &HweScaler {
        &self.scaler
    }

    pub fn components(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn explained_variance(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn singular_values(&self) -> &[f64] {
        &self.singular_values
    }

    /// Share of the total standardized variance captured by each component.
    pub fn explained_variance_ratio(&self) -> Vec<f64> {
        if self.total_variance > 0.0 {
            self.eigenvalues
                .iter()
                .map(|&lambda| lambda / self.total_variance)
                .collect()
        } else {
            vec![0.0; self.eigenvalues.len()]
        }
    }

    /// Shape: [n_samples, components].
    pub fn sample_scores(&self) -> ArrayView2<'_, f64> {
        self.sample_scores.view()
    }
}

fn canonicalize_signs(scores: &mut Array2<f64>) {
    for mut column in scores.axis_iter_mut(Axis(1)) {
        let pivot = column
            .iter()
            .fold(0.0f64, |best, &v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
}

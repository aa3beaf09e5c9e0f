//! # Per-gene Linear Regression
//!
//! Fits `phenotype ~ 1 + burden + covariates` by ordinary least squares for
//! every gene of a [`BurdenMatrix`]. The intercept and covariate columns are
//! shared by all genes and validated once when the engine is built; each gene
//! then contributes a single burden column.
//!
//! The fit goes through a thin QR decomposition of the design, `X = QR`:
//! `beta = R⁻¹ Qᵀ y` and `Var(beta) = σ² R⁻¹ R⁻ᵀ`, with `σ² = RSS / (n − p)`.
//! Rank deficiency is read off the diagonal of `R`.

use crate::aggregate::BurdenMatrix;
use crate::progress::{PipelineStage, ProgressObserver};
use crate::types::RegressionResult;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate, s};
use ndarray_linalg::{Diag, QR, SolveTriangular, UPLO};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;

/// Why a design could not be fitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DegeneracyReason {
    #[error("design has {rows} rows but the phenotype has {expected} values")]
    DimensionMismatch { rows: usize, expected: usize },
    #[error("burden is constant across all samples")]
    ConstantBurden,
    #[error("design matrix is rank deficient at column {column}")]
    RankDeficient { column: usize },
    #[error("{n} samples leave no residual degrees of freedom for {p} parameters")]
    NoResidualDegreesOfFreedom { n: usize, p: usize },
    #[error("residual variance is zero")]
    PerfectFit,
    #[error("design or phenotype contains non-finite values")]
    NonFinite,
    #[error("linear algebra failure: {0}")]
    Linalg(String),
}

/// A gene whose regression could not be fitted. Non-fatal: the gene is
/// omitted from the results and counted in the run summary.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("gene '{gene}': {reason}")]
pub struct DegenerateDesignError {
    pub gene: String,
    pub reason: DegeneracyReason,
}

/// Output of [`RegressionEngine::fit_all`]. Results keep the matrix gene order.
#[derive(Debug, Clone, Default)]
pub struct RegressionOutcome {
    pub results: Vec<RegressionResult>,
    pub degenerate: Vec<DegenerateDesignError>,
}

struct LeastSquaresFit {
    coefficients: Array1<f64>,
    standard_errors: Array1<f64>,
    df: usize,
}

pub struct RegressionEngine {
    phenotype: Array1<f64>,
    /// `[1, covariates...]`, shape [n_samples, 1 + n_covariates].
    base_design: Array2<f64>,
}

impl RegressionEngine {
    /// Builds the shared part of the design. `covariates` has one row per
    /// sample and may have zero columns.
    pub fn new(
        phenotype: Array1<f64>,
        covariates: ArrayView2<'_, f64>,
    ) -> Result<Self, DegeneracyReason> {
        let n = phenotype.len();
        if covariates.nrows() != n {
            return Err(DegeneracyReason::DimensionMismatch {
                rows: covariates.nrows(),
                expected: n,
            });
        }
        if phenotype.iter().chain(covariates.iter()).any(|v| !v.is_finite()) {
            return Err(DegeneracyReason::NonFinite);
        }

        let intercept = Array2::<f64>::ones((n, 1));
        let base_design = concatenate(Axis(1), &[intercept.view(), covariates.view()])
            .map_err(|e| DegeneracyReason::Linalg(e.to_string()))?;

        // A degenerate base design would make every gene degenerate.
        let p = base_design.ncols() + 1;
        if n <= p {
            return Err(DegeneracyReason::NoResidualDegreesOfFreedom { n, p });
        }
        let (_, r) = base_design
            .qr()
            .map_err(|e| DegeneracyReason::Linalg(e.to_string()))?;
        check_rank(&r, n)?;

        Ok(Self {
            phenotype,
            base_design,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.phenotype.len()
    }

    /// Number of coefficients in each per-gene fit.
    pub fn n_parameters(&self) -> usize {
        self.base_design.ncols() + 1
    }

    /// Fits one gene. The burden coefficient is the second column of the
    /// design, after the intercept.
    pub fn fit_gene(
        &self,
        gene: &str,
        burden: ArrayView1<'_, u32>,
    ) -> Result<RegressionResult, DegenerateDesignError> {
        let degenerate = |reason| DegenerateDesignError {
            gene: gene.to_string(),
            reason,
        };

        let n = self.n_samples();
        if burden.len() != n {
            return Err(degenerate(DegeneracyReason::DimensionMismatch {
                rows: burden.len(),
                expected: n,
            }));
        }
        let first = burden.first().copied();
        if burden.iter().all(|&x| Some(x) == first) {
            return Err(degenerate(DegeneracyReason::ConstantBurden));
        }

        let burden = burden.mapv(f64::from);
        let design = concatenate(
            Axis(1),
            &[
                self.base_design.slice(s![.., ..1]),
                burden.view().insert_axis(Axis(1)),
                self.base_design.slice(s![.., 1..]),
            ],
        )
        .map_err(|e| degenerate(DegeneracyReason::Linalg(e.to_string())))?;

        let fit = least_squares(design.view(), self.phenotype.view()).map_err(degenerate)?;
        let beta = fit.coefficients[1];
        let standard_error = fit.standard_errors[1];
        let t_stat = beta / standard_error;
        let p_value = two_sided_p_value(t_stat, fit.df).map_err(degenerate)?;

        Ok(RegressionResult {
            gene: gene.to_string(),
            n,
            sum_x: burden.sum(),
            beta,
            standard_error,
            t_stat,
            p_value,
        })
    }

    /// Fits every gene of `matrix` in parallel. Degenerate genes are
    /// collected rather than aborting the run.
    pub fn fit_all(
        &self,
        matrix: &BurdenMatrix,
        progress: &dyn ProgressObserver,
    ) -> RegressionOutcome {
        progress.on_stage_start(PipelineStage::Regression, matrix.n_genes());
        let fits: Vec<Result<RegressionResult, DegenerateDesignError>> = matrix
            .genes()
            .par_iter()
            .enumerate()
            .map(|(idx, gene)| {
                let fit = self.fit_gene(gene, matrix.gene_column(idx));
                progress.on_stage_advance(PipelineStage::Regression, 1);
                fit
            })
            .collect();
        progress.on_stage_finish(PipelineStage::Regression);

        let mut outcome = RegressionOutcome::default();
        for fit in fits {
            match fit {
                Ok(result) => outcome.results.push(result),
                Err(err) => {
                    debug!("Skipping {err}");
                    outcome.degenerate.push(err);
                }
            }
        }

        if !outcome.degenerate.is_empty() {
            warn!(
                "{} genes had a degenerate design and were not tested",
                outcome.degenerate.len()
            );
        }
        info!(
            "Fitted {} gene regressions on {} samples ({} parameters each)",
            outcome.results.len(),
            self.n_samples(),
            self.n_parameters()
        );
        outcome
    }
}

fn check_rank(r: &Array2<f64>, n: usize) -> Result<(), DegeneracyReason> {
    let p = r.ncols();
    let diagonal = r.diag();
    let largest = diagonal.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let tolerance = n.max(p) as f64 * f64::EPSILON * largest;
    match diagonal.iter().position(|v| v.abs() <= tolerance) {
        Some(column) => Err(DegeneracyReason::RankDeficient { column }),
        None => Ok(()),
    }
}

fn least_squares(
    design: ArrayView2<'_, f64>,
    response: ArrayView1<'_, f64>,
) -> Result<LeastSquaresFit, DegeneracyReason> {
    let (n, p) = design.dim();
    if n <= p {
        return Err(DegeneracyReason::NoResidualDegreesOfFreedom { n, p });
    }

    let linalg = |e: ndarray_linalg::error::LinalgError| DegeneracyReason::Linalg(e.to_string());
    let (q, r) = design.qr().map_err(linalg)?;
    check_rank(&r, n)?;

    let qty = q.t().dot(&response);
    let coefficients = r
        .solve_triangular(UPLO::Upper, Diag::NonUnit, &qty)
        .map_err(linalg)?;

    let residuals = &response - &design.dot(&coefficients);
    let rss = residuals.dot(&residuals);
    let df = n - p;
    if !rss.is_finite() {
        return Err(DegeneracyReason::NonFinite);
    }
    let mean = response.mean().unwrap_or(0.0);
    let tss = response.fold(0.0, |acc, &y| acc + (y - mean) * (y - mean));
    if rss <= f64::EPSILON * tss {
        return Err(DegeneracyReason::PerfectFit);
    }
    let sigma2 = rss / df as f64;

    let r_inv = r
        .solve_triangular(UPLO::Upper, Diag::NonUnit, &Array2::<f64>::eye(p))
        .map_err(linalg)?;
    let standard_errors = r_inv
        .axis_iter(Axis(0))
        .map(|row| (sigma2 * row.dot(&row)).sqrt())
        .collect::<Array1<f64>>();

    Ok(LeastSquaresFit {
        coefficients,
        standard_errors,
        df,
    })
}

fn two_sided_p_value(t_stat: f64, df: usize) -> Result<f64, DegeneracyReason> {
    if !t_stat.is_finite() {
        return Err(DegeneracyReason::NonFinite);
    }
    let dist = StudentsT::new(0.0, 1.0, df as f64)
        .map_err(|e| DegeneracyReason::Linalg(e.to_string()))?;
    Ok((2.0 * dist.sf(t_stat.abs())).clamp(0.0, 1.0))
}

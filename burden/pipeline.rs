// ========================================================================================
//
//                               PIPELINE ORCHESTRATION
//
// ========================================================================================
//
// Loads the inputs once, then runs the stages strictly forward. Annotation and
// aggregation run concurrently with the PCA covariate builder, which reads raw
// genotypes only. Per-gene work inside each stage is parallel over rayon.

use crate::aggregate::{Aggregation, GeneAggregator};
use crate::config::{BurdenConfig, ConfigError};
use crate::genotypes::{GenotypeError, GenotypeTable};
use crate::intervals::{Annotation, GeneIntervals, IntervalAnnotator, IntervalError};
use crate::map::{FitOptions, GenotypeBlockSource, HwePcaError, HwePcaModel};
use crate::phenotypes::{Cohort, DataError, SampleTable, load_sample_table};
use crate::progress::{PipelineStage, ProgressObserver};
use crate::rank::ResultRanker;
use crate::regression::{DegeneracyReason, DegenerateDesignError, RegressionEngine};
use crate::report::ReportError;
use crate::types::{IssueKind, RegressionResult};
use crate::variant_filter::{FilterOutcome, VariantFilter, VariantList, VariantListError};
use log::info;
use ndarray::{Array2, s};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to load genotypes: {0}")]
    Genotypes(#[from] GenotypeError),
    #[error("Failed to load gene intervals: {0}")]
    Intervals(#[from] IntervalError),
    #[error("Failed to load sample table: {0}")]
    Data(#[from] DataError),
    #[error("Failed to load variant list: {0}")]
    VariantList(#[from] VariantListError),
    #[error("Principal component analysis failed: {0}")]
    Pca(#[from] HwePcaError),
    #[error("Covariate design is degenerate: {0}")]
    DegenerateCovariates(DegeneracyReason),
    #[error(
        "No genes left to test: {rare_variants} rare variants, {mapped_variants} mapped to genes, none with carriers in the cohort. Check the frequency threshold and gene reference."
    )]
    EmptyBurdenMatrix {
        rare_variants: usize,
        mapped_variants: usize,
    },
    #[error(
        "All {} genes with carriers have degenerate regression designs (first: {})",
        .degenerate.len(),
        .degenerate.first().map_or_else(String::new, ToString::to_string)
    )]
    AllGenesDegenerate { degenerate: Vec<DegenerateDesignError> },
    #[error("The cohort has {found} usable samples but at least {required} are required")]
    InsufficientSamples { found: usize, required: usize },
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to write results: {0}")]
    Report(#[from] ReportError),
}

/// Input files for a full run.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub genotypes: PathBuf,
    pub genes: PathBuf,
    pub samples: PathBuf,
    pub keep: Option<PathBuf>,
}

/// Counts describing what each stage kept and dropped.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_variants: usize,
    pub multiallelic_skipped: usize,
    pub not_listed: usize,
    pub above_threshold: usize,
    pub rare_variants: usize,
    pub unmapped_variants: usize,
    pub ambiguous_overlaps: usize,
    pub genes_with_carriers: usize,
    pub genes_without_carriers: usize,
    pub genes_tested: usize,
    pub degenerate_genes: Vec<DegenerateDesignError>,
    pub cohort_size: usize,
    pub samples_not_in_table: usize,
    pub samples_missing_values: usize,
    pub principal_components: usize,
}

impl RunSummary {
    /// Non-fatal issues grouped by kind.
    pub fn issue_counts(&self) -> BTreeMap<IssueKind, usize> {
        BTreeMap::from([
            (IssueKind::UnmappedVariant, self.unmapped_variants),
            (IssueKind::DegenerateDesign, self.degenerate_genes.len()),
        ])
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Cohort: {} samples ({} not in sample table, {} with missing values)",
            self.cohort_size, self.samples_not_in_table, self.samples_missing_values
        )?;
        writeln!(
            f,
            "Variants: {} loaded, {} multiallelic skipped, {} not in keep-list, {} at or above threshold, {} rare",
            self.total_variants,
            self.multiallelic_skipped,
            self.not_listed,
            self.above_threshold,
            self.rare_variants
        )?;
        writeln!(
            f,
            "Annotation: {} ambiguous overlaps",
            self.ambiguous_overlaps
        )?;
        writeln!(
            f,
            "Genes: {} with carriers ({} without carriers dropped), {} tested, {} principal components",
            self.genes_with_carriers,
            self.genes_without_carriers,
            self.genes_tested,
            self.principal_components
        )?;
        write!(f, "Issues:")?;
        for (kind, count) in self.issue_counts() {
            write!(f, " {kind}={count}")?;
        }
        for err in &self.degenerate_genes {
            write!(f, "\n  {err}")?;
        }
        Ok(())
    }
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Ranked from most to least significant.
    pub results: Vec<RegressionResult>,
    pub summary: RunSummary,
    pub cohort_sample_ids: Vec<String>,
    pub pca: Option<HwePcaModel>,
}

/// Loads every input and runs the pipeline, inside a dedicated thread pool
/// when `config.threads` is set.
pub fn run(
    config: &BurdenConfig,
    inputs: &PipelineInputs,
    progress: &dyn ProgressObserver,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    match config.threads {
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?
            .install(|| load_and_analyze(config, inputs, progress)),
        None => load_and_analyze(config, inputs, progress),
    }
}

fn load_and_analyze(
    config: &BurdenConfig,
    inputs: &PipelineInputs,
    progress: &dyn ProgressObserver,
) -> Result<PipelineOutput, PipelineError> {
    let genotypes = GenotypeTable::from_path(&inputs.genotypes)?;
    let reference = GeneIntervals::from_path(&inputs.genes)?;
    let samples = load_sample_table(&inputs.samples, config)?;
    let keep = inputs
        .keep
        .as_deref()
        .map(VariantList::from_file)
        .transpose()?;
    analyze(
        config,
        &genotypes,
        &reference,
        &samples,
        keep.as_ref(),
        progress,
    )
}

/// Runs every stage over already-loaded inputs.
pub fn analyze(
    config: &BurdenConfig,
    genotypes: &GenotypeTable,
    reference: &GeneIntervals,
    samples: &SampleTable,
    keep: Option<&VariantList>,
    progress: &dyn ProgressObserver,
) -> Result<PipelineOutput, PipelineError> {
    let cohort = samples.resolve_cohort(genotypes.sample_ids());
    let required = config.base_design_width() + 2;
    if cohort.len() < required {
        return Err(PipelineError::InsufficientSamples {
            found: cohort.len(),
            required,
        });
    }

    progress.on_stage_start(PipelineStage::VariantFilter, genotypes.n_variants());
    let filtered = VariantFilter::new(config.af_threshold).apply(genotypes.variants(), keep);
    progress.on_stage_advance(PipelineStage::VariantFilter, genotypes.n_variants());
    progress.on_stage_finish(PipelineStage::VariantFilter);

    let ((annotation, aggregation), pca) = rayon::join(
        || annotate_and_aggregate(config, genotypes, reference, &filtered, &cohort, progress),
        || build_principal_components(config, genotypes, &cohort, progress),
    );
    let pca = pca?;

    if aggregation.matrix.is_empty() {
        return Err(PipelineError::EmptyBurdenMatrix {
            rare_variants: filtered.retained.len(),
            mapped_variants: annotation.mapped().count(),
        });
    }

    let covariates = design_covariates(&cohort, pca.as_ref());
    let engine = RegressionEngine::new(cohort.phenotype.clone(), covariates.view())
        .map_err(PipelineError::DegenerateCovariates)?;
    let outcome = engine.fit_all(&aggregation.matrix, progress);
    if outcome.results.is_empty() {
        return Err(PipelineError::AllGenesDegenerate {
            degenerate: outcome.degenerate,
        });
    }
    let results = ResultRanker.rank(outcome.results);

    let summary = RunSummary {
        total_variants: genotypes.n_variants(),
        multiallelic_skipped: genotypes.multiallelic_skipped(),
        not_listed: filtered.not_listed,
        above_threshold: filtered.above_threshold,
        rare_variants: filtered.retained.len(),
        unmapped_variants: annotation.unmapped,
        ambiguous_overlaps: annotation.ambiguous,
        genes_with_carriers: aggregation.matrix.n_genes(),
        genes_without_carriers: aggregation.genes_without_carriers.len(),
        genes_tested: results.len(),
        degenerate_genes: outcome.degenerate,
        cohort_size: cohort.len(),
        samples_not_in_table: cohort.not_in_sample_table,
        samples_missing_values: cohort.dropped_missing,
        principal_components: pca.as_ref().map_or(0, HwePcaModel::components),
    };
    info!(
        "Burden run complete: {} genes tested, {} degenerate",
        summary.genes_tested,
        summary.degenerate_genes.len()
    );

    Ok(PipelineOutput {
        results,
        summary,
        cohort_sample_ids: cohort.sample_ids,
        pca,
    })
}

fn annotate_and_aggregate(
    config: &BurdenConfig,
    genotypes: &GenotypeTable,
    reference: &GeneIntervals,
    filtered: &FilterOutcome,
    cohort: &Cohort,
    progress: &dyn ProgressObserver,
) -> (Annotation, Aggregation) {
    progress.on_stage_start(PipelineStage::Annotation, filtered.retained.len());
    let annotation = IntervalAnnotator::new(reference, config.overlap_policy)
        .annotate(genotypes.variants(), &filtered.retained);
    progress.on_stage_advance(PipelineStage::Annotation, filtered.retained.len());
    progress.on_stage_finish(PipelineStage::Annotation);

    let aggregation = GeneAggregator::new(reference).aggregate(
        genotypes.variants(),
        &annotation,
        &cohort.genotype_columns,
        &cohort.sample_ids,
        progress,
    );
    (annotation, aggregation)
}

fn build_principal_components(
    config: &BurdenConfig,
    genotypes: &GenotypeTable,
    cohort: &Cohort,
    progress: &dyn ProgressObserver,
) -> Result<Option<HwePcaModel>, HwePcaError> {
    if config.num_pcs == 0 {
        return Ok(None);
    }
    let mut source = GenotypeBlockSource::new(genotypes, cohort.genotype_columns.clone());
    let options = FitOptions {
        components: config.num_pcs,
        min_maf: config.pca_min_maf,
        gram_budget_bytes: config.pca_gram_budget_bytes,
        ..FitOptions::default()
    };
    HwePcaModel::fit_with_options(&mut source, &options, progress).map(Some)
}

/// Fits principal components over every genotype sample, for the standalone
/// `pcs` command.
pub fn principal_components(
    genotypes: &GenotypeTable,
    options: &FitOptions,
    progress: &dyn ProgressObserver,
) -> Result<HwePcaModel, PipelineError> {
    let mut source = GenotypeBlockSource::all_samples(genotypes);
    Ok(HwePcaModel::fit_with_options(&mut source, options, progress)?)
}

/// Table covariates followed by principal component scores.
fn design_covariates(cohort: &Cohort, pca: Option<&HwePcaModel>) -> Array2<f64> {
    match pca {
        Some(model) => {
            let n_table = cohort.covariates.ncols();
            let mut out = Array2::zeros((cohort.len(), n_table + model.components()));
            out.slice_mut(s![.., ..n_table]).assign(&cohort.covariates);
            out.slice_mut(s![.., n_table..]).assign(&model.sample_scores());
            out
        }
        None => cohort.covariates.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_counts_per_issue_kind() {
        let summary = RunSummary {
            unmapped_variants: 4,
            degenerate_genes: vec![DegenerateDesignError {
                gene: "EMPTY".into(),
                reason: DegeneracyReason::ConstantBurden,
            }],
            ..RunSummary::default()
        };
        let counts = summary.issue_counts();
        assert_eq!(counts[&IssueKind::UnmappedVariant], 4);
        assert_eq!(counts[&IssueKind::DegenerateDesign], 1);

        let text = summary.to_string();
        assert!(text.contains("UnmappedVariant=4"));
        assert!(text.contains("DegenerateDesignError=1"));
        assert!(text.contains("gene 'EMPTY'"));
    }
}

//! # Gene Aggregation
//!
//! Collapses annotated variants into a sample × gene carrier-count matrix.
//! For each (sample, gene) the count is the number of that gene's variants at
//! which the sample carries at least one alternate allele. Missing calls never
//! contribute a carrier. Genes with no carriers in the cohort are dropped.

use crate::intervals::{Annotation, GeneIntervals};
use crate::progress::{PipelineStage, ProgressObserver};
use crate::types::Variant;
use log::info;
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum BurdenMatrixError {
    #[error("Burden matrix has {rows} rows but {samples} sample ids")]
    SampleMismatch { rows: usize, samples: usize },
    #[error("Burden matrix has {cols} columns but {genes} gene names")]
    GeneMismatch { cols: usize, genes: usize },
    #[error("Gene '{0}' has no carriers")]
    EmptyGene(String),
}

/// Sample × gene matrix of carrier counts. Every gene column has at least
/// one non-zero entry.
#[derive(Clone, Debug, PartialEq)]
pub struct BurdenMatrix {
    sample_ids: Vec<String>,
    genes: Vec<String>,
    counts: Array2<u32>,
}

impl BurdenMatrix {
    pub fn new(
        sample_ids: Vec<String>,
        genes: Vec<String>,
        counts: Array2<u32>,
    ) -> Result<Self, BurdenMatrixError> {
        if counts.nrows() != sample_ids.len() {
            return Err(BurdenMatrixError::SampleMismatch {
                rows: counts.nrows(),
                samples: sample_ids.len(),
            });
        }
        if counts.ncols() != genes.len() {
            return Err(BurdenMatrixError::GeneMismatch {
                cols: counts.ncols(),
                genes: genes.len(),
            });
        }
        for (gene, column) in genes.iter().zip(counts.axis_iter(Axis(1))) {
            if column.iter().all(|&c| c == 0) {
                return Err(BurdenMatrixError::EmptyGene(gene.clone()));
            }
        }
        Ok(Self {
            sample_ids,
            genes,
            counts,
        })
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn n_samples(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.n_genes() == 0
    }

    pub fn counts(&self) -> &Array2<u32> {
        &self.counts
    }

    pub fn gene_column(&self, gene: usize) -> ArrayView1<'_, u32> {
        self.counts.column(gene)
    }
}

/// Output of [`GeneAggregator::aggregate`].
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregation {
    pub matrix: BurdenMatrix,
    /// Number of rare variants assigned to each retained gene, aligned with
    /// `matrix.genes()`.
    pub variants_per_gene: Vec<usize>,
    /// Genes with assigned variants but no carrier in the cohort.
    pub genes_without_carriers: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct GeneAggregator<'a> {
    reference: &'a GeneIntervals,
}

impl<'a> GeneAggregator<'a> {
    pub fn new(reference: &'a GeneIntervals) -> Self {
        Self { reference }
    }

    /// Aggregates carriers per gene for the cohort. `samples[i]` is the
    /// genotype column of cohort member `i`; `sample_ids` are their ids.
    pub fn aggregate(
        &self,
        variants: &[Variant],
        annotation: &Annotation,
        samples: &[usize],
        sample_ids: &[String],
        progress: &dyn ProgressObserver,
    ) -> Aggregation {
        let mut grouped: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for av in annotation.mapped() {
            if let Some(gene) = av.gene {
                grouped
                    .entry(self.reference.gene_name(gene))
                    .or_default()
                    .push(av.index);
            }
        }
        let grouped: Vec<(&str, Vec<usize>)> = grouped.into_iter().collect();

        progress.on_stage_start(PipelineStage::Aggregation, grouped.len());
        let columns: Vec<Vec<u32>> = grouped
            .par_iter()
            .map(|(_, variant_indices)| {
                let column = carrier_counts(variants, variant_indices, samples);
                progress.on_stage_advance(PipelineStage::Aggregation, 1);
                column
            })
            .collect();
        progress.on_stage_finish(PipelineStage::Aggregation);

        let mut genes = Vec::new();
        let mut variants_per_gene = Vec::new();
        let mut kept_columns = Vec::new();
        let mut genes_without_carriers = Vec::new();
        for ((gene, variant_indices), column) in grouped.into_iter().zip(columns) {
            if column.iter().any(|&c| c > 0) {
                genes.push(gene.to_string());
                variants_per_gene.push(variant_indices.len());
                kept_columns.push(column);
            } else {
                genes_without_carriers.push(gene.to_string());
            }
        }

        let mut counts = Array2::<u32>::zeros((samples.len(), kept_columns.len()));
        for (mut target, column) in counts.axis_iter_mut(Axis(1)).zip(&kept_columns) {
            for (slot, &value) in target.iter_mut().zip(column) {
                *slot = value;
            }
        }

        info!(
            "Aggregated {} genes over {} samples ({} genes without carriers dropped)",
            genes.len(),
            samples.len(),
            genes_without_carriers.len()
        );

        Aggregation {
            matrix: BurdenMatrix {
                sample_ids: sample_ids.to_vec(),
                genes,
                counts,
            },
            variants_per_gene,
            genes_without_carriers,
        }
    }
}

fn carrier_counts(variants: &[Variant], variant_indices: &[usize], samples: &[usize]) -> Vec<u32> {
    let mut column = vec![0u32; samples.len()];
    for &vi in variant_indices {
        let calls = &variants[vi].calls;
        for (slot, &sample) in column.iter_mut().zip(samples) {
            if matches!(calls[sample], Some(c) if c > 0) {
                *slot += 1;
            }
        }
    }
    column
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlapPolicy;
    use crate::intervals::{GeneInterval, IntervalAnnotator};
    use crate::progress::NoopProgress;
    use crate::types::{FilteredVariant, VariantKey};
    use crate::variant_filter::VariantFilter;
    use ndarray::array;

    fn variant(pos: u64, calls: Vec<Option<u8>>) -> Variant {
        Variant {
            key: VariantKey::new("1", pos),
            reference: "A".into(),
            alternate: "G".into(),
            calls,
        }
    }

    fn reference() -> GeneIntervals {
        GeneIntervals::new(vec![
            GeneInterval {
                chromosome: "1".into(),
                start: 1,
                end: 100,
                gene: "ZETA".into(),
            },
            GeneInterval {
                chromosome: "1".into(),
                start: 101,
                end: 200,
                gene: "ALPHA".into(),
            },
            GeneInterval {
                chromosome: "1".into(),
                start: 201,
                end: 300,
                gene: "EMPTY".into(),
            },
        ])
    }

    fn run(variants: &[Variant], samples: &[usize]) -> Aggregation {
        let reference = reference();
        let filtered: Vec<FilteredVariant> = (0..variants.len())
            .map(|index| FilteredVariant {
                index,
                allele_frequency: 0.0,
            })
            .collect();
        let annotation = IntervalAnnotator::new(&reference, OverlapPolicy::FirstInFile)
            .annotate(variants, &filtered);
        let ids: Vec<String> = samples.iter().map(|s| format!("s{s}")).collect();
        GeneAggregator::new(&reference).aggregate(variants, &annotation, samples, &ids, &NoopProgress)
    }

    #[test]
    fn counts_carriers_not_alleles_and_ignores_missing() {
        let variants = vec![
            variant(10, vec![Some(2), Some(1), None, Some(0)]),
            variant(20, vec![Some(1), None, Some(0), Some(0)]),
            variant(150, vec![Some(0), Some(0), Some(1), Some(0)]),
            variant(250, vec![Some(0), Some(0), None, Some(0)]),
            variant(5000, vec![Some(1), Some(1), Some(1), Some(1)]),
        ];
        let aggregation = run(&variants, &[0, 1, 2, 3]);
        let matrix = &aggregation.matrix;

        assert_eq!(matrix.genes(), &["ALPHA", "ZETA"]);
        assert_eq!(matrix.counts(), &array![[0u32, 2], [0, 1], [1, 0], [0, 0]]);
        assert_eq!(aggregation.variants_per_gene, vec![1, 2]);
        assert_eq!(aggregation.genes_without_carriers, vec!["EMPTY"]);
        for column in matrix.counts().axis_iter(Axis(1)) {
            assert!(column.sum() > 0);
        }
    }

    #[test]
    fn cohort_subset_drives_rows_and_empty_genes() {
        let variants = vec![
            variant(10, vec![Some(1), Some(0), Some(0)]),
            variant(150, vec![Some(0), Some(0), Some(1)]),
        ];
        let aggregation = run(&variants, &[2, 1]);
        let matrix = &aggregation.matrix;
        assert_eq!(matrix.sample_ids(), &["s2", "s1"]);
        assert_eq!(matrix.genes(), &["ALPHA"]);
        assert_eq!(matrix.counts(), &array![[1u32], [0]]);
        assert_eq!(aggregation.genes_without_carriers, vec!["ZETA"]);
    }

    #[test]
    fn only_the_rare_site_reaches_its_gene() {
        // 100 samples: chr1:100 at AF 0.005 and chr1:500 at AF 0.02.
        let variants = vec![
            variant(100, (0..100).map(|i| Some(u8::from(i < 1))).collect()),
            variant(500, (0..100).map(|i| Some(u8::from(i < 4))).collect()),
        ];
        let reference = GeneIntervals::new(vec![GeneInterval {
            chromosome: "chr1".into(),
            start: 1,
            end: 1000,
            gene: "GENE_A".into(),
        }]);
        let filtered = VariantFilter::new(0.01).apply(&variants, None).retained;
        assert_eq!(filtered.len(), 1);

        let annotation = IntervalAnnotator::new(&reference, OverlapPolicy::FirstInFile)
            .annotate(&variants, &filtered);
        let samples: Vec<usize> = (0..100).collect();
        let ids: Vec<String> = samples.iter().map(|s| format!("s{s}")).collect();
        let aggregation = GeneAggregator::new(&reference).aggregate(
            &variants,
            &annotation,
            &samples,
            &ids,
            &NoopProgress,
        );
        assert_eq!(aggregation.matrix.genes(), &["GENE_A"]);
        assert_eq!(aggregation.variants_per_gene, vec![1]);
        assert_eq!(aggregation.matrix.counts().column(0).sum(), 1);
    }

    #[test]
    fn new_enforces_non_empty_columns() {
        let err = BurdenMatrix::new(
            vec!["a".into(), "b".into()],
            vec!["G1".into(), "G2".into()],
            array![[1, 0], [0, 0]],
        )
        .unwrap_err();
        assert_eq!(err, BurdenMatrixError::EmptyGene("G2".into()));

        let ok = BurdenMatrix::new(vec!["a".into()], vec!["G1".into()], array![[3]]).unwrap();
        assert_eq!(ok.gene_column(0)[0], 3);
    }
}

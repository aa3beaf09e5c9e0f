//! # Gene Interval Reference and Annotation
//!
//! Gene intervals use 1-based, closed `[start, end]` coordinates. The
//! reference is loaded once into per-chromosome vectors sorted by start, each
//! paired with a running maximum of interval ends. A lookup binary-searches
//! for the last interval starting at or before the position and walks
//! backwards only while the running maximum can still reach the position.

use crate::config::OverlapPolicy;
use crate::shared::files::open_text_source;
use crate::types::{AnnotatedVariant, FilteredVariant, Variant, normalize_chromosome};
use ahash::AHashMap;
use log::{info, warn};
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntervalError {
    #[error("IO error reading gene intervals: {0}")]
    Io(#[from] io::Error),
    #[error("MalformedReferenceInterval at line {line}: {message}")]
    MalformedReferenceInterval { line: usize, message: String },
}

/// A single reference interval, immutable once loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneInterval {
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
    pub gene: String,
}

impl GeneInterval {
    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }
}

#[derive(Clone, Copy, Debug)]
struct IndexedInterval {
    start: u64,
    end: u64,
    /// Row order in the reference file.
    order: usize,
    gene: usize,
}

#[derive(Clone, Debug, Default)]
struct ChromosomeIndex {
    intervals: Vec<IndexedInterval>,
    max_end: Vec<u64>,
}

impl ChromosomeIndex {
    fn build(mut intervals: Vec<IndexedInterval>) -> Self {
        intervals.sort_by_key(|iv| (iv.start, iv.order));
        let mut running = 0u64;
        let max_end = intervals
            .iter()
            .map(|iv| {
                running = running.max(iv.end);
                running
            })
            .collect();
        Self { intervals, max_end }
    }

    fn overlapping(&self, position: u64, out: &mut Vec<IndexedInterval>) {
        out.clear();
        let upper = self.intervals.partition_point(|iv| iv.start <= position);
        for idx in (0..upper).rev() {
            if self.max_end[idx] < position {
                break;
            }
            let iv = self.intervals[idx];
            if iv.end >= position {
                out.push(iv);
            }
        }
    }
}

/// The immutable gene interval reference with its lookup index.
#[derive(Clone, Debug)]
pub struct GeneIntervals {
    intervals: Vec<GeneInterval>,
    gene_names: Vec<String>,
    by_chromosome: AHashMap<String, ChromosomeIndex>,
}

impl GeneIntervals {
    pub fn new(intervals: Vec<GeneInterval>) -> Self {
        let mut gene_names: Vec<String> = Vec::new();
        let mut gene_lookup: AHashMap<String, usize> = AHashMap::new();
        let mut grouped: AHashMap<String, Vec<IndexedInterval>> = AHashMap::new();

        for (order, interval) in intervals.iter().enumerate() {
            let gene = *gene_lookup
                .entry(interval.gene.clone())
                .or_insert_with(|| {
                    gene_names.push(interval.gene.clone());
                    gene_names.len() - 1
                });
            grouped
                .entry(normalize_chromosome(&interval.chromosome))
                .or_default()
                .push(IndexedInterval {
                    start: interval.start,
                    end: interval.end,
                    order,
                    gene,
                });
        }

        let by_chromosome = grouped
            .into_iter()
            .map(|(chrom, ivs)| (chrom, ChromosomeIndex::build(ivs)))
            .collect();

        Self {
            intervals,
            gene_names,
            by_chromosome,
        }
    }

    /// Loads a tab-separated reference with a header row. Rows are either
    /// `chromosome start end gene_name` or `chrom:start-end gene_name`.
    pub fn from_path(path: &Path) -> Result<Self, IntervalError> {
        info!("Loading gene intervals from '{}'", path.display());
        let mut reader = open_text_source(path)?;
        let mut intervals = Vec::new();
        let mut header_seen = false;
        let mut line_number = 0usize;

        while let Some(raw_line) = reader.next_line()? {
            line_number += 1;
            let line = std::str::from_utf8(raw_line).map_err(|err| {
                IntervalError::MalformedReferenceInterval {
                    line: line_number,
                    message: format!("line is not valid UTF-8: {err}"),
                }
            })?;
            if line.trim().is_empty() || line.starts_with("##") {
                continue;
            }
            if !header_seen {
                header_seen = true;
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            intervals.push(parse_interval_row(line).map_err(|message| {
                IntervalError::MalformedReferenceInterval {
                    line: line_number,
                    message,
                }
            })?);
        }

        if intervals.is_empty() {
            return Err(IntervalError::MalformedReferenceInterval {
                line: line_number,
                message: "reference file did not contain any intervals".into(),
            });
        }

        let reference = Self::new(intervals);
        info!(
            "Loaded {} intervals for {} genes on {} chromosomes",
            reference.len(),
            reference.gene_names.len(),
            reference.by_chromosome.len()
        );
        Ok(reference)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[GeneInterval] {
        &self.intervals
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn gene_name(&self, gene: usize) -> &str {
        &self.gene_names[gene]
    }

    /// Every interval containing the position, in reference-file order.
    pub fn overlapping(&self, chromosome: &str, position: u64) -> Vec<&GeneInterval> {
        let mut hits = Vec::new();
        if let Some(index) = self.by_chromosome.get(&normalize_chromosome(chromosome)) {
            index.overlapping(position, &mut hits);
        }
        hits.sort_by_key(|iv| iv.order);
        hits.iter().map(|iv| &self.intervals[iv.order]).collect()
    }

    /// Resolves the gene for a normalized chromosome/position pair.
    /// Returns the gene index and the number of overlapping intervals.
    fn resolve(
        &self,
        chromosome: &str,
        position: u64,
        policy: OverlapPolicy,
        scratch: &mut Vec<IndexedInterval>,
    ) -> (Option<usize>, usize) {
        let Some(index) = self.by_chromosome.get(chromosome) else {
            return (None, 0);
        };
        index.overlapping(position, scratch);
        let chosen = match policy {
            OverlapPolicy::FirstInFile => scratch.iter().min_by_key(|iv| iv.order),
            OverlapPolicy::LeftmostStart => scratch.iter().min_by_key(|iv| (iv.start, iv.order)),
        };
        (chosen.map(|iv| iv.gene), scratch.len())
    }
}

fn parse_interval_row(line: &str) -> Result<GeneInterval, String> {
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let (chromosome, start_text, end_text, gene) = match fields.as_slice() {
        [chrom, start, end, gene, ..] => (*chrom, *start, *end, *gene),
        [locus, gene] => {
            let (chrom, range) = locus
                .rsplit_once(':')
                .ok_or_else(|| format!("interval '{locus}' is not of the form chrom:start-end"))?;
            let (start, end) = range
                .split_once('-')
                .ok_or_else(|| format!("interval '{locus}' is not of the form chrom:start-end"))?;
            (chrom, start, end, *gene)
        }
        _ => {
            return Err(format!(
                "expected 4 columns (chromosome, start, end, gene_name), found {}",
                fields.len()
            ));
        }
    };

    if chromosome.is_empty() {
        return Err("chromosome is empty".into());
    }
    if gene.is_empty() {
        return Err("gene name is empty".into());
    }
    let start: u64 = start_text
        .parse()
        .map_err(|_| format!("invalid start coordinate '{start_text}'"))?;
    let end: u64 = end_text
        .parse()
        .map_err(|_| format!("invalid end coordinate '{end_text}'"))?;
    if start == 0 {
        return Err("start must be at least 1 (coordinates are 1-based)".into());
    }
    if start > end {
        return Err(format!("start {start} is greater than end {end}"));
    }

    Ok(GeneInterval {
        chromosome: normalize_chromosome(chromosome),
        start,
        end,
        gene: gene.to_string(),
    })
}

/// Result of annotating a filtered variant set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Annotation {
    pub variants: Vec<AnnotatedVariant>,
    /// Variants with no overlapping interval (`UnmappedVariant`).
    pub unmapped: usize,
    /// Variants with more than one overlapping interval.
    pub ambiguous: usize,
}

impl Annotation {
    pub fn mapped(&self) -> impl Iterator<Item = &AnnotatedVariant> {
        self.variants.iter().filter(|v| v.gene.is_some())
    }
}

/// Assigns each filtered variant to at most one gene interval.
#[derive(Clone, Copy, Debug)]
pub struct IntervalAnnotator<'a> {
    reference: &'a GeneIntervals,
    policy: OverlapPolicy,
}

impl<'a> IntervalAnnotator<'a> {
    pub fn new(reference: &'a GeneIntervals, policy: OverlapPolicy) -> Self {
        Self { reference, policy }
    }

    pub fn annotate(&self, variants: &[Variant], filtered: &[FilteredVariant]) -> Annotation {
        let mut scratch = Vec::new();
        let mut annotation = Annotation {
            variants: Vec::with_capacity(filtered.len()),
            ..Annotation::default()
        };

        for fv in filtered {
            let key = &variants[fv.index].key;
            let (gene, hits) =
                self.reference
                    .resolve(&key.chromosome, key.position, self.policy, &mut scratch);
            if gene.is_none() {
                annotation.unmapped += 1;
            }
            if hits > 1 {
                annotation.ambiguous += 1;
            }
            annotation.variants.push(AnnotatedVariant {
                index: fv.index,
                allele_frequency: fv.allele_frequency,
                gene,
            });
        }

        if annotation.ambiguous > 0 {
            warn!(
                "{} variants overlap more than one gene interval; resolved with {:?}",
                annotation.ambiguous, self.policy
            );
        }
        info!(
            "Annotated {} variants: {} mapped, {} unmapped",
            filtered.len(),
            filtered.len() - annotation.unmapped,
            annotation.unmapped
        );
        annotation
    }
}

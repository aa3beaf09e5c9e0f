// ========================================================================================
//
//                               SHARED VALUE TYPES
//
// ========================================================================================
//
// Records that flow between pipeline stages. Every stage consumes these by
// reference and produces new values; nothing here is mutated after construction.

use serde::Serialize;
use std::fmt;

/// Identifies a site by normalized chromosome and 1-based position.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VariantKey {
    pub chromosome: String,
    pub position: u64,
}

impl VariantKey {
    pub fn new(chromosome: &str, position: u64) -> Self {
        Self {
            chromosome: normalize_chromosome(chromosome),
            position,
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chromosome, self.position)
    }
}

/// Strips a leading `chr` (any case) and upper-cases the remainder so that
/// `chr1`, `CHR1` and `1` all compare equal.
pub fn normalize_chromosome(chromosome: &str) -> String {
    let trimmed = chromosome.trim();
    let stripped = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") && trimmed.len() > 3 => &trimmed[3..],
        _ => trimmed,
    };
    stripped.to_ascii_uppercase()
}

/// A biallelic site and the alt-allele count of every sample at that site.
///
/// `calls[i]` is `None` for a missing call, otherwise 0, 1 or 2.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    pub key: VariantKey,
    pub reference: String,
    pub alternate: String,
    pub calls: Vec<Option<u8>>,
}

impl Variant {
    pub fn alt_allele_count(&self) -> u64 {
        self.calls.iter().flatten().map(|&c| u64::from(c)).sum()
    }

    pub fn observed_alleles(&self) -> u64 {
        2 * self.calls.iter().flatten().count() as u64
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.key, self.reference, self.alternate)
    }
}

/// A variant that survived frequency filtering, tagged with its allele
/// frequency and position in the source table.
#[derive(Clone, Debug, PartialEq)]
pub struct FilteredVariant {
    pub index: usize,
    pub allele_frequency: f64,
}

/// A filtered variant after interval annotation. `gene` indexes into the
/// reference's gene-name table; `None` means no interval overlapped.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotatedVariant {
    pub index: usize,
    pub allele_frequency: f64,
    pub gene: Option<usize>,
}

/// Per-gene association statistics for the burden term.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegressionResult {
    pub gene: String,
    /// Samples entering the regression.
    pub n: usize,
    /// Total burden across samples.
    pub sum_x: f64,
    pub beta: f64,
    pub standard_error: f64,
    pub t_stat: f64,
    pub p_value: f64,
}

/// Non-fatal issue categories surfaced in the run summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IssueKind {
    UnmappedVariant,
    DegenerateDesign,
}

impl IssueKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::UnmappedVariant => "UnmappedVariant",
            Self::DegenerateDesign => "DegenerateDesignError",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromosome_names_are_normalized() {
        assert_eq!(normalize_chromosome("chr1"), "1");
        assert_eq!(normalize_chromosome(" CHRx "), "X");
        assert_eq!(normalize_chromosome("22"), "22");
        assert_eq!(normalize_chromosome("chr"), "CHR");
        assert_eq!(VariantKey::new("chr7", 10), VariantKey::new("7", 10));
    }

    #[test]
    fn allele_counts_skip_missing_calls() {
        let variant = Variant {
            key: VariantKey::new("1", 100),
            reference: "A".into(),
            alternate: "G".into(),
            calls: vec![Some(0), Some(1), None, Some(2)],
        };
        assert_eq!(variant.alt_allele_count(), 3);
        assert_eq!(variant.observed_alleles(), 6);
        assert_eq!(variant.to_string(), "1:100:A:G");
    }
}

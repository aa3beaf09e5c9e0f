use crate::shared::files::open_text_source;
use crate::types::{FilteredVariant, Variant, VariantKey};
use log::info;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Computes the alternate allele frequency over all observed alleles.
///
/// A site with no called genotypes has no defined frequency; it is reported as
/// zero so that it is retained by the rare-variant filter.
pub fn allele_frequency(variant: &Variant) -> f64 {
    let observed = variant.observed_alleles();
    if observed == 0 {
        return 0.0;
    }
    variant.alt_allele_count() as f64 / observed as f64
}

/// Retains variants whose allele frequency is strictly below `threshold`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VariantFilter {
    threshold: f64,
}

/// Output of [`VariantFilter::apply`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterOutcome {
    pub retained: Vec<FilteredVariant>,
    /// Variants excluded because their frequency reached the threshold.
    pub above_threshold: usize,
    /// Variants excluded because they were absent from the keep-list.
    pub not_listed: usize,
}

impl VariantFilter {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn passes(&self, allele_frequency: f64) -> bool {
        allele_frequency < self.threshold
    }

    pub fn apply(&self, variants: &[Variant], keep: Option<&VariantList>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for (index, variant) in variants.iter().enumerate() {
            if let Some(list) = keep {
                if !list.contains(&variant.key) {
                    outcome.not_listed += 1;
                    continue;
                }
            }
            let allele_frequency = allele_frequency(variant);
            if self.passes(allele_frequency) {
                outcome.retained.push(FilteredVariant {
                    index,
                    allele_frequency,
                });
            } else {
                outcome.above_threshold += 1;
            }
        }

        info!(
            "Frequency filter (AF < {}): kept {} of {} variants",
            self.threshold,
            outcome.retained.len(),
            variants.len()
        );
        outcome
    }
}

#[derive(Error, Debug)]
pub enum VariantListError {
    #[error("IO error reading variant list: {0}")]
    Io(#[from] io::Error),
    #[error("Variant list line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// A set of sites restricting which variants are analysed.
#[derive(Clone, Debug)]
pub struct VariantList {
    unique: HashSet<VariantKey>,
}

impl VariantList {
    pub fn from_file(path: &Path) -> Result<Self, VariantListError> {
        let mut reader = open_text_source(path)?;
        let mut unique = HashSet::new();
        let mut header_skipped = false;

        let mut line_number = 0usize;
        while let Some(raw_line) = reader.next_line()? {
            line_number += 1;
            let line = std::str::from_utf8(raw_line).map_err(|err| VariantListError::Parse {
                line: line_number,
                message: format!("line is not valid UTF-8: {err}"),
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut fields = trimmed.split_whitespace();
            let chrom = match fields.next() {
                Some(value) => value,
                None => continue,
            };
            let pos_text = match fields.next() {
                Some(value) => value,
                None => {
                    return Err(VariantListError::Parse {
                        line: line_number,
                        message: "expected a position column".into(),
                    });
                }
            };

            if !header_skipped
                && (chrom.eq_ignore_ascii_case("chrom")
                    || chrom.eq_ignore_ascii_case("chr")
                    || pos_text.eq_ignore_ascii_case("pos"))
            {
                header_skipped = true;
                continue;
            }

            let position: u64 = match pos_text.parse() {
                Ok(value) if value > 0 => value,
                Ok(_) => {
                    return Err(VariantListError::Parse {
                        line: line_number,
                        message: "position must be positive".into(),
                    });
                }
                Err(_) if !header_skipped => {
                    header_skipped = true;
                    continue;
                }
                Err(_) => {
                    return Err(VariantListError::Parse {
                        line: line_number,
                        message: format!("invalid position value: {pos_text}"),
                    });
                }
            };

            unique.insert(VariantKey::new(chrom, position));
        }

        if unique.is_empty() {
            return Err(VariantListError::Parse {
                line: 0,
                message: "variant list did not contain any usable records".into(),
            });
        }

        Ok(Self { unique })
    }

    pub fn from_keys(keys: impl IntoIterator<Item = VariantKey>) -> Self {
        Self {
            unique: keys.into_iter().collect(),
        }
    }

    pub fn contains(&self, key: &VariantKey) -> bool {
        self.unique.contains(key)
    }

    pub fn len(&self) -> usize {
        self.unique.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unique.is_empty()
    }
}

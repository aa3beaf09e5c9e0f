//! # Genotype Table Loading
//!
//! Reads a variant-by-sample genotype table into memory. Two tab-separated
//! layouts are recognised from the header row:
//!
//! - a simple table, `CHROM POS REF ALT <sample>...`, whose cells are alt-allele
//!   dosages (`0`, `1`, `2`) or VCF-style genotypes (`0/1`, `1|1`);
//! - a VCF body, `#CHROM POS ID REF ALT QUAL FILTER INFO FORMAT <sample>...`,
//!   where the `GT` subfield of each sample column is used.
//!
//! Missing calls are `.`, `./.`, `.|.`, `NA` or an empty cell. Haploid GT calls
//! are stored as homozygous. Sites listing more than one ALT allele are skipped
//! and counted. The file may be gzip or BGZF compressed.

use crate::shared::files::open_text_source;
use crate::types::{Variant, VariantKey};
use log::{info, warn};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use thiserror::Error;

const SIMPLE_FIXED_COLUMNS: usize = 4;
const VCF_FIXED_COLUMNS: usize = 9;

#[derive(Error, Debug)]
pub enum GenotypeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Genotype table line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("Genotype table does not contain a header row")]
    MissingHeader,
    #[error("Genotype table header does not list any samples")]
    NoSamples,
    #[error("Sample '{0}' appears more than once in the genotype header")]
    DuplicateSample(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    Simple,
    Vcf,
}

impl Layout {
    fn fixed_columns(self) -> usize {
        match self {
            Self::Simple => SIMPLE_FIXED_COLUMNS,
            Self::Vcf => VCF_FIXED_COLUMNS,
        }
    }

    fn ref_column(self) -> usize {
        match self {
            Self::Simple => 2,
            Self::Vcf => 3,
        }
    }
}

/// An in-memory genotype table: one [`Variant`] per biallelic site, every
/// variant carrying one call per sample in header order.
#[derive(Clone, Debug)]
pub struct GenotypeTable {
    sample_ids: Vec<String>,
    variants: Vec<Variant>,
    multiallelic_skipped: usize,
}

impl GenotypeTable {
    pub fn new(sample_ids: Vec<String>, variants: Vec<Variant>) -> Result<Self, GenotypeError> {
        if sample_ids.is_empty() {
            return Err(GenotypeError::NoSamples);
        }
        check_unique_samples(&sample_ids)?;
        for (idx, variant) in variants.iter().enumerate() {
            if variant.calls.len() != sample_ids.len() {
                return Err(GenotypeError::Parse {
                    line: idx + 1,
                    message: format!(
                        "variant {} has {} calls but {} samples were declared",
                        variant,
                        variant.calls.len(),
                        sample_ids.len()
                    ),
                });
            }
        }
        Ok(Self {
            sample_ids,
            variants,
            multiallelic_skipped: 0,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, GenotypeError> {
        info!("Loading genotypes from '{}'", path.display());
        let mut reader = open_text_source(path)?;

        let mut line_number = 0usize;
        let mut header: Option<(Layout, usize, Vec<String>)> = None;
        let mut variants = Vec::new();
        let mut multiallelic_skipped = 0usize;

        while let Some(raw_line) = reader.next_line()? {
            line_number += 1;
            let line = std::str::from_utf8(raw_line).map_err(|err| GenotypeError::Parse {
                line: line_number,
                message: format!("line is not valid UTF-8: {err}"),
            })?;
            if line.trim().is_empty() || line.starts_with("##") {
                continue;
            }

            let Some((layout, width, _)) = header.as_ref() else {
                header = Some(parse_header(line, line_number)?);
                continue;
            };

            match parse_record(line, line_number, *layout, *width)? {
                Some(variant) => variants.push(variant),
                None => multiallelic_skipped += 1,
            }
        }

        let (_, _, sample_ids) = header.ok_or(GenotypeError::MissingHeader)?;
        if multiallelic_skipped > 0 {
            warn!("Skipped {multiallelic_skipped} multiallelic sites");
        }
        info!(
            "Loaded {} variants for {} samples",
            variants.len(),
            sample_ids.len()
        );

        Ok(Self {
            sample_ids,
            variants,
            multiallelic_skipped,
        })
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn multiallelic_skipped(&self) -> usize {
        self.multiallelic_skipped
    }
}

fn check_unique_samples(sample_ids: &[String]) -> Result<(), GenotypeError> {
    let mut seen = HashSet::with_capacity(sample_ids.len());
    for id in sample_ids {
        if !seen.insert(id.as_str()) {
            return Err(GenotypeError::DuplicateSample(id.clone()));
        }
    }
    Ok(())
}

fn parse_header(
    line: &str,
    line_number: usize,
) -> Result<(Layout, usize, Vec<String>), GenotypeError> {
    let fields: Vec<&str> = line.trim_start_matches('#').split('\t').collect();
    let is_vcf = fields.len() >= VCF_FIXED_COLUMNS
        && fields[2].eq_ignore_ascii_case("ID")
        && fields[8].eq_ignore_ascii_case("FORMAT");
    let layout = if is_vcf { Layout::Vcf } else { Layout::Simple };

    if fields.len() < layout.fixed_columns()
        || !fields[1].eq_ignore_ascii_case("POS")
        || !fields[layout.ref_column()].eq_ignore_ascii_case("REF")
    {
        return Err(GenotypeError::Parse {
            line: line_number,
            message: "expected a header beginning with CHROM, POS, REF, ALT or a VCF #CHROM line"
                .into(),
        });
    }

    let sample_ids: Vec<String> = fields[layout.fixed_columns()..]
        .iter()
        .map(|s| s.trim().to_string())
        .collect();
    if sample_ids.is_empty() {
        return Err(GenotypeError::NoSamples);
    }
    check_unique_samples(&sample_ids)?;

    Ok((layout, fields.len(), sample_ids))
}

fn parse_record(
    line: &str,
    line_number: usize,
    layout: Layout,
    width: usize,
) -> Result<Option<Variant>, GenotypeError> {
    let parse_err = |message: String| GenotypeError::Parse {
        line: line_number,
        message,
    };

    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != width {
        return Err(parse_err(format!(
            "expected {width} columns, found {}",
            fields.len()
        )));
    }

    let position: u64 = match fields[1].trim().parse() {
        Ok(value) if value > 0 => value,
        Ok(_) => return Err(parse_err("position must be positive".into())),
        Err(_) => return Err(parse_err(format!("invalid position value: {}", fields[1]))),
    };
    let ref_col = layout.ref_column();
    let reference = fields[ref_col].trim();
    let alternate = fields[ref_col + 1].trim();
    if alternate.contains(',') {
        return Ok(None);
    }

    let sample_fields = &fields[layout.fixed_columns()..];
    let calls = match layout {
        Layout::Simple => sample_fields
            .iter()
            .map(|cell| parse_cell(cell.trim()))
            .collect::<Result<Vec<_>, _>>(),
        Layout::Vcf => {
            let gt_index = fields[8]
                .split(':')
                .position(|key| key == "GT")
                .ok_or_else(|| parse_err("FORMAT column does not contain GT".into()))?;
            sample_fields
                .iter()
                .map(|cell| match cell.split(':').nth(gt_index) {
                    Some(gt) => parse_gt(gt.trim()),
                    None => Ok(None),
                })
                .collect::<Result<Vec<_>, _>>()
        }
    }
    .map_err(parse_err)?;

    Ok(Some(Variant {
        key: VariantKey::new(fields[0], position),
        reference: reference.to_string(),
        alternate: alternate.to_string(),
        calls,
    }))
}

fn is_missing_token(text: &str) -> bool {
    matches!(text, "" | "." | "NA" | "./." | ".|.")
}

/// Parses a simple-table cell: either an alt-allele dosage or a GT string.
fn parse_cell(text: &str) -> Result<Option<u8>, String> {
    if is_missing_token(text) {
        return Ok(None);
    }
    if text.contains(['/', '|']) {
        return parse_gt(text);
    }
    match text {
        "0" => Ok(Some(0)),
        "1" => Ok(Some(1)),
        "2" => Ok(Some(2)),
        other => Err(format!("invalid genotype call '{other}'")),
    }
}

/// Parses a biallelic GT string into an alt-allele count. A partially missing
/// call is treated as missing.
fn parse_gt(text: &str) -> Result<Option<u8>, String> {
    if is_missing_token(text) {
        return Ok(None);
    }
    let alleles: Vec<&str> = text.split(['/', '|']).collect();
    if alleles.len() > 2 {
        return Err(format!("genotype '{text}' is not haploid or diploid"));
    }

    let mut alt = 0u8;
    for allele in &alleles {
        match *allele {
            "." => return Ok(None),
            "0" => {}
            "1" => alt += 1,
            other => return Err(format!("invalid allele '{other}' in genotype '{text}'")),
        }
    }

    if alleles.len() == 1 {
        alt *= 2;
    }
    Ok(Some(alt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_table(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn simple_table_with_mixed_call_styles() {
        let file = write_table(
            "CHROM\tPOS\tREF\tALT\ts1\ts2\ts3\n\
             chr1\t100\tA\tG\t0\t1\t2\n\
             1\t200\tC\tT\t0/1\t1|1\t./.\n\
             2\t300\tG\tA\tNA\t.\t0\n",
        );
        let table = GenotypeTable::from_path(file.path()).unwrap();
        assert_eq!(table.sample_ids(), &["s1", "s2", "s3"]);
        assert_eq!(table.n_variants(), 3);
        assert_eq!(table.variants()[0].key, VariantKey::new("1", 100));
        assert_eq!(table.variants()[0].calls, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(table.variants()[1].calls, vec![Some(1), Some(2), None]);
        assert_eq!(table.variants()[2].calls, vec![None, None, Some(0)]);
    }

    #[test]
    fn vcf_body_uses_gt_subfield_and_skips_multiallelic() {
        let file = write_table(
            "##fileformat=VCFv4.2\n\
             #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tNA1\tNA2\n\
             1\t100\trs1\tA\tG\t.\tPASS\t.\tDP:GT\t10:0/1\t12:0/0\n\
             1\t150\trs2\tA\tG,T\t.\tPASS\t.\tGT\t0/1\t0/2\n\
             X\t200\trs3\tC\tT\t.\tPASS\t.\tGT\t1\t0\n",
        );
        let table = GenotypeTable::from_path(file.path()).unwrap();
        assert_eq!(table.sample_ids(), &["NA1", "NA2"]);
        assert_eq!(table.n_variants(), 2);
        assert_eq!(table.multiallelic_skipped(), 1);
        assert_eq!(table.variants()[0].calls, vec![Some(1), Some(0)]);
        assert_eq!(table.variants()[1].calls, vec![Some(2), Some(0)]);
        assert_eq!(table.variants()[1].key.chromosome, "X");
    }

    #[test]
    fn ragged_rows_report_their_line() {
        let file = write_table("CHROM\tPOS\tREF\tALT\ts1\ts2\n1\t100\tA\tG\t0\n");
        match GenotypeTable::from_path(file.path()) {
            Err(GenotypeError::Parse { line, message }) => {
                assert_eq!(line, 2);
                assert!(message.contains("expected 6 columns"));
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_calls_are_rejected() {
        let file = write_table("CHROM\tPOS\tREF\tALT\ts1\n1\t100\tA\tG\t3\n");
        assert!(matches!(
            GenotypeTable::from_path(file.path()),
            Err(GenotypeError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn duplicate_samples_are_rejected() {
        let file = write_table("CHROM\tPOS\tREF\tALT\ts1\ts1\n");
        assert!(matches!(
            GenotypeTable::from_path(file.path()),
            Err(GenotypeError::DuplicateSample(id)) if id == "s1"
        ));
    }

    #[test]
    fn gt_parsing_edge_cases() {
        assert_eq!(parse_gt("0/0"), Ok(Some(0)));
        assert_eq!(parse_gt("1/0"), Ok(Some(1)));
        assert_eq!(parse_gt("./1"), Ok(None));
        assert_eq!(parse_gt("0"), Ok(Some(0)));
        assert_eq!(parse_gt("1"), Ok(Some(2)));
        assert!(parse_gt("0/1/1").is_err());
        assert!(parse_gt("0/2").is_err());
    }
}

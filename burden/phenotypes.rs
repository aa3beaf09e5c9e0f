//! # Sample Table Loading and Cohort Resolution
//!
//! Reads the per-sample phenotype/covariate table and aligns it with the
//! genotype table's sample order.
//!
//! - Named columns: the sample-id, phenotype and covariate column names come
//!   from [`BurdenConfig`]; every one of them must be present.
//! - Missing values: `NA` and empty cells are nulls. A sample with a null
//!   phenotype or covariate is dropped from the cohort rather than failing the run.
//! - Types: numeric and boolean columns are accepted; booleans become 0/1.

use crate::config::BurdenConfig;
use log::{info, warn};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the sample table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the sample id column '{0}'.")]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. Use NA for missing values."
    )]
    NonFiniteValuesFound(String),
    #[error("Sample '{0}' appears more than once in the sample table.")]
    DuplicateSample(String),
}

/// The phenotype and covariates of every sample in the table, nulls preserved.
#[derive(Debug, Clone)]
pub struct SampleTable {
    pub sample_ids: Vec<String>,
    pub phenotype_name: String,
    pub phenotype: Vec<Option<f64>>,
    pub covariate_names: Vec<String>,
    /// One vector per covariate, aligned with `sample_ids`.
    pub covariates: Vec<Vec<Option<f64>>>,
}

/// Samples present in both the genotype and sample tables with complete
/// phenotype and covariate values, in genotype column order.
#[derive(Debug, Clone)]
pub struct Cohort {
    /// Genotype-table column of each cohort member.
    pub genotype_columns: Vec<usize>,
    pub sample_ids: Vec<String>,
    pub phenotype: Array1<f64>,
    /// Shape: [n_samples, n_covariates].
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
    /// Genotyped samples absent from the sample table.
    pub not_in_sample_table: usize,
    /// Genotyped samples dropped for a missing phenotype or covariate.
    pub dropped_missing: usize,
}

impl Cohort {
    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }
}

impl SampleTable {
    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    /// Aligns the table with `genotype_ids`, keeping genotype order.
    pub fn resolve_cohort(&self, genotype_ids: &[String]) -> Cohort {
        let rows: HashMap<&str, usize> = self
            .sample_ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.as_str(), row))
            .collect();

        let mut genotype_columns = Vec::new();
        let mut selected_rows = Vec::new();
        let mut not_in_sample_table = 0usize;
        let mut dropped_missing = 0usize;

        for (column, id) in genotype_ids.iter().enumerate() {
            let Some(&row) = rows.get(id.as_str()) else {
                not_in_sample_table += 1;
                continue;
            };
            let complete = self.phenotype[row].is_some()
                && self.covariates.iter().all(|values| values[row].is_some());
            if !complete {
                dropped_missing += 1;
                continue;
            }
            genotype_columns.push(column);
            selected_rows.push(row);
        }

        let phenotype = selected_rows
            .iter()
            .map(|&row| self.phenotype[row].unwrap_or(f64::NAN))
            .collect::<Array1<f64>>();
        let covariates = Array2::from_shape_fn(
            (selected_rows.len(), self.covariates.len()),
            |(i, j)| self.covariates[j][selected_rows[i]].unwrap_or(f64::NAN),
        );

        if not_in_sample_table > 0 {
            warn!("{not_in_sample_table} genotyped samples are absent from the sample table");
        }
        if dropped_missing > 0 {
            warn!(
                "{dropped_missing} samples dropped for missing '{}' or covariate values",
                self.phenotype_name
            );
        }
        info!("Cohort contains {} samples", selected_rows.len());

        Cohort {
            genotype_columns,
            sample_ids: selected_rows
                .iter()
                .map(|&row| self.sample_ids[row].clone())
                .collect(),
            phenotype,
            covariates,
            covariate_names: self.covariate_names.clone(),
            not_in_sample_table,
            dropped_missing,
        }
    }
}

/// Loads the tab-separated sample table named by `path`.
pub fn load_sample_table(path: &Path, config: &BurdenConfig) -> Result<SampleTable, DataError> {
    info!("Loading sample table from '{}'", path.display());

    let mut id_schema = Schema::with_capacity(1);
    id_schema.with_column(config.sample_id_column.as_str().into(), DataType::String);

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None)
                .with_schema_overwrite(Some(Arc::new(id_schema)))
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(b'\t')
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let required = std::iter::once(&config.sample_id_column)
        .chain(std::iter::once(&config.phenotype))
        .chain(config.covariates.iter());
    for name in required {
        if !columns_set.contains(name) {
            return Err(DataError::ColumnNotFound(name.clone()));
        }
    }

    let sample_ids = extract_sample_ids(&df, &config.sample_id_column)?;
    let phenotype = extract_optional_numeric(&df, &config.phenotype)?;
    let covariates = config
        .covariates
        .iter()
        .map(|name| extract_optional_numeric(&df, name))
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        "Sample table: {} samples, phenotype '{}', covariates {:?}",
        sample_ids.len(),
        config.phenotype,
        config.covariates
    );

    Ok(SampleTable {
        sample_ids,
        phenotype_name: config.phenotype.clone(),
        phenotype,
        covariate_names: config.covariates.clone(),
        covariates,
    })
}

fn extract_sample_ids(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let column = df.column(column_name)?.cast(&DataType::String)?;
    let mut seen = HashSet::with_capacity(df.height());
    let mut ids = Vec::with_capacity(df.height());
    for value in column.as_materialized_series().str()?.into_iter() {
        let id = match value {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => return Err(DataError::MissingValuesFound(column_name.to_string())),
        };
        if !seen.insert(id.clone()) {
            return Err(DataError::DuplicateSample(id));
        }
        ids.push(id);
    }
    Ok(ids)
}

fn extract_optional_numeric(
    df: &DataFrame,
    column_name: &str,
) -> Result<Vec<Option<f64>>, DataError> {
    let column = df.column(column_name)?;
    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric or boolean)",
        found_type: format!("{:?}", column.dtype()),
    };

    if matches!(column.dtype(), DataType::String) {
        return Err(wrong_type());
    }
    let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > column.null_count() {
        return Err(wrong_type());
    }

    let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
    if values.iter().flatten().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn config(covariates: &[&str]) -> BurdenConfig {
        BurdenConfig {
            covariates: covariates.iter().map(|s| s.to_string()).collect(),
            ..BurdenConfig::default()
        }
    }

    #[test]
    fn loads_numeric_and_boolean_columns_with_nulls() {
        let file = create_test_tsv(
            "sample_id\tphenotype\tis_female\tage\textra\n\
             007\t1.5\ttrue\t40\tx\n\
             S2\tNA\tfalse\t51\ty\n\
             S3\t-0.5\tfalse\t\tz",
        )
        .unwrap();
        let table = load_sample_table(file.path(), &config(&["is_female", "age"])).unwrap();

        assert_eq!(table.sample_ids, vec!["007", "S2", "S3"]);
        assert_eq!(table.phenotype, vec![Some(1.5), None, Some(-0.5)]);
        assert_eq!(table.covariates[0], vec![Some(1.0), Some(0.0), Some(0.0)]);
        assert_eq!(table.covariates[1], vec![Some(40.0), Some(51.0), None]);
    }

    #[test]
    fn missing_column_is_reported_by_name() {
        let file = create_test_tsv("sample_id\tphenotype\nS1\t1.0").unwrap();
        match load_sample_table(file.path(), &config(&["sex"])) {
            Err(DataError::ColumnNotFound(col)) => assert_eq!(col, "sex"),
            other => panic!("Expected ColumnNotFound(sex), got {:?}", other),
        }
    }

    #[test]
    fn text_covariate_is_rejected() {
        let file =
            create_test_tsv("sample_id\tphenotype\tsex\nS1\t1.0\tmale\nS2\t2.0\tfemale").unwrap();
        match load_sample_table(file.path(), &config(&["sex"])) {
            Err(DataError::ColumnWrongType { column_name, .. }) => assert_eq!(column_name, "sex"),
            other => panic!("Expected ColumnWrongType(sex), got {:?}", other),
        }
    }

    #[test]
    fn duplicate_sample_ids_are_rejected() {
        let file = create_test_tsv("sample_id\tphenotype\nS1\t1.0\nS1\t2.0").unwrap();
        assert!(matches!(
            load_sample_table(file.path(), &config(&[])),
            Err(DataError::DuplicateSample(id)) if id == "S1"
        ));
    }

    #[test]
    fn cohort_follows_genotype_order_and_drops_incomplete_samples() {
        let table = SampleTable {
            sample_ids: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            phenotype_name: "phenotype".into(),
            phenotype: vec![Some(1.0), Some(2.0), None, Some(4.0)],
            covariate_names: vec!["sex".into()],
            covariates: vec![vec![Some(0.0), None, Some(1.0), Some(1.0)]],
        };
        let genotype_ids: Vec<String> = ["d", "x", "c", "b", "a"].iter().map(|s| s.to_string()).collect();
        let cohort = table.resolve_cohort(&genotype_ids);

        assert_eq!(cohort.sample_ids, vec!["d", "a"]);
        assert_eq!(cohort.genotype_columns, vec![0, 4]);
        assert_eq!(cohort.not_in_sample_table, 1);
        assert_eq!(cohort.dropped_missing, 2);
        assert_abs_diff_eq!(cohort.phenotype[0], 4.0);
        assert_abs_diff_eq!(cohort.phenotype[1], 1.0);
        assert_eq!(cohort.covariates.shape(), &[2, 1]);
        assert_abs_diff_eq!(cohort.covariates[[0, 0]], 1.0);
        assert_abs_diff_eq!(cohort.covariates[[1, 0]], 0.0);
    }
}

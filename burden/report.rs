use crate::types::RegressionResult;
use ndarray::ArrayView2;
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error writing report: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error writing report: {0}")]
    Csv(#[from] csv::Error),
    #[error("{ids} sample ids for a score matrix with {rows} rows")]
    ScoreShape { ids: usize, rows: usize },
}

/// Writes ranked results as a tab-separated table with a header row.
pub fn write_results<W: io::Write>(
    writer: W,
    results: &[RegressionResult],
) -> Result<(), ReportError> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(writer);
    wtr.write_record([
        "gene",
        "n",
        "sum_x",
        "beta",
        "standard_error",
        "t_stat",
        "p_value",
    ])?;
    for r in results {
        wtr.serialize(r)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_results_tsv(path: &Path, results: &[RegressionResult]) -> Result<(), ReportError> {
    let file = std::fs::File::create(path)?;
    write_results(io::BufWriter::new(file), results)
}

/// Writes PCA scores as `sample_id PC1 .. PCk`.
pub fn write_scores_tsv(
    path: &Path,
    sample_ids: &[String],
    scores: ArrayView2<'_, f64>,
) -> Result<(), ReportError> {
    if sample_ids.len() != scores.nrows() {
        return Err(ReportError::ScoreShape {
            ids: sample_ids.len(),
            rows: scores.nrows(),
        });
    }
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;

    let mut header = vec!["sample_id".to_string()];
    header.extend((1..=scores.ncols()).map(|k| format!("PC{k}")));
    wtr.write_record(&header)?;

    for (id, row) in sample_ids.iter().zip(scores.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(id.clone());
        record.extend(row.iter().map(|v| v.to_string()));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Renders the first `limit` results as an aligned text table.
pub fn format_results_table(results: &[RegressionResult], limit: usize) -> String {
    let shown = &results[..results.len().min(limit)];
    let gene_width = shown
        .iter()
        .map(|r| r.gene.len())
        .chain(std::iter::once("gene".len()))
        .max()
        .unwrap_or(4);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<gene_width$}  {:>6}  {:>8}  {:>10}  {:>10}  {:>8}  {:>10}",
        "gene", "n", "sum_x", "beta", "se", "t", "p_value"
    );
    for r in shown {
        let _ = writeln!(
            out,
            "{:<gene_width$}  {:>6}  {:>8.0}  {:>10.4}  {:>10.4}  {:>8.3}  {:>10.3e}",
            r.gene, r.n, r.sum_x, r.beta, r.standard_error, r.t_stat, r.p_value
        );
    }
    if results.len() > shown.len() {
        let _ = writeln!(out, "... {} more", results.len() - shown.len());
    }
    out
}

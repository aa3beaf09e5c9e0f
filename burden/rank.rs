use crate::types::RegressionResult;
use std::cmp::Ordering;

/// Orders regression results from most to least significant.
///
/// Ties on p-value are broken by gene name so the output does not depend on
/// the order in which genes were fitted.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResultRanker;

impl ResultRanker {
    pub fn rank(&self, mut results: Vec<RegressionResult>) -> Vec<RegressionResult> {
        results.sort_by(compare_results);
        results
    }
}

pub fn compare_results(a: &RegressionResult, b: &RegressionResult) -> Ordering {
    a.p_value
        .total_cmp(&b.p_value)
        .then_with(|| a.gene.cmp(&b.gene))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(gene: &str, p_value: f64) -> RegressionResult {
        RegressionResult {
            gene: gene.into(),
            n: 10,
            sum_x: 1.0,
            beta: 0.0,
            standard_error: 1.0,
            t_stat: 0.0,
            p_value,
        }
    }

    #[test]
    fn smaller_p_value_ranks_first() {
        let ranked = ResultRanker.rank(vec![result("A", 0.03), result("B", 0.001)]);
        assert_eq!(ranked[0].gene, "B");
        assert_eq!(ranked[1].gene, "A");
    }

    #[test]
    fn adjacent_results_are_non_decreasing() {
        let ps = [0.5, 1e-8, 0.02, 0.02, 1.0, 0.0, 3e-4];
        let results = ps
            .iter()
            .enumerate()
            .map(|(i, &p)| result(&format!("G{i}"), p))
            .collect();
        let ranked = ResultRanker.rank(results);
        for pair in ranked.windows(2) {
            assert!(pair[0].p_value <= pair[1].p_value);
        }
    }

    #[test]
    fn ties_break_on_gene_name() {
        let ranked = ResultRanker.rank(vec![result("ZZ", 0.1), result("AA", 0.1)]);
        assert_eq!(ranked[0].gene, "AA");
        assert_eq!(ranked[1].gene, "ZZ");
    }
}

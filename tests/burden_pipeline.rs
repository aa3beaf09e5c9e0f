use burden::config::BurdenConfig;
use burden::map::HwePcaError;
use burden::pipeline::{self, PipelineError, PipelineInputs};
use burden::progress::NoopProgress;
use burden::report::write_results_tsv;
use burden::types::IssueKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const N_SAMPLES: usize = 200;
const CARRIERS_PER_RARE_VARIANT: usize = 3;

struct Fixture {
    _dir: TempDir,
    inputs: PipelineInputs,
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn rare_calls(rng: &mut StdRng) -> Vec<u8> {
    let mut calls = vec![0u8; N_SAMPLES];
    for idx in rand::seq::index::sample(rng, N_SAMPLES, CARRIERS_PER_RARE_VARIANT).iter() {
        calls[idx] = 1;
    }
    calls
}

/// 200 samples; gene CAUSAL carries a planted burden effect, NULL has
/// carriers but no effect, EMPTY has only a variant without carriers.
fn cohort_fixture(gene_rows: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(2024);

    // (chrom, pos, calls)
    let mut sites: Vec<(&str, u64, Vec<u8>)> = Vec::new();
    for k in 0..5 {
        sites.push(("1", 1_000 + 10 * k, rare_calls(&mut rng)));
    }
    // Common site inside CAUSAL, removed by the frequency filter.
    sites.push(("1", 1_100, (0..N_SAMPLES).map(|_| rng.gen_range(0..3)).collect()));
    for k in 0..5 {
        sites.push(("2", 5_000 + 10 * k, rare_calls(&mut rng)));
    }
    sites.push(("3", 700, vec![0u8; N_SAMPLES]));
    // Rare but outside every gene.
    sites.push(("5", 42, rare_calls(&mut rng)));
    sites.push(("5", 43, rare_calls(&mut rng)));
    // Common background sites for the principal components.
    for k in 0..40 {
        let p: f64 = rng.gen_range(0.2..0.5);
        let calls = (0..N_SAMPLES)
            .map(|_| u8::from(rng.gen_bool(p)) + u8::from(rng.gen_bool(p)))
            .collect();
        sites.push(("9", 10_000 + 100 * k, calls));
    }

    let mut genotypes = String::from("#CHROM\tPOS\tREF\tALT");
    for i in 0..N_SAMPLES {
        write!(genotypes, "\ts{i}").unwrap();
    }
    genotypes.push('\n');
    for (chrom, pos, calls) in &sites {
        write!(genotypes, "chr{chrom}\t{pos}\tA\tG").unwrap();
        for call in calls {
            write!(genotypes, "\t{call}").unwrap();
        }
        genotypes.push('\n');
    }

    let causal_burden: Vec<f64> = (0..N_SAMPLES)
        .map(|i| sites[..5].iter().filter(|(_, _, calls)| calls[i] > 0).count() as f64)
        .collect();
    let noise = Normal::new(0.0, 1.0).unwrap();
    let mut samples = String::from("sample_id\tphenotype\tsex\n");
    for i in (0..N_SAMPLES).rev() {
        let sex = (i % 2) as f64;
        let phenotype = 2.0 * causal_burden[i] + 0.5 * sex + noise.sample(&mut rng);
        if i == 7 || i == 8 {
            writeln!(samples, "s{i}\tNA\t{sex}").unwrap();
        } else {
            writeln!(samples, "s{i}\t{phenotype}\t{sex}").unwrap();
        }
    }
    samples.push_str("not_genotyped\t1.0\t0\n");

    let inputs = PipelineInputs {
        genotypes: write(dir.path(), "genotypes.tsv", &genotypes),
        genes: write(dir.path(), "genes.tsv", gene_rows),
        samples: write(dir.path(), "samples.tsv", &samples),
        keep: None,
    };
    Fixture { _dir: dir, inputs }
}

const GENES: &str = "chromosome\tstart\tend\tgene\n\
                     1\t900\t1200\tCAUSAL\n\
                     chr2\t4900\t5100\tNULL\n\
                     3\t600\t800\tEMPTY\n";

fn config(num_pcs: usize) -> BurdenConfig {
    BurdenConfig {
        num_pcs,
        pca_min_maf: 0.05,
        ..BurdenConfig::default()
    }
}

#[test]
fn planted_gene_ranks_first_and_issues_are_counted() {
    let fixture = cohort_fixture(GENES);
    let output = pipeline::run(&config(2), &fixture.inputs, &NoopProgress).unwrap();
    let summary = &output.summary;

    assert_eq!(summary.cohort_size, N_SAMPLES - 2);
    assert_eq!(summary.samples_missing_values, 2);
    assert_eq!(summary.samples_not_in_table, 0);
    assert_eq!(summary.above_threshold, 41);
    assert_eq!(summary.rare_variants, 13);
    assert_eq!(summary.unmapped_variants, 2);
    assert_eq!(summary.issue_counts()[&IssueKind::UnmappedVariant], 2);
    assert_eq!(summary.genes_without_carriers, 1);
    assert_eq!(summary.principal_components, 2);

    let genes: Vec<&str> = output.results.iter().map(|r| r.gene.as_str()).collect();
    assert_eq!(genes, vec!["CAUSAL", "NULL"]);
    let causal = &output.results[0];
    assert!(causal.p_value < 1e-6, "p = {}", causal.p_value);
    assert!((causal.beta - 2.0).abs() < 0.8, "beta = {}", causal.beta);
    assert_eq!(causal.n, N_SAMPLES - 2);
    for pair in output.results.windows(2) {
        assert!(pair[0].p_value <= pair[1].p_value);
    }

    let pca = output.pca.as_ref().unwrap();
    assert_eq!(pca.sample_scores().nrows(), N_SAMPLES - 2);
    assert_eq!(output.cohort_sample_ids.len(), N_SAMPLES - 2);
    assert_eq!(output.cohort_sample_ids[0], "s0");
}

#[test]
fn thread_pool_size_does_not_change_results() {
    let fixture = cohort_fixture(GENES);
    let default = pipeline::run(&config(2), &fixture.inputs, &NoopProgress).unwrap();
    let two_threads = BurdenConfig {
        threads: Some(2),
        ..config(2)
    };
    let pinned = pipeline::run(&two_threads, &fixture.inputs, &NoopProgress).unwrap();

    assert_eq!(default.results.len(), pinned.results.len());
    for (a, b) in default.results.iter().zip(&pinned.results) {
        assert_eq!(a.gene, b.gene);
        assert!((a.beta - b.beta).abs() < 1e-9);
        assert!((a.p_value - b.p_value).abs() < 1e-9);
    }
}

#[test]
fn results_table_is_written_in_rank_order() {
    let fixture = cohort_fixture(GENES);
    let output = pipeline::run(&config(0), &fixture.inputs, &NoopProgress).unwrap();
    assert!(output.pca.is_none());

    let out = fixture.inputs.genotypes.with_extension("burden.tsv");
    write_results_tsv(&out, &output.results).unwrap();
    let text = fs::read_to_string(&out).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "gene\tn\tsum_x\tbeta\tstandard_error\tt_stat\tp_value"
    );
    assert!(lines.next().unwrap().starts_with("CAUSAL\t198\t"));
}

#[test]
fn no_overlapping_genes_is_an_empty_burden_matrix() {
    let fixture = cohort_fixture("chromosome\tstart\tend\tgene\n22\t1\t100\tFAR\n");
    match pipeline::run(&config(2), &fixture.inputs, &NoopProgress) {
        Err(PipelineError::EmptyBurdenMatrix {
            rare_variants,
            mapped_variants,
        }) => {
            assert_eq!(rare_variants, 13);
            assert_eq!(mapped_variants, 0);
        }
        other => panic!("Expected EmptyBurdenMatrix, got {:?}", other.map(|o| o.results)),
    }
}

#[test]
fn malformed_reference_aborts_the_run() {
    let fixture = cohort_fixture("chromosome\tstart\tend\tgene\n1\tten\t100\tBAD\n");
    let err = pipeline::run(&config(2), &fixture.inputs, &NoopProgress).unwrap_err();
    assert!(matches!(err, PipelineError::Intervals(_)));
    assert!(err.to_string().contains("line 2"), "{err}");
}

#[test]
fn missing_covariate_column_is_reported() {
    let fixture = cohort_fixture(GENES);
    let cfg = BurdenConfig {
        covariates: vec!["age".into()],
        ..config(2)
    };
    let err = pipeline::run(&cfg, &fixture.inputs, &NoopProgress).unwrap_err();
    assert!(matches!(err, PipelineError::Data(_)));
    assert!(err.to_string().contains("age"));
}

#[test]
fn too_few_samples_for_the_design_is_fatal() {
    let fixture = cohort_fixture(GENES);
    let cfg = BurdenConfig {
        num_pcs: 300,
        ..BurdenConfig::default()
    };
    assert!(matches!(
        pipeline::run(&cfg, &fixture.inputs, &NoopProgress),
        Err(PipelineError::InsufficientSamples {
            found: 198,
            required: 304
        })
    ));
}

#[test]
fn invalid_threshold_is_rejected_before_loading() {
    let fixture = cohort_fixture(GENES);
    let cfg = BurdenConfig {
        af_threshold: 0.0,
        ..BurdenConfig::default()
    };
    assert!(matches!(
        pipeline::run(&cfg, &fixture.inputs, &NoopProgress),
        Err(PipelineError::Config(_))
    ));
}

#[test]
fn pca_memory_budget_comes_from_the_config() {
    let fixture = cohort_fixture(GENES);
    let cfg = BurdenConfig {
        pca_gram_budget_bytes: 1024,
        ..config(2)
    };
    match pipeline::run(&cfg, &fixture.inputs, &NoopProgress) {
        Err(PipelineError::Pca(HwePcaError::GramBudgetExceeded {
            n_samples,
            budget_bytes,
        })) => {
            assert_eq!(n_samples, N_SAMPLES - 2);
            assert_eq!(budget_bytes, 1024);
        }
        other => panic!("Expected GramBudgetExceeded, got {:?}", other.map(|o| o.results)),
    }
}

#[test]
fn every_gene_degenerate_is_not_an_empty_success() {
    let dir = tempfile::tempdir().unwrap();
    let n = 20;
    // Carriers are exactly the samples with sex = 1, so the burden column
    // duplicates the covariate.
    let mut genotypes = String::from("#CHROM\tPOS\tREF\tALT");
    let mut samples = String::from("sample_id\tphenotype\tsex\n");
    for i in 0..n {
        write!(genotypes, "\ts{i}").unwrap();
        writeln!(samples, "s{i}\t{}\t{}", (i * 7 % 5) as f64, i % 2).unwrap();
    }
    genotypes.push_str("\n1\t150\tA\tG");
    for i in 0..n {
        write!(genotypes, "\t{}", i % 2).unwrap();
    }
    genotypes.push('\n');

    let inputs = PipelineInputs {
        genotypes: write(dir.path(), "genotypes.tsv", &genotypes),
        genes: write(
            dir.path(),
            "genes.tsv",
            "chromosome\tstart\tend\tgene\n1\t100\t200\tSEX_LINKED\n",
        ),
        samples: write(dir.path(), "samples.tsv", &samples),
        keep: None,
    };
    let cfg = BurdenConfig {
        af_threshold: 0.5,
        num_pcs: 0,
        ..BurdenConfig::default()
    };
    let err = pipeline::run(&cfg, &inputs, &NoopProgress).unwrap_err();
    assert!(err.to_string().contains("SEX_LINKED"), "{err}");
    match err {
        PipelineError::AllGenesDegenerate { degenerate } => {
            assert_eq!(degenerate.len(), 1);
            assert_eq!(degenerate[0].gene, "SEX_LINKED");
        }
        other => panic!("Expected AllGenesDegenerate, got {other}"),
    }
}

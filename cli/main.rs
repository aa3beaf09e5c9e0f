#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::error::Error;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use burden::config::{BurdenConfig, DEFAULT_NUM_PCS, OverlapPolicy};
use burden::genotypes::GenotypeTable;
use burden::map::{DEFAULT_GRAM_BUDGET_BYTES, FitOptions};
use burden::pipeline::{self, PipelineInputs};
use burden::progress::{PipelineStage, ProgressObserver};
use burden::report::{format_results_table, write_results_tsv, write_scores_tsv};

#[derive(Parser)]
#[command(
    name = "burden",
    about = "Gene-level rare-variant burden testing",
    long_about = "Filters rare variants, assigns them to genes, aggregates per-gene carrier \
                 counts and regresses a phenotype on each gene's burden, adjusting for \
                 covariates and genotype principal components."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct RunArgs {
    /// Genotype table (tab-separated simple table or VCF body, optionally gzipped)
    #[arg(value_name = "GENOTYPES")]
    genotypes: PathBuf,

    /// Gene interval reference (chromosome, start, end, gene; 1-based closed)
    #[arg(long, value_name = "TSV")]
    genes: PathBuf,

    /// Sample table with sample id, phenotype and covariate columns
    #[arg(long, value_name = "TSV")]
    samples: PathBuf,

    /// TOML configuration file; flags below override its values
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Keep variants with allele frequency strictly below this value
    #[arg(long, value_name = "F")]
    af_threshold: Option<f64>,

    /// Number of genotype principal components to adjust for (0 disables PCA)
    #[arg(long, value_name = "K")]
    num_pcs: Option<usize>,

    /// Phenotype column in the sample table
    #[arg(long, value_name = "NAME")]
    phenotype: Option<String>,

    /// Covariate column in the sample table (repeatable; replaces the configured list)
    #[arg(long = "covariate", value_name = "NAME")]
    covariates: Vec<String>,

    /// Gene chosen when a variant overlaps several intervals
    #[arg(long, value_enum)]
    overlap_policy: Option<OverlapPolicy>,

    /// Restrict the analysis to the sites listed in this file (chrom pos)
    #[arg(long, value_name = "PATH")]
    keep: Option<PathBuf>,

    /// Output table (default: <GENOTYPES>.burden.tsv)
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Number of top genes printed to the terminal
    #[arg(long, value_name = "N", default_value = "10")]
    top: usize,

    /// Worker threads (default: all cores)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Memory limit for the PCA sample covariance matrix in bytes (0 lifts it)
    #[arg(long, value_name = "BYTES")]
    gram_budget_bytes: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full burden test
    #[command(about = "Run the burden test (outputs: <GENOTYPES>.burden.tsv)")]
    Run(RunArgs),

    /// Compute genotype principal components only
    #[command(about = "Compute HWE-normalized principal components (outputs: <GENOTYPES>.pcs.tsv)")]
    Pcs {
        #[arg(value_name = "GENOTYPES")]
        genotypes: PathBuf,

        /// Number of principal components to compute
        #[arg(long, value_name = "K", default_value_t = DEFAULT_NUM_PCS)]
        num_pcs: usize,

        /// Output table (default: <GENOTYPES>.pcs.tsv)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,

        /// Memory limit for the sample covariance matrix in bytes (0 lifts it)
        #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_GRAM_BUDGET_BYTES)]
        gram_budget_bytes: u64,
    },

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run_burden(args),
        Some(Commands::Pcs {
            genotypes,
            num_pcs,
            out,
            gram_budget_bytes,
        }) => run_pcs(genotypes, num_pcs, out, gram_budget_bytes),
        Some(Commands::Version) => {
            println!("burden {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_burden(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => BurdenConfig::from_file(path)?,
        None => BurdenConfig::default(),
    };
    if let Some(threshold) = args.af_threshold {
        config.af_threshold = threshold;
    }
    if let Some(num_pcs) = args.num_pcs {
        config.num_pcs = num_pcs;
    }
    if let Some(phenotype) = args.phenotype {
        config.phenotype = phenotype;
    }
    if !args.covariates.is_empty() {
        config.covariates = args.covariates;
    }
    if let Some(policy) = args.overlap_policy {
        config.overlap_policy = policy;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if let Some(budget) = args.gram_budget_bytes {
        config.pca_gram_budget_bytes = budget;
    }

    let out = args
        .out
        .unwrap_or_else(|| with_suffix(&args.genotypes, ".burden.tsv"));
    let inputs = PipelineInputs {
        genotypes: args.genotypes,
        genes: args.genes,
        samples: args.samples,
        keep: args.keep,
    };

    let progress = TerminalProgress::new();
    let output = pipeline::run(&config, &inputs, &progress)?;
    write_results_tsv(&out, &output.results)?;

    println!("{}", output.summary);
    println!();
    print!("{}", format_results_table(&output.results, args.top));
    println!("Results written to {}", out.display());
    Ok(())
}

fn run_pcs(
    genotypes: PathBuf,
    num_pcs: usize,
    out: Option<PathBuf>,
    gram_budget_bytes: u64,
) -> Result<(), Box<dyn Error>> {
    let out = out.unwrap_or_else(|| with_suffix(&genotypes, ".pcs.tsv"));
    let table = GenotypeTable::from_path(&genotypes)?;
    let options = FitOptions {
        components: num_pcs,
        gram_budget_bytes,
        ..FitOptions::default()
    };
    let progress = TerminalProgress::new();
    let model = pipeline::principal_components(&table, &options, &progress)?;
    write_scores_tsv(&out, table.sample_ids(), model.sample_scores())?;

    for (k, (variance, ratio)) in model
        .explained_variance()
        .iter()
        .zip(model.explained_variance_ratio())
        .enumerate()
    {
        println!("PC{}: variance {:.4} ({:.2}%)", k + 1, variance, 100.0 * ratio);
    }
    println!("Scores written to {}", out.display());
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// One progress bar per running stage; stages may overlap.
struct TerminalProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<PipelineStage, ProgressBar>>,
}

impl TerminalProgress {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(draw_target),
            bars: Mutex::new(HashMap::new()),
        }
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_stage_start(&self, stage: PipelineStage, total_items: usize) {
        let pb = self.multi.add(ProgressBar::new(total_items as u64));
        pb.set_style(
            ProgressStyle::with_template(
                "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        pb.set_message(stage.describe());
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(stage, pb);
        }
    }

    fn on_stage_advance(&self, stage: PipelineStage, delta: usize) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(pb) = bars.get(&stage) {
                pb.inc(delta as u64);
            }
        }
    }

    fn on_stage_finish(&self, stage: PipelineStage) {
        let finished = self.bars.lock().ok().and_then(|mut bars| bars.remove(&stage));
        if let Some(pb) = finished {
            pb.finish_and_clear();
        }
    }
}

use crate::common::*;
use crate::dataset::{Formula, RawDataset};
use crate::pipeline::*;
use crate::sim_input::*;

use count_param::families::CountFamily;

use crate::copula::DependencyChoice;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// counts TSV (cells x genes, header = gene names; .gz supported)
    #[arg(long, short = 'c', required = true)]
    counts_file: Box<str>,

    /// covariate TSV (header = column names, one row per cell)
    #[arg(long, short = 'x', required = true)]
    covariates_file: Box<str>,

    /// covariate TSV to synthesize against instead of the training
    /// table (counterfactual synthesis)
    #[arg(long)]
    target_covariates_file: Option<Box<str>>,

    /// output header; writes `{out}.counts.tsv`, `{out}.covariates.tsv`,
    /// `{out}.diagnostics.json`
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// assay name (defaults to the first assay)
    #[arg(long)]
    assay: Option<Box<str>>,

    /// mean model, e.g. `~ cell_type + pseudotime`
    #[arg(long, default_value = "~ 1")]
    mean_formula: Box<str>,

    /// dispersion model
    #[arg(long, default_value = "~ 1")]
    disp_formula: Box<str>,

    /// correlation grouping, e.g. `~ cell_type`; omitted = one group
    #[arg(long)]
    corr_formula: Option<Box<str>>,

    /// count family: poisson, nb, zip, zinb
    #[arg(long, default_value = "nb")]
    family: CountFamily,

    /// dependency family: independent, gaussian, auto
    #[arg(long, default_value = "auto")]
    dependency: DependencyChoice,

    /// maximum number of worker threads
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// random seed
    #[arg(long, default_value_t = 42)]
    rseed: u64,

    /// fewest nonzero cells a gene needs to be modeled
    #[arg(long, default_value_t = DEFAULT_MIN_NONZERO)]
    min_nonzero: usize,

    /// zero-mass fraction beyond which a gene is sampled independently
    #[arg(long, default_value_t = DEFAULT_ZERO_MASS_CUTOFF)]
    zero_mass_cutoff: f64,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let (counts_nd, genes) = read_counts_tsv(&args.counts_file)?;
    let covariates = read_covariates_tsv(&args.covariates_file)?;
    let raw = RawDataset::new(counts_nd, genes, covariates);

    let target = args
        .target_covariates_file
        .as_deref()
        .map(read_covariates_tsv)
        .transpose()?;

    let config = SimulateConfig {
        assay: args.assay.clone(),
        mean_formula: Formula::parse(&args.mean_formula),
        disp_formula: Formula::parse(&args.disp_formula),
        corr_formula: args.corr_formula.as_deref().map(Formula::parse),
        family: args.family,
        dependency: args.dependency,
        threads: num_cpus::get().min(args.threads.max(1)),
        rseed: args.rseed,
        return_model: false,
        min_nonzero: args.min_nonzero,
        zero_mass_cutoff: args.zero_mass_cutoff,
    };

    info!("will use up to {} threads", config.threads);

    let result = simulate(&raw, &config, target.as_ref())?;

    let counts_out = format!("{}.counts.tsv", args.out);
    let covar_out = format!("{}.covariates.tsv", args.out);
    let diag_out = format!("{}.diagnostics.json", args.out);

    write_counts_tsv(&result.counts_nd, &result.genes, &counts_out)?;
    write_covariates_tsv(&result.covariates, &covar_out)?;
    std::fs::write(&diag_out, serde_json::to_string_pretty(&result.diagnostics)?)?;

    info!("wrote {}, {}, {}", counts_out, covar_out, diag_out);
    Ok(())
}

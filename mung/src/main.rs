mod common;
mod copula;
mod dataset;
mod extract;
mod marginal;
mod pipeline;
mod run_simulate;
mod sim_input;
mod synthesize;

use crate::common::*;
use run_simulate::*;

/// Marginal-copula simulation of single-cell count data
#[derive(Parser, Debug)]
#[command(version, about, long_about, term_width = 80)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fit marginal and dependency models to a reference count matrix
    /// and synthesize a new one, optionally under shifted covariates
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    Ok(())
}

#![allow(dead_code)]

pub type Mat = nalgebra::DMatrix<f64>;
pub type DVec = nalgebra::DVector<f64>;

pub use fnv::FnvHashMap as HashMap;
pub use log::{info, warn};

pub use clap::{Args, Parser, Subcommand};

/// fewest nonzero cells a gene needs to be modeled at all
pub const DEFAULT_MIN_NONZERO: usize = 2;

/// zero-mass fraction above which a gene is sampled independently
/// (`important_feature`) instead of entering the copula
pub const DEFAULT_ZERO_MASS_CUTOFF: f64 = 0.9;

/// label used when no correlation grouping formula is given
pub const SHARED_GROUP: &str = "shared";

const UNIFORMIZE_STREAM: u64 = 1;
const SYNTHESIS_STREAM: u64 = 2;

fn mix_seed(rseed: u64, stream: u64, unit: u64) -> u64 {
    rseed
        .wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(unit.wrapping_mul(0xD1B5_4A32_D192_ED03))
}

/// per-gene seed for the randomized discreteness correction
pub fn uniformize_seed(rseed: u64, gene: usize) -> u64 {
    mix_seed(rseed, UNIFORMIZE_STREAM, gene as u64)
}

/// per-cell seed for latent and independent sampling
pub fn synthesis_seed(rseed: u64, cell: usize) -> u64 {
    mix_seed(rseed, SYNTHESIS_STREAM, cell as u64)
}

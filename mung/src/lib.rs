pub mod common;
pub mod copula; // gene-gene dependency model per correlation group
pub mod dataset; // covariate tables, formulas, gene filtering
pub mod extract; // evaluate fitted marginals at new covariates
pub mod marginal; // per-gene distributional regression
pub mod pipeline; // fit-once / synthesize-many orchestration
pub mod sim_input; // tsv input and output
pub mod synthesize; // correlated count sampling

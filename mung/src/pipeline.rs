use crate::common::*;
use crate::copula::*;
use crate::dataset::*;
use crate::extract::*;
use crate::marginal::*;
use crate::synthesize::*;

use count_param::families::CountFamily;
use serde::Serialize;

/// Options recognized by the simulation engine. Thresholds with
/// undocumented defaults are deliberately avoided: `min_nonzero` and
/// `zero_mass_cutoff` are part of the public surface.
#[derive(Debug, Clone)]
pub struct SimulateConfig {
    pub assay: Option<Box<str>>,
    pub mean_formula: Formula,
    pub disp_formula: Formula,
    pub corr_formula: Option<Formula>,
    pub family: CountFamily,
    pub dependency: DependencyChoice,
    pub threads: usize,
    pub rseed: u64,
    pub return_model: bool,
    pub min_nonzero: usize,
    pub zero_mass_cutoff: f64,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            assay: None,
            mean_formula: Formula::default(),
            disp_formula: Formula::default(),
            corr_formula: None,
            family: CountFamily::NegBinomial,
            dependency: DependencyChoice::Auto,
            threads: 1,
            rseed: 42,
            return_model: false,
            min_nonzero: DEFAULT_MIN_NONZERO,
            zero_mass_cutoff: DEFAULT_ZERO_MASS_CUTOFF,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub group: Box<str>,
    pub family: Box<str>,
    pub aic_independent: f64,
    pub aic_gaussian: f64,
}

/// Everything the run wants to tell the caller about genes that were
/// dropped or downgraded; never fatal, never silent.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Diagnostics {
    pub filtered_genes: Vec<Box<str>>,
    pub fallback_genes: Vec<Box<str>>,
    pub nofit_genes: Vec<Box<str>>,
    pub important_features: Vec<(Box<str>, Box<str>)>,
    pub dependency: Vec<DependencyReport>,
}

/// Fitted state sufficient to synthesize against any compatible
/// covariate table without touching the training data again. Read-only
/// after fitting.
#[derive(Debug)]
pub struct FittedModel {
    pub marginals: FittedMarginals,
    pub dependency: Vec<DependencyModel>,
    pub corr_formula: Option<Formula>,
}

#[derive(Debug)]
pub struct SimulationResult {
    pub counts_nd: Mat,
    pub genes: Vec<Box<str>>,
    pub covariates: CovariateTable,
    pub diagnostics: Diagnostics,
    pub model: Option<FittedModel>,
    pub params: Option<ParamMatrices>,
}

/// Stages 1-3: build the modeling data, fit marginals, fit the
/// dependency structure.
pub fn fit_model(
    raw: &RawDataset,
    config: &SimulateConfig,
) -> anyhow::Result<(FittedModel, Diagnostics)> {
    let data = build_modeling_data(
        raw,
        config.assay.as_deref(),
        &config.mean_formula,
        &config.disp_formula,
        config.corr_formula.as_ref(),
        config.min_nonzero,
    )?;

    let MarginalFitOutput {
        marginals,
        y_nd,
        fallback_genes,
        nofit_genes,
    } = fit_marginals(&data, config.family)?;

    // training-time parameters feed the residual transform
    let train_params = extract_parameters(&marginals, &raw.covariates)?;
    let z_nd = gaussian_residuals(&y_nd, &train_params, &marginals, config.rseed)?;

    let genes = marginals.genes();
    let DependencyFitOutput {
        models: dependency,
        important_features,
    } = fit_dependency(
        &z_nd,
        &y_nd,
        &data.corr_groups,
        &genes,
        config.dependency,
        config.zero_mass_cutoff,
    )?;

    let diagnostics = Diagnostics {
        filtered_genes: data.filtered_genes,
        fallback_genes,
        nofit_genes,
        important_features,
        dependency: dependency
            .iter()
            .map(|m| DependencyReport {
                group: m.group.clone(),
                family: m.family.name().into(),
                aic_independent: m.aic_independent,
                aic_gaussian: m.aic_gaussian,
            })
            .collect(),
    };

    Ok((
        FittedModel {
            marginals,
            dependency,
            corr_formula: config.corr_formula.clone(),
        },
        diagnostics,
    ))
}

/// Stages 4-5 against an arbitrary covariate table. Cheap relative to
/// fitting, so counterfactual tables can be replayed many times over the
/// same `FittedModel`.
pub fn synthesize_from(
    model: &FittedModel,
    table: &CovariateTable,
    rseed: u64,
) -> anyhow::Result<(Mat, ParamMatrices)> {
    let params = extract_parameters(&model.marginals, table)?;
    let groups = resolve_corr_groups(table, model.corr_formula.as_ref())?;
    let counts_nd = synthesize_counts(&params, &model.marginals, &model.dependency, &groups, rseed)?;
    Ok((counts_nd, params))
}

fn simulate_inner(
    raw: &RawDataset,
    config: &SimulateConfig,
    target: Option<&CovariateTable>,
) -> anyhow::Result<SimulationResult> {
    let (model, diagnostics) = fit_model(raw, config)?;

    let table = target.unwrap_or(&raw.covariates);
    let (counts_nd, params) = synthesize_from(&model, table, config.rseed)?;

    info!(
        "synthesized {} cells x {} genes",
        counts_nd.nrows(),
        counts_nd.ncols()
    );

    Ok(SimulationResult {
        counts_nd,
        genes: model.marginals.genes(),
        covariates: table.clone(),
        diagnostics,
        model: config.return_model.then_some(model),
        params: config.return_model.then_some(params),
    })
}

/// Run the whole five-stage pipeline inside a worker pool bounded by
/// `config.threads`. The pool is local, not global, so callers (and
/// tests) can run different worker counts side by side.
pub fn simulate(
    raw: &RawDataset,
    config: &SimulateConfig,
    target: Option<&CovariateTable>,
) -> anyhow::Result<SimulationResult> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.max(1))
        .build()?;
    pool.install(|| simulate_inner(raw, config, target))
}

use crate::common::*;
use crate::dataset::*;

use count_param::families::CountFamily;
use count_param::glm::{fit_count_glm, FittedGlm};

use indicatif::ParallelProgressIterator;
use rayon::prelude::*;

/// One gene's fitted marginal: family tag, coefficient payload, and
/// whether a simpler family had to stand in for the requested one
#[derive(Debug, Clone)]
pub struct MarginalModel {
    pub gene: Box<str>,
    pub family: CountFamily,
    pub mean_coef: DVec,
    pub disp_coef: DVec,
    pub zero_coef: Option<DVec>,
    pub fallback: bool,
    pub log_likelihood: f64,
}

/// Fitted marginals for the retained gene set, together with the design
/// encoders they must be evaluated through. Immutable after fitting so
/// extraction and synthesis can share it across calls.
#[derive(Debug)]
pub struct FittedMarginals {
    pub models: Vec<MarginalModel>,
    pub encoder_mean: DesignEncoder,
    pub encoder_disp: DesignEncoder,
}

impl FittedMarginals {
    pub fn genes(&self) -> Vec<Box<str>> {
        self.models.iter().map(|m| m.gene.clone()).collect()
    }
}

pub struct MarginalFitOutput {
    pub marginals: FittedMarginals,
    /// count columns subset to the genes that actually got a model
    pub y_nd: Mat,
    pub fallback_genes: Vec<Box<str>>,
    pub nofit_genes: Vec<Box<str>>,
}

enum GeneFit {
    Fitted(Box<MarginalModel>),
    NoFit { gene: Box<str>, error: Box<str> },
}

fn fit_one_gene(
    gene: &str,
    family: CountFamily,
    x_mean: &Mat,
    x_disp: &Mat,
    y_n: &DVec,
) -> GeneFit {
    let mut fam = family;
    let mut fallback = false;
    let mut last_err: Option<anyhow::Error> = None;
    loop {
        match fit_count_glm(fam, x_mean, x_disp, y_n) {
            Ok(FittedGlm {
                family,
                mean_coef,
                disp_coef,
                zero_coef,
                log_likelihood,
            }) => {
                return GeneFit::Fitted(Box::new(MarginalModel {
                    gene: gene.into(),
                    family,
                    mean_coef,
                    disp_coef,
                    zero_coef,
                    fallback,
                    log_likelihood,
                }));
            }
            Err(e) => match fam.simpler() {
                Some(simpler) => {
                    fam = simpler;
                    fallback = true;
                    last_err = Some(e);
                }
                None => {
                    let msg = last_err
                        .map(|prev| format!("{}; then {}", prev, e))
                        .unwrap_or_else(|| e.to_string());
                    return GeneFit::NoFit {
                        gene: gene.into(),
                        error: msg.into_boxed_str(),
                    };
                }
            },
        }
    }
}

/// Stage 2: fit every retained gene independently and in parallel.
/// A gene that fails under the requested family walks the fallback chain;
/// a gene that exhausts the chain is reported as `nofit`, never silently
/// dropped and never fatal to the run.
pub fn fit_marginals(data: &ModelingData, family: CountFamily) -> anyhow::Result<MarginalFitOutput> {
    let d = data.genes.len();
    info!("fitting {} marginal models ({})", d, family.name());

    let fits: Vec<GeneFit> = (0..d)
        .into_par_iter()
        .progress_count(d as u64)
        .map(|g| {
            let y_n = data.y_nd.column(g).into_owned();
            fit_one_gene(&data.genes[g], family, &data.x_mean_np, &data.x_disp_nq, &y_n)
        })
        .collect();

    let mut models = vec![];
    let mut kept_cols = vec![];
    let mut fallback_genes = vec![];
    let mut nofit_genes = vec![];
    for (g, fit) in fits.into_iter().enumerate() {
        match fit {
            GeneFit::Fitted(model) => {
                if model.fallback {
                    fallback_genes.push(model.gene.clone());
                }
                models.push(*model);
                kept_cols.push(g);
            }
            GeneFit::NoFit { gene, error } => {
                warn!("no marginal fit for {}: {}", gene, error);
                nofit_genes.push(gene);
            }
        }
    }

    if models.is_empty() {
        return Err(anyhow::anyhow!("no gene admitted a marginal model"));
    }
    if !fallback_genes.is_empty() {
        info!("{} genes used a simpler fallback family", fallback_genes.len());
    }

    let cols: Vec<DVec> = kept_cols
        .iter()
        .map(|&g| data.y_nd.column(g).into_owned())
        .collect();

    Ok(MarginalFitOutput {
        marginals: FittedMarginals {
            models,
            encoder_mean: data.encoder_mean.clone(),
            encoder_disp: data.encoder_disp.clone(),
        },
        y_nd: Mat::from_columns(&cols),
        fallback_genes,
        nofit_genes,
    })
}

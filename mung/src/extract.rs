use crate::common::*;
use crate::dataset::CovariateTable;
use crate::marginal::FittedMarginals;

use count_param::families::CountParam;
use count_param::glm::{dispersion_of, mean_of, zero_prob_of};

use rayon::prelude::*;

/// Per-(cell, gene) distributional parameters at a given covariate table.
/// `dispersion` holds `f64::INFINITY` for Poisson-family genes.
#[derive(Debug)]
pub struct ParamMatrices {
    pub mean_nd: Mat,
    pub dispersion_nd: Mat,
    pub zero_prob_nd: Mat,
    pub genes: Vec<Box<str>>,
}

impl ParamMatrices {
    pub fn num_cells(&self) -> usize {
        self.mean_nd.nrows()
    }

    pub fn param(&self, cell: usize, gene: usize) -> CountParam {
        CountParam {
            mean: self.mean_nd[(cell, gene)],
            dispersion: self.dispersion_nd[(cell, gene)],
            zero_prob: self.zero_prob_nd[(cell, gene)],
        }
    }
}

/// Stage 4: evaluate every gene's fitted link functions at the covariate
/// rows of `table`. Purely deterministic; fails on missing covariate
/// columns or categorical levels unseen at fit time, before any output
/// is produced.
pub fn extract_parameters(
    marginals: &FittedMarginals,
    table: &CovariateTable,
) -> anyhow::Result<ParamMatrices> {
    let x_mean = marginals.encoder_mean.encode(table)?;
    let x_disp = marginals.encoder_disp.encode(table)?;
    let n = table.num_cells();

    let cols: Vec<(DVec, DVec, DVec)> = marginals
        .models
        .par_iter()
        .map(|model| {
            let mu = mean_of(&x_mean, &model.mean_coef);
            let theta = if model.disp_coef.is_empty() {
                DVec::from_element(n, f64::INFINITY)
            } else {
                dispersion_of(&x_disp, &model.disp_coef)
            };
            let pi = match &model.zero_coef {
                Some(coef) => zero_prob_of(&x_mean, coef),
                None => DVec::zeros(n),
            };
            (mu, theta, pi)
        })
        .collect();

    let mean_nd = Mat::from_columns(&cols.iter().map(|c| c.0.clone()).collect::<Vec<_>>());
    let dispersion_nd = Mat::from_columns(&cols.iter().map(|c| c.1.clone()).collect::<Vec<_>>());
    let zero_prob_nd = Mat::from_columns(&cols.iter().map(|c| c.2.clone()).collect::<Vec<_>>());

    Ok(ParamMatrices {
        mean_nd,
        dispersion_nd,
        zero_prob_nd,
        genes: marginals.genes(),
    })
}

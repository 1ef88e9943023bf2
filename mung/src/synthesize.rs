use crate::common::*;
use crate::copula::{DependencyFamily, DependencyModel};
use crate::extract::ParamMatrices;
use crate::marginal::FittedMarginals;

use count_param::families::count_quantile;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};

const UNIT_EPS: f64 = 1e-12;

/// Stage 5: draw the synthetic count matrix, row-aligned with the
/// covariate table the parameters were extracted from. Each cell owns an
/// index-seeded generator, so the result depends only on the seed and
/// the inputs, not on worker count or scheduling.
///
/// A cell whose `corr_group` has no fitted dependency model fails the
/// whole call before any sampling.
pub fn synthesize_counts(
    params: &ParamMatrices,
    marginals: &FittedMarginals,
    dependency: &[DependencyModel],
    corr_groups: &[Box<str>],
    rseed: u64,
) -> anyhow::Result<Mat> {
    let n = params.num_cells();
    let d = params.genes.len();
    if corr_groups.len() != n {
        return Err(anyhow::anyhow!(
            "{} corr_group labels vs. {} covariate rows",
            corr_groups.len(),
            n
        ));
    }

    let by_label: HashMap<&str, &DependencyModel> = dependency
        .iter()
        .map(|m| (m.group.as_ref(), m))
        .collect();

    // every group must resolve before we sample anything
    for label in corr_groups.iter() {
        if !by_label.contains_key(label.as_ref()) {
            return Err(anyhow::anyhow!(
                "corr_group {} was never seen when fitting the dependency model",
                label
            ));
        }
    }

    let norm = Normal::new(0.0, 1.0).expect("standard normal");

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| -> anyhow::Result<Vec<f64>> {
            let model = by_label[corr_groups[i].as_ref()];
            let mut rng = StdRng::seed_from_u64(synthesis_seed(rseed, i));
            let mut row = vec![0.0; d];

            // joint draw over the copula genes of this group
            let dc = model.copula_genes.len();
            let eps = DVec::from_iterator(dc, (0..dc).map(|_| rng.sample(StandardNormal)));
            let z = match (model.family, &model.chol_l) {
                (DependencyFamily::GaussianCopula, Some(l)) => l * &eps,
                _ => eps,
            };
            for (k, &g) in model.copula_genes.iter().enumerate() {
                let u = norm.cdf(z[k]).clamp(UNIT_EPS, 1.0 - UNIT_EPS);
                let family = marginals.models[g].family;
                let param = params.param(i, g);
                row[g] = count_quantile(family, &param, u)? as f64;
            }

            // important_feature genes bypass the joint draw
            for &g in model.independent_genes.iter() {
                let u: f64 = rng.random::<f64>().clamp(UNIT_EPS, 1.0 - UNIT_EPS);
                let family = marginals.models[g].family;
                let param = params.param(i, g);
                row[g] = count_quantile(family, &param, u)? as f64;
            }

            Ok(row)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Mat::from_fn(n, d, |i, j| rows[i][j]))
}

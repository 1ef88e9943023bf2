use crate::common::*;
use crate::extract::ParamMatrices;
use crate::marginal::FittedMarginals;

use count_param::families::count_cdf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};

const CDF_EPS: f64 = 1e-12;
const CORR_RIDGE: f64 = 1e-6;

/// Dependency families considered per correlation group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyFamily {
    Independent,
    GaussianCopula,
}

impl DependencyFamily {
    pub fn name(&self) -> &'static str {
        match self {
            DependencyFamily::Independent => "independent",
            DependencyFamily::GaussianCopula => "gaussian",
        }
    }
}

/// Which families to entertain; `Auto` keeps the one with the lower AIC
/// (ties go to the simpler, independent model)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyChoice {
    Independent,
    Gaussian,
    Auto,
}

impl std::str::FromStr for DependencyChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "independent" | "indep" => Ok(DependencyChoice::Independent),
            "gaussian" | "copula" => Ok(DependencyChoice::Gaussian),
            "auto" => Ok(DependencyChoice::Auto),
            _ => Err(anyhow::anyhow!("unknown dependency family: {}", s)),
        }
    }
}

/// Fitted dependency structure of one correlation group
#[derive(Debug)]
pub struct DependencyModel {
    pub group: Box<str>,
    pub family: DependencyFamily,
    /// gene indices (into the fitted gene set) entering the joint draw
    pub copula_genes: Vec<usize>,
    /// `important_feature` genes sampled independently downstream
    pub independent_genes: Vec<usize>,
    pub corr_dd: Option<Mat>,
    /// lower Cholesky factor of the correlation matrix
    pub chol_l: Option<Mat>,
    pub aic_independent: f64,
    pub aic_gaussian: f64,
}

pub struct DependencyFitOutput {
    pub models: Vec<DependencyModel>,
    /// (group, gene name) pairs tagged for independent sampling
    pub important_features: Vec<(Box<str>, Box<str>)>,
}

/// Stage 3a: map observed counts to Gaussian-scale residuals. Discrete
/// CDFs put positive mass on single values, so a uniform draw strictly
/// inside `(F(y-1), F(y))` breaks ties between equal counts; each gene
/// owns an index-seeded generator to keep parallel order irrelevant.
pub fn gaussian_residuals(
    y_nd: &Mat,
    params: &ParamMatrices,
    marginals: &FittedMarginals,
    rseed: u64,
) -> anyhow::Result<Mat> {
    let n = y_nd.nrows();
    let d = y_nd.ncols();
    let norm = Normal::new(0.0, 1.0).expect("standard normal");

    let cols: Vec<DVec> = (0..d)
        .into_par_iter()
        .map(|g| -> anyhow::Result<DVec> {
            let mut rng = StdRng::seed_from_u64(uniformize_seed(rseed, g));
            let family = marginals.models[g].family;
            let mut z_n = DVec::zeros(n);
            for i in 0..n {
                let y = y_nd[(i, g)] as i64;
                let param = params.param(i, g);
                let lo = count_cdf(family, &param, y - 1)?;
                let hi = count_cdf(family, &param, y)?;
                let v: f64 = rng.random();
                let u = (lo + v * (hi - lo)).clamp(CDF_EPS, 1.0 - CDF_EPS);
                z_n[i] = norm.inverse_cdf(u);
            }
            Ok(z_n)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Mat::from_columns(&cols))
}

fn partition_by_group(groups: &[Box<str>]) -> Vec<(Box<str>, Vec<usize>)> {
    let mut map: HashMap<Box<str>, Vec<usize>> = HashMap::default();
    for (i, g) in groups.iter().enumerate() {
        map.entry(g.clone()).or_default().push(i);
    }
    let mut out: Vec<_> = map.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn empirical_correlation(z_md: &Mat) -> Mat {
    let m = z_md.nrows();
    let d = z_md.ncols();
    let mut zs = z_md.clone();
    for mut col in zs.column_iter_mut() {
        let mean = col.mean();
        col.add_scalar_mut(-mean);
        let sd = (col.norm_squared() / (m.max(2) - 1) as f64).sqrt();
        col /= sd.max(1e-8);
    }
    let mut r_dd = (zs.transpose() * &zs) / (m.max(2) - 1) as f64;
    for j in 0..d {
        r_dd[(j, j)] = 1.0;
    }
    r_dd
}

fn cholesky_with_ridge(r_dd: &Mat) -> anyhow::Result<Mat> {
    let d = r_dd.nrows();
    let mut ridge = 0.0;
    for _ in 0..6 {
        let mut reg = r_dd.clone();
        for j in 0..d {
            reg[(j, j)] += ridge;
        }
        if let Some(chol) = reg.cholesky() {
            return Ok(chol.l());
        }
        ridge = if ridge == 0.0 { CORR_RIDGE } else { ridge * 10.0 };
    }
    Err(anyhow::anyhow!("correlation matrix is not positive definite"))
}

/// Gaussian copula log-density summed over cells, relative to the
/// independence model (whose log-density is therefore 0). `None` when the
/// Cholesky factor cannot back-solve a cell's residual row.
fn gaussian_copula_loglik(z_md: &Mat, chol_l: &Mat) -> Option<f64> {
    let logdet: f64 = (0..chol_l.nrows())
        .map(|j| chol_l[(j, j)].max(1e-300).ln())
        .sum();
    let mut ll = 0.0;
    for i in 0..z_md.nrows() {
        let z = z_md.row(i).transpose();
        let w = chol_l.solve_lower_triangular(&z)?;
        ll += -0.5 * (w.norm_squared() - z.norm_squared()) - logdet;
    }
    Some(ll)
}

/// Stage 3b: per correlation group, pick which genes enter the joint
/// structure, estimate the residual correlation, and select the family
/// by AIC.
pub fn fit_dependency(
    z_nd: &Mat,
    y_nd: &Mat,
    corr_groups: &[Box<str>],
    genes: &[Box<str>],
    choice: DependencyChoice,
    zero_mass_cutoff: f64,
) -> anyhow::Result<DependencyFitOutput> {
    let d = y_nd.ncols();
    let groups = partition_by_group(corr_groups);

    let models: Vec<DependencyModel> = groups
        .par_iter()
        .map(|(label, cells)| {
            let m = cells.len();

            // degenerate marginal behavior within this group tags a gene
            // for independent sampling
            let mut copula_genes = vec![];
            let mut independent_genes = vec![];
            for g in 0..d {
                let zeros = cells.iter().filter(|&&i| y_nd[(i, g)] == 0.0).count();
                if (zeros as f64) / (m.max(1) as f64) > zero_mass_cutoff {
                    independent_genes.push(g);
                } else {
                    copula_genes.push(g);
                }
            }

            let dc = copula_genes.len();
            if dc < 2 || m < 3 {
                if choice == DependencyChoice::Gaussian {
                    warn!(
                        "group {}: {} cells / {} eligible genes is too small for a joint model; sampling independently",
                        label, m, dc
                    );
                }
                return DependencyModel {
                    group: label.clone(),
                    family: DependencyFamily::Independent,
                    copula_genes,
                    independent_genes,
                    corr_dd: None,
                    chol_l: None,
                    aic_independent: 0.0,
                    aic_gaussian: f64::INFINITY,
                };
            }

            let z_md = Mat::from_fn(m, dc, |i, k| z_nd[(cells[i], copula_genes[k])]);
            let r_dd = empirical_correlation(&z_md);

            let gaussian_fit = cholesky_with_ridge(&r_dd)
                .ok()
                .and_then(|l| gaussian_copula_loglik(&z_md, &l).map(|ll| (l, ll)));

            let (family, corr_dd, chol_l, aic_gaussian) = match gaussian_fit {
                Some((l, ll)) => {
                    let k = (dc * (dc - 1) / 2) as f64;
                    let aic_gaussian = -2.0 * ll + 2.0 * k;
                    let family = match choice {
                        DependencyChoice::Independent => DependencyFamily::Independent,
                        DependencyChoice::Gaussian => DependencyFamily::GaussianCopula,
                        DependencyChoice::Auto => {
                            if aic_gaussian < 0.0 {
                                DependencyFamily::GaussianCopula
                            } else {
                                DependencyFamily::Independent
                            }
                        }
                    };
                    (family, Some(r_dd), Some(l), aic_gaussian)
                }
                None => {
                    warn!(
                        "group {}: residual correlation is not usable; sampling independently",
                        label
                    );
                    (DependencyFamily::Independent, None, None, f64::INFINITY)
                }
            };

            info!(
                "group {}: {} copula genes, {} independent, family = {}",
                label,
                dc,
                independent_genes.len(),
                family.name()
            );

            DependencyModel {
                group: label.clone(),
                family,
                copula_genes,
                independent_genes,
                corr_dd,
                chol_l,
                aic_independent: 0.0,
                aic_gaussian,
            }
        })
        .collect();

    let important_features = models
        .iter()
        .flat_map(|model| {
            model
                .independent_genes
                .iter()
                .map(|&g| (model.group.clone(), genes[g].clone()))
        })
        .collect();

    Ok(DependencyFitOutput {
        models,
        important_features,
    })
}

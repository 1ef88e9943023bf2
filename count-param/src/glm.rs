use crate::families::*;

use nalgebra::{DMatrix, DVector};
use special::Gamma;
use statrs::function::gamma::ln_gamma;

const MAX_IRLS_ITER: usize = 50;
const COEF_TOL: f64 = 1e-8;
const MAX_ETA: f64 = 30.0;
const RIDGE: f64 = 1e-8;
const MIN_WEIGHT: f64 = 1e-10;
const EM_MAX_ITER: usize = 50;
const EM_TOL: f64 = 1e-6;
const DISP_MAX_ITER: usize = 100;

/// A fitted per-gene regression: family tag plus coefficient payload.
/// `disp_coef` is empty for Poisson-type families; `zero_coef` is present
/// only for zero-inflated families.
#[derive(Debug, Clone)]
pub struct FittedGlm {
    pub family: CountFamily,
    pub mean_coef: DVector<f64>,
    pub disp_coef: DVector<f64>,
    pub zero_coef: Option<DVector<f64>>,
    pub log_likelihood: f64,
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `μ = exp(Xβ)` with the linear predictor clamped for stability
pub fn mean_of(x_np: &DMatrix<f64>, beta: &DVector<f64>) -> DVector<f64> {
    (x_np * beta).map(|e| e.clamp(-MAX_ETA, MAX_ETA).exp())
}

/// `θ = exp(Zγ)` clamped to the admissible dispersion range
pub fn dispersion_of(xd_nq: &DMatrix<f64>, gamma: &DVector<f64>) -> DVector<f64> {
    (xd_nq * gamma).map(|e| e.clamp(MIN_DISPERSION.ln(), MAX_DISPERSION.ln()).exp())
}

/// `π = sigmoid(Xc)` clamped away from the boundary
pub fn zero_prob_of(x_np: &DMatrix<f64>, coef: &DVector<f64>) -> DVector<f64> {
    (x_np * coef).map(|e| sigmoid(e.clamp(-MAX_ETA, MAX_ETA)).clamp(1e-6, 1.0 - 1e-6))
}

fn solve_weighted_ls(
    x_np: &DMatrix<f64>,
    w_n: &DVector<f64>,
    z_n: &DVector<f64>,
) -> anyhow::Result<DVector<f64>> {
    let mut xw = x_np.clone();
    for (i, mut row) in xw.row_iter_mut().enumerate() {
        row *= w_n[i];
    }
    let xtwx = x_np.transpose() * &xw;
    let xtwz = xw.transpose() * z_n;

    let p = xtwx.nrows();
    let mut ridge = 0.0;
    for _ in 0..4 {
        let mut reg = xtwx.clone();
        for j in 0..p {
            reg[(j, j)] += ridge;
        }
        if let Some(chol) = reg.cholesky() {
            return Ok(chol.solve(&xtwz));
        }
        ridge = if ridge == 0.0 { RIDGE } else { ridge * 100.0 };
    }
    Err(anyhow::anyhow!("weighted least squares is singular"))
}

/// IRLS on the log link for Poisson (`theta_n = None`) or negative
/// binomial (per-observation dispersion) responses, with optional prior
/// observation weights (used by the zero-inflation EM).
pub fn irls_count(
    x_np: &DMatrix<f64>,
    y_n: &DVector<f64>,
    theta_n: Option<&DVector<f64>>,
    prior_w: Option<&DVector<f64>>,
    init: Option<&DVector<f64>>,
) -> anyhow::Result<DVector<f64>> {
    let n = x_np.nrows();
    let p = x_np.ncols();
    if n <= p {
        return Err(anyhow::anyhow!(
            "{} observations cannot identify {} coefficients",
            n,
            p
        ));
    }

    let mut beta = match init {
        Some(b) => b.clone(),
        None => {
            let mut b = DVector::<f64>::zeros(p);
            b[0] = y_n.mean().max(MIN_MEAN).ln();
            b
        }
    };

    for _iter in 0..MAX_IRLS_ITER {
        let eta = (x_np * &beta).map(|e| e.clamp(-MAX_ETA, MAX_ETA));
        let mut w = DVector::<f64>::zeros(n);
        let mut z = DVector::<f64>::zeros(n);
        for i in 0..n {
            let mu_i = eta[i].exp().max(MIN_MEAN);
            let var_w = match theta_n {
                Some(th) if th[i].is_finite() => {
                    mu_i / (1.0 + mu_i / th[i].max(MIN_DISPERSION))
                }
                _ => mu_i,
            };
            let pw = prior_w.map(|v| v[i]).unwrap_or(1.0);
            w[i] = (pw * var_w).max(MIN_WEIGHT);
            z[i] = eta[i] + (y_n[i] - mu_i) / mu_i;
        }
        let beta_new = solve_weighted_ls(x_np, &w, &z)?;
        if !beta_new.iter().all(|b| b.is_finite()) {
            return Err(anyhow::anyhow!("count IRLS diverged"));
        }
        let delta = (&beta_new - &beta).amax();
        beta = beta_new;
        if delta < COEF_TOL {
            break;
        }
    }
    Ok(beta)
}

/// IRLS on the logit link with responses in `[0,1]` (EM responsibilities
/// are fractional, so this is weighted quasi-binomial rather than 0/1
/// logistic regression).
pub fn irls_logistic(
    x_np: &DMatrix<f64>,
    r_n: &DVector<f64>,
    init: Option<&DVector<f64>>,
) -> anyhow::Result<DVector<f64>> {
    let n = x_np.nrows();
    let p = x_np.ncols();
    if n <= p {
        return Err(anyhow::anyhow!(
            "{} observations cannot identify {} coefficients",
            n,
            p
        ));
    }

    let mut coef = match init {
        Some(c) => c.clone(),
        None => DVector::<f64>::zeros(p),
    };

    for _iter in 0..MAX_IRLS_ITER {
        let eta = (x_np * &coef).map(|e| e.clamp(-MAX_ETA, MAX_ETA));
        let mut w = DVector::<f64>::zeros(n);
        let mut z = DVector::<f64>::zeros(n);
        for i in 0..n {
            let p_i = sigmoid(eta[i]).clamp(1e-6, 1.0 - 1e-6);
            let v_i = (p_i * (1.0 - p_i)).max(MIN_WEIGHT);
            w[i] = v_i;
            z[i] = eta[i] + (r_n[i] - p_i) / v_i;
        }
        let coef_new = solve_weighted_ls(x_np, &w, &z)?;
        if !coef_new.iter().all(|c| c.is_finite()) {
            return Err(anyhow::anyhow!("logistic IRLS diverged"));
        }
        let delta = (&coef_new - &coef).amax();
        coef = coef_new;
        if delta < COEF_TOL {
            break;
        }
    }
    Ok(coef)
}

/// Log-likelihood of one count under Poisson (`theta = inf`) or NB
fn count_obs_loglik(y: f64, mu: f64, theta: f64) -> f64 {
    let mu = mu.max(MIN_MEAN);
    if theta.is_finite() {
        let th = theta.clamp(MIN_DISPERSION, MAX_DISPERSION);
        ln_gamma(y + th) - ln_gamma(th) - ln_gamma(y + 1.0)
            + th * (th / (th + mu)).ln()
            + y * (mu / (th + mu)).ln()
    } else {
        y * mu.ln() - mu - ln_gamma(y + 1.0)
    }
}

fn count_loglik(
    y_n: &DVector<f64>,
    mu_n: &DVector<f64>,
    theta_n: Option<&DVector<f64>>,
    prior_w: Option<&DVector<f64>>,
) -> f64 {
    let mut ll = 0.0;
    for i in 0..y_n.len() {
        let th = theta_n.map(|t| t[i]).unwrap_or(f64::INFINITY);
        let pw = prior_w.map(|v| v[i]).unwrap_or(1.0);
        ll += pw * count_obs_loglik(y_n[i], mu_n[i], th);
    }
    ll
}

/// Maximize the NB profile likelihood over log-link dispersion
/// coefficients by damped gradient ascent. The score uses the digamma
/// identity `∂ℓ/∂θ = ψ(y+θ) - ψ(θ) + ln θ + 1 - ln(θ+μ) - (y+θ)/(θ+μ)`.
pub fn fit_dispersion_coef(
    xd_nq: &DMatrix<f64>,
    y_n: &DVector<f64>,
    mu_n: &DVector<f64>,
    prior_w: Option<&DVector<f64>>,
    init: &DVector<f64>,
) -> anyhow::Result<DVector<f64>> {
    let n = xd_nq.nrows();
    let q = xd_nq.ncols();

    let mut gamma = init.clone();
    let theta = dispersion_of(xd_nq, &gamma);
    let mut ll = count_loglik(y_n, mu_n, Some(&theta), prior_w);
    if !ll.is_finite() {
        return Err(anyhow::anyhow!("dispersion likelihood is not finite"));
    }

    for _iter in 0..DISP_MAX_ITER {
        let theta = dispersion_of(xd_nq, &gamma);
        let mut grad = DVector::<f64>::zeros(q);
        for i in 0..n {
            let th_i = theta[i];
            let mu_i = mu_n[i].max(MIN_MEAN);
            let y_i = y_n[i];
            let score = (y_i + th_i).digamma() - th_i.digamma() + th_i.ln() + 1.0
                - (th_i + mu_i).ln()
                - (y_i + th_i) / (th_i + mu_i);
            let pw = prior_w.map(|v| v[i]).unwrap_or(1.0);
            let coef = pw * score * th_i;
            for j in 0..q {
                grad[j] += coef * xd_nq[(i, j)];
            }
        }
        if grad.amax() < 1e-10 * (n as f64) {
            break;
        }

        let dir = &grad / (n as f64);
        let mut step = 1.0;
        let mut gain = 0.0;
        let mut improved = false;
        for _ in 0..30 {
            let cand = &gamma + &dir * step;
            let theta_c = dispersion_of(xd_nq, &cand);
            let cand_ll = count_loglik(y_n, mu_n, Some(&theta_c), prior_w);
            if cand_ll.is_finite() && cand_ll > ll {
                gain = cand_ll - ll;
                ll = cand_ll;
                gamma = cand;
                improved = true;
                break;
            }
            step *= 0.5;
        }
        if !improved || gain < 1e-8 {
            break;
        }
    }
    Ok(gamma)
}

fn fit_nb(
    x_mean: &DMatrix<f64>,
    x_disp: &DMatrix<f64>,
    y_n: &DVector<f64>,
    prior_w: Option<&DVector<f64>>,
) -> anyhow::Result<(DVector<f64>, DVector<f64>, f64)> {
    let mut beta = irls_count(x_mean, y_n, None, prior_w, None)?;
    let mut mu = mean_of(x_mean, &beta);

    // moment-matched dispersion intercept to start from
    let m = y_n.mean();
    let v = y_n.iter().map(|&y| (y - m) * (y - m)).sum::<f64>() / (y_n.len().max(2) - 1) as f64;
    let theta0 = if v > m + 1e-8 {
        (m * m / (v - m)).clamp(1e-2, 1e4)
    } else {
        100.0
    };
    let mut gamma = DVector::<f64>::zeros(x_disp.ncols());
    gamma[0] = theta0.ln();

    let mut ll = f64::NEG_INFINITY;
    for _outer in 0..10 {
        gamma = fit_dispersion_coef(x_disp, y_n, &mu, prior_w, &gamma)?;
        let theta = dispersion_of(x_disp, &gamma);
        beta = irls_count(x_mean, y_n, Some(&theta), prior_w, Some(&beta))?;
        mu = mean_of(x_mean, &beta);

        let new_ll = count_loglik(y_n, &mu, Some(&theta), prior_w);
        if !new_ll.is_finite() {
            return Err(anyhow::anyhow!("negative binomial likelihood diverged"));
        }
        let done = (new_ll - ll).abs() < EM_TOL;
        ll = new_ll;
        if done {
            break;
        }
    }
    Ok((beta, gamma, ll))
}

fn fit_zero_inflated(
    family: CountFamily,
    x_mean: &DMatrix<f64>,
    x_disp: &DMatrix<f64>,
    y_n: &DVector<f64>,
) -> anyhow::Result<FittedGlm> {
    let n = y_n.len();
    let p = x_mean.ncols();
    let frac_zero = y_n.iter().filter(|&&y| y == 0.0).count() as f64 / n.max(1) as f64;
    if frac_zero == 0.0 {
        return Err(anyhow::anyhow!(
            "no zeros observed; zero-inflated fit is unidentified"
        ));
    }

    // responsibilities of the structural-zero component
    let r0 = (0.5 * frac_zero).clamp(1e-3, 0.5);
    let mut r = DVector::<f64>::from_iterator(
        n,
        y_n.iter().map(|&y| if y == 0.0 { r0 } else { 0.0 }),
    );

    let mut zero_coef = DVector::<f64>::zeros(p);
    zero_coef[0] = (r0 / (1.0 - r0)).ln();

    let mut beta = DVector::<f64>::zeros(p);
    let mut gamma = DVector::<f64>::zeros(x_disp.ncols());
    let mut prev_ll = f64::NEG_INFINITY;
    let mut ll = f64::NEG_INFINITY;

    for _iter in 0..EM_MAX_ITER {
        // M-step: count component weighted by 1 - r
        let w = r.map(|r_i| (1.0 - r_i).max(1e-6));
        let theta_n = if family.overdispersed() {
            let (b, g, _) = fit_nb(x_mean, x_disp, y_n, Some(&w))?;
            beta = b;
            gamma = g;
            Some(dispersion_of(x_disp, &gamma))
        } else {
            beta = irls_count(x_mean, y_n, None, Some(&w), Some(&beta))?;
            None
        };
        let mu = mean_of(x_mean, &beta);

        // M-step: zero component on the responsibilities
        zero_coef = irls_logistic(x_mean, &r, Some(&zero_coef))?;
        let pi = zero_prob_of(x_mean, &zero_coef);

        // E-step and observed-data likelihood
        ll = 0.0;
        for i in 0..n {
            let th_i = theta_n.as_ref().map(|t| t[i]).unwrap_or(f64::INFINITY);
            let param = CountParam {
                mean: mu[i],
                dispersion: th_i,
                zero_prob: 0.0,
            };
            if y_n[i] == 0.0 {
                let f0 = base_pmf_zero(family, &param);
                let mix = pi[i] + (1.0 - pi[i]) * f0;
                r[i] = pi[i] / mix.max(1e-300);
                ll += mix.max(1e-300).ln();
            } else {
                r[i] = 0.0;
                ll += (1.0 - pi[i]).ln() + count_obs_loglik(y_n[i], mu[i], th_i);
            }
        }
        if !ll.is_finite() {
            return Err(anyhow::anyhow!("zero-inflated likelihood diverged"));
        }
        if (ll - prev_ll).abs() < EM_TOL {
            break;
        }
        prev_ll = ll;
    }

    Ok(FittedGlm {
        family,
        mean_coef: beta,
        disp_coef: if family.overdispersed() {
            gamma
        } else {
            DVector::zeros(0)
        },
        zero_coef: Some(zero_coef),
        log_likelihood: ll,
    })
}

/// Fit one gene's distributional regression under the requested family.
/// Convergence failures surface as `Err`; the caller decides whether to
/// retry with `family.simpler()`.
pub fn fit_count_glm(
    family: CountFamily,
    x_mean: &DMatrix<f64>,
    x_disp: &DMatrix<f64>,
    y_n: &DVector<f64>,
) -> anyhow::Result<FittedGlm> {
    match family {
        CountFamily::Poisson => {
            let beta = irls_count(x_mean, y_n, None, None, None)?;
            let mu = mean_of(x_mean, &beta);
            let ll = count_loglik(y_n, &mu, None, None);
            if !ll.is_finite() {
                return Err(anyhow::anyhow!("poisson likelihood diverged"));
            }
            Ok(FittedGlm {
                family,
                mean_coef: beta,
                disp_coef: DVector::zeros(0),
                zero_coef: None,
                log_likelihood: ll,
            })
        }
        CountFamily::NegBinomial => {
            let (beta, gamma, ll) = fit_nb(x_mean, x_disp, y_n, None)?;
            Ok(FittedGlm {
                family,
                mean_coef: beta,
                disp_coef: gamma,
                zero_coef: None,
                log_likelihood: ll,
            })
        }
        CountFamily::ZeroInflatedPoisson | CountFamily::ZeroInflatedNegBinomial => {
            fit_zero_inflated(family, x_mean, x_disp, y_n)
        }
    }
}

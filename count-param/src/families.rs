use statrs::distribution::{DiscreteCDF, NegativeBinomial, Poisson};

pub const MIN_MEAN: f64 = 1e-8;

/// counts saturate here so one pathological (cell, gene) draw cannot
/// abort a whole run; still exactly representable as f64
pub const MAX_COUNT: u64 = 1 << 52;
pub const MIN_DISPERSION: f64 = 1e-4;
pub const MAX_DISPERSION: f64 = 1e6;

/// Count distribution family tag. Parameters live in `CountParam`; all
/// dispatch is on this tag so heterogeneous per-gene fits can share one
/// code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountFamily {
    Poisson,
    NegBinomial,
    ZeroInflatedPoisson,
    ZeroInflatedNegBinomial,
}

impl CountFamily {
    pub fn name(&self) -> &'static str {
        match self {
            CountFamily::Poisson => "poisson",
            CountFamily::NegBinomial => "nb",
            CountFamily::ZeroInflatedPoisson => "zip",
            CountFamily::ZeroInflatedNegBinomial => "zinb",
        }
    }

    pub fn zero_inflated(&self) -> bool {
        matches!(
            self,
            CountFamily::ZeroInflatedPoisson | CountFamily::ZeroInflatedNegBinomial
        )
    }

    pub fn overdispersed(&self) -> bool {
        matches!(
            self,
            CountFamily::NegBinomial | CountFamily::ZeroInflatedNegBinomial
        )
    }

    /// Next simpler family to retry when fitting fails to converge.
    /// `ZINB -> NB -> Poisson` and `ZIP -> Poisson`.
    pub fn simpler(&self) -> Option<CountFamily> {
        match self {
            CountFamily::ZeroInflatedNegBinomial => Some(CountFamily::NegBinomial),
            CountFamily::ZeroInflatedPoisson => Some(CountFamily::Poisson),
            CountFamily::NegBinomial => Some(CountFamily::Poisson),
            CountFamily::Poisson => None,
        }
    }
}

impl std::str::FromStr for CountFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "poisson" | "pois" => Ok(CountFamily::Poisson),
            "nb" | "negbinomial" | "negative-binomial" => Ok(CountFamily::NegBinomial),
            "zip" | "zero-inflated-poisson" => Ok(CountFamily::ZeroInflatedPoisson),
            "zinb" | "zero-inflated-negbinomial" => Ok(CountFamily::ZeroInflatedNegBinomial),
            _ => Err(anyhow::anyhow!("unknown count family: {}", s)),
        }
    }
}

/// Distributional parameters for a single (cell, gene) observation.
/// `dispersion` is the negative binomial size θ; `f64::INFINITY` is the
/// Poisson limit. `zero_prob` is the structural zero probability π.
#[derive(Debug, Clone, Copy)]
pub struct CountParam {
    pub mean: f64,
    pub dispersion: f64,
    pub zero_prob: f64,
}

impl CountParam {
    pub fn poisson(mean: f64) -> Self {
        Self {
            mean,
            dispersion: f64::INFINITY,
            zero_prob: 0.0,
        }
    }
}

fn base_cdf(family: CountFamily, param: &CountParam, k: u64) -> anyhow::Result<f64> {
    let mu = param.mean.max(MIN_MEAN);
    match family {
        CountFamily::Poisson | CountFamily::ZeroInflatedPoisson => Ok(Poisson::new(mu)?.cdf(k)),
        CountFamily::NegBinomial | CountFamily::ZeroInflatedNegBinomial => {
            if param.dispersion.is_finite() {
                let r = param.dispersion.clamp(MIN_DISPERSION, MAX_DISPERSION);
                let pr = r / (r + mu);
                Ok(NegativeBinomial::new(r, pr)?.cdf(k))
            } else {
                Ok(Poisson::new(mu)?.cdf(k))
            }
        }
    }
}

/// Probability of observing zero from the non-inflated part
pub fn base_pmf_zero(family: CountFamily, param: &CountParam) -> f64 {
    let mu = param.mean.max(MIN_MEAN);
    match family {
        CountFamily::Poisson | CountFamily::ZeroInflatedPoisson => (-mu).exp(),
        CountFamily::NegBinomial | CountFamily::ZeroInflatedNegBinomial => {
            if param.dispersion.is_finite() {
                let r = param.dispersion.clamp(MIN_DISPERSION, MAX_DISPERSION);
                (r * (r / (r + mu)).ln()).exp()
            } else {
                (-mu).exp()
            }
        }
    }
}

/// Cumulative distribution `F(k)` of the (possibly zero-inflated) count
/// distribution; `k < 0` gives 0.
pub fn count_cdf(family: CountFamily, param: &CountParam, k: i64) -> anyhow::Result<f64> {
    if k < 0 {
        return Ok(0.0);
    }
    let base = base_cdf(family, param, k as u64)?;
    if family.zero_inflated() {
        let pi = param.zero_prob.clamp(0.0, 1.0);
        Ok(pi + (1.0 - pi) * base)
    } else {
        Ok(base)
    }
}

/// Smallest `k` with `F(k) >= u`, i.e. the quantile function used to
/// invert latent uniforms back to counts. Exponential search followed by
/// bisection keeps the number of CDF evaluations logarithmic in `k`;
/// the result saturates at `MAX_COUNT` in the extreme upper tail.
pub fn count_quantile(family: CountFamily, param: &CountParam, u: f64) -> anyhow::Result<u64> {
    let u = u.clamp(f64::EPSILON, 1.0 - f64::EPSILON);

    let u = if family.zero_inflated() {
        let pi = param.zero_prob.clamp(0.0, 1.0 - f64::EPSILON);
        if u <= pi {
            return Ok(0);
        }
        (u - pi) / (1.0 - pi)
    } else {
        u
    };

    if base_cdf(family, param, 0)? >= u {
        return Ok(0);
    }

    let mut lo = 0u64;
    let mut hi = (param.mean.max(1.0).ceil() as u64).clamp(1, MAX_COUNT);
    while base_cdf(family, param, hi)? < u {
        if hi >= MAX_COUNT {
            return Ok(MAX_COUNT);
        }
        lo = hi;
        hi = hi.saturating_mul(2).min(MAX_COUNT);
    }
    while hi > lo + 1 {
        let mid = lo + (hi - lo) / 2;
        if base_cdf(family, param, mid)? < u {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(hi)
}

use approx::assert_abs_diff_eq;
use mung::common::Mat;
use mung::copula::*;
use mung::dataset::*;
use mung::extract::extract_parameters;
use mung::marginal::fit_marginals;
use mung::pipeline::*;

use count_param::families::CountFamily;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson};

fn correlated_raw(n: usize, seed: u64) -> RawDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let latent = Normal::new(0.0, 1.0).expect("normal");

    let mut counts = Mat::zeros(n, 3);
    for i in 0..n {
        let f: f64 = latent.sample(&mut rng);
        let mu0 = (8.0_f64.ln() + 0.5 * f).exp();
        let mu1 = (4.0_f64.ln() + 0.5 * f).exp();
        counts[(i, 0)] = Poisson::new(mu0).expect("pois").sample(&mut rng);
        counts[(i, 1)] = Poisson::new(mu1).expect("pois").sample(&mut rng);
        counts[(i, 2)] = Poisson::new(6.0).expect("pois").sample(&mut rng);
    }

    let mut table = CovariateTable::new();
    table
        .add_categorical("cell_type", &vec!["A"; n])
        .expect("column");

    RawDataset::new(
        counts,
        vec!["g0".into(), "g1".into(), "g2".into()],
        table,
    )
}

fn base_config(dependency: DependencyChoice) -> SimulateConfig {
    SimulateConfig {
        family: CountFamily::NegBinomial,
        dependency,
        threads: 2,
        rseed: 5,
        return_model: true,
        ..SimulateConfig::default()
    }
}

#[test]
fn auto_selection_prefers_gaussian_on_correlated_data() {
    let raw = correlated_raw(600, 41);
    let result = simulate(&raw, &base_config(DependencyChoice::Auto), None).expect("simulate");

    assert_eq!(result.diagnostics.dependency.len(), 1);
    let report = &result.diagnostics.dependency[0];
    assert_eq!(report.family.as_ref(), "gaussian");
    assert!(report.aic_gaussian < report.aic_independent);
}

#[test]
fn forced_independent_family_still_synthesizes() {
    let raw = correlated_raw(300, 43);
    let result =
        simulate(&raw, &base_config(DependencyChoice::Independent), None).expect("simulate");

    assert_eq!(
        result.diagnostics.dependency[0].family.as_ref(),
        "independent"
    );
    assert_eq!(result.counts_nd.nrows(), 300);
}

#[test]
fn forced_gaussian_downgrades_degenerate_group() {
    let n = 302;
    let mut raw = correlated_raw(n, 59);
    // two cells are not enough for a joint model; the downgrade has to
    // land in the diagnostics rather than fail or pass silently
    let groups: Vec<&str> = (0..n).map(|i| if i < 300 { "big" } else { "tiny" }).collect();
    raw.covariates
        .add_categorical("corr_group", &groups)
        .expect("column");

    let result = simulate(&raw, &base_config(DependencyChoice::Gaussian), None).expect("simulate");
    assert_eq!(result.counts_nd.nrows(), n);
    assert_eq!(result.diagnostics.dependency.len(), 2);

    for report in result.diagnostics.dependency.iter() {
        match report.group.as_ref() {
            "big" => assert_eq!(report.family.as_ref(), "gaussian"),
            "tiny" => {
                assert_eq!(report.family.as_ref(), "independent");
                assert!(report.aic_gaussian.is_infinite());
            }
            other => panic!("unexpected group {}", other),
        }
    }
}

/// independent, exactly-Poisson genes so the fitted marginal is the
/// true model and the residual law is known
fn poisson_raw(n: usize, seed: u64) -> RawDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut counts = Mat::zeros(n, 3);
    for i in 0..n {
        for (g, &mu) in [8.0, 4.0, 6.0].iter().enumerate() {
            counts[(i, g)] = Poisson::new(mu).expect("pois").sample(&mut rng);
        }
    }
    let mut table = CovariateTable::new();
    table
        .add_categorical("cell_type", &vec!["A"; n])
        .expect("column");
    RawDataset::new(
        counts,
        vec!["g0".into(), "g1".into(), "g2".into()],
        table,
    )
}

#[test]
fn residuals_are_standard_normal_scale() {
    let raw = poisson_raw(800, 47);
    let data = build_modeling_data(
        &raw,
        None,
        &Formula::default(),
        &Formula::default(),
        None,
        2,
    )
    .expect("modeling data");

    let out = fit_marginals(&data, CountFamily::Poisson).expect("marginals");
    let params = extract_parameters(&out.marginals, &raw.covariates).expect("extract");
    let z_nd = gaussian_residuals(&out.y_nd, &params, &out.marginals, 7).expect("residuals");

    // the uniformized CDF transform should leave each gene roughly N(0,1)
    for g in 0..z_nd.ncols() {
        let col = z_nd.column(g);
        let mean = col.mean();
        let sd = (col.map(|z| (z - mean) * (z - mean)).sum() / (z_nd.nrows() - 1) as f64).sqrt();
        assert_abs_diff_eq!(mean, 0.0, epsilon = 0.15);
        assert_abs_diff_eq!(sd, 1.0, epsilon = 0.15);
    }
}

#[test]
fn residual_transform_is_seed_deterministic() {
    let raw = poisson_raw(200, 53);
    let data = build_modeling_data(
        &raw,
        None,
        &Formula::default(),
        &Formula::default(),
        None,
        2,
    )
    .expect("modeling data");

    let out = fit_marginals(&data, CountFamily::Poisson).expect("marginals");
    let params = extract_parameters(&out.marginals, &raw.covariates).expect("extract");

    let a = gaussian_residuals(&out.y_nd, &params, &out.marginals, 7).expect("residuals");
    let b = gaussian_residuals(&out.y_nd, &params, &out.marginals, 7).expect("residuals");
    let c = gaussian_residuals(&out.y_nd, &params, &out.marginals, 8).expect("residuals");

    assert_eq!(a, b);
    assert_ne!(a, c);
}

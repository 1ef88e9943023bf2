use mung::copula::DependencyChoice;
use mung::dataset::*;
use mung::extract::extract_parameters;
use mung::pipeline::*;

use count_param::families::CountFamily;
use count_param::glm::{dispersion_of, mean_of};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};

const GENES: [&str; 5] = ["g0", "g1", "g2", "g3", "g4"];

/// Two cell types; g0 and g1 share a latent factor (positive
/// correlation), g2 is independent, g3 is ~97% zero, g4 is all zero.
fn toy_raw(n_a: usize, n_b: usize, seed: u64) -> RawDataset {
    let n = n_a + n_b;
    let mut rng = StdRng::seed_from_u64(seed);
    let latent = Normal::new(0.0, 1.0).expect("normal");

    let mut counts = mung::common::Mat::zeros(n, GENES.len());
    for i in 0..n {
        let base: f64 = if i < n_a { 5.0 } else { 15.0 };
        let f: f64 = latent.sample(&mut rng);

        let mu0 = (base.ln() + 0.4 * f).exp();
        let mu1 = ((base * 0.6).ln() + 0.4 * f).exp();
        counts[(i, 0)] = Poisson::new(mu0).expect("pois").sample(&mut rng);
        counts[(i, 1)] = Poisson::new(mu1).expect("pois").sample(&mut rng);
        counts[(i, 2)] = Poisson::new(3.0).expect("pois").sample(&mut rng);
        counts[(i, 3)] = if rng.random::<f64>() < 0.97 {
            0.0
        } else {
            1.0 + Poisson::new(1.0).expect("pois").sample(&mut rng)
        };
        counts[(i, 4)] = 0.0;
    }

    let types: Vec<&str> = (0..n).map(|i| if i < n_a { "A" } else { "B" }).collect();
    let mut table = CovariateTable::new();
    table.add_categorical("cell_type", &types).expect("column");

    RawDataset::new(counts, GENES.iter().map(|&g| g.into()).collect(), table)
}

fn toy_config(threads: usize, rseed: u64) -> SimulateConfig {
    SimulateConfig {
        mean_formula: Formula::parse("~ cell_type"),
        corr_formula: Some(Formula::parse("~ cell_type")),
        family: CountFamily::NegBinomial,
        dependency: DependencyChoice::Gaussian,
        threads,
        rseed,
        return_model: true,
        ..SimulateConfig::default()
    }
}

#[test]
fn filtered_genes_are_excluded_and_reported() {
    let raw = toy_raw(150, 150, 11);
    let result = simulate(&raw, &toy_config(2, 7), None).expect("simulate");

    assert!(result
        .diagnostics
        .filtered_genes
        .iter()
        .any(|g| g.as_ref() == "g4"));
    assert!(result.genes.iter().all(|g| g.as_ref() != "g4"));
    assert_eq!(result.counts_nd.ncols(), result.genes.len());
    assert_eq!(result.counts_nd.nrows(), 300);

    if let Some(params) = &result.params {
        assert_eq!(params.genes, result.genes);
    } else {
        panic!("return_model was requested");
    }
}

#[test]
fn same_seed_is_bit_identical_across_worker_counts() {
    let raw = toy_raw(120, 120, 12);

    let one = simulate(&raw, &toy_config(1, 99), None).expect("simulate");
    let four = simulate(&raw, &toy_config(4, 99), None).expect("simulate");
    let again = simulate(&raw, &toy_config(4, 99), None).expect("simulate");

    assert_eq!(one.counts_nd, four.counts_nd);
    assert_eq!(four.counts_nd, again.counts_nd);

    let other = simulate(&raw, &toy_config(4, 100), None).expect("simulate");
    assert_ne!(other.counts_nd, four.counts_nd);
}

#[test]
fn counterfactual_proportions_are_exact() {
    let raw = toy_raw(200, 200, 13);

    // request 20 B cells and 80 A cells; row counts must match exactly
    let n_b = 20;
    let n_rest = 80;
    let types: Vec<&str> = (0..n_b + n_rest)
        .map(|i| if i < n_b { "B" } else { "A" })
        .collect();
    let mut target = CovariateTable::new();
    target.add_categorical("cell_type", &types).expect("column");

    let result = simulate(&raw, &toy_config(2, 7), Some(&target)).expect("simulate");
    assert_eq!(result.counts_nd.nrows(), 100);

    // output rows are aligned with the requested covariate table
    match result.covariates.column("cell_type") {
        Some(Covariate::Categorical(v)) => {
            assert_eq!(v.iter().filter(|t| t.as_ref() == "B").count(), n_b);
            assert_eq!(v.iter().filter(|t| t.as_ref() == "A").count(), n_rest);
        }
        _ => panic!("cell_type column missing from the result"),
    }
}

#[test]
fn absent_groups_yield_no_rows() {
    let raw = toy_raw(150, 150, 17);

    let types = vec!["B"; 60];
    let mut target = CovariateTable::new();
    target.add_categorical("cell_type", &types).expect("column");

    let result = simulate(&raw, &toy_config(2, 7), Some(&target)).expect("simulate");
    assert_eq!(result.counts_nd.nrows(), 60);
}

#[test]
fn unknown_corr_group_is_fatal() {
    let raw = toy_raw(100, 100, 19);

    // intercept-only mean model so the failure is attributable to the
    // dependency group, not the design encoder
    let mut config = toy_config(2, 7);
    config.mean_formula = Formula::default();

    let types = vec!["Z"; 10];
    let mut target = CovariateTable::new();
    target.add_categorical("cell_type", &types).expect("column");

    let err = simulate(&raw, &config, Some(&target)).expect_err("unknown group");
    assert!(err.to_string().contains("corr_group"));
}

#[test]
fn unseen_level_fails_extraction() {
    let raw = toy_raw(100, 100, 23);

    let types = vec!["C"; 10];
    let mut target = CovariateTable::new();
    target.add_categorical("cell_type", &types).expect("column");

    let err = simulate(&raw, &toy_config(2, 7), Some(&target)).expect_err("unseen level");
    assert!(err.to_string().contains("never seen"));
}

#[test]
fn extracted_means_match_group_means() {
    let raw = toy_raw(250, 250, 29);
    let (model, _) = fit_model(&raw, &toy_config(2, 7)).expect("fit");

    let params = extract_parameters(&model.marginals, &raw.covariates).expect("extract");
    let counts = raw.assay(None).expect("assay");

    // g0 is the first retained gene; compare fitted vs. empirical means
    for (lo, hi, label) in [(0usize, 250usize, "A"), (250, 500, "B")] {
        let fitted = params.mean_nd.column(0).rows_range(lo..hi).mean();
        let mut observed = 0.0;
        for i in lo..hi {
            observed += counts[(i, 0)];
        }
        observed /= (hi - lo) as f64;
        let rel = (fitted - observed).abs() / observed;
        assert!(
            rel < 0.1,
            "group {}: fitted {} vs observed {}",
            label,
            fitted,
            observed
        );
    }
}

#[test]
fn extracted_parameters_match_training_time_fits() {
    let raw = toy_raw(150, 150, 37);
    let (model, _) = fit_model(&raw, &toy_config(2, 7)).expect("fit");
    let params = extract_parameters(&model.marginals, &raw.covariates).expect("extract");

    let x_mean = model
        .marginals
        .encoder_mean
        .encode(&raw.covariates)
        .expect("mean design");
    let x_disp = model
        .marginals
        .encoder_disp
        .encode(&raw.covariates)
        .expect("disp design");

    // extraction at the training rows must reproduce the fitted link
    // values for every gene, dispersion included
    for (g, m) in model.marginals.models.iter().enumerate() {
        assert_eq!(
            params.mean_nd.column(g).into_owned(),
            mean_of(&x_mean, &m.mean_coef)
        );
        if m.disp_coef.is_empty() {
            assert!(params.dispersion_nd.column(g).iter().all(|t| t.is_infinite()));
        } else {
            assert_eq!(
                params.dispersion_nd.column(g).into_owned(),
                dispersion_of(&x_disp, &m.disp_coef)
            );
        }
        if m.zero_coef.is_none() {
            assert!(params.zero_prob_nd.column(g).iter().all(|&p| p == 0.0));
        }
    }

    // the Poisson family has no dispersion submodel at all
    let mut pois_config = toy_config(2, 7);
    pois_config.family = CountFamily::Poisson;
    let (pois_model, _) = fit_model(&raw, &pois_config).expect("fit");
    let pois_params = extract_parameters(&pois_model.marginals, &raw.covariates).expect("extract");
    assert!(pois_params.dispersion_nd.iter().all(|t| t.is_infinite()));
}

#[test]
fn important_features_are_tagged_and_uncorrelated() {
    let raw = toy_raw(400, 400, 31);
    let result = simulate(&raw, &toy_config(2, 7), None).expect("simulate");

    assert!(result
        .diagnostics
        .important_features
        .iter()
        .any(|(_, g)| g.as_ref() == "g3"));

    let y = &result.counts_nd;
    let corr = |a: usize, b: usize, lo: usize, hi: usize| -> f64 {
        let m = (hi - lo) as f64;
        let (mut ma, mut mb) = (0.0, 0.0);
        for i in lo..hi {
            ma += y[(i, a)];
            mb += y[(i, b)];
        }
        ma /= m;
        mb /= m;
        let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
        for i in lo..hi {
            let (da, db) = (y[(i, a)] - ma, y[(i, b)] - mb);
            sab += da * db;
            saa += da * da;
            sbb += db * db;
        }
        sab / (saa.sqrt() * sbb.sqrt()).max(1e-12)
    };

    // the correlated pair keeps its sign within each group
    assert!(corr(0, 1, 0, 400) > 0.1, "g0-g1 correlation lost");
    // the independently sampled gene stays near zero correlation
    assert!(corr(0, 3, 0, 400).abs() < 0.15, "g0-g3 spurious correlation");
}

use std::cell::Cell;

use anyhow::Result;
use ndarray::Array2;

use freerate_rs::model::{FreeRateModel, OptAlgorithm, ParamSet};
use freerate_rs::opt::{OptConfig, optimize_parameters};
use freerate_rs::oracle::{LikelihoodOracle, PoissonSiteOracle};

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn skewed_oracle() -> PoissonSiteOracle {
    PoissonSiteOracle::new(
        vec![5.0, 5.0, 5.0, 85.0],
        vec![2.0, 6.0, 10.0, 22.0],
        vec![10.0, 10.0, 10.0, 10.0],
    )
    .expect("oracle init failed")
}

fn seeded_model(algorithm: OptAlgorithm) -> FreeRateModel {
    let mut model = FreeRateModel::new(4, 1.0, true, algorithm).expect("model init failed");
    model.rates = vec![0.2, 0.6, 1.0, 2.2];
    model.prop = vec![0.25, 0.25, 0.25, 0.25];
    model
}

#[test]
fn em_path_converges_to_a_valid_state() {
    let oracle = skewed_oracle();
    let mut model = seeded_model(OptAlgorithm::Em);
    let start = oracle
        .log_likelihood(&model.rates, &model.prop)
        .expect("likelihood failed");

    let ll = optimize_parameters(&mut model, &oracle, 1e-6, &OptConfig::default())
        .expect("optimization failed");
    assert!(ll.is_finite());
    assert!(ll >= start - 1e-9, "optimization lost likelihood");

    let prop_sum: f64 = model.prop.iter().sum();
    approx_eq(prop_sum, 1.0, 1e-9);
    assert!(model.rates_sorted());
    assert_eq!(model.category_count(), 4, "optimization must never resize");
}

#[test]
fn reported_likelihood_matches_restored_state() {
    let oracle = skewed_oracle();
    let mut model = seeded_model(OptAlgorithm::EmThenQuasiNewton);

    let ll = optimize_parameters(&mut model, &oracle, 1e-6, &OptConfig::default())
        .expect("optimization failed");
    let rescored = oracle
        .log_likelihood(&model.rates, &model.prop)
        .expect("likelihood failed");
    approx_eq(ll, rescored, 1e-9);
}

#[test]
fn chained_path_is_at_least_as_good_as_em_alone() {
    let oracle = skewed_oracle();

    let mut em_only = seeded_model(OptAlgorithm::Em);
    let ll_em = optimize_parameters(&mut em_only, &oracle, 1e-6, &OptConfig::default())
        .expect("EM path failed");

    let mut chained = seeded_model(OptAlgorithm::EmThenQuasiNewton);
    let ll_chain = optimize_parameters(&mut chained, &oracle, 1e-6, &OptConfig::default())
        .expect("chained path failed");

    assert!(
        ll_chain >= ll_em - 1e-6,
        "chaining quasi-Newton lost likelihood: {ll_em} -> {ll_chain}"
    );
}

#[test]
fn quasi_newton_path_improves_over_start() {
    let oracle = skewed_oracle();
    let mut model = seeded_model(OptAlgorithm::QuasiNewton);
    let start = oracle
        .log_likelihood(&model.rates, &model.prop)
        .expect("likelihood failed");

    let ll = optimize_parameters(&mut model, &oracle, 1e-6, &OptConfig::default())
        .expect("optimization failed");
    assert!(ll >= start - 1e-9);

    let prop_sum: f64 = model.prop.iter().sum();
    approx_eq(prop_sum, 1.0, 1e-9);
    assert!(model.rates_sorted());
}

#[test]
fn fixed_parameters_are_never_mutated() {
    let oracle = skewed_oracle();
    let mut model = seeded_model(OptAlgorithm::EmThenQuasiNewton);
    model.fix_params = true;
    let rates_before = model.rates.clone();
    let prop_before = model.prop.clone();
    let start = oracle
        .log_likelihood(&model.rates, &model.prop)
        .expect("likelihood failed");

    let ll = optimize_parameters(&mut model, &oracle, 1e-6, &OptConfig::default())
        .expect("optimization failed");
    approx_eq(ll, start, 1e-12);
    assert_eq!(model.rates, rates_before);
    assert_eq!(model.prop, prop_before);
}

#[test]
fn single_category_model_optimizes_trivially() {
    let oracle = skewed_oracle();
    let mut model =
        FreeRateModel::new(1, 1.0, true, OptAlgorithm::EmThenQuasiNewton).expect("model init");
    let start = oracle
        .log_likelihood(&model.rates, &model.prop)
        .expect("likelihood failed");

    let ll = optimize_parameters(&mut model, &oracle, 1e-6, &OptConfig::default())
        .expect("optimization failed");
    assert!(ll.is_finite());
    assert!(ll >= start - 1e-9);
    assert_eq!(model.category_count(), 1);
    approx_eq(model.prop[0], 1.0, 1e-12);
}

/// Delegates to the real oracle until `fail_after` likelihood calls have
/// been made, then reports NaN, driving the EM phase into its abort path.
struct FlakyOracle {
    inner: PoissonSiteOracle,
    calls: Cell<usize>,
    fail_after: usize,
}

impl LikelihoodOracle for FlakyOracle {
    fn log_likelihood(&self, rates: &[f64], prop: &[f64]) -> Result<f64> {
        let n = self.calls.get() + 1;
        self.calls.set(n);
        if n > self.fail_after {
            return Ok(f64::NAN);
        }
        self.inner.log_likelihood(rates, prop)
    }

    fn posterior_weights(&self, rates: &[f64], prop: &[f64]) -> Result<Array2<f64>> {
        self.inner.posterior_weights(rates, prop)
    }

    fn pattern_counts(&self) -> &[f64] {
        self.inner.pattern_counts()
    }
}

#[test]
fn em_numeric_failure_falls_back_to_best_snapshot() {
    let oracle = FlakyOracle {
        inner: skewed_oracle(),
        calls: Cell::new(0),
        // Survives the coordinator's entry check and the EM phase's own
        // starting evaluation, then fails inside the first iteration.
        fail_after: 2,
    };
    let mut model = seeded_model(OptAlgorithm::Em);
    model.optimizing = ParamSet::WeightsOnly;
    let rates_before = model.rates.clone();
    let prop_before = model.prop.clone();
    let start = oracle
        .inner
        .log_likelihood(&model.rates, &model.prop)
        .expect("likelihood failed");

    let ll = optimize_parameters(&mut model, &oracle, 1e-6, &OptConfig::default())
        .expect("optimization failed");
    approx_eq(ll, start, 1e-12);
    assert_eq!(model.rates, rates_before);
    assert_eq!(model.prop, prop_before);
}

struct AlwaysNanOracle {
    inner: PoissonSiteOracle,
}

impl LikelihoodOracle for AlwaysNanOracle {
    fn log_likelihood(&self, _rates: &[f64], _prop: &[f64]) -> Result<f64> {
        Ok(f64::NAN)
    }

    fn posterior_weights(&self, rates: &[f64], prop: &[f64]) -> Result<Array2<f64>> {
        self.inner.posterior_weights(rates, prop)
    }

    fn pattern_counts(&self) -> &[f64] {
        self.inner.pattern_counts()
    }
}

#[test]
fn non_finite_starting_likelihood_is_an_error() {
    let oracle = AlwaysNanOracle {
        inner: skewed_oracle(),
    };
    let mut model = seeded_model(OptAlgorithm::Em);

    let err = optimize_parameters(&mut model, &oracle, 1e-6, &OptConfig::default())
        .expect_err("non-finite start must fail");
    assert!(err.to_string().contains("not finite"));
}

use anyhow::{Result, bail};

use crate::codec::{default_bounds, dimension_count, export_parameters, import_parameters};
use crate::em::{EmConfig, em_train};
use crate::lbfgs::{LbfgsConfig, minimize_bounded};
use crate::model::{FreeRateModel, OptAlgorithm};
use crate::oracle::LikelihoodOracle;
use crate::progress;

/// Objective value handed to the minimizer for candidates that violate an
/// invariant or make the likelihood non-finite. Large but finite, so the
/// line search can back off on its own.
const INFEASIBLE_PENALTY: f64 = 1e10;

#[derive(Debug, Clone, Default)]
pub struct OptConfig {
    pub em: EmConfig,
    pub lbfgs: LbfgsConfig,
    pub progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    RunningEm,
    RunningQuasiNewton,
    Converged,
}

/// Run the model's configured optimization path to convergence and return
/// the best log-likelihood seen. The model is left at the best-scoring
/// parameters, renormalized and (when required) sorted; the category
/// count is never changed here.
///
/// Sign convention, stated once: the quasi-Newton driver minimizes
/// `-lnL`; everything reported from this module is `lnL` itself.
pub fn optimize_parameters<O: LikelihoodOracle>(
    model: &mut FreeRateModel,
    oracle: &O,
    tolerance: f64,
    config: &OptConfig,
) -> Result<f64> {
    let start = oracle.log_likelihood(&model.rates, &model.prop)?;
    if !start.is_finite() {
        bail!("likelihood is not finite at the starting parameters: {start}");
    }
    if model.fix_params {
        return Ok(start);
    }

    let mut best_ll = start;
    let mut best = model.snapshot();

    let mut phase = Phase::Idle;
    loop {
        phase = match phase {
            Phase::Idle => match model.algorithm {
                OptAlgorithm::Em | OptAlgorithm::EmThenQuasiNewton => Phase::RunningEm,
                OptAlgorithm::QuasiNewton => Phase::RunningQuasiNewton,
            },
            Phase::RunningEm => {
                let em_config = EmConfig {
                    tolerance,
                    ..config.em.clone()
                };
                match em_train(model, oracle, &em_config, config.progress)? {
                    Some(ll) if ll > best_ll => {
                        best_ll = ll;
                        best = model.snapshot();
                    }
                    Some(_) => {}
                    // Non-finite likelihood ended the phase early; resume
                    // from the best state seen so far.
                    None => model.restore(&best),
                }
                match model.algorithm {
                    OptAlgorithm::EmThenQuasiNewton => Phase::RunningQuasiNewton,
                    _ => Phase::Converged,
                }
            }
            Phase::RunningQuasiNewton => {
                let ll = quasi_newton_pass(model, oracle, config)?;
                if ll.is_finite() && ll > best_ll {
                    best_ll = ll;
                    best = model.snapshot();
                }
                Phase::Converged
            }
            Phase::Converged => break,
        };
    }

    model.restore(&best);
    model.normalize_proportions();
    if model.sorted_rates {
        model.sort_categories();
    }
    Ok(best_ll)
}

/// One bounded quasi-Newton pass over the free parameters. Each probe of
/// the objective imports the candidate into a scratch clone of the model,
/// so the live state only moves when the driver's final point is adopted.
fn quasi_newton_pass<O: LikelihoodOracle>(
    model: &mut FreeRateModel,
    oracle: &O,
    config: &OptConfig,
) -> Result<f64> {
    let ndim = dimension_count(model);
    if ndim == 0 {
        return oracle.log_likelihood(&model.rates, &model.prop);
    }

    let mut x0 = vec![0.0; ndim];
    export_parameters(model, &mut x0)?;
    let (bounds, fixed) = default_bounds(model);
    // Seed values may sit outside the box after a resize; pull them in.
    for (x, b) in x0.iter_mut().zip(bounds.iter()) {
        *x = x.clamp(b.lo, b.hi);
    }

    let base = model.clone();
    let objective = |v: &[f64]| -> f64 {
        let mut candidate = base.clone();
        match import_parameters(&mut candidate, v) {
            Ok(true) => {}
            _ => return INFEASIBLE_PENALTY,
        }
        match oracle.log_likelihood(&candidate.rates, &candidate.prop) {
            Ok(ll) if ll.is_finite() => -ll,
            _ => INFEASIBLE_PENALTY,
        }
    };

    let pb = if config.progress {
        Some(progress::spinner("BFGS", "joint rate/weight pass"))
    } else {
        None
    };
    let xbest = minimize_bounded(objective, &x0, &bounds, &fixed, &config.lbfgs)?;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    if !import_parameters(model, &xbest)? {
        // The driver should never hand back an infeasible point; keep the
        // starting state if it does.
        return oracle.log_likelihood(&model.rates, &model.prop);
    }
    model.normalize_proportions();
    if model.sorted_rates {
        model.sort_categories();
    }
    oracle.log_likelihood(&model.rates, &model.prop)
}

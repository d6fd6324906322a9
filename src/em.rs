use anyhow::{Result, bail};

use crate::model::{FreeRateModel, MAX_RATE, MIN_PROP, MIN_RATE, ParamSet};
use crate::oracle::LikelihoodOracle;
use crate::progress;

#[derive(Debug, Clone)]
pub struct EmConfig {
    pub max_iters: usize,
    pub tolerance: f64,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            max_iters: 100,
            tolerance: 1e-4,
        }
    }
}

const GOLDEN: f64 = 0.618_033_988_749_895;
const RATE_TOL: f64 = 1e-6;

/// Fit proportions (and rates, when the active parameter set allows) by
/// expectation-maximization against the oracle's posterior weights.
///
/// Returns `Ok(Some(loglike))` on completion, `Ok(None)` when the oracle
/// produced a non-finite likelihood and the phase was abandoned (the
/// coordinator falls back to its snapshot), `Err` on contract violations.
pub fn em_train<O: LikelihoodOracle>(
    model: &mut FreeRateModel,
    oracle: &O,
    config: &EmConfig,
    progress_enabled: bool,
) -> Result<Option<f64>> {
    let ncat = model.category_count();
    let counts = oracle.pattern_counts().to_vec();
    let total: f64 = counts.iter().sum();
    if !(total > 0.0) {
        bail!("oracle reports no observed sites");
    }

    let mut loglike = oracle.log_likelihood(&model.rates, &model.prop)?;
    if !loglike.is_finite() {
        return Ok(None);
    }

    let pb = if progress_enabled {
        Some(progress::spinner("EM", "estimating rate mixture"))
    } else {
        None
    };

    for iter in 0..config.max_iters {
        let weights = oracle.posterior_weights(&model.rates, &model.prop)?;
        if weights.nrows() != counts.len() || weights.ncols() != ncat {
            bail!(
                "posterior weight matrix is {}x{}, expected {}x{}",
                weights.nrows(),
                weights.ncols(),
                counts.len(),
                ncat
            );
        }

        if model.optimizing != ParamSet::RatesOnly {
            // M-step for the mixture weights: multiplicity-weighted
            // posterior mass, floored so no category collapses.
            for k in 0..ncat {
                let mass: f64 = weights
                    .column(k)
                    .iter()
                    .zip(counts.iter())
                    .map(|(w, c)| w * c)
                    .sum();
                model.prop[k] = (mass / total).max(MIN_PROP);
            }
            model.normalize_proportions();
        }

        if model.optimizing != ParamSet::WeightsOnly {
            update_rates(model, oracle)?;
        }

        if model.sorted_rates {
            model.sort_categories();
        }

        let next = oracle.log_likelihood(&model.rates, &model.prop)?;
        if !next.is_finite() {
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            return Ok(None);
        }
        let gain = next - loglike;
        loglike = next;
        if let Some(pb) = &pb {
            pb.set_message(format!("iter {} lnL {loglike:.4}", iter + 1));
        }
        if gain < config.tolerance {
            break;
        }
    }

    if let Some(pb) = pb {
        pb.finish_with_message(format!("done, lnL {loglike:.4}"));
    }
    Ok(Some(loglike))
}

/// One M-step over the rates: each category rate moves through a bounded
/// 1-D golden-section ascent of the oracle likelihood, accepted only when
/// it does not lose likelihood. Under `sorted_rates` the search window is
/// clamped between the neighboring rates so category identity is stable.
fn update_rates<O: LikelihoodOracle>(model: &mut FreeRateModel, oracle: &O) -> Result<()> {
    let ncat = model.category_count();
    for k in 0..ncat {
        let (lo, hi) = rate_window(model, k);
        if hi - lo < RATE_TOL {
            continue;
        }
        let base = oracle.log_likelihood(&model.rates, &model.prop)?;
        if !base.is_finite() {
            continue;
        }
        let (best_rate, best_ll) = maximize_rate(model, oracle, k, lo, hi)?;
        if best_ll > base {
            model.rates[k] = best_rate;
        }
    }
    Ok(())
}

fn rate_window(model: &FreeRateModel, k: usize) -> (f64, f64) {
    if !model.sorted_rates {
        return (MIN_RATE, MAX_RATE);
    }
    let lo = if k == 0 {
        MIN_RATE
    } else {
        model.rates[k - 1].max(MIN_RATE)
    };
    let hi = if k + 1 == model.category_count() {
        MAX_RATE
    } else {
        model.rates[k + 1].min(MAX_RATE)
    };
    (lo, hi)
}

fn maximize_rate<O: LikelihoodOracle>(
    model: &mut FreeRateModel,
    oracle: &O,
    k: usize,
    lo: f64,
    hi: f64,
) -> Result<(f64, f64)> {
    let mut eval = |r: f64, model: &mut FreeRateModel| -> Result<f64> {
        let old = model.rates[k];
        model.rates[k] = r;
        let ll = oracle.log_likelihood(&model.rates, &model.prop)?;
        model.rates[k] = old;
        Ok(if ll.is_finite() { ll } else { f64::NEG_INFINITY })
    };

    let mut a = lo;
    let mut b = hi;
    let mut c = b - GOLDEN * (b - a);
    let mut d = a + GOLDEN * (b - a);
    let mut fc = eval(c, model)?;
    let mut fd = eval(d, model)?;
    for _ in 0..48 {
        if b - a < RATE_TOL {
            break;
        }
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - GOLDEN * (b - a);
            fc = eval(c, model)?;
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + GOLDEN * (b - a);
            fd = eval(d, model)?;
        }
    }
    if fc >= fd { Ok((c, fc)) } else { Ok((d, fd)) }
}

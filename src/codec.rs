//! Packing of free-rate parameters into the flat vector consumed by the
//! bound-constrained optimizer.
//!
//! Buffers are plain 0-indexed slices. Packing order: the first `K - 1`
//! proportions (the last proportion is dependent, `1 - sum(others)`),
//! followed by all `K` rates; a `WeightsOnly` or `RatesOnly` pass exposes
//! only its half of the vector.

use anyhow::{Result, bail};

use crate::lbfgs::Bounds;
use crate::model::{FreeRateModel, MAX_RATE, MIN_PROP, MIN_RATE, ParamSet};

/// Number of free scalar parameters exposed to the optimizer.
pub fn dimension_count(model: &FreeRateModel) -> usize {
    let ncat = model.category_count();
    match model.optimizing {
        ParamSet::WeightsOnly => ncat - 1,
        ParamSet::RatesOnly => ncat,
        ParamSet::Joint => 2 * ncat - 1,
    }
}

pub fn export_parameters(model: &FreeRateModel, vector: &mut [f64]) -> Result<()> {
    let ndim = dimension_count(model);
    if vector.len() != ndim {
        bail!(
            "parameter buffer holds {} slots but the model exposes {} dimensions",
            vector.len(),
            ndim
        );
    }
    let ncat = model.category_count();
    let mut i = 0;
    if model.optimizing != ParamSet::RatesOnly {
        for k in 0..ncat - 1 {
            vector[i] = model.prop[k];
            i += 1;
        }
    }
    if model.optimizing != ParamSet::WeightsOnly {
        for k in 0..ncat {
            vector[i] = model.rates[k];
            i += 1;
        }
    }
    Ok(())
}

/// Exact inverse of [`export_parameters`]. Returns `Ok(false)` without
/// touching the model when the candidate is infeasible: the dependent
/// proportion would drop below [`MIN_PROP`], or the rate ladder decreases
/// while `sorted_rates` is set. The objective adapter turns that into a
/// penalty value instead of committing the candidate.
pub fn import_parameters(model: &mut FreeRateModel, vector: &[f64]) -> Result<bool> {
    let ndim = dimension_count(model);
    if vector.len() != ndim {
        bail!(
            "parameter buffer holds {} slots but the model exposes {} dimensions",
            vector.len(),
            ndim
        );
    }
    let ncat = model.category_count();
    let mut prop = model.prop.clone();
    let mut rates = model.rates.clone();
    let mut i = 0;
    if model.optimizing != ParamSet::RatesOnly {
        let mut head = 0.0;
        for k in 0..ncat - 1 {
            prop[k] = vector[i];
            head += vector[i];
            i += 1;
        }
        prop[ncat - 1] = 1.0 - head;
        if prop[ncat - 1] < MIN_PROP {
            return Ok(false);
        }
    }
    if model.optimizing != ParamSet::WeightsOnly {
        for k in 0..ncat {
            rates[k] = vector[i];
            i += 1;
        }
        if model.sorted_rates && !rates.windows(2).all(|w| w[0] <= w[1]) {
            return Ok(false);
        }
    }
    model.prop = prop;
    model.rates = rates;
    Ok(true)
}

/// Per-dimension box constraints and fixed flags, in packing order.
pub fn default_bounds(model: &FreeRateModel) -> (Vec<Bounds>, Vec<bool>) {
    let ncat = model.category_count();
    let mut bounds = Vec::with_capacity(dimension_count(model));
    if model.optimizing != ParamSet::RatesOnly {
        for _ in 0..ncat - 1 {
            bounds.push(Bounds {
                lo: MIN_PROP,
                hi: 1.0 - MIN_PROP,
            });
        }
    }
    if model.optimizing != ParamSet::WeightsOnly {
        for _ in 0..ncat {
            bounds.push(Bounds {
                lo: MIN_RATE,
                hi: MAX_RATE,
            });
        }
    }
    let fixed = vec![model.fix_params; bounds.len()];
    (bounds, fixed)
}

pub fn compute_bounds(
    model: &FreeRateModel,
    lower: &mut [f64],
    upper: &mut [f64],
    fixed: &mut [bool],
) -> Result<()> {
    let ndim = dimension_count(model);
    if lower.len() != ndim || upper.len() != ndim || fixed.len() != ndim {
        bail!("bounds buffers must all hold {ndim} dimensions");
    }
    let (bounds, flags) = default_bounds(model);
    for i in 0..ndim {
        lower[i] = bounds[i].lo;
        upper[i] = bounds[i].hi;
        fixed[i] = flags[i];
    }
    Ok(())
}

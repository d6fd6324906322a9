use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::io::params::{FreeRateParamsFile, save_params};
use crate::utils::weighted_mean;

/// Smallest proportion a category may hold; keeps every category observable.
pub const MIN_PROP: f64 = 1e-4;
/// Lower bound on a category rate during optimization.
pub const MIN_RATE: f64 = 1e-4;
/// Upper bound on a category rate during optimization.
pub const MAX_RATE: f64 = 100.0;

/// Which parameter arrays the current optimization pass may mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamSet {
    /// Rates and proportions move together (joint quasi-Newton pass).
    Joint,
    RatesOnly,
    WeightsOnly,
}

/// Optimization strategy chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptAlgorithm {
    QuasiNewton,
    Em,
    EmThenQuasiNewton,
}

/// Capability surface a rate-heterogeneity model exposes to the owning
/// inference context. Implementations are plain values selected at
/// construction, not a hierarchy.
pub trait RateModel {
    fn category_count(&self) -> usize;
    fn rate_of(&self, category: usize) -> f64;
    fn proportion_of(&self, category: usize) -> f64;

    /// Proportion-weighted mean rate, ~1 unless the model was rescaled.
    fn mean_rate(&self) -> f64 {
        (0..self.category_count())
            .map(|k| self.rate_of(k) * self.proportion_of(k))
            .sum()
    }
}

/// Saved `(rates, proportions)` state, used by the optimization
/// coordinator to remember and restore the best-scoring parameters.
#[derive(Debug, Clone)]
pub struct CategorySnapshot {
    rates: Vec<f64>,
    prop: Vec<f64>,
}

/// Discrete mixture of rate categories with independently estimated rates
/// and proportions. Proportions sum to 1 at every observation point; when
/// `sorted_rates` is set the rate ladder is non-decreasing after every
/// completed update.
#[derive(Debug, Clone)]
pub struct FreeRateModel {
    ncat: usize,
    pub rates: Vec<f64>,
    pub prop: Vec<f64>,
    pub sorted_rates: bool,
    pub fix_params: bool,
    pub optimizing: ParamSet,
    pub algorithm: OptAlgorithm,
}

impl FreeRateModel {
    pub fn new(
        ncat: usize,
        alpha: f64,
        sorted_rates: bool,
        algorithm: OptAlgorithm,
    ) -> Result<Self> {
        if ncat == 0 {
            bail!("free-rate model needs at least one category");
        }
        if !(alpha > 0.0) {
            bail!("initial shape must be positive, got {alpha}");
        }
        let mut model = Self {
            ncat,
            rates: vec![1.0; ncat],
            prop: vec![1.0 / ncat as f64; ncat],
            sorted_rates,
            fix_params: false,
            optimizing: ParamSet::Joint,
            algorithm,
        };
        model.seed_rates(alpha);
        Ok(model)
    }

    /// Spread the initial rates over quantile midpoints of a Gamma-like
    /// curve with shape `alpha`, then bring the mean rate back to 1.
    fn seed_rates(&mut self, alpha: f64) {
        let n = self.ncat as f64;
        for k in 0..self.ncat {
            let u = (2 * k + 1) as f64 / (2.0 * n);
            self.rates[k] = u.powf(1.0 / alpha).max(MIN_RATE);
        }
        self.rescale_rates();
    }

    pub fn category_count(&self) -> usize {
        self.ncat
    }

    pub fn rate_of(&self, category: usize) -> f64 {
        self.rates[category]
    }

    pub fn proportion_of(&self, category: usize) -> f64 {
        self.prop[category]
    }

    pub fn mean_rate(&self) -> f64 {
        weighted_mean(&self.rates, &self.prop)
    }

    /// Rescale all rates so the mean rate is exactly 1. Returns the factor
    /// applied, so the caller can compensate branch lengths.
    pub fn rescale_rates(&mut self) -> f64 {
        let factor = 1.0 / self.mean_rate();
        for r in self.rates.iter_mut() {
            *r *= factor;
        }
        factor
    }

    pub fn normalize_proportions(&mut self) {
        let sum: f64 = self.prop.iter().sum();
        for p in self.prop.iter_mut() {
            *p /= sum;
        }
    }

    /// Joint sort by rate; each proportion travels with its rate.
    pub fn sort_categories(&mut self) {
        let mut pairs: Vec<(f64, f64)> = self
            .rates
            .iter()
            .copied()
            .zip(self.prop.iter().copied())
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (k, (r, p)) in pairs.into_iter().enumerate() {
            self.rates[k] = r;
            self.prop[k] = p;
        }
    }

    pub fn rates_sorted(&self) -> bool {
        self.rates.windows(2).all(|w| w[0] <= w[1])
    }

    /// Change the number of categories. Overlapping entries keep their
    /// values; new categories extend the rate ladder past its current top
    /// and the proportions renormalize to restore the sum-to-one
    /// invariant. Must not be called while an optimization pass borrows
    /// the model (the exclusive borrow makes that unrepresentable).
    pub fn set_ncategory(&mut self, ncat: usize) -> Result<()> {
        if ncat == 0 {
            bail!("cannot resize free-rate model to zero categories");
        }
        if ncat == self.ncat {
            return Ok(());
        }
        if ncat < self.ncat {
            self.rates.truncate(ncat);
            self.prop.truncate(ncat);
        } else {
            let step = if self.ncat >= 2 {
                (self.rates[self.ncat - 1] / self.rates[self.ncat - 2]).max(1.1)
            } else {
                2.0
            };
            let share = 1.0 / ncat as f64;
            for _ in self.ncat..ncat {
                let top = self.rates[self.rates.len() - 1];
                self.rates.push((top * step).min(MAX_RATE));
                self.prop.push(share);
            }
        }
        self.ncat = ncat;
        self.normalize_proportions();
        if self.sorted_rates {
            self.sort_categories();
        }
        Ok(())
    }

    pub fn snapshot(&self) -> CategorySnapshot {
        CategorySnapshot {
            rates: self.rates.clone(),
            prop: self.prop.clone(),
        }
    }

    pub fn restore(&mut self, snap: &CategorySnapshot) {
        self.rates.clone_from(&snap.rates);
        self.prop.clone_from(&snap.prop);
    }

    /// Model name with parameters, e.g. `+R4{0.2500:0.2100,...}` with one
    /// `proportion:rate` pair per category.
    pub fn name_params(&self) -> String {
        let pairs: Vec<String> = self
            .prop
            .iter()
            .zip(self.rates.iter())
            .map(|(p, r)| format!("{p:.4}:{r:.4}"))
            .collect();
        format!("+R{}{{{}}}", self.ncat, pairs.join(","))
    }

    /// Print the category table the way a run log reports it.
    pub fn write_info(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "Site proportions and rates:")?;
        for k in 0..self.ncat {
            writeln!(
                out,
                "  category {}: proportion {:.5}, rate {:.5}",
                k + 1,
                self.prop[k],
                self.rates[k]
            )?;
        }
        Ok(())
    }

    pub fn to_params(&self) -> FreeRateParamsFile {
        FreeRateParamsFile {
            ncat: self.ncat,
            rates: self.rates.clone(),
            prop: self.prop.clone(),
            sorted_rates: self.sorted_rates,
            algorithm: self.algorithm,
        }
    }

    pub fn from_params(params: &FreeRateParamsFile) -> Result<Self> {
        if params.ncat == 0 {
            bail!("params file declares zero categories");
        }
        if params.rates.len() != params.ncat || params.prop.len() != params.ncat {
            bail!(
                "params file arrays have {} rates and {} proportions, expected {}",
                params.rates.len(),
                params.prop.len(),
                params.ncat
            );
        }
        if params.rates.iter().any(|r| !(*r > 0.0)) {
            bail!("params file contains a non-positive rate");
        }
        let sum: f64 = params.prop.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            bail!("proportions in params file sum to {sum}, expected 1");
        }
        let mut model = Self {
            ncat: params.ncat,
            rates: params.rates.clone(),
            prop: params.prop.clone(),
            sorted_rates: params.sorted_rates,
            fix_params: false,
            optimizing: ParamSet::Joint,
            algorithm: params.algorithm,
        };
        model.normalize_proportions();
        if model.sorted_rates {
            model.sort_categories();
        }
        Ok(model)
    }

    pub fn save_params(&self, path: &Path) -> Result<()> {
        save_params(path, &self.to_params())
    }
}

impl RateModel for FreeRateModel {
    fn category_count(&self) -> usize {
        self.ncat
    }

    fn rate_of(&self, category: usize) -> f64 {
        self.rates[category]
    }

    fn proportion_of(&self, category: usize) -> f64 {
        self.prop[category]
    }

    fn mean_rate(&self) -> f64 {
        FreeRateModel::mean_rate(self)
    }
}

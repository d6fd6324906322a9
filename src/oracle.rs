use anyhow::{Result, bail};
use ndarray::Array2;

use crate::utils::logsumexp;

/// Tree/alignment likelihood evaluator consumed by the estimators.
///
/// Implementations own the alignment patterns and the phylogeny; the
/// estimators only see aggregate quantities. Rows of the posterior matrix
/// follow `pattern_counts` order and sum to 1.
pub trait LikelihoodOracle {
    /// Log-likelihood of the data under the given category assignment.
    fn log_likelihood(&self, rates: &[f64], prop: &[f64]) -> Result<f64>;

    /// Posterior probability that each site pattern belongs to each
    /// category, given the current assignment (mixture E-step).
    fn posterior_weights(&self, rates: &[f64], prop: &[f64]) -> Result<Array2<f64>>;

    /// Multiplicity of each site pattern in the underlying alignment.
    fn pattern_counts(&self) -> &[f64];
}

/// Reference oracle over Poisson substitution counts: pattern `s` carries
/// `subs[s]` observed substitutions over a branch-length exposure
/// `exposure[s]`, so the per-category likelihood responds smoothly to the
/// category rate. Used by the integration tests and as a fitting sanity
/// check; a real tree evaluator replaces it in production.
#[derive(Debug, Clone)]
pub struct PoissonSiteOracle {
    counts: Vec<f64>,
    subs: Vec<f64>,
    exposure: Vec<f64>,
}

impl PoissonSiteOracle {
    pub fn new(counts: Vec<f64>, subs: Vec<f64>, exposure: Vec<f64>) -> Result<Self> {
        if counts.len() != subs.len() || counts.len() != exposure.len() {
            bail!(
                "pattern arrays disagree: {} counts, {} substitution counts, {} exposures",
                counts.len(),
                subs.len(),
                exposure.len()
            );
        }
        if counts.is_empty() {
            bail!("oracle needs at least one site pattern");
        }
        if counts.iter().any(|c| !(*c > 0.0)) {
            bail!("pattern counts must be positive");
        }
        if exposure.iter().any(|t| !(*t > 0.0)) {
            bail!("pattern exposures must be positive");
        }
        if subs.iter().any(|n| *n < 0.0) {
            bail!("substitution counts must be non-negative");
        }
        Ok(Self {
            counts,
            subs,
            exposure,
        })
    }

    /// `log(prop_k) + n_s ln(r_k t_s) - r_k t_s` per category; the `n_s!`
    /// term is constant in the parameters and dropped.
    fn site_log_components(&self, s: usize, rates: &[f64], prop: &[f64]) -> Vec<f64> {
        rates
            .iter()
            .zip(prop.iter())
            .map(|(r, p)| {
                let mean = r * self.exposure[s];
                if self.subs[s] > 0.0 {
                    p.ln() + self.subs[s] * mean.ln() - mean
                } else {
                    p.ln() - mean
                }
            })
            .collect()
    }
}

impl LikelihoodOracle for PoissonSiteOracle {
    fn log_likelihood(&self, rates: &[f64], prop: &[f64]) -> Result<f64> {
        let mut total = 0.0;
        for s in 0..self.counts.len() {
            let comps = self.site_log_components(s, rates, prop);
            total += self.counts[s] * logsumexp(&comps);
        }
        Ok(total)
    }

    fn posterior_weights(&self, rates: &[f64], prop: &[f64]) -> Result<Array2<f64>> {
        let mut weights = Array2::zeros((self.counts.len(), rates.len()));
        for s in 0..self.counts.len() {
            let comps = self.site_log_components(s, rates, prop);
            let lse = logsumexp(&comps);
            for (k, c) in comps.iter().enumerate() {
                weights[(s, k)] = (c - lse).exp();
            }
        }
        Ok(weights)
    }

    fn pattern_counts(&self) -> &[f64] {
        &self.counts
    }
}

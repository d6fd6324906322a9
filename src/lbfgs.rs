//! Bound-constrained limited-memory quasi-Newton minimizer.
//!
//! Box constraints are handled by a logit transform into an unconstrained
//! space; gradients are central finite differences in that space. The
//! minimizer drives an opaque objective and knows nothing about the model
//! behind it.

use anyhow::{Result, bail};

use crate::utils::{logit, sigmoid};

#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub lo: f64,
    pub hi: f64,
}

#[derive(Debug, Clone)]
pub struct LbfgsConfig {
    pub max_iters: usize,
    pub memory: usize,
    pub grad_eps: f64,
    pub line_search_c1: f64,
    pub max_ls_steps: usize,
    pub tol_grad: f64,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            max_iters: 100,
            memory: 7,
            grad_eps: 1e-5,
            line_search_c1: 1e-4,
            max_ls_steps: 20,
            tol_grad: 1e-6,
        }
    }
}

fn to_unconstrained(params: &[f64], bounds: &[Bounds]) -> Vec<f64> {
    params
        .iter()
        .zip(bounds.iter())
        .map(|(x, b)| {
            let z = ((x - b.lo) / (b.hi - b.lo)).clamp(1e-12, 1.0 - 1e-12);
            logit(z)
        })
        .collect()
}

fn from_unconstrained(p: &[f64], bounds: &[Bounds]) -> Vec<f64> {
    p.iter()
        .zip(bounds.iter())
        .map(|(v, b)| b.lo + (b.hi - b.lo) * sigmoid(*v))
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn numerical_grad<F: FnMut(&[f64]) -> f64>(
    f: &mut F,
    x: &[f64],
    bounds: &[Bounds],
    fixed: &[bool],
    eps: f64,
) -> Vec<f64> {
    let mut grad = vec![0.0; x.len()];
    for i in 0..x.len() {
        if fixed[i] {
            continue;
        }
        let step = eps * x[i].abs().max(1.0);
        let mut p1 = x.to_vec();
        let mut p2 = x.to_vec();
        p1[i] += step;
        p2[i] -= step;
        let f1 = f(&from_unconstrained(&p1, bounds));
        let f2 = f(&from_unconstrained(&p2, bounds));
        grad[i] = (f1 - f2) / (2.0 * step);
    }
    grad
}

/// Minimize `f` within `bounds`, starting from `x0`. Dimensions flagged in
/// `fixed` keep their starting value. Returns the best accepted point in
/// the original (constrained) space.
pub fn minimize_bounded<F: FnMut(&[f64]) -> f64>(
    mut f: F,
    x0: &[f64],
    bounds: &[Bounds],
    fixed: &[bool],
    config: &LbfgsConfig,
) -> Result<Vec<f64>> {
    if x0.len() != bounds.len() || x0.len() != fixed.len() {
        bail!(
            "optimizer buffers disagree: {} parameters, {} bounds, {} fixed flags",
            x0.len(),
            bounds.len(),
            fixed.len()
        );
    }
    if x0.is_empty() || fixed.iter().all(|&b| b) {
        return Ok(x0.to_vec());
    }

    let mut xk = to_unconstrained(x0, bounds);
    let mut gk = numerical_grad(&mut f, &xk, bounds, fixed, config.grad_eps);

    let mut s_hist: Vec<Vec<f64>> = Vec::new();
    let mut y_hist: Vec<Vec<f64>> = Vec::new();
    let mut rho_hist: Vec<f64> = Vec::new();

    for _ in 0..config.max_iters {
        if norm(&gk) < config.tol_grad {
            break;
        }

        // Two-loop recursion for the search direction r = -H * g.
        let mut q = gk.clone();
        let mut alpha = vec![0.0; s_hist.len()];
        for i in (0..s_hist.len()).rev() {
            let rho = rho_hist[i];
            let a = rho * dot(&s_hist[i], &q);
            alpha[i] = a;
            for j in 0..q.len() {
                q[j] -= a * y_hist[i][j];
            }
        }
        let mut r = if let Some(last) = y_hist.last() {
            let s_last = &s_hist[s_hist.len() - 1];
            let ys = dot(last, s_last);
            let yy = dot(last, last);
            let h0 = if yy > 0.0 { ys / yy } else { 1.0 };
            q.iter().map(|v| v * h0).collect::<Vec<f64>>()
        } else {
            q.clone()
        };
        for i in 0..s_hist.len() {
            let rho = rho_hist[i];
            let beta = rho * dot(&y_hist[i], &r);
            for j in 0..r.len() {
                r[j] += s_hist[i][j] * (alpha[i] - beta);
            }
        }
        for (v, &fix) in r.iter_mut().zip(fixed.iter()) {
            *v = if fix { 0.0 } else { -*v };
        }

        // Backtracking Armijo line search.
        let f0 = f(&from_unconstrained(&xk, bounds));
        let gdotp = dot(&gk, &r);
        let mut step = 1.0;
        let mut x_new = xk.clone();
        let mut ls_ok = false;
        for _ in 0..config.max_ls_steps {
            for i in 0..xk.len() {
                x_new[i] = xk[i] + step * r[i];
            }
            let f_new = f(&from_unconstrained(&x_new, bounds));
            if f_new <= f0 + config.line_search_c1 * step * gdotp {
                ls_ok = true;
                break;
            }
            step *= 0.5;
        }
        if !ls_ok {
            break;
        }

        let g_new = numerical_grad(&mut f, &x_new, bounds, fixed, config.grad_eps);
        let mut s = vec![0.0; xk.len()];
        let mut y = vec![0.0; xk.len()];
        for i in 0..xk.len() {
            s[i] = x_new[i] - xk[i];
            y[i] = g_new[i] - gk[i];
        }
        let ys = dot(&y, &s);
        if ys > 1e-12 {
            if s_hist.len() == config.memory {
                s_hist.remove(0);
                y_hist.remove(0);
                rho_hist.remove(0);
            }
            s_hist.push(s);
            y_hist.push(y);
            rho_hist.push(1.0 / ys);
        }
        xk = x_new;
        gk = g_new;
    }

    Ok(from_unconstrained(&xk, bounds))
}

//! Propensity models for refinement.
//!
//! - [`LogitModel`]: logistic regression fitted by Newton–Raphson (IRLS) with
//!   step halving.
//! - [`CbpsModel`]: just-identified covariate balancing propensity score for
//!   the treated population. The balance moments
//!   `Σ_i (T_i − (1−T_i)·π_i/(1−π_i))·x̃_i = 0` are the gradient of the convex
//!   objective `Σ_{T=0} exp(x̃ᵀβ) − Σ_{T=1} x̃ᵀβ`, which is minimized by damped
//!   Newton. The solution exists iff the treated covariate mean lies inside
//!   the convex hull of the controls; otherwise the iterates diverge and the
//!   fit reports non-convergence.
//!
//! Both solvers standardize covariates internally and drop constant columns;
//! fitted probabilities are invariant to that reparameterisation.
//!
//! # References
//!
//! - Imai & Ratkovic (2014), "Covariate balancing propensity score."
//!   *JRSS-B* 76(1).

use nalgebra::{DMatrix, DVector};
use pm_core::{Error, PropensityModel, Result};

use crate::math::{exp_clamped, log1pexp, sigmoid};

/// Coefficients beyond this (standardized scale) signal separation.
const DIVERGENCE_BOUND: f64 = 30.0;

/// Standardized design with an intercept column.
struct Design {
    x: DMatrix<f64>,
    y: Vec<bool>,
}

impl Design {
    fn new(x: &[f64], p: usize, treated: &[bool]) -> Result<Self> {
        let n = treated.len();
        if x.len() != n * p {
            return Err(Error::Validation(format!("x length ({}) != n*p ({})", x.len(), n * p)));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("covariates must be finite".into()));
        }
        let n_treated = treated.iter().filter(|&&t| t).count();
        if n_treated == 0 || n_treated == n {
            return Err(Error::RefinementConvergence(
                "propensity model needs both treated and control rows".into(),
            ));
        }

        let mut cols: Vec<Vec<f64>> = vec![vec![1.0; n]];
        for j in 0..p {
            let col: Vec<f64> = (0..n).map(|i| x[i * p + j]).collect();
            let mean = col.iter().sum::<f64>() / n as f64;
            let var = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
            if var <= 1e-24 {
                continue;
            }
            let sd = var.sqrt();
            cols.push(col.iter().map(|v| (v - mean) / sd).collect());
        }
        let k = cols.len();
        let x = DMatrix::from_fn(n, k, |i, j| cols[j][i]);
        Ok(Self { x, y: treated.to_vec() })
    }

    fn eta(&self, beta: &DVector<f64>) -> DVector<f64> {
        &self.x * beta
    }
}

/// Logistic regression propensity model.
#[derive(Debug, Clone)]
pub struct LogitModel {
    max_iter: usize,
    tol: f64,
}

impl Default for LogitModel {
    fn default() -> Self {
        Self { max_iter: 100, tol: 1e-8 }
    }
}

impl LogitModel {
    /// Set maximum Newton iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set step-size convergence tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    fn nll(design: &Design, beta: &DVector<f64>) -> f64 {
        design
            .eta(beta)
            .iter()
            .zip(&design.y)
            .map(|(&e, &t)| if t { log1pexp(-e) } else { log1pexp(e) })
            .sum()
    }

    /// Fit and return fitted probabilities.
    fn fit(&self, design: &Design) -> Result<Vec<f64>> {
        let (n, k) = design.x.shape();
        let mut beta = DVector::<f64>::zeros(k);
        let mut nll = Self::nll(design, &beta);

        for iter in 0..self.max_iter {
            let eta = design.eta(&beta);
            let mu: Vec<f64> = eta.iter().map(|&e| sigmoid(e)).collect();
            let mut grad = DVector::<f64>::zeros(k);
            let mut info = DMatrix::<f64>::zeros(k, k);
            for i in 0..n {
                let row = design.x.row(i);
                let r = if design.y[i] { 1.0 } else { 0.0 } - mu[i];
                let w = mu[i] * (1.0 - mu[i]);
                for a in 0..k {
                    grad[a] += row[a] * r;
                    for b in 0..k {
                        info[(a, b)] += w * row[a] * row[b];
                    }
                }
            }

            let Some(chol) = info.cholesky() else {
                return Err(Error::RefinementConvergence(format!(
                    "logit: singular information matrix at iteration {iter}"
                )));
            };
            let delta = chol.solve(&grad);

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..30 {
                let candidate = &beta + &delta * step;
                let cand_nll = Self::nll(design, &candidate);
                if cand_nll.is_finite() && cand_nll <= nll + 1e-12 {
                    accepted = Some((candidate, cand_nll));
                    break;
                }
                step *= 0.5;
            }
            let Some((next, next_nll)) = accepted else {
                return Err(Error::RefinementConvergence("logit: line search failed".into()));
            };
            beta = next;
            nll = next_nll;

            if beta.amax() > DIVERGENCE_BOUND {
                return Err(Error::RefinementConvergence(
                    "logit: coefficients diverge (perfect separation)".into(),
                ));
            }
            if (&delta * step).amax() < self.tol {
                let probs: Vec<f64> = design.eta(&beta).iter().map(|&e| sigmoid(e)).collect();
                let separated = probs
                    .iter()
                    .zip(&design.y)
                    .all(|(&p, &t)| if t { p > 1.0 - 1e-8 } else { p < 1e-8 });
                if separated {
                    return Err(Error::RefinementConvergence(
                        "logit: fitted probabilities collapse to 0/1 (perfect separation)".into(),
                    ));
                }
                return Ok(probs);
            }
        }
        Err(Error::RefinementConvergence(format!(
            "logit: no convergence after {} iterations",
            self.max_iter
        )))
    }
}

impl PropensityModel for LogitModel {
    fn fit_scores(&self, x: &[f64], p: usize, treated: &[bool]) -> Result<Vec<f64>> {
        let design = Design::new(x, p, treated)?;
        self.fit(&design)
    }

    fn name(&self) -> &str {
        "logit"
    }
}

/// Covariate balancing propensity score (just-identified, ATT moments).
#[derive(Debug, Clone)]
pub struct CbpsModel {
    max_iter: usize,
    tol: f64,
}

impl Default for CbpsModel {
    fn default() -> Self {
        Self { max_iter: 200, tol: 1e-9 }
    }
}

impl CbpsModel {
    /// Set maximum Newton iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set moment-condition tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    fn objective(design: &Design, beta: &DVector<f64>) -> f64 {
        let n = design.y.len() as f64;
        design
            .eta(beta)
            .iter()
            .zip(&design.y)
            .map(|(&e, &t)| if t { -e } else { exp_clamped(e) })
            .sum::<f64>()
            / n
    }

    fn fit(&self, design: &Design) -> Result<Vec<f64>> {
        let (n, k) = design.x.shape();
        let n_treated = design.y.iter().filter(|&&t| t).count() as f64;
        let n_control = n as f64 - n_treated;

        // Start where control odds sum to the treated count (intercept moment met).
        let mut beta = DVector::<f64>::zeros(k);
        beta[0] = (n_treated / n_control).ln();
        let mut obj = Self::objective(design, &beta);

        for iter in 0..self.max_iter {
            let eta = design.eta(&beta);
            let mut moments = DVector::<f64>::zeros(k);
            let mut hess = DMatrix::<f64>::zeros(k, k);
            for i in 0..n {
                let row = design.x.row(i);
                if design.y[i] {
                    for a in 0..k {
                        moments[a] += row[a];
                    }
                } else {
                    let w = exp_clamped(eta[i]);
                    for a in 0..k {
                        moments[a] -= w * row[a];
                        for b in 0..k {
                            hess[(a, b)] += w * row[a] * row[b];
                        }
                    }
                }
            }
            moments /= n as f64;
            hess /= n as f64;

            if moments.amax() < self.tol {
                let probs = eta.iter().map(|&e| sigmoid(e)).collect();
                return Ok(probs);
            }

            let Some(chol) = hess.cholesky() else {
                return Err(Error::RefinementConvergence(format!(
                    "cbps: singular balance Jacobian at iteration {iter}"
                )));
            };
            // Newton direction on the convex objective: grad = -moments.
            let delta = chol.solve(&moments);

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..40 {
                let candidate = &beta + &delta * step;
                let cand = Self::objective(design, &candidate);
                if cand.is_finite() && cand <= obj + 1e-14 {
                    accepted = Some((candidate, cand));
                    break;
                }
                step *= 0.5;
            }
            let Some((next, next_obj)) = accepted else {
                return Err(Error::RefinementConvergence("cbps: line search failed".into()));
            };
            beta = next;
            obj = next_obj;

            if beta.amax() > DIVERGENCE_BOUND {
                return Err(Error::RefinementConvergence(
                    "cbps: balance conditions cannot be met (treated covariates outside control support)"
                        .into(),
                ));
            }
        }
        Err(Error::RefinementConvergence(format!(
            "cbps: no convergence after {} iterations",
            self.max_iter
        )))
    }
}

impl PropensityModel for CbpsModel {
    fn fit_scores(&self, x: &[f64], p: usize, treated: &[bool]) -> Result<Vec<f64>> {
        let design = Design::new(x, p, treated)?;
        self.fit(&design)
    }

    fn name(&self) -> &str {
        "cbps"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    /// Overlapping two-group data: treated ~ N(0.5, 1), controls ~ N(0, 1).
    fn overlapping(n: usize, seed: u64) -> (Vec<f64>, Vec<bool>) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut x = Vec::with_capacity(n);
        let mut t = Vec::with_capacity(n);
        for i in 0..n {
            let treated = i % 3 == 0;
            let shift = if treated { 0.5 } else { 0.0 };
            x.push(shift + noise.sample(&mut rng));
            t.push(treated);
        }
        (x, t)
    }

    #[test]
    fn test_logit_scores_in_unit_interval_and_ordered() {
        let (x, t) = overlapping(300, 11);
        let ps = LogitModel::default().fit_scores(&x, 1, &t).unwrap();
        assert_eq!(ps.len(), 300);
        assert!(ps.iter().all(|&p| p > 0.0 && p < 1.0));
        // positive slope: larger x, larger score
        let (imax, _) = x.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).unwrap();
        let (imin, _) = x.iter().enumerate().min_by(|a, b| a.1.total_cmp(b.1)).unwrap();
        assert!(ps[imax] > ps[imin]);
        // with an intercept the fitted scores average to the treated share
        let mean = ps.iter().sum::<f64>() / ps.len() as f64;
        let share = t.iter().filter(|&&b| b).count() as f64 / t.len() as f64;
        assert!((mean - share).abs() < 1e-6, "mean={mean} share={share}");
    }

    #[test]
    fn test_logit_perfect_separation_fails() {
        let x = vec![-2.0, -1.0, -0.5, 1.0, 2.0];
        let t = vec![false, false, false, true, true];
        let err = LogitModel::default().fit_scores(&x, 1, &t).unwrap_err();
        assert!(matches!(err, Error::RefinementConvergence(_)), "{err}");
    }

    #[test]
    fn test_single_class_fails() {
        let err = LogitModel::default().fit_scores(&[1.0, 2.0], 1, &[false, false]).unwrap_err();
        assert!(matches!(err, Error::RefinementConvergence(_)));
    }

    #[test]
    fn test_constant_column_dropped() {
        let (x1, t) = overlapping(90, 5);
        let x: Vec<f64> = x1.iter().flat_map(|&v| [v, 3.0]).collect();
        let with_const = LogitModel::default().fit_scores(&x, 2, &t).unwrap();
        let without = LogitModel::default().fit_scores(&x1, 1, &t).unwrap();
        for (a, b) in with_const.iter().zip(&without) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cbps_balances_treated_mean() {
        let (x, t) = overlapping(240, 3);
        let ps = CbpsModel::default().fit_scores(&x, 1, &t).unwrap();
        let treated_mean =
            x.iter().zip(&t).filter(|(_, b)| **b).map(|(v, _)| *v).sum::<f64>()
                / t.iter().filter(|&&b| b).count() as f64;
        let mut wsum = 0.0;
        let mut wx = 0.0;
        for ((&xi, &ti), &p) in x.iter().zip(&t).zip(&ps) {
            if !ti {
                let w = p / (1.0 - p);
                wsum += w;
                wx += w * xi;
            }
        }
        let n_treated = t.iter().filter(|&&b| b).count() as f64;
        assert!((wsum - n_treated).abs() < 1e-6, "odds sum {wsum} vs {n_treated}");
        assert!((wx / wsum - treated_mean).abs() < 1e-6);
    }

    #[test]
    fn test_cbps_single_treated_inside_hull() {
        // treated at 0.5, controls span [-1, 2]: exact balance is attainable
        let x = vec![0.5, -1.0, 0.0, 1.0, 2.0];
        let t = vec![true, false, false, false, false];
        let ps = CbpsModel::default().fit_scores(&x, 1, &t).unwrap();
        let odds: Vec<f64> = ps[1..].iter().map(|p| p / (1.0 - p)).collect();
        let s: f64 = odds.iter().sum();
        let m: f64 = odds.iter().zip(&x[1..]).map(|(w, v)| w * v).sum::<f64>() / s;
        assert!((s - 1.0).abs() < 1e-6);
        assert!((m - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_cbps_treated_outside_hull_fails() {
        let x = vec![5.0, -1.0, 0.0, 1.0];
        let t = vec![true, false, false, false];
        let err = CbpsModel::default().fit_scores(&x, 1, &t).unwrap_err();
        assert!(matches!(err, Error::RefinementConvergence(_)), "{err}");
    }

    #[test]
    fn test_dimension_mismatch_is_validation() {
        let err = CbpsModel::default().fit_scores(&[1.0], 2, &[true, false]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

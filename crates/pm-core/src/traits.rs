//! Core traits for panel matching
//!
//! Propensity models are interchangeable behind [`PropensityModel`] so the
//! refinement engine can dispatch on configuration without knowing the solver.

use crate::Result;

/// Binary model predicting treated-event membership from covariates.
pub trait PropensityModel: Send + Sync {
    /// Fit the model and return fitted probabilities, one per row.
    ///
    /// `x` is row-major with shape `(treated.len(), p)` and carries no
    /// intercept column; implementations add their own.
    fn fit_scores(&self, x: &[f64], p: usize, treated: &[bool]) -> Result<Vec<f64>>;

    /// Model name (e.g. "logit", "cbps")
    fn name(&self) -> &str;
}

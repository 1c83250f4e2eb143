//! Confidence intervals from a bootstrap distribution.
//!
//! Percentile, normal-approximation and BCa (Efron 1987) intervals. BCa takes
//! its acceleration from leave-one-event-out jackknife estimates.

use pm_core::{CiMethod, Error, Result};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::math::sample_sd;

const PROB_EPS: f64 = 1e-12;

/// Two-sided interval `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Interval {
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

impl Interval {
    fn ordered(a: f64, b: f64) -> Self {
        Self { lower: a.min(b), upper: a.max(b) }
    }

    /// Whether `x` lies inside the closed interval.
    pub fn contains(&self, x: f64) -> bool {
        self.lower <= x && x <= self.upper
    }
}

fn std_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| Error::Computation(format!("standard normal: {e}")))
}

fn check_level(level: f64) -> Result<()> {
    if level.is_finite() && level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(Error::Validation(format!("confidence level must be in (0,1), got {level}")))
    }
}

/// Linear-interpolation quantile of an ascending slice; `NaN` when empty.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let (i, j) = (pos.floor() as usize, pos.ceil() as usize);
            let t = pos - i as f64;
            sorted[i] + t * (sorted[j] - sorted[i])
        }
    }
}

/// Percentile interval at `level`.
pub fn percentile_interval(samples: &[f64], level: f64) -> Result<Interval> {
    check_level(level)?;
    if samples.len() < 2 {
        return Err(Error::InsufficientData(format!(
            "percentile interval needs at least 2 bootstrap values, got {}",
            samples.len()
        )));
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let alpha = (1.0 - level) / 2.0;
    Ok(Interval::ordered(quantile_sorted(&sorted, alpha), quantile_sorted(&sorted, 1.0 - alpha)))
}

/// `estimate ± z · se` with `z` the standard normal quantile at `(1+level)/2`.
pub fn normal_interval(estimate: f64, se: f64, level: f64) -> Result<Interval> {
    check_level(level)?;
    if !(estimate.is_finite() && se.is_finite()) {
        return Err(Error::InsufficientData("normal interval needs a finite standard error".into()));
    }
    let z = std_normal()?.inverse_cdf(0.5 + level / 2.0);
    Ok(Interval::ordered(estimate - z * se, estimate + z * se))
}

/// Bias correction `z0` with mid-rank ties.
pub fn bias_correction(estimate: f64, samples: &[f64]) -> Result<f64> {
    if samples.is_empty() {
        return Err(Error::InsufficientData("bias correction needs bootstrap values".into()));
    }
    let below = samples.iter().filter(|&&x| x < estimate).count() as f64;
    let ties = samples.iter().filter(|&&x| x == estimate).count() as f64;
    let p = (below + 0.5 * ties) / samples.len() as f64;
    Ok(std_normal()?.inverse_cdf(p.clamp(PROB_EPS, 1.0 - PROB_EPS)))
}

/// Acceleration from jackknife estimates; 0 when they do not vary.
pub fn acceleration(jackknife: &[f64]) -> f64 {
    if jackknife.len() < 3 {
        return 0.0;
    }
    let m = jackknife.iter().sum::<f64>() / jackknife.len() as f64;
    let (s2, s3) = jackknife.iter().fold((0.0, 0.0), |(s2, s3), &v| {
        let d = m - v;
        (s2 + d * d, s3 + d * d * d)
    });
    if !(s2.is_finite() && s2 > 0.0) {
        return 0.0;
    }
    let a = s3 / (6.0 * s2.powf(1.5));
    if a.is_finite() { a } else { 0.0 }
}

/// BCa interval.
pub fn bca_interval(estimate: f64, samples: &[f64], jackknife: &[f64], level: f64) -> Result<Interval> {
    check_level(level)?;
    if samples.len() < 2 {
        return Err(Error::InsufficientData(format!(
            "BCa interval needs at least 2 bootstrap values, got {}",
            samples.len()
        )));
    }
    let normal = std_normal()?;
    let z0 = bias_correction(estimate, samples)?;
    let a = acceleration(jackknife);
    let adjust = |alpha: f64| {
        let z = normal.inverse_cdf(alpha);
        let denom = 1.0 - a * (z0 + z);
        if !denom.is_finite() || denom.abs() < PROB_EPS {
            return if denom.is_sign_negative() { PROB_EPS } else { 1.0 - PROB_EPS };
        }
        normal.cdf(z0 + (z0 + z) / denom).clamp(PROB_EPS, 1.0 - PROB_EPS)
    };
    let alpha = (1.0 - level) / 2.0;
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(Interval::ordered(
        quantile_sorted(&sorted, adjust(alpha)),
        quantile_sorted(&sorted, adjust(1.0 - alpha)),
    ))
}

/// Interval for `method`. `jackknife` is only read by BCa.
pub fn confidence_interval(
    method: CiMethod,
    estimate: f64,
    samples: &[f64],
    jackknife: &[f64],
    level: f64,
) -> Result<Interval> {
    match method {
        CiMethod::Percentile => percentile_interval(samples, level),
        CiMethod::Normal => normal_interval(estimate, sample_sd(samples), level),
        CiMethod::Bca => bca_interval(estimate, samples, jackknife, level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_interpolates() {
        let s = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_sorted(&s, 0.0), 1.0);
        assert_eq!(quantile_sorted(&s, 1.0), 5.0);
        assert!((quantile_sorted(&s, 0.125) - 1.5).abs() < 1e-12);
        assert!(quantile_sorted(&[], 0.5).is_nan());
    }

    #[test]
    fn test_percentile_covers_middle() {
        let xs: Vec<f64> = (0..=100).map(f64::from).collect();
        let ci = percentile_interval(&xs, 0.9).unwrap();
        assert!((ci.lower - 5.0).abs() < 1e-9);
        assert!((ci.upper - 95.0).abs() < 1e-9);
        assert!(ci.contains(50.0));
    }

    #[test]
    fn test_percentile_needs_two_values() {
        assert!(matches!(percentile_interval(&[1.0], 0.95), Err(Error::InsufficientData(_))));
        assert!(matches!(percentile_interval(&[1.0, 2.0], 1.0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_normal_interval_width() {
        let ci = normal_interval(1.0, 0.5, 0.95).unwrap();
        assert!((ci.upper - (1.0 + 1.959963984540054 * 0.5)).abs() < 1e-6);
        assert!((ci.lower - (1.0 - 1.959963984540054 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_bca_reduces_to_percentile_when_unbiased() {
        // symmetric samples around the estimate, constant jackknife
        let xs: Vec<f64> = (-50..=50).map(|i| i as f64 / 10.0).collect();
        let bca = bca_interval(0.0, &xs, &[1.0, 1.0, 1.0], 0.9).unwrap();
        let pct = percentile_interval(&xs, 0.9).unwrap();
        assert!((bca.lower - pct.lower).abs() < 1e-6);
        assert!((bca.upper - pct.upper).abs() < 1e-6);
    }

    #[test]
    fn test_acceleration_sign_follows_skew() {
        assert_eq!(acceleration(&[2.0, 2.0, 2.0]), 0.0);
        // one low outlier: mean - v is large positive for it
        assert!(acceleration(&[0.0, 5.0, 5.0, 5.0]) > 0.0);
    }
}

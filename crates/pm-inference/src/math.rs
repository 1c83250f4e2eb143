//! Small numerically-stable helpers shared by the propensity solvers.

/// Probabilities are kept this far away from 0 and 1 before taking odds.
pub const PROB_CLIP: f64 = 1e-10;

/// Stable `log(1 + exp(x))`.
///
/// `log(1+exp(x)) = max(x,0) + log(1+exp(-|x|))`.
#[inline]
pub fn log1pexp(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    x.max(0.0) + e.ln_1p()
}

/// Stable sigmoid: `1 / (1 + exp(-x))`.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    let recip = 1.0 / (1.0 + e);
    if x >= 0.0 { recip } else { e * recip }
}

/// Exponential clamped to a finite range.
#[inline]
pub fn exp_clamped(x: f64) -> f64 {
    x.clamp(-700.0, 700.0).exp()
}

/// Odds `p / (1 - p)` with `p` clipped into `[PROB_CLIP, 1 - PROB_CLIP]`.
#[inline]
pub fn odds(p: f64) -> f64 {
    let p = p.clamp(PROB_CLIP, 1.0 - PROB_CLIP);
    p / (1.0 - p)
}

/// Arithmetic mean; `NaN` for empty input.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation (n-1 denominator); `NaN` below two values.
pub fn sample_sd(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return f64::NAN;
    }
    let m = mean(xs);
    let ss: f64 = xs.iter().map(|x| (x - m) * (x - m)).sum();
    (ss / (xs.len() - 1) as f64).sqrt()
}

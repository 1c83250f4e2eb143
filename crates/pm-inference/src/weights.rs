//! Per-set weight normalization.

use pm_core::{ControlStatus, Error, MatchedSet, Result, SetFlag};

/// Tolerance on the sum of weights of a non-empty set.
pub const WEIGHT_SUM_TOL: f64 = 1e-9;

/// Turn refinement raw weights into final weights summing to 1.
///
/// Pruned and excluded controls end at weight 0. With `equal` every retained
/// control gets the same weight. When every retained raw weight is zero or
/// non-finite the set falls back to equal weights and is flagged
/// [`SetFlag::DegenerateWeights`].
pub fn normalize_set(set: &mut MatchedSet, equal: bool) {
    for c in &mut set.controls {
        if c.status != ControlStatus::Retained {
            c.raw_weight = 0.0;
            c.weight = 0.0;
        }
    }
    let n_retained = set.controls.iter().filter(|c| c.status == ControlStatus::Retained).count();
    if n_retained == 0 {
        return;
    }

    let usable = |w: f64| w.is_finite() && w > 0.0;
    let total: f64 = set
        .controls
        .iter()
        .filter(|c| c.status == ControlStatus::Retained && usable(c.raw_weight))
        .map(|c| c.raw_weight)
        .sum();

    let degenerate = !equal && !(total.is_finite() && total > 0.0);
    if equal || degenerate {
        let w = 1.0 / n_retained as f64;
        for c in set.controls.iter_mut().filter(|c| c.status == ControlStatus::Retained) {
            c.weight = w;
        }
        if degenerate {
            log::debug!(
                "degenerate raw weights for (unit={}, time={}); using equal weights",
                set.event.unit,
                set.event.time
            );
            set.flag(SetFlag::DegenerateWeights);
        }
        return;
    }

    for c in set.controls.iter_mut().filter(|c| c.status == ControlStatus::Retained) {
        c.weight = if usable(c.raw_weight) { c.raw_weight / total } else { 0.0 };
    }
}

/// Normalize every set.
pub fn normalize_sets(sets: &mut [MatchedSet], equal: bool) {
    for set in sets {
        normalize_set(set, equal);
    }
}

/// Validate final weights: in `[0, 1]`, zero off the retained controls,
/// summing to 1 within [`WEIGHT_SUM_TOL`] for non-empty sets.
pub fn check_weights(set: &MatchedSet) -> Result<()> {
    let where_ = || format!("(unit={}, time={})", set.event.unit, set.event.time);
    for c in &set.controls {
        if !(c.weight.is_finite() && (0.0..=1.0).contains(&c.weight)) {
            return Err(Error::Computation(format!(
                "weight {} of control {} out of range in set {}",
                c.weight,
                c.unit,
                where_()
            )));
        }
        if c.status != ControlStatus::Retained && c.weight != 0.0 {
            return Err(Error::Computation(format!(
                "non-retained control {} carries weight in set {}",
                c.unit,
                where_()
            )));
        }
    }
    if !set.is_empty() {
        let total = set.total_weight();
        if (total - 1.0).abs() > WEIGHT_SUM_TOL {
            return Err(Error::Computation(format!(
                "weights of set {} sum to {total}",
                where_()
            )));
        }
    }
    Ok(())
}

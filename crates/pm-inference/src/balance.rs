//! Covariate balance of matched sets.
//!
//! For every component quantity of interest, covariate column and relative
//! period `o` the balance is the mean over that quantity's matched sets of
//! `x(u, t+o) − Σ_c w_c · x(c, t+o)`, standardized by the covariate's pooled
//! panel standard deviation. The same statistic with equal weights over all
//! history-eligible controls gives the unrefined baseline. An `ate` result
//! reports its `att` and `atc` components separately.

use pm_core::{Error, MatchedSet, MatchingResult, Qoi, Result};
use serde::Serialize;

use crate::panel::PanelIndex;

/// Balance of one covariate column at one relative period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceRow {
    /// Component quantity whose matched sets were averaged.
    pub qoi: Qoi,
    /// Column label (`x`, `x_lag2`).
    pub covariate: String,
    /// Period relative to the event.
    pub offset: isize,
    /// Standardized difference under the refined weights.
    pub refined: Option<f64>,
    /// Standardized difference with equal weights over eligible controls.
    pub unrefined: Option<f64>,
}

/// Balance rows ordered by quantity, covariate column, then offset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceTable {
    /// Relative periods covered.
    pub offsets: Vec<isize>,
    /// Rows.
    pub rows: Vec<BalanceRow>,
}

impl BalanceTable {
    /// Row for `covariate` at `offset` under component quantity `qoi`.
    pub fn get(&self, qoi: Qoi, covariate: &str, offset: isize) -> Option<&BalanceRow> {
        self.rows.iter().find(|r| r.qoi == qoi && r.covariate == covariate && r.offset == offset)
    }

    /// Rows of one component quantity.
    pub fn rows_for(&self, qoi: Qoi) -> impl Iterator<Item = &BalanceRow> {
        self.rows.iter().filter(move |r| r.qoi == qoi)
    }
}

/// Default periods: `-lag..=-1` followed by the lead window.
pub fn default_offsets(result: &MatchingResult) -> Vec<isize> {
    let lag = isize::try_from(result.config.lag).unwrap_or(0);
    (-lag..0)
        .chain(result.config.lead.iter().filter_map(|&l| isize::try_from(l).ok()))
        .collect()
}

/// Balance over the default periods.
pub fn balance(result: &MatchingResult, panel: &PanelIndex) -> Result<BalanceTable> {
    balance_at(result, panel, &default_offsets(result))
}

/// Balance over explicit relative periods.
pub fn balance_at(result: &MatchingResult, panel: &PanelIndex, offsets: &[isize]) -> Result<BalanceTable> {
    let mut columns = Vec::new();
    for term in &result.config.covariates {
        let ci = panel.covariate_index(&term.name).ok_or_else(|| {
            Error::Configuration(format!("covariate '{}' not found in panel", term.name))
        })?;
        let sd = panel.pooled_sd(ci).filter(|s| *s > 0.0);
        for (&lag, label) in term.lags.iter().zip(term.column_labels()) {
            columns.push((ci, sd, isize::try_from(lag).ok(), label));
        }
    }

    let mut rows = Vec::new();
    for (&qoi, sets) in &result.sets {
        let sets: Vec<&MatchedSet> = sets.iter().collect();
        for (ci, sd, lag, label) in &columns {
            for &offset in offsets {
                let shift = lag.and_then(|l| offset.checked_sub(l));
                let standardize = |d: Option<f64>| Some(d? / (*sd)?);
                let (refined, unrefined) = match shift {
                    Some(shift) => {
                        let column = Column { panel, ci: *ci, shift };
                        (
                            standardize(mean_difference(&sets, &column, Weighting::Refined)?),
                            standardize(mean_difference(&sets, &column, Weighting::Equal)?),
                        )
                    }
                    None => (None, None),
                };
                rows.push(BalanceRow { qoi, covariate: label.clone(), offset, refined, unrefined });
            }
        }
    }
    Ok(BalanceTable { offsets: offsets.to_vec(), rows })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Weighting {
    Refined,
    Equal,
}

struct Column<'a> {
    panel: &'a PanelIndex,
    ci: usize,
    shift: isize,
}

impl Column<'_> {
    fn value(&self, unit: u64, ti: usize) -> Result<Option<f64>> {
        let ui = self
            .panel
            .unit_index(unit)
            .ok_or_else(|| Error::Validation(format!("unit {unit} is not in the panel")))?;
        Ok(self.panel.covariate_at_offset(ui, ti, self.ci, self.shift))
    }
}

fn mean_difference(sets: &[&MatchedSet], column: &Column<'_>, weighting: Weighting) -> Result<Option<f64>> {
    let (mut sum, mut n) = (0.0, 0usize);
    for set in sets {
        let ti = column.panel.time_index(set.event.time).ok_or_else(|| {
            Error::Validation(format!("event time {} is not in the panel", set.event.time))
        })?;
        let Some(x_treated) = column.value(set.event.unit, ti)? else {
            continue;
        };
        let (mut wsum, mut acc) = (0.0, 0.0);
        for c in &set.controls {
            let w = match weighting {
                Weighting::Refined => c.weight,
                Weighting::Equal => 1.0,
            };
            if w <= 0.0 {
                continue;
            }
            if let Some(x) = column.value(c.unit, ti)? {
                wsum += w;
                acc += w * x;
            }
        }
        if wsum > 0.0 {
            sum += x_treated - acc / wsum;
            n += 1;
        }
    }
    Ok((n > 0).then(|| sum / n as f64))
}

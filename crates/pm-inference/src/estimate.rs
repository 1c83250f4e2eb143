//! Bootstrap effect estimator over a [`MatchingResult`].
//!
//! Each treated event contributes, per lead `ℓ`, the difference between its
//! outcome at `t+ℓ` and the weighted outcome of its matched controls. The
//! point estimate is the mean contribution; uncertainty comes from resampling
//! events (or event units) with replacement while keeping the matched sets
//! fixed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pm_core::{
    CiMethod, Error, EstimateConfig, MatchedSet, MatchingResult, OutcomeMode, Qoi, ResampleScheme,
    Result,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::bootstrap_ci::{Interval, confidence_interval};
use crate::math::sample_sd;
use crate::panel::PanelIndex;

/// Result for one lead offset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeadEstimate {
    /// Estimable lead.
    Estimated {
        /// Mean contribution over all events.
        point_estimate: f64,
        /// Sample SD of the finite bootstrap values.
        standard_error: f64,
        /// Confidence interval.
        confidence_interval: Interval,
        /// Events contributing to the point estimate.
        n_events: usize,
        /// Finite bootstrap values behind SE and interval.
        n_bootstrap: usize,
    },
    /// Not estimable; `reason` says why.
    Undefined {
        /// Explanation.
        reason: String,
    },
}

impl LeadEstimate {
    /// Point estimate when defined.
    pub fn point_estimate(&self) -> Option<f64> {
        match self {
            Self::Estimated { point_estimate, .. } => Some(*point_estimate),
            Self::Undefined { .. } => None,
        }
    }

    /// Standard error when defined.
    pub fn standard_error(&self) -> Option<f64> {
        match self {
            Self::Estimated { standard_error, .. } => Some(*standard_error),
            Self::Undefined { .. } => None,
        }
    }

    /// Interval when defined.
    pub fn confidence_interval(&self) -> Option<Interval> {
        match self {
            Self::Estimated { confidence_interval, .. } => Some(*confidence_interval),
            Self::Undefined { .. } => None,
        }
    }

    /// `true` for [`LeadEstimate::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined { .. })
    }
}

/// Effect estimates per lead.
#[derive(Debug, Clone, Serialize)]
pub struct Estimate {
    /// Quantity of interest.
    pub qoi: Qoi,
    /// Seed actually used (drawn when the configuration had none).
    pub seed: u64,
    /// Bootstrap iterations.
    pub iterations: usize,
    /// Confidence level.
    pub confidence_level: f64,
    /// Interval method.
    pub ci_method: CiMethod,
    /// Per-lead results.
    pub leads: BTreeMap<usize, LeadEstimate>,
    /// Raw bootstrap values per lead (non-finite values included).
    #[serde(skip)]
    pub bootstrap: BTreeMap<usize, Vec<f64>>,
}

impl Estimate {
    /// Result for lead `lead`.
    pub fn lead(&self, lead: usize) -> Option<&LeadEstimate> {
        self.leads.get(&lead)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One treated event with its per-lead contributions.
#[derive(Debug, Clone)]
struct EventRow {
    component: usize,
    unit: u64,
    contrib: Vec<Option<f64>>,
}

/// Per-event contributions of a matching result, ready for resampling.
#[derive(Debug)]
struct Contributions {
    leads: Vec<usize>,
    rows: Vec<EventRow>,
    /// Row indices per component.
    by_component: Vec<Vec<usize>>,
    /// Row indices per event unit.
    by_unit: Vec<Vec<usize>>,
}

impl Contributions {
    fn build(panel: &PanelIndex, result: &MatchingResult, mode: OutcomeMode) -> Result<Self> {
        let leads = result.config.lead.clone();
        let components = result.config.qoi.components();
        let mut rows = Vec::new();
        let mut by_component = Vec::with_capacity(components.len());
        for (k, &qoi) in components.iter().enumerate() {
            let sets = result.sets_for(qoi).unwrap_or(&[]);
            let sign = qoi.contrast_sign();
            let mut idx = Vec::with_capacity(sets.len());
            for set in sets {
                let contrib = leads
                    .iter()
                    .map(|&l| event_contribution(panel, set, l, mode).map(|c| c.map(|v| sign * v)))
                    .collect::<Result<Vec<_>>>()?;
                idx.push(rows.len());
                rows.push(EventRow { component: k, unit: set.event.unit, contrib });
            }
            by_component.push(idx);
        }
        let mut units: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (i, row) in rows.iter().enumerate() {
            units.entry(row.unit).or_default().push(i);
        }
        let by_unit = units.into_values().collect();
        Ok(Self { leads, rows, by_component, by_unit })
    }

    /// Mean contribution per lead under event multiplicities `m`; `NaN`
    /// where nothing contributes.
    fn statistic(&self, m: &[u32]) -> Vec<f64> {
        (0..self.leads.len())
            .map(|j| {
                let (mut sum, mut n) = (0.0, 0u64);
                for (row, &k) in self.rows.iter().zip(m) {
                    if let (Some(v), true) = (row.contrib[j], k > 0) {
                        sum += f64::from(k) * v;
                        n += u64::from(k);
                    }
                }
                if n == 0 { f64::NAN } else { sum / n as f64 }
            })
            .collect()
    }

    fn n_contributing(&self, j: usize) -> usize {
        self.rows.iter().filter(|r| r.contrib[j].is_some()).count()
    }

    fn draw(&self, scheme: ResampleScheme, rng: &mut StdRng) -> Vec<u32> {
        let mut m = vec![0u32; self.rows.len()];
        match scheme {
            ResampleScheme::Events => {
                for idx in &self.by_component {
                    for _ in 0..idx.len() {
                        m[idx[rng.random_range(0..idx.len())]] += 1;
                    }
                }
            }
            ResampleScheme::Units => {
                let n = self.by_unit.len();
                for _ in 0..n {
                    for &i in &self.by_unit[rng.random_range(0..n)] {
                        m[i] += 1;
                    }
                }
            }
        }
        m
    }

    /// Leave-one-event-out estimates for lead `j` over contributing events.
    fn jackknife(&self, j: usize) -> Vec<f64> {
        let mut m = vec![1u32; self.rows.len()];
        let mut out = Vec::new();
        for i in 0..self.rows.len() {
            if self.rows[i].contrib[j].is_none() {
                continue;
            }
            m[i] = 0;
            let v = self.statistic(&m)[j];
            m[i] = 1;
            if v.is_finite() {
                out.push(v);
            }
        }
        out
    }
}

/// Outcome of `unit_idx` at grid position `pos`, differenced against `t-1`
/// in first-difference mode.
fn contrast_outcome(panel: &PanelIndex, ui: usize, ti: usize, pos: usize, mode: OutcomeMode) -> Option<f64> {
    let y = panel.outcome(ui, pos)?;
    match mode {
        OutcomeMode::Level => Some(y),
        OutcomeMode::FirstDifference => Some(y - panel.outcome_at_offset(ui, ti, -1)?),
    }
}

/// Contribution of one event at lead `lead`: treated outcome minus the
/// weighted outcome of the controls with a usable outcome.
fn event_contribution(panel: &PanelIndex, set: &MatchedSet, lead: usize, mode: OutcomeMode) -> Result<Option<f64>> {
    let (Some(ui), Some(ti)) = (panel.unit_index(set.event.unit), panel.time_index(set.event.time)) else {
        return Err(Error::Validation(format!(
            "event (unit={}, time={}) is not in the panel",
            set.event.unit, set.event.time
        )));
    };
    let Some(pos) = isize::try_from(lead).ok().and_then(|l| panel.offset(ti, l)) else {
        return Ok(None);
    };
    let Some(y_treated) = contrast_outcome(panel, ui, ti, pos, mode) else {
        return Ok(None);
    };
    let (mut wsum, mut acc) = (0.0, 0.0);
    for c in set.controls.iter().filter(|c| c.weight > 0.0) {
        let Some(cu) = panel.unit_index(c.unit) else {
            return Err(Error::Validation(format!("control unit {} is not in the panel", c.unit)));
        };
        if let Some(y) = contrast_outcome(panel, cu, ti, pos, mode) {
            wsum += c.weight;
            acc += c.weight * y;
        }
    }
    if wsum <= 0.0 {
        return Ok(None);
    }
    Ok(Some(y_treated - acc / wsum))
}

/// Bootstrap estimator bound to a panel and configuration.
#[derive(Debug)]
pub struct BootstrapEstimator<'a> {
    panel: &'a PanelIndex,
    config: EstimateConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> BootstrapEstimator<'a> {
    /// Estimator with a validated configuration.
    pub fn new(panel: &'a PanelIndex, config: EstimateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { panel, config, cancel: None })
    }

    /// Attach a cooperative cancellation flag, checked once per iteration.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Estimate every lead of `result`.
    pub fn run(&self, result: &MatchingResult) -> Result<Estimate> {
        let cfg = &self.config;
        let data = Contributions::build(self.panel, result, cfg.outcome_mode)?;
        let seed = cfg.seed.unwrap_or_else(|| {
            let s = rand::rng().random::<u64>();
            log::debug!("no bootstrap seed configured; drew {s}");
            s
        });

        let baseline = data.statistic(&vec![1; data.rows.len()]);
        let cancel = self.cancel.as_deref();
        let draws: Option<Vec<Vec<f64>>> = (0..cfg.iterations)
            .into_par_iter()
            .map(|i| {
                if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    return None;
                }
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                Some(data.statistic(&data.draw(cfg.resample, &mut rng)))
            })
            .collect();
        let draws = draws.ok_or(Error::Cancelled)?;

        let mut leads = BTreeMap::new();
        let mut bootstrap = BTreeMap::new();
        for (j, &lead) in data.leads.iter().enumerate() {
            let samples: Vec<f64> = draws.iter().map(|d| d[j]).collect();
            let n_events = data.n_contributing(j);
            let lead_estimate = if n_events == 0 || !baseline[j].is_finite() {
                log::debug!("lead {lead}: no contributing events");
                LeadEstimate::Undefined {
                    reason: format!("insufficient data: no event contributes at lead {lead}"),
                }
            } else {
                let finite: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
                let jackknife =
                    if cfg.ci_method == CiMethod::Bca { data.jackknife(j) } else { Vec::new() };
                match confidence_interval(cfg.ci_method, baseline[j], &finite, &jackknife, cfg.confidence_level) {
                    Ok(ci) => LeadEstimate::Estimated {
                        point_estimate: baseline[j],
                        standard_error: sample_sd(&finite),
                        confidence_interval: ci,
                        n_events,
                        n_bootstrap: finite.len(),
                    },
                    Err(Error::InsufficientData(msg)) => {
                        LeadEstimate::Undefined { reason: format!("insufficient data: {msg}") }
                    }
                    Err(e) => return Err(e),
                }
            };
            leads.insert(lead, lead_estimate);
            bootstrap.insert(lead, samples);
        }

        Ok(Estimate {
            qoi: result.config.qoi,
            seed,
            iterations: cfg.iterations,
            confidence_level: cfg.confidence_level,
            ci_method: cfg.ci_method,
            leads,
            bootstrap,
        })
    }
}

/// Convenience wrapper around [`BootstrapEstimator`].
pub fn estimate(result: &MatchingResult, panel: &PanelIndex, config: &EstimateConfig) -> Result<Estimate> {
    BootstrapEstimator::new(panel, config.clone())?.run(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::panel_match;
    use pm_core::{MatchConfig, PanelRecord};

    /// Unit 1 switches at 2002; units 2 and 3 stay in control.
    fn panel() -> PanelIndex {
        let y = |u: u64, t: i64| -> f64 {
            match (u, t) {
                (1, t) if t >= 2002 => 10.0 + t as f64 - 2000.0,
                (u, t) => u as f64 + t as f64 - 2000.0,
            }
        };
        let mut records = Vec::new();
        for u in 1..=3u64 {
            for t in 2000..=2003i64 {
                let d = if u == 1 && t >= 2002 { 1 } else { 0 };
                records.push(PanelRecord::new(u, t, Some(d), Some(y(u, t))));
            }
        }
        PanelIndex::from_records(&records).unwrap()
    }

    #[test]
    fn test_point_estimate_single_event() {
        let p = panel();
        let result = panel_match(&p, &MatchConfig::new(1).with_lead([0, 1])).unwrap();
        let est = estimate(&result, &p, &EstimateConfig::default().with_iterations(50).with_seed(1)).unwrap();
        // lead 0: y1=12, controls (2+2, 3+2) averaged = 4.5
        let l0 = est.lead(0).unwrap();
        assert!((l0.point_estimate().unwrap() - 7.5).abs() < 1e-12);
        // one event: every resample reproduces it
        assert!(l0.standard_error().unwrap().abs() < 1e-12);
        assert!((est.lead(1).unwrap().point_estimate().unwrap() - 7.5).abs() < 1e-12);
    }

    #[test]
    fn test_first_difference() {
        let p = panel();
        let result = panel_match(&p, &MatchConfig::new(1)).unwrap();
        let cfg = EstimateConfig::default()
            .with_iterations(10)
            .with_seed(3)
            .with_outcome_mode(OutcomeMode::FirstDifference);
        let est = estimate(&result, &p, &cfg).unwrap();
        // treated 12 - 2 = 10; controls (4-3, 5-4) = 1
        assert!((est.lead(0).unwrap().point_estimate().unwrap() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_lead_beyond_panel_is_undefined() {
        let p = panel();
        let result = panel_match(&p, &MatchConfig::new(1).with_lead([0, 5])).unwrap();
        let est = estimate(&result, &p, &EstimateConfig::default().with_iterations(20).with_seed(9)).unwrap();
        assert!(!est.lead(0).unwrap().is_undefined());
        assert!(est.lead(5).unwrap().is_undefined());
    }

    #[test]
    fn test_drawn_seed_is_reported_and_reproducible() {
        let p = panel();
        let result = panel_match(&p, &MatchConfig::new(1)).unwrap();
        let first = estimate(&result, &p, &EstimateConfig::default().with_iterations(20)).unwrap();
        let again = estimate(
            &result,
            &p,
            &EstimateConfig::default().with_iterations(20).with_seed(first.seed),
        )
        .unwrap();
        assert_eq!(first.bootstrap, again.bootstrap);
    }

    #[test]
    fn test_cancellation() {
        let p = panel();
        let result = panel_match(&p, &MatchConfig::new(1)).unwrap();
        let out = BootstrapEstimator::new(&p, EstimateConfig::default().with_seed(1))
            .unwrap()
            .with_cancel(Arc::new(AtomicBool::new(true)))
            .run(&result);
        assert!(matches!(out, Err(Error::Cancelled)));
    }

    #[test]
    fn test_serializes_undefined_marker() {
        let p = panel();
        let result = panel_match(&p, &MatchConfig::new(1).with_lead([7])).unwrap();
        let est = estimate(&result, &p, &EstimateConfig::default().with_iterations(5).with_seed(0)).unwrap();
        let json = est.to_json().unwrap();
        assert!(json.contains("\"undefined\""));
    }
}

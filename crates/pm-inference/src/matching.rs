//! Matched-set construction: event detection, history matching, refinement
//! and weight normalization chained per quantity of interest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pm_core::{Error, MatchConfig, MatchingResult, PropensityModel, Result};

use crate::events::detect_event_sites;
use crate::history::match_histories;
use crate::panel::PanelIndex;
use crate::refinement::Refiner;
use crate::weights::{check_weights, normalize_sets};

/// Builds a [`MatchingResult`] from a panel.
pub struct PanelMatcher<'a> {
    panel: &'a PanelIndex,
    config: MatchConfig,
    cancel: Option<Arc<AtomicBool>>,
    model: Option<Box<dyn PropensityModel + 'a>>,
}

impl<'a> PanelMatcher<'a> {
    /// Matcher over `panel` with a validated configuration.
    pub fn new(panel: &'a PanelIndex, config: MatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { panel, config, cancel: None, model: None })
    }

    /// Attach a cooperative cancellation flag, checked once per event.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Use a custom propensity model for `ps.*` / `CBPS.*` refinement.
    pub fn with_model(mut self, model: Box<dyn PropensityModel + 'a>) -> Self {
        self.model = Some(model);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Run matching for every component of the configured quantity.
    pub fn run(self) -> Result<MatchingResult> {
        let Self { panel, config, cancel, model } = self;
        let mut refiner = Refiner::new(panel, &config)?;
        if let Some(model) = model {
            refiner = refiner.with_model(model);
        }
        let cancel = cancel.as_deref();

        let mut sets = BTreeMap::new();
        for &qoi in config.qoi.components() {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(Error::Cancelled);
            }
            let sites = detect_event_sites(panel, &config, qoi)?;
            let mut qoi_sets = match_histories(panel, &config, &sites, cancel)?;
            refiner.refine(&mut qoi_sets, cancel)?;
            normalize_sets(&mut qoi_sets, config.use_equal_weights);
            for set in &qoi_sets {
                check_weights(set)?;
            }
            let n_empty = qoi_sets.iter().filter(|s| s.is_empty()).count();
            let n_fallback = qoi_sets.iter().filter(|s| s.has_convergence_fallback()).count();
            log::debug!(
                "{qoi}: {} matched set(s), {n_empty} empty, {n_fallback} with model fallback",
                qoi_sets.len()
            );
            sets.insert(qoi, qoi_sets);
        }
        drop(refiner);
        Ok(MatchingResult { config, sets })
    }
}

/// Convenience wrapper: validate, match, refine and weight in one call.
pub fn panel_match(panel: &PanelIndex, config: &MatchConfig) -> Result<MatchingResult> {
    PanelMatcher::new(panel, config.clone())?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::{PanelRecord, Qoi, RefinementMethod, TreatedEvent};

    fn panel(rows: &[(u64, Vec<u8>)]) -> PanelIndex {
        let records: Vec<PanelRecord> = rows
            .iter()
            .flat_map(|(u, path)| {
                path.iter().enumerate().map(move |(i, &d)| {
                    PanelRecord::new(*u, 2000 + i as i64, Some(d), Some(i as f64))
                })
            })
            .collect();
        PanelIndex::from_records(&records).unwrap()
    }

    #[test]
    fn test_ate_builds_both_components() {
        let p = panel(&[
            (1, vec![0, 0, 1]),
            (2, vec![1, 1, 0]),
            (3, vec![0, 0, 0]),
            (4, vec![1, 1, 1]),
        ]);
        let result = panel_match(&p, &MatchConfig::new(1).with_qoi(Qoi::Ate)).unwrap();
        let att = result.sets_for(Qoi::Att).unwrap();
        let atc = result.sets_for(Qoi::Atc).unwrap();
        assert_eq!(att[0].event, TreatedEvent { unit: 1, time: 2002 });
        assert_eq!(att[0].weights().into_keys().collect::<Vec<_>>(), vec![3]);
        assert_eq!(atc[0].weights().into_keys().collect::<Vec<_>>(), vec![4]);
        assert_eq!(result.n_events(), 2);
    }

    #[test]
    fn test_invalid_config_rejected_before_work() {
        let p = panel(&[(1, vec![0, 1])]);
        let cfg = MatchConfig::new(1).with_refinement(RefinementMethod::Mahalanobis, []);
        assert!(matches!(panel_match(&p, &cfg), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_cancelled_before_start() {
        let p = panel(&[(1, vec![0, 1]), (2, vec![0, 0])]);
        let flag = Arc::new(AtomicBool::new(true));
        let out = PanelMatcher::new(&p, MatchConfig::new(1)).unwrap().with_cancel(flag).run();
        assert!(matches!(out, Err(Error::Cancelled)));
    }
}

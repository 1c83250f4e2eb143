//! Treated-event detection.
//!
//! An event is a `(unit, t)` where the unit is observed with the pre-switch
//! status at the previous grid period and the post-switch status at `t`.
//! `att` looks for 0 → 1 switches, `atc`/`art` for 1 → 0 switches.

use std::ops::RangeInclusive;

use pm_core::{Error, MatchConfig, Qoi, Result, TreatedEvent};

use crate::panel::{PanelIndex, TreatmentObs};

/// A treated event with its grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSite {
    /// Public event identity.
    pub event: TreatedEvent,
    /// Unit position in the panel index.
    pub unit_idx: usize,
    /// Grid position of the event period.
    pub time_idx: usize,
    /// Status held before the switch (the control status).
    pub from: u8,
}

/// Whether `unit` keeps `status` over the grid positions in `range`.
///
/// Positions beyond the grid and absent cells never violate; an NA violates
/// unless `match_missing` treats it as a wildcard.
pub(crate) fn holds_status(
    panel: &PanelIndex,
    ui: usize,
    range: RangeInclusive<usize>,
    status: u8,
    match_missing: bool,
) -> bool {
    let last = (*range.end()).min(panel.n_periods().saturating_sub(1));
    for ti in *range.start()..=last {
        match panel.treatment(ui, ti) {
            TreatmentObs::Absent => {}
            TreatmentObs::Na if match_missing => {}
            TreatmentObs::Na => return false,
            TreatmentObs::Observed(v) if v == status => {}
            TreatmentObs::Observed(_) => return false,
        }
    }
    true
}

/// Detect event sites for a component quantity of interest.
pub fn detect_event_sites(panel: &PanelIndex, config: &MatchConfig, qoi: Qoi) -> Result<Vec<EventSite>> {
    let Some((from, to)) = qoi.switch() else {
        return Err(Error::Configuration(format!(
            "event detection needs a component quantity of interest, got '{qoi}'"
        )));
    };
    let max_lead = config.max_lead();

    let mut sites = Vec::new();
    let mut dropped = 0usize;
    for (ui, &unit) in panel.units().iter().enumerate() {
        for ti in 1..panel.n_periods() {
            if panel.treatment(ui, ti - 1) != TreatmentObs::Observed(from)
                || panel.treatment(ui, ti) != TreatmentObs::Observed(to)
            {
                continue;
            }
            if config.forbid_treatment_reversal
                && max_lead > 0
                && !holds_status(panel, ui, ti + 1..=ti.saturating_add(max_lead), to, config.match_missing)
            {
                dropped += 1;
                continue;
            }
            sites.push(EventSite {
                event: TreatedEvent { unit, time: panel.times()[ti] },
                unit_idx: ui,
                time_idx: ti,
                from,
            });
        }
    }
    if dropped > 0 {
        log::debug!("{qoi}: dropped {dropped} event(s) reverting within the lead window");
    }
    Ok(sites)
}

/// Detect treated events, ordered by `(unit, time)`.
pub fn detect_events(panel: &PanelIndex, config: &MatchConfig, qoi: Qoi) -> Result<Vec<TreatedEvent>> {
    Ok(detect_event_sites(panel, config, qoi)?.into_iter().map(|s| s.event).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::PanelRecord;

    fn panel(rows: &[(u64, Vec<Option<u8>>)]) -> PanelIndex {
        let records: Vec<PanelRecord> = rows
            .iter()
            .flat_map(|(u, path)| {
                path.iter()
                    .enumerate()
                    .map(move |(i, &d)| PanelRecord::new(*u, 2000 + i as i64, d, Some(0.0)))
            })
            .collect();
        PanelIndex::from_records(&records).unwrap()
    }

    #[test]
    fn test_att_events_ordered() {
        let p = panel(&[
            (2, vec![Some(0), Some(1), Some(0), Some(1)]),
            (1, vec![Some(0), Some(0), Some(1), Some(1)]),
        ]);
        let ev = detect_events(&p, &MatchConfig::new(1), Qoi::Att).unwrap();
        assert_eq!(
            ev,
            vec![
                TreatedEvent { unit: 1, time: 2002 },
                TreatedEvent { unit: 2, time: 2001 },
                TreatedEvent { unit: 2, time: 2003 },
            ]
        );
    }

    #[test]
    fn test_reversal_events() {
        let p = panel(&[(1, vec![Some(1), Some(1), Some(0)])]);
        let ev = detect_events(&p, &MatchConfig::new(1), Qoi::Art).unwrap();
        assert_eq!(ev, vec![TreatedEvent { unit: 1, time: 2002 }]);
        assert!(detect_events(&p, &MatchConfig::new(1), Qoi::Att).unwrap().is_empty());
    }

    #[test]
    fn test_na_never_starts_event() {
        let p = panel(&[(1, vec![None, Some(1)]), (2, vec![Some(0), None])]);
        assert!(detect_events(&p, &MatchConfig::new(1), Qoi::Att).unwrap().is_empty());
    }

    #[test]
    fn test_event_created_even_without_lag_history() {
        let p = panel(&[(1, vec![Some(0), Some(1)])]);
        let ev = detect_events(&p, &MatchConfig::new(4).with_lead([0, 1, 2]), Qoi::Att).unwrap();
        assert_eq!(ev.len(), 1);
    }

    #[test]
    fn test_forbid_reversal_drops_reverting_events() {
        let p = panel(&[(1, vec![Some(0), Some(1), Some(0)])]);
        let cfg = MatchConfig::new(1).with_lead([0, 1]);
        assert_eq!(detect_events(&p, &cfg, Qoi::Att).unwrap().len(), 1);
        let cfg = cfg.with_forbid_treatment_reversal(true);
        assert!(detect_events(&p, &cfg, Qoi::Att).unwrap().is_empty());
    }

    #[test]
    fn test_forbid_reversal_with_unbounded_lead_does_not_overflow() {
        let p = panel(&[(1, vec![Some(0), Some(1), Some(1)]), (2, vec![Some(0), Some(1), Some(0)])]);
        let cfg = MatchConfig::new(1)
            .with_lead([0, usize::MAX])
            .with_forbid_treatment_reversal(true);
        assert!(cfg.validate().is_err());
        let ev = detect_events(&p, &cfg, Qoi::Att).unwrap();
        assert_eq!(ev, vec![TreatedEvent { unit: 1, time: 2001 }]);
    }

    #[test]
    fn test_ate_is_not_a_switch() {
        let p = panel(&[(1, vec![Some(0), Some(1)])]);
        assert!(matches!(
            detect_events(&p, &MatchConfig::new(1), Qoi::Ate),
            Err(Error::Configuration(_))
        ));
    }
}

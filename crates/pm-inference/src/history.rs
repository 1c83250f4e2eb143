//! History matcher: raw matched sets by exact treatment-history equality.
//!
//! For an event `(u, t)` with lag `L`, a control `c` is eligible iff it is
//! observed on every period of `[t-L, t]`, agrees with `u` on `[t-L, t-1]`
//! and holds the pre-switch status at `t`.
//!
//! Candidates are bucketed once per distinct event period: NA-free histories
//! go into a hash table keyed by the packed 0/1 pattern, so an NA-free treated
//! history resolves its candidates with one lookup. Histories containing NA
//! (only kept under `match_missing`) are compared pairwise with wildcard
//! semantics.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use pm_core::{Error, MatchConfig, MatchedSet, Result, SetFlag};
use rayon::prelude::*;

use crate::events::{EventSite, holds_status};
use crate::panel::{PanelIndex, TreatmentObs};

/// Treatment bits packed 64 per word.
type PatternKey = Vec<u64>;

fn pack(history: &[Option<u8>]) -> Option<PatternKey> {
    let mut words = vec![0u64; history.len().div_ceil(64).max(1)];
    for (i, v) in history.iter().enumerate() {
        match v {
            Some(1) => words[i / 64] |= 1u64 << (i % 64),
            Some(_) => {}
            None => return None,
        }
    }
    Some(words)
}

/// `a` and `b` agree wherever both are observed.
fn wildcard_compatible(a: &[Option<u8>], b: &[Option<u8>]) -> bool {
    a.iter().zip(b).all(|(x, y)| match (x, y) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    })
}

/// Candidate controls for every event sharing one event period.
#[derive(Debug, Default)]
struct HistoryTable {
    /// Packed NA-free history → candidate unit positions.
    exact: HashMap<PatternKey, Vec<usize>>,
    /// Every candidate with its raw lag-window history.
    all: Vec<(usize, Vec<Option<u8>>)>,
    /// Positions in `all` whose history contains NA.
    with_na: Vec<usize>,
}

impl HistoryTable {
    fn build(panel: &PanelIndex, config: &MatchConfig, ti: usize, from: u8) -> Self {
        let lag = config.lag;
        let max_lead = config.max_lead();
        let mut table = HistoryTable::default();

        for ui in 0..panel.n_units() {
            if panel.treatment(ui, ti) != TreatmentObs::Observed(from) {
                continue;
            }
            if config.forbid_treatment_reversal
                && max_lead > 0
                && !holds_status(panel, ui, ti + 1..=ti.saturating_add(max_lead), from, config.match_missing)
            {
                continue;
            }
            let Some(history) = window(panel, ui, ti, lag) else {
                continue;
            };
            let has_na = history.iter().any(Option::is_none);
            if has_na && !config.match_missing {
                continue;
            }
            match pack(&history) {
                Some(key) => table.exact.entry(key).or_default().push(ui),
                None => table.with_na.push(table.all.len()),
            }
            table.all.push((ui, history));
        }
        table
    }

    fn candidates(&self, treated: &[Option<u8>]) -> Vec<usize> {
        match pack(treated) {
            Some(key) => {
                let mut out = self.exact.get(&key).cloned().unwrap_or_default();
                out.extend(
                    self.with_na
                        .iter()
                        .map(|&i| &self.all[i])
                        .filter(|(_, h)| wildcard_compatible(h, treated))
                        .map(|(ui, _)| *ui),
                );
                out
            }
            None => self
                .all
                .iter()
                .filter(|(_, h)| wildcard_compatible(h, treated))
                .map(|(ui, _)| *ui)
                .collect(),
        }
    }
}

/// Lag-window treatment history `[ti-lag, ti-1]`.
///
/// `None` when the window leaves the grid or any period is unobserved.
fn window(panel: &PanelIndex, ui: usize, ti: usize, lag: usize) -> Option<Vec<Option<u8>>> {
    let start = ti.checked_sub(lag)?;
    (start..ti)
        .map(|pos| match panel.treatment(ui, pos) {
            TreatmentObs::Absent => None,
            TreatmentObs::Na => Some(None),
            TreatmentObs::Observed(v) => Some(Some(v)),
        })
        .collect()
}

fn match_one(
    panel: &PanelIndex,
    config: &MatchConfig,
    site: &EventSite,
    tables: &HashMap<(usize, u8), HistoryTable>,
) -> MatchedSet {
    let mut set = MatchedSet::new(site.event, []);
    if site.time_idx < config.lag {
        set.flag(SetFlag::InsufficientHistory);
        return set;
    }
    let Some(history) = window(panel, site.unit_idx, site.time_idx, config.lag) else {
        set.flag(SetFlag::TreatedHistoryMissing);
        return set;
    };
    if !config.match_missing && history.iter().any(Option::is_none) {
        set.flag(SetFlag::TreatedHistoryMissing);
        return set;
    }
    let Some(table) = tables.get(&(site.time_idx, site.from)) else {
        return set;
    };

    let units = panel.units();
    let controls: BTreeSet<u64> = table
        .candidates(&history)
        .into_iter()
        .filter(|&ui| ui != site.unit_idx)
        .map(|ui| units[ui])
        .collect();
    MatchedSet::new(site.event, controls)
}

/// Build raw (unweighted) matched sets, one per event, in event order.
///
/// Controls inside a set are sorted by unit id. An event with no eligible
/// control gets an empty set, never an error.
pub fn match_histories(
    panel: &PanelIndex,
    config: &MatchConfig,
    sites: &[EventSite],
    cancel: Option<&AtomicBool>,
) -> Result<Vec<MatchedSet>> {
    let keys: BTreeSet<(usize, u8)> = sites
        .iter()
        .filter(|s| s.time_idx >= config.lag)
        .map(|s| (s.time_idx, s.from))
        .collect();
    let tables: HashMap<(usize, u8), HistoryTable> = keys
        .into_par_iter()
        .map(|(ti, from)| ((ti, from), HistoryTable::build(panel, config, ti, from)))
        .collect();

    let sets: Vec<Option<MatchedSet>> = sites
        .par_iter()
        .map(|site| {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return None;
            }
            Some(match_one(panel, config, site, &tables))
        })
        .collect();

    let sets: Option<Vec<MatchedSet>> = sets.into_iter().collect();
    let sets = sets.ok_or(Error::Cancelled)?;
    let n_empty = sets.iter().filter(|s| s.controls.is_empty()).count();
    log::debug!("history matching: {} event(s), {} without eligible controls", sets.len(), n_empty);
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::detect_event_sites;
    use pm_core::{PanelRecord, Qoi};

    fn panel(rows: &[(u64, Vec<Option<u8>>)]) -> PanelIndex {
        let records: Vec<PanelRecord> = rows
            .iter()
            .flat_map(|(u, path)| {
                path.iter()
                    .enumerate()
                    .filter(|(_, d)| **d != Some(9))
                    .map(move |(i, &d)| PanelRecord::new(*u, 1988 + i as i64, d, Some(1.0)))
            })
            .collect();
        PanelIndex::from_records(&records).unwrap()
    }

    fn sets(p: &PanelIndex, cfg: &MatchConfig) -> Vec<MatchedSet> {
        let sites = detect_event_sites(p, cfg, Qoi::Att).unwrap();
        match_histories(p, cfg, &sites, None).unwrap()
    }

    fn control_ids(set: &MatchedSet) -> Vec<u64> {
        set.controls.iter().map(|c| c.unit).collect()
    }

    #[test]
    fn test_pack_distinguishes_patterns() {
        assert_eq!(pack(&[Some(0), Some(1)]), Some(vec![0b10]));
        assert_ne!(pack(&[Some(1), Some(0)]), pack(&[Some(0), Some(1)]));
        assert_eq!(pack(&[Some(1), None]), None);
        let long: Vec<Option<u8>> = (0..70).map(|i| Some((i == 65) as u8)).collect();
        assert_eq!(pack(&long).unwrap().len(), 2);
    }

    #[test]
    fn test_basic_scenario_both_controls_eligible() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[(1, vec![z, z, z, o, o]), (2, vec![z; 5]), (3, vec![z; 5])]);
        let s = sets(&p, &MatchConfig::new(3));
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].event.time, 1991);
        assert_eq!(control_ids(&s[0]), vec![2, 3]);
    }

    #[test]
    fn test_history_mismatch_excludes() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[
            (1, vec![z, z, z, o]),
            (2, vec![o, z, z, z]),
            (3, vec![z, z, z, o]),
            (4, vec![z, z, z, z]),
        ]);
        let s = sets(&p, &MatchConfig::new(3));
        // unit 3 switches at the same time so it is not a control
        assert_eq!(control_ids(&s[0]), vec![4]);
        assert_eq!(control_ids(&s[1]), vec![4]);
    }

    #[test]
    fn test_unobserved_window_disqualifies_control() {
        let z = Some(0);
        let o = Some(1);
        let gap = Some(9);
        let p = panel(&[(1, vec![z, z, z, o]), (2, vec![z, gap, z, z]), (3, vec![z, z, z, z])]);
        let s = sets(&p, &MatchConfig::new(3));
        assert_eq!(control_ids(&s[0]), vec![3]);
    }

    #[test]
    fn test_match_missing_wildcards() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[(1, vec![z, z, z, o]), (2, vec![z, None, z, z]), (3, vec![z, z, z, z])]);
        let on = sets(&p, &MatchConfig::new(3).with_match_missing(true));
        assert_eq!(control_ids(&on[0]), vec![2, 3]);
        let off = sets(&p, &MatchConfig::new(3).with_match_missing(false));
        assert_eq!(control_ids(&off[0]), vec![3]);
    }

    #[test]
    fn test_treated_na_history() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[(1, vec![z, None, z, o]), (2, vec![z, o, z, z]), (3, vec![z, z, z, z])]);
        let on = sets(&p, &MatchConfig::new(3).with_match_missing(true));
        assert_eq!(control_ids(&on[0]), vec![2, 3]);
        let off = sets(&p, &MatchConfig::new(3).with_match_missing(false));
        assert!(off[0].controls.is_empty());
        assert!(off[0].flags.contains(&SetFlag::TreatedHistoryMissing));
    }

    #[test]
    fn test_control_na_at_event_period_disqualifies() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[(1, vec![z, z, o]), (2, vec![z, z, None])]);
        let s = sets(&p, &MatchConfig::new(2));
        assert!(s[0].controls.is_empty());
    }

    #[test]
    fn test_insufficient_history_flag() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[(1, vec![z, o]), (2, vec![z, z])]);
        let s = sets(&p, &MatchConfig::new(3));
        assert_eq!(s.len(), 1);
        assert!(s[0].is_empty());
        assert!(s[0].flags.contains(&SetFlag::InsufficientHistory));
    }

    #[test]
    fn test_forbid_reversal_excludes_switching_control() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[
            (1, vec![z, z, z, o, o, o]),
            (2, vec![z, z, z, z, z, o]),
            (3, vec![z, z, z, z, z, z]),
        ]);
        let base = MatchConfig::new(3).with_lead([0, 1, 2]);
        assert_eq!(control_ids(&sets(&p, &base)[0]), vec![2, 3]);
        let strict = base.with_forbid_treatment_reversal(true);
        assert_eq!(control_ids(&sets(&p, &strict)[0]), vec![3]);
    }

    #[test]
    fn test_cancellation() {
        let z = Some(0);
        let o = Some(1);
        let p = panel(&[(1, vec![z, o]), (2, vec![z, z])]);
        let cfg = MatchConfig::new(1);
        let sites = detect_event_sites(&p, &cfg, Qoi::Att).unwrap();
        let flag = AtomicBool::new(true);
        assert!(matches!(match_histories(&p, &cfg, &sites, Some(&flag)), Err(Error::Cancelled)));
    }
}

//! Common data types for panel matching

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::MatchConfig;

/// One raw observation of a panel dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRecord {
    /// Unit identifier.
    pub unit: u64,
    /// Time identifier (e.g. a year).
    pub time: i64,
    /// Treatment indicator: `Some(0)`, `Some(1)` or `None` for NA.
    pub treatment: Option<u8>,
    /// Outcome value, `None` for NA.
    pub outcome: Option<f64>,
    /// Named covariates. A name absent from the map is treated as NA.
    #[serde(default)]
    pub covariates: BTreeMap<String, Option<f64>>,
}

impl PanelRecord {
    /// Create a record without covariates.
    pub fn new(unit: u64, time: i64, treatment: Option<u8>, outcome: Option<f64>) -> Self {
        Self { unit, time, treatment, outcome, covariates: BTreeMap::new() }
    }

    /// Attach a covariate value.
    pub fn with_covariate(mut self, name: impl Into<String>, value: Option<f64>) -> Self {
        self.covariates.insert(name.into(), value);
        self
    }
}

/// Quantity of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qoi {
    /// Average treatment effect on the treated (control → treatment switches).
    Att,
    /// Average treatment effect on the controls (treatment → control switches,
    /// reported on the treatment-effect scale).
    Atc,
    /// Average effect of treatment reversal for reversed units.
    Art,
    /// Event-count weighted combination of `Att` and `Atc`.
    Ate,
}

impl Qoi {
    /// `(status before, status after)` of the switch that defines an event.
    ///
    /// `None` for composite quantities (`Ate`).
    pub fn switch(self) -> Option<(u8, u8)> {
        match self {
            Qoi::Att => Some((0, 1)),
            Qoi::Atc | Qoi::Art => Some((1, 0)),
            Qoi::Ate => None,
        }
    }

    /// Component quantities that own matched sets.
    pub fn components(self) -> &'static [Qoi] {
        match self {
            Qoi::Att => &[Qoi::Att],
            Qoi::Atc => &[Qoi::Atc],
            Qoi::Art => &[Qoi::Art],
            Qoi::Ate => &[Qoi::Att, Qoi::Atc],
        }
    }

    /// Sign applied to the raw `event unit − controls` contrast.
    pub fn contrast_sign(self) -> f64 {
        match self {
            Qoi::Atc => -1.0,
            _ => 1.0,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Qoi::Att => "att",
            Qoi::Atc => "atc",
            Qoi::Art => "art",
            Qoi::Ate => "ate",
        }
    }
}

impl std::fmt::Display for Qoi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(unit, time)` pair where the unit switches treatment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreatedEvent {
    /// Switching unit.
    pub unit: u64,
    /// First period with the new status.
    pub time: i64,
}

/// Role of a control unit after refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    /// Kept by refinement; carries weight.
    Retained,
    /// Eligible by history but dropped by top-k selection.
    Pruned,
    /// Removed by listwise deletion of missing covariates.
    Excluded,
}

/// A control unit inside a matched set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMatch {
    /// Control unit identifier.
    pub unit: u64,
    /// Raw similarity score (distance, propensity gap or odds), if scored.
    pub score: Option<f64>,
    /// Unnormalized weight produced by refinement.
    pub raw_weight: f64,
    /// Normalized weight in `[0, 1]`.
    pub weight: f64,
    /// Refinement outcome.
    pub status: ControlStatus,
}

impl ControlMatch {
    /// Fresh, unscored eligible control.
    pub fn eligible(unit: u64) -> Self {
        Self { unit, score: None, raw_weight: 0.0, weight: 0.0, status: ControlStatus::Retained }
    }
}

/// Per-set annotation for degraded or partially usable sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetFlag {
    /// Lag window starts before the first panel period.
    InsufficientHistory,
    /// Treated unit has NA or unobserved treatment in its own lag window.
    TreatedHistoryMissing,
    /// Treated unit has NA covariates and was listwise deleted.
    TreatedCovariatesMissing,
    /// Propensity model failed; weights fell back to equal weighting.
    ConvergenceFallback {
        /// Model failure message.
        message: String,
    },
    /// All raw weights were zero or non-finite; equal weights were used.
    DegenerateWeights,
}

/// A treated event together with its comparable control units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedSet {
    /// Owning event.
    pub event: TreatedEvent,
    /// Eligible controls (order irrelevant).
    pub controls: Vec<ControlMatch>,
    /// Annotations.
    pub flags: Vec<SetFlag>,
}

impl MatchedSet {
    /// Unweighted set with the given eligible controls.
    pub fn new(event: TreatedEvent, controls: impl IntoIterator<Item = u64>) -> Self {
        Self {
            event,
            controls: controls.into_iter().map(ControlMatch::eligible).collect(),
            flags: Vec::new(),
        }
    }

    /// Number of history-eligible controls.
    pub fn n_eligible(&self) -> usize {
        self.controls.len()
    }

    /// Number of controls carrying positive weight.
    pub fn n_weighted(&self) -> usize {
        self.controls.iter().filter(|c| c.weight > 0.0).count()
    }

    /// `true` when no control carries weight.
    pub fn is_empty(&self) -> bool {
        self.n_weighted() == 0
    }

    /// Positive weights keyed by control unit.
    pub fn weights(&self) -> BTreeMap<u64, f64> {
        self.controls.iter().filter(|c| c.weight > 0.0).map(|c| (c.unit, c.weight)).collect()
    }

    /// Weight of a control unit (0 if absent).
    pub fn weight_of(&self, unit: u64) -> f64 {
        self.controls.iter().find(|c| c.unit == unit).map(|c| c.weight).unwrap_or(0.0)
    }

    /// Sum of normalized weights.
    pub fn total_weight(&self) -> f64 {
        self.controls.iter().map(|c| c.weight).sum()
    }

    /// Add a flag once.
    pub fn flag(&mut self, flag: SetFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    /// Whether the set carries a convergence fallback flag.
    pub fn has_convergence_fallback(&self) -> bool {
        self.flags.iter().any(|f| matches!(f, SetFlag::ConvergenceFallback { .. }))
    }
}

/// Matched sets per quantity of interest plus the configuration that built them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingResult {
    /// Producing configuration.
    pub config: MatchConfig,
    /// Ordered matched sets per component quantity of interest.
    pub sets: BTreeMap<Qoi, Vec<MatchedSet>>,
}

impl MatchingResult {
    /// Matched sets for one component quantity.
    pub fn sets_for(&self, qoi: Qoi) -> Option<&[MatchedSet]> {
        self.sets.get(&qoi).map(Vec::as_slice)
    }

    /// Total number of events across quantities.
    pub fn n_events(&self) -> usize {
        self.sets.values().map(Vec::len).sum()
    }

    /// Number of empty sets across quantities.
    pub fn n_empty(&self) -> usize {
        self.sets.values().flatten().filter(|s| s.is_empty()).count()
    }

    /// Sizes (number of weighted controls) of every set for one quantity.
    pub fn set_sizes(&self, qoi: Qoi) -> Vec<usize> {
        self.sets_for(qoi).map(|s| s.iter().map(MatchedSet::n_weighted).collect()).unwrap_or_default()
    }
}

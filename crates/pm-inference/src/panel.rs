//! Panel index: `(unit, time)` lookup over raw panel records.
//!
//! Records are laid out in a dense `units × periods` grid where the period
//! axis is the sorted set of distinct time values seen anywhere in the panel.
//! "Previous period" always means the previous grid position, so yearly,
//! quarterly or irregular calendars are handled the same way. Irregular
//! spacing and per-unit gaps are reported but never interpolated: an absent
//! cell stays distinct from a present cell with NA treatment.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use pm_core::{ColumnNames, Error, PanelRecord, Result};
use serde::Serialize;

/// Treatment value of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreatmentObs {
    /// No record for this `(unit, time)`.
    Absent,
    /// Record present, treatment is NA.
    Na,
    /// Record present with a 0/1 treatment.
    Observed(u8),
}

#[derive(Debug, Clone)]
struct Cell {
    treatment: Option<u8>,
    outcome: Option<f64>,
    covariates: Vec<Option<f64>>,
}

/// Gap and spacing report produced while indexing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PanelDiagnostics {
    /// Number of indexed records.
    pub n_records: usize,
    /// Distinct step sizes between consecutive grid periods differ.
    pub irregular_spacing: bool,
    /// Grid periods missing inside each unit's observed range.
    pub gaps: BTreeMap<u64, Vec<i64>>,
}

impl PanelDiagnostics {
    /// `true` when every unit is observed on every period of its span.
    pub fn is_gap_free(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// A column of a [`PanelTable`].
#[derive(Debug, Clone, PartialEq)]
pub enum PanelColumn {
    /// Integer identifiers (unit, time).
    Id(Vec<i64>),
    /// Numeric values with NA.
    Numeric(Vec<Option<f64>>),
}

impl PanelColumn {
    fn len(&self) -> usize {
        match self {
            PanelColumn::Id(v) => v.len(),
            PanelColumn::Numeric(v) => v.len(),
        }
    }
}

/// Columnar panel input keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelTable {
    columns: BTreeMap<String, PanelColumn>,
}

impl PanelTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identifier column.
    pub fn with_ids(mut self, name: impl Into<String>, values: Vec<i64>) -> Self {
        self.columns.insert(name.into(), PanelColumn::Id(values));
        self
    }

    /// Add a numeric column.
    pub fn with_numeric(mut self, name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        self.columns.insert(name.into(), PanelColumn::Numeric(values));
        self
    }

    /// Convert to records. Every numeric column other than treatment and
    /// outcome becomes a covariate.
    pub fn to_records(&self, names: &ColumnNames) -> Result<Vec<PanelRecord>> {
        let ids = |name: &str| -> Result<&Vec<i64>> {
            match self.columns.get(name) {
                Some(PanelColumn::Id(v)) => Ok(v),
                Some(PanelColumn::Numeric(_)) => Err(Error::Configuration(format!(
                    "column '{name}' must be an identifier column"
                ))),
                None => Err(Error::Configuration(format!("column '{name}' not found"))),
            }
        };
        let numeric = |name: &str| -> Result<&Vec<Option<f64>>> {
            match self.columns.get(name) {
                Some(PanelColumn::Numeric(v)) => Ok(v),
                Some(PanelColumn::Id(_)) => {
                    Err(Error::Configuration(format!("column '{name}' must be numeric")))
                }
                None => Err(Error::Configuration(format!("column '{name}' not found"))),
            }
        };

        let units = ids(&names.unit)?;
        let times = ids(&names.time)?;
        let treatment = numeric(&names.treatment)?;
        let outcome = numeric(&names.outcome)?;
        let n = units.len();
        if let Some((name, col)) = self.columns.iter().find(|(_, c)| c.len() != n) {
            return Err(Error::MalformedPanel(format!(
                "column '{name}' has {} rows, expected {n}",
                col.len()
            )));
        }

        let reserved = [&names.unit, &names.time, &names.treatment, &names.outcome];
        let covariates: Vec<(&String, &Vec<Option<f64>>)> = self
            .columns
            .iter()
            .filter(|(name, _)| !reserved.contains(name))
            .filter_map(|(name, col)| match col {
                PanelColumn::Numeric(v) => Some((name, v)),
                PanelColumn::Id(_) => None,
            })
            .collect();

        let mut records = Vec::with_capacity(n);
        for i in 0..n {
            let unit = u64::try_from(units[i]).map_err(|_| {
                Error::MalformedPanel(format!("row {i}: negative unit id {}", units[i]))
            })?;
            let treat = match treatment[i] {
                None => None,
                Some(v) if v == 0.0 => Some(0),
                Some(v) if v == 1.0 => Some(1),
                Some(v) => {
                    return Err(Error::MalformedPanel(format!(
                        "row {i}: treatment must be 0, 1 or NA, got {v}"
                    )));
                }
            };
            let mut rec = PanelRecord::new(unit, times[i], treat, outcome[i]);
            for (name, col) in &covariates {
                rec.covariates.insert((*name).clone(), col[i]);
            }
            records.push(rec);
        }
        Ok(records)
    }
}

/// Immutable `(unit, time)` lookup structure.
#[derive(Debug, Clone)]
pub struct PanelIndex {
    units: Vec<u64>,
    times: Vec<i64>,
    unit_pos: HashMap<u64, usize>,
    time_pos: HashMap<i64, usize>,
    covariate_names: Vec<String>,
    covariate_pos: HashMap<String, usize>,
    cells: Vec<Option<Cell>>,
    diagnostics: PanelDiagnostics,
}

impl PanelIndex {
    /// Index raw records.
    ///
    /// Fails with [`Error::MalformedPanel`] on duplicate `(unit, time)` pairs,
    /// treatment values other than 0/1/NA, or non-finite numbers.
    pub fn from_records(records: &[PanelRecord]) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::MalformedPanel("panel has no records".into()));
        }

        let units: Vec<u64> =
            records.iter().map(|r| r.unit).collect::<BTreeSet<_>>().into_iter().collect();
        let times: Vec<i64> =
            records.iter().map(|r| r.time).collect::<BTreeSet<_>>().into_iter().collect();
        let covariate_names: Vec<String> = records
            .iter()
            .flat_map(|r| r.covariates.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let unit_pos: HashMap<u64, usize> = units.iter().enumerate().map(|(i, &u)| (u, i)).collect();
        let time_pos: HashMap<i64, usize> = times.iter().enumerate().map(|(i, &t)| (t, i)).collect();
        let covariate_pos: HashMap<String, usize> =
            covariate_names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

        let n_times = times.len();
        let mut cells: Vec<Option<Cell>> = vec![None; units.len() * n_times];

        for rec in records {
            if let Some(t) = rec.treatment.filter(|&t| t > 1) {
                return Err(Error::MalformedPanel(format!(
                    "treatment must be 0, 1 or NA, got {t} at (unit={}, time={})",
                    rec.unit, rec.time
                )));
            }
            if rec.outcome.is_some_and(|y| !y.is_finite()) {
                return Err(Error::MalformedPanel(format!(
                    "non-finite outcome at (unit={}, time={})",
                    rec.unit, rec.time
                )));
            }
            let mut covariates = vec![None; covariate_names.len()];
            for (name, value) in &rec.covariates {
                if value.is_some_and(|v| !v.is_finite()) {
                    return Err(Error::MalformedPanel(format!(
                        "non-finite covariate '{name}' at (unit={}, time={})",
                        rec.unit, rec.time
                    )));
                }
                covariates[covariate_pos[name]] = *value;
            }

            let slot = unit_pos[&rec.unit] * n_times + time_pos[&rec.time];
            if cells[slot].is_some() {
                return Err(Error::MalformedPanel(format!(
                    "duplicate record for (unit={}, time={})",
                    rec.unit, rec.time
                )));
            }
            cells[slot] =
                Some(Cell { treatment: rec.treatment, outcome: rec.outcome, covariates });
        }

        let mut index = Self {
            units,
            times,
            unit_pos,
            time_pos,
            covariate_names,
            covariate_pos,
            cells,
            diagnostics: PanelDiagnostics::default(),
        };
        index.diagnostics = index.scan_diagnostics(records.len());
        Ok(index)
    }

    /// Index a columnar table using the configured column names.
    pub fn from_table(table: &PanelTable, names: &ColumnNames) -> Result<Self> {
        Self::from_records(&table.to_records(names)?)
    }

    fn scan_diagnostics(&self, n_records: usize) -> PanelDiagnostics {
        let steps: BTreeSet<i64> = self.times.windows(2).map(|w| w[1] - w[0]).collect();
        let irregular_spacing = steps.len() > 1;
        if irregular_spacing {
            log::warn!("panel: irregular time spacing, distinct steps {steps:?}; using grid order");
        }

        let mut gaps = BTreeMap::new();
        for (ui, &unit) in self.units.iter().enumerate() {
            let observed: Vec<usize> =
                (0..self.times.len()).filter(|&ti| self.cell(ui, ti).is_some()).collect();
            let (Some(&first), Some(&last)) = (observed.first(), observed.last()) else {
                continue;
            };
            let missing: Vec<i64> = (first..=last)
                .filter(|&ti| self.cell(ui, ti).is_none())
                .map(|ti| self.times[ti])
                .collect();
            if !missing.is_empty() {
                gaps.insert(unit, missing);
            }
        }
        if !gaps.is_empty() {
            log::warn!("panel: {} unit(s) have gaps inside their observed range", gaps.len());
        }

        PanelDiagnostics { n_records, irregular_spacing, gaps }
    }

    #[inline]
    fn cell(&self, ui: usize, ti: usize) -> Option<&Cell> {
        self.cells[ui * self.times.len() + ti].as_ref()
    }

    /// Sorted unit identifiers.
    pub fn units(&self) -> &[u64] {
        &self.units
    }

    /// Sorted time grid.
    pub fn times(&self) -> &[i64] {
        &self.times
    }

    /// Number of units.
    pub fn n_units(&self) -> usize {
        self.units.len()
    }

    /// Number of grid periods.
    pub fn n_periods(&self) -> usize {
        self.times.len()
    }

    /// Position of a unit in [`units`](Self::units).
    pub fn unit_index(&self, unit: u64) -> Option<usize> {
        self.unit_pos.get(&unit).copied()
    }

    /// Position of a time value on the grid.
    pub fn time_index(&self, time: i64) -> Option<usize> {
        self.time_pos.get(&time).copied()
    }

    /// Whether a record exists for `(unit, time)`.
    pub fn contains(&self, unit: u64, time: i64) -> bool {
        match (self.unit_index(unit), self.time_index(time)) {
            (Some(ui), Some(ti)) => self.cell(ui, ti).is_some(),
            _ => false,
        }
    }

    /// Observed times of one unit, ascending.
    pub fn unit_times(&self, unit: u64) -> Vec<i64> {
        let Some(ui) = self.unit_index(unit) else {
            return Vec::new();
        };
        (0..self.times.len())
            .filter(|&ti| self.cell(ui, ti).is_some())
            .map(|ti| self.times[ti])
            .collect()
    }

    /// Treatment at grid position `(ui, ti)`.
    #[inline]
    pub fn treatment(&self, ui: usize, ti: usize) -> TreatmentObs {
        match self.cell(ui, ti) {
            None => TreatmentObs::Absent,
            Some(Cell { treatment: None, .. }) => TreatmentObs::Na,
            Some(Cell { treatment: Some(v), .. }) => TreatmentObs::Observed(*v),
        }
    }

    /// Treatment at signed grid offset from `ti`; out-of-grid positions are absent.
    #[inline]
    pub fn treatment_at_offset(&self, ui: usize, ti: usize, offset: isize) -> TreatmentObs {
        match self.offset(ti, offset) {
            Some(pos) => self.treatment(ui, pos),
            None => TreatmentObs::Absent,
        }
    }

    /// Outcome at grid position; `None` when absent or NA.
    #[inline]
    pub fn outcome(&self, ui: usize, ti: usize) -> Option<f64> {
        self.cell(ui, ti).and_then(|c| c.outcome)
    }

    /// Outcome at signed grid offset from `ti`.
    #[inline]
    pub fn outcome_at_offset(&self, ui: usize, ti: usize, offset: isize) -> Option<f64> {
        self.offset(ti, offset).and_then(|pos| self.outcome(ui, pos))
    }

    /// Covariate names, sorted.
    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    /// Column position of a covariate.
    pub fn covariate_index(&self, name: &str) -> Option<usize> {
        self.covariate_pos.get(name).copied()
    }

    /// Covariate value at signed grid offset from `ti`; `None` when absent or NA.
    #[inline]
    pub fn covariate_at_offset(&self, ui: usize, ti: usize, ci: usize, offset: isize) -> Option<f64> {
        self.offset(ti, offset).and_then(|pos| self.cell(ui, pos)).and_then(|c| c.covariates[ci])
    }

    /// Grid position `ti + offset` if it lies on the grid.
    #[inline]
    pub fn offset(&self, ti: usize, offset: isize) -> Option<usize> {
        let pos = ti.checked_add_signed(offset)?;
        (pos < self.times.len()).then_some(pos)
    }

    /// Sample standard deviation of a covariate over every observed cell.
    pub fn pooled_sd(&self, ci: usize) -> Option<f64> {
        let values: Vec<f64> =
            self.cells.iter().flatten().filter_map(|c| c.covariates[ci]).collect();
        let sd = crate::math::sample_sd(&values);
        sd.is_finite().then_some(sd)
    }

    /// Gap and spacing report.
    pub fn diagnostics(&self) -> &PanelDiagnostics {
        &self.diagnostics
    }
}

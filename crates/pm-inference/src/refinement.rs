//! Refinement engine: scores and selects controls inside raw matched sets.
//!
//! The strategy is a closed set dispatched on [`RefinementMethod`]:
//!
//! | method              | score                       | selection                  |
//! |---------------------|-----------------------------|----------------------------|
//! | `none`              | 1                           | every eligible control     |
//! | `mahalanobis`       | distance to treated unit    | `size_match` nearest       |
//! | `ps.match`/`CBPS.match` | `|ps_c − ps_treated|`   | `size_match` nearest       |
//! | `ps.weight`/`CBPS.weight` | `ps_c`                | all, raw weight = odds     |
//! | `*.msm.weight`      | `Π_lead odds`               | all, raw weight = product  |
//!
//! Ties in top-k selection break by unit id ascending. Refinement writes raw
//! scores, raw weights and statuses; the weight normalizer turns raw weights
//! into the final per-set weights.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::DMatrix;
use pm_core::{
    ControlStatus, Error, MatchConfig, MatchedSet, PropensityModel, PropensityPool,
    RefinementMethod, Result, SetFlag,
};
use rayon::prelude::*;

use crate::math::odds;
use crate::panel::PanelIndex;
use crate::propensity::{CbpsModel, LogitModel};

/// Variance entries below this are treated as zero.
const VAR_EPS: f64 = 1e-12;

/// Panel covariate position and lag offset of one design column.
#[derive(Debug, Clone, Copy)]
struct ColumnSpec {
    ci: usize,
    lag: usize,
}

/// Covariate rows of one matched set, one design per anchor shift.
#[derive(Debug, Default)]
struct Prepared {
    /// Positions in `set.controls` that carry a covariate row.
    active: Vec<usize>,
    /// Positions removed by listwise deletion.
    excluded: Vec<usize>,
    /// Treated unit removed by listwise deletion.
    treated_missing: bool,
    /// `(treated row, active control rows)` per shift.
    designs: Vec<(Vec<f64>, Vec<Vec<f64>>)>,
}

impl Prepared {
    fn is_ready(&self) -> bool {
        !self.treated_missing && !self.active.is_empty()
    }
}

/// Scored control: position in the set, raw score, raw weight, kept or pruned.
#[derive(Debug, Clone, Copy)]
struct ControlScore {
    pos: usize,
    score: f64,
    raw_weight: f64,
    retained: bool,
}

/// Fitted propensity of the treated row and each active control row.
type PoolScores = (f64, Vec<f64>);

/// Refinement engine bound to one panel and configuration.
pub struct Refiner<'a> {
    panel: &'a PanelIndex,
    config: &'a MatchConfig,
    columns: Vec<ColumnSpec>,
    model: Box<dyn PropensityModel + 'a>,
}

impl std::fmt::Debug for Refiner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refiner")
            .field("method", &self.config.refinement_method)
            .field("columns", &self.columns.len())
            .field("model", &self.model.name())
            .finish()
    }
}

impl<'a> Refiner<'a> {
    /// Resolve covariate terms against the panel.
    ///
    /// Unknown covariate names are a [`Error::Configuration`].
    pub fn new(panel: &'a PanelIndex, config: &'a MatchConfig) -> Result<Self> {
        let mut columns = Vec::with_capacity(config.n_covariate_columns());
        for term in &config.covariates {
            let ci = panel.covariate_index(&term.name).ok_or_else(|| {
                Error::Configuration(format!("covariate '{}' not found in panel", term.name))
            })?;
            columns.extend(term.lags.iter().map(|&lag| ColumnSpec { ci, lag }));
        }
        let model: Box<dyn PropensityModel> = if config.refinement_method.uses_cbps() {
            Box::new(CbpsModel::default())
        } else {
            Box::new(LogitModel::default())
        };
        Ok(Self { panel, config, columns, model })
    }

    /// Replace the propensity model.
    pub fn with_model(mut self, model: Box<dyn PropensityModel + 'a>) -> Self {
        self.model = model;
        self
    }

    /// Score, select and flag controls of every set in place.
    pub fn refine(&self, sets: &mut [MatchedSet], cancel: Option<&AtomicBool>) -> Result<()> {
        match self.config.refinement_method {
            RefinementMethod::None => {
                for set in sets.iter_mut() {
                    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                        return Err(Error::Cancelled);
                    }
                    for c in &mut set.controls {
                        c.score = Some(1.0);
                        c.raw_weight = 1.0;
                        c.status = ControlStatus::Retained;
                    }
                }
                Ok(())
            }
            RefinementMethod::Mahalanobis => self.refine_mahalanobis(sets, cancel),
            _ => self.refine_propensity(sets, cancel),
        }
    }

    fn locate(&self, unit: u64, time: i64) -> Result<(usize, usize)> {
        match (self.panel.unit_index(unit), self.panel.time_index(time)) {
            (Some(ui), Some(ti)) => Ok((ui, ti)),
            _ => Err(Error::Validation(format!(
                "matched set (unit={unit}, time={time}) does not belong to this panel"
            ))),
        }
    }

    fn raw_row(&self, ui: usize, ti: usize, shift: usize) -> Vec<Option<f64>> {
        self.columns
            .iter()
            .map(|c| {
                let shift = isize::try_from(shift).ok()?;
                let offset = shift.checked_sub(isize::try_from(c.lag).ok()?)?;
                self.panel.covariate_at_offset(ui, ti, c.ci, offset)
            })
            .collect()
    }

    /// Gather covariate rows for each shift, applying listwise deletion or
    /// mean imputation.
    fn prepare(&self, set: &MatchedSet, shifts: &[usize]) -> Result<Prepared> {
        let mut prep = Prepared::default();
        if set.controls.is_empty() {
            return Ok(prep);
        }
        let (ui, ti) = self.locate(set.event.unit, set.event.time)?;
        let control_idx: Vec<usize> = set
            .controls
            .iter()
            .map(|c| self.locate(c.unit, set.event.time).map(|(u, _)| u))
            .collect::<Result<_>>()?;

        let treated_raw: Vec<Vec<Option<f64>>> =
            shifts.iter().map(|&s| self.raw_row(ui, ti, s)).collect();
        let controls_raw: Vec<Vec<Vec<Option<f64>>>> = control_idx
            .iter()
            .map(|&cu| shifts.iter().map(|&s| self.raw_row(cu, ti, s)).collect())
            .collect();

        let complete = |rows: &[Vec<Option<f64>>]| rows.iter().flatten().all(Option::is_some);

        if self.config.listwise_delete {
            if !complete(treated_raw.as_slice()) {
                prep.treated_missing = true;
                prep.excluded = (0..set.controls.len()).collect();
                return Ok(prep);
            }
            for (pos, rows) in controls_raw.iter().enumerate() {
                if complete(rows.as_slice()) {
                    prep.active.push(pos);
                } else {
                    prep.excluded.push(pos);
                }
            }
        } else {
            prep.active = (0..set.controls.len()).collect();
        }

        let p = self.columns.len();
        for k in 0..shifts.len() {
            // Column means over the pool for imputation.
            let mut means = vec![0.0; p];
            for (j, mean) in means.iter_mut().enumerate() {
                let values: Vec<f64> = std::iter::once(treated_raw[k][j])
                    .chain(prep.active.iter().map(|&pos| controls_raw[pos][k][j]))
                    .flatten()
                    .collect();
                if !values.is_empty() {
                    *mean = values.iter().sum::<f64>() / values.len() as f64;
                }
            }
            let fill = |row: &[Option<f64>]| -> Vec<f64> {
                row.iter().zip(&means).map(|(v, m)| v.unwrap_or(*m)).collect()
            };
            let treated = fill(treated_raw[k].as_slice());
            let controls =
                prep.active.iter().map(|&pos| fill(controls_raw[pos][k].as_slice())).collect();
            prep.designs.push((treated, controls));
        }
        Ok(prep)
    }

    fn prepare_all(
        &self,
        sets: &[MatchedSet],
        shifts: &[usize],
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<Prepared>> {
        sets.par_iter()
            .map(|set| {
                if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    return Err(Error::Cancelled);
                }
                self.prepare(set, shifts)
            })
            .collect()
    }

    fn refine_mahalanobis(&self, sets: &mut [MatchedSet], cancel: Option<&AtomicBool>) -> Result<()> {
        let prepared = self.prepare_all(sets, &[0], cancel)?;
        let diagonal = self.config.use_diagonal_variance_matrix;
        let k = self.config.size_match;

        sets.par_iter_mut().zip(prepared.par_iter()).for_each(|(set, prep)| {
            if !prep.is_ready() {
                apply_scores(set, prep, &[]);
                return;
            }
            let (treated, controls) = &prep.designs[0];
            let inv = inverse_covariance(controls, diagonal);
            let dist = mahalanobis_distances(treated, controls, &inv);
            let mut scores: Vec<ControlScore> = prep
                .active
                .iter()
                .zip(dist)
                .map(|(&pos, d)| ControlScore { pos, score: d, raw_weight: 0.0, retained: false })
                .collect();
            select_top_k(set, &mut scores, k);
            apply_scores(set, prep, &scores);
        });
        Ok(())
    }

    fn refine_propensity(&self, sets: &mut [MatchedSet], cancel: Option<&AtomicBool>) -> Result<()> {
        let method = self.config.refinement_method;
        let shifts: Vec<usize> = if method.is_msm() { self.config.lead.clone() } else { vec![0] };
        let prepared = self.prepare_all(sets, &shifts, cancel)?;

        let fits: Vec<Option<Result<Vec<PoolScores>>>> = match self.config.propensity_pool {
            PropensityPool::PerEvent => prepared
                .par_iter()
                .map(|prep| {
                    prep.is_ready().then(|| {
                        (0..shifts.len()).map(|k| self.fit_design(&prep.designs[k])).collect()
                    })
                })
                .collect(),
            PropensityPool::Pooled => self.fit_pooled(&prepared, shifts.len()),
        };

        let k = self.config.size_match;
        let name = self.model.name();
        sets.par_iter_mut().zip(prepared.par_iter()).zip(fits).for_each(|((set, prep), fit)| {
            let Some(fit) = fit else {
                apply_scores(set, prep, &[]);
                return;
            };
            match fit {
                Ok(per_shift) => {
                    let mut scores = score_propensity(method, prep, &per_shift);
                    if method.is_matching() {
                        select_top_k(set, &mut scores, k);
                    }
                    apply_scores(set, prep, &scores);
                }
                Err(e) => {
                    log::warn!(
                        "refinement ({name}) fell back to equal weights for (unit={}, time={}): {e}",
                        set.event.unit,
                        set.event.time
                    );
                    apply_fallback(set, prep, e.to_string());
                }
            }
        });
        Ok(())
    }

    fn fit_design(&self, design: &(Vec<f64>, Vec<Vec<f64>>)) -> Result<PoolScores> {
        let (treated, controls) = design;
        let p = treated.len();
        let mut x = Vec::with_capacity((controls.len() + 1) * p);
        x.extend_from_slice(treated);
        for row in controls {
            x.extend_from_slice(row);
        }
        let mut labels = vec![false; controls.len() + 1];
        labels[0] = true;
        let ps = self.model.fit_scores(&x, p, &labels)?;
        Ok((ps[0], ps[1..].to_vec()))
    }

    /// One model per shift over every ready set.
    fn fit_pooled(&self, prepared: &[Prepared], n_shifts: usize) -> Vec<Option<Result<Vec<PoolScores>>>> {
        let ready: Vec<usize> = (0..prepared.len()).filter(|&i| prepared[i].is_ready()).collect();
        let p = self.columns.len();

        let mut per_set: Vec<Vec<PoolScores>> = vec![Vec::with_capacity(n_shifts); prepared.len()];
        let mut failure: Option<String> = None;
        for k in 0..n_shifts {
            let mut x = Vec::new();
            let mut labels = Vec::new();
            for &i in &ready {
                let (treated, controls) = &prepared[i].designs[k];
                x.extend_from_slice(treated);
                labels.push(true);
                for row in controls {
                    x.extend_from_slice(row);
                    labels.push(false);
                }
            }
            match self.model.fit_scores(&x, p, &labels) {
                Ok(ps) => {
                    let mut cursor = 0;
                    for &i in &ready {
                        let n_rows = prepared[i].designs[k].1.len();
                        let treated = ps[cursor];
                        let controls = ps[cursor + 1..cursor + 1 + n_rows].to_vec();
                        cursor += 1 + n_rows;
                        per_set[i].push((treated, controls));
                    }
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        (0..prepared.len())
            .map(|i| {
                if !prepared[i].is_ready() {
                    return None;
                }
                Some(match &failure {
                    Some(msg) => Err(Error::RefinementConvergence(format!("pooled fit: {msg}"))),
                    None => Ok(std::mem::take(&mut per_set[i])),
                })
            })
            .collect()
    }
}

fn score_propensity(
    method: RefinementMethod,
    prep: &Prepared,
    per_shift: &[PoolScores],
) -> Vec<ControlScore> {
    prep.active
        .iter()
        .enumerate()
        .map(|(row, &pos)| {
            if method.is_matching() {
                let (treated, controls) = &per_shift[0];
                let gap = (controls[row] - treated).abs();
                ControlScore { pos, score: gap, raw_weight: 0.0, retained: false }
            } else {
                let w: f64 = per_shift.iter().map(|(_, controls)| odds(controls[row])).product();
                let score = if method.is_msm() { w } else { per_shift[0].1[row] };
                ControlScore { pos, score, raw_weight: w, retained: true }
            }
        })
        .collect()
}

/// Keep the `k` smallest scores (ties by unit id) with raw weight 1.
fn select_top_k(set: &MatchedSet, scores: &mut [ControlScore], k: usize) {
    scores.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| set.controls[a.pos].unit.cmp(&set.controls[b.pos].unit))
    });
    for (rank, s) in scores.iter_mut().enumerate() {
        s.retained = rank < k;
        s.raw_weight = if s.retained { 1.0 } else { 0.0 };
    }
}

fn apply_scores(set: &mut MatchedSet, prep: &Prepared, scores: &[ControlScore]) {
    for c in &mut set.controls {
        c.score = None;
        c.raw_weight = 0.0;
        c.weight = 0.0;
        c.status = ControlStatus::Pruned;
    }
    for &pos in &prep.excluded {
        set.controls[pos].status = ControlStatus::Excluded;
    }
    if prep.treated_missing {
        set.flag(SetFlag::TreatedCovariatesMissing);
    }
    for s in scores {
        let c = &mut set.controls[s.pos];
        c.score = Some(s.score);
        c.raw_weight = s.raw_weight;
        c.status = if s.retained { ControlStatus::Retained } else { ControlStatus::Pruned };
    }
}

fn apply_fallback(set: &mut MatchedSet, prep: &Prepared, message: String) {
    apply_scores(set, prep, &[]);
    for &pos in &prep.active {
        let c = &mut set.controls[pos];
        c.raw_weight = 1.0;
        c.status = ControlStatus::Retained;
    }
    set.flag(SetFlag::ConvergenceFallback { message });
}

/// Inverse (or pseudo-inverse) covariance of the control rows.
///
/// Falls back to the identity with fewer than two rows or when every
/// variance is zero.
pub fn inverse_covariance(controls: &[Vec<f64>], diagonal: bool) -> DMatrix<f64> {
    let p = controls.first().map(Vec::len).unwrap_or(0);
    let n = controls.len();
    if n < 2 || p == 0 {
        return DMatrix::identity(p, p);
    }
    let means: Vec<f64> =
        (0..p).map(|j| controls.iter().map(|r| r[j]).sum::<f64>() / n as f64).collect();
    let mut cov = DMatrix::<f64>::zeros(p, p);
    for row in controls {
        for a in 0..p {
            for b in 0..p {
                cov[(a, b)] += (row[a] - means[a]) * (row[b] - means[b]);
            }
        }
    }
    cov /= (n - 1) as f64;

    if cov.trace() <= VAR_EPS {
        return DMatrix::identity(p, p);
    }
    if diagonal {
        return DMatrix::from_fn(p, p, |a, b| {
            let v = cov[(a, a)];
            if a == b && v > VAR_EPS { 1.0 / v } else { 0.0 }
        });
    }
    cov.pseudo_inverse(VAR_EPS).unwrap_or_else(|_| DMatrix::identity(p, p))
}

/// Mahalanobis distance of each control row to the treated row.
pub fn mahalanobis_distances(treated: &[f64], controls: &[Vec<f64>], inv_cov: &DMatrix<f64>) -> Vec<f64> {
    let p = treated.len();
    controls
        .iter()
        .map(|row| {
            let d: Vec<f64> = row.iter().zip(treated).map(|(c, t)| c - t).collect();
            let mut q = 0.0;
            for a in 0..p {
                for b in 0..p {
                    q += d[a] * inv_cov[(a, b)] * d[b];
                }
            }
            q.max(0.0).sqrt()
        })
        .collect()
}

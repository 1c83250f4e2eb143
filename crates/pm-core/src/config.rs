//! Matching and estimation configuration.
//!
//! Both bundles are plain immutable values threaded through every call.
//! They deserialize from JSON with defaults for every optional field and
//! reject unknown keys, so a typo fails loudly instead of silently falling
//! back to a default.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::Qoi;
use crate::{Error, Result};

/// Largest accepted history lag, lead offset or covariate lag.
pub const MAX_OFFSET: usize = 1 << 16;

/// Refinement strategy applied to raw matched sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefinementMethod {
    /// Equal weight over all eligible controls.
    #[serde(rename = "none")]
    None,
    /// Top-k nearest controls by Mahalanobis distance.
    #[serde(rename = "mahalanobis")]
    Mahalanobis,
    /// Top-k nearest controls by logistic propensity score.
    #[serde(rename = "ps.match", alias = "ps_match")]
    PsMatch,
    /// Top-k nearest controls by covariate balancing propensity score.
    #[serde(rename = "CBPS.match", alias = "cbps_match")]
    CbpsMatch,
    /// Odds weighting with logistic propensity scores.
    #[serde(rename = "ps.weight", alias = "ps_weight")]
    PsWeight,
    /// Odds weighting with covariate balancing propensity scores.
    #[serde(rename = "CBPS.weight", alias = "cbps_weight")]
    CbpsWeight,
    /// Marginal structural model weights (product of per-lead logistic odds).
    #[serde(rename = "ps.msm.weight", alias = "ps_msm_weight")]
    PsMsmWeight,
    /// Marginal structural model weights with CBPS per lead.
    #[serde(rename = "CBPS.msm.weight", alias = "cbps_msm_weight")]
    CbpsMsmWeight,
}

impl RefinementMethod {
    /// Whether the method needs at least one covariate term.
    pub fn needs_covariates(self) -> bool {
        !matches!(self, RefinementMethod::None)
    }

    /// Top-k selection methods (equal weight among retained controls).
    pub fn is_matching(self) -> bool {
        matches!(
            self,
            RefinementMethod::Mahalanobis | RefinementMethod::PsMatch | RefinementMethod::CbpsMatch
        )
    }

    /// Methods that fit a propensity model.
    pub fn uses_propensity(self) -> bool {
        !matches!(self, RefinementMethod::None | RefinementMethod::Mahalanobis)
    }

    /// Methods that use the covariate balancing estimator.
    pub fn uses_cbps(self) -> bool {
        matches!(
            self,
            RefinementMethod::CbpsMatch | RefinementMethod::CbpsWeight | RefinementMethod::CbpsMsmWeight
        )
    }

    /// Marginal structural model variants spanning the lead window.
    pub fn is_msm(self) -> bool {
        matches!(self, RefinementMethod::PsMsmWeight | RefinementMethod::CbpsMsmWeight)
    }
}

/// Where propensity models are fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropensityPool {
    /// One model per event: the treated unit against its eligible controls.
    /// A single treated row is often separable, and the set then falls back.
    PerEvent,
    /// One model over all events of a quantity of interest.
    #[default]
    Pooled,
}

/// A covariate, optionally expanded to several lagged copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CovariateTerm {
    /// Covariate name as it appears in the panel.
    pub name: String,
    /// Lag offsets; each contributes one column valued at `t - lag`.
    #[serde(default = "default_term_lags")]
    pub lags: Vec<usize>,
}

fn default_term_lags() -> Vec<usize> {
    vec![0]
}

impl CovariateTerm {
    /// Covariate taken at the event period.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), lags: default_term_lags() }
    }

    /// Covariate expanded to the given lag offsets.
    pub fn lagged(name: impl Into<String>, lags: impl IntoIterator<Item = usize>) -> Self {
        Self { name: name.into(), lags: lags.into_iter().collect() }
    }

    /// Column labels, one per lag (`x`, `x_lag2`, ...).
    pub fn column_labels(&self) -> Vec<String> {
        self.lags
            .iter()
            .map(|&l| if l == 0 { self.name.clone() } else { format!("{}_lag{}", self.name, l) })
            .collect()
    }
}

/// Column names used when building a panel from a columnar table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ColumnNames {
    /// Unit identifier column.
    pub unit: String,
    /// Time identifier column.
    pub time: String,
    /// Treatment indicator column.
    pub treatment: String,
    /// Outcome column.
    pub outcome: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            unit: "unit".to_string(),
            time: "time".to_string(),
            treatment: "treatment".to_string(),
            outcome: "outcome".to_string(),
        }
    }
}

/// Configuration of matched-set construction and refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchConfig {
    /// Number of pre-event periods whose treatment history must match.
    pub lag: usize,
    /// Lead offsets (0 = event period) for which effects are estimated.
    #[serde(default = "default_lead")]
    pub lead: Vec<usize>,
    /// Quantity of interest.
    #[serde(default = "default_qoi")]
    pub qoi: Qoi,
    /// Refinement strategy.
    #[serde(default = "default_method")]
    pub refinement_method: RefinementMethod,
    /// Covariate terms used by refinement and balance.
    #[serde(default)]
    pub covariates: Vec<CovariateTerm>,
    /// Maximum number of retained controls for matching methods.
    #[serde(default = "default_size_match")]
    pub size_match: usize,
    /// Treat NA treatment values in the lag window as wildcards.
    #[serde(default = "default_true")]
    pub match_missing: bool,
    /// Exclude units with NA in any required covariate column.
    #[serde(default)]
    pub listwise_delete: bool,
    /// Require treated and control paths to keep their status over the lead window.
    #[serde(default)]
    pub forbid_treatment_reversal: bool,
    /// Use only the diagonal of the covariance in Mahalanobis distances.
    #[serde(default)]
    pub use_diagonal_variance_matrix: bool,
    /// Replace refined weights with equal weights over retained controls.
    #[serde(default)]
    pub use_equal_weights: bool,
    /// Propensity model pooling.
    #[serde(default)]
    pub propensity_pool: PropensityPool,
    /// Column names for table input.
    #[serde(default)]
    pub columns: ColumnNames,
}

fn default_lead() -> Vec<usize> {
    vec![0]
}

fn default_qoi() -> Qoi {
    Qoi::Att
}

fn default_method() -> RefinementMethod {
    RefinementMethod::None
}

fn default_size_match() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl MatchConfig {
    /// Default configuration for a lag window of `lag` periods.
    pub fn new(lag: usize) -> Self {
        Self {
            lag,
            lead: default_lead(),
            qoi: default_qoi(),
            refinement_method: default_method(),
            covariates: Vec::new(),
            size_match: default_size_match(),
            match_missing: true,
            listwise_delete: false,
            forbid_treatment_reversal: false,
            use_diagonal_variance_matrix: false,
            use_equal_weights: false,
            propensity_pool: PropensityPool::default(),
            columns: ColumnNames::default(),
        }
    }

    /// Set the lead window.
    pub fn with_lead(mut self, lead: impl IntoIterator<Item = usize>) -> Self {
        self.lead = lead.into_iter().collect();
        self
    }

    /// Set the quantity of interest.
    pub fn with_qoi(mut self, qoi: Qoi) -> Self {
        self.qoi = qoi;
        self
    }

    /// Set refinement method and covariate terms.
    pub fn with_refinement(
        mut self,
        method: RefinementMethod,
        covariates: impl IntoIterator<Item = CovariateTerm>,
    ) -> Self {
        self.refinement_method = method;
        self.covariates = covariates.into_iter().collect();
        self
    }

    /// Set `size_match`.
    pub fn with_size_match(mut self, k: usize) -> Self {
        self.size_match = k;
        self
    }

    /// Set `match_missing`.
    pub fn with_match_missing(mut self, on: bool) -> Self {
        self.match_missing = on;
        self
    }

    /// Set `listwise_delete`.
    pub fn with_listwise_delete(mut self, on: bool) -> Self {
        self.listwise_delete = on;
        self
    }

    /// Set `forbid_treatment_reversal`.
    pub fn with_forbid_treatment_reversal(mut self, on: bool) -> Self {
        self.forbid_treatment_reversal = on;
        self
    }

    /// Set `use_diagonal_variance_matrix`.
    pub fn with_diagonal_variance(mut self, on: bool) -> Self {
        self.use_diagonal_variance_matrix = on;
        self
    }

    /// Set `use_equal_weights`.
    pub fn with_equal_weights(mut self, on: bool) -> Self {
        self.use_equal_weights = on;
        self
    }

    /// Set propensity pooling.
    pub fn with_propensity_pool(mut self, pool: PropensityPool) -> Self {
        self.propensity_pool = pool;
        self
    }

    /// Largest lead offset.
    pub fn max_lead(&self) -> usize {
        self.lead.iter().copied().max().unwrap_or(0)
    }

    /// Total number of covariate columns after lag expansion.
    pub fn n_covariate_columns(&self) -> usize {
        self.covariates.iter().map(|t| t.lags.len()).sum()
    }

    /// Check option ranges and combinations.
    pub fn validate(&self) -> Result<()> {
        if self.lag == 0 {
            return Err(Error::Configuration("lag must be >= 1".into()));
        }
        if self.lag > MAX_OFFSET {
            return Err(Error::Configuration(format!("lag must be <= {MAX_OFFSET}")));
        }
        if self.lead.is_empty() {
            return Err(Error::Configuration("lead window must be non-empty".into()));
        }
        let mut seen = HashSet::new();
        for &l in &self.lead {
            if !seen.insert(l) {
                return Err(Error::Configuration(format!("duplicate lead offset {l}")));
            }
            if l > MAX_OFFSET {
                return Err(Error::Configuration(format!(
                    "lead offset {l} exceeds the maximum of {MAX_OFFSET}"
                )));
            }
        }
        if self.size_match == 0 {
            return Err(Error::Configuration("size_match must be >= 1".into()));
        }
        if self.refinement_method.needs_covariates() && self.n_covariate_columns() == 0 {
            return Err(Error::Configuration(format!(
                "refinement method {:?} requires a non-empty covariate formula",
                self.refinement_method
            )));
        }
        let mut names = HashSet::new();
        for term in &self.covariates {
            if term.name.trim().is_empty() {
                return Err(Error::Configuration("covariate name must be non-empty".into()));
            }
            if term.lags.is_empty() {
                return Err(Error::Configuration(format!(
                    "covariate '{}' must list at least one lag offset",
                    term.name
                )));
            }
            let lags: HashSet<usize> = term.lags.iter().copied().collect();
            if lags.len() != term.lags.len() {
                return Err(Error::Configuration(format!(
                    "covariate '{}' lists a lag offset twice",
                    term.name
                )));
            }
            if let Some(&l) = term.lags.iter().find(|&&l| l > MAX_OFFSET) {
                return Err(Error::Configuration(format!(
                    "covariate '{}' lag {l} exceeds the maximum of {MAX_OFFSET}",
                    term.name
                )));
            }
            if !names.insert(term.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "covariate '{}' appears twice; merge its lag offsets",
                    term.name
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let cfg: Self = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Confidence interval construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiMethod {
    /// Empirical quantiles of the bootstrap distribution.
    #[default]
    Percentile,
    /// `estimate ± z · SE`.
    Normal,
    /// Bias-corrected and accelerated interval (event-level jackknife).
    Bca,
}

/// Resampling unit of the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleScheme {
    /// Draw treated events with replacement.
    #[default]
    Events,
    /// Draw event units with replacement, carrying all their events.
    Units,
}

/// Outcome contrast used by the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeMode {
    /// `y(t + lead)`.
    #[default]
    Level,
    /// `y(t + lead) - y(t - 1)`.
    FirstDifference,
}

/// Configuration of the bootstrap effect estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EstimateConfig {
    /// Number of bootstrap iterations.
    pub iterations: usize,
    /// Confidence level in `(0, 1)`.
    pub confidence_level: f64,
    /// Random seed; `None` draws a fresh seed.
    pub seed: Option<u64>,
    /// Interval construction.
    pub ci_method: CiMethod,
    /// Resampling unit.
    pub resample: ResampleScheme,
    /// Outcome contrast.
    pub outcome_mode: OutcomeMode,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            confidence_level: 0.95,
            seed: None,
            ci_method: CiMethod::default(),
            resample: ResampleScheme::default(),
            outcome_mode: OutcomeMode::default(),
        }
    }
}

impl EstimateConfig {
    /// Set the iteration count.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the confidence level.
    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = level;
        self
    }

    /// Set the interval method.
    pub fn with_ci_method(mut self, method: CiMethod) -> Self {
        self.ci_method = method;
        self
    }

    /// Set the resampling unit.
    pub fn with_resample(mut self, scheme: ResampleScheme) -> Self {
        self.resample = scheme;
        self
    }

    /// Set the outcome contrast.
    pub fn with_outcome_mode(mut self, mode: OutcomeMode) -> Self {
        self.outcome_mode = mode;
        self
    }

    /// Check option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::Configuration("iterations must be >= 1".into()));
        }
        let level = self.confidence_level;
        if !(level.is_finite() && level > 0.0 && level < 1.0) {
            return Err(Error::Configuration(format!(
                "confidence_level must be in (0,1), got {level}"
            )));
        }
        if self.ci_method == CiMethod::Bca && self.iterations < 2 {
            return Err(Error::Configuration("BCa intervals need at least 2 iterations".into()));
        }
        Ok(())
    }

    /// Parse and validate from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

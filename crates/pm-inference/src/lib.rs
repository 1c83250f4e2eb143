//! # pm-inference
//!
//! Matched-set construction and effect estimation for panel data.
//!
//! This crate provides:
//! - a dense panel index with gap diagnostics,
//! - treated-event detection and treatment-history matching,
//! - covariate refinement (Mahalanobis, logistic and CBPS propensity scores),
//! - per-set weight normalization,
//! - a seeded, parallel bootstrap estimator and covariate balance tables.
//!
//! ## Pipeline
//!
//! [`PanelIndex`] → [`panel_match`] → [`estimate`] / [`balance`]. Every step
//! takes immutable inputs; matching parallelizes over events and the
//! bootstrap over iterations.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Covariate balance tables.
pub mod balance;
/// Percentile, normal and BCa bootstrap intervals.
pub mod bootstrap_ci;
/// Bootstrap effect estimator.
pub mod estimate;
/// Treated-event detection.
pub mod events;
/// Treatment-history matching.
pub mod history;
/// End-to-end matched-set construction.
pub mod matching;
/// Numerically stable scalar helpers.
pub mod math;
/// Panel index over a dense unit × period grid.
pub mod panel;
/// Logistic and CBPS propensity models.
pub mod propensity;
/// Refinement engine.
pub mod refinement;
/// Weight normalization and checks.
pub mod weights;

pub use balance::{BalanceRow, BalanceTable, balance, balance_at};
pub use bootstrap_ci::Interval;
pub use estimate::{BootstrapEstimator, Estimate, LeadEstimate, estimate};
pub use events::{EventSite, detect_event_sites, detect_events};
pub use history::match_histories;
pub use matching::{PanelMatcher, panel_match};
pub use panel::{PanelColumn, PanelDiagnostics, PanelIndex, PanelTable, TreatmentObs};
pub use propensity::{CbpsModel, LogitModel};
pub use refinement::Refiner;
pub use weights::{check_weights, normalize_set};

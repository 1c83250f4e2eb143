//! # pm-core
//!
//! Shared foundation for panel matching.
//!
//! This crate provides:
//! - the error taxonomy ([`Error`], [`Result`]),
//! - panel records, treated events and matched sets ([`types`]),
//! - immutable matching and estimation configuration ([`config`]),
//! - the [`PropensityModel`](traits::PropensityModel) seam used by refinement.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Matching and estimation configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Model traits.
pub mod traits;
/// Data types shared across crates.
pub mod types;

pub use config::{
    CiMethod, ColumnNames, CovariateTerm, EstimateConfig, MAX_OFFSET, MatchConfig, OutcomeMode,
    PropensityPool, RefinementMethod, ResampleScheme,
};
pub use error::{Error, Result};
pub use traits::PropensityModel;
pub use types::{
    ControlMatch, ControlStatus, MatchedSet, MatchingResult, PanelRecord, Qoi, SetFlag,
    TreatedEvent,
};

//! Error types for panel matching

use thiserror::Error;

/// Panel matching error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Duplicate or contradictory panel rows. Fatal, raised while indexing.
    #[error("Malformed panel: {0}")]
    MalformedPanel(String),

    /// Invalid option or option combination. Raised before any matching work.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Propensity model did not converge for one matched set.
    ///
    /// Recovered locally: the affected set falls back to equal weights.
    #[error("Refinement did not converge: {0}")]
    RefinementConvergence(String),

    /// No usable matched sets for a lead offset or a whole quantity of interest.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// Cooperative cancellation was requested.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_taxonomy() {
        let e = Error::MalformedPanel("duplicate row (unit=1, time=1990)".into());
        assert_eq!(e.to_string(), "Malformed panel: duplicate row (unit=1, time=1990)");
        assert!(Error::Cancelled.to_string().contains("cancelled"));
    }

    #[test]
    fn test_json_error_converts() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let e: Error = bad.unwrap_err().into();
        assert!(matches!(e, Error::Json(_)));
    }
}

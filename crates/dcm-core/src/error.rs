//! Error type shared by every DCM crate.

use thiserror::Error;

/// Errors surfaced by the clustering model and its training loop.
///
/// Numeric degeneracy (clips without actors, clusters with zero soft
/// frequency) is never reported here; those rows are skipped locally.
///
/// # Example
///
/// ```
/// use dcm_core::DcmError;
///
/// let err = DcmError::SampleOutOfRange { index: 12, max: 10 };
/// assert!(err.to_string().contains("12"));
/// ```
#[derive(Debug, Error)]
pub enum DcmError {
    /// Invalid or missing hyperparameter, unknown selector string.
    #[error("configuration error: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// A tensor or buffer did not have the shape the wiring expects.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Name of the offending value.
        what: String,
        /// Expected shape, human-readable.
        expected: String,
        /// Observed shape, human-readable.
        actual: String,
    },

    /// A global sample row lies outside the target distribution matrix.
    #[error("sample row {index} out of range (target matrix has {max} rows)")]
    SampleOutOfRange {
        /// Requested row.
        index: usize,
        /// Number of rows in the matrix.
        max: usize,
    },

    /// A batch with zero clips was passed where at least one is required.
    #[error("empty batch")]
    EmptyBatch,

    /// Failure inside the tensor library.
    #[error("internal error: {message}")]
    Internal {
        /// Operation and underlying error.
        message: String,
    },

    /// Reading a config file or writing predictions failed.
    #[error("i/o error: {message}")]
    Io {
        /// Path and underlying error.
        message: String,
    },
}

impl DcmError {
    /// Shorthand for a [`DcmError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a [`DcmError::ShapeMismatch`].
    pub fn shape(what: impl Into<String>, expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_error_mentions_both_shapes() {
        let err = DcmError::shape("bboxs", "[B, S, 2, 2]", "[4, 3, 4]");
        let msg = err.to_string();
        assert!(msg.contains("bboxs"));
        assert!(msg.contains("[B, S, 2, 2]"));
        assert!(msg.contains("[4, 3, 4]"));
    }

    #[test]
    fn config_shorthand() {
        let err = DcmError::config("alpha must be positive");
        assert!(matches!(err, DcmError::Config { .. }));
    }
}

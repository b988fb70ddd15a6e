use thiserror::Error;

/// Errors surfaced by the test-time augmentation core.
///
/// Empty inputs are never reported here: every stage answers them with a
/// well-formed empty result.
#[derive(Debug, Error)]
pub enum AugTestError {
    #[error("{context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),

    #[error(transparent)]
    Array(#[from] ndarray::ShapeError),
}

impl AugTestError {
    pub(crate) fn shape(context: &'static str, expected: usize, actual: usize) -> Self {
        AugTestError::ShapeMismatch {
            context,
            expected,
            actual,
        }
    }
}

pub type Result<T, E = AugTestError> = std::result::Result<T, E>;

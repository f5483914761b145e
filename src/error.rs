use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrebakeError {
    #[error(
        "stage {stage} has no input session: enable the preceding stage or pass an explicit input session id"
    )]
    MissingInputSession { stage: &'static str },
    #[error("stage {stage} timed out after {timeout_ms}ms")]
    StageTimeout { stage: &'static str, timeout_ms: u64 },
    #[error("pipeline run was cancelled")]
    Cancelled,
    #[error("checkpoint after stage {stage} failed: {}", issues.join("; "))]
    CheckpointFailed {
        stage: &'static str,
        issues: Vec<String>,
    },
    #[error("session artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("session artifact has no valid entries: {0}")]
    EmptyArtifact(String),
    #[error("another pipeline run holds the store lock: {0}")]
    PipelineBusy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrebakeErrorCode {
    E001Locked,
    E002MissingInput,
    E003Timeout,
    E004Cancelled,
    E005CheckpointFailed,
    E006ArtifactMissing,
}

impl PrebakeErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001Locked => "E001_LOCKED",
            Self::E002MissingInput => "E002_MISSING_INPUT",
            Self::E003Timeout => "E003_TIMEOUT",
            Self::E004Cancelled => "E004_CANCELLED",
            Self::E005CheckpointFailed => "E005_CHECKPOINT_FAILED",
            Self::E006ArtifactMissing => "E006_ARTIFACT_MISSING",
        }
    }
}

impl PrebakeError {
    pub fn code(&self) -> PrebakeErrorCode {
        match self {
            Self::MissingInputSession { .. } => PrebakeErrorCode::E002MissingInput,
            Self::StageTimeout { .. } => PrebakeErrorCode::E003Timeout,
            Self::Cancelled => PrebakeErrorCode::E004Cancelled,
            Self::CheckpointFailed { .. } => PrebakeErrorCode::E005CheckpointFailed,
            Self::ArtifactNotFound(_) | Self::EmptyArtifact(_) => {
                PrebakeErrorCode::E006ArtifactMissing
            }
            Self::PipelineBusy(_) => PrebakeErrorCode::E001Locked,
        }
    }

    /// Whether another attempt of the same stage could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::MissingInputSession { .. } | Self::Cancelled | Self::PipelineBusy(_)
        )
    }
}

/// Finds a typed pipeline error anywhere in an anyhow chain.
pub fn find_prebake_error(err: &anyhow::Error) -> Option<&PrebakeError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PrebakeError>())
}

#[cfg(test)]
mod tests {
    use super::{PrebakeError, PrebakeErrorCode, find_prebake_error};
    use anyhow::Context;

    #[test]
    fn missing_input_error_is_fatal_and_clearly_worded() {
        let err = PrebakeError::MissingInputSession { stage: "C" };
        assert!(!err.is_retryable());
        assert_eq!(err.code(), PrebakeErrorCode::E002MissingInput);
        assert!(err.to_string().contains("no input session"));
    }

    #[test]
    fn typed_error_survives_context_wrapping() {
        let wrapped: anyhow::Result<()> = Err(PrebakeError::Cancelled).context("stage B");
        let err = wrapped.expect_err("should fail");
        let found = find_prebake_error(&err).expect("typed error in chain");
        assert_eq!(found.code().as_str(), "E004_CANCELLED");
    }
}

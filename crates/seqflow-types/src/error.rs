use thiserror::Error;

/// Errors raised by a stage while processing one work item.
#[derive(Debug, Error)]
pub enum StageError {
    /// The input had nothing to process. Not a failure: callers write a
    /// placeholder output and continue.
    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("missing prerequisite data: {0}")]
    MissingPrerequisite(String),

    #[error("external tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stage failed: {0}")]
    Failed(String),
}

impl StageError {
    /// Whether this error is the skippable empty-input case.
    pub fn is_empty_input(&self) -> bool {
        matches!(self, StageError::EmptyInput(_))
    }
}

/// Errors related to chunk manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("duplicate chunk key '{0}'")]
    DuplicateKey(String),
}

/// Errors related to resource declarations.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid memory size '{0}'")]
    InvalidMemory(String),

    #[error("invalid engine count '{0}' (expected a positive number or \"all\")")]
    InvalidEngineCount(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let err = StageError::Tool {
            tool: "samtools".to_string(),
            message: "exit status 1".to_string(),
        };
        assert_eq!(err.to_string(), "external tool 'samtools' failed: exit status 1");
    }

    #[test]
    fn test_empty_input_is_skippable() {
        assert!(StageError::EmptyInput("chr21".to_string()).is_empty_input());
        assert!(!StageError::Failed("boom".to_string()).is_empty_input());
    }
}

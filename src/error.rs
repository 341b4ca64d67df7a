use std::path::PathBuf;
use thiserror::Error;

use crate::annotation::{PartId, Target};

/// The main error type for compograph operations.
#[derive(Debug, Error)]
pub enum CompographError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse annotation JSON from {path}: {source}")]
    AnnotationParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write annotation JSON to {path}: {source}")]
    AnnotationWrite {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid annotation {path}: {message}")]
    InvalidAnnotation { path: PathBuf, message: String },

    #[error("Failed to parse configuration {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to encode image: {0}")]
    ImageEncode(#[source] image::ImageError),

    #[error("No image available for '{id}'")]
    MissingImage { id: String },

    #[error("Wrong criterion for pipeline '{pipeline}': {criterion}")]
    UnknownCriterion { pipeline: String, criterion: String },

    #[error("Pipeline step '{step}' targets {found}, but '{pipeline}' expects {expected}")]
    TargetMismatch {
        pipeline: String,
        step: String,
        expected: Target,
        found: Target,
    },

    #[error("Pipeline '{pipeline}' references unknown model, pipeline or function '{reference}'")]
    UnknownReference { pipeline: String, reference: String },

    #[error("Pipeline '{pipeline}' is defined in terms of itself ({chain})")]
    CyclicPipeline { pipeline: String, chain: String },

    #[error("Wrong value for pipeline '{pipeline}': {message}")]
    InvalidPipeline { pipeline: String, message: String },

    #[error("Part {part} does not belong to assembly '{assembly}'")]
    UnknownPart { assembly: String, part: PartId },

    #[error("Model '{model}' has not been trained")]
    ModelNotTrained { model: String },

    #[error("Model '{model}' failed: {message}")]
    ModelFailed { model: String, message: String },

    #[error("Function '{function}' failed: {message}")]
    FunctionFailed { function: String, message: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to serialize output: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

impl CompographError {
    /// Returns true for errors that must abort a whole dataset pass.
    ///
    /// Only model adapter failures are fatal: a model that cannot predict
    /// would otherwise turn every remaining annotation into a false negative.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CompographError::ModelNotTrained { .. } | CompographError::ModelFailed { .. }
        )
    }

    /// Returns true for errors raised while building a pipeline.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CompographError::InvalidConfig(_)
                | CompographError::UnknownCriterion { .. }
                | CompographError::TargetMismatch { .. }
                | CompographError::UnknownReference { .. }
                | CompographError::CyclicPipeline { .. }
                | CompographError::InvalidPipeline { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_model_errors_are_fatal() {
        let not_trained = CompographError::ModelNotTrained {
            model: "detector".into(),
        };
        let failed = CompographError::ModelFailed {
            model: "detector".into(),
            message: "exit status 1".into(),
        };
        let missing = CompographError::MissingImage { id: "a/1".into() };

        assert!(not_trained.is_fatal());
        assert!(failed.is_fatal());
        assert!(!missing.is_fatal());
        assert!(!CompographError::InvalidConfig("x".into()).is_fatal());
    }

    #[test]
    fn config_errors_are_classified() {
        let err = CompographError::UnknownReference {
            pipeline: "full".into(),
            reference: "nope".into(),
        };
        assert!(err.is_config_error());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("nope"));
    }
}

use serde::Serialize;
use thiserror::Error;

/// Submission rejected before any network or storage call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Empty image payload")]
    Empty,

    #[error("Not an image: {filename}")]
    NotAnImage { filename: String },

    #[error("Image too large: {size} bytes, limit: {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("Classifier transport error: {0}")]
    Transport(String),

    #[error("Classifier rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Malformed classifier response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NutrientResolutionError {
    #[error("No nutrition records found for: {term}")]
    NoMatch { term: String },

    #[error("Nutrition database transport error: {0}")]
    Transport(String),

    #[error("Nutrition database rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Malformed nutrition database response: {0}")]
    Malformed(String),
}

/// Errors shared by the image store and the analysis record store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Storage transport error: {0}")]
    Transport(String),

    #[error("Concurrent modification for user: {user_id}, image: {image_address}")]
    Conflict {
        user_id: String,
        image_address: String,
    },

    #[error("Record serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid record key: {0}")]
    InvalidKey(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Flat discriminant of [`AnalysisError`], reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ClassifierTransport,
    ClassifierRejected,
    ClassifierMalformed,
    NoMatch,
    NutritionTransport,
    NutritionRejected,
    NutritionMalformed,
    StoreTransport,
    StoreConflict,
    StoreSerialization,
    StoreInvalidKey,
}

/// Failure of one analysis, carrying the originating component's error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Nutrient resolution error: {0}")]
    Resolution(#[from] NutrientResolutionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation(_) => ErrorKind::Validation,
            AnalysisError::Classifier(ClassifierError::Transport(_)) => ErrorKind::ClassifierTransport,
            AnalysisError::Classifier(ClassifierError::Rejected { .. }) => ErrorKind::ClassifierRejected,
            AnalysisError::Classifier(ClassifierError::Malformed(_)) => ErrorKind::ClassifierMalformed,
            AnalysisError::Resolution(NutrientResolutionError::NoMatch { .. }) => ErrorKind::NoMatch,
            AnalysisError::Resolution(NutrientResolutionError::Transport(_)) => ErrorKind::NutritionTransport,
            AnalysisError::Resolution(NutrientResolutionError::Rejected { .. }) => ErrorKind::NutritionRejected,
            AnalysisError::Resolution(NutrientResolutionError::Malformed(_)) => ErrorKind::NutritionMalformed,
            AnalysisError::Store(StoreError::Transport(_)) => ErrorKind::StoreTransport,
            AnalysisError::Store(StoreError::Conflict { .. }) => ErrorKind::StoreConflict,
            AnalysisError::Store(StoreError::Serialization(_)) => ErrorKind::StoreSerialization,
            AnalysisError::Store(StoreError::InvalidKey(_)) => ErrorKind::StoreInvalidKey,
        }
    }

    /// Only transport-class failures are worth resubmitting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ClassifierTransport | ErrorKind::NutritionTransport | ErrorKind::StoreTransport
        )
    }
}

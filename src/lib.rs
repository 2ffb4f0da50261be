pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod health;
pub mod image_store;
pub mod metrics;
pub mod normalizer;
pub mod nutrition;
pub mod pipeline;
pub mod records;
pub mod resource_manager;
pub mod state;

// Re-export commonly used types for easier testing
pub use crate::classifier::{rank, AdmissionRule, ClassificationCandidate, Classifier, HttpClassifier, RankedCandidateSet};
pub use crate::config::Config;
pub use crate::error::{AnalysisError, ClassifierError, ErrorKind, NutrientResolutionError, StoreError, ValidationError};
pub use crate::health::HealthLabel;
pub use crate::image_store::{FsImageStore, ImageStore, StoredImage};
pub use crate::normalizer::normalize;
pub use crate::nutrition::{NutrientRecord, NutrientResolver, NutrientValue, UsdaResolver};
pub use crate::pipeline::{AnalysisOutcome, PipelineOrchestrator};
pub use crate::records::{AnalysisRecord, AnalysisRecordStore, PartialAnalysisRecord, SledRecordStore};
pub use crate::state::AnalysisState;

//! Pipeline Orchestrator
//!
//! Drives one submission through store -> classify -> rank -> resolve ->
//! persist as a single sequential chain of awaits. Every external call runs
//! under the configured timeout; expiry counts as a transport failure of that
//! component. No stage is retried here.
//!
//! Record lifecycle:
//! 1. After admission, a provisional row is upserted with the keyword-mode
//!    health label, so a partial result survives a failed lookup.
//! 2. After resolution, the same row is completed with nutrient detail, item
//!    name and the threshold-mode label, which replaces the keyword label.
//!
//! Only the top admitted candidate is resolved; the others are not looked up.
//!
//! A resubmission supersedes the in-flight attempt, which stops before its
//! next write and reports `Superseded`. The one exception is a resubmission
//! landing after the completed upsert: that write stands and the attempt
//! reports `Completed`.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use tracing::{debug, info, instrument, warn};

use crate::classifier::{rank, Classifier, HttpClassifier};
use crate::config::{Config, PipelineConfig};
use crate::error::{
    AnalysisError, ClassifierError, NutrientResolutionError, StoreError, ValidationError,
};
use crate::health::{self, HealthInput};
use crate::image_store::{FsImageStore, ImageStore};
use crate::metrics;
use crate::normalizer::normalize;
use crate::nutrition::{NutrientResolver, UsdaResolver};
use crate::records::{AnalysisRecord, AnalysisRecordStore, PartialAnalysisRecord, SledRecordStore};
use crate::resource_manager::{ResourceLimits, ResourceManager, ResourceStats};
use crate::state::{AnalysisState, Attempt, SessionSnapshot, SessionTracker, TransitionError};

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// Nothing passed the admission rule. `returned` is how many candidates
    /// the classifier produced (0 = it returned none at all).
    NoConfidentDetection { returned: usize },
    Completed(AnalysisRecord),
    Failed(AnalysisError),
    /// A newer submission from the same session replaced this one.
    Superseded,
}

impl AnalysisOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AnalysisOutcome::NoConfidentDetection { .. } => "no_confident_detection",
            AnalysisOutcome::Completed(_) => "completed",
            AnalysisOutcome::Failed(_) => "failed",
            AnalysisOutcome::Superseded => "superseded",
        }
    }
}

/// Why a run stopped before producing an outcome of its own
enum Interrupt {
    Superseded,
    Failed(AnalysisError),
}

impl From<AnalysisError> for Interrupt {
    fn from(err: AnalysisError) -> Self {
        Interrupt::Failed(err)
    }
}

impl From<ClassifierError> for Interrupt {
    fn from(err: ClassifierError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<NutrientResolutionError> for Interrupt {
    fn from(err: NutrientResolutionError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<StoreError> for Interrupt {
    fn from(err: StoreError) -> Self {
        Interrupt::Failed(err.into())
    }
}

/// MIME type sniffed from the leading bytes, if they are a known image format.
pub fn detect_image_type(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|format| format.to_mime_type())
}

pub struct PipelineOrchestrator {
    image_store: Arc<dyn ImageStore>,
    classifier: Arc<dyn Classifier>,
    resolver: Arc<dyn NutrientResolver>,
    records: Arc<dyn AnalysisRecordStore>,
    config: PipelineConfig,
    sessions: SessionTracker,
    resources: ResourceManager,
}

impl PipelineOrchestrator {
    pub fn new(
        image_store: Arc<dyn ImageStore>,
        classifier: Arc<dyn Classifier>,
        resolver: Arc<dyn NutrientResolver>,
        records: Arc<dyn AnalysisRecordStore>,
        config: PipelineConfig,
    ) -> Self {
        let resources = ResourceManager::new(ResourceLimits {
            max_image_bytes: config.max_image_bytes,
            max_concurrent_analyses: config.max_concurrent_analyses,
        });

        Self {
            image_store,
            classifier,
            resolver,
            records,
            config,
            sessions: SessionTracker::new(),
            resources,
        }
    }

    /// Wire the production collaborators described by `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let image_store = FsImageStore::new(config.storage.images_dir(), &config.storage.public_base_url)
            .await
            .context("Failed to open image store")?;
        let records = SledRecordStore::open(config.storage.records_path())
            .context("Failed to open analysis record store")?;
        let classifier = HttpClassifier::new(config.classifier.clone())?;
        let resolver = UsdaResolver::new(config.nutrition.clone())?;

        info!(
            admission_rule = %config.pipeline.admission_rule,
            timeout_secs = config.pipeline.external_call_timeout_secs,
            "Pipeline configured"
        );

        Ok(Self::new(
            Arc::new(image_store),
            Arc::new(classifier),
            Arc::new(resolver),
            Arc::new(records),
            config.pipeline.clone(),
        ))
    }

    /// Analyze one submitted image for `user_id`.
    ///
    /// The user id doubles as the session key: a second accepted submission
    /// for the same user while one is in flight supersedes the first. An
    /// upload rejected by validation never enters the lifecycle and leaves
    /// any in-flight analysis alone.
    #[instrument(skip(self, image), fields(size = image.len()))]
    pub async fn analyze(&self, user_id: &str, image: &[u8], filename: &str) -> AnalysisOutcome {
        let outcome = match self.validate(image, filename) {
            Err(err) => {
                let err = AnalysisError::from(err);
                warn!(kind = ?err.kind(), "Analysis rejected: {}", err);
                AnalysisOutcome::Failed(err)
            }
            Ok(content_type) => self.start(user_id, image, filename, content_type).await,
        };

        metrics::ANALYSES_TOTAL.with_label_values(&[outcome.label()]).inc();
        outcome
    }

    async fn start(&self, user_id: &str, image: &[u8], filename: &str, content_type: &'static str) -> AnalysisOutcome {
        let attempt = self.sessions.begin(user_id);

        match self.run(&attempt, user_id, image, filename, content_type).await {
            Ok(outcome) => outcome,
            Err(Interrupt::Superseded) => {
                info!("Analysis superseded, discarding result");
                AnalysisOutcome::Superseded
            }
            Err(Interrupt::Failed(err)) if !self.sessions.is_current(&attempt) => {
                info!(kind = ?err.kind(), "Superseded analysis failed, discarding: {}", err);
                AnalysisOutcome::Superseded
            }
            Err(Interrupt::Failed(err)) => {
                warn!(kind = ?err.kind(), "Analysis failed: {}", err);
                if let Err(e) = self.sessions.transition(&attempt, AnalysisState::Errored) {
                    debug!("Errored transition skipped: {}", e);
                }
                AnalysisOutcome::Failed(err)
            }
        }
    }

    async fn run(
        &self,
        attempt: &Attempt,
        user_id: &str,
        image: &[u8],
        filename: &str,
        content_type: &'static str,
    ) -> Result<AnalysisOutcome, Interrupt> {
        self.advance(attempt, AnalysisState::Uploading)?;
        let _slot = self.resources.acquire_analysis_slot().await;

        let stored = self
            .bounded(self.image_store.store(user_id, filename, image), StoreError::Transport)
            .await?;
        let image_address = stored.address;
        self.advance(attempt, AnalysisState::Classifying)?;

        let candidates = self
            .bounded(self.classifier.classify(image, content_type), ClassifierError::Transport)
            .await?;
        let ranked = rank(candidates, self.config.admission_rule);
        let Some(top) = ranked.top().cloned() else {
            self.advance(attempt, AnalysisState::Completed)?;
            info!(returned = ranked.returned(), "No confident detection");
            return Ok(AnalysisOutcome::NoConfidentDetection {
                returned: ranked.returned(),
            });
        };
        self.advance(attempt, AnalysisState::CandidatesReady)?;
        info!(label = %top.label, score = top.score, admitted = ranked.len(), "Candidates ready");

        let provisional_label = health::classify(HealthInput::Label(&top.label));
        self.bounded(
            self.records.upsert(user_id, &image_address, PartialAnalysisRecord::provisional(provisional_label)),
            StoreError::Transport,
        )
        .await?;

        self.advance(attempt, AnalysisState::Resolving)?;
        let term = normalize(&top.label);
        if term.is_empty() {
            return Err(NutrientResolutionError::NoMatch { term: top.label }.into());
        }
        let nutrients = self
            .bounded(self.resolver.resolve(&term), NutrientResolutionError::Transport)
            .await?;

        if !self.sessions.is_current(attempt) {
            return Err(Interrupt::Superseded);
        }
        let label = health::classify(HealthInput::Nutrients(&nutrients));
        let record = self
            .bounded(
                self.records.upsert(
                    user_id,
                    &image_address,
                    PartialAnalysisRecord::completed(term, nutrients, label),
                ),
                StoreError::Transport,
            )
            .await?;

        // The completed row is written; a resubmission from here on does not undo it
        if let Err(Interrupt::Superseded) = self.advance(attempt, AnalysisState::Completed) {
            info!("Resubmission arrived after the completed record was written");
        }
        Ok(AnalysisOutcome::Completed(record))
    }

    /// The Idle -> Uploading guard. Returns the sniffed MIME type.
    fn validate(&self, image: &[u8], filename: &str) -> Result<&'static str, ValidationError> {
        if image.is_empty() {
            return Err(ValidationError::Empty);
        }
        self.resources.check_image_size(image.len())?;
        detect_image_type(image).ok_or_else(|| ValidationError::NotAnImage {
            filename: filename.to_string(),
        })
    }

    fn advance(&self, attempt: &Attempt, to: AnalysisState) -> Result<(), Interrupt> {
        match self.sessions.transition(attempt, to) {
            Ok(()) => Ok(()),
            Err(TransitionError::Superseded { .. }) => Err(Interrupt::Superseded),
            Err(err @ TransitionError::Invalid { .. }) => {
                // The run sequence above only issues legal transitions
                warn!("Ignoring {}", err);
                Ok(())
            }
        }
    }

    /// Run an external call under the configured timeout.
    async fn bounded<T, E>(
        &self,
        call: impl Future<Output = Result<T, E>>,
        on_timeout: impl FnOnce(String) -> E,
    ) -> Result<T, E> {
        let limit = self.config.external_call_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!("timed out after {:?}", limit))),
        }
    }

    pub async fn history(&self, user_id: &str, date: NaiveDate) -> Result<Vec<AnalysisRecord>, StoreError> {
        self.bounded(self.records.history(user_id, date), StoreError::Transport)
            .await
    }

    pub async fn record(&self, user_id: &str, image_address: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        self.bounded(self.records.get(user_id, image_address), StoreError::Transport)
            .await
    }

    pub fn session(&self, user_id: &str) -> Option<SessionSnapshot> {
        self.sessions.snapshot(user_id)
    }

    pub fn resource_stats(&self) -> ResourceStats {
        self.resources.get_stats()
    }
}

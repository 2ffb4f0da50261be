use async_trait::async_trait;
use chrono::Utc;
use nutrivision_node::classifier::{AdmissionRule, ClassificationCandidate, Classifier};
use nutrivision_node::config::PipelineConfig;
use nutrivision_node::error::{
    AnalysisError, ClassifierError, NutrientResolutionError, StoreError, ValidationError,
};
use nutrivision_node::health::HealthLabel;
use nutrivision_node::image_store::{ImageStore, StoredImage};
use nutrivision_node::nutrition::{NutrientRecord, NutrientResolver, NutrientValue};
use nutrivision_node::pipeline::{AnalysisOutcome, PipelineOrchestrator};
use nutrivision_node::records::{
    AnalysisRecord, AnalysisRecordStore, PartialAnalysisRecord, SledRecordStore,
};
use nutrivision_node::state::AnalysisState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

#[derive(Default)]
struct MemoryImageStore {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn store(&self, user_id: &str, filename: &str, bytes: &[u8]) -> Result<StoredImage, StoreError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StoredImage {
            address: format!("mem://{}/{}-{}", user_id, n, filename),
            user_id: user_id.to_string(),
            filename: filename.to_string(),
            size: bytes.len() as u64,
            checksum: format!("{:x}", md5::compute(bytes)),
            created_at: Utc::now().timestamp_millis(),
        })
    }
}

/// Returns a canned response. The first call can be held until `release` fires.
struct ScriptedClassifier {
    response: Result<Vec<ClassificationCandidate>, ClassifierError>,
    calls: AtomicUsize,
    hold_first: bool,
    release: Notify,
    delay: Option<Duration>,
}

impl ScriptedClassifier {
    fn returning(response: Result<Vec<ClassificationCandidate>, ClassifierError>) -> Self {
        Self {
            response,
            calls: AtomicUsize::new(0),
            hold_first: false,
            release: Notify::new(),
            delay: None,
        }
    }

    fn labels(labels: &[(&str, f64)]) -> Self {
        Self::returning(Ok(labels
            .iter()
            .map(|(label, score)| ClassificationCandidate::new(*label, *score))
            .collect()))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _image: &[u8], content_type: &str) -> Result<Vec<ClassificationCandidate>, ClassifierError> {
        assert_eq!(content_type, "image/png");
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_first && n == 0 {
            self.release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone()
    }
}

struct ScriptedResolver {
    response: Result<NutrientRecord, NutrientResolutionError>,
    terms: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    fn returning(response: Result<NutrientRecord, NutrientResolutionError>) -> Self {
        Self {
            response,
            terms: Mutex::new(Vec::new()),
        }
    }

    fn terms(&self) -> Vec<String> {
        self.terms.lock().unwrap().clone()
    }
}

#[async_trait]
impl NutrientResolver for ScriptedResolver {
    async fn resolve(&self, search_term: &str) -> Result<NutrientRecord, NutrientResolutionError> {
        self.terms.lock().unwrap().push(search_term.to_string());
        self.response.clone()
    }
}

/// Writes through to sled, then holds the first completed write before returning it.
struct GatedRecordStore {
    inner: SledRecordStore,
    completed_writes: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl AnalysisRecordStore for GatedRecordStore {
    async fn upsert(
        &self,
        user_id: &str,
        image_address: &str,
        patch: PartialAnalysisRecord,
    ) -> Result<AnalysisRecord, StoreError> {
        let completing = patch.nutrient_detail.is_some();
        let record = self.inner.upsert(user_id, image_address, patch).await?;
        if completing && self.completed_writes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.release.notified().await;
        }
        Ok(record)
    }

    async fn get(&self, user_id: &str, image_address: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        self.inner.get(user_id, image_address).await
    }

    async fn history(&self, user_id: &str, date: chrono::NaiveDate) -> Result<Vec<AnalysisRecord>, StoreError> {
        self.inner.history(user_id, date).await
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn nutrients(name: &str, calories: f64, fat: f64, fiber: f64, sugar: f64) -> NutrientRecord {
    NutrientRecord {
        name: name.to_string(),
        serving_size: "100g".to_string(),
        calories: NutrientValue::Amount(calories),
        total_fat: NutrientValue::Amount(fat),
        saturated_fat: NutrientValue::NotAvailable,
        cholesterol: NutrientValue::NotAvailable,
        sodium: NutrientValue::NotAvailable,
        carbohydrates: NutrientValue::NotAvailable,
        fiber: NutrientValue::Amount(fiber),
        sugar: NutrientValue::Amount(sugar),
        protein: NutrientValue::NotAvailable,
    }
}

fn pipeline_config(admission_rule: AdmissionRule) -> PipelineConfig {
    PipelineConfig {
        admission_rule,
        external_call_timeout_secs: 5,
        max_image_bytes: 1024 * 1024,
        max_concurrent_analyses: 8,
    }
}

struct Harness {
    pipeline: Arc<PipelineOrchestrator>,
    images: Arc<MemoryImageStore>,
    classifier: Arc<ScriptedClassifier>,
    resolver: Arc<ScriptedResolver>,
    records: Arc<SledRecordStore>,
}

fn harness(classifier: ScriptedClassifier, resolver: ScriptedResolver, config: PipelineConfig) -> Harness {
    let images = Arc::new(MemoryImageStore::default());
    let classifier = Arc::new(classifier);
    let resolver = Arc::new(resolver);
    let records = Arc::new(SledRecordStore::temporary().unwrap());
    let pipeline = Arc::new(PipelineOrchestrator::new(
        images.clone(),
        classifier.clone(),
        resolver.clone(),
        records.clone(),
        config,
    ));

    Harness {
        pipeline,
        images,
        classifier,
        resolver,
        records,
    }
}

fn today() -> chrono::NaiveDate {
    Utc::now().date_naive()
}

#[tokio::test]
async fn test_non_image_is_rejected_before_any_call() {
    let h = harness(
        ScriptedClassifier::labels(&[("pizza", 0.99)]),
        ScriptedResolver::returning(Ok(nutrients("Pizza", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let outcome = h.pipeline.analyze("u1", b"%PDF-1.7 not a photo", "menu.pdf").await;
    assert_eq!(
        outcome,
        AnalysisOutcome::Failed(AnalysisError::Validation(ValidationError::NotAnImage {
            filename: "menu.pdf".to_string()
        }))
    );

    let outcome = h.pipeline.analyze("u1", b"", "empty.png").await;
    assert_eq!(outcome, AnalysisOutcome::Failed(ValidationError::Empty.into()));

    assert_eq!(h.images.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.classifier.calls(), 0);
    assert!(h.resolver.terms().is_empty());
    assert!(h.records.history("u1", today()).await.unwrap().is_empty());
    // rejected uploads never open a session
    assert!(h.pipeline.session("u1").is_none());
}

#[tokio::test]
async fn test_oversized_image_is_rejected() {
    let mut config = pipeline_config(AdmissionRule::TopK(3));
    config.max_image_bytes = 8;
    let h = harness(
        ScriptedClassifier::labels(&[("pizza", 0.99)]),
        ScriptedResolver::returning(Ok(nutrients("Pizza", 266.0, 10.0, 2.3, 3.6))),
        config,
    );

    let outcome = h.pipeline.analyze("u1", PNG_BYTES, "big.png").await;
    assert_eq!(
        outcome,
        AnalysisOutcome::Failed(ValidationError::TooLarge { size: PNG_BYTES.len(), limit: 8 }.into())
    );
    assert_eq!(h.classifier.calls(), 0);
}

#[tokio::test]
async fn test_nothing_admitted_is_no_confident_detection() {
    let h = harness(
        ScriptedClassifier::labels(&[("pizza", 0.50), ("lasagna", 0.30)]),
        ScriptedResolver::returning(Ok(nutrients("Pizza", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::Threshold(0.95)),
    );

    let outcome = h.pipeline.analyze("u1", PNG_BYTES, "lunch.png").await;
    assert_eq!(outcome, AnalysisOutcome::NoConfidentDetection { returned: 2 });
    assert!(h.resolver.terms().is_empty());
    assert!(h.records.history("u1", today()).await.unwrap().is_empty());
    assert_eq!(h.pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Completed));
}

#[tokio::test]
async fn test_empty_classifier_response_reports_zero_returned() {
    let h = harness(
        ScriptedClassifier::labels(&[]),
        ScriptedResolver::returning(Ok(nutrients("Pizza", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let outcome = h.pipeline.analyze("u1", PNG_BYTES, "lunch.png").await;
    assert_eq!(outcome, AnalysisOutcome::NoConfidentDetection { returned: 0 });
}

#[tokio::test]
async fn test_completed_analysis_uses_top_candidate() {
    let h = harness(
        ScriptedClassifier::labels(&[
            ("garden_salad", 0.03),
            ("Pizza 2, margherita", 0.96),
            ("flatbread", 0.01),
        ]),
        ScriptedResolver::returning(Ok(nutrients("Pizza, cheese", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let outcome = h.pipeline.analyze("u1", PNG_BYTES, "lunch.png").await;
    let AnalysisOutcome::Completed(record) = outcome else {
        panic!("expected a completed analysis, got {:?}", outcome);
    };

    assert_eq!(h.resolver.terms(), vec!["Pizza".to_string()]);
    assert_eq!(record.user_id, "u1");
    assert_eq!(record.item_name.as_deref(), Some("Pizza"));
    // 266 kcal is under the limit but fiber 2.3 is not enough
    assert_eq!(record.health_label, Some(HealthLabel::Unhealthy));
    assert_eq!(record.nutrient_detail.as_ref().map(|n| n.name.as_str()), Some("Pizza, cheese"));

    let history = h.records.history("u1", today()).await.unwrap();
    assert_eq!(history, vec![record.clone()]);
    assert_eq!(
        h.pipeline.record("u1", &record.image_address).await.unwrap(),
        Some(record)
    );
    assert_eq!(h.pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Completed));
}

#[tokio::test]
async fn test_threshold_label_replaces_keyword_label() {
    // keyword says Unhealthy for "fries", nutrients say Healthy
    let h = harness(
        ScriptedClassifier::labels(&[("baked fries", 0.99)]),
        ScriptedResolver::returning(Ok(nutrients("Potatoes, baked", 93.0, 0.1, 3.3, 1.2))),
        pipeline_config(AdmissionRule::TopK(1)),
    );

    let AnalysisOutcome::Completed(record) = h.pipeline.analyze("u1", PNG_BYTES, "side.png").await else {
        panic!("expected a completed analysis");
    };
    assert_eq!(record.health_label, Some(HealthLabel::Healthy));
}

#[tokio::test]
async fn test_resolution_failure_leaves_provisional_record() {
    let h = harness(
        ScriptedClassifier::labels(&[("grilled salmon salad", 0.99)]),
        ScriptedResolver::returning(Err(NutrientResolutionError::NoMatch {
            term: "grilled salmon salad".to_string(),
        })),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let outcome = h.pipeline.analyze("u1", PNG_BYTES, "dinner.png").await;
    assert!(matches!(
        outcome,
        AnalysisOutcome::Failed(AnalysisError::Resolution(NutrientResolutionError::NoMatch { .. }))
    ));

    let history = h.records.history("u1", today()).await.unwrap();
    assert_eq!(history.len(), 1);
    let provisional = &history[0];
    assert!(provisional.is_provisional());
    assert_eq!(provisional.item_name, None);
    assert_eq!(provisional.health_label, Some(HealthLabel::Healthy));
    assert_eq!(h.pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Errored));
}

#[tokio::test]
async fn test_classifier_failure_writes_nothing() {
    let h = harness(
        ScriptedClassifier::returning(Err(ClassifierError::Rejected {
            status: 503,
            body: "loading".to_string(),
        })),
        ScriptedResolver::returning(Ok(nutrients("Pizza", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let outcome = h.pipeline.analyze("u1", PNG_BYTES, "lunch.png").await;
    let AnalysisOutcome::Failed(err) = outcome else {
        panic!("expected failure");
    };
    assert!(!err.is_retryable());
    assert!(h.resolver.terms().is_empty());
    assert!(h.records.history("u1", today()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_classifier_times_out_as_transport_error() {
    let mut classifier = ScriptedClassifier::labels(&[("pizza", 0.99)]);
    classifier.delay = Some(Duration::from_secs(10));
    let mut config = pipeline_config(AdmissionRule::TopK(3));
    config.external_call_timeout_secs = 1;
    let h = harness(
        classifier,
        ScriptedResolver::returning(Ok(nutrients("Pizza", 266.0, 10.0, 2.3, 3.6))),
        config,
    );

    let outcome = h.pipeline.analyze("u1", PNG_BYTES, "lunch.png").await;
    let AnalysisOutcome::Failed(err) = outcome else {
        panic!("expected failure");
    };
    assert!(matches!(err, AnalysisError::Classifier(ClassifierError::Transport(_))));
    assert!(err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resubmission_supersedes_in_flight_analysis() {
    let mut classifier = ScriptedClassifier::labels(&[("pizza", 0.99)]);
    classifier.hold_first = true;
    let h = harness(
        classifier,
        ScriptedResolver::returning(Ok(nutrients("Pizza, cheese", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.analyze("u1", PNG_BYTES, "first.png").await });

    // wait for the first attempt to reach the classifier
    for _ in 0..500 {
        if h.classifier.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.classifier.calls(), 1);

    let second = h.pipeline.analyze("u1", PNG_BYTES, "second.png").await;
    let AnalysisOutcome::Completed(second_record) = second else {
        panic!("expected the resubmission to complete");
    };

    h.classifier.release.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first, AnalysisOutcome::Superseded);

    let history = h.records.history("u1", today()).await.unwrap();
    assert_eq!(history, vec![second_record]);
    assert_eq!(h.pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_users_are_isolated() {
    let h = harness(
        ScriptedClassifier::labels(&[("caesar salad", 0.97)]),
        ScriptedResolver::returning(Ok(nutrients("Salad, caesar", 180.0, 9.0, 3.2, 2.0))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let tasks = (0..10).map(|n| {
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move {
            let user_id = format!("user-{}", n);
            let outcome = pipeline.analyze(&user_id, PNG_BYTES, "lunch.png").await;
            (user_id, outcome)
        })
    });

    for result in futures::future::join_all(tasks).await {
        let (user_id, outcome) = result.unwrap();
        let AnalysisOutcome::Completed(record) = outcome else {
            panic!("{} did not complete", user_id);
        };
        assert_eq!(record.user_id, user_id);
        assert_eq!(record.health_label, Some(HealthLabel::Healthy));

        let history = h.records.history(&user_id, today()).await.unwrap();
        assert_eq!(history, vec![record]);
    }

    assert_eq!(h.pipeline.resource_stats().analyses_in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_resubmission_leaves_in_flight_analysis_alone() {
    let mut classifier = ScriptedClassifier::labels(&[("pizza", 0.99)]);
    classifier.hold_first = true;
    let h = harness(
        classifier,
        ScriptedResolver::returning(Ok(nutrients("Pizza, cheese", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.analyze("u1", PNG_BYTES, "lunch.png").await });
    wait_until(|| h.classifier.calls() == 1).await;
    assert_eq!(h.classifier.calls(), 1);

    let resubmitted = h.pipeline.analyze("u1", b"%PDF-1.7 not a photo", "menu.pdf").await;
    assert_eq!(
        resubmitted,
        AnalysisOutcome::Failed(AnalysisError::Validation(ValidationError::NotAnImage {
            filename: "menu.pdf".to_string()
        }))
    );
    assert_eq!(h.pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Classifying));

    h.classifier.release.notify_one();
    let AnalysisOutcome::Completed(record) = first.await.unwrap() else {
        panic!("expected the held analysis to complete");
    };
    assert!(!record.is_provisional());

    let history = h.records.history("u1", today()).await.unwrap();
    assert_eq!(history, vec![record]);
    assert_eq!(h.pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_superseded_failure_is_reported_as_superseded() {
    let mut classifier = ScriptedClassifier::returning(Err(ClassifierError::Rejected {
        status: 503,
        body: "loading".to_string(),
    }));
    classifier.hold_first = true;
    let h = harness(
        classifier,
        ScriptedResolver::returning(Ok(nutrients("Pizza", 266.0, 10.0, 2.3, 3.6))),
        pipeline_config(AdmissionRule::TopK(3)),
    );

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.analyze("u1", PNG_BYTES, "first.png").await });
    wait_until(|| h.classifier.calls() == 1).await;
    assert_eq!(h.classifier.calls(), 1);

    let second = h.pipeline.analyze("u1", PNG_BYTES, "second.png").await;
    assert!(matches!(
        second,
        AnalysisOutcome::Failed(AnalysisError::Classifier(ClassifierError::Rejected { status: 503, .. }))
    ));

    h.classifier.release.notify_one();
    assert_eq!(first.await.unwrap(), AnalysisOutcome::Superseded);
    assert_eq!(h.pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Errored));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resubmission_after_completed_write_keeps_completed_outcome() {
    let images = Arc::new(MemoryImageStore::default());
    let records = Arc::new(GatedRecordStore {
        inner: SledRecordStore::temporary().unwrap(),
        completed_writes: AtomicUsize::new(0),
        release: Notify::new(),
    });
    let pipeline = Arc::new(PipelineOrchestrator::new(
        images,
        Arc::new(ScriptedClassifier::labels(&[("pizza", 0.99)])),
        Arc::new(ScriptedResolver::returning(Ok(nutrients("Pizza, cheese", 266.0, 10.0, 2.3, 3.6)))),
        records.clone(),
        pipeline_config(AdmissionRule::TopK(3)),
    ));

    let held = pipeline.clone();
    let first = tokio::spawn(async move { held.analyze("u1", PNG_BYTES, "first.png").await });
    wait_until(|| records.completed_writes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(records.completed_writes.load(Ordering::SeqCst), 1);

    let AnalysisOutcome::Completed(second_record) = pipeline.analyze("u1", PNG_BYTES, "second.png").await else {
        panic!("expected the resubmission to complete");
    };

    records.release.notify_one();
    let AnalysisOutcome::Completed(first_record) = first.await.unwrap() else {
        panic!("expected the written analysis to report completed");
    };
    assert_ne!(first_record.image_address, second_record.image_address);

    let history = records.history("u1", today()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.contains(&first_record));
    assert!(history.contains(&second_record));
    assert_eq!(pipeline.session("u1").map(|s| s.state), Some(AnalysisState::Completed));
}

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Pipeline metrics
    pub static ref ANALYSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("analyses_total", "Total number of analyses by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref ANALYSES_SUPERSEDED: IntCounter = IntCounter::new(
        "analyses_superseded_total",
        "Total number of in-flight analyses discarded by a resubmission"
    ).unwrap();

    // Classifier metrics
    pub static ref CLASSIFIER_REQUESTS: IntCounter = IntCounter::new(
        "classifier_requests_total",
        "Total number of classification requests"
    ).unwrap();

    pub static ref CLASSIFIER_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "classifier_duration_seconds",
            "Classification request latency in seconds"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).unwrap();

    // Nutrition database metrics
    pub static ref NUTRIENT_LOOKUPS: IntCounter = IntCounter::new(
        "nutrient_lookups_total",
        "Total number of nutrition database searches"
    ).unwrap();

    pub static ref NUTRIENT_CACHE_HITS: IntCounter = IntCounter::new(
        "nutrient_cache_hits_total",
        "Total number of nutrient lookups served from cache"
    ).unwrap();

    pub static ref NUTRIENT_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "nutrient_duration_seconds",
            "Nutrition database search latency in seconds"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).unwrap();

    // Storage metrics
    pub static ref RECORD_UPSERTS: IntCounter = IntCounter::new(
        "record_upserts_total",
        "Total number of analysis record upserts"
    ).unwrap();

    pub static ref RECORD_UPSERT_CONFLICTS: IntCounter = IntCounter::new(
        "record_upsert_conflicts_total",
        "Total number of upsert compare-and-swap retries"
    ).unwrap();

    pub static ref IMAGES_STORED: IntCounter = IntCounter::new(
        "images_stored_total",
        "Total number of images written to the image store"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ANALYSES_TOTAL.clone()),
        Box::new(ANALYSES_SUPERSEDED.clone()),
        Box::new(CLASSIFIER_REQUESTS.clone()),
        Box::new(CLASSIFIER_LATENCY.clone()),
        Box::new(NUTRIENT_LOOKUPS.clone()),
        Box::new(NUTRIENT_CACHE_HITS.clone()),
        Box::new(NUTRIENT_LATENCY.clone()),
        Box::new(RECORD_UPSERTS.clone()),
        Box::new(RECORD_UPSERT_CONFLICTS.clone()),
        Box::new(IMAGES_STORED.clone()),
    ];

    for collector in collectors {
        // AlreadyReg on a second call is harmless
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!("Skipping metric registration: {}", e);
        }
    }

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Nutrient cache hit rate as a percentage
pub fn nutrient_cache_hit_rate() -> f64 {
    let hits = NUTRIENT_CACHE_HITS.get() as f64;
    let lookups = NUTRIENT_LOOKUPS.get() as f64;
    let total = hits + lookups;

    if total == 0.0 {
        0.0
    } else {
        (hits / total) * 100.0
    }
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

//! Classifier Client
//!
//! Sends image bytes to a remote image-classification endpoint and returns the
//! (label, score) candidates it reports. The response order is whatever the
//! provider sends; [`rank`] applies an [`AdmissionRule`] to produce a
//! [`RankedCandidateSet`].

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use crate::metrics::{self, Timer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCandidate {
    pub label: String,
    pub score: f64,
}

impl ClassificationCandidate {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

/// Policy narrowing raw candidates to the ones trustworthy enough to act on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionRule {
    /// Keep the `k` highest-scoring candidates.
    TopK(usize),
    /// Keep every candidate scoring at least the threshold.
    Threshold(f64),
}

impl FromStr for AdmissionRule {
    type Err = String;

    /// Parses `top_k:<n>` or `threshold:<score>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected '<rule>:<value>', got '{}'", s))?;

        match kind.trim() {
            "top_k" => {
                let k: usize = value
                    .trim()
                    .parse()
                    .map_err(|e| format!("invalid top_k '{}': {}", value, e))?;
                if k == 0 {
                    return Err("top_k must be at least 1".to_string());
                }
                Ok(AdmissionRule::TopK(k))
            }
            "threshold" => {
                let t: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e| format!("invalid threshold '{}': {}", value, e))?;
                if !(0.0..=1.0).contains(&t) {
                    return Err(format!("threshold {} outside [0, 1]", t));
                }
                Ok(AdmissionRule::Threshold(t))
            }
            other => Err(format!("unknown admission rule '{}'", other)),
        }
    }
}

impl fmt::Display for AdmissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionRule::TopK(k) => write!(f, "top_k:{}", k),
            AdmissionRule::Threshold(t) => write!(f, "threshold:{}", t),
        }
    }
}

/// Candidates sorted by descending score after admission.
///
/// `returned` remembers how many candidates the classifier produced before
/// admission, so an empty set can be told apart from an empty response.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidateSet {
    candidates: Vec<ClassificationCandidate>,
    returned: usize,
}

impl RankedCandidateSet {
    pub fn top(&self) -> Option<&ClassificationCandidate> {
        self.candidates.first()
    }

    pub fn candidates(&self) -> &[ClassificationCandidate] {
        &self.candidates
    }

    pub fn labels(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.label.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Number of candidates the classifier returned before admission.
    pub fn returned(&self) -> usize {
        self.returned
    }
}

/// Sort descending by score (ties keep provider order), then admit.
pub fn rank(mut candidates: Vec<ClassificationCandidate>, rule: AdmissionRule) -> RankedCandidateSet {
    let returned = candidates.len();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    match rule {
        AdmissionRule::TopK(k) => candidates.truncate(k),
        AdmissionRule::Threshold(t) => candidates.retain(|c| c.score >= t),
    }

    RankedCandidateSet {
        candidates,
        returned,
    }
}

/// How the image travels to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Raw bytes with the image's content type
    Raw,
    /// JSON body `{"inputs": "<base64>"}`
    Base64,
}

impl FromStr for PayloadEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(PayloadEncoding::Raw),
            "base64" => Ok(PayloadEncoding::Base64),
            other => Err(format!("unknown payload encoding '{}'", other)),
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// One outbound call; no local validation of the image content.
    async fn classify(
        &self,
        image: &[u8],
        content_type: &str,
    ) -> Result<Vec<ClassificationCandidate>, ClassifierError>;
}

/// Classifier backed by an HTTPS inference endpoint returning
/// `[{"label": ..., "score": ...}, ...]`.
pub struct HttpClassifier {
    config: ClassifierConfig,
    http_client: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create classifier HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn parse_candidates(body: &[u8]) -> Result<Vec<ClassificationCandidate>, ClassifierError> {
        let candidates: Vec<ClassificationCandidate> = serde_json::from_slice(body)
            .map_err(|e| ClassifierError::Malformed(format!("JSON parse error: {}", e)))?;

        if let Some(bad) = candidates
            .iter()
            .find(|c| !c.score.is_finite() || !(0.0..=1.0).contains(&c.score))
        {
            return Err(ClassifierError::Malformed(format!(
                "score {} for '{}' outside [0, 1]",
                bad.score, bad.label
            )));
        }

        Ok(candidates)
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        image: &[u8],
        content_type: &str,
    ) -> Result<Vec<ClassificationCandidate>, ClassifierError> {
        let timer = Timer::new();
        metrics::CLASSIFIER_REQUESTS.inc();

        let mut request = self.http_client.post(&self.config.endpoint);
        if !self.config.api_token.is_empty() {
            request = request.bearer_auth(&self.config.api_token);
        }
        request = match self.config.payload {
            PayloadEncoding::Raw => request
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(image.to_vec()),
            PayloadEncoding::Base64 => request.json(&serde_json::json!({
                "inputs": general_purpose::STANDARD.encode(image),
            })),
        };

        let response = request.send().await.map_err(|e| {
            warn!(endpoint = %self.config.endpoint, "Classifier request failed: {}", e);
            ClassifierError::Transport(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Classifier rejected request");
            return Err(ClassifierError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;
        let candidates = Self::parse_candidates(&body)?;

        timer.observe_duration_seconds(&metrics::CLASSIFIER_LATENCY);
        debug!(count = candidates.len(), "Classifier returned candidates");
        Ok(candidates)
    }
}

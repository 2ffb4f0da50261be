//! Resource Management Module
//!
//! Caps how many analyses run at once and how large a submitted image may be.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::ValidationError;

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum size of a submitted image in bytes
    pub max_image_bytes: usize,
    /// Maximum number of analyses executing concurrently
    pub max_concurrent_analyses: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * 1024 * 1024, // 10MB
            max_concurrent_analyses: 64,
        }
    }
}

/// Point-in-time usage snapshot
#[derive(Debug, Clone)]
pub struct ResourceStats {
    pub analyses_in_flight: usize,
    pub limits: ResourceLimits,
}

impl ResourceStats {
    pub fn utilization_percent(&self) -> f64 {
        (self.analyses_in_flight as f64 / self.limits.max_concurrent_analyses as f64) * 100.0
    }
}

pub struct ResourceManager {
    limits: ResourceLimits,
    in_flight: Arc<AtomicUsize>,
    analysis_semaphore: Semaphore,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        let analysis_semaphore = Semaphore::new(limits.max_concurrent_analyses.max(1));

        Self {
            limits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            analysis_semaphore,
        }
    }

    /// Wait for an analysis slot. The slot is released when the guard drops.
    pub async fn acquire_analysis_slot(&self) -> AnalysisGuard<'_> {
        // The semaphore is owned by self and never closed.
        let permit = self.analysis_semaphore.acquire().await.ok();
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        AnalysisGuard {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn check_image_size(&self, size: usize) -> Result<(), ValidationError> {
        if size > self.limits.max_image_bytes {
            return Err(ValidationError::TooLarge {
                size,
                limit: self.limits.max_image_bytes,
            });
        }
        Ok(())
    }

    pub fn get_stats(&self) -> ResourceStats {
        ResourceStats {
            analyses_in_flight: self.in_flight.load(Ordering::Relaxed),
            limits: self.limits.clone(),
        }
    }
}

/// RAII guard for one running analysis
pub struct AnalysisGuard<'a> {
    _permit: Option<SemaphorePermit<'a>>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AnalysisGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

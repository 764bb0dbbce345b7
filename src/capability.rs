//! Render capability seam: the only external call the pipeline makes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::spec::ShotSpecification;

/// Successful output of a render call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedArtifact {
    /// Opaque locator (URL, object key, ...).
    pub locator: String,
    /// Raw capability response, kept for manifests.
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityError {
    pub message: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), timed_out: false }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            message: format!("render timed out after {}ms", after.as_millis()),
            timed_out: true,
        }
    }
}

/// Turns a canonical specification into an artifact locator.
///
/// Implementations must not retry internally; the cache decides whether a
/// failure is ever attempted again.
#[async_trait]
pub trait RenderCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn render(&self, spec: &ShotSpecification) -> Result<RenderedArtifact, CapabilityError>;
}

/// Deterministic in-process capability. Locators derive from the content
/// hash, so identical specs always map to the same locator.
pub struct MockRenderer {
    delay: Duration,
    fail_with: Option<String>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_with: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call fails with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `render` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `render` calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RenderCapability for MockRenderer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn render(&self, spec: &ShotSpecification) -> Result<RenderedArtifact, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        // Released on drop, so a call cancelled by a timeout still counts down.
        let _in_flight = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(message) = &self.fail_with {
            return Err(CapabilityError::new(message.clone()));
        }
        let hash = spec.hash();
        Ok(RenderedArtifact {
            locator: format!("mock://render/{}.png", hash.short()),
            metadata: json!({
                "provider": "mock",
                "shot_id": spec.shot_id(),
                "hash": hash,
            }),
        })
    }
}

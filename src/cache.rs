//! Artifact Cache - content hash to artifact record
//!
//! Each hash is rendered at most once: the first caller installs a pending
//! placeholder and starts the attempt, every concurrent caller attaches to
//! that attempt, and the placeholder is replaced by a terminal record exactly
//! once. Failures are cached like successes and only a forced call re-attempts.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::capability::{CapabilityError, RenderedArtifact};
use crate::error::{CoreError, Result};
use crate::hashing::ContentHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub hash: ContentHash,
    pub status: ArtifactStatus,
    pub locator: Option<String>,
    pub provider: String,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl ArtifactRecord {
    fn pending(hash: ContentHash, provider: &str) -> Self {
        Self {
            hash,
            status: ArtifactStatus::Pending,
            locator: None,
            provider: provider.to_string(),
            error: None,
            metadata: Value::Null,
            requested_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    fn settle(&self, attempt: std::result::Result<RenderedArtifact, CapabilityError>, started: Instant) -> Self {
        let mut record = self.clone();
        match attempt {
            Ok(artifact) => {
                record.status = ArtifactStatus::Done;
                record.locator = Some(artifact.locator);
                record.metadata = artifact.metadata;
            }
            Err(e) => {
                record.status = ArtifactStatus::Failed;
                record.error = Some(e.message);
            }
        }
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(started.elapsed().as_millis() as u64);
        record
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ArtifactStatus::Pending
    }

    /// The locator of a done record; a failed or pending record becomes
    /// [`CoreError::RenderFailure`].
    pub fn into_result(self) -> Result<String> {
        match (self.status, self.locator) {
            (ArtifactStatus::Done, Some(locator)) => Ok(locator),
            (ArtifactStatus::Pending, _) => Err(CoreError::RenderFailure {
                hash: self.hash,
                message: "render still pending".into(),
            }),
            _ => Err(CoreError::RenderFailure {
                hash: self.hash,
                message: self.error.unwrap_or_else(|| "unknown error".into()),
            }),
        }
    }
}

/// How a `get_or_render` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderSource {
    /// A terminal record was already cached.
    Hit,
    /// Attached to an attempt another caller started.
    Joined,
    /// This call started the attempt.
    Rendered,
}

#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub record: ArtifactRecord,
    pub source: RenderSource,
}

impl CacheOutcome {
    pub fn cached(&self) -> bool {
        self.source != RenderSource::Rendered
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub joins: u64,
    pub renders: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    joins: AtomicU64,
    renders: AtomicU64,
    failures: AtomicU64,
}

enum Slot {
    InFlight {
        record: ArtifactRecord,
        done: watch::Receiver<Option<ArtifactRecord>>,
    },
    Settled(ArtifactRecord),
}

enum Decision {
    Hit(ArtifactRecord),
    Join(watch::Receiver<Option<ArtifactRecord>>),
    Lead {
        pending: ArtifactRecord,
        tx: watch::Sender<Option<ArtifactRecord>>,
        rx: watch::Receiver<Option<ArtifactRecord>>,
    },
}

struct Inner {
    slots: DashMap<ContentHash, Slot>,
    counters: Counters,
}

/// Process-scoped artifact cache. Cloning shares the same state.
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<Inner>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the terminal record for `hash`, rendering it at most once.
    ///
    /// `render` runs on its own task, so a caller that stops waiting never
    /// abandons the attempt for the other waiters. `force` only affects a
    /// cached failure, which is cleared and attempted again.
    pub async fn get_or_render<F, Fut>(
        &self,
        hash: &ContentHash,
        provider: &str,
        force: bool,
        render: F,
    ) -> CacheOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<RenderedArtifact, CapabilityError>> + Send + 'static,
    {
        match self.decide(hash, provider, force) {
            Decision::Hit(record) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(hash = %hash.short(), "artifact cache hit");
                CacheOutcome { record, source: RenderSource::Hit }
            }
            Decision::Join(rx) => {
                self.inner.counters.joins.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(hash = %hash.short(), "joining in-flight render");
                let record = self.wait(hash, rx).await;
                CacheOutcome { record, source: RenderSource::Joined }
            }
            Decision::Lead { pending, tx, rx } => {
                self.inner.counters.renders.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(hash = %hash.short(), force, "starting render");
                self.spawn_attempt(pending, tx, render);
                let record = self.wait(hash, rx).await;
                CacheOutcome { record, source: RenderSource::Rendered }
            }
        }
    }

    fn decide(&self, hash: &ContentHash, provider: &str, force: bool) -> Decision {
        let lead = |provider: &str| {
            let pending = ArtifactRecord::pending(hash.clone(), provider);
            let (tx, rx) = watch::channel(None);
            let slot = Slot::InFlight { record: pending.clone(), done: rx.clone() };
            (slot, Decision::Lead { pending, tx, rx })
        };

        match self.inner.slots.entry(hash.clone()) {
            Entry::Occupied(mut occupied) => {
                let retry = force
                    && matches!(occupied.get(), Slot::Settled(r) if r.status == ArtifactStatus::Failed);
                if retry {
                    let (slot, decision) = lead(provider);
                    occupied.insert(slot);
                    return decision;
                }
                match occupied.get() {
                    Slot::Settled(record) => Decision::Hit(record.clone()),
                    Slot::InFlight { done, .. } => Decision::Join(done.clone()),
                }
            }
            Entry::Vacant(vacant) => {
                let (slot, decision) = lead(provider);
                vacant.insert(slot);
                decision
            }
        }
    }

    fn spawn_attempt<F, Fut>(
        &self,
        pending: ArtifactRecord,
        tx: watch::Sender<Option<ArtifactRecord>>,
        render: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<RenderedArtifact, CapabilityError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let started = Instant::now();
            let attempt = match tokio::spawn(async move { render().await }).await {
                Ok(attempt) => attempt,
                Err(e) => Err(CapabilityError::new(format!("render task aborted: {}", e))),
            };
            let record = pending.settle(attempt, started);
            if record.status == ArtifactStatus::Failed {
                inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(hash = %record.hash.short(), error = ?record.error, "render failed");
            } else {
                tracing::info!(hash = %record.hash.short(), duration_ms = ?record.duration_ms, "render done");
            }
            // Settle the slot before waking waiters so they never observe a
            // pending lookup after being released.
            inner.slots.insert(record.hash.clone(), Slot::Settled(record.clone()));
            let _ = tx.send(Some(record));
        });
    }

    async fn wait(&self, hash: &ContentHash, mut rx: watch::Receiver<Option<ArtifactRecord>>) -> ArtifactRecord {
        let settled = rx.wait_for(Option::is_some).await.map(|r| r.clone());
        if let Ok(Some(record)) = settled {
            return record;
        }

        // The attempt was dropped without settling (runtime shutdown).
        let abandoned = ArtifactRecord::pending(hash.clone(), "unknown")
            .settle(Err(CapabilityError::new("render attempt abandoned")), Instant::now());
        let mut record = abandoned.clone();
        self.inner
            .slots
            .entry(hash.clone())
            .and_modify(|slot| match slot {
                Slot::InFlight { record: pending, .. } => {
                    record = pending.settle(Err(CapabilityError::new("render attempt abandoned")), Instant::now());
                    *slot = Slot::Settled(record.clone());
                }
                Slot::Settled(settled) => record = settled.clone(),
            })
            .or_insert_with(|| Slot::Settled(abandoned));
        record
    }

    /// Non-blocking read; in-flight hashes report their pending placeholder.
    pub fn lookup(&self, hash: &ContentHash) -> Option<ArtifactRecord> {
        self.inner.slots.get(hash).map(|slot| match slot.value() {
            Slot::InFlight { record, .. } => record.clone(),
            Slot::Settled(record) => record.clone(),
        })
    }

    /// Snapshot of every record, ordered by hash.
    pub fn records(&self) -> Vec<ArtifactRecord> {
        let mut records: Vec<_> = self
            .inner
            .slots
            .iter()
            .map(|slot| match slot.value() {
                Slot::InFlight { record, .. } => record.clone(),
                Slot::Settled(record) => record.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.hash.cmp(&b.hash));
        records
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            joins: c.joins.load(Ordering::Relaxed),
            renders: c.renders.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new()
    }
}

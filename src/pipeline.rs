//! Render Pipeline - Single Entry Point
//!
//! Wires canonicalization, lineage, the artifact cache and the scheduler
//! together and exposes the four core operations (submit version, submit
//! patch, submit render job, poll) plus the read API used by exporters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{ArtifactCache, ArtifactRecord, CacheStats, RenderSource};
use crate::capability::RenderCapability;
use crate::config::{PipelineConfig, SyncRenderPolicy};
use crate::diff::DiffEntry;
use crate::error::{CoreError, Result};
use crate::hashing::ContentHash;
use crate::lineage::{InMemoryVersionStore, Provenance, ReviewStatus, ShotSummary, ShotVersion, VersionStore};
use crate::patch::Patch;
use crate::scheduler::{JobId, JobScheduler, RenderContext, RenderJob, RenderTarget};
use crate::spec::ShotSpecification;

/// One shot to render; `version: None` means the current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub shot_id: String,
    #[serde(default)]
    pub version: Option<u32>,
}

impl RenderRequest {
    pub fn current(shot_id: impl Into<String>) -> Self {
        Self { shot_id: shot_id.into(), version: None }
    }

    pub fn pinned(shot_id: impl Into<String>, version: u32) -> Self {
        Self { shot_id: shot_id.into(), version: Some(version) }
    }
}

/// Result of the synchronous single-item path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResult {
    pub shot_id: String,
    pub version: u32,
    pub hash: ContentHash,
    pub cached: bool,
    pub source: RenderSource,
    pub record: ArtifactRecord,
}

/// The render pipeline - single entry point for all core operations
pub struct RenderPipeline {
    config: PipelineConfig,
    versions: Arc<dyn VersionStore>,
    context: Arc<RenderContext>,
    scheduler: JobScheduler,
}

impl RenderPipeline {
    /// Process-lifetime pipeline over an in-memory version store. Must be
    /// called inside a tokio runtime; workers start immediately.
    pub fn new(config: PipelineConfig, capability: Arc<dyn RenderCapability>) -> Result<Self> {
        Self::with_store(config, capability, Arc::new(InMemoryVersionStore::new()))
    }

    pub fn with_store(
        config: PipelineConfig,
        capability: Arc<dyn RenderCapability>,
        versions: Arc<dyn VersionStore>,
    ) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(RenderContext::new(
            ArtifactCache::new(),
            capability,
            Arc::clone(&versions),
            &config,
        ));
        let scheduler = JobScheduler::start(Arc::clone(&context), &config);
        tracing::info!(
            concurrency = config.concurrency,
            timeout_secs = config.render_timeout_secs,
            sync_policy = ?config.sync_policy,
            "render pipeline ready"
        );
        Ok(Self { config, versions, context, scheduler })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // --- Lineage ---

    /// Records a planned specification as a new version.
    #[tracing::instrument(skip(self, spec, provenance))]
    pub fn submit_version(&self, spec: Value, provenance: Provenance) -> Result<ShotVersion> {
        let spec = ShotSpecification::from_value(spec)?;
        self.versions.create_initial_version(spec, provenance)
    }

    /// Derives a new version from a nested merge document such as
    /// `{"camera": {"fov": 60}}`.
    #[tracing::instrument(skip(self, merge))]
    pub fn submit_patch(&self, shot_id: &str, merge: &Value) -> Result<ShotVersion> {
        let patch = Patch::from_merge(merge)?;
        self.apply_patch(shot_id, &patch)
    }

    pub fn apply_patch(&self, shot_id: &str, patch: &Patch) -> Result<ShotVersion> {
        self.versions
            .create_patched_version(shot_id, patch, self.config.patch_mode)
    }

    /// Compare-and-append variant of [`RenderPipeline::apply_patch`].
    pub fn apply_patch_from(&self, shot_id: &str, base_version: u32, patch: &Patch) -> Result<ShotVersion> {
        self.versions
            .create_patched_version_from(shot_id, base_version, patch, self.config.patch_mode)
    }

    pub fn diff(&self, shot_id: &str, from_version: u32, to_version: u32) -> Result<Vec<DiffEntry>> {
        self.versions.diff(shot_id, from_version, to_version)
    }

    pub fn set_review(
        &self,
        shot_id: &str,
        version: u32,
        status: ReviewStatus,
        note: Option<String>,
    ) -> Result<ShotVersion> {
        self.versions.set_review(shot_id, version, status, note)
    }

    // --- Rendering ---

    /// Validates every request synchronously, then queues one job for the
    /// whole batch. Render outcomes are observed by polling the job.
    #[tracing::instrument(skip(self, requests), fields(count = requests.len()))]
    pub fn submit_render_job(&self, requests: &[RenderRequest], force: bool) -> Result<JobId> {
        let targets = requests
            .iter()
            .map(|request| self.resolve(request))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.scheduler.submit(targets, force))
    }

    /// Renders one shot on the caller's task, bypassing the queue but not
    /// the cache, so it never double-renders a hash a job is rendering.
    #[tracing::instrument(skip(self))]
    pub async fn render_now(&self, request: &RenderRequest, force: bool) -> Result<RenderResult> {
        let target = self.resolve(request)?;
        let gated = self.config.sync_policy == SyncRenderPolicy::Bounded;
        let outcome = self.context.render(&target.spec, force, gated).await;
        self.context.write_back(&target.shot_id, target.version, &outcome.record);
        Ok(RenderResult {
            shot_id: target.shot_id,
            version: target.version,
            hash: target.spec.hash().clone(),
            cached: outcome.cached(),
            source: outcome.source,
            record: outcome.record,
        })
    }

    fn resolve(&self, request: &RenderRequest) -> Result<RenderTarget> {
        let version = match request.version {
            Some(n) => self.versions.version(&request.shot_id, n)?,
            None => self.versions.current_version(&request.shot_id)?,
        };
        Ok(RenderTarget {
            shot_id: version.shot_id,
            version: version.version,
            spec: version.spec,
        })
    }

    // --- Jobs ---

    pub fn job(&self, job_id: &JobId) -> Result<RenderJob> {
        self.scheduler
            .job(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))
    }

    pub fn jobs(&self) -> Vec<RenderJob> {
        self.scheduler.jobs()
    }

    pub async fn wait_for_job(&self, job_id: &JobId) -> Result<RenderJob> {
        self.scheduler.wait_for(job_id).await
    }

    pub fn cancel_job(&self, job_id: &JobId) -> Result<RenderJob> {
        self.scheduler.cancel(job_id)
    }

    /// Drops a finished job from the job table.
    pub fn forget_job(&self, job_id: &JobId) -> Result<RenderJob> {
        self.scheduler.forget(job_id)
    }

    // --- Read API ---

    pub fn list_shots(&self) -> Vec<ShotSummary> {
        self.versions.list_shots()
    }

    pub fn versions(&self, shot_id: &str) -> Result<Vec<ShotVersion>> {
        self.versions.versions(shot_id)
    }

    pub fn version(&self, shot_id: &str, version: u32) -> Result<ShotVersion> {
        self.versions.version(shot_id, version)
    }

    pub fn current_version(&self, shot_id: &str) -> Result<ShotVersion> {
        self.versions.current_version(shot_id)
    }

    pub fn artifact(&self, hash: &ContentHash) -> Option<ArtifactRecord> {
        self.context.cache().lookup(hash)
    }

    pub fn artifacts(&self) -> Vec<ArtifactRecord> {
        self.context.cache().records()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.context.cache().stats()
    }

    /// Stops accepting jobs and waits for accepted work to drain.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

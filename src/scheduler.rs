//! Job Scheduler - batches of render requests over a bounded worker pool
//!
//! Job state machine: `queued -> running -> {done, failed, cancelled}`.
//! Item failures never fail a job under the default policy; only a
//! submission the queue cannot accept does.
//!
//! Jobs stay in the table after finishing so they can be polled; callers
//! drop terminal jobs with [`JobScheduler::forget`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{ArtifactCache, ArtifactRecord, ArtifactStatus, CacheOutcome};
use crate::capability::{CapabilityError, RenderCapability};
use crate::config::{JobFailurePolicy, PipelineConfig};
use crate::error::{CoreError, Result};
use crate::hashing::ContentHash;
use crate::lineage::VersionStore;
use crate::spec::ShotSpecification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::UnknownJob(s.to_string()))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Failed | ItemStatus::Cancelled)
    }
}

/// One requested shot version inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    pub shot_id: String,
    pub version: u32,
    pub hash: ContentHash,
    pub status: ItemStatus,
    pub cached: bool,
    pub locator: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub items: Vec<JobItem>,
    /// Items satisfied without a fresh render.
    pub cache_hits: usize,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RenderJob {
    fn new(items: Vec<JobItem>) -> Self {
        Self {
            job_id: JobId::new(),
            status: JobStatus::Queued,
            progress: JobProgress { completed: 0, total: items.len() },
            items,
            cache_hits: 0,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn items_for<'a>(&'a mut self, hash: &'a ContentHash) -> impl Iterator<Item = &'a mut JobItem> + 'a {
        self.items.iter_mut().filter(move |item| &item.hash == hash)
    }

    fn fault(&mut self, message: String) {
        for item in self.items.iter_mut().filter(|i| !i.status.is_terminal()) {
            item.status = ItemStatus::Cancelled;
        }
        self.status = JobStatus::Failed;
        self.error = Some(message);
        self.finished_at = Some(Utc::now());
    }

    fn finish_if_complete(&mut self, policy: JobFailurePolicy) {
        if self.status.is_terminal() || !self.items.iter().all(|i| i.status.is_terminal()) {
            return;
        }
        let failed = self.items.iter().filter(|i| i.status == ItemStatus::Failed).count();
        let cancelled = self.items.iter().any(|i| i.status == ItemStatus::Cancelled);
        self.status = if self.cancel_requested && cancelled {
            JobStatus::Cancelled
        } else if policy == JobFailurePolicy::AnyItem && failed > 0 {
            self.error = Some(format!("{} item(s) failed", failed));
            JobStatus::Failed
        } else {
            JobStatus::Done
        };
        self.finished_at = Some(Utc::now());
    }
}

/// A resolved shot version to render.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub shot_id: String,
    pub version: u32,
    pub spec: ShotSpecification,
}

/// Everything needed to turn a specification into a cached artifact.
/// Shared by the queued workers and the synchronous path.
pub struct RenderContext {
    cache: ArtifactCache,
    capability: Arc<dyn RenderCapability>,
    versions: Arc<dyn VersionStore>,
    gate: Arc<Semaphore>,
    timeout: Duration,
}

impl RenderContext {
    pub fn new(
        cache: ArtifactCache,
        capability: Arc<dyn RenderCapability>,
        versions: Arc<dyn VersionStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            cache,
            capability,
            versions,
            gate: Arc::new(Semaphore::new(config.concurrency)),
            timeout: config.render_timeout(),
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn versions(&self) -> &Arc<dyn VersionStore> {
        &self.versions
    }

    /// Renders through the cache. With `gated`, the capability call holds
    /// one of the shared concurrency permits; the timeout covers only the
    /// capability call itself.
    pub async fn render(&self, spec: &ShotSpecification, force: bool, gated: bool) -> CacheOutcome {
        let capability = Arc::clone(&self.capability);
        let provider = capability.name().to_string();
        let gate = gated.then(|| Arc::clone(&self.gate));
        let timeout = self.timeout;
        let owned = spec.clone();

        self.cache
            .get_or_render(spec.hash(), &provider, force, move || async move {
                let _permit = match gate {
                    Some(gate) => match gate.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return Err(CapabilityError::new("render gate closed")),
                    },
                    None => None,
                };
                match tokio::time::timeout(timeout, capability.render(&owned)).await {
                    Ok(attempt) => attempt,
                    Err(_) => Err(CapabilityError::timeout(timeout)),
                }
            })
            .await
    }

    /// Writes a terminal record back onto a version; lineage problems are
    /// logged, never surfaced as render failures.
    pub fn write_back(&self, shot_id: &str, version: u32, record: &ArtifactRecord) {
        if let Err(e) = self.versions.record_render(shot_id, version, record) {
            tracing::warn!(shot_id, version, error = %e, "could not record render on version");
        }
    }
}

struct WorkItem {
    job_id: JobId,
    hash: ContentHash,
    spec: ShotSpecification,
    force: bool,
}

struct Shared {
    jobs: DashMap<JobId, RenderJob>,
    context: Arc<RenderContext>,
    queued: AtomicUsize,
    capacity: usize,
    failure_policy: JobFailurePolicy,
    changed: watch::Sender<u64>,
}

impl Shared {
    fn notify(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }

    /// Marks the items for `item.hash` running, or cancelled when the job
    /// asked to stop. Returns the versions to write back on dispatch.
    fn begin(&self, item: &WorkItem) -> Option<Vec<(String, u32)>> {
        let mut job = self.jobs.get_mut(&item.job_id)?;
        if job.status.is_terminal() {
            return None;
        }
        if job.cancel_requested {
            let mut skipped = 0;
            for entry in job.items_for(&item.hash) {
                entry.status = ItemStatus::Cancelled;
                skipped += 1;
            }
            job.progress.completed += skipped;
            job.finish_if_complete(self.failure_policy);
            return None;
        }
        if job.status == JobStatus::Queued {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
        let targets = job
            .items_for(&item.hash)
            .map(|entry| {
                entry.status = ItemStatus::Running;
                (entry.shot_id.clone(), entry.version)
            })
            .collect();
        Some(targets)
    }

    fn complete(&self, job_id: &JobId, outcome: &CacheOutcome) {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let record = &outcome.record;
        let mut first = true;
        let mut hits = 0;
        let mut finished = 0;
        for entry in job.items_for(&record.hash) {
            entry.cached = if first { outcome.cached() } else { true };
            first = false;
            if entry.cached {
                hits += 1;
            }
            match record.status {
                ArtifactStatus::Done => {
                    entry.status = ItemStatus::Done;
                    entry.locator = record.locator.clone();
                }
                _ => {
                    entry.status = ItemStatus::Failed;
                    entry.error = record.error.clone();
                }
            }
            finished += 1;
        }
        job.cache_hits += hits;
        job.progress.completed += finished;
        job.finish_if_complete(self.failure_policy);
        if job.status.is_terminal() {
            tracing::info!(
                job_id = %job.job_id,
                status = ?job.status,
                completed = job.progress.completed,
                total = job.progress.total,
                cache_hits = job.cache_hits,
                "job finished"
            );
        }
    }

    async fn process(&self, item: WorkItem) {
        let dispatched = self.begin(&item);
        self.notify();
        let Some(targets) = dispatched else {
            return;
        };

        let outcome = self.context.render(&item.spec, item.force, true).await;
        for (shot_id, version) in &targets {
            self.context.write_back(shot_id, *version, &outcome.record);
        }
        self.complete(&item.job_id, &outcome);
        self.notify();
    }
}

/// Accepts batches, deduplicates hashes per batch and feeds a fixed pool of
/// workers. Must be started inside a tokio runtime.
pub struct JobScheduler {
    shared: Arc<Shared>,
    queue: StdMutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn start(context: Arc<RenderContext>, config: &PipelineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (changed, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            jobs: DashMap::new(),
            context,
            queued: AtomicUsize::new(0),
            capacity: config.queue_capacity,
            failure_policy: config.job_failure_policy,
            changed,
        });

        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..config.concurrency)
            .map(|worker| tokio::spawn(run_worker(worker, Arc::clone(&shared), Arc::clone(&rx))))
            .collect();
        tracing::debug!(workers = config.concurrency, capacity = config.queue_capacity, "scheduler started");

        Self {
            shared,
            queue: StdMutex::new(Some(tx)),
            workers: StdMutex::new(workers),
        }
    }

    /// Registers a job and enqueues one work item per distinct hash.
    ///
    /// A queue that cannot take the whole batch fails the job with a
    /// scheduler fault and enqueues nothing.
    pub fn submit(&self, targets: Vec<RenderTarget>, force: bool) -> JobId {
        let mut seen = HashSet::new();
        let mut work = vec![];
        let items = targets
            .into_iter()
            .map(|target| {
                let hash = target.spec.hash().clone();
                if seen.insert(hash.clone()) {
                    work.push((hash.clone(), target.spec));
                }
                JobItem {
                    shot_id: target.shot_id,
                    version: target.version,
                    hash,
                    status: ItemStatus::Queued,
                    cached: false,
                    locator: None,
                    error: None,
                }
            })
            .collect();

        let mut job = RenderJob::new(items);
        let job_id = job.job_id;
        job.finish_if_complete(self.shared.failure_policy);
        self.shared.jobs.insert(job_id, job);

        if !work.is_empty() {
            if let Err(fault) = self.enqueue(job_id, work, force) {
                tracing::warn!(%job_id, error = %fault, "job could not be scheduled");
                if let Some(mut job) = self.shared.jobs.get_mut(&job_id) {
                    job.fault(fault.to_string());
                }
            } else {
                tracing::info!(%job_id, "job queued");
            }
        }
        self.shared.notify();
        job_id
    }

    fn enqueue(&self, job_id: JobId, work: Vec<(ContentHash, ShotSpecification)>, force: bool) -> Result<()> {
        let n = work.len();
        let capacity = self.shared.capacity;
        self.shared
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued + n <= capacity).then_some(queued + n)
            })
            .map_err(|queued| {
                CoreError::SchedulerFault(format!("queue full ({} queued, capacity {}, batch {})", queued, capacity, n))
            })?;

        let sender = self.queue.lock().ok().and_then(|q| q.clone());
        let Some(sender) = sender else {
            self.shared.queued.fetch_sub(n, Ordering::SeqCst);
            return Err(CoreError::SchedulerFault("scheduler is shut down".into()));
        };
        for (sent, (hash, spec)) in work.into_iter().enumerate() {
            if sender.send(WorkItem { job_id, hash, spec, force }).is_err() {
                self.shared.queued.fetch_sub(n - sent, Ordering::SeqCst);
                return Err(CoreError::SchedulerFault("work queue closed".into()));
            }
        }
        Ok(())
    }

    /// Snapshot of a job; safe to poll at any time.
    pub fn job(&self, job_id: &JobId) -> Option<RenderJob> {
        self.shared.jobs.get(job_id).map(|job| job.clone())
    }

    pub fn jobs(&self) -> Vec<RenderJob> {
        let mut jobs: Vec<_> = self.shared.jobs.iter().map(|job| job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Resolves once the job reaches a terminal status.
    pub async fn wait_for(&self, job_id: &JobId) -> Result<RenderJob> {
        let mut changes = self.shared.changed.subscribe();
        loop {
            let job = self
                .job(job_id)
                .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
            if job.status.is_terminal() || changes.changed().await.is_err() {
                return Ok(job);
            }
        }
    }

    /// Stops dispatch of the job's undispatched items. Items already being
    /// rendered finish and are recorded normally.
    pub fn cancel(&self, job_id: &JobId) -> Result<RenderJob> {
        let snapshot = {
            let mut job = self
                .shared
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
            if !job.status.is_terminal() {
                job.cancel_requested = true;
                tracing::info!(%job_id, "job cancellation requested");
            }
            job.clone()
        };
        self.shared.notify();
        Ok(snapshot)
    }

    /// Removes a terminal job from the table. Running jobs are kept and
    /// reported as a scheduler fault.
    pub fn forget(&self, job_id: &JobId) -> Result<RenderJob> {
        let removed = self
            .shared
            .jobs
            .remove_if(job_id, |_, job| job.status.is_terminal());
        match removed {
            Some((_, job)) => {
                tracing::debug!(%job_id, "job forgotten");
                Ok(job)
            }
            None if self.shared.jobs.contains_key(job_id) => {
                Err(CoreError::SchedulerFault(format!("job {} is still running", job_id)))
            }
            None => Err(CoreError::UnknownJob(job_id.to_string())),
        }
    }

    /// Number of work items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Closes the queue and waits for workers to drain what was accepted.
    pub async fn shutdown(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        let workers: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => vec![],
        };
        for worker in workers {
            let _ = worker.await;
        }
        tracing::debug!("scheduler stopped");
    }
}

async fn run_worker(worker: usize, shared: Arc<Shared>, rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(item) = next else {
            break;
        };
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(worker, job_id = %item.job_id, hash = %item.hash.short(), "dispatching");
        shared.process(item).await;
    }
    tracing::debug!(worker, "worker exiting");
}

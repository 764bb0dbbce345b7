//! Render Deduplication and Scheduling Tests
//!
//! Exercise the cache, the worker pool and the synchronous path together
//! against the deterministic mock capability.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use shotforge_core::{
    ArtifactCache, ArtifactStatus, CapabilityError, ContentHash, ItemStatus, JobStatus, MockRenderer, PipelineConfig, Provenance,
    RenderPipeline, RenderRequest, RenderSource, RenderedArtifact, ShotSpecification, SyncRenderPolicy,
};

fn shot(shot_id: &str, fov: i64) -> Value {
    json!({
        "shot_id": shot_id,
        "subject": "Ceramic Mug",
        "camera": {"fov": fov, "position": {"x": 0, "y": 0, "z": 5}},
        "lens": {"aperture": 2.8},
        "output": {"width": 512, "height": 512}
    })
}

fn pipeline_with(config: PipelineConfig, renderer: Arc<MockRenderer>) -> RenderPipeline {
    RenderPipeline::new(config, renderer).unwrap()
}

fn plan(pipeline: &RenderPipeline, shots: &[(&str, i64)]) -> Vec<RenderRequest> {
    shots
        .iter()
        .map(|(id, fov)| {
            pipeline.submit_version(shot(id, *fov), Provenance::plan()).unwrap();
            RenderRequest::current(*id)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_render_once() {
    let cache = ArtifactCache::new();
    let hash = ContentHash::parse(&"a".repeat(64)).unwrap();
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let cache = cache.clone();
            let hash = hash.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_render(&hash, "test", false, move || async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, CapabilityError>(RenderedArtifact { locator: "mem://one".into(), metadata: Value::Null })
                    })
                    .await
            })
        })
        .collect();

    let mut rendered = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.record.status, ArtifactStatus::Done);
        assert_eq!(outcome.record.locator.as_deref(), Some("mem://one"));
        if outcome.source == RenderSource::Rendered {
            rendered += 1;
        }
    }
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(rendered, 1);
    assert_eq!(cache.stats().renders, 1);
    assert_eq!(cache.stats().hits + cache.stats().joins, 31);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_deduplicates_shared_hashes() {
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_millis(20)));
    let pipeline = pipeline_with(PipelineConfig::default(), renderer.clone());
    // a and b differ only in shot_id, so they share a hash.
    let requests = plan(&pipeline, &[("a", 45), ("b", 45), ("c", 60)]);

    let job_id = pipeline.submit_render_job(&requests, false).unwrap();
    let job = pipeline.wait_for_job(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.progress.completed, 3);
    assert_eq!(job.progress.total, 3);
    assert_eq!(renderer.calls(), 2);
    assert_eq!(job.items[0].hash, job.items[1].hash);
    assert_ne!(job.items[0].hash, job.items[2].hash);
    assert_eq!(job.items[0].locator, job.items[1].locator);

    let shared: Vec<bool> = job.items[..2].iter().map(|i| i.cached).collect();
    assert_eq!(shared.iter().filter(|c| **c).count(), 1);
    assert!(!job.items[2].cached);
    assert_eq!(job.cache_hits, 1);

    for item in &job.items {
        assert_eq!(item.status, ItemStatus::Done);
        let version = pipeline.version(&item.shot_id, item.version).unwrap();
        assert_eq!(version.artifact_locator, item.locator);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_job_is_fully_cached() {
    let renderer = Arc::new(MockRenderer::new());
    let pipeline = pipeline_with(PipelineConfig::default(), renderer.clone());
    let requests = plan(&pipeline, &[("a", 45), ("b", 50)]);

    let first = pipeline.submit_render_job(&requests, false).unwrap();
    pipeline.wait_for_job(&first).await.unwrap();
    let second = pipeline.submit_render_job(&requests, false).unwrap();
    let job = pipeline.wait_for_job(&second).await.unwrap();

    assert_eq!(renderer.calls(), 2);
    assert!(job.items.iter().all(|i| i.cached));
    assert_eq!(job.cache_hits, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failures_are_cached_until_forced() {
    let renderer = Arc::new(MockRenderer::new().failing("provider unavailable"));
    let pipeline = pipeline_with(PipelineConfig::default(), renderer.clone());
    let requests = plan(&pipeline, &[("a", 45)]);

    let job = pipeline
        .wait_for_job(&pipeline.submit_render_job(&requests, false).unwrap())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.items[0].status, ItemStatus::Failed);
    assert_eq!(job.items[0].error.as_deref(), Some("provider unavailable"));

    let hash = job.items[0].hash.clone();
    let record = pipeline.artifact(&hash).unwrap();
    assert_eq!(record.status, ArtifactStatus::Failed);
    assert_eq!(pipeline.current_version("a").unwrap().last_error.as_deref(), Some("provider unavailable"));

    let again = pipeline.render_now(&requests[0], false).await.unwrap();
    assert_eq!(again.source, RenderSource::Hit);
    assert_eq!(again.record.status, ArtifactStatus::Failed);
    assert_eq!(renderer.calls(), 1);

    let forced = pipeline.render_now(&requests[0], true).await.unwrap();
    assert_eq!(forced.source, RenderSource::Rendered);
    assert_eq!(renderer.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_does_not_rerender_success() {
    let renderer = Arc::new(MockRenderer::new());
    let pipeline = pipeline_with(PipelineConfig::default(), renderer.clone());
    let requests = plan(&pipeline, &[("a", 45)]);

    pipeline.render_now(&requests[0], false).await.unwrap();
    let forced = pipeline.render_now(&requests[0], true).await.unwrap();
    assert!(forced.cached);
    assert_eq!(renderer.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_capability_times_out_as_failure() {
    let config = PipelineConfig { render_timeout_secs: 1, ..Default::default() };
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_secs(5)));
    let pipeline = pipeline_with(config, renderer.clone());
    let requests = plan(&pipeline, &[("a", 45)]);

    let result = pipeline.render_now(&requests[0], false).await.unwrap();
    assert_eq!(result.record.status, ArtifactStatus::Failed);
    assert!(result.record.error.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(pipeline.artifact(&result.hash).unwrap().status, ArtifactStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn worker_pool_bounds_capability_calls() {
    let config = PipelineConfig { concurrency: 2, ..Default::default() };
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_millis(30)));
    let pipeline = pipeline_with(config, renderer.clone());
    let shots: Vec<(String, i64)> = (0..10).map(|i| (format!("sku-{}", i), 30 + i)).collect();
    let shots: Vec<(&str, i64)> = shots.iter().map(|(id, fov)| (id.as_str(), *fov)).collect();
    let requests = plan(&pipeline, &shots);

    let job = pipeline
        .wait_for_job(&pipeline.submit_render_job(&requests, false).unwrap())
        .await
        .unwrap();
    assert_eq!(job.progress.completed, 10);
    assert_eq!(renderer.calls(), 10);
    assert!(renderer.peak_in_flight() <= 2, "peak {}", renderer.peak_in_flight());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn bounded_sync_renders_share_the_gate() {
    let config = PipelineConfig { concurrency: 1, sync_policy: SyncRenderPolicy::Bounded, ..Default::default() };
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_millis(30)));
    let pipeline = Arc::new(pipeline_with(config, renderer.clone()));
    let requests = plan(&pipeline, &[("a", 10), ("b", 20), ("c", 30), ("d", 40)]);

    let job_id = pipeline.submit_render_job(&requests[..2], false).unwrap();
    let handles: Vec<_> = requests[2..]
        .iter()
        .cloned()
        .map(|request| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.render_now(&request, false).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().record.status, ArtifactStatus::Done);
    }
    pipeline.wait_for_job(&job_id).await.unwrap();
    assert_eq!(renderer.calls(), 4);
    assert_eq!(renderer.peak_in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn exempt_sync_renders_bypass_the_gate() {
    let config = PipelineConfig { concurrency: 1, sync_policy: SyncRenderPolicy::Exempt, ..Default::default() };
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_millis(300)));
    let pipeline = pipeline_with(config, renderer.clone());
    let requests = plan(&pipeline, &[("a", 10), ("b", 20)]);

    let job_id = pipeline.submit_render_job(&requests[..1], false).unwrap();
    while renderer.in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let now = pipeline.render_now(&requests[1], false).await.unwrap();
    pipeline.wait_for_job(&job_id).await.unwrap();

    assert_eq!(now.record.status, ArtifactStatus::Done);
    assert_eq!(renderer.calls(), 2);
    assert_eq!(renderer.peak_in_flight(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polled_progress_never_decreases() {
    let config = PipelineConfig { concurrency: 1, ..Default::default() };
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_millis(25)));
    let pipeline = pipeline_with(config, renderer.clone());
    let shots: Vec<(String, i64)> = (0..6).map(|i| (format!("sku-{}", i), 70 + i)).collect();
    let shots: Vec<(&str, i64)> = shots.iter().map(|(id, fov)| (id.as_str(), *fov)).collect();
    let requests = plan(&pipeline, &shots);

    let job_id = pipeline.submit_render_job(&requests, false).unwrap();
    let mut last = 0;
    let mut observed = vec![];
    loop {
        let job = pipeline.job(&job_id).unwrap();
        assert!(job.progress.completed >= last, "progress went from {} to {}", last, job.progress.completed);
        assert!(job.progress.completed <= job.progress.total);
        last = job.progress.completed;
        observed.push(last);
        if job.status.is_terminal() {
            assert_eq!(job.status, JobStatus::Done);
            assert_eq!(job.progress.completed, job.progress.total);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(last, 6);
    assert!(observed.iter().any(|c| *c < 6), "job finished before it was polled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_and_queued_paths_share_one_render() {
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_millis(100)));
    let pipeline = pipeline_with(PipelineConfig::default(), renderer.clone());
    let requests = plan(&pipeline, &[("a", 45)]);

    let job_id = pipeline.submit_render_job(&requests, false).unwrap();
    let now = pipeline.render_now(&requests[0], false).await.unwrap();
    let job = pipeline.wait_for_job(&job_id).await.unwrap();

    assert_eq!(renderer.calls(), 1);
    assert_eq!(now.record.locator, job.items[0].locator);
    assert_eq!(pipeline.cache_stats().renders, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_job_skips_undispatched_items() {
    let config = PipelineConfig { concurrency: 1, ..Default::default() };
    let renderer = Arc::new(MockRenderer::new().with_delay(Duration::from_millis(200)));
    let pipeline = pipeline_with(config, renderer.clone());
    let requests = plan(&pipeline, &[("a", 10), ("b", 20), ("c", 30)]);

    let job_id = pipeline.submit_render_job(&requests, false).unwrap();
    pipeline.cancel_job(&job_id).unwrap();
    let job = pipeline.wait_for_job(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.cancel_requested);
    assert_eq!(job.progress.completed, 3);
    let cancelled = job.items.iter().filter(|i| i.status == ItemStatus::Cancelled).count();
    assert!(cancelled >= 2, "only {} cancelled", cancelled);
    assert!(renderer.calls() <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pinned_version_renders_that_version() {
    let renderer = Arc::new(MockRenderer::new());
    let pipeline = pipeline_with(PipelineConfig::default(), renderer.clone());
    plan(&pipeline, &[("a", 45)]);
    pipeline.submit_patch("a", &json!({"camera": {"fov": 60}})).unwrap();

    let v1 = pipeline.render_now(&RenderRequest::pinned("a", 1), false).await.unwrap();
    let v2 = pipeline.render_now(&RenderRequest::current("a"), false).await.unwrap();
    assert_eq!(v1.version, 1);
    assert_eq!(v2.version, 2);
    assert_ne!(v1.hash, v2.hash);

    let expected = ShotSpecification::from_value(shot("a", 45)).unwrap();
    assert_eq!(&v1.hash, expected.hash());
    assert!(pipeline.version("a", 1).unwrap().artifact_locator.is_some());
    assert!(pipeline.version("a", 2).unwrap().artifact_locator.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_patches_get_distinct_versions() {
    let pipeline = Arc::new(pipeline_with(PipelineConfig::default(), Arc::new(MockRenderer::new())));
    plan(&pipeline, &[("a", 45)]);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.submit_patch("a", &json!({"lens": {"aperture": 1.0 + i as f64}})) })
        })
        .collect();
    let mut numbers = vec![];
    for handle in handles {
        numbers.push(handle.await.unwrap().unwrap().version);
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (2..=9).collect::<Vec<u32>>());
}

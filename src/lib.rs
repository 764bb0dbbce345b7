//! ShotForge Core - Deterministic Render Pipeline
//!
//! # Guarantees
//! 1. Identical specifications always hash identically
//! 2. Each content hash is rendered at most once
//! 3. Every version is traceable to its parent
//! 4. Failures are cached, never silently retried

pub mod cache;
pub mod capability;
pub mod config;
pub mod diff;
pub mod error;
pub mod hashing;
pub mod lineage;
pub mod patch;
pub mod pipeline;
pub mod scheduler;
pub mod spec;
pub mod validation;

pub use cache::{ArtifactCache, ArtifactRecord, ArtifactStatus, CacheOutcome, CacheStats, RenderSource};
pub use capability::{CapabilityError, MockRenderer, RenderCapability, RenderedArtifact};
pub use config::{JobFailurePolicy, PipelineConfig, SyncRenderPolicy};
pub use diff::{diff_specs, inverse_patch, DiffEntry};
pub use error::{CoreError, Result};
pub use hashing::{canonical_json, ContentHash};
pub use lineage::{InMemoryVersionStore, Provenance, ReviewStatus, ShotSummary, ShotVersion, VersionStore};
pub use patch::{FieldPath, Patch, PatchMode, PatchOp, PatchOpKind};
pub use pipeline::{RenderPipeline, RenderRequest, RenderResult};
pub use scheduler::{ItemStatus, JobId, JobItem, JobProgress, JobScheduler, JobStatus, RenderContext, RenderJob, RenderTarget};
pub use spec::{canonicalize, hash, ShotSpecification};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

//! Version & Lineage Store
//!
//! Per shot_id, versions form an append-only linear chain: numbers start at 1
//! without gaps, and each version's parent hash is its predecessor's hash.
//! Appends for one shot_id are serialized by the per-key write lock, so two
//! concurrent patches can never both derive from the same parent.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::{ArtifactRecord, ArtifactStatus};
use crate::diff::{diff_specs, DiffEntry};
use crate::error::{CoreError, Result};
use crate::hashing::ContentHash;
use crate::patch::{Patch, PatchMode};
use crate::spec::ShotSpecification;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// How a version's specification came to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Supplied by the specification builder.
    Plan {
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        rules_applied: Vec<String>,
    },
    /// Derived from the parent by applying `patch`.
    Patch { patch: Patch },
}

impl Provenance {
    pub fn plan() -> Self {
        Provenance::Plan { source: None, rules_applied: vec![] }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotVersion {
    pub shot_id: String,
    pub version: u32,
    pub hash: ContentHash,
    pub parent_hash: Option<ContentHash>,
    pub spec: ShotSpecification,
    pub provenance: Provenance,
    pub review: ReviewStatus,
    pub review_note: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Non-owning reference into the artifact cache.
    pub artifact_hash: Option<ContentHash>,
    pub artifact_locator: Option<String>,
    pub last_error: Option<String>,
    pub render_duration_ms: Option<u64>,
}

impl ShotVersion {
    fn new(version: u32, parent: Option<&ShotVersion>, spec: ShotSpecification, provenance: Provenance) -> Self {
        Self {
            shot_id: spec.shot_id().to_string(),
            version,
            hash: spec.hash().clone(),
            parent_hash: parent.map(|p| p.hash.clone()),
            spec,
            provenance,
            review: ReviewStatus::Pending,
            review_note: None,
            reviewed_at: None,
            created_at: Utc::now(),
            artifact_hash: None,
            artifact_locator: None,
            last_error: None,
            render_duration_ms: None,
        }
    }
}

/// Minimal listing entry for exporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotSummary {
    pub shot_id: String,
    pub current_version: u32,
    pub hash: ContentHash,
    pub subject: Option<String>,
}

/// Storage seam for version chains; an alternative persistent store can be
/// substituted without touching callers.
pub trait VersionStore: Send + Sync {
    /// Records a planned specification. A new shot starts at version 1; an
    /// existing shot appends when the content changed.
    fn create_initial_version(&self, spec: ShotSpecification, provenance: Provenance) -> Result<ShotVersion>;

    /// Applies `patch` to the current version and appends the result.
    fn create_patched_version(&self, shot_id: &str, patch: &Patch, mode: PatchMode) -> Result<ShotVersion>;

    /// Compare-and-append: fails with [`CoreError::StaleVersion`] unless
    /// `base_version` is still current.
    fn create_patched_version_from(
        &self,
        shot_id: &str,
        base_version: u32,
        patch: &Patch,
        mode: PatchMode,
    ) -> Result<ShotVersion>;

    fn set_review(&self, shot_id: &str, version: u32, status: ReviewStatus, note: Option<String>) -> Result<ShotVersion>;

    /// Writes a terminal render result back onto a version.
    fn record_render(&self, shot_id: &str, version: u32, record: &ArtifactRecord) -> Result<()>;

    fn version(&self, shot_id: &str, version: u32) -> Result<ShotVersion>;

    fn current_version(&self, shot_id: &str) -> Result<ShotVersion>;

    fn versions(&self, shot_id: &str) -> Result<Vec<ShotVersion>>;

    fn list_shots(&self) -> Vec<ShotSummary>;

    fn diff(&self, shot_id: &str, from_version: u32, to_version: u32) -> Result<Vec<DiffEntry>> {
        let from = self.version(shot_id, from_version)?;
        let to = self.version(shot_id, to_version)?;
        Ok(diff_specs(&from.spec, &to.spec))
    }
}

/// Process-lifetime store; nothing survives a restart.
#[derive(Default)]
pub struct InMemoryVersionStore {
    chains: DashMap<String, Vec<ShotVersion>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_patched(
        &self,
        shot_id: &str,
        base_version: Option<u32>,
        patch: &Patch,
        mode: PatchMode,
    ) -> Result<ShotVersion> {
        let mut chain = self
            .chains
            .get_mut(shot_id)
            .ok_or_else(|| CoreError::UnknownShot(shot_id.to_string()))?;
        let current = chain
            .last()
            .ok_or_else(|| CoreError::UnknownShot(shot_id.to_string()))?;

        if let Some(expected) = base_version {
            if expected != current.version {
                return Err(CoreError::StaleVersion {
                    shot_id: shot_id.to_string(),
                    expected,
                    current: current.version,
                });
            }
        }

        let spec = patch.apply(&current.spec, mode)?;
        if spec.hash() == &current.hash {
            return Err(duplicate(current));
        }
        let next = ShotVersion::new(
            current.version + 1,
            Some(current),
            spec,
            Provenance::Patch { patch: patch.clone() },
        );
        tracing::info!(shot_id, version = next.version, hash = %next.hash.short(), "patched version appended");
        chain.push(next.clone());
        Ok(next)
    }

    fn with_version<T>(&self, shot_id: &str, version: u32, f: impl FnOnce(&mut ShotVersion) -> T) -> Result<T> {
        let mut chain = self
            .chains
            .get_mut(shot_id)
            .ok_or_else(|| CoreError::UnknownShot(shot_id.to_string()))?;
        let slot = match version.checked_sub(1) {
            Some(i) => chain.get_mut(i as usize),
            None => None,
        };
        let slot = slot.ok_or_else(|| CoreError::VersionNotFound { shot_id: shot_id.to_string(), version })?;
        Ok(f(slot))
    }
}

fn duplicate(current: &ShotVersion) -> CoreError {
    CoreError::DuplicateVersion {
        shot_id: current.shot_id.clone(),
        version: current.version,
        hash: current.hash.clone(),
    }
}

impl VersionStore for InMemoryVersionStore {
    fn create_initial_version(&self, spec: ShotSpecification, provenance: Provenance) -> Result<ShotVersion> {
        match self.chains.entry(spec.shot_id().to_string()) {
            Entry::Vacant(vacant) => {
                let first = ShotVersion::new(1, None, spec, provenance);
                tracing::info!(shot_id = %first.shot_id, hash = %first.hash.short(), "initial version created");
                vacant.insert(vec![first.clone()]);
                Ok(first)
            }
            Entry::Occupied(mut occupied) => {
                let chain = occupied.get_mut();
                let Some(current) = chain.last() else {
                    return Err(CoreError::UnknownShot(spec.shot_id().to_string()));
                };
                if spec.hash() == &current.hash {
                    return Err(duplicate(current));
                }
                let next = ShotVersion::new(current.version + 1, Some(current), spec, provenance);
                tracing::info!(shot_id = %next.shot_id, version = next.version, "re-planned version appended");
                chain.push(next.clone());
                Ok(next)
            }
        }
    }

    fn create_patched_version(&self, shot_id: &str, patch: &Patch, mode: PatchMode) -> Result<ShotVersion> {
        self.append_patched(shot_id, None, patch, mode)
    }

    fn create_patched_version_from(
        &self,
        shot_id: &str,
        base_version: u32,
        patch: &Patch,
        mode: PatchMode,
    ) -> Result<ShotVersion> {
        self.append_patched(shot_id, Some(base_version), patch, mode)
    }

    fn set_review(&self, shot_id: &str, version: u32, status: ReviewStatus, note: Option<String>) -> Result<ShotVersion> {
        self.with_version(shot_id, version, |v| {
            v.review = status;
            v.review_note = note;
            v.reviewed_at = Some(Utc::now());
            v.clone()
        })
    }

    fn record_render(&self, shot_id: &str, version: u32, record: &ArtifactRecord) -> Result<()> {
        self.with_version(shot_id, version, |v| {
            v.artifact_hash = Some(record.hash.clone());
            v.render_duration_ms = record.duration_ms;
            match record.status {
                ArtifactStatus::Done => {
                    v.artifact_locator = record.locator.clone();
                    v.last_error = None;
                }
                ArtifactStatus::Failed => v.last_error = record.error.clone(),
                ArtifactStatus::Pending => {}
            }
        })
    }

    fn version(&self, shot_id: &str, version: u32) -> Result<ShotVersion> {
        let chain = self
            .chains
            .get(shot_id)
            .ok_or_else(|| CoreError::UnknownShot(shot_id.to_string()))?;
        version
            .checked_sub(1)
            .and_then(|i| chain.get(i as usize))
            .cloned()
            .ok_or_else(|| CoreError::VersionNotFound { shot_id: shot_id.to_string(), version })
    }

    fn current_version(&self, shot_id: &str) -> Result<ShotVersion> {
        self.chains
            .get(shot_id)
            .and_then(|chain| chain.last().cloned())
            .ok_or_else(|| CoreError::UnknownShot(shot_id.to_string()))
    }

    fn versions(&self, shot_id: &str) -> Result<Vec<ShotVersion>> {
        self.chains
            .get(shot_id)
            .map(|chain| chain.clone())
            .ok_or_else(|| CoreError::UnknownShot(shot_id.to_string()))
    }

    fn list_shots(&self) -> Vec<ShotSummary> {
        let mut shots: Vec<_> = self
            .chains
            .iter()
            .filter_map(|chain| {
                let current = chain.last()?;
                Some(ShotSummary {
                    shot_id: current.shot_id.clone(),
                    current_version: current.version,
                    hash: current.hash.clone(),
                    subject: current.spec.get("subject").and_then(|s| s.as_str()).map(str::to_string),
                })
            })
            .collect();
        shots.sort_by(|a, b| a.shot_id.cmp(&b.shot_id));
        shots
    }
}

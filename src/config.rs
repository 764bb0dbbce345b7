//! Pipeline configuration.
//!
//! Values come from `PipelineConfig::default()` or from `SHOTFORGE_*`
//! environment variables (an optional `.env` file is loaded first).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::patch::PatchMode;

/// Whether synchronous single-item renders share the worker concurrency gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRenderPolicy {
    /// Interactive renders bypass the gate.
    #[default]
    Exempt,
    /// Interactive renders wait for a gate permit like queued work.
    Bounded,
}

/// When a job as a whole is reported `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailurePolicy {
    /// Only scheduler faults fail a job; item failures stay per item.
    #[default]
    PerItem,
    /// Any failed item fails the job once every item is terminal.
    AnyItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker count, and the bound on concurrent capability calls.
    pub concurrency: usize,
    pub render_timeout_secs: u64,
    /// Maximum number of queued (not yet dispatched) items.
    pub queue_capacity: usize,
    pub sync_policy: SyncRenderPolicy,
    pub patch_mode: PatchMode,
    pub job_failure_policy: JobFailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            render_timeout_secs: 120,
            queue_capacity: 1024,
            sync_policy: SyncRenderPolicy::Exempt,
            patch_mode: PatchMode::Lenient,
            job_failure_policy: JobFailurePolicy::PerItem,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(v) = read_env("SHOTFORGE_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = read_env("SHOTFORGE_TIMEOUT_SECONDS")? {
            config.render_timeout_secs = v;
        }
        if let Some(v) = read_env("SHOTFORGE_QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Some(v) = read_enum("SHOTFORGE_SYNC_POLICY")? {
            config.sync_policy = v;
        }
        if let Some(v) = read_enum("SHOTFORGE_PATCH_MODE")? {
            config.patch_mode = v;
        }
        if let Some(v) = read_enum("SHOTFORGE_JOB_FAILURE_POLICY")? {
            config.job_failure_policy = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CoreError::Config("concurrency must be at least 1".into()));
        }
        if self.render_timeout_secs == 0 {
            return Err(CoreError::Config("render timeout must be at least 1 second".into()));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::Config("queue capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }
}

fn read_env<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CoreError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Parses snake_case enum names the same way serde does.
fn read_enum<T: for<'de> Deserialize<'de>>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
            .map(Some)
            .map_err(|e| CoreError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

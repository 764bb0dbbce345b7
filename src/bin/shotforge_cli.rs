//! ShotForge CLI - inspection harness for the render core
//!
//! Commands: hash, diff, render
//! Outputs JSON to stdout, logs to stderr
//! Returns non-zero on invalid input

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use shotforge_core::{
    diff_specs, CoreError, MockRenderer, PipelineConfig, Provenance, RenderPipeline, RenderRequest,
    ShotSpecification, ENGINE_VERSION,
};

#[derive(Parser)]
#[command(name = "shotforge-cli")]
#[command(about = "ShotForge CLI - Deterministic Render Pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print content hashes for every specification in a file
    Hash {
        /// JSON file holding one specification or an array of them
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print the structural diff between two specifications
    Diff {
        #[arg(long)]
        from: PathBuf,

        #[arg(long)]
        to: PathBuf,
    },

    /// Plan, optionally patch, and render specifications with the mock capability
    Render {
        #[arg(short, long)]
        file: PathBuf,

        /// JSON object mapping shot_id to a merge patch
        #[arg(short, long)]
        patches: Option<PathBuf>,

        /// Make every render fail, to inspect failure caching
        #[arg(long)]
        fail: bool,
    },
}

fn load_specs(path: &Path) -> Result<Vec<ShotSpecification>, CoreError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CoreError::InvalidSpecification(format!("{}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&raw)?;
    match value {
        Value::Array(items) => items.into_iter().map(ShotSpecification::from_value).collect(),
        single => Ok(vec![ShotSpecification::from_value(single)?]),
    }
}

fn load_one(path: &Path) -> Result<ShotSpecification, CoreError> {
    load_specs(path)?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::InvalidSpecification(format!("{}: no specification", path.display())))
}

fn hash_command(file: &Path) -> Result<Value, CoreError> {
    let specs = load_specs(file)?;
    let entries = specs
        .iter()
        .map(|spec| -> Result<Value, CoreError> {
            Ok(json!({
                "shot_id": spec.shot_id(),
                "hash": spec.hash(),
                "canonical": String::from_utf8_lossy(&spec.canonical_bytes()?),
            }))
        })
        .collect::<Result<Vec<_>, CoreError>>()?;
    Ok(Value::Array(entries))
}

fn diff_command(from: &Path, to: &Path) -> Result<Value, CoreError> {
    let entries = diff_specs(&load_one(from)?, &load_one(to)?);
    Ok(serde_json::to_value(entries)?)
}

async fn render_command(file: &Path, patches: Option<&Path>, fail: bool) -> Result<Value, CoreError> {
    let config = PipelineConfig::from_env()?;
    let renderer = if fail {
        MockRenderer::new().failing("mock renderer configured to fail")
    } else {
        MockRenderer::new()
    };
    let pipeline = RenderPipeline::new(config, Arc::new(renderer))?;

    let mut requests = vec![];
    for spec in load_specs(file)? {
        let shot_id = spec.shot_id().to_string();
        match pipeline.submit_version(spec.to_value(), Provenance::plan()) {
            Ok(_) => {}
            Err(e) if e.is_informational() => tracing::info!(%shot_id, "{}", e),
            Err(e) => return Err(e),
        }
        requests.push(RenderRequest::current(shot_id));
    }

    if let Some(path) = patches {
        let raw = fs::read_to_string(path)
            .map_err(|e| CoreError::PatchConflict(format!("{}: {}", path.display(), e)))?;
        let doc: Value = serde_json::from_str(&raw)?;
        let Value::Object(by_shot) = doc else {
            return Err(CoreError::PatchConflict("patch file must map shot_id to a patch".into()));
        };
        for (shot_id, merge) in &by_shot {
            pipeline.submit_patch(shot_id, merge)?;
        }
    }

    let job_id = pipeline.submit_render_job(&requests, false)?;
    let job = pipeline.wait_for_job(&job_id).await?;
    let shots = pipeline
        .list_shots()
        .into_iter()
        .map(|summary| pipeline.versions(&summary.shot_id))
        .collect::<Result<Vec<_>, CoreError>>()?;
    pipeline.shutdown().await;

    Ok(json!({
        "engine_version": ENGINE_VERSION,
        "job": job,
        "cache": pipeline.cache_stats(),
        "versions": shots,
    }))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Hash { file } => hash_command(file),
        Commands::Diff { from, to } => diff_command(from, to),
        Commands::Render { file, patches, fail } => render_command(file, patches.as_deref(), *fail).await,
    };

    match result {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            let output = json!({ "success": false, "error": e.to_string() });
            println!("{}", output);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_json(value: &Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", value).unwrap();
        file
    }

    #[test]
    fn hash_command_lists_every_spec() {
        let file = write_json(&json!([
            {"shot_id": "a", "camera": {"fov": 45}},
            {"shot_id": "b", "camera": {"fov": 45.0}}
        ]));
        let output = hash_command(file.path()).unwrap();
        let entries = output.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["hash"], entries[1]["hash"]);
        assert_eq!(entries[0]["canonical"], json!(r#"{"camera":{"fov":45}}"#));
    }

    #[test]
    fn diff_command_reports_paths() {
        let from = write_json(&json!({"shot_id": "a", "camera": {"fov": 45}}));
        let to = write_json(&json!({"shot_id": "a", "camera": {"fov": 60}}));
        let output = diff_command(from.path(), to.path()).unwrap();
        assert_eq!(output, json!([{"path": ["camera", "fov"], "old_value": 45, "new_value": 60}]));
    }

    #[test]
    fn invalid_file_is_reported() {
        let file = write_json(&json!({"camera": {}}));
        assert!(matches!(hash_command(file.path()), Err(CoreError::InvalidSpecification(_))));
    }
}

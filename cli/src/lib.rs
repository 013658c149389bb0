#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown
)]

//! Facade crate for the `kiln` binary: argument parsing, the loader path
//! and compute-precision dispatch.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
#[cfg(any(feature = "cuda", feature = "wgpu"))]
use half::f16;
#[cfg(feature = "cuda")]
use half::bf16;
use kiln_config::{ComputePrecision, RunConfig};
use kiln_core::TrainingBackend;
use kiln_training::{LaunchOptions, LaunchOutcome, launch};
use tracing::info;

pub use kiln_config::ConfigError;
pub use kiln_training::{FitSummary, TrainError};

/// Prepended to `LD_LIBRARY_PATH` at startup.
pub const SYSTEM_LIBRARY_DIR: &str = "/usr/lib/x86_64-linux-gnu";

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    about = "Configuration-driven diffusion model training"
)]
pub struct Args {
    /// Run configuration (YAML)
    #[arg(long)]
    pub config: PathBuf,
    /// Directory with the initial model; overrides trainer.model_path
    #[arg(long = "model_path")]
    pub model_path: Option<PathBuf>,
    /// Checkpoint directory or model-<tag>.mpk file to resume from
    #[arg(long)]
    pub resume: Option<PathBuf>,
    /// Build everything, then stop before training
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            model_path: self.model_path.clone(),
            resume: self.resume.clone(),
            dry_run: self.dry_run,
        }
    }
}

/// `dir` followed by the entries already in `current`.
#[must_use]
pub fn prepend_library_path(dir: &str, current: Option<&str>) -> String {
    match current.filter(|paths| !paths.is_empty()) {
        Some(paths) => format!("{dir}:{paths}"),
        None => dir.to_string(),
    }
}

/// Load the configuration and train with the backend float type matching
/// `lightning.precision`.
pub fn run(args: &Args) -> anyhow::Result<LaunchOutcome> {
    let config = RunConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.validate()?;
    let devices = kiln_core::devices(config.lightning.accelerator, config.lightning.devices)
        .context("failed to select training devices")?;
    let options = args.launch_options();

    let precision = config.lightning.precision;
    let outcome = match precision {
        ComputePrecision::Full => {
            info!("Using float32");
            launch::<TrainingBackend<f32>>(config, devices, &options)
        }
        #[cfg(any(feature = "cuda", feature = "wgpu"))]
        ComputePrecision::Half => {
            info!("Using float16");
            launch::<TrainingBackend<f16>>(config, devices, &options)
        }
        #[cfg(feature = "cuda")]
        ComputePrecision::BFloat => {
            info!("Using bfloat16");
            launch::<TrainingBackend<bf16>>(config, devices, &options)
        }
        #[allow(unreachable_patterns)]
        other => bail!(
            "compute precision {other} is not available in this build; \
             rebuild with a GPU backend feature"
        ),
    }
    .context("training run failed")?;

    if let LaunchOutcome::Finished(summary) = &outcome {
        info!(
            "Trained {} epochs ({} steps), final metrics: {:?}",
            summary.epochs, summary.global_step, summary.metrics
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(None, "/usr/lib/x86_64-linux-gnu" ; "unset")]
    #[test_case(Some(""), "/usr/lib/x86_64-linux-gnu" ; "empty")]
    #[test_case(Some("/opt/cuda/lib64"), "/usr/lib/x86_64-linux-gnu:/opt/cuda/lib64" ; "existing")]
    fn test_prepend_library_path(current: Option<&str>, expected: &str) {
        assert_eq!(prepend_library_path(SYSTEM_LIBRARY_DIR, current), expected);
    }

    #[test]
    fn test_parse_all_arguments() {
        let args = Args::try_parse_from([
            "kiln",
            "--config",
            "run.yaml",
            "--model_path",
            "base",
            "--resume",
            "out/checkpoint",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("run.yaml"));
        let options = args.launch_options();
        assert_eq!(options.model_path, Some(PathBuf::from("base")));
        assert_eq!(options.resume, Some(PathBuf::from("out/checkpoint")));
        assert!(options.dry_run);
    }

    #[test]
    fn test_config_is_required() {
        assert!(Args::try_parse_from(["kiln", "--model_path", "base"]).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let args = Args::try_parse_from(["kiln", "--config", "/nonexistent/run.yaml"]).unwrap();
        let err = run(&args).unwrap_err();
        assert!(err.to_string().contains("failed to load"));
    }
}

//! Metric loggers.
//!
//! `CsvLogger` is the default and writes `logs/metrics.csv` under the root
//! directory. `ProjectLogger` groups runs by project name and writes JSON
//! lines under `runs/<project>/<run>/`.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use kiln_config::RunConfig;
use serde_json::json;
use tracing::warn;

use crate::TrainError;

pub type SharedLogger = Arc<dyn MetricLogger>;

pub trait MetricLogger: Send + Sync {
    fn name(&self) -> &str;

    fn log_metrics(&self, step: usize, metrics: &[(&str, f64)]);

    fn log_images(&self, _step: usize, _key: &str, _paths: &[PathBuf]) {}

    fn log_hyperparams(&self, _config: &RunConfig) {}

    fn flush(&self) {}
}

fn open_append(path: &Path) -> Result<BufWriter<File>, TrainError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| TrainError::io(path, e))?;
    Ok(BufWriter::new(file))
}

/// Long-format CSV: one `step,name,value` row per metric.
pub struct CsvLogger {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CsvLogger {
    pub fn new(root_dir: &Path) -> Result<Self, TrainError> {
        let path = root_dir.join("logs").join("metrics.csv");
        let fresh = !path.exists();
        let mut writer = open_append(&path)?;
        if fresh {
            writeln!(writer, "step,name,value").map_err(|e| TrainError::io(&path, e))?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricLogger for CsvLogger {
    fn name(&self) -> &str {
        "csv"
    }

    fn log_metrics(&self, step: usize, metrics: &[(&str, f64)]) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        for (name, value) in metrics {
            if let Err(e) = writeln!(writer, "{step},{name},{value}") {
                warn!("Failed to write {}: {e}", self.path.display());
                return;
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut writer) = self.writer.lock()
            && let Err(e) = writer.flush()
        {
            warn!("Failed to flush {}: {e}", self.path.display());
        }
    }
}

impl Drop for CsvLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Run logger grouped by project: `runs/<project>/<run>/`.
pub struct ProjectLogger {
    project: String,
    run_dir: PathBuf,
    metrics: Mutex<BufWriter<File>>,
    media: Mutex<BufWriter<File>>,
}

impl ProjectLogger {
    /// `run_name` defaults to the local start time.
    pub fn new(root_dir: &Path, project: &str, run_name: Option<&str>) -> Result<Self, TrainError> {
        let run = run_name.map_or_else(
            || chrono::Local::now().format("%Y%m%d-%H%M%S").to_string(),
            str::to_string,
        );
        let run_dir = root_dir.join("runs").join(project).join(run);
        let metrics = open_append(&run_dir.join("metrics.jsonl"))?;
        let media = open_append(&run_dir.join("media.jsonl"))?;
        Ok(Self {
            project: project.to_string(),
            run_dir,
            metrics: Mutex::new(metrics),
            media: Mutex::new(media),
        })
    }

    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn append(&self, sink: &Mutex<BufWriter<File>>, line: &serde_json::Value) {
        let Ok(mut writer) = sink.lock() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}") {
            warn!("Failed to write run log in {}: {e}", self.run_dir.display());
        }
    }
}

impl MetricLogger for ProjectLogger {
    fn name(&self) -> &str {
        &self.project
    }

    fn log_metrics(&self, step: usize, metrics: &[(&str, f64)]) {
        let values: serde_json::Map<_, _> = metrics
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect();
        let line = json!({
            "step": step,
            "timestamp": chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "metrics": values,
        });
        self.append(&self.metrics, &line);
    }

    fn log_images(&self, step: usize, key: &str, paths: &[PathBuf]) {
        let line = json!({
            "step": step,
            "key": key,
            "images": paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        });
        self.append(&self.media, &line);
    }

    fn log_hyperparams(&self, config: &RunConfig) {
        if let Err(e) = config.save(self.run_dir.join("config.yaml")) {
            warn!("Failed to store run config: {e}");
        }
    }

    fn flush(&self) {
        for sink in [&self.metrics, &self.media] {
            if let Ok(mut writer) = sink.lock() {
                let _ = writer.flush();
            }
        }
    }
}

impl Drop for ProjectLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

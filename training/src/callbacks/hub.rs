//! Model hub upload.
//!
//! Files are committed inline (base64) through the hub's NDJSON commit
//! endpoint, which suits checkpoints of small models.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use burn::tensor::backend::AutodiffBackend;
use kiln_config::MonitorSection;
use kiln_core::Denoiser;
use serde_json::json;
use tracing::{info, warn};

use super::{Callback, TrainContext};
use crate::{SavedCheckpoint, TrainError};

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Remote model repository operations.
pub trait HubClient: Send + Sync {
    fn ensure_repo(&self, repo: &str) -> Result<(), HubError>;

    /// Commit `files` as `(path in repo, local file)` pairs.
    fn upload(&self, repo: &str, files: &[(String, PathBuf)], message: &str) -> Result<(), HubError>;
}

pub struct HfHubClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    token: Option<String>,
}

impl HfHubClient {
    /// Endpoint comes from `HF_ENDPOINT` when set.
    pub fn new(token: Option<String>) -> Result<Self, HubError> {
        let endpoint = std::env::var("HF_ENDPOINT")
            .ok()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn post(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let request = self.http.post(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check(response: reqwest::blocking::Response) -> Result<(), HubError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(HubError::Status {
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }
}

impl HubClient for HfHubClient {
    fn ensure_repo(&self, repo: &str) -> Result<(), HubError> {
        let (organization, name) = match repo.split_once('/') {
            Some((org, name)) => (Some(org), name),
            None => (None, repo),
        };
        let mut body = json!({ "name": name, "type": "model", "private": true });
        if let Some(org) = organization {
            body["organization"] = json!(org);
        }
        let response = self
            .post(&format!("{}/api/repos/create", self.endpoint))
            .json(&body)
            .send()?;
        // 409: repository already exists
        if response.status().as_u16() == 409 {
            return Ok(());
        }
        Self::check(response)
    }

    fn upload(&self, repo: &str, files: &[(String, PathBuf)], message: &str) -> Result<(), HubError> {
        let mut lines = vec![
            json!({ "key": "header", "value": { "summary": message, "description": "" } })
                .to_string(),
        ];
        for (remote, local) in files {
            let bytes = std::fs::read(local).map_err(|source| HubError::Io {
                path: local.clone(),
                source,
            })?;
            lines.push(
                json!({
                    "key": "file",
                    "value": { "content": STANDARD.encode(bytes), "path": remote, "encoding": "base64" }
                })
                .to_string(),
            );
        }

        let response = self
            .post(&format!("{}/api/models/{repo}/commit/main", self.endpoint))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(lines.join("\n"))
            .send()?;
        Self::check(response)
    }
}

/// Pushes checkpoints and the final model to a hub repository.
///
/// Upload failures are logged and never stop training.
pub struct HubCallback {
    repo: String,
    client: Arc<dyn HubClient>,
    store_checkpoints: bool,
    every_n_epochs: usize,
    active: bool,
}

impl HubCallback {
    #[must_use]
    pub fn new(repo: &str, client: Arc<dyn HubClient>, monitor: &MonitorSection) -> Self {
        Self {
            repo: repo.to_string(),
            client,
            store_checkpoints: monitor.store_checkpoints,
            every_n_epochs: monitor.hub_every_n_epochs.max(1),
            active: true,
        }
    }

    fn push(&self, files: &[(String, PathBuf)], message: &str) {
        match self.client.upload(&self.repo, files, message) {
            Ok(()) => info!("Uploaded {} files to {}", files.len(), self.repo),
            Err(e) => warn!("Hub upload to {} failed: {e}", self.repo),
        }
    }
}

fn dir_files(dir: &Path, prefix: &str) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter_map(|p| {
            let name = p.file_name()?.to_string_lossy().to_string();
            Some((format!("{prefix}{name}"), p))
        })
        .collect();
    files.sort();
    files
}

impl<B: AutodiffBackend> Callback<B> for HubCallback {
    fn name(&self) -> &'static str {
        "hub"
    }

    fn on_train_start(&mut self, _ctx: &TrainContext<'_>) -> Result<(), TrainError> {
        if let Err(e) = self.client.ensure_repo(&self.repo) {
            warn!("Cannot prepare hub repository {}: {e}; uploads disabled", self.repo);
            self.active = false;
        }
        Ok(())
    }

    fn on_checkpoint_saved(
        &mut self,
        saved: &SavedCheckpoint,
        _ctx: &TrainContext<'_>,
    ) -> Result<(), TrainError> {
        if !self.active
            || !self.store_checkpoints
            || saved.tag == super::checkpoint::LAST_TAG
            || saved.epoch % self.every_n_epochs != 0
        {
            return Ok(());
        }
        let files: Vec<_> = saved
            .files
            .iter()
            .filter_map(|p| {
                let name = p.file_name()?.to_string_lossy().to_string();
                Some((format!("checkpoints/{name}"), p.clone()))
            })
            .collect();
        self.push(
            &files,
            &format!("Checkpoint at step {}", saved.global_step),
        );
        Ok(())
    }

    fn on_train_end(
        &mut self,
        _model: &Denoiser<B>,
        final_dir: &Path,
        ctx: &TrainContext<'_>,
    ) -> Result<(), TrainError> {
        if !self.active {
            return Ok(());
        }
        let mut files = dir_files(final_dir, "");
        let config = ctx.root_dir.join("config.yaml");
        if config.is_file() {
            files.push(("config.yaml".to_string(), config));
        }
        self.push(
            &files,
            &format!("Final model after {} steps", ctx.global_step),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use burn::backend::{Autodiff, NdArray};
    use kiln_core::{DenoiserConfig, TokenVocab};

    use super::*;

    type B = Autodiff<NdArray<f32>>;

    #[derive(Default)]
    struct MockHub {
        fail_create: bool,
        uploads: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl HubClient for MockHub {
        fn ensure_repo(&self, _repo: &str) -> Result<(), HubError> {
            if self.fail_create {
                return Err(HubError::Status {
                    status: 401,
                    body: "unauthorized".into(),
                });
            }
            Ok(())
        }

        fn upload(&self, repo: &str, files: &[(String, PathBuf)], _message: &str) -> Result<(), HubError> {
            self.uploads.lock().unwrap().push((
                repo.to_string(),
                files.iter().map(|(remote, _)| remote.clone()).collect(),
            ));
            Ok(())
        }
    }

    fn monitor(every: usize) -> MonitorSection {
        MonitorSection {
            hub_every_n_epochs: every,
            ..Default::default()
        }
    }

    fn saved(tag: &str, epoch: usize) -> SavedCheckpoint {
        SavedCheckpoint {
            tag: tag.to_string(),
            epoch,
            global_step: epoch * 10,
            files: vec![PathBuf::from(format!("/ckpt/model-{tag}.mpk"))],
        }
    }

    fn with_ctx(root: &Path, f: impl FnOnce(&TrainContext<'_>)) {
        let metrics = BTreeMap::new();
        let vocab = TokenVocab::default();
        f(&TrainContext {
            epoch: 0,
            global_step: 20,
            lr: 0.0,
            metrics: &metrics,
            vocab: &vocab,
            root_dir: root,
        });
    }

    #[test]
    fn test_checkpoint_uploads_follow_epoch_cadence() {
        let hub = Arc::new(MockHub::default());
        let mut cb = HubCallback::new("user/model", hub.clone(), &monitor(2));
        with_ctx(Path::new("."), |ctx| {
            Callback::<B>::on_train_start(&mut cb, ctx).unwrap();
            for (tag, epoch) in [("10", 1), ("20", 2), ("last", 2)] {
                Callback::<B>::on_checkpoint_saved(&mut cb, &saved(tag, epoch), ctx).unwrap();
            }
        });
        let uploads = hub.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "user/model");
        assert_eq!(uploads[0].1, vec!["checkpoints/model-20.mpk"]);
    }

    #[test]
    fn test_failed_repo_creation_disables_uploads() {
        let hub = Arc::new(MockHub {
            fail_create: true,
            ..Default::default()
        });
        let mut cb = HubCallback::new("model", hub.clone(), &monitor(1));
        with_ctx(Path::new("."), |ctx| {
            Callback::<B>::on_train_start(&mut cb, ctx).unwrap();
            Callback::<B>::on_checkpoint_saved(&mut cb, &saved("1", 1), ctx).unwrap();
        });
        assert!(hub.uploads.lock().unwrap().is_empty());
    }

    #[test]
    fn test_final_upload_includes_model_dir_and_config() {
        let root = tempfile::tempdir().unwrap();
        let final_dir = root.path().join("model");
        std::fs::create_dir_all(&final_dir).unwrap();
        std::fs::write(final_dir.join("model.json"), "{}").unwrap();
        std::fs::write(final_dir.join("tokens.json"), "[]").unwrap();
        std::fs::write(root.path().join("config.yaml"), "a: 1").unwrap();

        let hub = Arc::new(MockHub::default());
        let mut cb = HubCallback::new("user/model", hub.clone(), &monitor(1));
        let model = DenoiserConfig::new(1)
            .with_base_channels(4)
            .with_time_embed_dim(4)
            .with_num_blocks(1)
            .with_norm_groups(2)
            .init::<B>(&Default::default());
        with_ctx(root.path(), |ctx| {
            Callback::<B>::on_train_end(&mut cb, &model, &final_dir, ctx).unwrap();
        });
        let uploads = hub.uploads.lock().unwrap();
        assert_eq!(
            uploads[0].1,
            vec!["model.json", "tokens.json", "config.yaml"]
        );
    }
}

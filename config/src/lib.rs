//! Run configuration for the kiln training launcher.

mod error;
mod train;
mod types;

pub use error::ConfigError;
pub use train::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use test_case::test_case;

    use super::*;

    const MINIMAL: &str = r"
trainer:
  seed: 1234
dataset:
  img_path: ./images
";

    fn with_precision(trainer: &str, lightning: &str) -> RunConfig {
        RunConfig::from_yaml_str(&format!(
            r"
trainer:
  seed: 1
  precision: {trainer}
lightning:
  precision: {lightning}
dataset:
  img_path: ./images
"
        ))
        .unwrap()
    }

    #[test]
    fn test_minimal_defaults() {
        let config = RunConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.trainer.seed, 1234);
        assert_eq!(config.trainer.precision, WeightPrecision::Fp32);
        assert_eq!(config.lightning.precision, ComputePrecision::Full);
        assert_eq!(config.lightning.accelerator, Accelerator::Auto);
        assert!(config.lightning.replace_sampler_ddp);
        assert_eq!(config.lightning.epoch_limit(), DEFAULT_MAX_EPOCHS);
        assert_eq!(config.checkpoint.save_top_k, 1);
        assert!(config.monitor.huggingface_repo.is_empty());
        assert!(config.custom_embeddings.is_none());
        assert!(config.sampling_enabled().is_none());
        assert!(!config.tune_requested());
        assert_eq!(config.checkpoint_dir(), PathBuf::from("./checkpoint"));
        config.validate().unwrap();
    }

    #[test_case("fp16", "16" => true ; "pure half is rejected")]
    #[test_case("fp16", "32" => false ; "half weights full compute")]
    #[test_case("fp32", "16" => false ; "mixed precision")]
    #[test_case("bf16", "16" => false ; "bf16 weights half compute")]
    #[test_case("fp16", "bf16" => false ; "half weights bf16 compute")]
    #[test_case("fp16", "\"16\"" => true ; "string spelling is rejected too")]
    fn test_precision_guard(trainer: &str, lightning: &str) -> bool {
        matches!(
            with_precision(trainer, lightning).validate(),
            Err(ConfigError::PureHalfPrecision)
        )
    }

    #[test]
    fn test_precision_guard_message() {
        let err = with_precision("fp16", "16").validate().unwrap_err();
        assert_eq!(err.to_string(), PURE_FP16_MESSAGE);
    }

    #[test]
    fn test_unknown_lightning_key_rejected() {
        let err = RunConfig::from_yaml_str(
            r"
trainer:
  seed: 1
lightning:
  max_epoch: 3
dataset:
  img_path: ./images
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(msg) if msg.contains("max_epoch")));
    }

    #[test]
    fn test_model_path_resolution() {
        let mut config = RunConfig::from_yaml_str(MINIMAL).unwrap();
        assert!(matches!(
            config.resolve_model_path(None),
            Err(ConfigError::MissingModelPath)
        ));

        config.trainer.model_path = Some(PathBuf::from("/models/base"));
        assert_eq!(
            config.resolve_model_path(None).unwrap(),
            PathBuf::from("/models/base")
        );
        assert_eq!(
            config
                .resolve_model_path(Some(Path::new("/tmp/model")))
                .unwrap(),
            PathBuf::from("/tmp/model")
        );
    }

    #[test]
    fn test_full_document() {
        let config = RunConfig::from_yaml_str(
            r#"
trainer:
  seed: 42
  model_path: /tmp/model
  precision: bf16
  use_hivemind: false
  batch_size: 4
lightning:
  accelerator: gpu
  devices: 2
  precision: 16
  max_epochs: 10
  auto_lr_find: true
  default_root_dir: /tmp/run
monitor:
  huggingface_repo: "user/repo"
  hf_auth_token: "hf_xxx"
  wandb_id: "my-project"
checkpoint:
  monitor: train_loss
  mode: min
  save_top_k: 3
  every_n_epochs: 2
custom_embeddings:
  enabled: true
  tokens: ["<cat-toy>"]
  init_from: cat
sampling:
  enabled: true
  every_n_steps: 500
  prompts: ["cat", "<cat-toy>"]
dataset:
  img_path: /data/images
  resolution: 64
optimizer:
  lr: 2.0e-4
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.trainer.precision, WeightPrecision::Bf16);
        assert_eq!(config.lightning.precision, ComputePrecision::Half);
        assert_eq!(config.lightning.accelerator, Accelerator::Gpu);
        assert!(config.tune_requested());
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/tmp/run/checkpoint"));
        assert_eq!(config.checkpoint.mode, CheckpointMode::Min);
        assert_eq!(
            config.custom_embeddings_enabled().unwrap().tokens,
            vec!["<cat-toy>"]
        );
        assert_eq!(config.sampling_enabled().unwrap().prompts.len(), 2);
        assert_eq!(config.monitor.auth_token().as_deref(), Some("hf_xxx"));
        assert!((config.optimizer.lr - 2.0e-4).abs() < 1e-12);
    }

    #[test]
    fn test_custom_embeddings_without_tokens_rejected() {
        let mut config = RunConfig::from_yaml_str(MINIMAL).unwrap();
        config.custom_embeddings = Some(CustomEmbeddingsSection {
            enabled: true,
            tokens: Vec::new(),
            init_from: None,
            freeze_model: true,
            save_every_n_steps: None,
            output_dir: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // Disabled sections are not checked.
        config.custom_embeddings.as_mut().unwrap().enabled = false;
        config.validate().unwrap();
    }

    #[test_case(|m: &mut ModelArch| m.norm_groups = 0, "model.norm_groups" ; "zero norm groups")]
    #[test_case(|m: &mut ModelArch| m.base_channels = 0, "model.base_channels" ; "zero base channels")]
    #[test_case(|m: &mut ModelArch| m.time_embed_dim = 0, "model.time_embed_dim" ; "zero time embedding")]
    #[test_case(|m: &mut ModelArch| m.train_timesteps = 0, "model.train_timesteps" ; "zero timesteps")]
    #[test_case(|m: &mut ModelArch| m.norm_groups = 7, "divisible" ; "groups do not divide channels")]
    fn test_invalid_model_arch(edit: fn(&mut ModelArch), key: &str) {
        let mut config = RunConfig::from_yaml_str(MINIMAL).unwrap();
        edit(&mut config.model);
        match config.validate() {
            Err(ConfigError::Invalid(message)) => assert!(message.contains(key), "{message}"),
            other => panic!("expected an invalid-config error, got {other:?}"),
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");
        let config = RunConfig::from_yaml_str(MINIMAL).unwrap();
        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_epoch_limit_with_max_steps() {
        let lightning = LightningSection {
            max_steps: Some(100),
            ..Default::default()
        };
        assert_eq!(lightning.epoch_limit(), usize::MAX);
    }

    #[test]
    fn test_checkpoint_mode_ordering() {
        assert!(CheckpointMode::Min.is_better(0.1, 0.2));
        assert!(!CheckpointMode::Min.is_better(0.2, 0.2));
        assert!(CheckpointMode::Max.is_better(0.3, 0.2));
    }
}

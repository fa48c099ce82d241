use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{
    BlendMode, InferenceConfig, TtaConfig, DEFAULT_BATCH_SIZE, DEFAULT_OVERLAP, DEFAULT_PATCH_SIZE,
    DEFAULT_SIGMA_SCALE,
};
use crate::error::InferenceError;
use crate::model::ModelConfig;
use crate::preprocess::PreprocessConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "NEURONFLOW_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceSettings,
    pub tta: TtaConfig,
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceSettings {
    pub patch_size: [usize; 2],
    pub overlap: f32,
    pub batch_size: usize,
    pub blend_mode: BlendMode,
    pub sigma_scale: f32,
    pub pipelined: bool,
}

/// Activation applied to raw network output before decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    None,
    Sigmoid,
    #[default]
    Softmax,
}

/// Spatial layout of written outputs. `Wh` swaps rows and columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisOrder {
    #[default]
    Hw,
    Wh,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub activation: Activation,
    pub axis_order: AxisOrder,
    /// Binary masks threshold the foreground probability when set, and use
    /// `argmax != 0` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            patch_size: [DEFAULT_PATCH_SIZE.0, DEFAULT_PATCH_SIZE.1],
            overlap: DEFAULT_OVERLAP,
            batch_size: DEFAULT_BATCH_SIZE,
            blend_mode: BlendMode::default(),
            sigma_scale: DEFAULT_SIGMA_SCALE,
            pipelined: true,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validated engine configuration built from `[inference]` and `[tta]`.
    pub fn to_inference_config(&self) -> Result<InferenceConfig, InferenceError> {
        let [patch_h, patch_w] = self.inference.patch_size;
        let config = InferenceConfig {
            patch_size: (patch_h, patch_w),
            overlap: self.inference.overlap,
            batch_size: self.inference.batch_size,
            blend_mode: self.inference.blend_mode,
            sigma_scale: self.inference.sigma_scale,
            pipelined: self.inference.pipelined,
            tta: self.tta.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// `[model]` with its paths resolved: the model against `models_dir`,
    /// both directories against `data_dir`.
    pub fn resolved_model_config(&self, data_dir: &Path) -> ModelConfig {
        let models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        let trt_cache_dir = self
            .model
            .trt_cache_dir
            .as_deref()
            .unwrap_or(&self.paths.trt_cache_dir);

        ModelConfig {
            path: resolve_relative_to(&models_dir, &self.model.path),
            trt_cache_dir: Some(resolve_relative_to(data_dir, trt_cache_dir)),
            ..self.model.clone()
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. NEURONFLOW_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and a default config.toml unless one already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joins it to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlipAxis;
    use crate::model::InferenceBackend;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.inference.patch_size, [512, 512]);
        assert_eq!(cfg.inference.overlap, 0.5);
        assert_eq!(cfg.inference.batch_size, 32);
        assert!(cfg.tta.enabled);
        assert_eq!(cfg.model.backend, InferenceBackend::Cpu);
        assert_eq!(cfg.output.activation, Activation::Softmax);
        assert_eq!(cfg.output.axis_order, AxisOrder::Hw);
        assert_eq!(cfg.output.threshold, None);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let raw = r#"
            [inference]
            batch_size = 4

            [tta]
            flip_axes = ["width"]
            seed = 11

            [model]
            backend = "cuda"
            device_id = 1

            [output]
            activation = "sigmoid"
            axis_order = "wh"
            threshold = 0.3
        "#;
        let cfg: AppConfig = toml::from_str(raw).expect("parse partial config");

        assert_eq!(cfg.inference.batch_size, 4);
        assert_eq!(cfg.inference.patch_size, [512, 512]);
        assert_eq!(cfg.tta.flip_axes, vec![FlipAxis::Width]);
        assert_eq!(cfg.tta.seed, Some(11));
        assert_eq!(cfg.tta.noise_std, 0.001);
        assert_eq!(cfg.model.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.model.device_id, 1);
        assert_eq!(cfg.output.activation, Activation::Sigmoid);
        assert_eq!(cfg.output.axis_order, AxisOrder::Wh);
        assert_eq!(cfg.output.threshold, Some(0.3));
    }

    #[test]
    fn unknown_flip_axis_fails_to_parse() {
        let raw = "[tta]\nflip_axes = [\"depth\"]\n";
        assert!(toml::from_str::<AppConfig>(raw).is_err());
    }

    #[test]
    fn to_inference_config_validates() {
        let mut cfg = AppConfig::default();
        cfg.inference.patch_size = [256, 128];
        let engine = cfg.to_inference_config().expect("valid config");
        assert_eq!(engine.patch_size, (256, 128));
        assert_eq!(engine.tta, cfg.tta);

        cfg.inference.overlap = 1.5;
        assert!(cfg.to_inference_config().unwrap_err().is_config());
    }

    #[test]
    fn resolved_model_config_joins_relative_paths() {
        let mut cfg = AppConfig::default();
        cfg.model.path = PathBuf::from("nuclei.onnx");
        let resolved = cfg.resolved_model_config(Path::new("/data"));
        assert_eq!(resolved.path, PathBuf::from("/data/models/nuclei.onnx"));
        assert_eq!(resolved.trt_cache_dir, Some(PathBuf::from("/data/trt_cache")));

        cfg.model.path = PathBuf::from("/abs/model.onnx");
        cfg.model.trt_cache_dir = Some(PathBuf::from("/tmp/trt"));
        let resolved = cfg.resolved_model_config(Path::new("/data"));
        assert_eq!(resolved.path, PathBuf::from("/abs/model.onnx"));
        assert_eq!(resolved.trt_cache_dir, Some(PathBuf::from("/tmp/trt")));
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let loaded =
            AppConfig::load_from_path(&temp.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "  \n").expect("write empty config");
        assert_eq!(AppConfig::load_from_path(&path).expect("load"), AppConfig::default());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[inference\n").expect("write broken config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err}").contains("config.toml"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_then_default() {
        let previous = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let dir = temp.path().join("data");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&dir)).expect("load written config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[inference]\nbatch_size = 2\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }
}

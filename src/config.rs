use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IdcaeError, Result};

/// Run configuration, normally loaded from `idcae.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dev_directory: PathBuf,
    pub eval_directory: PathBuf,
    pub model_directory: PathBuf,
    #[serde(default = "default_metrics_directory")]
    pub metrics_directory: PathBuf,
    #[serde(default)]
    pub feature: FeatureParams,
    #[serde(default)]
    pub fit: FitParams,
    #[serde(default)]
    pub decoder: DecoderParams,
    #[serde(default)]
    pub model: ModelParams,
    #[serde(default)]
    pub files: FileParams,
    pub train_param: BTreeMap<String, TrainParam>,
}

/// Log-mel feature extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub n_mels: usize,
    pub frames: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub power: f32,
    /// Resample every file to this rate before analysis. `None` keeps the native rate.
    pub sample_rate: Option<u32>,
}

impl FeatureParams {
    /// Width of one stacked feature vector.
    pub fn dims(&self) -> usize {
        self.n_mels * self.frames
    }
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            n_mels: 128,
            frames: 5,
            n_fft: 1024,
            hop_length: 512,
            power: 2.0,
            sample_rate: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f64,
    pub max_files_per_id: usize,
    pub seed: u64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 512,
            validation_split: 0.1,
            max_files_per_id: 300,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderParams {
    /// Weight of the match reconstruction term; the non-match term gets `1 - alpha`.
    pub alpha: f32,
    /// Value every non-match reconstruction is pushed toward.
    pub nm_constant: f32,
    /// Epochs between learning-rate decays.
    pub lr_step: usize,
}

impl Default for DecoderParams {
    fn default() -> Self {
        Self {
            alpha: 0.75,
            nm_constant: 5.0,
            lr_step: 5,
        }
    }
}

/// Layer widths shared by the encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub hidden_dim: usize,
    pub latent_dim: usize,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            hidden_dim: 128,
            latent_dim: 16,
        }
    }
}

/// Naming of training audio: `<dir_name>/<prefix_normal>_<id>*.<ext>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileParams {
    pub dir_name: String,
    pub prefix_normal: String,
    pub ext: String,
}

impl Default for FileParams {
    fn default() -> Self {
        Self {
            dir_name: "train".to_string(),
            prefix_normal: "normal".to_string(),
            ext: "wav".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainParam {
    pub encoder: EncoderLr,
    pub decoder: DecoderLr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderLr {
    pub lr: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderLr {
    pub lr: f32,
    pub gamma: f32,
}

fn default_metrics_directory() -> PathBuf {
    PathBuf::from("runs")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        log::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.feature;
        if f.n_mels == 0 || f.frames == 0 || f.n_fft == 0 || f.hop_length == 0 {
            return Err(IdcaeError::Config(
                "feature.n_mels, frames, n_fft and hop_length must be positive".into(),
            ));
        }
        if f.power <= 0.0 {
            return Err(IdcaeError::Config("feature.power must be positive".into()));
        }
        if self.fit.epochs == 0 || self.fit.batch_size == 0 || self.fit.max_files_per_id == 0 {
            return Err(IdcaeError::Config(
                "fit.epochs, batch_size and max_files_per_id must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.fit.validation_split) {
            return Err(IdcaeError::Config(format!(
                "fit.validation_split {} outside [0, 1)",
                self.fit.validation_split
            )));
        }
        if !(0.0..=1.0).contains(&self.decoder.alpha) {
            return Err(IdcaeError::Config(format!(
                "decoder.alpha {} outside [0, 1]",
                self.decoder.alpha
            )));
        }
        if self.model.hidden_dim == 0 || self.model.latent_dim == 0 {
            return Err(IdcaeError::Config("model widths must be positive".into()));
        }
        if self.decoder.lr_step == 0 {
            return Err(IdcaeError::Config("decoder.lr_step must be positive".into()));
        }
        Ok(())
    }

    pub fn train_param(&self, machine_type: &str) -> Result<&TrainParam> {
        self.train_param
            .get(machine_type)
            .ok_or_else(|| IdcaeError::MissingTrainParam(machine_type.to_string()))
    }

    /// Root holding one directory per machine type for the selected mode.
    pub fn data_root(&self, mode: Mode) -> &Path {
        match mode {
            Mode::Development => &self.dev_directory,
            Mode::Evaluation => &self.eval_directory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Development,
    Evaluation,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
dev_directory: ./dev_data
eval_directory: ./eval_data
model_directory: ./model
feature:
  n_mels: 64
  frames: 5
fit:
  epochs: 3
  batch_size: 16
train_param:
  fan:
    encoder: { lr: 0.001 }
    decoder: { lr: 0.01, gamma: 0.95 }
"#;

    #[test]
    fn parses_with_defaults() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.feature.n_mels, 64);
        assert_eq!(config.feature.n_fft, 1024);
        assert_eq!(config.feature.dims(), 320);
        assert_eq!(config.fit.max_files_per_id, 300);
        assert_eq!(config.decoder.alpha, 0.75);
        assert_eq!(config.decoder.nm_constant, 5.0);
        assert_eq!(config.files.prefix_normal, "normal");
        assert_eq!(config.metrics_directory, PathBuf::from("runs"));
        assert_eq!(config.train_param("fan").unwrap().decoder.gamma, 0.95);
    }

    #[test]
    fn missing_machine_type_is_a_configuration_error() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let err = config.train_param("valve").unwrap_err();
        assert!(matches!(err, IdcaeError::MissingTrainParam(ref m) if m == "valve"));
        assert!(err.is_configuration());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.fit.validation_split = 1.0;
        assert!(config.validate().is_err());

        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.decoder.alpha = 1.5;
        assert!(config.validate().is_err());

        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.fit.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn shipped_config_is_valid() {
        let config: Config = serde_yaml::from_str(include_str!("../idcae.yaml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.feature.dims(), 640);
        assert!(config.train_param("ToyCar").is_ok());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idcae.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.data_root(Mode::Evaluation), Path::new("./eval_data"));
    }
}

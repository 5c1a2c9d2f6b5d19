use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdcaeError>;

#[derive(Error, Debug)]
pub enum IdcaeError {
    #[error("no audio files matched {pattern}")]
    NoAudioFiles { pattern: String },
    #[error("{files} file(s) produced no feature rows; each needs at least {frames} mel frames")]
    EmptyFeatures { files: usize, frames: usize },
    #[error("{found} machine id(s) found; at least 2 are needed to draw non-match labels")]
    TooFewIdentities { found: usize },
    #[error("class label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },
    #[error("no train_param entry for machine type {0:?}")]
    MissingTrainParam(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("audio error: {0}")]
    Audio(String),
    #[error("plot error: {0}")]
    Plot(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV decode error: {0}")]
    Wav(#[from] hound::Error),
    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("npz read error: {0}")]
    NpzRead(#[from] ndarray_npy::ReadNpzError),
    #[error("npz write error: {0}")]
    NpzWrite(#[from] ndarray_npy::WriteNpzError),
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl IdcaeError {
    /// Errors that invalidate one machine type but leave the rest of the run usable.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            IdcaeError::NoAudioFiles { .. }
                | IdcaeError::EmptyFeatures { .. }
                | IdcaeError::TooFewIdentities { .. }
                | IdcaeError::LabelOutOfRange { .. }
                | IdcaeError::MissingTrainParam(_)
                | IdcaeError::Config(_)
        )
    }
}

//! ID-conditioned autoencoder training for machine-sound anomaly detection.
//!
//! Each machine type is trained in two stages: an encoder that classifies
//! which machine id produced a log-mel feature vector, then a FiLM-conditioned
//! decoder on the frozen encoder's latents that reconstructs the input under
//! the true id and a fixed constant under a wrong id.

pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod pipeline;
pub mod plot;
pub mod train;

pub use config::{Config, Mode};
pub use dataset::Dataset;
pub use error::{IdcaeError, Result};
pub use model::{Decoder, Encoder};
pub use pipeline::{machine_types, process_machine_type, run, RunPaths, TypeOutcome};

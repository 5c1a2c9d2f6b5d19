//! The two training stages. The decoder stage borrows a finished encoder and
//! never updates it.

mod decoder;
mod encoder;

pub use decoder::{composite_loss, DecoderHistory, DecoderLoss, DecoderTrainer};
pub use encoder::{load_or_train_encoder, EncoderStage, EncoderTrainer};

use indicatif::{ProgressBar, ProgressStyle};

/// SGD weight decay used by both stages.
pub const WEIGHT_DECAY: f32 = 1e-7;

/// Per-epoch train/validation loss curve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub train_loss: Vec<f32>,
    pub val_loss: Vec<f32>,
}

impl History {
    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

/// Mean of per-batch losses; NaN when there were no batches.
pub(crate) fn batch_mean(sum: f32, batches: usize) -> f32 {
    if batches == 0 {
        f32::NAN
    } else {
        sum / batches as f32
    }
}

pub(crate) fn progress_bar(len: usize, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {bar:40} {pos}/{len} ETA {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(msg.to_string());
    pb
}

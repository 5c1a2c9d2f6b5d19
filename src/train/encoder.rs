use std::path::Path;

use rand::Rng;

use super::{batch_mean, progress_bar, History, WEIGHT_DECAY};
use crate::config::ModelParams;
use crate::error::{IdcaeError, Result};
use crate::loader::{Batch, Loaders};
use crate::metrics::MetricsSink;
use crate::model::Encoder;
use crate::nn::{cross_entropy_sum, Parameterized, Sgd};

/// How the encoder of a run came to be.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderStage {
    /// Read from an existing weight file; no training happened.
    Loaded,
    /// Trained from scratch this run and written to disk.
    Trained(History),
}

/// Supervised id classification on the match label.
pub struct EncoderTrainer {
    optimizer: Sgd,
    epochs: usize,
}

impl EncoderTrainer {
    pub fn new(lr: f32, epochs: usize) -> Self {
        Self {
            optimizer: Sgd::new(lr, WEIGHT_DECAY),
            epochs,
        }
    }

    /// Cross-entropy of one batch, summed over its rows. No update.
    pub fn batch_loss(&self, encoder: &Encoder, batch: &Batch) -> Result<f32> {
        let pass = encoder.forward(&batch.features);
        let (loss, _) = cross_entropy_sum(&pass.logits, &batch.match_classes())?;
        Ok(loss)
    }

    pub fn train_step(&mut self, encoder: &mut Encoder, batch: &Batch) -> Result<f32> {
        encoder.zero_grad();
        let pass = encoder.forward(&batch.features);
        let (loss, grad) = cross_entropy_sum(&pass.logits, &batch.match_classes())?;
        encoder.backward(&batch.features, &pass, &grad);
        self.optimizer.step(encoder);
        Ok(loss)
    }

    /// Epoch loss is the mean over batches of each batch's summed loss, so it
    /// scales with the batch size.
    pub fn fit<R: Rng + ?Sized>(
        &mut self,
        encoder: &mut Encoder,
        loaders: &Loaders,
        rng: &mut R,
        metrics: &mut dyn MetricsSink,
    ) -> Result<History> {
        let mut history = History::default();
        for epoch in 1..=self.epochs {
            log::info!("Epoch: {epoch}");

            let pb = progress_bar(loaders.train.num_batches(), "encoder train");
            let mut train_loss = 0.0;
            for batch in loaders.train.batches(rng) {
                train_loss += self.train_step(encoder, &batch)?;
                pb.inc(1);
            }
            pb.finish_and_clear();
            let train_loss = batch_mean(train_loss, loaders.train.num_batches());

            let pb = progress_bar(loaders.validation.num_batches(), "encoder validation");
            let mut val_loss = 0.0;
            for batch in loaders.validation.batches(rng) {
                val_loss += self.batch_loss(encoder, &batch)?;
                pb.inc(1);
            }
            pb.finish_and_clear();
            let val_loss = batch_mean(val_loss, loaders.validation.num_batches());

            history.train_loss.push(train_loss);
            history.val_loss.push(val_loss);
            metrics.add_scalar("en_train/loss", train_loss, epoch)?;
            if val_loss.is_finite() {
                metrics.add_scalar("en_val/loss", val_loss, epoch)?;
                metrics.add_scalars(
                    "en_comp/loss",
                    &[("train", train_loss), ("validation", val_loss)],
                    epoch,
                )?;
            } else {
                metrics.add_scalars("en_comp/loss", &[("train", train_loss)], epoch)?;
            }
        }
        metrics.flush()?;
        Ok(history)
    }
}

/// Load the encoder at `path` if it exists, otherwise train a fresh one and
/// write it there. The file is written only on the training path.
#[allow(clippy::too_many_arguments)]
pub fn load_or_train_encoder<R: Rng + ?Sized>(
    path: &Path,
    input_dim: usize,
    classes: usize,
    params: ModelParams,
    trainer: &mut EncoderTrainer,
    loaders: &Loaders,
    rng: &mut R,
    metrics: &mut dyn MetricsSink,
) -> Result<(Encoder, EncoderStage)> {
    if path.exists() {
        log::info!("Encoder exists... loading {}", path.display());
        let encoder = Encoder::load(path)?;
        if encoder.input_dim() != input_dim || encoder.classes() != classes {
            return Err(IdcaeError::Model(format!(
                "{} expects {} inputs / {} ids, dataset has {} / {}",
                path.display(),
                encoder.input_dim(),
                encoder.classes(),
                input_dim,
                classes
            )));
        }
        return Ok((encoder, EncoderStage::Loaded));
    }

    log::info!("Start Encoder training...");
    let mut encoder = Encoder::new(input_dim, classes, params, rng);
    let history = trainer.fit(&mut encoder, loaders, rng, metrics)?;
    encoder.save(path)?;
    log::info!("saved encoder -> {}", path.display());
    Ok((encoder, EncoderStage::Trained(history)))
}

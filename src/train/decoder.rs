use ndarray::{s, Array2};
use rand::Rng;

use super::{batch_mean, progress_bar, History, WEIGHT_DECAY};
use crate::config::DecoderParams;
use crate::error::{IdcaeError, Result};
use crate::loader::{Batch, Loaders};
use crate::metrics::MetricsSink;
use crate::model::{bipolar, Decoder, DecoderPass, Encoder};
use crate::nn::{mse, mse_grad, Parameterized, Sgd, StepLr};

/// Loss terms of one decoder batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderLoss {
    /// `alpha * match_loss + (1 - alpha) * non_match_loss`.
    pub total: f32,
    pub match_loss: f32,
    pub non_match_loss: f32,
    /// Non-match output against the input; reported only, never optimized.
    pub bad_loss: f32,
}

pub fn composite_loss(
    alpha: f32,
    input: &Array2<f32>,
    match_output: &Array2<f32>,
    non_match_output: &Array2<f32>,
    non_match_target: &Array2<f32>,
) -> Result<DecoderLoss> {
    let match_loss = mse(match_output, input)?;
    let non_match_loss = mse(non_match_output, non_match_target)?;
    let bad_loss = mse(non_match_output, input)?;
    Ok(DecoderLoss {
        total: alpha * match_loss + (1.0 - alpha) * non_match_loss,
        match_loss,
        non_match_loss,
        bad_loss,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderHistory {
    pub loss: History,
    pub match_loss: Vec<f32>,
    pub non_match_loss: Vec<f32>,
    pub bad_loss: Vec<f32>,
    pub train_bad_loss: Vec<f32>,
}

/// Trains a decoder on latents from a frozen encoder.
pub struct DecoderTrainer<'e> {
    encoder: &'e Encoder,
    alpha: f32,
    non_match_target: Array2<f32>,
    optimizer: Sgd,
    scheduler: StepLr,
    epochs: usize,
}

impl<'e> DecoderTrainer<'e> {
    pub fn new(
        encoder: &'e Encoder,
        params: &DecoderParams,
        batch_size: usize,
        lr: f32,
        gamma: f32,
        epochs: usize,
    ) -> Self {
        Self {
            encoder,
            alpha: params.alpha,
            non_match_target: Array2::from_elem(
                (batch_size, encoder.input_dim()),
                params.nm_constant,
            ),
            optimizer: Sgd::new(lr, WEIGHT_DECAY),
            scheduler: StepLr::new(params.lr_step, gamma),
            epochs,
        }
    }

    pub fn lr(&self) -> f32 {
        self.optimizer.lr
    }

    /// The constant target cut down to `rows`, for short tail batches.
    pub fn non_match_target(&self, rows: usize) -> Result<Array2<f32>> {
        if rows > self.non_match_target.nrows() {
            return Err(IdcaeError::Model(format!(
                "batch of {rows} rows exceeds the configured batch size {}",
                self.non_match_target.nrows()
            )));
        }
        Ok(self.non_match_target.slice(s![..rows, ..]).to_owned())
    }

    fn forward(
        &self,
        decoder: &Decoder,
        batch: &Batch,
    ) -> Result<(DecoderPass, DecoderPass, Array2<f32>, DecoderLoss)> {
        let latent = self.encoder.encode(&batch.features);
        let (matched, non_matched) = decoder.reconstruct(
            &latent,
            &bipolar(&batch.matches),
            &bipolar(&batch.non_matches),
        );
        let target = self.non_match_target(batch.len())?;
        let loss = composite_loss(
            self.alpha,
            &batch.features,
            &matched.output,
            &non_matched.output,
            &target,
        )?;
        Ok((matched, non_matched, target, loss))
    }

    /// Loss terms without touching the decoder's parameters.
    pub fn evaluate(&self, decoder: &Decoder, batch: &Batch) -> Result<DecoderLoss> {
        let (_, _, _, loss) = self.forward(decoder, batch)?;
        Ok(loss)
    }

    pub fn train_step(&mut self, decoder: &mut Decoder, batch: &Batch) -> Result<DecoderLoss> {
        decoder.zero_grad();
        let (matched, non_matched, target, loss) = self.forward(decoder, batch)?;
        let grad_match = mse_grad(&matched.output, &batch.features)? * self.alpha;
        let grad_non_match = mse_grad(&non_matched.output, &target)? * (1.0 - self.alpha);
        decoder.backward(&matched, &grad_match);
        decoder.backward(&non_matched, &grad_non_match);
        self.optimizer.step(decoder);
        Ok(loss)
    }

    pub fn fit<R: Rng + ?Sized>(
        &mut self,
        decoder: &mut Decoder,
        loaders: &Loaders,
        rng: &mut R,
        metrics: &mut dyn MetricsSink,
    ) -> Result<DecoderHistory> {
        let mut history = DecoderHistory::default();
        for epoch in 1..=self.epochs {
            log::info!("Epoch: {epoch} (lr {:.3e})", self.optimizer.lr);

            let pb = progress_bar(loaders.train.num_batches(), "decoder train");
            let (mut train_loss, mut train_bad) = (0.0, 0.0);
            for batch in loaders.train.batches(rng) {
                let loss = self.train_step(decoder, &batch)?;
                train_loss += loss.total;
                train_bad += loss.bad_loss;
                pb.inc(1);
            }
            pb.finish_and_clear();
            let n = loaders.train.num_batches();
            let (train_loss, train_bad) = (batch_mean(train_loss, n), batch_mean(train_bad, n));

            let pb = progress_bar(loaders.validation.num_batches(), "decoder validation");
            let (mut val_loss, mut ml, mut nml, mut bl) = (0.0, 0.0, 0.0, 0.0);
            for batch in loaders.validation.batches(rng) {
                let loss = self.evaluate(decoder, &batch)?;
                val_loss += loss.total;
                ml += loss.match_loss;
                nml += loss.non_match_loss;
                bl += loss.bad_loss;
                pb.inc(1);
            }
            pb.finish_and_clear();
            let n = loaders.validation.num_batches();
            let (val_loss, ml, nml, bl) = (
                batch_mean(val_loss, n),
                batch_mean(ml, n),
                batch_mean(nml, n),
                batch_mean(bl, n),
            );

            history.loss.train_loss.push(train_loss);
            history.loss.val_loss.push(val_loss);
            history.match_loss.push(ml);
            history.non_match_loss.push(nml);
            history.bad_loss.push(bl);
            history.train_bad_loss.push(train_bad);

            metrics.add_scalar("de_train/loss", train_loss, epoch)?;
            metrics.add_scalar("de_train/bad_loss", train_bad, epoch)?;
            if val_loss.is_finite() {
                metrics.add_scalar("de_val/loss", val_loss, epoch)?;
                metrics.add_scalars(
                    "de_comp/loss",
                    &[("train", train_loss), ("validation", val_loss)],
                    epoch,
                )?;
                metrics.add_scalar("match_loss", ml, epoch)?;
                metrics.add_scalar("non_match_loss", nml, epoch)?;
                metrics.add_scalar("bad_loss", bl, epoch)?;
            } else {
                metrics.add_scalars("de_comp/loss", &[("train", train_loss)], epoch)?;
            }

            self.scheduler.step(&mut self.optimizer);
        }
        metrics.flush()?;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParams;
    use crate::loader::split;
    use crate::metrics::MemoryMetrics;
    use crate::train::encoder::tests::clustered;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params() -> ModelParams {
        ModelParams {
            hidden_dim: 8,
            latent_dim: 4,
        }
    }

    #[test]
    fn perfect_outputs_give_zero_loss() {
        let input = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f32 * 0.1);
        let target = Array2::from_elem((3, 4), 5.0);
        let loss = composite_loss(0.75, &input, &input, &target, &target).unwrap();
        assert_abs_diff_eq!(loss.total, 0.0, epsilon = 1e-7);
        assert!(loss.bad_loss > 0.0);
    }

    #[test]
    fn loss_is_convex_combination() {
        let input = Array2::zeros((2, 2));
        let match_out = Array2::from_elem((2, 2), 1.0);
        let nm_out = Array2::from_elem((2, 2), 3.0);
        let target = Array2::from_elem((2, 2), 5.0);
        let loss = composite_loss(0.75, &input, &match_out, &nm_out, &target).unwrap();
        assert_abs_diff_eq!(loss.match_loss, 1.0);
        assert_abs_diff_eq!(loss.non_match_loss, 4.0);
        assert_abs_diff_eq!(loss.total, 0.75 * 1.0 + 0.25 * 4.0);
        assert_abs_diff_eq!(loss.bad_loss, 9.0);
    }

    #[test]
    fn tail_batches_truncate_the_constant_target() {
        let mut rng = StdRng::seed_from_u64(20);
        let encoder = Encoder::new(3, 2, params(), &mut rng);
        let mut decoder = Decoder::new(3, 2, params(), &mut rng);
        let mut trainer = DecoderTrainer::new(&encoder, &DecoderParams::default(), 4, 0.01, 0.9, 1);

        let target = trainer.non_match_target(3).unwrap();
        assert_eq!(target.dim(), (3, 3));
        assert!(target.iter().all(|&v| v == 5.0));
        assert!(trainer.non_match_target(5).is_err());

        // 6 rows at batch size 4: one full batch and a tail of 2.
        let ds = clustered(3, 3);
        let loaders = Loaders::new(&ds, &split(ds.len(), 0.0, &mut rng), 4);
        let sizes: Vec<usize> = loaders.train.batches(&mut rng).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 2]);
        for batch in loaders.train.batches(&mut rng) {
            trainer.train_step(&mut decoder, &batch).unwrap();
        }
    }

    #[test]
    fn fit_trains_decoder_and_leaves_encoder_alone() {
        let ds = clustered(24, 5);
        let mut rng = StdRng::seed_from_u64(21);
        let s = split(ds.len(), 0.25, &mut rng);
        let loaders = Loaders::new(&ds, &s, 8);
        let encoder = Encoder::new(5, 2, params(), &mut rng);
        let inputs = ds.features.clone();
        let latent_before = encoder.encode(&inputs);

        let mut decoder = Decoder::new(5, 2, params(), &mut rng);
        let decoder_params = DecoderParams {
            lr_step: 2,
            ..DecoderParams::default()
        };
        let mut trainer = DecoderTrainer::new(&encoder, &decoder_params, 8, 0.05, 0.5, 6);
        let mut metrics = MemoryMetrics::default();
        let history = trainer.fit(&mut decoder, &loaders, &mut rng, &mut metrics).unwrap();

        assert_eq!(history.loss.epochs(), 6);
        assert!(history.loss.train_loss[5] < history.loss.train_loss[0]);
        assert_eq!(metrics.series("de_val/loss"), history.loss.val_loss);
        assert_eq!(metrics.series("bad_loss").len(), 6);
        assert_eq!(metrics.grouped("de_comp/loss", "train"), history.loss.train_loss);
        assert_eq!(metrics.grouped("de_comp/loss", "validation"), history.loss.val_loss);
        // Decayed after epochs 2, 4 and 6.
        assert_abs_diff_eq!(trainer.lr(), 0.05 * 0.125, epsilon = 1e-7);
        assert_eq!(encoder.encode(&inputs), latent_before);
    }

    #[test]
    fn evaluate_does_not_change_decoder() {
        let ds = clustered(4, 3);
        let mut rng = StdRng::seed_from_u64(22);
        let encoder = Encoder::new(3, 2, params(), &mut rng);
        let decoder = Decoder::new(3, 2, params(), &mut rng);
        let trainer = DecoderTrainer::new(&encoder, &DecoderParams::default(), 8, 0.01, 0.9, 1);
        let loaders = Loaders::new(&ds, &split(ds.len(), 0.0, &mut rng), 8);
        let batch = loaders.train.batches(&mut rng).next().unwrap();
        let a = trainer.evaluate(&decoder, &batch).unwrap();
        let b = trainer.evaluate(&decoder, &batch).unwrap();
        assert_eq!(a, b);
    }
}

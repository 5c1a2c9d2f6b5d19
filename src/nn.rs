//! Minimal batched layers with hand-written gradients.
//!
//! Every layer works on row-major batches (`rows = examples`). `backward`
//! takes the same input the forward pass saw plus the upstream gradient,
//! accumulates parameter gradients into the layer, and returns the gradient
//! with respect to the input.

use std::fs::File;
use std::io::{Read, Seek, Write};

use ndarray::{Array1, Array2, Axis};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::distributions::Uniform;
use rand::Rng;

use crate::error::{IdcaeError, Result};

/// Fully connected layer, `y = x·W + b`.
#[derive(Debug, Clone)]
pub struct Dense {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    grad_weight: Array2<f32>,
    grad_bias: Array1<f32>,
}

impl Dense {
    /// Uniform init in `±1/sqrt(input)`.
    pub fn new<R: Rng + ?Sized>(input: usize, output: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (input.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weight = Array2::from_shape_fn((input, output), |_| rng.sample(dist));
        let bias = Array1::from_shape_fn(output, |_| rng.sample(dist));
        Self::from_parts(weight, bias)
    }

    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        let (input, output) = weight.dim();
        Self {
            grad_weight: Array2::zeros((input, output)),
            grad_bias: Array1::zeros(output),
            weight,
            bias,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        input.dot(&self.weight) + &self.bias
    }

    pub fn backward(&mut self, input: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
        self.grad_weight += &input.t().dot(grad_output);
        self.grad_bias += &grad_output.sum_axis(Axis(0));
        grad_output.dot(&self.weight.t())
    }

    pub fn zero_grad(&mut self) {
        self.grad_weight.fill(0.0);
        self.grad_bias.fill(0.0);
    }

    pub fn grad_weight(&self) -> &Array2<f32> {
        &self.grad_weight
    }

    pub fn grad_bias(&self) -> &Array1<f32> {
        &self.grad_bias
    }

    pub(crate) fn write<W: Write + Seek>(&self, npz: &mut NpzWriter<W>, name: &str) -> Result<()> {
        npz.add_array(format!("{name}.weight"), &self.weight)?;
        npz.add_array(format!("{name}.bias"), &self.bias)?;
        Ok(())
    }

    pub(crate) fn read<R: Read + Seek>(
        npz: &mut NpzReader<R>,
        name: &str,
        input: usize,
        output: usize,
    ) -> Result<Self> {
        let weight: Array2<f32> = npz.by_name(&format!("{name}.weight"))?;
        let bias: Array1<f32> = npz.by_name(&format!("{name}.bias"))?;
        if weight.dim() != (input, output) || bias.len() != output {
            return Err(IdcaeError::Model(format!(
                "layer {name}: expected {input}x{output}, found {:?} / {}",
                weight.dim(),
                bias.len()
            )));
        }
        Ok(Self::from_parts(weight, bias))
    }
}

/// Anything that owns trainable dense layers.
pub trait Parameterized {
    fn visit_layers_mut(&mut self, visitor: &mut dyn FnMut(&mut Dense));

    fn zero_grad(&mut self) {
        self.visit_layers_mut(&mut |layer| layer.zero_grad());
    }
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

pub fn relu_backward(pre_activation: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
    let mut out = grad.clone();
    out.zip_mut_with(pre_activation, |g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

pub fn sigmoid(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Row-wise softmax, shifted by each row's max.
pub fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Softmax cross-entropy summed over the batch, with its gradient w.r.t. the logits.
pub fn cross_entropy_sum(logits: &Array2<f32>, targets: &[usize]) -> Result<(f32, Array2<f32>)> {
    if logits.nrows() != targets.len() {
        return Err(IdcaeError::Model(format!(
            "{} logit rows for {} targets",
            logits.nrows(),
            targets.len()
        )));
    }
    let classes = logits.ncols();
    let mut probs = softmax_rows(logits);
    let mut loss = 0.0f32;
    for (mut row, &target) in probs.rows_mut().into_iter().zip(targets) {
        if target >= classes {
            return Err(IdcaeError::LabelOutOfRange {
                label: target,
                classes,
            });
        }
        loss -= row[target].max(f32::MIN_POSITIVE).ln();
        row[target] -= 1.0;
    }
    Ok((loss, probs))
}

fn check_same_shape(prediction: &Array2<f32>, target: &Array2<f32>) -> Result<()> {
    if prediction.dim() != target.dim() {
        return Err(IdcaeError::Model(format!(
            "shape mismatch: prediction {:?} vs target {:?}",
            prediction.dim(),
            target.dim()
        )));
    }
    Ok(())
}

/// Mean squared error over every element.
pub fn mse(prediction: &Array2<f32>, target: &Array2<f32>) -> Result<f32> {
    check_same_shape(prediction, target)?;
    let n = prediction.len().max(1) as f32;
    let sum: f32 = prediction
        .iter()
        .zip(target.iter())
        .map(|(p, t)| (p - t) * (p - t))
        .sum();
    Ok(sum / n)
}

pub fn mse_grad(prediction: &Array2<f32>, target: &Array2<f32>) -> Result<Array2<f32>> {
    check_same_shape(prediction, target)?;
    let scale = 2.0 / prediction.len().max(1) as f32;
    Ok((prediction - target) * scale)
}

/// Plain SGD with L2 weight decay folded into the gradient.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: f32,
    pub weight_decay: f32,
}

impl Sgd {
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self { lr, weight_decay }
    }

    pub fn step<P: Parameterized + ?Sized>(&self, model: &mut P) {
        let (lr, wd) = (self.lr, self.weight_decay);
        model.visit_layers_mut(&mut |layer| {
            let Dense {
                weight,
                bias,
                grad_weight,
                grad_bias,
            } = layer;
            weight.zip_mut_with(grad_weight, |w, &g| *w -= lr * (g + wd * *w));
            bias.zip_mut_with(grad_bias, |b, &g| *b -= lr * (g + wd * *b));
        });
    }
}

/// Multiplies the optimizer's rate by `gamma` once every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    gamma: f32,
    step_size: usize,
    epoch: usize,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f32) -> Self {
        Self {
            gamma,
            step_size: step_size.max(1),
            epoch: 0,
        }
    }

    /// Call once at the end of every epoch.
    pub fn step(&mut self, optimizer: &mut Sgd) {
        self.epoch += 1;
        if self.epoch % self.step_size == 0 {
            optimizer.lr *= self.gamma;
        }
    }
}

pub(crate) fn npz_create(path: &std::path::Path) -> Result<NpzWriter<File>> {
    Ok(NpzWriter::new(File::create(path)?))
}

pub(crate) fn npz_open(path: &std::path::Path) -> Result<NpzReader<File>> {
    Ok(NpzReader::new(File::open(path)?)?)
}

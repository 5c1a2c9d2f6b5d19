use std::path::Path;

use ndarray::{arr1, Array1, Array2};
use rand::Rng;

use crate::config::ModelParams;
use crate::error::{IdcaeError, Result};
use crate::nn::{npz_create, npz_open, relu, relu_backward, sigmoid, Dense, Parameterized};

/// Intermediate activations of one encoder forward pass.
pub struct EncoderPass {
    h1_pre: Array2<f32>,
    h1: Array2<f32>,
    h2_pre: Array2<f32>,
    h2: Array2<f32>,
    pub latent: Array2<f32>,
    pub logits: Array2<f32>,
}

/// Feature vector → latent code, plus a linear classifier over the latent
/// that predicts the machine id.
#[derive(Debug, Clone)]
pub struct Encoder {
    fc1: Dense,
    fc2: Dense,
    fc3: Dense,
    classifier: Dense,
}

impl Encoder {
    pub fn new<R: Rng + ?Sized>(
        input: usize,
        classes: usize,
        params: ModelParams,
        rng: &mut R,
    ) -> Self {
        Self {
            fc1: Dense::new(input, params.hidden_dim, rng),
            fc2: Dense::new(params.hidden_dim, params.hidden_dim, rng),
            fc3: Dense::new(params.hidden_dim, params.latent_dim, rng),
            classifier: Dense::new(params.latent_dim, classes, rng),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.fc1.input_dim()
    }

    pub fn latent_dim(&self) -> usize {
        self.fc3.output_dim()
    }

    pub fn classes(&self) -> usize {
        self.classifier.output_dim()
    }

    pub fn forward(&self, input: &Array2<f32>) -> EncoderPass {
        let h1_pre = self.fc1.forward(input);
        let h1 = relu(&h1_pre);
        let h2_pre = self.fc2.forward(&h1);
        let h2 = relu(&h2_pre);
        let latent = self.fc3.forward(&h2);
        let logits = self.classifier.forward(&latent);
        EncoderPass {
            h1_pre,
            h1,
            h2_pre,
            h2,
            latent,
            logits,
        }
    }

    /// Latent code only; used by the decoder stage.
    pub fn encode(&self, input: &Array2<f32>) -> Array2<f32> {
        self.forward(input).latent
    }

    /// Accumulate gradients for a loss on the classifier logits.
    pub fn backward(&mut self, input: &Array2<f32>, pass: &EncoderPass, grad_logits: &Array2<f32>) {
        let d_latent = self.classifier.backward(&pass.latent, grad_logits);
        let d_h2 = self.fc3.backward(&pass.h2, &d_latent);
        let d_h2_pre = relu_backward(&pass.h2_pre, &d_h2);
        let d_h1 = self.fc2.backward(&pass.h1, &d_h2_pre);
        let d_h1_pre = relu_backward(&pass.h1_pre, &d_h1);
        self.fc1.backward(input, &d_h1_pre);
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut npz = npz_create(path)?;
        let shape = [self.input_dim(), self.fc1.output_dim(), self.latent_dim(), self.classes()];
        npz.add_array("shape", &arr1(&shape.map(|v| v as i64)))?;
        self.fc1.write(&mut npz, "fc1")?;
        self.fc2.write(&mut npz, "fc2")?;
        self.fc3.write(&mut npz, "fc3")?;
        self.classifier.write(&mut npz, "classifier")?;
        npz.finish()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut npz = npz_open(path)?;
        let shape: Array1<i64> = npz.by_name("shape")?;
        let [input, hidden, latent, classes] = shape_of::<4>(&shape, path)?;
        Ok(Self {
            fc1: Dense::read(&mut npz, "fc1", input, hidden)?,
            fc2: Dense::read(&mut npz, "fc2", hidden, hidden)?,
            fc3: Dense::read(&mut npz, "fc3", hidden, latent)?,
            classifier: Dense::read(&mut npz, "classifier", latent, classes)?,
        })
    }
}

impl Parameterized for Encoder {
    fn visit_layers_mut(&mut self, visitor: &mut dyn FnMut(&mut Dense)) {
        visitor(&mut self.fc1);
        visitor(&mut self.fc2);
        visitor(&mut self.fc3);
        visitor(&mut self.classifier);
    }
}

/// Intermediate activations of one decoder forward pass.
pub struct DecoderPass {
    latent: Array2<f32>,
    condition: Array2<f32>,
    gate: Array2<f32>,
    z: Array2<f32>,
    h1_pre: Array2<f32>,
    h1: Array2<f32>,
    h2_pre: Array2<f32>,
    h2: Array2<f32>,
    pub output: Array2<f32>,
}

/// Reconstructs the feature vector from a latent code modulated by an id
/// condition: `z = latent * sigmoid(gate(c)) + shift(c)`.
#[derive(Debug, Clone)]
pub struct Decoder {
    gate: Dense,
    shift: Dense,
    fc1: Dense,
    fc2: Dense,
    fc3: Dense,
}

impl Decoder {
    pub fn new<R: Rng + ?Sized>(
        output: usize,
        classes: usize,
        params: ModelParams,
        rng: &mut R,
    ) -> Self {
        Self {
            gate: Dense::new(classes, params.latent_dim, rng),
            shift: Dense::new(classes, params.latent_dim, rng),
            fc1: Dense::new(params.latent_dim, params.hidden_dim, rng),
            fc2: Dense::new(params.hidden_dim, params.hidden_dim, rng),
            fc3: Dense::new(params.hidden_dim, output, rng),
        }
    }

    pub fn output_dim(&self) -> usize {
        self.fc3.output_dim()
    }

    pub fn latent_dim(&self) -> usize {
        self.fc1.input_dim()
    }

    pub fn classes(&self) -> usize {
        self.gate.input_dim()
    }

    /// Decode `latent` under one condition. `condition` is the bipolar label.
    pub fn forward(&self, latent: &Array2<f32>, condition: &Array2<f32>) -> DecoderPass {
        let gate = sigmoid(&self.gate.forward(condition));
        let shift = self.shift.forward(condition);
        let z = latent * &gate + &shift;
        let h1_pre = self.fc1.forward(&z);
        let h1 = relu(&h1_pre);
        let h2_pre = self.fc2.forward(&h1);
        let h2 = relu(&h2_pre);
        let output = self.fc3.forward(&h2);
        DecoderPass {
            latent: latent.clone(),
            condition: condition.clone(),
            gate,
            z,
            h1_pre,
            h1,
            h2_pre,
            h2,
            output,
        }
    }

    /// Match and non-match reconstructions of the same latent batch.
    pub fn reconstruct(
        &self,
        latent: &Array2<f32>,
        match_condition: &Array2<f32>,
        non_match_condition: &Array2<f32>,
    ) -> (DecoderPass, DecoderPass) {
        (
            self.forward(latent, match_condition),
            self.forward(latent, non_match_condition),
        )
    }

    /// Accumulate gradients for a loss on `pass.output`. The latent is treated
    /// as a constant.
    pub fn backward(&mut self, pass: &DecoderPass, grad_output: &Array2<f32>) {
        let d_h2 = self.fc3.backward(&pass.h2, grad_output);
        let d_h2_pre = relu_backward(&pass.h2_pre, &d_h2);
        let d_h1 = self.fc2.backward(&pass.h1, &d_h2_pre);
        let d_h1_pre = relu_backward(&pass.h1_pre, &d_h1);
        let d_z = self.fc1.backward(&pass.z, &d_h1_pre);

        let d_gate_pre = &d_z * &pass.latent * &pass.gate * &pass.gate.mapv(|g| 1.0 - g);
        self.gate.backward(&pass.condition, &d_gate_pre);
        self.shift.backward(&pass.condition, &d_z);
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut npz = npz_create(path)?;
        let shape = [self.classes(), self.latent_dim(), self.fc1.output_dim(), self.output_dim()];
        npz.add_array("shape", &arr1(&shape.map(|v| v as i64)))?;
        self.gate.write(&mut npz, "gate")?;
        self.shift.write(&mut npz, "shift")?;
        self.fc1.write(&mut npz, "fc1")?;
        self.fc2.write(&mut npz, "fc2")?;
        self.fc3.write(&mut npz, "fc3")?;
        npz.finish()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut npz = npz_open(path)?;
        let shape: Array1<i64> = npz.by_name("shape")?;
        let [classes, latent, hidden, output] = shape_of::<4>(&shape, path)?;
        Ok(Self {
            gate: Dense::read(&mut npz, "gate", classes, latent)?,
            shift: Dense::read(&mut npz, "shift", classes, latent)?,
            fc1: Dense::read(&mut npz, "fc1", latent, hidden)?,
            fc2: Dense::read(&mut npz, "fc2", hidden, hidden)?,
            fc3: Dense::read(&mut npz, "fc3", hidden, output)?,
        })
    }
}

impl Parameterized for Decoder {
    fn visit_layers_mut(&mut self, visitor: &mut dyn FnMut(&mut Dense)) {
        visitor(&mut self.gate);
        visitor(&mut self.shift);
        visitor(&mut self.fc1);
        visitor(&mut self.fc2);
        visitor(&mut self.fc3);
    }
}

fn shape_of<const N: usize>(shape: &Array1<i64>, path: &Path) -> Result<[usize; N]> {
    if shape.len() != N || shape.iter().any(|&v| v <= 0) {
        return Err(IdcaeError::Model(format!(
            "{}: malformed shape record {:?}",
            path.display(),
            shape.to_vec()
        )));
    }
    let mut out = [0usize; N];
    for (o, &v) in out.iter_mut().zip(shape.iter()) {
        *o = v as usize;
    }
    Ok(out)
}

/// `{0, 1}` one-hot labels → `{-1, 1}` conditioning vectors.
pub fn bipolar(labels: &Array2<f32>) -> Array2<f32> {
    labels.mapv(|v| 2.0 * (v - 0.5))
}

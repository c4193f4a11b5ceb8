//! Trait abstractions for the acoustic model and its loss.
//!
//! The trainer drives any [`Encoder`] and any [`AlignmentLoss`]; the crate ships
//! a gated convolutional encoder and a CTC loss as the reference pair.

mod ctc;
mod gated_conv;

pub use ctc::{AlignmentLoss, CtcLoss, LossOutput};
pub use gated_conv::{GatedConvEncoder, GatedConvOptions};

use crate::error::{AppError, Result};
use crate::tensor::Tensor3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether training-only behaviour such as dropout is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// Encoder result: logits laid out as (batch, vocabulary, time) plus the number
/// of valid frames per example.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub logits: Tensor3,
    pub lengths: Vec<usize>,
}

/// Trainable tensor with its gradient buffer.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub shape: Vec<usize>,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self {
            name: name.into(),
            shape,
            value,
            grad,
        }
    }

    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

/// Serialized parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Parameter values by name.
pub type StateDict = BTreeMap<String, ParamTensor>;

/// Acoustic encoder: padded features in, per-frame vocabulary scores out.
pub trait Encoder: Send {
    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    /// Vocabulary size of the output axis.
    fn num_classes(&self) -> usize;

    /// Training forward pass; keeps the activations `backward` needs.
    fn forward(&mut self, inputs: &Tensor3, lengths: &[usize]) -> Result<EncoderOutput>;

    /// Forward pass without gradient bookkeeping. Never applies dropout.
    fn infer(&self, inputs: &Tensor3, lengths: &[usize]) -> Result<EncoderOutput>;

    /// Accumulate parameter gradients for `grad_logits` (batch, vocabulary, time)
    /// against the activations of the last `forward`.
    fn backward(&mut self, grad_logits: &Tensor3) -> Result<()>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.grad.fill(0.0);
        }
    }

    fn state_dict(&self) -> StateDict {
        self.parameters()
            .into_iter()
            .map(|p| {
                (
                    p.name.clone(),
                    ParamTensor {
                        shape: p.shape.clone(),
                        data: p.value.clone(),
                    },
                )
            })
            .collect()
    }

    /// Overwrite every parameter from `state`; names and shapes must match exactly.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let params = self.parameters_mut();
        if params.len() != state.len() {
            return Err(AppError::Checkpoint(format!(
                "checkpoint holds {} tensors, model has {}",
                state.len(),
                params.len()
            )));
        }
        for p in params {
            let saved = state.get(&p.name).ok_or_else(|| {
                AppError::Checkpoint(format!("checkpoint lacks parameter '{}'", p.name))
            })?;
            if saved.shape != p.shape || saved.data.len() != p.value.len() {
                return Err(AppError::Checkpoint(format!(
                    "parameter '{}' has shape {:?} in checkpoint, {:?} in model",
                    p.name, saved.shape, p.shape
                )));
            }
            p.value.copy_from_slice(&saved.data);
        }
        Ok(())
    }
}

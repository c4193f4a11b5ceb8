//! Gated 1-D convolutional encoder.
//!
//! Input dropout, then a "same"-padded Conv1d from the feature channels to
//! `2 * vocabulary` channels, then a gated linear unit: the first half of the
//! channels is multiplied by the sigmoid of the second half. Stride is 1, so
//! output lengths equal input lengths.

use super::{Encoder, EncoderOutput, Mode, Parameter};
use crate::error::{AppError, Result};
use crate::tensor::Tensor3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

/// Encoder hyper-parameters.
#[derive(Debug, Clone)]
pub struct GatedConvOptions {
    pub in_channels: usize,
    pub num_classes: usize,
    /// Odd kernel width in frames.
    pub kernel_size: usize,
    /// Probability of zeroing an input value during training.
    pub dropout: f32,
    pub seed: u64,
}

/// Activations kept between `forward` and `backward`.
struct ForwardCache {
    /// Input after dropout, (batch, channel, time).
    input: Tensor3,
    /// Convolution output before gating, (batch, 2 * vocabulary, time).
    pre_gate: Tensor3,
    lengths: Vec<usize>,
}

pub struct GatedConvEncoder {
    options: GatedConvOptions,
    mode: Mode,
    /// (2 * vocabulary, channel, kernel)
    weight: Parameter,
    /// (2 * vocabulary)
    bias: Parameter,
    rng: StdRng,
    cache: Option<ForwardCache>,
}

impl std::fmt::Debug for GatedConvEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatedConvEncoder")
            .field("options", &self.options)
            .field("mode", &self.mode)
            .finish()
    }
}

impl GatedConvEncoder {
    pub fn new(options: GatedConvOptions) -> Result<Self> {
        if options.kernel_size == 0 || options.kernel_size % 2 == 0 {
            return Err(AppError::Config(format!(
                "kernel_size must be odd, got {}",
                options.kernel_size
            )));
        }
        if !(0.0..1.0).contains(&options.dropout) {
            return Err(AppError::Config(format!(
                "dropout must be in [0, 1), got {}",
                options.dropout
            )));
        }
        if options.in_channels == 0 || options.num_classes == 0 {
            return Err(AppError::Config(
                "encoder needs at least one input channel and one class".to_string(),
            ));
        }

        let out_channels = 2 * options.num_classes;
        let fan_in = options.in_channels * options.kernel_size;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(options.seed);
        let weight: Vec<f32> = (0..out_channels * fan_in)
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        let bias: Vec<f32> = (0..out_channels)
            .map(|_| rng.random_range(-bound..bound))
            .collect();

        debug!(
            "GatedConvEncoder: {} -> {} classes, kernel {}, {} parameters",
            options.in_channels,
            options.num_classes,
            options.kernel_size,
            weight.len() + bias.len()
        );

        Ok(Self {
            weight: Parameter::new(
                "conv.weight",
                vec![out_channels, options.in_channels, options.kernel_size],
                weight,
            ),
            bias: Parameter::new("conv.bias", vec![out_channels], bias),
            options,
            mode: Mode::Training,
            rng,
            cache: None,
        })
    }

    fn check_inputs(&self, inputs: &Tensor3, lengths: &[usize]) -> Result<()> {
        let [batch, channels, frames] = inputs.dims();
        if batch == 0 || frames == 0 {
            return Err(AppError::Model(format!(
                "empty input batch of shape {:?}",
                inputs.dims()
            )));
        }
        if channels != self.options.in_channels {
            return Err(AppError::Model(format!(
                "encoder expects {} input channels, got {}",
                self.options.in_channels, channels
            )));
        }
        if lengths.len() != batch || lengths.iter().any(|&l| l > frames) {
            return Err(AppError::Model(format!(
                "lengths {:?} do not fit a batch of {} x {} frames",
                lengths, batch, frames
            )));
        }
        Ok(())
    }

    fn apply_dropout(&mut self, inputs: &Tensor3) -> Tensor3 {
        let p = self.options.dropout;
        let mut out = inputs.clone();
        if self.mode == Mode::Training && p > 0.0 {
            let scale = 1.0 / (1.0 - p);
            for v in out.data_mut() {
                *v = if self.rng.random::<f32>() < p { 0.0 } else { *v * scale };
            }
        }
        out
    }

    /// Convolution over the valid frames of every example; padding frames stay zero.
    fn convolve(&self, input: &Tensor3, lengths: &[usize]) -> Tensor3 {
        let [batch, channels, frames] = input.dims();
        let out_channels = 2 * self.options.num_classes;
        let k = self.options.kernel_size;
        let pad = k / 2;
        let w = &self.weight.value;
        let bias = &self.bias.value;

        let mut out = Tensor3::zeros([batch, out_channels, frames]);
        out.data_mut()
            .par_chunks_mut(out_channels * frames)
            .enumerate()
            .for_each(|(b, block)| {
                let len = lengths[b];
                for o in 0..out_channels {
                    let row = &mut block[o * frames..o * frames + len];
                    row.fill(bias[o]);
                    for c in 0..channels {
                        let x = input.row(b, c);
                        let taps = &w[(o * channels + c) * k..(o * channels + c + 1) * k];
                        for (j, &tap) in taps.iter().enumerate() {
                            // Output frame t reads input frame t + j - pad.
                            let t_lo = pad.saturating_sub(j);
                            let t_hi = (len + pad).saturating_sub(j).min(len);
                            for t in t_lo..t_hi {
                                row[t] += tap * x[t + j - pad];
                            }
                        }
                    }
                }
            });
        out
    }

    fn gate(&self, pre_gate: &Tensor3, lengths: &[usize]) -> Tensor3 {
        let [batch, _, frames] = pre_gate.dims();
        let classes = self.options.num_classes;
        let mut logits = Tensor3::zeros([batch, classes, frames]);
        for (b, &len) in lengths.iter().enumerate() {
            for v in 0..classes {
                let a = pre_gate.row(b, v);
                let g = pre_gate.row(b, classes + v);
                let out = logits.row_mut(b, v);
                for t in 0..len {
                    out[t] = a[t] * sigmoid(g[t]);
                }
            }
        }
        logits
    }
}

impl Encoder for GatedConvEncoder {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn num_classes(&self) -> usize {
        self.options.num_classes
    }

    fn forward(&mut self, inputs: &Tensor3, lengths: &[usize]) -> Result<EncoderOutput> {
        self.check_inputs(inputs, lengths)?;
        let input = self.apply_dropout(inputs);
        let pre_gate = self.convolve(&input, lengths);
        let logits = self.gate(&pre_gate, lengths);
        self.cache = Some(ForwardCache {
            input,
            pre_gate,
            lengths: lengths.to_vec(),
        });
        Ok(EncoderOutput {
            logits,
            lengths: lengths.to_vec(),
        })
    }

    fn infer(&self, inputs: &Tensor3, lengths: &[usize]) -> Result<EncoderOutput> {
        self.check_inputs(inputs, lengths)?;
        let pre_gate = self.convolve(inputs, lengths);
        Ok(EncoderOutput {
            logits: self.gate(&pre_gate, lengths),
            lengths: lengths.to_vec(),
        })
    }

    fn backward(&mut self, grad_logits: &Tensor3) -> Result<()> {
        let cache = self.cache.take().ok_or_else(|| {
            AppError::Model("backward called without a preceding training forward".to_string())
        })?;
        let [batch, channels, frames] = cache.input.dims();
        let classes = self.options.num_classes;
        if grad_logits.dims() != [batch, classes, frames] {
            return Err(AppError::Model(format!(
                "gradient shape {:?} does not match output shape {:?}",
                grad_logits.dims(),
                [batch, classes, frames]
            )));
        }

        // Gradient w.r.t. the pre-gate activations.
        let mut grad_pre = Tensor3::zeros([batch, 2 * classes, frames]);
        for (b, &len) in cache.lengths.iter().enumerate() {
            for v in 0..classes {
                for t in 0..len {
                    let g = grad_logits.get(b, v, t);
                    let a = cache.pre_gate.get(b, v, t);
                    let s = sigmoid(cache.pre_gate.get(b, classes + v, t));
                    grad_pre.set(b, v, t, g * s);
                    grad_pre.set(b, classes + v, t, g * a * s * (1.0 - s));
                }
            }
        }

        let k = self.options.kernel_size;
        let pad = k / 2;
        let input = &cache.input;
        let lengths = &cache.lengths;
        self.weight
            .grad
            .par_chunks_mut(channels * k)
            .zip(self.bias.grad.par_iter_mut())
            .enumerate()
            .for_each(|(o, (w_grad, b_grad))| {
                for (b, &len) in lengths.iter().enumerate() {
                    let g = &grad_pre.row(b, o)[..len];
                    *b_grad += g.iter().sum::<f32>();
                    for c in 0..channels {
                        let x = input.row(b, c);
                        for j in 0..k {
                            let t_lo = pad.saturating_sub(j);
                            let t_hi = (len + pad).saturating_sub(j).min(len);
                            let mut acc = 0.0f32;
                            for t in t_lo..t_hi {
                                acc += g[t] * x[t + j - pad];
                            }
                            w_grad[c * k + j] += acc;
                        }
                    }
                }
            });
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

//! Gradient clipping, SGD with Nesterov momentum, and learning-rate schedules.

use crate::constants::training::CLIP_EPSILON;
use crate::error::{AppError, Result};
use crate::model::Parameter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// L2 norm of all gradients taken together.
pub fn global_grad_norm(params: &[&mut Parameter]) -> f64 {
    params
        .iter()
        .flat_map(|p| p.grad.iter())
        .map(|&g| (g as f64) * (g as f64))
        .sum::<f64>()
        .sqrt()
}

/// Rescale all gradients jointly so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f64) -> f64 {
    let total = global_grad_norm(params);
    let coef = max_norm / (total + CLIP_EPSILON);
    if coef < 1.0 {
        for p in params.iter_mut() {
            for g in p.grad.iter_mut() {
                *g = (*g as f64 * coef) as f32;
            }
        }
    }
    total
}

/// Per-epoch learning-rate policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// The base rate for every epoch.
    Constant,
    /// `base * gamma^(epoch / step_size)`.
    Step { step_size: usize, gamma: f64 },
}

impl Default for LrSchedule {
    fn default() -> Self {
        LrSchedule::Constant
    }
}

impl LrSchedule {
    pub fn learning_rate(&self, base: f64, epoch: usize) -> f64 {
        match *self {
            LrSchedule::Constant => base,
            LrSchedule::Step { step_size, gamma } => {
                base * gamma.powi((epoch / step_size.max(1)) as i32)
            }
        }
    }
}

/// SGD hyper-parameters.
#[derive(Debug, Clone)]
pub struct SgdOptions {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

/// Persistent optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdState {
    pub learning_rate: f64,
    pub momentum_buffers: BTreeMap<String, Vec<f32>>,
}

/// Stochastic gradient descent with optional Nesterov momentum and L2 weight decay.
///
/// Per parameter: `d = g + wd * w`; `buf = momentum * buf + d` (the first step
/// seeds `buf = d`); with Nesterov `d = d + momentum * buf`, otherwise `d = buf`;
/// `w -= lr * d`.
#[derive(Debug, Clone)]
pub struct Sgd {
    options: SgdOptions,
    learning_rate: f64,
    momentum_buffers: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(options: SgdOptions) -> Result<Self> {
        if options.nesterov && options.momentum <= 0.0 {
            return Err(AppError::Config(
                "Nesterov momentum requires momentum > 0".to_string(),
            ));
        }
        if options.learning_rate < 0.0 || options.weight_decay < 0.0 {
            return Err(AppError::Config(
                "learning rate and weight decay must be non-negative".to_string(),
            ));
        }
        Ok(Self {
            learning_rate: options.learning_rate,
            options,
            momentum_buffers: BTreeMap::new(),
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Apply one update to every parameter.
    pub fn step(&mut self, params: &mut [&mut Parameter]) {
        let lr = self.learning_rate;
        let momentum = self.options.momentum;
        let wd = self.options.weight_decay;

        for p in params.iter_mut() {
            let Parameter { name, value, grad, .. } = &mut **p;
            let mut d: Vec<f64> = grad
                .iter()
                .zip(value.iter())
                .map(|(&g, &w)| g as f64 + wd * w as f64)
                .collect();

            if momentum != 0.0 {
                match self.momentum_buffers.get_mut(name.as_str()) {
                    Some(buf) => {
                        for (b, &di) in buf.iter_mut().zip(&d) {
                            *b = (momentum * *b as f64 + di) as f32;
                        }
                    }
                    None => {
                        self.momentum_buffers
                            .insert(name.clone(), d.iter().map(|&v| v as f32).collect());
                    }
                }
                let buf = &self.momentum_buffers[name.as_str()];
                if self.options.nesterov {
                    for (di, &b) in d.iter_mut().zip(buf) {
                        *di += momentum * b as f64;
                    }
                } else {
                    for (di, &b) in d.iter_mut().zip(buf) {
                        *di = b as f64;
                    }
                }
            }

            for (w, di) in value.iter_mut().zip(d) {
                *w = (*w as f64 - lr * di) as f32;
            }
        }
    }

    pub fn state(&self) -> SgdState {
        SgdState {
            learning_rate: self.learning_rate,
            momentum_buffers: self.momentum_buffers.clone(),
        }
    }

    pub fn load_state(&mut self, state: SgdState) {
        self.learning_rate = state.learning_rate;
        self.momentum_buffers = state.momentum_buffers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, value: Vec<f32>, grad: Vec<f32>) -> Parameter {
        let mut p = Parameter::new(name, vec![value.len()], value);
        p.grad = grad;
        p
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut a = param("a", vec![0.0; 2], vec![3.0, 0.0]);
        let mut b = param("b", vec![0.0; 1], vec![4.0]);
        let mut params = vec![&mut a, &mut b];
        let before = clip_grad_norm(&mut params, 0.2);
        assert!((before - 5.0).abs() < 1e-9);
        let after = global_grad_norm(&params);
        assert!((after - 0.2).abs() < 1e-6, "post-clip norm {}", after);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let mut a = param("a", vec![0.0; 2], vec![0.03, -0.04]);
        let mut params = vec![&mut a];
        clip_grad_norm(&mut params, 0.2);
        assert_eq!(a.grad, vec![0.03, -0.04]);
    }

    #[test]
    fn test_nesterov_matches_reference_updates() {
        let mut sgd = Sgd::new(SgdOptions {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
            nesterov: true,
        })
        .unwrap();
        let mut w = param("w", vec![1.0], vec![1.0]);

        // Step 1: buf = 1, d = 1 + 0.9 = 1.9, w = 1 - 0.19
        sgd.step(&mut [&mut w]);
        assert!((w.value[0] - 0.81).abs() < 1e-6);

        // Step 2: buf = 0.9 + 1 = 1.9, d = 1 + 1.71 = 2.71, w = 0.81 - 0.271
        sgd.step(&mut [&mut w]);
        assert!((w.value[0] - 0.539).abs() < 1e-6);
    }

    #[test]
    fn test_weight_decay_applies_without_gradient() {
        let mut sgd = Sgd::new(SgdOptions {
            learning_rate: 0.5,
            momentum: 0.0,
            weight_decay: 0.1,
            nesterov: false,
        })
        .unwrap();
        let mut w = param("w", vec![2.0], vec![0.0]);
        sgd.step(&mut [&mut w]);
        assert!((w.value[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_nesterov_needs_momentum() {
        assert!(Sgd::new(SgdOptions {
            learning_rate: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: true,
        })
        .is_err());
    }

    #[test]
    fn test_state_round_trip_restores_momentum() {
        let opts = SgdOptions {
            learning_rate: 0.1,
            momentum: 0.8,
            weight_decay: 0.0,
            nesterov: true,
        };
        let mut a = Sgd::new(opts.clone()).unwrap();
        let mut wa = param("w", vec![1.0], vec![0.5]);
        a.step(&mut [&mut wa]);

        let mut b = Sgd::new(opts).unwrap();
        b.load_state(a.state());
        let mut wb = wa.clone();
        a.step(&mut [&mut wa]);
        b.step(&mut [&mut wb]);
        assert_eq!(wa.value, wb.value);
    }

    #[test]
    fn test_step_schedule() {
        let s = LrSchedule::Step {
            step_size: 10,
            gamma: 0.5,
        };
        assert_eq!(s.learning_rate(0.6, 9), 0.6);
        assert!((s.learning_rate(0.6, 10) - 0.3).abs() < 1e-12);
        assert!((s.learning_rate(0.6, 25) - 0.15).abs() < 1e-12);
        assert_eq!(LrSchedule::Constant.learning_rate(0.6, 100), 0.6);
    }
}

//! Connectionist temporal classification loss.
//!
//! Forward-backward in log space over the blank-interleaved target, on raw
//! logits (the softmax is applied here). The returned gradient is with respect
//! to the logits.

use crate::asr::BLANK_INDEX;
use crate::error::{AppError, Result};
use crate::tensor::{log_softmax_row, Tensor3};
use rayon::prelude::*;
use tracing::warn;

/// Batch loss and its gradient, both already divided by the batch size.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    /// Same layout as the logits: (time, batch, vocabulary).
    pub grad: Tensor3,
}

/// Sequence loss scoring per-frame scores against unaligned targets.
pub trait AlignmentLoss: Send + Sync {
    /// `logits` is (time, batch, vocabulary); `targets` is the flat concatenation
    /// of every example's labels, split by `target_lengths`.
    fn compute(
        &self,
        logits: &Tensor3,
        targets: &[usize],
        output_lengths: &[usize],
        target_lengths: &[usize],
    ) -> Result<LossOutput>;
}

/// CTC with a configurable blank, averaged over the batch.
#[derive(Debug, Clone)]
pub struct CtcLoss {
    blank: usize,
}

impl Default for CtcLoss {
    fn default() -> Self {
        Self::new(BLANK_INDEX)
    }
}

/// Per-example result: negative log-likelihood and (time, vocabulary) gradient rows.
struct ExampleLoss {
    nll: f64,
    grad: Vec<f32>,
}

impl CtcLoss {
    pub fn new(blank: usize) -> Self {
        Self { blank }
    }

    fn example(
        &self,
        logits: &Tensor3,
        b: usize,
        frames: usize,
        labels: &[usize],
    ) -> Option<ExampleLoss> {
        let classes = logits.dims()[2];
        let blank = self.blank;

        // Each repeated neighbour needs a blank frame between them.
        let repeats = labels.windows(2).filter(|w| w[0] == w[1]).count();
        if frames == 0 || frames < labels.len() + repeats {
            return None;
        }

        let mut log_probs = vec![0.0f32; frames * classes];
        for t in 0..frames {
            log_softmax_row(
                logits.row(t, b),
                &mut log_probs[t * classes..(t + 1) * classes],
            );
        }
        let lp = |t: usize, k: usize| log_probs[t * classes + k] as f64;

        let states = 2 * labels.len() + 1;
        let ext = |s: usize| if s % 2 == 0 { blank } else { labels[s / 2] };
        let skip_allowed = |s: usize, other: usize| ext(s) != blank && ext(s) != ext(other);

        let mut alpha = vec![f64::NEG_INFINITY; frames * states];
        alpha[0] = lp(0, blank);
        if states > 1 {
            alpha[1] = lp(0, ext(1));
        }
        for t in 1..frames {
            let (prev, cur) = alpha.split_at_mut(t * states);
            let prev = &prev[(t - 1) * states..];
            for s in 0..states {
                let mut a = prev[s];
                if s >= 1 {
                    a = log_add(a, prev[s - 1]);
                }
                if s >= 2 && skip_allowed(s, s - 2) {
                    a = log_add(a, prev[s - 2]);
                }
                cur[s] = a + lp(t, ext(s));
            }
        }

        let last = (frames - 1) * states;
        let mut log_likelihood = alpha[last + states - 1];
        if states > 1 {
            log_likelihood = log_add(log_likelihood, alpha[last + states - 2]);
        }
        if !log_likelihood.is_finite() {
            return None;
        }

        let mut beta = vec![f64::NEG_INFINITY; frames * states];
        beta[last + states - 1] = lp(frames - 1, ext(states - 1));
        if states > 1 {
            beta[last + states - 2] = lp(frames - 1, ext(states - 2));
        }
        for t in (0..frames - 1).rev() {
            let (cur, next) = beta.split_at_mut((t + 1) * states);
            let cur = &mut cur[t * states..];
            for s in 0..states {
                let mut v = next[s];
                if s + 1 < states {
                    v = log_add(v, next[s + 1]);
                }
                if s + 2 < states && skip_allowed(s, s + 2) {
                    v = log_add(v, next[s + 2]);
                }
                cur[s] = v + lp(t, ext(s));
            }
        }

        // d(-ln p)/d logit = softmax - (sum of alpha*beta over states emitting k) / (p * y_k)
        let mut grad = vec![0.0f32; frames * classes];
        let mut occupancy = vec![f64::NEG_INFINITY; classes];
        for t in 0..frames {
            occupancy.fill(f64::NEG_INFINITY);
            for s in 0..states {
                let k = ext(s);
                occupancy[k] = log_add(occupancy[k], alpha[t * states + s] + beta[t * states + s]);
            }
            for k in 0..classes {
                let y = lp(t, k);
                let posterior = (occupancy[k] - y - log_likelihood).exp();
                grad[t * classes + k] = (y.exp() - posterior) as f32;
            }
        }

        Some(ExampleLoss {
            nll: -log_likelihood,
            grad,
        })
    }
}

impl AlignmentLoss for CtcLoss {
    fn compute(
        &self,
        logits: &Tensor3,
        targets: &[usize],
        output_lengths: &[usize],
        target_lengths: &[usize],
    ) -> Result<LossOutput> {
        let [max_frames, batch, classes] = logits.dims();
        if output_lengths.len() != batch || target_lengths.len() != batch {
            return Err(AppError::Data(format!(
                "CTC got {} output lengths and {} target lengths for a batch of {}",
                output_lengths.len(),
                target_lengths.len(),
                batch
            )));
        }
        if target_lengths.iter().sum::<usize>() != targets.len() {
            return Err(AppError::Data(format!(
                "target lengths sum to {} but {} targets given",
                target_lengths.iter().sum::<usize>(),
                targets.len()
            )));
        }
        if let Some(&bad) = output_lengths.iter().find(|&&l| l > max_frames) {
            return Err(AppError::Data(format!(
                "output length {} exceeds {} frames",
                bad, max_frames
            )));
        }
        if let Some(&bad) = targets.iter().find(|&&k| k >= classes || k == self.blank) {
            return Err(AppError::Data(format!(
                "target label {} is blank or outside {} classes",
                bad, classes
            )));
        }

        let mut offsets = Vec::with_capacity(batch);
        let mut offset = 0;
        for &len in target_lengths {
            offsets.push(offset);
            offset += len;
        }

        let per_example: Vec<Option<ExampleLoss>> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let labels = &targets[offsets[b]..offsets[b] + target_lengths[b]];
                self.example(logits, b, output_lengths[b], labels)
            })
            .collect();

        let scale = 1.0 / batch as f64;
        let mut total = 0.0f64;
        let mut grad = Tensor3::zeros([max_frames, batch, classes]);
        for (b, result) in per_example.into_iter().enumerate() {
            match result {
                Some(ex) => {
                    total += ex.nll;
                    for t in 0..output_lengths[b] {
                        let src = &ex.grad[t * classes..(t + 1) * classes];
                        for (dst, &g) in grad.row_mut(t, b).iter_mut().zip(src) {
                            *dst = (g as f64 * scale) as f32;
                        }
                    }
                }
                None => warn!(
                    "Example {} cannot align {} labels in {} frames; excluded from loss",
                    b, target_lengths[b], output_lengths[b]
                ),
            }
        }

        Ok(LossOutput {
            loss: (total * scale) as f32,
            grad,
        })
    }
}

#[inline]
fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits(frames: usize, batch: usize, classes: usize, seed: usize) -> Tensor3 {
        let data = (0..frames * batch * classes)
            .map(|i| (((i + seed) * 7919) % 23) as f32 / 10.0 - 1.0)
            .collect();
        Tensor3::from_vec([frames, batch, classes], data).unwrap()
    }

    #[test]
    fn test_uniform_two_frames_single_label() {
        // Paths for "a" over 2 frames: aa, _a, a_ -> p = 3/4.
        let x = Tensor3::zeros([2, 1, 2]);
        let out = CtcLoss::default().compute(&x, &[1], &[2], &[1]).unwrap();
        assert!((out.loss as f64 - (-(0.75f64).ln())).abs() < 1e-6);
    }

    #[test]
    fn test_empty_target_is_all_blank() {
        let x = logits(3, 1, 3, 1);
        let out = CtcLoss::default().compute(&x, &[], &[3], &[0]).unwrap();
        let mut expected = 0.0f64;
        let mut row = [0.0f32; 3];
        for t in 0..3 {
            log_softmax_row(x.row(t, 0), &mut row);
            expected -= row[0] as f64;
        }
        assert!((out.loss as f64 - expected).abs() < 1e-5);
    }

    #[test]
    fn test_loss_is_batch_mean() {
        let x = logits(4, 2, 3, 5);
        let loss = CtcLoss::default();
        let both = loss.compute(&x, &[1, 2, 2], &[4, 3], &[1, 2]).unwrap().loss;

        let mut first = Tensor3::zeros([4, 1, 3]);
        let mut second = Tensor3::zeros([4, 1, 3]);
        for t in 0..4 {
            first.row_mut(t, 0).copy_from_slice(x.row(t, 0));
            second.row_mut(t, 0).copy_from_slice(x.row(t, 1));
        }
        let a = loss.compute(&first, &[1], &[4], &[1]).unwrap().loss;
        let b = loss.compute(&second, &[2, 2], &[3], &[2]).unwrap().loss;
        assert!((both - (a + b) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let x = logits(5, 2, 4, 3);
        let targets = [1, 2, 3, 3];
        let out_lens = [5, 4];
        let tgt_lens = [2, 2];
        let loss = CtcLoss::default();
        let analytic = loss.compute(&x, &targets, &out_lens, &tgt_lens).unwrap().grad;

        let eps = 1e-3f32;
        for idx in [0usize, 5, 9, 17, 22, 31, 38] {
            let mut up = x.clone();
            up.data_mut()[idx] += eps;
            let mut down = x.clone();
            down.data_mut()[idx] -= eps;
            let numeric = (loss.compute(&up, &targets, &out_lens, &tgt_lens).unwrap().loss
                - loss.compute(&down, &targets, &out_lens, &tgt_lens).unwrap().loss)
                / (2.0 * eps);
            assert!(
                (numeric - analytic.data()[idx]).abs() < 2e-3,
                "index {}: numeric {} analytic {}",
                idx,
                numeric,
                analytic.data()[idx]
            );
        }
    }

    #[test]
    fn test_padding_frames_get_no_gradient() {
        let x = logits(5, 1, 3, 2);
        let out = CtcLoss::default().compute(&x, &[1], &[3], &[1]).unwrap();
        for t in 3..5 {
            assert!(out.grad.row(t, 0).iter().all(|&g| g == 0.0));
        }
    }

    #[test]
    fn test_unalignable_example_excluded() {
        // "aa" needs three frames; two are available.
        let x = logits(2, 1, 3, 0);
        let out = CtcLoss::default().compute(&x, &[1, 1], &[2], &[2]).unwrap();
        assert_eq!(out.loss, 0.0);
        assert!(out.grad.data().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_length_sum_mismatch_rejected() {
        let x = logits(3, 1, 3, 0);
        assert!(CtcLoss::default().compute(&x, &[1, 2], &[3], &[1]).is_err());
        assert!(CtcLoss::default().compute(&x, &[0], &[3], &[1]).is_err());
    }
}

//! Padded training batches.

use crate::asr::FeatureMatrix;
use crate::error::{AppError, Result};
use crate::tensor::Tensor3;

/// One labelled utterance before batching.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub features: FeatureMatrix,
    pub labels: Vec<usize>,
}

/// A padded batch: `inputs` is (batch, channel, time), `targets` is the flat
/// concatenation of every example's labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Tensor3,
    pub targets: Vec<usize>,
    pub input_lengths: Vec<usize>,
    pub target_lengths: Vec<usize>,
}

impl Batch {
    /// Assemble a batch, checking every shape and length invariant.
    pub fn new(
        inputs: Tensor3,
        targets: Vec<usize>,
        input_lengths: Vec<usize>,
        target_lengths: Vec<usize>,
    ) -> Result<Self> {
        let [batch, _, frames] = inputs.dims();
        if input_lengths.len() != batch || target_lengths.len() != batch {
            return Err(AppError::Data(format!(
                "batch of {} with {} input lengths and {} target lengths",
                batch,
                input_lengths.len(),
                target_lengths.len()
            )));
        }
        if let Some(&bad) = input_lengths.iter().find(|&&l| l == 0 || l > frames) {
            return Err(AppError::Data(format!(
                "input length {} outside 1..={}",
                bad, frames
            )));
        }
        let total: usize = target_lengths.iter().sum();
        if total != targets.len() {
            return Err(AppError::Data(format!(
                "target lengths sum to {} but {} targets given",
                total,
                targets.len()
            )));
        }
        Ok(Self {
            inputs,
            targets,
            input_lengths,
            target_lengths,
        })
    }

    /// Pad a group of examples into a batch, longest input first.
    pub fn collate(mut examples: Vec<Example>) -> Result<Self> {
        if examples.is_empty() {
            return Err(AppError::Data("cannot collate an empty batch".to_string()));
        }
        examples.sort_by(|a, b| b.features.frames.cmp(&a.features.frames));

        let channels = examples[0].features.channels;
        let max_frames = examples[0].features.frames;
        let mut inputs = Tensor3::zeros([examples.len(), channels, max_frames]);
        let mut targets = Vec::new();
        let mut input_lengths = Vec::with_capacity(examples.len());
        let mut target_lengths = Vec::with_capacity(examples.len());

        for (b, example) in examples.iter().enumerate() {
            let feats = &example.features;
            if feats.channels != channels {
                return Err(AppError::Data(format!(
                    "example has {} channels, batch has {}",
                    feats.channels, channels
                )));
            }
            for c in 0..channels {
                let src = &feats.data[c * feats.frames..(c + 1) * feats.frames];
                inputs.row_mut(b, c)[..feats.frames].copy_from_slice(src);
            }
            input_lengths.push(feats.frames);
            target_lengths.push(example.labels.len());
            targets.extend_from_slice(&example.labels);
        }

        Self::new(inputs, targets, input_lengths, target_lengths)
    }

    pub fn len(&self) -> usize {
        self.input_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_lengths.is_empty()
    }

    /// Split the flat targets into per-example references.
    ///
    /// Slices are contiguous and the offset accumulates across the batch; the split
    /// must consume `targets` exactly.
    pub fn split_targets(&self) -> Result<Vec<&[usize]>> {
        let mut references = Vec::with_capacity(self.target_lengths.len());
        let mut offset = 0;
        for &len in &self.target_lengths {
            let end = offset + len;
            if end > self.targets.len() {
                return Err(AppError::Data(format!(
                    "target slice {}..{} overruns {} targets",
                    offset,
                    end,
                    self.targets.len()
                )));
            }
            references.push(&self.targets[offset..end]);
            offset = end;
        }
        if offset != self.targets.len() {
            return Err(AppError::Data(format!(
                "{} targets left over after splitting",
                self.targets.len() - offset
            )));
        }
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(frames: usize, fill: f32, labels: Vec<usize>) -> Example {
        Example {
            features: FeatureMatrix {
                channels: 2,
                frames,
                data: vec![fill; 2 * frames],
            },
            labels,
        }
    }

    #[test]
    fn test_collate_sorts_and_pads() {
        let batch = Batch::collate(vec![
            example(2, 1.0, vec![1]),
            example(4, 2.0, vec![2, 3, 1]),
        ])
        .unwrap();

        assert_eq!(batch.inputs.dims(), [2, 2, 4]);
        assert_eq!(batch.input_lengths, vec![4, 2]);
        assert_eq!(batch.target_lengths, vec![3, 1]);
        assert_eq!(batch.targets, vec![2, 3, 1, 1]);
        assert_eq!(batch.inputs.row(1, 0), &[1.0, 1.0, 0.0, 0.0]);
        assert_eq!(batch.inputs.row(0, 1), &[2.0; 4]);
    }

    #[test]
    fn test_length_sum_mismatch_rejected() {
        let inputs = Tensor3::zeros([2, 1, 3]);
        let err = Batch::new(inputs, vec![1, 2, 3], vec![3, 3], vec![1, 1]).unwrap_err();
        assert!(matches!(err, AppError::Data(_)));
    }

    #[test]
    fn test_input_length_beyond_padding_rejected() {
        let inputs = Tensor3::zeros([1, 1, 3]);
        assert!(Batch::new(inputs, vec![1], vec![4], vec![1]).is_err());
    }

    #[test]
    fn test_split_targets_consumes_exactly() {
        let inputs = Tensor3::zeros([3, 1, 2]);
        let batch = Batch::new(inputs, vec![1, 2, 3, 4, 5, 6], vec![2, 2, 2], vec![1, 3, 2]).unwrap();
        let refs = batch.split_targets().unwrap();
        assert_eq!(refs, vec![&[1][..], &[2, 3, 4][..], &[5, 6][..]]);
        let consumed: usize = refs.iter().map(|r| r.len()).sum();
        assert_eq!(consumed, batch.targets.len());
    }

    #[test]
    fn test_split_targets_detects_tampering() {
        let inputs = Tensor3::zeros([1, 1, 2]);
        let mut batch = Batch::new(inputs, vec![1, 2], vec![2], vec![2]).unwrap();
        batch.targets.push(9);
        assert!(batch.split_targets().is_err());
        batch.targets.truncate(1);
        assert!(batch.split_targets().is_err());
    }
}

//! CTC greedy (best-path) decoder.
//!
//! Turns per-frame probability distributions into text: argmax per frame, collapse
//! repeats, drop blanks, map through the vocabulary. The frame index of every kept
//! symbol is reported alongside the text.

use crate::asr::types::{Vocabulary, BLANK_INDEX};
use crate::error::{AppError, Result};
use crate::tensor::Tensor3;
use std::sync::Arc;

/// Greedy decoder over a shared vocabulary.
#[derive(Debug, Clone)]
pub struct GreedyDecoder {
    vocabulary: Arc<Vocabulary>,
}

impl GreedyDecoder {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Decode a batch of probabilities laid out as (batch, time, vocabulary).
    ///
    /// Only the first `lengths[b]` frames of example `b` are read.
    ///
    /// # Returns
    /// One string per example and, for each, the frame offsets of the kept symbols.
    pub fn decode(
        &self,
        probabilities: &Tensor3,
        lengths: &[usize],
    ) -> Result<(Vec<String>, Vec<Vec<usize>>)> {
        let [batch, frames, classes] = probabilities.dims();
        if lengths.len() != batch {
            return Err(AppError::Data(format!(
                "{} lengths for a batch of {}",
                lengths.len(),
                batch
            )));
        }
        if classes != self.vocabulary.len() {
            return Err(AppError::Model(format!(
                "decoder expects {} classes, probabilities carry {}",
                self.vocabulary.len(),
                classes
            )));
        }

        let mut texts = Vec::with_capacity(batch);
        let mut offsets = Vec::with_capacity(batch);
        for (b, &len) in lengths.iter().enumerate() {
            if len > frames {
                return Err(AppError::Data(format!(
                    "example {} claims {} frames, tensor holds {}",
                    b, len, frames
                )));
            }
            let best_path: Vec<usize> = (0..len).map(|t| argmax(probabilities.row(b, t))).collect();
            let (text, frame_offsets) = self.collapse(&best_path)?;
            texts.push(text);
            offsets.push(frame_offsets);
        }
        Ok((texts, offsets))
    }

    /// Collapse a best path: repeated indices become one, blanks are removed.
    pub fn collapse(&self, path: &[usize]) -> Result<(String, Vec<usize>)> {
        let mut text = String::new();
        let mut frame_offsets = Vec::new();
        let mut prev: Option<usize> = None;
        for (t, &id) in path.iter().enumerate() {
            if id != BLANK_INDEX && prev != Some(id) {
                text.push(self.char_for(id)?);
                frame_offsets.push(t);
            }
            prev = Some(id);
        }
        Ok((text, frame_offsets))
    }

    /// Map raw label sequences to text without collapsing or blank removal.
    pub fn convert_to_strings<S: AsRef<[usize]>>(&self, sequences: &[S]) -> Result<Vec<String>> {
        sequences
            .iter()
            .map(|seq| seq.as_ref().iter().map(|&id| self.char_for(id)).collect())
            .collect()
    }

    fn char_for(&self, id: usize) -> Result<char> {
        self.vocabulary.token(id).ok_or_else(|| {
            AppError::Model(format!(
                "label {} outside vocabulary of {}",
                id,
                self.vocabulary.len()
            ))
        })
    }
}

/// Index of the largest value; ties go to the lowest index.
fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(idx_max, val_max), (idx, &val)| {
            if val > val_max {
                (idx, val)
            } else {
                (idx_max, val_max)
            }
        })
        .0
}

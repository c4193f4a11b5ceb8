//! Core ASR functionality.
//!
//! This module contains the vocabulary, audio front end, greedy decoder and
//! edit-distance scoring used by training and evaluation.

pub mod audio;
mod decoder;
pub mod scoring;
pub mod types;

pub use audio::{load_wav, FeatureMatrix, Spectrogram};
pub use decoder::GreedyDecoder;
pub use scoring::cer;
pub use types::{Vocabulary, BLANK_INDEX};

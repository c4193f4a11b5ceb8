//! Domain constants for the trainer.
//!
//! This module contains compile-time constants used throughout the application.
//! These are separated from runtime configuration to provide clear distinction
//! between values that never change and those that can be configured.

/// Audio feature extraction constants.
pub mod audio {
    /// Sample rate every training clip must have.
    pub const SAMPLE_RATE: u32 = 16000;

    /// STFT size in samples (20 ms at 16 kHz).
    pub const N_FFT: usize = 320;

    /// Analysis window length in samples.
    pub const WIN_LENGTH: usize = 320;

    /// Hop between frames in samples (10 ms at 16 kHz).
    pub const HOP_LENGTH: usize = 160;

    /// Spectrogram channels produced per frame.
    pub const FEATURE_DIM: usize = N_FFT / 2 + 1;

    /// Floor for the per-utterance standard deviation during normalization.
    pub const NORM_EPSILON: f32 = 1e-5;
}

/// Training loop constants.
pub mod training {
    /// Steps between progress lines and `loss/step` records.
    pub const LOG_INTERVAL: usize = 100;

    /// Added to the gradient norm before computing the clip coefficient.
    pub const CLIP_EPSILON: f64 = 1e-6;
}

/// Scalar metric tags.
pub mod tags {
    pub const LR_EPOCH: &str = "lr/epoch";
    pub const LOSS_STEP: &str = "loss/step";
    pub const LOSS_EPOCH: &str = "loss/epoch";
    pub const CER_EPOCH: &str = "cer/epoch";
}

/// Checkpoint and output file naming.
pub mod files {
    /// Checkpoint format version written into every file.
    pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

    /// Checkpoint file name prefix; the epoch index follows.
    pub const CHECKPOINT_PREFIX: &str = "model_";

    /// Checkpoint file extension.
    pub const CHECKPOINT_EXTENSION: &str = "json";

    /// Prometheus textfile rendered after every epoch.
    pub const METRICS_TEXTFILE: &str = "metrics.prom";

    /// JSON-lines scalar log.
    pub const SCALARS_FILE: &str = "scalars.jsonl";
}

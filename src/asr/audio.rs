//! Audio loading and spectrogram features.
//!
//! Clips are read from WAV, checked for the training sample rate, and turned into
//! log-magnitude STFT features (`FEATURE_DIM` channels × frames) normalized per
//! utterance.

use crate::constants::audio::{
    FEATURE_DIM, HOP_LENGTH, NORM_EPSILON, N_FFT, SAMPLE_RATE, WIN_LENGTH,
};
use crate::error::{AppError, Result};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Read a mono WAV file as f32 samples in [-1, 1].
pub fn load_wav(path: impl AsRef<Path>) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.sample_rate != SAMPLE_RATE {
        return Err(AppError::Audio(format!(
            "{}: sample rate {} Hz, expected {} Hz",
            path.display(),
            spec.sample_rate,
            SAMPLE_RATE
        )));
    }
    if spec.channels != 1 {
        return Err(AppError::Audio(format!(
            "{}: {} channels, expected mono",
            path.display(),
            spec.channels
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    debug!("Loaded {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

/// Features for one utterance, channel-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub channels: usize,
    pub frames: usize,
    /// `channels * frames` values; channel `c`, frame `t` at `c * frames + t`.
    pub data: Vec<f32>,
}

/// Log-magnitude STFT front end with a planned FFT and a cached window.
pub struct Spectrogram {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl std::fmt::Debug for Spectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spectrogram")
            .field("n_fft", &N_FFT)
            .field("hop_length", &HOP_LENGTH)
            .finish()
    }
}

impl Default for Spectrogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Spectrogram {
    pub fn new() -> Self {
        Self {
            fft: FftPlanner::<f32>::new().plan_fft_forward(N_FFT),
            window: hamming_window(WIN_LENGTH),
        }
    }

    /// Compute normalized `ln(1 + |STFT|)` features.
    ///
    /// Frames are centered: the signal is reflect-padded by `N_FFT / 2` on both
    /// sides, giving `1 + len / HOP_LENGTH` frames.
    pub fn compute(&self, samples: &[f32]) -> Result<FeatureMatrix> {
        if samples.is_empty() {
            return Err(AppError::Audio("empty audio clip".to_string()));
        }

        let padded = reflect_pad(samples, N_FFT / 2);
        let frames = 1 + (padded.len() - N_FFT) / HOP_LENGTH;
        let mut data = vec![0.0f32; FEATURE_DIM * frames];
        let mut buf = vec![Complex::new(0.0f32, 0.0); N_FFT];

        for frame in 0..frames {
            let start = frame * HOP_LENGTH;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buf);
            for (c, bin) in buf.iter().take(FEATURE_DIM).enumerate() {
                data[c * frames + frame] = bin.norm().ln_1p();
            }
        }

        normalize_in_place(&mut data);
        Ok(FeatureMatrix {
            channels: FEATURE_DIM,
            frames,
            data,
        })
    }
}

/// Periodic Hamming window.
fn hamming_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f32 / len as f32).cos())
        .collect()
}

/// Mirror-pad without repeating the edge sample, reflecting repeatedly for short clips.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len() as isize;
    let reflect = |mut i: isize| -> usize {
        if n == 1 {
            return 0;
        }
        let period = 2 * (n - 1);
        i = i.rem_euclid(period);
        if i >= n {
            i = period - i;
        }
        i as usize
    };

    (-(pad as isize)..n + pad as isize)
        .map(|i| samples[reflect(i)])
        .collect()
}

fn normalize_in_place(data: &mut [f32]) {
    let n = data.len() as f32;
    let mean = data.iter().sum::<f32>() / n;
    let var = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let std = var.sqrt().max(NORM_EPSILON);
    for v in data.iter_mut() {
        *v = (*v - mean) / std;
    }
}

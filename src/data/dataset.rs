//! Example sources: manifest-backed audio datasets and in-memory fixtures.

use crate::asr::{load_wav, FeatureMatrix, Spectrogram, Vocabulary};
use crate::data::batch::Example;
use crate::error::{AppError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Random-access collection of labelled utterances.
pub trait ExampleSource: Send + Sync {
    /// Number of examples.
    fn len(&self) -> usize;

    /// Load example `index`, computing features if needed.
    fn get(&self, index: usize) -> Result<Example>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub audio_path: PathBuf,
    pub transcript: String,
}

/// Parse `<audio_path>,<transcript>` lines; the first comma splits the fields.
pub fn parse_manifest(content: &str) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (path, transcript) = line.split_once(',').ok_or_else(|| {
            AppError::Manifest(format!(
                "line {}: expected '<audio_path>,<transcript>'",
                line_no + 1
            ))
        })?;
        let path = path.trim();
        if path.is_empty() {
            return Err(AppError::Manifest(format!(
                "line {}: empty audio path",
                line_no + 1
            )));
        }
        entries.push(ManifestEntry {
            audio_path: PathBuf::from(path),
            transcript: transcript.trim().to_string(),
        });
    }
    Ok(entries)
}

/// Dataset described by a manifest file; audio is decoded lazily per example.
#[derive(Debug)]
pub struct ManifestDataset {
    entries: Vec<ManifestEntry>,
    vocabulary: Arc<Vocabulary>,
    spectrogram: Spectrogram,
}

impl ManifestDataset {
    /// Read and validate the manifest at `path`.
    pub fn load(path: impl AsRef<Path>, vocabulary: Arc<Vocabulary>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::Manifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        let entries = parse_manifest(&content)?;
        if entries.is_empty() {
            return Err(AppError::Manifest(format!(
                "{} lists no examples",
                path.display()
            )));
        }
        info!("Loaded manifest {} with {} examples", path.display(), entries.len());
        Ok(Self::from_entries(entries, vocabulary))
    }

    pub fn from_entries(entries: Vec<ManifestEntry>, vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            entries,
            vocabulary,
            spectrogram: Spectrogram::new(),
        }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }
}

impl ExampleSource for ManifestDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        let entry = self.entries.get(index).ok_or_else(|| {
            AppError::Data(format!(
                "example {} out of range ({} examples)",
                index,
                self.entries.len()
            ))
        })?;
        let samples = load_wav(&entry.audio_path)?;
        let features = self.spectrogram.compute(&samples)?;
        let labels = self.vocabulary.encode(&entry.transcript);
        debug!(
            "Example {}: {} frames, {} labels",
            index,
            features.frames,
            labels.len()
        );
        Ok(Example { features, labels })
    }
}

/// Precomputed examples held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    examples: Vec<Example>,
}

impl InMemoryDataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Build from `(features, labels)` pairs with a fixed channel count.
    pub fn from_pairs(channels: usize, pairs: Vec<(Vec<f32>, Vec<usize>)>) -> Result<Self> {
        let examples = pairs
            .into_iter()
            .map(|(data, labels)| {
                if channels == 0 || data.len() % channels != 0 || data.is_empty() {
                    return Err(AppError::Data(format!(
                        "{} feature values do not split into {} channels",
                        data.len(),
                        channels
                    )));
                }
                Ok(Example {
                    features: FeatureMatrix {
                        channels,
                        frames: data.len() / channels,
                        data,
                    },
                    labels,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { examples })
    }
}

impl ExampleSource for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        self.examples
            .get(index)
            .cloned()
            .ok_or_else(|| AppError::Data(format!("example {} out of range", index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_splits_on_first_comma() {
        let entries = parse_manifest("a.wav,hello, world\r\n\nb.wav,你好\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].audio_path, PathBuf::from("a.wav"));
        assert_eq!(entries[0].transcript, "hello, world");
        assert_eq!(entries[1].transcript, "你好");
    }

    #[test]
    fn test_parse_manifest_rejects_missing_separator() {
        let err = parse_manifest("a.wav,ok\nbroken line\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_empty_manifest_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.dev");
        fs::write(&path, "\n\n").unwrap();
        let vocab = Arc::new(Vocabulary::from_tokens(["_", "a"]).unwrap());
        assert!(matches!(
            ManifestDataset::load(&path, vocab),
            Err(AppError::Manifest(_))
        ));
    }

    #[test]
    fn test_manifest_dataset_loads_audio_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("clip.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav, spec).unwrap();
        for i in 0..1600 {
            writer.write_sample(((i % 50) * 200) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let vocab = Arc::new(Vocabulary::from_tokens(["_", "a", "b"]).unwrap());
        let dataset = ManifestDataset::from_entries(
            vec![ManifestEntry {
                audio_path: wav,
                transcript: "ab_xa".to_string(),
            }],
            vocab,
        );
        let example = dataset.get(0).unwrap();
        assert_eq!(example.labels, vec![1, 2, 1]);
        assert_eq!(example.features.frames, 11);
        assert!(dataset.get(1).is_err());
    }

    #[test]
    fn test_in_memory_from_pairs_validates_shape() {
        assert!(InMemoryDataset::from_pairs(2, vec![(vec![0.0; 3], vec![1])]).is_err());
        let ds = InMemoryDataset::from_pairs(2, vec![(vec![0.0; 4], vec![1])]).unwrap();
        assert_eq!(ds.get(0).unwrap().features.frames, 2);
    }
}

//! End-to-end training runs over WAV manifests written to a temp directory.

use std::f32::consts::PI;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use amira_asr_trainer::{
    asr::Vocabulary,
    backend::CpuBackend,
    config::TrainConfig,
    constants::audio::{FEATURE_DIM, SAMPLE_RATE},
    data::{BatchLoader, LoaderOptions, ManifestDataset},
    error::AppError,
    model::{CtcLoss, Encoder, GatedConvEncoder, GatedConvOptions},
    telemetry::{MemorySink, MetricsWriter, ScalarRecord},
    train::{checkpoint_path, Checkpoint, Trainer},
};
use tempfile::TempDir;

struct Corpus {
    dir: TempDir,
    vocabulary: Arc<Vocabulary>,
}

impl Corpus {
    /// Tone clips: "a" is 440 Hz, "b" is 1200 Hz, "ab" is one then the other.
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let vocab_path = dir.path().join("vocab.json");
        fs::write(&vocab_path, r#"["_", "a", "b"]"#).unwrap();
        let vocabulary = Arc::new(Vocabulary::load_from_file(&vocab_path).unwrap());

        let clips: [(&str, &[f32]); 4] = [
            ("a", &[440.0]),
            ("b", &[1200.0]),
            ("ab", &[440.0, 1200.0]),
            ("ba", &[1200.0, 440.0]),
        ];
        let mut lines = Vec::new();
        for (i, (text, tones)) in clips.iter().enumerate() {
            let wav = dir.path().join(format!("clip_{}.wav", i));
            write_tones(&wav, tones);
            lines.push(format!("{},{}", wav.display(), text));
        }
        fs::write(dir.path().join("manifest.train"), lines.join("\n")).unwrap();
        fs::write(dir.path().join("manifest.dev"), lines[..2].join("\n")).unwrap();

        Self { dir, vocabulary }
    }

    fn config(&self, epochs: usize) -> TrainConfig {
        TrainConfig {
            train_manifest_path: self.dir.path().join("manifest.train"),
            dev_manifest_path: self.dir.path().join("manifest.dev"),
            vocab_path: self.dir.path().join("vocab.json"),
            save_model_path: self.dir.path().join("save_model"),
            epochs,
            batch_size: 2,
            num_workers: 2,
            prefetch: 1,
            kernel_size: 3,
            dropout: 0.1,
            seed: 5,
            ..TrainConfig::default()
        }
    }

    fn loader(&self, manifest: &Path, config: &TrainConfig) -> BatchLoader<ManifestDataset> {
        let dataset = ManifestDataset::load(manifest, self.vocabulary.clone()).unwrap();
        BatchLoader::new(
            Arc::new(dataset),
            LoaderOptions {
                batch_size: config.batch_size,
                num_workers: config.num_workers,
                prefetch: config.prefetch,
                seed: config.seed,
            },
        )
        .unwrap()
    }

    fn encoder(&self, config: &TrainConfig) -> GatedConvEncoder {
        GatedConvEncoder::new(GatedConvOptions {
            in_channels: FEATURE_DIM,
            num_classes: self.vocabulary.len(),
            kernel_size: config.kernel_size,
            dropout: config.dropout,
            seed: config.seed,
        })
        .unwrap()
    }

    fn trainer<'a>(&self, config: &'a TrainConfig) -> Trainer<'a> {
        Trainer::new(
            config,
            self.vocabulary.clone(),
            Arc::new(CpuBackend),
            Box::new(CtcLoss::default()),
        )
        .unwrap()
    }
}

/// 0.15 s per tone, 16-bit mono.
fn write_tones(path: &Path, tones: &[f32]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let per_tone = (SAMPLE_RATE as f32 * 0.15) as usize;
    for &freq in tones {
        for n in 0..per_tone {
            let t = n as f32 / SAMPLE_RATE as f32;
            let v = (2.0 * PI * freq * t).sin() * 0.5;
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
    }
    writer.finalize().unwrap();
}

#[test]
fn full_run_writes_checkpoints_and_scalars() {
    let corpus = Corpus::new();
    let config = corpus.config(2);
    let train = corpus.loader(&config.train_manifest_path, &config);
    let dev = corpus.loader(&config.dev_manifest_path, &config);
    let mut model = corpus.encoder(&config);

    let mut sink = MetricsWriter::new(&config.save_model_path).unwrap();
    let summaries = corpus
        .trainer(&config)
        .run(&mut model, &train, &dev, &mut sink)
        .unwrap();

    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert!(summary.mean_loss.is_finite() && summary.mean_loss > 0.0);
        assert!(summary.cer >= 0.0);
        let saved = Checkpoint::load(&summary.checkpoint).unwrap();
        assert_eq!(saved.epoch, summary.epoch);
        assert_eq!(saved.vocabulary, vec!["_", "a", "b"]);
    }
    let last = Checkpoint::load(&summaries[1].checkpoint).unwrap();
    assert_eq!(last.encoder, model.state_dict());

    let log = fs::read_to_string(config.save_model_path.join("scalars.jsonl")).unwrap();
    let records: Vec<ScalarRecord> = log
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    // Per epoch: lr/epoch, one loss/step (step 0), loss/epoch, cer/epoch.
    assert_eq!(records.len(), 8);
    assert_eq!(records[0].tag, "lr/epoch");
    assert_eq!(records[1].tag, "loss/step");
    assert!(config.save_model_path.join("metrics.prom").is_file());
}

#[test]
fn resume_continues_after_saved_epoch() {
    let corpus = Corpus::new();
    let first = corpus.config(1);
    let train = corpus.loader(&first.train_manifest_path, &first);
    let dev = corpus.loader(&first.dev_manifest_path, &first);

    let mut model = corpus.encoder(&first);
    corpus
        .trainer(&first)
        .run(&mut model, &train, &dev, &mut MemorySink::default())
        .unwrap();
    let saved = checkpoint_path(&first.save_model_path, 0);
    let saved_bytes = fs::read(&saved).unwrap();

    let second = TrainConfig {
        restore_model: Some(saved.clone()),
        ..corpus.config(3)
    };
    let mut resumed = corpus.encoder(&TrainConfig {
        seed: 99,
        ..second.clone()
    });
    let mut trainer = corpus.trainer(&second);
    assert_eq!(trainer.resume(&saved, &mut resumed).unwrap(), 1);
    assert_eq!(resumed.state_dict(), model.state_dict());

    let mut sink = MemorySink::default();
    let summaries = trainer.run(&mut resumed, &train, &dev, &mut sink).unwrap();
    let epochs: Vec<usize> = summaries.iter().map(|s| s.epoch).collect();
    assert_eq!(epochs, vec![1, 2]);
    assert_eq!(sink.series("lr/epoch"), vec![(1, 0.6), (2, 0.6)]);
    assert_eq!(fs::read(&saved).unwrap(), saved_bytes);
    assert!(checkpoint_path(&second.save_model_path, 2).is_file());
}

#[test]
fn existing_checkpoint_is_never_overwritten() {
    let corpus = Corpus::new();
    let config = corpus.config(1);
    let train = corpus.loader(&config.train_manifest_path, &config);
    let dev = corpus.loader(&config.dev_manifest_path, &config);

    corpus
        .trainer(&config)
        .run(&mut corpus.encoder(&config), &train, &dev, &mut MemorySink::default())
        .unwrap();
    let saved = checkpoint_path(&config.save_model_path, 0);
    let saved_bytes = fs::read(&saved).unwrap();

    let mut sink = MemorySink::default();
    let err = corpus
        .trainer(&config)
        .run(&mut corpus.encoder(&config), &train, &dev, &mut sink)
        .unwrap_err();
    assert!(matches!(err, AppError::Checkpoint(_)));
    assert!(sink.series("lr/epoch").is_empty());
    assert!(sink.series("loss/step").is_empty());
    assert_eq!(fs::read(&saved).unwrap(), saved_bytes);
}

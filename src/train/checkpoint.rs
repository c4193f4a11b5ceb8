//! Per-epoch model checkpoints.
//!
//! One JSON file per epoch, `model_<epoch>.json`. Files are created exclusively,
//! so an existing checkpoint is never replaced.

use crate::asr::Vocabulary;
use crate::constants::files::{CHECKPOINT_EXTENSION, CHECKPOINT_FORMAT_VERSION, CHECKPOINT_PREFIX};
use crate::error::{AppError, ErrorContext, Result};
use crate::model::{Encoder, StateDict};
use crate::train::optim::{Sgd, SgdState};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Snapshot of everything needed to continue training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub epoch: usize,
    pub vocabulary: Vec<String>,
    pub encoder: StateDict,
    pub optimizer: SgdState,
}

/// `<dir>/model_<epoch>.json`
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{}{}.{}", CHECKPOINT_PREFIX, epoch, CHECKPOINT_EXTENSION))
}

impl Checkpoint {
    pub fn capture<E: Encoder + ?Sized>(
        epoch: usize,
        vocabulary: &Vocabulary,
        encoder: &E,
        optimizer: &Sgd,
    ) -> Self {
        Self {
            version: CHECKPOINT_FORMAT_VERSION,
            epoch,
            vocabulary: vocabulary.to_strings(),
            encoder: encoder.state_dict(),
            optimizer: optimizer.state(),
        }
    }

    /// Write to `dir`, creating it if needed. Fails if the file already exists.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = checkpoint_path(dir, self.epoch);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(AppError::Checkpoint(format!(
                    "{} already exists; refusing to overwrite",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer
            .flush()
            .with_context(|| format!("flushing checkpoint {}", path.display()))?;
        info!("Saved checkpoint {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            AppError::Checkpoint(format!("cannot open {}: {}", path.display(), e))
        })?;
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file))?;
        if checkpoint.version != CHECKPOINT_FORMAT_VERSION {
            return Err(AppError::Checkpoint(format!(
                "{} has format version {}, expected {}",
                path.display(),
                checkpoint.version,
                CHECKPOINT_FORMAT_VERSION
            )));
        }
        Ok(checkpoint)
    }

    /// Load parameters and optimizer state into a live model.
    ///
    /// The checkpoint must have been written with the same vocabulary.
    pub fn restore<E: Encoder + ?Sized>(
        &self,
        vocabulary: &Vocabulary,
        encoder: &mut E,
        optimizer: &mut Sgd,
    ) -> Result<()> {
        if self.vocabulary != vocabulary.to_strings() {
            return Err(AppError::Checkpoint(format!(
                "checkpoint vocabulary has {} tokens and differs from the configured {}",
                self.vocabulary.len(),
                vocabulary.len()
            )));
        }
        encoder.load_state_dict(&self.encoder)?;
        optimizer.load_state(self.optimizer.clone());
        Ok(())
    }
}

//! The epoch/step training loop.

use crate::asr::{GreedyDecoder, Vocabulary};
use crate::backend::TensorBackend;
use crate::config::TrainConfig;
use crate::constants::tags;
use crate::data::{Batch, BatchOrder, BatchSource};
use crate::error::{AppError, Result};
use crate::model::{AlignmentLoss, Encoder, LossOutput, Mode};
use crate::telemetry::ScalarSink;
use crate::train::checkpoint::{checkpoint_path, Checkpoint};
use crate::train::evaluator::Evaluator;
use crate::train::optim::{clip_grad_norm, Sgd, SgdOptions};
use crate::train::progress::{epoch_line, remaining_time, step_line};
use metrics::{counter, histogram};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one completed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f64,
    /// Sum of step losses divided by the number of batches per epoch.
    pub mean_loss: f64,
    pub cer: f64,
    pub checkpoint: PathBuf,
}

/// Owns the optimizer and progress counters for one training run.
pub struct Trainer<'a> {
    config: &'a TrainConfig,
    vocabulary: Arc<Vocabulary>,
    backend: Arc<dyn TensorBackend>,
    loss: Box<dyn AlignmentLoss>,
    optimizer: Sgd,
    evaluator: Evaluator,
    start_epoch: usize,
    global_step: u64,
}

impl<'a> Trainer<'a> {
    pub fn new(
        config: &'a TrainConfig,
        vocabulary: Arc<Vocabulary>,
        backend: Arc<dyn TensorBackend>,
        loss: Box<dyn AlignmentLoss>,
    ) -> Result<Self> {
        let optimizer = Sgd::new(SgdOptions {
            learning_rate: config.learning_rate,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
            nesterov: true,
        })?;
        let evaluator = Evaluator::new(GreedyDecoder::new(vocabulary.clone()), backend.clone());
        Ok(Self {
            config,
            vocabulary,
            backend,
            loss,
            optimizer,
            evaluator,
            start_epoch: 0,
            global_step: 0,
        })
    }

    /// First epoch `run` will train.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    /// Load a checkpoint into `model` and the optimizer; training continues
    /// with the epoch after the saved one.
    pub fn resume<E: Encoder + ?Sized>(&mut self, path: &Path, model: &mut E) -> Result<usize> {
        let checkpoint = Checkpoint::load(path)?;
        checkpoint.restore(&self.vocabulary, model, &mut self.optimizer)?;
        self.start_epoch = checkpoint.epoch + 1;
        info!(
            "Restored {} (epoch {}); resuming at epoch {}",
            path.display(),
            checkpoint.epoch,
            self.start_epoch
        );
        if self.start_epoch >= self.config.epochs {
            warn!(
                "Checkpoint epoch {} already reaches the configured {} epochs",
                checkpoint.epoch, self.config.epochs
            );
        }
        Ok(self.start_epoch)
    }

    /// Train from the start epoch through `config.epochs - 1`, evaluating and
    /// checkpointing after every epoch. Any error ends the run.
    pub fn run<E: Encoder + ?Sized>(
        &mut self,
        model: &mut E,
        train: &dyn BatchSource,
        dev: &dyn BatchSource,
        sink: &mut dyn ScalarSink,
    ) -> Result<Vec<EpochSummary>> {
        if model.num_classes() != self.vocabulary.len() {
            return Err(AppError::Config(format!(
                "encoder predicts {} classes but the vocabulary has {} tokens",
                model.num_classes(),
                self.vocabulary.len()
            )));
        }
        let batches = train.num_batches();
        if batches == 0 {
            return Err(AppError::Data("training set is empty".to_string()));
        }

        let epochs = self.config.epochs;
        self.check_checkpoint_slots()?;
        info!(
            "Training epochs {}..{} with {} batches per epoch on {}",
            self.start_epoch,
            epochs,
            batches,
            self.backend.name()
        );

        let mut summaries = Vec::with_capacity(epochs.saturating_sub(self.start_epoch));
        for epoch in self.start_epoch..epochs {
            let summary = self.run_epoch(epoch, batches, model, train, dev, sink)?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Fail before training if any epoch in the run already has a checkpoint.
    fn check_checkpoint_slots(&self) -> Result<()> {
        let dir = &self.config.save_model_path;
        match (self.start_epoch..self.config.epochs)
            .map(|epoch| checkpoint_path(dir, epoch))
            .find(|path| path.exists())
        {
            Some(path) => Err(AppError::Checkpoint(format!(
                "{} already exists; restore from it or choose another output directory",
                path.display()
            ))),
            None => Ok(()),
        }
    }

    fn run_epoch<E: Encoder + ?Sized>(
        &mut self,
        epoch: usize,
        batches: usize,
        model: &mut E,
        train: &dyn BatchSource,
        dev: &dyn BatchSource,
        sink: &mut dyn ScalarSink,
    ) -> Result<EpochSummary> {
        let epochs = self.config.epochs;
        let epoch_start = Instant::now();

        let order = if epoch == 0 {
            BatchOrder::Sequential
        } else {
            BatchOrder::Shuffled
        };
        let learning_rate = self
            .config
            .lr_schedule
            .learning_rate(self.config.learning_rate, epoch);
        self.optimizer.set_learning_rate(learning_rate);
        sink.add_scalar(tags::LR_EPOCH, learning_rate, epoch as u64)?;

        model.set_mode(Mode::Training);
        let mut loss_sum = 0.0f64;
        for (i, batch) in train.batches(order).enumerate() {
            let batch = batch?;
            let step_start = Instant::now();
            let loss = self.step(model, batch)?;
            loss_sum += loss as f64;

            let elapsed = step_start.elapsed();
            counter!("training_steps_total").increment(1);
            histogram!("training_step_duration_seconds").record(elapsed.as_secs_f64());

            if i % self.config.log_interval == 0 {
                sink.add_scalar(tags::LOSS_STEP, loss as f64, self.global_step)?;
                self.global_step += 1;
                let remain = remaining_time(epochs, epoch, batches, i, elapsed);
                println!("{}", step_line(epoch, epochs, i, batches, loss, remain));
            }
        }

        let mean_loss = loss_sum / batches as f64;
        let cer = self.evaluator.evaluate(&mut *model, dev)?;
        sink.add_scalar(tags::LOSS_EPOCH, mean_loss, epoch as u64)?;
        sink.add_scalar(tags::CER_EPOCH, cer, epoch as u64)?;
        println!("{}", epoch_line(epoch, mean_loss, cer));

        let checkpoint = Checkpoint::capture(epoch, &self.vocabulary, &*model, &self.optimizer)
            .save(&self.config.save_model_path)?;
        sink.flush()?;
        info!(
            "Epoch {} done in {:.2?}: loss {:.4}, CER {:.4}",
            epoch,
            epoch_start.elapsed(),
            mean_loss,
            cer
        );

        Ok(EpochSummary {
            epoch,
            learning_rate,
            mean_loss,
            cer,
            checkpoint,
        })
    }

    /// Forward, loss, backward, clip, update. Returns the batch loss.
    fn step<E: Encoder + ?Sized>(&mut self, model: &mut E, batch: Batch) -> Result<f32> {
        let Batch {
            inputs,
            targets,
            input_lengths,
            target_lengths,
        } = batch;

        let inputs = self.backend.to_device(inputs)?;
        let output = model.forward(&inputs, &input_lengths)?;
        // (batch, vocab, time) -> (time, batch, vocab)
        let logits = output.logits.permute([2, 0, 1]);
        let LossOutput { loss, grad } =
            self.loss
                .compute(&logits, &targets, &output.lengths, &target_lengths)?;
        if !loss.is_finite() {
            return Err(AppError::Model(format!("loss is {}", loss)));
        }

        model.zero_grad();
        model.backward(&grad.permute([1, 2, 0]))?;
        let mut params = model.parameters_mut();
        let norm = clip_grad_norm(&mut params, self.config.max_grad_norm);
        self.optimizer.step(&mut params);

        histogram!("training_grad_norm").record(norm);
        debug!("Step loss {:.4}, grad norm {:.4}", loss, norm);
        Ok(loss)
    }
}

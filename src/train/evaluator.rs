//! Validation pass producing the corpus character error rate.

use crate::asr::{cer, GreedyDecoder};
use crate::backend::TensorBackend;
use crate::data::{BatchOrder, BatchSource};
use crate::error::{AppError, Result};
use crate::model::Encoder;
use crate::raii::ModeGuard;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Greedy-decodes a dev set and scores it against the references.
#[derive(Debug)]
pub struct Evaluator {
    decoder: GreedyDecoder,
    backend: Arc<dyn TensorBackend>,
}

impl Evaluator {
    pub fn new(decoder: GreedyDecoder, backend: Arc<dyn TensorBackend>) -> Self {
        Self { decoder, backend }
    }

    /// Mean over every dev example of `edit_distance(hyp, ref) / len(ref)`.
    ///
    /// The encoder runs in inference mode for the whole pass and gets its previous
    /// mode back however the pass ends. Empty references are a data error.
    pub fn evaluate<E: Encoder + ?Sized>(&self, model: &mut E, dev: &dyn BatchSource) -> Result<f64> {
        let examples = dev.num_examples();
        if examples == 0 {
            return Err(AppError::Data("dev set is empty".to_string()));
        }

        let start = Instant::now();
        let model = ModeGuard::inference(model);
        let mut total = 0.0f64;

        for (i, batch) in dev.batches(BatchOrder::Sequential).enumerate() {
            let batch = batch?;
            let references = self.decoder.convert_to_strings(&batch.split_targets()?)?;

            let inputs = self.backend.to_device(batch.inputs)?;
            let output = model.infer(&inputs, &batch.input_lengths)?;
            let probabilities = output.logits.softmax_axis1().permute([0, 2, 1]);
            let (hypotheses, _) = self.decoder.decode(&probabilities, &output.lengths)?;

            for (hyp, reference) in hypotheses.iter().zip(&references) {
                let ref_len = reference.chars().count();
                if ref_len == 0 {
                    return Err(AppError::Data(
                        "dev example has an empty reference transcript".to_string(),
                    ));
                }
                total += cer(hyp, reference) as f64 / ref_len as f64;
            }
            debug!("Evaluated dev batch {} ({} examples)", i, batch.input_lengths.len());
        }

        let score = total / examples as f64;
        info!(
            "Evaluation over {} examples: CER {:.4} in {:.2?}",
            examples,
            score,
            start.elapsed()
        );
        Ok(score)
    }
}

//! Training: optimizer, evaluation, checkpoints and the epoch loop.

pub mod checkpoint;
pub mod evaluator;
pub mod optim;
pub mod progress;
mod trainer;

pub use checkpoint::{checkpoint_path, Checkpoint};
pub use evaluator::Evaluator;
pub use optim::{clip_grad_norm, LrSchedule, Sgd, SgdOptions, SgdState};
pub use trainer::{EpochSummary, Trainer};

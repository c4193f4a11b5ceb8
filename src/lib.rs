//! The `amira_asr_trainer` core library.
//!
//! This crate trains a CTC acoustic model: it streams labelled audio from
//! manifests, runs a convolutional encoder, optimizes the CTC loss with
//! gradient-clipped Nesterov SGD, and after every epoch measures the character
//! error rate of greedy decoding on a dev set and writes a checkpoint.

pub mod asr;
pub mod backend;
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod model;
pub mod raii;
pub mod telemetry;
pub mod tensor;
pub mod train;

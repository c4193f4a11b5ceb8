//! RAII patterns for model state.
//!
//! Switching an encoder into inference mode is a scoped acquisition: the guard
//! records the previous mode and restores it when dropped, whether the scope
//! exits normally, through `?`, or by unwinding.

use crate::model::{Encoder, Mode};
use std::ops::Deref;
use tracing::debug;

/// Holds an encoder in a temporary mode.
///
/// Only shared access is handed out while the guard lives, so the guarded scope
/// can run the encoder but cannot change its parameters.
pub struct ModeGuard<'a, E: Encoder + ?Sized> {
    encoder: &'a mut E,
    previous: Mode,
}

impl<'a, E: Encoder + ?Sized> ModeGuard<'a, E> {
    /// Switch `encoder` to `mode` until the guard is dropped.
    pub fn new(encoder: &'a mut E, mode: Mode) -> Self {
        let previous = encoder.mode();
        encoder.set_mode(mode);
        debug!("Encoder mode {:?} -> {:?}", previous, mode);
        Self { encoder, previous }
    }

    /// Shorthand for an inference-mode scope.
    pub fn inference(encoder: &'a mut E) -> Self {
        Self::new(encoder, Mode::Inference)
    }

    /// Mode that will be restored on drop.
    pub fn previous(&self) -> Mode {
        self.previous
    }
}

impl<E: Encoder + ?Sized> Deref for ModeGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &Self::Target {
        self.encoder
    }
}

impl<E: Encoder + ?Sized> Drop for ModeGuard<'_, E> {
    fn drop(&mut self) {
        self.encoder.set_mode(self.previous);
    }
}

//! Compute-device abstraction.
//!
//! The trainer never talks to a device directly. It hands every input batch to a
//! [`TensorBackend`] before the forward pass; the encoder and loss operate on
//! whatever the backend returns.

use crate::error::Result;
use crate::tensor::Tensor3;
use std::fmt;

/// Capability interface for the device the encoder runs on.
pub trait TensorBackend: Send + Sync + fmt::Debug {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Blocking host-to-device transfer of one input batch.
    fn to_device(&self, host: Tensor3) -> Result<Tensor3>;
}

/// Host execution; transfers are moves.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend;

impl TensorBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn to_device(&self, host: Tensor3) -> Result<Tensor3> {
        Ok(host)
    }
}

/// Resolve a backend from its configured name.
pub fn backend_from_name(name: &str) -> Result<Box<dyn TensorBackend>> {
    match name {
        "cpu" => Ok(Box::new(CpuBackend)),
        other => Err(crate::error::AppError::Config(format!(
            "unknown compute backend '{}' (available: cpu)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_backend_is_identity() {
        let t = Tensor3::from_vec([1, 1, 2], vec![1.0, 2.0]).unwrap();
        let moved = CpuBackend.to_device(t.clone()).unwrap();
        assert_eq!(moved, t);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(backend_from_name("cuda").is_err());
        assert_eq!(backend_from_name("cpu").unwrap().name(), "cpu");
    }
}

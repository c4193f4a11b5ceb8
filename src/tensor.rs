//! Dense host tensors used between the data pipeline, encoder, loss and decoder.
//!
//! Everything the trainer moves around is at most rank 3 and row-major, so a
//! fixed `[usize; 3]` shape over a flat `Vec<f32>` is all that is needed.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};

/// Owned rank-3 tensor in row-major layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor3 {
    dims: [usize; 3],
    data: Vec<f32>,
}

impl Tensor3 {
    /// Zero-filled tensor of the given shape.
    pub fn zeros(dims: [usize; 3]) -> Self {
        Self {
            dims,
            data: vec![0.0; dims.iter().product()],
        }
    }

    /// Wrap existing data, checking that the element count matches the shape.
    pub fn from_vec(dims: [usize; 3], data: Vec<f32>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(AppError::Data(format!(
                "tensor of shape {:?} needs {} elements, got {}",
                dims,
                expected,
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    fn offset(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.dims[1] + j) * self.dims[2] + k
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> f32 {
        self.data[self.offset(i, j, k)]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, k: usize, value: f32) {
        let idx = self.offset(i, j, k);
        self.data[idx] = value;
    }

    /// Contiguous innermost row at `(i, j)`.
    pub fn row(&self, i: usize, j: usize) -> &[f32] {
        let start = self.offset(i, j, 0);
        &self.data[start..start + self.dims[2]]
    }

    pub fn row_mut(&mut self, i: usize, j: usize) -> &mut [f32] {
        let start = self.offset(i, j, 0);
        let len = self.dims[2];
        &mut self.data[start..start + len]
    }

    /// Reorder axes; `axes[n]` names the source axis that becomes axis `n`.
    pub fn permute(&self, axes: [usize; 3]) -> Self {
        let mut sorted = axes;
        sorted.sort_unstable();
        assert_eq!(sorted, [0, 1, 2], "permute axes must be a permutation of 0..3");

        let dims = [self.dims[axes[0]], self.dims[axes[1]], self.dims[axes[2]]];
        let mut out = Self::zeros(dims);
        let mut src = [0usize; 3];
        for a in 0..dims[0] {
            src[axes[0]] = a;
            for b in 0..dims[1] {
                src[axes[1]] = b;
                for c in 0..dims[2] {
                    src[axes[2]] = c;
                    let v = self.get(src[0], src[1], src[2]);
                    out.set(a, b, c, v);
                }
            }
        }
        out
    }

    /// Softmax along axis 1, used on (batch, vocabulary, time) encoder output.
    pub fn softmax_axis1(&self) -> Self {
        let [b_dim, v_dim, t_dim] = self.dims;
        let mut out = self.clone();
        for b in 0..b_dim {
            for t in 0..t_dim {
                let mut max = f32::NEG_INFINITY;
                for v in 0..v_dim {
                    max = max.max(self.get(b, v, t));
                }
                let mut sum = 0.0f32;
                for v in 0..v_dim {
                    let e = (self.get(b, v, t) - max).exp();
                    out.set(b, v, t, e);
                    sum += e;
                }
                for v in 0..v_dim {
                    let p = out.get(b, v, t) / sum;
                    out.set(b, v, t, p);
                }
            }
        }
        out
    }
}

/// Log-softmax of `row` written into `out`.
pub fn log_softmax_row(row: &[f32], out: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    let log_norm = max + sum.ln();
    for (o, &x) in out.iter_mut().zip(row) {
        *o = x - log_norm;
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MomentumContrast — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Row-major dense tensors sized for contrastive-learning workloads.
//!
//! The surface is deliberately small: the momentum-contrast learner needs
//! matmul, transposition, row normalisation, row softmax and scaled
//! accumulation, and nothing here should allocate behind the caller's back.

use mc_config::determinism;
use rand::distributions::{Distribution, Uniform};
use rand_distr::StandardNormal;
use thiserror::Error;

/// Errors surfaced by tensor constructors and operators.
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    #[error("invalid tensor dimensions: {rows}x{cols}")]
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the tensor shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("shape mismatch: left={left:?}, right={right:?}")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// A scalar argument violated its domain (temperature, bounds, ...).
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
    /// Attempted to load a parameter missing from a state dictionary.
    #[error("missing parameter: {name}")]
    MissingParameter { name: String },
}

pub type TensorResult<T> = Result<T, TensorError>;

/// A simple row-major 2-D tensor backed by a plain `Vec<f32>`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn checked(rows: usize, cols: usize, data: Vec<f32>) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self { data, rows, cols })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> TensorResult<Self> {
        Self::checked(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> TensorResult<Self> {
        Self::checked(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> TensorResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::checked(rows, cols, data)
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise entropy from the host is used.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = determinism::rng_from_optional(seed, "mc-tensor/uniform");
        let distribution = Uniform::new(min, max);
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            data.push(distribution.sample(&mut rng));
        }
        Self::checked(rows, cols, data)
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = determinism::rng_from_optional(seed, "mc-tensor/normal");
        let gaussian = StandardNormal;
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            let sample: f64 = gaussian.sample(&mut rng);
            data.push(mean + std * sample as f32);
        }
        Self::checked(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Returns `true` when the tensor holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immutable view of the underlying row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the underlying row-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Immutable view of a single row.
    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.cols;
        &self.data[start..start + self.cols]
    }

    /// Standard matrix multiplication: `(m x k) . (k x n) -> (m x n)`.
    pub fn matmul(&self, other: &Tensor) -> TensorResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        for i in 0..self.rows {
            for k in 0..self.cols {
                let lhs = self.data[i * self.cols + k];
                if lhs == 0.0 {
                    continue;
                }
                let row = &other.data[k * other.cols..(k + 1) * other.cols];
                let dst = &mut out[i * other.cols..(i + 1) * other.cols];
                for (d, r) in dst.iter_mut().zip(row.iter()) {
                    *d += lhs * r;
                }
            }
        }
        Tensor::from_vec(self.rows, other.cols, out)
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns a copy scaled by the provided factor.
    pub fn scale(&self, value: f32) -> TensorResult<Tensor> {
        let data = self.data.iter().map(|v| v * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// In-place `self += other * scale`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> TensorResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += src * scale;
        }
        Ok(())
    }

    /// Adds a bias row to every row of the tensor.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> TensorResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_exact_mut(self.cols) {
            for (dst, b) in row.iter_mut().zip(bias.iter()) {
                *dst += b;
            }
        }
        Ok(())
    }

    /// Column sums, returned as a plain vector of length `cols`.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.cols];
        for row in self.data.chunks_exact(self.cols) {
            for (dst, v) in sums.iter_mut().zip(row.iter()) {
                *dst += v;
            }
        }
        sums
    }

    /// Numerically stable softmax applied independently to every row.
    pub fn row_softmax(&self) -> TensorResult<Tensor> {
        let mut data = Vec::with_capacity(self.len());
        for row in self.data.chunks_exact(self.cols) {
            let max = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            let mut sum = 0.0f64;
            let start = data.len();
            for &v in row {
                let e = ((v - max) as f64).exp();
                sum += e;
                data.push(e as f32);
            }
            if sum <= 0.0 || !sum.is_finite() {
                return Err(TensorError::InvalidValue {
                    label: "row_softmax_sum",
                });
            }
            let inv = (1.0 / sum) as f32;
            for v in &mut data[start..] {
                *v *= inv;
            }
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// L2-normalises every row, returning the unit-row tensor together with
    /// the original row norms (clamped away from zero) for backward passes.
    pub fn l2_normalize_rows(&self) -> (Tensor, Vec<f32>) {
        let mut data = Vec::with_capacity(self.len());
        let mut norms = Vec::with_capacity(self.rows);
        for row in self.data.chunks_exact(self.cols) {
            let norm = row
                .iter()
                .map(|&v| (v as f64).powi(2))
                .sum::<f64>()
                .sqrt() as f32;
            let norm = norm.max(f32::EPSILON);
            norms.push(norm);
            data.extend(row.iter().map(|&v| v / norm));
        }
        let normalized = Tensor {
            data,
            rows: self.rows,
            cols: self.cols,
        };
        (normalized, norms)
    }

    /// Squared L2 norm over every element.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_length_mismatch() {
        let err = Tensor::from_vec(2, 3, vec![0.0; 5]).unwrap_err();
        assert_eq!(
            err,
            TensorError::DataLength {
                expected: 6,
                got: 5
            }
        );
    }

    #[test]
    fn matmul_matches_manual() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn transpose_round_trips() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let back = a.transpose().transpose();
        assert_eq!(a, back);
    }

    #[test]
    fn row_softmax_rows_sum_to_one() {
        let logits = Tensor::from_vec(2, 3, vec![0.1, 2.0, -1.0, 5.0, 5.0, 5.0]).unwrap();
        let probs = logits.row_softmax().unwrap();
        for r in 0..2 {
            let sum: f32 = probs.row(r).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!((probs.row(1)[0] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_rows_produces_unit_rows() {
        let raw = Tensor::from_vec(2, 2, vec![3.0, 4.0, 0.0, 2.0]).unwrap();
        let (unit, norms) = raw.l2_normalize_rows();
        assert!((norms[0] - 5.0).abs() < 1e-6);
        assert!((norms[1] - 2.0).abs() < 1e-6);
        assert!((unit.row(0)[0] - 0.6).abs() < 1e-6);
        assert!((unit.row(0)[1] - 0.8).abs() < 1e-6);
        let norm: f32 = unit.row(1).iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn add_scaled_accumulates() {
        let mut acc = Tensor::zeros(1, 3).unwrap();
        let update = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        acc.add_scaled(&update, 2.0).unwrap();
        assert_eq!(acc.data(), &[2.0, -4.0, 1.0]);
    }

    #[test]
    fn random_normal_is_reproducible_with_seed() {
        let a = Tensor::random_normal(4, 4, 0.0, 1.0, Some(7)).unwrap();
        let b = Tensor::random_normal(4, 4, 0.0, 1.0, Some(7)).unwrap();
        assert_eq!(a, b);
    }
}

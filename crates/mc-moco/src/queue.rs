use crate::{MocoError, Result};
use mc_config::determinism;
use mc_tensor::Tensor;
use rand::Rng;
use rand_distr::StandardNormal;

/// Fixed-capacity rolling buffer of key embeddings, stored as a dense
/// `dim x capacity` matrix with a circular write pointer.
///
/// Storage is allocated once at construction; enqueues overwrite columns in
/// place and never grow the buffer. One instance serves training, a second
/// fully separate instance serves validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NegativeQueue {
    data: Vec<f32>,
    dim: usize,
    capacity: usize,
    ptr: usize,
}

impl NegativeQueue {
    /// Creates a queue of `capacity` unit-normal columns, L2-normalised
    /// column-wise. The same `(seed, label)` pair yields bit-identical
    /// replicas on every worker.
    pub fn new(dim: usize, capacity: usize, seed: Option<u64>, label: &str) -> Result<Self> {
        if dim == 0 || capacity == 0 {
            return Err(MocoError::InvalidArgument(format!(
                "queue dimensions must be > 0 (dim={dim}, capacity={capacity})"
            )));
        }
        // Fold the label into an explicit seed so train and validation queues
        // draw from distinct streams even when one base seed is supplied.
        let seed = seed.map(|base| determinism::seed_with_label(base, label));
        let mut rng =
            determinism::rng_from_optional(seed, &format!("mc-moco/negative-queue/{label}"));
        let mut data = Vec::with_capacity(dim * capacity);
        for _ in 0..dim * capacity {
            let sample: f64 = rng.sample(StandardNormal);
            data.push(sample as f32);
        }
        let mut queue = Self {
            data,
            dim,
            capacity,
            ptr: 0,
        };
        queue.normalize_columns();
        Ok(queue)
    }

    fn normalize_columns(&mut self) {
        for col in 0..self.capacity {
            let mut norm_sq = 0.0f64;
            for row in 0..self.dim {
                let v = self.data[row * self.capacity + col];
                norm_sq += (v as f64).powi(2);
            }
            let norm = (norm_sq.sqrt() as f32).max(f32::EPSILON);
            for row in 0..self.dim {
                self.data[row * self.capacity + col] /= norm;
            }
        }
    }

    /// Embedding dimension of every column.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of columns the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next write offset, always in `[0, capacity)`.
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    /// Row-major `dim x capacity` view of the storage.
    pub fn storage(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub(crate) fn at(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.capacity + col]
    }

    /// Copies one column into the provided scratch buffer.
    pub fn copy_column_into(&self, col: usize, out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.dim);
        for (row, slot) in out.iter_mut().enumerate() {
            *slot = self.data[row * self.capacity + col];
        }
    }

    /// Writes a batch of keys (`batch x dim`, already gathered across
    /// workers) into the columns starting at the write pointer, wrapping
    /// circularly, then advances the pointer by the batch size modulo the
    /// capacity.
    ///
    /// A batch whose size differs from `configured_batch` is skipped without
    /// touching storage or pointer; the return value reports whether the
    /// write happened. An under-sized trailing batch must not desynchronise
    /// the pointer across worker replicas.
    pub fn enqueue(&mut self, keys: &Tensor, configured_batch: usize) -> Result<bool> {
        let (batch, dim) = keys.shape();
        if dim != self.dim {
            return Err(MocoError::Shape(format!(
                "key dimension {dim} does not match queue dimension {}",
                self.dim
            )));
        }
        if batch != configured_batch {
            tracing::debug!(
                batch,
                configured_batch,
                "skipping enqueue of mismatched batch"
            );
            return Ok(false);
        }
        let source = keys.data();
        for j in 0..batch {
            let col = (self.ptr + j) % self.capacity;
            for row in 0..self.dim {
                self.data[row * self.capacity + col] = source[j * self.dim + row];
            }
        }
        self.ptr = (self.ptr + batch) % self.capacity;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(batch: usize, dim: usize, fill: f32) -> Tensor {
        Tensor::from_fn(batch, dim, |r, c| fill + (r * dim + c) as f32).unwrap()
    }

    #[test]
    fn columns_start_unit_normalised() {
        let queue = NegativeQueue::new(8, 16, Some(3), "test").unwrap();
        for col in 0..16 {
            let norm_sq: f32 = (0..8).map(|row| queue.at(row, col).powi(2)).sum();
            assert!((norm_sq - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn enqueue_writes_transposed_columns() {
        let mut queue = NegativeQueue::new(3, 6, Some(1), "test").unwrap();
        let batch = keys(2, 3, 0.0);
        assert!(queue.enqueue(&batch, 2).unwrap());
        assert_eq!(queue.ptr(), 2);
        // Column 0 holds key row 0, column 1 holds key row 1.
        for row in 0..3 {
            assert_eq!(queue.at(row, 0), batch.row(0)[row]);
            assert_eq!(queue.at(row, 1), batch.row(1)[row]);
        }
    }

    #[test]
    fn pointer_wraps_modulo_capacity() {
        let mut queue = NegativeQueue::new(2, 8, Some(1), "test").unwrap();
        for step in 1..=5 {
            queue.enqueue(&keys(4, 2, step as f32), 4).unwrap();
        }
        assert_eq!(queue.ptr(), (5 * 4) % 8);
    }

    #[test]
    fn mismatched_batch_is_silently_skipped() {
        let mut queue = NegativeQueue::new(2, 8, Some(1), "test").unwrap();
        let before = queue.storage().to_vec();
        let skipped = queue.enqueue(&keys(3, 2, 0.0), 4).unwrap();
        assert!(!skipped);
        assert_eq!(queue.ptr(), 0);
        assert_eq!(queue.storage(), &before[..]);
    }

    #[test]
    fn same_seed_yields_identical_replicas() {
        let a = NegativeQueue::new(4, 32, Some(9), "train").unwrap();
        let b = NegativeQueue::new(4, 32, Some(9), "train").unwrap();
        assert_eq!(a, b);
    }
}

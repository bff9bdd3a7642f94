use crate::collective::Collective;
use crate::{MocoError, Result};
use mc_tensor::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Outcome of a cross-worker batch shuffle: this worker's shuffled slice plus
/// the inverse permutation needed to restore global order later.
#[derive(Debug, Clone, PartialEq)]
pub struct ShuffledBatch {
    pub batch: Tensor,
    pub inverse: Vec<usize>,
}

fn select_rows(gathered: &[f32], cols: usize, indices: &[usize]) -> Result<Tensor> {
    let mut data = Vec::with_capacity(indices.len() * cols);
    for &index in indices {
        let start = index * cols;
        data.extend_from_slice(&gathered[start..start + cols]);
    }
    Tensor::from_vec(indices.len(), cols, data).map_err(MocoError::from)
}

/// Shuffles the key batch across all workers so batch-normalisation statistics
/// cannot correlate with positive-pair identity.
///
/// Rank 0 draws one uniform permutation of the global batch and broadcasts it,
/// guaranteeing a single globally-agreed ordering; every worker then keeps its
/// own slice. With a single worker the input passes through unchanged. The
/// permutation indices ride the collective's f32 buffers, which is exact for
/// any global batch below 2^24 rows.
pub fn shuffle_batch(
    x: &Tensor,
    collective: &dyn Collective,
    rng: &mut StdRng,
) -> Result<ShuffledBatch> {
    let (local_batch, cols) = x.shape();
    let world = collective.world_size();
    if world <= 1 {
        return Ok(ShuffledBatch {
            batch: x.clone(),
            inverse: (0..local_batch).collect(),
        });
    }

    let gathered = collective.all_gather(x.data())?;
    let total = world * local_batch;

    let mut permutation_buffer = vec![0.0f32; total];
    if collective.rank() == 0 {
        let mut permutation: Vec<usize> = (0..total).collect();
        permutation.shuffle(rng);
        for (slot, index) in permutation_buffer.iter_mut().zip(permutation.iter()) {
            *slot = *index as f32;
        }
    }
    collective.broadcast(&mut permutation_buffer, 0)?;
    let permutation: Vec<usize> = permutation_buffer.iter().map(|&v| v as usize).collect();

    let mut inverse = vec![0usize; total];
    for (position, &index) in permutation.iter().enumerate() {
        if index >= total {
            return Err(MocoError::InvalidArgument(format!(
                "broadcast permutation entry {index} out of range for global batch {total}"
            )));
        }
        inverse[index] = position;
    }

    let rank = collective.rank();
    let local_slice = &permutation[rank * local_batch..(rank + 1) * local_batch];
    let batch = select_rows(&gathered, cols, local_slice)?;

    Ok(ShuffledBatch { batch, inverse })
}

/// Reverses [`shuffle_batch`] on the key-encoder outputs: re-gather across
/// workers, then pick this worker's slice of the inverse permutation so every
/// row returns to its original local position.
pub fn unshuffle_batch(
    x: &Tensor,
    inverse: &[usize],
    collective: &dyn Collective,
) -> Result<Tensor> {
    let (local_batch, cols) = x.shape();
    let world = collective.world_size();
    if world <= 1 {
        return Ok(x.clone());
    }

    let total = world * local_batch;
    if inverse.len() != total {
        return Err(MocoError::Shape(format!(
            "inverse permutation has {} entries, expected {total}",
            inverse.len()
        )));
    }

    let gathered = collective.all_gather(x.data())?;
    let rank = collective.rank();
    let local_slice = &inverse[rank * local_batch..(rank + 1) * local_batch];
    select_rows(&gathered, cols, local_slice)
}

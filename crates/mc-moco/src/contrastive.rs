use crate::knn::MinedNegatives;
use crate::queue::NegativeQueue;
use crate::{MocoError, Result};
use mc_tensor::Tensor;

/// Source of negative similarities for one step.
#[derive(Debug, Clone, Copy)]
pub enum Negatives<'a> {
    /// Every queue column becomes a negative (`K = capacity`).
    Queue(&'a NegativeQueue),
    /// Per-query mined neighbour sets (`K = topk`).
    Mined(&'a MinedNegatives),
}

impl Negatives<'_> {
    fn width(&self) -> usize {
        match self {
            Negatives::Queue(queue) => queue.capacity(),
            Negatives::Mined(mined) => mined.topk(),
        }
    }

    fn dim(&self) -> usize {
        match self {
            Negatives::Queue(queue) => queue.dim(),
            Negatives::Mined(mined) => mined.dim(),
        }
    }
}

/// Contrastive classification problem for one batch: column 0 of `values`
/// holds the positive similarity, every target is index 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    pub values: Tensor,
    pub targets: Vec<usize>,
}

fn validate_pair(query_hat: &Tensor, key_hat: &Tensor) -> Result<(usize, usize)> {
    if query_hat.shape() != key_hat.shape() {
        return Err(MocoError::Shape(format!(
            "query/key shape mismatch: {:?} vs {:?}",
            query_hat.shape(),
            key_hat.shape()
        )));
    }
    Ok(query_hat.shape())
}

/// Builds the `(batch, 1 + K)` contrastive logits from normalised embeddings,
/// dividing everything by the softmax temperature. The positive similarity
/// always lands in column 0, so the synthesised target vector is all zeros.
pub fn assemble_logits(
    query_hat: &Tensor,
    key_hat: &Tensor,
    negatives: Negatives<'_>,
    temperature: f32,
) -> Result<Logits> {
    if !temperature.is_finite() || temperature <= 0.0 {
        return Err(MocoError::InvalidArgument(format!(
            "temperature must be > 0, got {temperature}"
        )));
    }
    let (batch, dim) = validate_pair(query_hat, key_hat)?;
    if negatives.dim() != dim {
        return Err(MocoError::Shape(format!(
            "negative dimension {} does not match embedding dimension {dim}",
            negatives.dim()
        )));
    }

    let negatives_width = negatives.width();
    let width = 1 + negatives_width;
    let inv_temperature = 1.0 / temperature;
    let mut values = vec![0.0f32; batch * width];

    for i in 0..batch {
        let query = query_hat.row(i);
        let key = key_hat.row(i);
        let positive: f32 = query.iter().zip(key.iter()).map(|(q, k)| q * k).sum();
        let row = &mut values[i * width..(i + 1) * width];
        row[0] = positive;
        match negatives {
            Negatives::Queue(queue) => {
                let storage = queue.storage();
                let capacity = queue.capacity();
                for (r, &qv) in query.iter().enumerate() {
                    if qv == 0.0 {
                        continue;
                    }
                    let column_row = &storage[r * capacity..(r + 1) * capacity];
                    for (slot, &value) in row[1..].iter_mut().zip(column_row.iter()) {
                        *slot += qv * value;
                    }
                }
            }
            Negatives::Mined(mined) => {
                for (j, slot) in row[1..].iter_mut().enumerate() {
                    let neighbour = mined.neighbour(i, j);
                    *slot = query
                        .iter()
                        .zip(neighbour.iter())
                        .map(|(q, n)| q * n)
                        .sum();
                }
            }
        }
        for value in row.iter_mut() {
            *value *= inv_temperature;
        }
    }

    Ok(Logits {
        values: Tensor::from_vec(batch, width, values).map_err(MocoError::from)?,
        targets: vec![0; batch],
    })
}

/// InfoNCE loss: categorical cross-entropy against the fixed target index 0,
/// averaged over the batch. Returns the loss together with the gradient with
/// respect to the logits (softmax minus one-hot, scaled by `1/batch`).
pub fn cross_entropy_index0(logits: &Tensor) -> Result<(f32, Tensor)> {
    let (batch, width) = logits.shape();
    let mut loss = 0.0f32;
    let mut grad = vec![0.0f32; batch * width];
    let inv_batch = 1.0 / batch as f32;

    for i in 0..batch {
        let row = logits.row(i);
        let max_logit = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let mut exp_sum = 0.0f64;
        for &value in row {
            exp_sum += ((value - max_logit) as f64).exp();
        }
        if exp_sum <= 0.0 || !exp_sum.is_finite() {
            return Err(MocoError::InvalidArgument(
                "softmax normaliser is not finite".to_string(),
            ));
        }
        loss += -(row[0] - max_logit - exp_sum.ln() as f32);

        let grad_row = &mut grad[i * width..(i + 1) * width];
        for (slot, &value) in grad_row.iter_mut().zip(row.iter()) {
            *slot = (((value - max_logit) as f64).exp() / exp_sum) as f32 * inv_batch;
        }
        grad_row[0] -= inv_batch;
    }
    loss *= inv_batch;

    Ok((
        loss,
        Tensor::from_vec(batch, width, grad).map_err(MocoError::from)?,
    ))
}

/// Chains the logits gradient back to the normalised query embeddings.
///
/// Keys and negatives receive no gradient; only the query side participates
/// in backpropagation.
pub fn query_gradient(
    grad_logits: &Tensor,
    key_hat: &Tensor,
    negatives: Negatives<'_>,
    temperature: f32,
) -> Result<Tensor> {
    let (batch, width) = grad_logits.shape();
    let dim = key_hat.shape().1;
    if key_hat.shape().0 != batch {
        return Err(MocoError::Shape(format!(
            "key batch {} does not match logits batch {batch}",
            key_hat.shape().0
        )));
    }
    if width != 1 + negatives.width() {
        return Err(MocoError::Shape(format!(
            "logits width {width} does not match 1 + {}",
            negatives.width()
        )));
    }

    let inv_temperature = 1.0 / temperature;
    let mut grad = vec![0.0f32; batch * dim];

    for i in 0..batch {
        let grad_row = grad_logits.row(i);
        let out = &mut grad[i * dim..(i + 1) * dim];
        for (slot, &k) in out.iter_mut().zip(key_hat.row(i).iter()) {
            *slot = grad_row[0] * k;
        }
        match negatives {
            Negatives::Queue(queue) => {
                let storage = queue.storage();
                let capacity = queue.capacity();
                for (r, slot) in out.iter_mut().enumerate() {
                    let column_row = &storage[r * capacity..(r + 1) * capacity];
                    let mut acc = 0.0f32;
                    for (&g, &value) in grad_row[1..].iter().zip(column_row.iter()) {
                        acc += g * value;
                    }
                    *slot += acc;
                }
            }
            Negatives::Mined(mined) => {
                for (j, &g) in grad_row[1..].iter().enumerate() {
                    if g == 0.0 {
                        continue;
                    }
                    for (slot, &n) in out.iter_mut().zip(mined.neighbour(i, j).iter()) {
                        *slot += g * n;
                    }
                }
            }
        }
        for slot in out.iter_mut() {
            *slot *= inv_temperature;
        }
    }

    Tensor::from_vec(batch, dim, grad).map_err(MocoError::from)
}

/// Backward pass of row-wise L2 normalisation: projects out the radial
/// component and rescales by the original row norm.
pub fn normalize_rows_backward(
    hat: &Tensor,
    norms: &[f32],
    grad_hat: &Tensor,
) -> Result<Tensor> {
    let (batch, dim) = hat.shape();
    if grad_hat.shape() != (batch, dim) {
        return Err(MocoError::Shape(format!(
            "gradient shape {:?} does not match embeddings {:?}",
            grad_hat.shape(),
            hat.shape()
        )));
    }
    if norms.len() != batch {
        return Err(MocoError::Shape(format!(
            "{} norms provided for batch {batch}",
            norms.len()
        )));
    }
    let mut grad = vec![0.0f32; batch * dim];
    for i in 0..batch {
        let unit = hat.row(i);
        let g = grad_hat.row(i);
        let radial: f32 = unit.iter().zip(g.iter()).map(|(u, g)| u * g).sum();
        let inv_norm = 1.0 / norms[i].max(f32::EPSILON);
        for ((slot, &u), &gv) in grad[i * dim..(i + 1) * dim]
            .iter_mut()
            .zip(unit.iter())
            .zip(g.iter())
        {
            *slot = (gv - u * radial) * inv_norm;
        }
    }
    Tensor::from_vec(batch, dim, grad).map_err(MocoError::from)
}

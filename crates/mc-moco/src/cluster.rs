use crate::{MocoError, Result};
use mc_nn::{Linear, Module};
use mc_tensor::Tensor;

/// Soft clustering head shared by both augmented views.
///
/// A single linear projection maps normalised embeddings onto a fixed number
/// of categories; the loss rewards confident (low-entropy) soft assignments
/// for query and key views jointly.
#[derive(Debug)]
pub struct ClusterHead {
    proj: Linear,
    alpha: f32,
}

impl ClusterHead {
    pub fn new(emb_dim: usize, target_categories: usize, alpha: f32) -> Result<Self> {
        if target_categories == 0 {
            return Err(MocoError::InvalidArgument(
                "target_categories must be > 0".to_string(),
            ));
        }
        if !alpha.is_finite() || alpha <= 0.0 {
            return Err(MocoError::InvalidArgument(format!(
                "alpha must be > 0, got {alpha}"
            )));
        }
        let proj =
            Linear::new("cluster::proj", emb_dim, target_categories).map_err(MocoError::from)?;
        Ok(Self { proj, alpha })
    }

    /// Number of assignment categories.
    pub fn categories(&self) -> usize {
        self.proj.output_dim()
    }

    /// Projection handed to the optimizer alongside the query encoder.
    pub fn proj_mut(&mut self) -> &mut Linear {
        &mut self.proj
    }

    fn soft_assignments(&self, logits: &Tensor) -> Result<Tensor> {
        logits
            .scale(self.alpha)
            .map_err(MocoError::from)?
            .row_softmax()
            .map_err(MocoError::from)
    }

    /// Per-view value `sum(softmax(alpha * logits) * logits)`.
    fn view_value(&self, logits: &Tensor) -> Result<f32> {
        let assignments = self.soft_assignments(logits)?;
        Ok(assignments
            .data()
            .iter()
            .zip(logits.data().iter())
            .map(|(s, l)| s * l)
            .sum())
    }

    /// Per-view value plus the gradient of `-value / alpha` with respect to
    /// the logits.
    fn view_term(&self, logits: &Tensor) -> Result<(f32, Tensor)> {
        let (batch, categories) = logits.shape();
        let assignments = self.soft_assignments(logits)?;

        let mut value = 0.0f32;
        let mut grad = vec![0.0f32; batch * categories];
        for i in 0..batch {
            let l = logits.row(i);
            let s = assignments.row(i);
            let inner: f32 = s.iter().zip(l.iter()).map(|(s, l)| s * l).sum();
            value += inner;
            let row = &mut grad[i * categories..(i + 1) * categories];
            for ((slot, &sj), &lj) in row.iter_mut().zip(s.iter()).zip(l.iter()) {
                *slot = -(sj / self.alpha + sj * (lj - inner));
            }
        }
        let grad = Tensor::from_vec(batch, categories, grad).map_err(MocoError::from)?;
        Ok((value, grad))
    }

    /// Loss value plus backward: accumulates projection gradients from both
    /// views and returns the gradient with respect to the query embeddings.
    /// Keys stay detached, so their embedding gradient is dropped.
    pub fn loss(&mut self, query_hat: &Tensor, key_hat: &Tensor) -> Result<(f32, Tensor)> {
        let query_logits = self.proj.forward(query_hat).map_err(MocoError::from)?;
        let key_logits = self.proj.forward(key_hat).map_err(MocoError::from)?;

        let (query_value, query_grad) = self.view_term(&query_logits)?;
        let (key_value, key_grad) = self.view_term(&key_logits)?;
        let loss = -(query_value + key_value) / self.alpha;

        let grad_query = self
            .proj
            .backward(query_hat, &query_grad)
            .map_err(MocoError::from)?;
        let _ = self
            .proj
            .backward(key_hat, &key_grad)
            .map_err(MocoError::from)?;

        Ok((loss, grad_query))
    }

    /// Loss value alone, leaving every gradient buffer untouched. Used by the
    /// validation step.
    pub fn evaluate(&self, query_hat: &Tensor, key_hat: &Tensor) -> Result<f32> {
        let query_logits = self.proj.forward(query_hat).map_err(MocoError::from)?;
        let key_logits = self.proj.forward(key_hat).map_err(MocoError::from)?;
        let query_value = self.view_value(&query_logits)?;
        let key_value = self.view_value(&key_logits)?;
        Ok(-(query_value + key_value) / self.alpha)
    }
}

use crate::knn::Metric;
use crate::{MocoError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Hyperparameters exposed by the momentum-contrast learner.
///
/// Every field carries the default of the reference configuration so a partial
/// TOML file (or `MocoConfig::default()`) yields a runnable setup.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MocoConfig {
    /// Name resolved through the backbone factory.
    pub base_encoder: String,
    /// Flattened input width consumed by the built-in backbones.
    pub input_dim: usize,
    /// Embedding dimension produced by both encoders.
    pub emb_dim: usize,
    /// Queue capacity; number of negative keys.
    pub num_negatives: usize,
    /// Momentum used when blending query weights into the key encoder.
    pub encoder_momentum: f32,
    /// Softmax temperature applied to the contrastive logits.
    pub softmax_temperature: f32,
    /// Base learning rate handed to the optimizer.
    pub learning_rate: f32,
    /// Optimizer momentum.
    pub momentum: f32,
    /// Optimizer weight decay.
    pub weight_decay: f32,
    /// Per-worker batch size; also the enqueue alignment unit.
    pub batch_size: usize,
    /// Epoch horizon for the cosine learning-rate schedule.
    pub max_epochs: u32,
    /// Widen the projection head with a hidden layer + ReLU.
    pub use_mlp: bool,
    /// Mine hard negatives from the queue instead of using it wholesale.
    pub use_knn: bool,
    /// Neighbours retrieved per query on the KNN path.
    pub topk: usize,
    /// Distance metric used by the KNN miner.
    pub metric: String,
    /// Enable the clustering auxiliary loss.
    pub use_cluster: bool,
    /// Number of soft-assignment categories.
    pub target_categories: usize,
    /// Inverse temperature of the clustering soft-max.
    pub alpha: f32,
    /// Optional explicit seed for queue initialisation and the shuffle stream.
    pub seed: Option<u64>,
}

impl Default for MocoConfig {
    fn default() -> Self {
        Self {
            base_encoder: "linear".to_string(),
            input_dim: 3072,
            emb_dim: 128,
            num_negatives: 65536,
            encoder_momentum: 0.999,
            softmax_temperature: 0.07,
            learning_rate: 0.03,
            momentum: 0.9,
            weight_decay: 1e-4,
            batch_size: 256,
            max_epochs: 10,
            use_mlp: false,
            use_knn: false,
            topk: 500,
            metric: "euclidean".to_string(),
            use_cluster: false,
            target_categories: 10,
            alpha: 0.1,
            seed: None,
        }
    }
}

impl MocoConfig {
    /// Validates the configuration, failing fast on anything the training
    /// loop could not recover from later.
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.emb_dim == 0 {
            return Err(MocoError::InvalidArgument(format!(
                "encoder dimensions must be > 0 (input_dim={}, emb_dim={})",
                self.input_dim, self.emb_dim
            )));
        }
        if self.num_negatives == 0 {
            return Err(MocoError::InvalidArgument(
                "num_negatives must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MocoError::InvalidArgument(
                "batch_size must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.encoder_momentum) {
            return Err(MocoError::InvalidArgument(format!(
                "encoder_momentum must lie in [0, 1), got {}",
                self.encoder_momentum
            )));
        }
        if !self.softmax_temperature.is_finite() || self.softmax_temperature <= 0.0 {
            return Err(MocoError::InvalidArgument(format!(
                "softmax_temperature must be > 0, got {}",
                self.softmax_temperature
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(MocoError::InvalidArgument(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(MocoError::InvalidArgument(format!(
                "optimizer momentum must lie in [0, 1), got {}",
                self.momentum
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(MocoError::InvalidArgument(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        if self.max_epochs == 0 {
            return Err(MocoError::InvalidArgument(
                "max_epochs must be > 0".to_string(),
            ));
        }
        if self.use_knn {
            if self.topk == 0 || self.topk > self.num_negatives {
                return Err(MocoError::InvalidArgument(format!(
                    "topk must lie in [1, num_negatives], got {}",
                    self.topk
                )));
            }
            // Unrecognised metric names are a hard error, not a fallback.
            self.metric.parse::<Metric>()?;
        }
        if self.use_cluster {
            if self.target_categories == 0 {
                return Err(MocoError::InvalidArgument(
                    "target_categories must be > 0".to_string(),
                ));
            }
            if !self.alpha.is_finite() || self.alpha <= 0.0 {
                return Err(MocoError::InvalidArgument(format!(
                    "alpha must be > 0, got {}",
                    self.alpha
                )));
            }
        }
        Ok(())
    }

    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml_str(config: &str) -> Result<Self> {
        let parsed: MocoConfig = toml::from_str(config).map_err(|err| {
            MocoError::InvalidArgument(format!("failed to parse moco config: {err}"))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Loads a configuration from a TOML file on disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(|err| {
            MocoError::InvalidArgument(format!(
                "failed to read moco config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MocoConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = MocoConfig::from_toml_str(
            r#"
            emb_dim = 64
            num_negatives = 1024
            batch_size = 32
            use_knn = true
            topk = 16
            metric = "angular"
            "#,
        )
        .unwrap();
        assert_eq!(config.emb_dim, 64);
        assert_eq!(config.num_negatives, 1024);
        assert_eq!(config.topk, 16);
        assert_eq!(config.base_encoder, "linear");
    }

    #[test]
    fn unknown_metric_is_rejected_when_knn_enabled() {
        let err = MocoConfig::from_toml_str(
            r#"
            use_knn = true
            metric = "chebyshev"
            "#,
        )
        .unwrap_err();
        assert_eq!(err, MocoError::UnsupportedMetric("chebyshev".to_string()));
    }

    #[test]
    fn metric_is_not_parsed_unless_knn_is_enabled() {
        let config = MocoConfig {
            metric: "whatever".to_string(),
            ..MocoConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn invalid_momentum_is_rejected() {
        let config = MocoConfig {
            encoder_momentum: 1.0,
            ..MocoConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

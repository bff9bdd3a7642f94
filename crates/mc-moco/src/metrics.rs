//! Metric helpers and telemetry descriptors for the contrastive learner.
//!
//! Step orchestration emits plain name-to-scalar maps; the descriptor
//! registry documents the well-known names so logging sinks and dashboards
//! can discover them.

use crate::{MocoError, Result};
use mc_tensor::Tensor;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Scalar metrics emitted by one training or validation step.
pub type MetricMap = BTreeMap<&'static str, f32>;

/// Units associated with a metric descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Dimensionless scalar value (losses, ratios, etc.).
    Scalar,
    /// Raw count of occurrences, batches, or steps.
    Count,
}

/// Descriptor describing a metric that can be emitted by the learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Canonical metric name registered with the telemetry layer.
    pub name: &'static str,
    /// Unit associated with the metric value.
    pub unit: MetricUnit,
    /// Human readable description for dashboards and registries.
    pub description: &'static str,
}

static REGISTRY: Lazy<RwLock<Vec<MetricDescriptor>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Registers a collection of metric descriptors, ignoring duplicates.
pub fn register_descriptors(descriptors: &[MetricDescriptor]) {
    let mut registry = REGISTRY
        .write()
        .expect("metric registry write lock should not be poisoned");
    for descriptor in descriptors {
        if registry
            .iter()
            .all(|existing| existing.name != descriptor.name)
        {
            registry.push(*descriptor);
        }
    }
}

/// Returns the list of descriptors that were registered so far.
pub fn descriptors() -> Vec<MetricDescriptor> {
    REGISTRY
        .read()
        .expect("metric registry read lock should not be poisoned")
        .clone()
}

/// Canonical descriptors exposed by the momentum-contrast steps.
pub const MOCO_DESCRIPTORS: &[MetricDescriptor] = &[
    MetricDescriptor {
        name: "train_loss",
        unit: MetricUnit::Scalar,
        description: "Contrastive (plus clustering) loss of the training step.",
    },
    MetricDescriptor {
        name: "train_acc1",
        unit: MetricUnit::Scalar,
        description: "Top-1 accuracy of the positive key in the synthetic classification.",
    },
    MetricDescriptor {
        name: "train_acc5",
        unit: MetricUnit::Scalar,
        description: "Top-5 accuracy of the positive key in the synthetic classification.",
    },
    MetricDescriptor {
        name: "val_loss",
        unit: MetricUnit::Scalar,
        description: "Validation-queue contrastive loss.",
    },
    MetricDescriptor {
        name: "val_acc1",
        unit: MetricUnit::Scalar,
        description: "Validation top-1 accuracy.",
    },
    MetricDescriptor {
        name: "val_acc5",
        unit: MetricUnit::Scalar,
        description: "Validation top-5 accuracy.",
    },
];

/// Convenience wrapper that registers the built-in descriptors.
pub fn register_moco_descriptors() {
    register_descriptors(MOCO_DESCRIPTORS);
}

/// Fraction of rows whose target index ranks inside the top `k` logits, for
/// every requested `k`. Ranks count strictly-greater competitors, so ties
/// resolve in favour of the target.
pub fn precision_at_k(logits: &Tensor, targets: &[usize], top_k: &[usize]) -> Result<Vec<f32>> {
    let (batch, width) = logits.shape();
    if targets.len() != batch {
        return Err(MocoError::Shape(format!(
            "{} targets provided for batch {batch}",
            targets.len()
        )));
    }
    let mut hits = vec![0usize; top_k.len()];
    for (i, &target) in targets.iter().enumerate() {
        if target >= width {
            return Err(MocoError::InvalidArgument(format!(
                "target index {target} out of range for {width} classes"
            )));
        }
        let row = logits.row(i);
        let reference = row[target];
        let rank = row.iter().filter(|&&v| v > reference).count();
        for (slot, &k) in hits.iter_mut().zip(top_k.iter()) {
            if rank < k {
                *slot += 1;
            }
        }
    }
    Ok(hits
        .into_iter()
        .map(|count| count as f32 / batch as f32)
        .collect())
}

/// Unweighted mean of per-step metric maps, keyed by metric name.
pub fn epoch_mean(outputs: &[MetricMap]) -> MetricMap {
    let mut sums: BTreeMap<&'static str, (f32, usize)> = BTreeMap::new();
    for output in outputs {
        for (&name, &value) in output {
            let entry = sums.entry(name).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_descriptors_is_idempotent() {
        register_moco_descriptors();
        register_moco_descriptors();
        let registered = descriptors();
        assert!(registered.len() >= MOCO_DESCRIPTORS.len());
        assert!(registered
            .iter()
            .any(|descriptor| descriptor.name == "train_loss"));
    }

    #[test]
    fn precision_counts_targets_in_top_k() {
        let logits = Tensor::from_vec(
            2,
            4,
            vec![
                0.9, 0.1, 0.2, 0.3, // target 0 ranks first
                0.1, 0.8, 0.6, 0.9, // target 0 ranks fourth
            ],
        )
        .unwrap();
        let accs = precision_at_k(&logits, &[0, 0], &[1, 5]).unwrap();
        assert_eq!(accs, vec![0.5, 1.0]);
    }

    #[test]
    fn precision_resolves_ties_towards_target() {
        let logits = Tensor::from_vec(1, 3, vec![0.5, 0.5, 0.1]).unwrap();
        let accs = precision_at_k(&logits, &[0], &[1]).unwrap();
        assert_eq!(accs, vec![1.0]);
    }

    #[test]
    fn epoch_mean_averages_each_key() {
        let mut a = MetricMap::new();
        a.insert("val_loss", 1.0);
        a.insert("val_acc1", 0.2);
        let mut b = MetricMap::new();
        b.insert("val_loss", 3.0);
        b.insert("val_acc1", 0.6);
        let mean = epoch_mean(&[a, b]);
        assert!((mean["val_loss"] - 2.0).abs() < 1e-6);
        assert!((mean["val_acc1"] - 0.4).abs() < 1e-6);
    }
}

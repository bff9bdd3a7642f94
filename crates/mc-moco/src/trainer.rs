use crate::metrics::MetricMap;
use crate::model::{MomentumContrast, ViewBatch};
use crate::Result;
use mc_nn::{CosineAnnealingLr, Sgd};

/// Sink receiving the per-step metric maps emitted by the learner.
pub trait MetricSink {
    fn log_metrics(&mut self, step: usize, metrics: &MetricMap);
}

/// Sink that forwards every scalar to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_metrics(&mut self, step: usize, metrics: &MetricMap) {
        for (name, value) in metrics {
            tracing::info!(step, metric = name, value, "metric");
        }
    }
}

/// Summary of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub mean_loss: f32,
    pub batches: usize,
}

/// Minimal epoch driver bundling the optimizer, the cosine schedule and a
/// metric sink. Real deployments may replace it wholesale; the step methods
/// on [`MomentumContrast`] carry the full training semantics.
#[derive(Debug)]
pub struct Trainer<S: MetricSink> {
    optimizer: Sgd,
    scheduler: CosineAnnealingLr,
    sink: S,
    global_step: usize,
}

impl<S: MetricSink> Trainer<S> {
    /// Builds a trainer from the model's optimizer contract.
    pub fn new(model: &MomentumContrast, sink: S) -> Result<Self> {
        let (optimizer, scheduler) = model.configure_optimizers()?;
        Ok(Self {
            optimizer,
            scheduler,
            sink,
            global_step: 0,
        })
    }

    /// Current optimizer learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    /// Runs one training epoch: schedule tick, then step/optimize/log per batch.
    pub fn train_epoch(
        &mut self,
        model: &mut MomentumContrast,
        batches: &[ViewBatch],
    ) -> Result<EpochStats> {
        let lr = self.scheduler.step_optimizer(&mut self.optimizer)?;
        tracing::debug!(lr, "starting training epoch");

        let mut total_loss = 0.0f32;
        for batch in batches {
            let output = model.training_step(batch)?;
            model.apply_gradients(&mut self.optimizer)?;
            self.sink.log_metrics(self.global_step, &output.metrics);
            self.global_step += 1;
            total_loss += output.loss;
        }
        let count = batches.len().max(1);
        Ok(EpochStats {
            mean_loss: total_loss / count as f32,
            batches: batches.len(),
        })
    }

    /// Runs one validation epoch and logs the epoch-mean metrics.
    pub fn validate_epoch(
        &mut self,
        model: &mut MomentumContrast,
        batches: &[ViewBatch],
    ) -> Result<MetricMap> {
        let mut outputs = Vec::with_capacity(batches.len());
        for batch in batches {
            outputs.push(model.validation_step(batch)?.metrics);
        }
        let aggregated = model.validation_epoch_end(&outputs);
        self.sink.log_metrics(self.global_step, &aggregated);
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCollective;
    use crate::config::MocoConfig;
    use crate::encoder::BackboneFactory;
    use crate::model::ParallelMode;
    use mc_tensor::Tensor;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSink {
        entries: Vec<(usize, MetricMap)>,
    }

    impl MetricSink for RecordingSink {
        fn log_metrics(&mut self, step: usize, metrics: &MetricMap) {
            self.entries.push((step, metrics.clone()));
        }
    }

    fn batches(count: usize, rows: usize, cols: usize) -> Vec<ViewBatch> {
        (0..count)
            .map(|i| ViewBatch {
                query_view: Tensor::random_normal(rows, cols, 0.0, 1.0, Some(100 + i as u64))
                    .unwrap(),
                key_view: Tensor::random_normal(rows, cols, 0.0, 1.0, Some(200 + i as u64))
                    .unwrap(),
            })
            .collect()
    }

    #[test]
    fn trainer_steps_and_logs_each_batch() {
        let config = MocoConfig {
            input_dim: 8,
            emb_dim: 8,
            num_negatives: 16,
            batch_size: 4,
            max_epochs: 3,
            seed: Some(21),
            ..MocoConfig::default()
        };
        let factory = BackboneFactory::with_defaults();
        let mut model = MomentumContrast::new(
            config,
            &factory,
            Arc::new(LocalCollective::new()),
            ParallelMode::SingleProcess,
        )
        .unwrap();

        let mut trainer = Trainer::new(&model, RecordingSink::default()).unwrap();
        let stats = trainer.train_epoch(&mut model, &batches(3, 4, 8)).unwrap();
        assert_eq!(stats.batches, 3);
        assert!(stats.mean_loss.is_finite());
        assert_eq!(trainer.sink.entries.len(), 3);
        assert!(trainer.sink.entries[0].1.contains_key("train_loss"));

        let aggregated = trainer
            .validate_epoch(&mut model, &batches(2, 4, 8))
            .unwrap();
        assert!(aggregated.contains_key("val_acc1"));
        assert_eq!(trainer.sink.entries.len(), 4);
    }
}

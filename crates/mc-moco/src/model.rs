use crate::cluster::ClusterHead;
use crate::collective::Collective;
use crate::config::MocoConfig;
use crate::contrastive::{self, Negatives};
use crate::encoder::{BackboneFactory, EncoderPair};
use crate::knn::{self, Metric, MinedNegatives};
use crate::metrics::{self, MetricMap};
use crate::queue::NegativeQueue;
use crate::shuffle;
use crate::{MocoError, Result};
use mc_config::determinism;
use mc_nn::{CosineAnnealingLr, Module, Sgd};
use mc_tensor::Tensor;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Capability flag describing how this worker participates in training.
///
/// Distributed-only machinery (batch shuffle, cross-worker gather before
/// enqueue) engages only under [`ParallelMode::Synchronous`]; everything
/// degrades to the identity otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelMode {
    /// One worker; collectives are never exercised.
    SingleProcess,
    /// Synchronous data parallelism over the injected collective layer.
    Synchronous,
}

/// Selects which negative queue a forward pass reads and feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSplit {
    Train,
    Validation,
}

/// Two augmented views of the same image batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewBatch {
    pub query_view: Tensor,
    pub key_view: Tensor,
}

/// Scalar loss plus named metrics produced by one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub metrics: MetricMap,
}

/// Everything one forward pass produces, kept around so the training step can
/// run the manual backward against the same embeddings and mined negatives.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub logits: Tensor,
    pub targets: Vec<usize>,
    pub query_hat: Tensor,
    pub key_hat: Tensor,
    query_norms: Vec<f32>,
    mined: Option<MinedNegatives>,
}

/// MoCo-style momentum-contrast learner.
pub struct MomentumContrast {
    config: MocoConfig,
    encoders: EncoderPair,
    cluster: Option<ClusterHead>,
    knn: Option<(usize, Metric)>,
    queue: NegativeQueue,
    val_queue: NegativeQueue,
    collective: Arc<dyn Collective>,
    mode: ParallelMode,
    shuffle_rng: StdRng,
}

impl core::fmt::Debug for MomentumContrast {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MomentumContrast")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("world_size", &self.collective.world_size())
            .field("queue_ptr", &self.queue.ptr())
            .field("val_queue_ptr", &self.val_queue.ptr())
            .finish()
    }
}

impl MomentumContrast {
    /// Builds the learner: encoder pair, optional KNN miner and cluster head,
    /// and both negative queues. Queue seeding is rank-independent so every
    /// worker replica starts from bit-identical queues.
    pub fn new(
        config: MocoConfig,
        factory: &BackboneFactory,
        collective: Arc<dyn Collective>,
        mode: ParallelMode,
    ) -> Result<Self> {
        config.validate()?;
        let encoders = EncoderPair::new(factory, &config)?;
        let knn = if config.use_knn {
            Some((config.topk, config.metric.parse::<Metric>()?))
        } else {
            None
        };
        let cluster = if config.use_cluster {
            Some(ClusterHead::new(
                config.emb_dim,
                config.target_categories,
                config.alpha,
            )?)
        } else {
            None
        };
        let queue = NegativeQueue::new(config.emb_dim, config.num_negatives, config.seed, "train")?;
        let val_queue =
            NegativeQueue::new(config.emb_dim, config.num_negatives, config.seed, "val")?;
        let shuffle_rng = determinism::rng_from_optional(
            config
                .seed
                .map(|base| determinism::seed_with_label(base, "batch-shuffle")),
            "mc-moco/batch-shuffle",
        );
        Ok(Self {
            config,
            encoders,
            cluster,
            knn,
            queue,
            val_queue,
            collective,
            mode,
            shuffle_rng,
        })
    }

    /// Hyperparameters the learner was built with.
    pub fn config(&self) -> &MocoConfig {
        &self.config
    }

    /// Training-split negative queue.
    pub fn queue(&self) -> &NegativeQueue {
        &self.queue
    }

    /// Validation-split negative queue.
    pub fn val_queue(&self) -> &NegativeQueue {
        &self.val_queue
    }

    /// The query/key encoder pair.
    pub fn encoders(&self) -> &EncoderPair {
        &self.encoders
    }

    fn synchronous(&self) -> bool {
        self.mode == ParallelMode::Synchronous && self.collective.world_size() > 1
    }

    fn queue_ref(&self, split: QueueSplit) -> &NegativeQueue {
        match split {
            QueueSplit::Train => &self.queue,
            QueueSplit::Validation => &self.val_queue,
        }
    }

    /// Blends query weights into the key encoder. Runs once per training step
    /// before the key forward pass.
    pub fn momentum_update(&mut self) -> Result<()> {
        self.encoders.momentum_update(self.config.encoder_momentum)
    }

    /// Forward pass: query embeddings, shuffled key embeddings, and the
    /// `(batch, 1+K)` contrastive logits against the split's negatives.
    pub fn forward(
        &mut self,
        query_view: &Tensor,
        key_view: &Tensor,
        split: QueueSplit,
    ) -> Result<ForwardOutput> {
        if query_view.shape() != key_view.shape() {
            return Err(MocoError::Shape(format!(
                "view shapes differ: {:?} vs {:?}",
                query_view.shape(),
                key_view.shape()
            )));
        }

        let query_raw = self
            .encoders
            .query()
            .forward(query_view)
            .map_err(MocoError::from)?;
        let (query_hat, query_norms) = query_raw.l2_normalize_rows();

        let key_hat = if self.synchronous() {
            let shuffled =
                shuffle::shuffle_batch(key_view, self.collective.as_ref(), &mut self.shuffle_rng)?;
            let key_raw = self
                .encoders
                .key()
                .forward(&shuffled.batch)
                .map_err(MocoError::from)?;
            let (key_hat_local, _) = key_raw.l2_normalize_rows();
            shuffle::unshuffle_batch(&key_hat_local, &shuffled.inverse, self.collective.as_ref())?
        } else {
            let key_raw = self
                .encoders
                .key()
                .forward(key_view)
                .map_err(MocoError::from)?;
            key_raw.l2_normalize_rows().0
        };

        let queue = self.queue_ref(split);
        let mined = match self.knn {
            Some((topk, metric)) => Some(knn::mine(&query_hat, queue, topk, metric)?),
            None => None,
        };
        let negatives = match mined.as_ref() {
            Some(mined) => Negatives::Mined(mined),
            None => Negatives::Queue(queue),
        };
        let logits = contrastive::assemble_logits(
            &query_hat,
            &key_hat,
            negatives,
            self.config.softmax_temperature,
        )?;

        Ok(ForwardOutput {
            logits: logits.values,
            targets: logits.targets,
            query_hat,
            key_hat,
            query_norms,
            mined,
        })
    }

    fn negatives_of<'a>(&'a self, output: &'a ForwardOutput, split: QueueSplit) -> Negatives<'a> {
        match output.mined.as_ref() {
            Some(mined) => Negatives::Mined(mined),
            None => Negatives::Queue(self.queue_ref(split)),
        }
    }

    /// Gathers the new keys across workers (rank-ascending) and writes them
    /// into the split's queue. Skips silently when the gathered batch does not
    /// match the configured batch size.
    fn enqueue_keys(&mut self, split: QueueSplit, key_hat: &Tensor) -> Result<bool> {
        let (local_batch, dim) = key_hat.shape();
        let gathered = if self.synchronous() {
            let data = self.collective.all_gather(key_hat.data())?;
            let rows = self.collective.world_size() * local_batch;
            Tensor::from_vec(rows, dim, data).map_err(MocoError::from)?
        } else {
            key_hat.clone()
        };
        let queue = match split {
            QueueSplit::Train => &mut self.queue,
            QueueSplit::Validation => &mut self.val_queue,
        };
        queue.enqueue(&gathered, self.config.batch_size)
    }

    /// One training step: momentum update, forward, loss + manual backward
    /// through the query encoder (and cluster head), key enqueue, metrics.
    ///
    /// Gradients are assembled before the enqueue so they reference the same
    /// negatives the logits were built from; the queue receives this step's
    /// keys afterwards, exactly once.
    pub fn training_step(&mut self, batch: &ViewBatch) -> Result<StepOutput> {
        self.momentum_update()?;
        let output = self.forward(&batch.query_view, &batch.key_view, QueueSplit::Train)?;

        let (mut loss, grad_logits) = contrastive::cross_entropy_index0(&output.logits)?;
        let mut grad_hat = contrastive::query_gradient(
            &grad_logits,
            &output.key_hat,
            self.negatives_of(&output, QueueSplit::Train),
            self.config.softmax_temperature,
        )?;

        if let Some(cluster) = self.cluster.as_mut() {
            let (cluster_loss, cluster_grad) = cluster.loss(&output.query_hat, &output.key_hat)?;
            loss += cluster_loss;
            grad_hat
                .add_scaled(&cluster_grad, 1.0)
                .map_err(MocoError::from)?;
        }

        let grad_raw =
            contrastive::normalize_rows_backward(&output.query_hat, &output.query_norms, &grad_hat)?;
        self.encoders
            .query_mut()
            .backward(&batch.query_view, &grad_raw)
            .map_err(MocoError::from)?;

        self.enqueue_keys(QueueSplit::Train, &output.key_hat)?;

        let accuracies = metrics::precision_at_k(&output.logits, &output.targets, &[1, 5])?;
        let mut step_metrics = MetricMap::new();
        step_metrics.insert("train_loss", loss);
        step_metrics.insert("train_acc1", accuracies[0]);
        step_metrics.insert("train_acc5", accuracies[1]);
        tracing::debug!(loss, acc1 = accuracies[0], "training step");

        Ok(StepOutput {
            loss,
            metrics: step_metrics,
        })
    }

    /// One validation step: mirrors the training step against the validation
    /// queue, with no momentum update, no backward pass and no effect on the
    /// training queue.
    pub fn validation_step(&mut self, batch: &ViewBatch) -> Result<StepOutput> {
        let output = self.forward(&batch.query_view, &batch.key_view, QueueSplit::Validation)?;

        let (mut loss, _) = contrastive::cross_entropy_index0(&output.logits)?;
        if let Some(cluster) = self.cluster.as_ref() {
            loss += cluster.evaluate(&output.query_hat, &output.key_hat)?;
        }

        self.enqueue_keys(QueueSplit::Validation, &output.key_hat)?;

        let accuracies = metrics::precision_at_k(&output.logits, &output.targets, &[1, 5])?;
        let mut step_metrics = MetricMap::new();
        step_metrics.insert("val_loss", loss);
        step_metrics.insert("val_acc1", accuracies[0]);
        step_metrics.insert("val_acc5", accuracies[1]);

        Ok(StepOutput {
            loss,
            metrics: step_metrics,
        })
    }

    /// Aggregates per-step validation metrics by unweighted mean.
    pub fn validation_epoch_end(&self, outputs: &[MetricMap]) -> MetricMap {
        metrics::epoch_mean(outputs)
    }

    /// Momentum SGD over the gradient-descended parameters plus a cosine
    /// annealing schedule spanning the configured epoch horizon.
    pub fn configure_optimizers(&self) -> Result<(Sgd, CosineAnnealingLr)> {
        let optimizer = Sgd::new(
            self.config.learning_rate,
            self.config.momentum,
            self.config.weight_decay,
        )
        .map_err(MocoError::from)?;
        let scheduler = CosineAnnealingLr::new(self.config.learning_rate, 0.0, self.config.max_epochs)
            .map_err(MocoError::from)?;
        Ok((optimizer, scheduler))
    }

    /// Applies one optimizer step to the query encoder and, when enabled, the
    /// cluster projection. The key encoder is never visited.
    pub fn apply_gradients(&mut self, optimizer: &mut Sgd) -> Result<()> {
        optimizer
            .step(self.encoders.query_mut())
            .map_err(MocoError::from)?;
        if let Some(cluster) = self.cluster.as_mut() {
            optimizer.step(cluster.proj_mut()).map_err(MocoError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCollective;

    fn small_config() -> MocoConfig {
        MocoConfig {
            input_dim: 8,
            emb_dim: 8,
            num_negatives: 16,
            batch_size: 4,
            learning_rate: 0.05,
            max_epochs: 2,
            seed: Some(13),
            ..MocoConfig::default()
        }
    }

    fn model(config: MocoConfig) -> MomentumContrast {
        let factory = BackboneFactory::with_defaults();
        MomentumContrast::new(
            config,
            &factory,
            Arc::new(LocalCollective::new()),
            ParallelMode::SingleProcess,
        )
        .unwrap()
    }

    fn batch(seed: u64, rows: usize, cols: usize) -> ViewBatch {
        ViewBatch {
            query_view: Tensor::random_normal(rows, cols, 0.0, 1.0, Some(seed)).unwrap(),
            key_view: Tensor::random_normal(rows, cols, 0.0, 1.0, Some(seed ^ 0xff)).unwrap(),
        }
    }

    #[test]
    fn forward_puts_positive_similarity_in_column_zero() {
        let mut model = model(small_config());
        let views = batch(1, 4, 8);
        let output = model
            .forward(&views.query_view, &views.key_view, QueueSplit::Train)
            .unwrap();
        assert_eq!(output.targets, vec![0; 4]);
        assert_eq!(output.logits.shape(), (4, 17));
        for i in 0..4 {
            let expected: f32 = output
                .query_hat
                .row(i)
                .iter()
                .zip(output.key_hat.row(i).iter())
                .map(|(q, k)| q * k)
                .sum::<f32>()
                / model.config().softmax_temperature;
            assert!((output.logits.row(i)[0] - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn training_step_advances_only_the_train_queue() {
        let mut model = model(small_config());
        let out = model.training_step(&batch(2, 4, 8)).unwrap();
        assert!(out.loss.is_finite());
        assert_eq!(model.queue().ptr(), 4);
        assert_eq!(model.val_queue().ptr(), 0);
    }

    #[test]
    fn validation_step_leaves_train_queue_and_gradients_alone() {
        let mut model = model(small_config());
        let out = model.validation_step(&batch(3, 4, 8)).unwrap();
        assert!(out.loss.is_finite());
        assert_eq!(model.queue().ptr(), 0);
        assert_eq!(model.val_queue().ptr(), 4);
        model
            .encoders()
            .query()
            .visit_parameters(&mut |param| {
                assert!(param.gradient().is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn undersized_batch_skips_the_enqueue() {
        let mut model = model(small_config());
        let out = model.training_step(&batch(4, 3, 8)).unwrap();
        assert!(out.loss.is_finite());
        assert_eq!(model.queue().ptr(), 0);
    }

    #[test]
    fn knn_path_limits_logit_width_to_topk() {
        let config = MocoConfig {
            use_knn: true,
            topk: 5,
            metric: "angular".to_string(),
            ..small_config()
        };
        let mut model = model(config);
        let output = model
            .forward(
                &batch(5, 4, 8).query_view,
                &batch(5, 4, 8).key_view,
                QueueSplit::Train,
            )
            .unwrap();
        assert_eq!(output.logits.shape(), (4, 6));
    }

    #[test]
    fn cluster_loss_contributes_to_training_loss() {
        let base = model(small_config());
        let base_loss = {
            let mut m = base;
            m.training_step(&batch(6, 4, 8)).unwrap().loss
        };
        let config = MocoConfig {
            use_cluster: true,
            target_categories: 3,
            alpha: 0.1,
            ..small_config()
        };
        let mut with_cluster = model(config);
        let loss = with_cluster.training_step(&batch(6, 4, 8)).unwrap().loss;
        assert!(loss.is_finite());
        assert!((loss - base_loss).abs() > 1e-7);
    }

    #[test]
    fn validation_epoch_end_averages_metrics() {
        let mut model = model(small_config());
        let outputs = vec![
            model.validation_step(&batch(7, 4, 8)).unwrap().metrics,
            model.validation_step(&batch(8, 4, 8)).unwrap().metrics,
        ];
        let aggregated = model.validation_epoch_end(&outputs);
        let expected =
            (outputs[0]["val_loss"] + outputs[1]["val_loss"]) / 2.0;
        assert!((aggregated["val_loss"] - expected).abs() < 1e-6);
    }
}

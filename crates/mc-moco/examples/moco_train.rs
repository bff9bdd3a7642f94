use std::error::Error;
use std::sync::Arc;

use mc_moco::collective::LocalCollective;
use mc_moco::config::MocoConfig;
use mc_moco::encoder::BackboneFactory;
use mc_moco::metrics::register_moco_descriptors;
use mc_moco::model::{MomentumContrast, ParallelMode, ViewBatch};
use mc_moco::trainer::{Trainer, TracingSink};
use mc_tensor::Tensor;

fn main() -> Result<(), Box<dyn Error>> {
    mc_config::tracing::init_tracing()?;
    register_moco_descriptors();

    let config = match std::env::args().nth(1) {
        Some(path) => MocoConfig::load(path)?,
        None => MocoConfig {
            input_dim: 32,
            emb_dim: 16,
            num_negatives: 256,
            batch_size: 16,
            max_epochs: 5,
            use_mlp: true,
            seed: Some(42),
            ..MocoConfig::default()
        },
    };

    let factory = BackboneFactory::with_defaults();
    let mut model = MomentumContrast::new(
        config.clone(),
        &factory,
        Arc::new(LocalCollective::new()),
        ParallelMode::SingleProcess,
    )?;
    let mut trainer = Trainer::new(&model, TracingSink)?;

    let steps_per_epoch = 8;
    for epoch in 0..config.max_epochs {
        let train_batches = synthetic_epoch(&config, steps_per_epoch, 1000 * epoch as u64);
        let stats = trainer.train_epoch(&mut model, &train_batches)?;
        tracing::info!(
            epoch,
            mean_loss = stats.mean_loss,
            lr = trainer.learning_rate(),
            queue_ptr = model.queue().ptr(),
            "finished training epoch"
        );

        let val_batches = synthetic_epoch(&config, 2, 7000 + 1000 * epoch as u64);
        let aggregated = trainer.validate_epoch(&mut model, &val_batches)?;
        tracing::info!(
            epoch,
            val_loss = aggregated["val_loss"],
            val_acc1 = aggregated["val_acc1"],
            "finished validation epoch"
        );
    }

    Ok(())
}

/// Two correlated augmented views per batch: a shared base signal plus
/// independent perturbations, so the contrastive task has actual structure.
fn synthetic_epoch(config: &MocoConfig, batches: usize, seed: u64) -> Vec<ViewBatch> {
    (0..batches)
        .map(|i| {
            let base = Tensor::random_normal(
                config.batch_size,
                config.input_dim,
                0.0,
                1.0,
                Some(seed + i as u64),
            )
            .unwrap();
            let jitter = |offset: u64| {
                let noise = Tensor::random_normal(
                    config.batch_size,
                    config.input_dim,
                    0.0,
                    0.1,
                    Some(seed + i as u64 + offset),
                )
                .unwrap();
                let mut view = base.clone();
                view.add_scaled(&noise, 1.0).unwrap();
                view
            };
            ViewBatch {
                query_view: jitter(50_000),
                key_view: jitter(90_000),
            }
        })
        .collect()
}

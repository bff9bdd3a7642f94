use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mc_moco::config::MocoConfig;
use mc_moco::encoder::BackboneFactory;
use mc_moco::model::{MomentumContrast, ParallelMode, ViewBatch};
use mc_moco::rendezvous::RendezvousCollective;
use mc_tensor::Tensor;

static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_group(prefix: &str) -> String {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}-{id}")
}

fn distributed_config(world: usize, local_batch: usize) -> MocoConfig {
    MocoConfig {
        input_dim: 6,
        emb_dim: 4,
        num_negatives: 32,
        // The enqueue guard compares against the gathered global batch.
        batch_size: world * local_batch,
        seed: Some(77),
        ..MocoConfig::default()
    }
}

/// Every worker enqueues the same globally-gathered batch in rank order, so
/// queue replicas must stay bit-identical across workers. This is a verified
/// invariant, not a runtime-enforced one.
#[test]
fn queue_replicas_stay_bit_identical_across_workers() {
    let world = 2;
    let local_batch = 4;
    let group = unique_group("replicas");
    let mut handles = Vec::new();
    for rank in 0..world {
        let group_name = group.clone();
        handles.push(std::thread::spawn(move || {
            let collective =
                Arc::new(RendezvousCollective::connect(group_name, rank, world).unwrap());
            let factory = BackboneFactory::with_defaults();
            let config = distributed_config(world, local_batch);
            let mut model = MomentumContrast::new(
                config.clone(),
                &factory,
                collective,
                ParallelMode::Synchronous,
            )
            .unwrap();

            for step in 0..3u64 {
                let batch = ViewBatch {
                    query_view: Tensor::random_normal(
                        local_batch,
                        config.input_dim,
                        0.0,
                        1.0,
                        Some(10 * (step + 1) + rank as u64),
                    )
                    .unwrap(),
                    key_view: Tensor::random_normal(
                        local_batch,
                        config.input_dim,
                        0.0,
                        1.0,
                        Some(500 * (step + 1) + rank as u64),
                    )
                    .unwrap(),
                };
                let output = model.training_step(&batch).unwrap();
                assert!(output.loss.is_finite());
            }

            (
                model.queue().ptr(),
                model.queue().storage().to_vec(),
                model.val_queue().storage().to_vec(),
            )
        }));
    }

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    let (ptr0, train0, val0) = &results[0];
    assert_eq!(*ptr0, 3 * world * local_batch % 32);
    for (ptr, train, val) in &results[1..] {
        assert_eq!(ptr, ptr0);
        assert_eq!(train, train0, "train queue replicas diverged");
        assert_eq!(val, val0, "validation queue replicas diverged");
    }
}

/// An under-sized local batch gathers into an under-sized global batch, which
/// every replica skips, keeping pointers aligned.
#[test]
fn undersized_global_batch_is_skipped_on_every_worker() {
    let world = 2;
    let local_batch = 4;
    let group = unique_group("undersized");
    let mut handles = Vec::new();
    for rank in 0..world {
        let group_name = group.clone();
        handles.push(std::thread::spawn(move || {
            let collective =
                Arc::new(RendezvousCollective::connect(group_name, rank, world).unwrap());
            let factory = BackboneFactory::with_defaults();
            let config = distributed_config(world, local_batch);
            let mut model = MomentumContrast::new(
                config.clone(),
                &factory,
                collective,
                ParallelMode::Synchronous,
            )
            .unwrap();

            // Trailing partial batch: 3 local rows instead of 4.
            let batch = ViewBatch {
                query_view: Tensor::random_normal(3, config.input_dim, 0.0, 1.0, Some(rank as u64))
                    .unwrap(),
                key_view: Tensor::random_normal(
                    3,
                    config.input_dim,
                    0.0,
                    1.0,
                    Some(100 + rank as u64),
                )
                .unwrap(),
            };
            model.training_step(&batch).unwrap();
            model.queue().ptr()
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 0);
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};

use mc_moco::rendezvous::RendezvousCollective;
use mc_moco::shuffle::{shuffle_batch, unshuffle_batch};
use mc_tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_group(prefix: &str) -> String {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}-{id}")
}

fn worker_rows(rank: usize, local_batch: usize, dim: usize) -> Tensor {
    Tensor::from_fn(local_batch, dim, |r, c| {
        (rank * local_batch + r) as f32 * 100.0 + c as f32
    })
    .unwrap()
}

#[test]
fn shuffle_then_unshuffle_restores_worker_batches() {
    for (world, local_batch) in [(2usize, 3usize), (3, 2), (4, 4)] {
        let group = unique_group("roundtrip");
        let mut handles = Vec::new();
        for rank in 0..world {
            let group_name = group.clone();
            handles.push(std::thread::spawn(move || {
                let collective =
                    RendezvousCollective::connect(group_name, rank, world).unwrap();
                let mut rng = StdRng::seed_from_u64(7 + rank as u64);
                let x = worker_rows(rank, local_batch, 5);
                let shuffled = shuffle_batch(&x, &collective, &mut rng).unwrap();
                // A mock identity key encoder: outputs are the shuffled inputs.
                let restored =
                    unshuffle_batch(&shuffled.batch, &shuffled.inverse, &collective).unwrap();
                (x, restored)
            }));
        }
        for handle in handles {
            let (original, restored) = handle.join().unwrap();
            assert_eq!(original, restored);
        }
    }
}

#[test]
fn all_workers_see_the_same_permutation() {
    let world = 3;
    let local_batch = 4;
    let group = unique_group("perm");
    let mut handles = Vec::new();
    for rank in 0..world {
        let group_name = group.clone();
        handles.push(std::thread::spawn(move || {
            let collective = RendezvousCollective::connect(group_name, rank, world).unwrap();
            // Diverging RNGs per rank: only rank 0's stream decides the order.
            let mut rng = StdRng::seed_from_u64(1000 * (rank as u64 + 1));
            let x = worker_rows(rank, local_batch, 2);
            shuffle_batch(&x, &collective, &mut rng).unwrap().inverse
        }));
    }
    let inverses: Vec<Vec<usize>> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    for inverse in &inverses[1..] {
        assert_eq!(inverse, &inverses[0]);
    }
}

#[test]
fn shuffled_slices_partition_the_global_batch() {
    let world = 2;
    let local_batch = 3;
    let group = unique_group("partition");
    let mut handles = Vec::new();
    for rank in 0..world {
        let group_name = group.clone();
        handles.push(std::thread::spawn(move || {
            let collective = RendezvousCollective::connect(group_name, rank, world).unwrap();
            let mut rng = StdRng::seed_from_u64(99);
            let x = worker_rows(rank, local_batch, 1);
            shuffle_batch(&x, &collective, &mut rng).unwrap().batch
        }));
    }
    let mut seen: Vec<f32> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap().data().to_vec())
        .collect();
    seen.sort_by(f32::total_cmp);
    let mut expected: Vec<f32> = (0..world * local_batch).map(|i| i as f32 * 100.0).collect();
    expected.sort_by(f32::total_cmp);
    assert_eq!(seen, expected);
}

use crate::queue::NegativeQueue;
use crate::{MocoError, Result};
use mc_tensor::Tensor;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

/// Distance metric used when mining hard negatives from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Squared Euclidean distance.
    Euclidean,
    /// Manhattan (L1) distance.
    Manhattan,
    /// Negative dot product.
    Angular,
    /// Squared Euclidean distance scaled by the product of first coordinates.
    Hyperbolic,
    /// Sum of the angular and hyperbolic distances.
    AngularHyperbolic,
}

impl FromStr for Metric {
    type Err = MocoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "euclidean" => Ok(Metric::Euclidean),
            "manhattan" => Ok(Metric::Manhattan),
            "angular" => Ok(Metric::Angular),
            "hyperbolic" => Ok(Metric::Hyperbolic),
            "ang+hyper" => Ok(Metric::AngularHyperbolic),
            other => Err(MocoError::UnsupportedMetric(other.to_string())),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
            Metric::Angular => "angular",
            Metric::Hyperbolic => "hyperbolic",
            Metric::AngularHyperbolic => "ang+hyper",
        };
        f.write_str(name)
    }
}

impl Metric {
    fn distance(self, query: &[f32], candidate: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => query
                .iter()
                .zip(candidate.iter())
                .map(|(q, c)| (q - c) * (q - c))
                .sum(),
            Metric::Manhattan => query
                .iter()
                .zip(candidate.iter())
                .map(|(q, c)| (q - c).abs())
                .sum(),
            Metric::Angular => -query
                .iter()
                .zip(candidate.iter())
                .map(|(q, c)| q * c)
                .sum::<f32>(),
            Metric::Hyperbolic => {
                Metric::Euclidean.distance(query, candidate) / (query[0] * candidate[0])
            }
            Metric::AngularHyperbolic => {
                Metric::Angular.distance(query, candidate)
                    + Metric::Hyperbolic.distance(query, candidate)
            }
        }
    }
}

#[derive(Debug)]
struct Candidate {
    distance: f32,
    column: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance.total_cmp(&other.distance) == Ordering::Equal && self.column == other.column
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.column.cmp(&other.column))
    }
}

/// Per-query neighbour embeddings gathered from the queue, flattened
/// row-major as `batch x topk x dim`.
#[derive(Debug, Clone, PartialEq)]
pub struct MinedNegatives {
    data: Vec<f32>,
    batch: usize,
    topk: usize,
    dim: usize,
}

impl MinedNegatives {
    /// Number of queries mined against.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Neighbours retrieved per query.
    pub fn topk(&self) -> usize {
        self.topk
    }

    /// Embedding dimension of every neighbour.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The `j`-th nearest neighbour of query `i`.
    pub fn neighbour(&self, i: usize, j: usize) -> &[f32] {
        let start = (i * self.topk + j) * self.dim;
        &self.data[start..start + self.dim]
    }
}

/// Retrieves, for every query, the `topk` queue entries of smallest distance
/// under the chosen metric.
///
/// Queue columns stream through a scratch buffer while a bounded max-heap per
/// query keeps the current best `topk` candidates, so the full
/// `batch x capacity` distance matrix never materialises.
pub fn mine(
    query_hat: &Tensor,
    queue: &NegativeQueue,
    topk: usize,
    metric: Metric,
) -> Result<MinedNegatives> {
    let (batch, dim) = query_hat.shape();
    if dim != queue.dim() {
        return Err(MocoError::Shape(format!(
            "query dimension {dim} does not match queue dimension {}",
            queue.dim()
        )));
    }
    if topk == 0 || topk > queue.capacity() {
        return Err(MocoError::InvalidArgument(format!(
            "topk must lie in [1, {}], got {topk}",
            queue.capacity()
        )));
    }

    let mut heaps: Vec<BinaryHeap<Candidate>> =
        (0..batch).map(|_| BinaryHeap::with_capacity(topk + 1)).collect();
    let mut column = vec![0.0f32; dim];

    for col in 0..queue.capacity() {
        queue.copy_column_into(col, &mut column);
        for (i, heap) in heaps.iter_mut().enumerate() {
            let distance = metric.distance(query_hat.row(i), &column);
            heap.push(Candidate {
                distance,
                column: col,
            });
            if heap.len() > topk {
                heap.pop();
            }
        }
    }

    let mut data = vec![0.0f32; batch * topk * dim];
    for (i, heap) in heaps.into_iter().enumerate() {
        // Ascending distance, nearest neighbour first.
        let ranked = heap.into_sorted_vec();
        for (j, candidate) in ranked.iter().enumerate() {
            let start = (i * topk + j) * dim;
            queue.copy_column_into(candidate.column, &mut data[start..start + dim]);
        }
    }

    Ok(MinedNegatives {
        data,
        batch,
        topk,
        dim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force_topk(
        query: &[f32],
        queue: &NegativeQueue,
        topk: usize,
        metric: Metric,
    ) -> Vec<usize> {
        let mut column = vec![0.0f32; queue.dim()];
        let mut scored: Vec<(f32, usize)> = (0..queue.capacity())
            .map(|col| {
                queue.copy_column_into(col, &mut column);
                (metric.distance(query, &column), col)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().take(topk).map(|(_, col)| col).collect()
    }

    #[test]
    fn metric_parsing_accepts_known_names_only() {
        assert_eq!("euclidean".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert_eq!("manhattan".parse::<Metric>().unwrap(), Metric::Manhattan);
        assert_eq!("angular".parse::<Metric>().unwrap(), Metric::Angular);
        assert_eq!("hyperbolic".parse::<Metric>().unwrap(), Metric::Hyperbolic);
        assert_eq!(
            "ang+hyper".parse::<Metric>().unwrap(),
            Metric::AngularHyperbolic
        );
        assert_eq!(
            "cosine".parse::<Metric>().unwrap_err(),
            MocoError::UnsupportedMetric("cosine".to_string())
        );
    }

    #[test]
    fn mined_neighbours_match_brute_force_for_every_metric() {
        let queue = NegativeQueue::new(6, 32, Some(11), "test").unwrap();
        let query = Tensor::random_normal(3, 6, 0.0, 1.0, Some(4))
            .unwrap()
            .l2_normalize_rows()
            .0;
        for metric in [
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Angular,
            Metric::Hyperbolic,
            Metric::AngularHyperbolic,
        ] {
            let mined = mine(&query, &queue, 5, metric).unwrap();
            let mut column = vec![0.0f32; queue.dim()];
            for i in 0..3 {
                let expected = brute_force_topk(query.row(i), &queue, 5, metric);
                for (j, col) in expected.into_iter().enumerate() {
                    queue.copy_column_into(col, &mut column);
                    assert_eq!(
                        mined.neighbour(i, j),
                        &column[..],
                        "metric {metric} query {i} neighbour {j}"
                    );
                }
            }
        }
    }

    #[test]
    fn topk_is_bounded_by_capacity() {
        let queue = NegativeQueue::new(4, 8, Some(1), "test").unwrap();
        let query = Tensor::zeros(1, 4).unwrap();
        assert!(mine(&query, &queue, 0, Metric::Euclidean).is_err());
        assert!(mine(&query, &queue, 9, Metric::Euclidean).is_err());
    }
}

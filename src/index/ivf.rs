//! Inverted-file partitioning for approximate search.
//!
//! Centroids come from a fixed number of Lloyd iterations seeded with evenly
//! spaced rows, so the same rows always produce the same partitions. That lets
//! the artifact skip storing centroids: they are retrained on load.

use std::cmp::Ordering;

const TRAIN_ITERATIONS: usize = 8;

#[derive(Debug, Clone)]
pub(super) struct IvfPartitions {
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
}

impl IvfPartitions {
    /// Trains `lists` partitions over `vectors` (row id = position).
    pub(super) fn train(vectors: &[&[f32]], lists: usize) -> Self {
        if vectors.is_empty() {
            return Self {
                centroids: Vec::new(),
                lists: Vec::new(),
            };
        }
        let lists = lists.clamp(1, vectors.len());
        let mut centroids: Vec<Vec<f32>> = (0..lists)
            .map(|i| vectors[i * vectors.len() / lists].to_vec())
            .collect();
        let mut assignment = vec![0usize; vectors.len()];

        for _ in 0..TRAIN_ITERATIONS {
            let mut changed = false;
            for (row, vector) in vectors.iter().enumerate() {
                let nearest = nearest_centroid(&centroids, vector);
                if assignment[row] != nearest {
                    assignment[row] = nearest;
                    changed = true;
                }
            }

            let dim = centroids[0].len();
            let mut sums = vec![vec![0f32; dim]; lists];
            let mut counts = vec![0usize; lists];
            for (row, vector) in vectors.iter().enumerate() {
                let list = assignment[row];
                counts[list] += 1;
                for (acc, v) in sums[list].iter_mut().zip(vector.iter()) {
                    *acc += v;
                }
            }
            for (list, sum) in sums.into_iter().enumerate() {
                if counts[list] == 0 {
                    continue;
                }
                let n = counts[list] as f32;
                centroids[list] = sum.into_iter().map(|v| v / n).collect();
            }
            if !changed {
                break;
            }
        }

        let mut members = vec![Vec::new(); lists];
        for (row, vector) in vectors.iter().enumerate() {
            members[nearest_centroid(&centroids, vector)].push(row);
        }
        Self {
            centroids,
            lists: members,
        }
    }

    pub(super) fn list_count(&self) -> usize {
        self.centroids.len()
    }

    /// Row ids in the `probes` non-empty partitions closest to `query`.
    pub(super) fn candidates(&self, query: &[f32], probes: usize) -> Vec<usize> {
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(list, centroid)| (list, squared_distance(centroid, query)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        order
            .into_iter()
            .map(|(list, _)| &self.lists[list])
            .filter(|members| !members.is_empty())
            .take(probes)
            .flatten()
            .copied()
            .collect()
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, squared_distance(c, vector)))
        .min_by(|a, b| match a.1.total_cmp(&b.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        })
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

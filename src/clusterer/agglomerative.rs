use crate::clusterer::{
    centroid::compute_centroid,
    error::SimilarityError,
    similarity::cosine_similarity,
    types::{Cluster, ClusterParams, ClusterResult, Embedded},
};
use tracing::{trace, warn};

/// In-progress group: the input indices it owns and their mean vector
#[derive(Debug, Clone)]
struct ClusterRecord {
    members: Vec<usize>,
    centroid: Vec<f32>,
}

/// Handle-indexed cluster storage. A slot is emptied when its cluster is
/// absorbed, so handles stay stable for the whole run.
#[derive(Debug)]
struct Arena {
    slots: Vec<Option<ClusterRecord>>,
}

impl Arena {
    fn seed<T: Embedded>(items: &[T]) -> Self {
        let slots = items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                Some(ClusterRecord {
                    members: vec![idx],
                    centroid: item.embedding().to_vec(),
                })
            })
            .collect();
        Self { slots }
    }

    fn live(&self) -> impl Iterator<Item = (usize, &ClusterRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(h, slot)| slot.as_ref().map(|r| (h, r)))
    }

    fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Most similar live pair strictly above `threshold`.
    ///
    /// Scans `(i, j)` with `i < j` in handle order and only replaces the
    /// current best on a strictly higher score, so the lowest pair wins ties.
    fn closest_pair(&self, threshold: f32) -> Option<(usize, usize, f32)> {
        let live: Vec<(usize, &ClusterRecord)> = self.live().collect();
        let mut best: Option<(usize, usize, f32)> = None;
        let mut best_sim = threshold;

        for (pos, (hi, ci)) in live.iter().enumerate() {
            for (hj, cj) in &live[pos + 1..] {
                match cosine_similarity(&ci.centroid, &cj.centroid) {
                    Ok(sim) if sim > best_sim => {
                        best_sim = sim;
                        best = Some((*hi, *hj, sim));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(left = hi, right = hj, error = %e, "skipping incomparable pair"),
                }
            }
        }

        best
    }

    /// Fold `absorb` into `keep` and recompute the centroid over every member
    fn merge<T: Embedded>(
        &mut self,
        keep: usize,
        absorb: usize,
        items: &[T],
    ) -> Result<(), SimilarityError> {
        let absorbed = self.slots[absorb].take().ok_or(SimilarityError::EmptyInput)?;
        let record = self.slots[keep].as_mut().ok_or(SimilarityError::EmptyInput)?;

        record.members.extend(absorbed.members);
        let vectors: Vec<&[f32]> = record.members.iter().map(|&m| items[m].embedding()).collect();
        record.centroid = compute_centroid(&vectors)?;
        Ok(())
    }

    fn into_clusters(self) -> impl Iterator<Item = Cluster> {
        self.slots.into_iter().flatten().map(|mut r| {
            r.members.sort_unstable();
            Cluster {
                members: r.members,
                centroid: r.centroid,
            }
        })
    }
}

/// Agglomerative clustering on centroid cosine similarity.
///
/// Starts with one cluster per item and repeatedly merges the most similar
/// pair while its similarity is strictly greater than `params.threshold`.
/// Clusters smaller than `params.min_size` are dropped afterwards.
///
/// Every round rescans all live pairs, so the worst case is O(n³) in the
/// number of items. That is fine for one session's questions (a few
/// hundred at most) but this is not meant for large corpora.
pub fn agglomerate<T: Embedded>(
    items: &[T],
    params: &ClusterParams,
) -> Result<ClusterResult, SimilarityError> {
    let mut arena = Arena::seed(items);
    let mut merges = 0;

    while arena.live_count() > 1 {
        let Some((keep, absorb, sim)) = arena.closest_pair(params.threshold) else {
            break;
        };
        trace!(keep, absorb, similarity = sim, "merging clusters");
        arena.merge(keep, absorb, items)?;
        merges += 1;
    }

    let mut clusters = Vec::new();
    let mut discarded = 0;
    for cluster in arena.into_clusters() {
        if cluster.size() >= params.min_size {
            clusters.push(cluster);
        } else {
            discarded += 1;
        }
    }

    Ok(ClusterResult {
        clusters,
        merges,
        discarded,
    })
}

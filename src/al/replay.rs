//! Experience Replay Selector
//! Mission: Herding + random rehearsal picks from the historical pool

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::model::{EmbeddingExtractor, TrainSample};

/// Replay selection parameters. Ratios must sum to 1; the random share is
/// whatever the herding share leaves.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub quota: usize,
    pub herding_ratio: f64,
    pub random_ratio: f64,
    pub seed: u64,
}

/// Counts describing one selection run, persisted with the model metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    pub requested_quota: usize,
    pub effective_quota: usize,
    pub pool_size: usize,
    pub valid_pool: usize,
    pub herding_target: usize,
    pub random_target: usize,
    pub herding_selected: usize,
    pub random_selected: usize,
    pub total_selected: usize,
}

/// Result of a replay selection.
#[derive(Debug, Clone)]
pub struct ReplaySelection {
    pub samples: Vec<TrainSample>,
    pub summary: ReplaySummary,
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Distribute `target` herding slots across classes proportionally to class
/// counts, by largest remainder: floor allocations first, then hand out the
/// leftover to classes in descending fractional-part order, cycling and
/// skipping any class whose pool is already consumed.
fn largest_remainder_allocation(
    class_counts: &BTreeMap<usize, usize>,
    target: usize,
) -> BTreeMap<usize, usize> {
    let total: usize = class_counts.values().sum();
    let mut allocation: BTreeMap<usize, usize> = BTreeMap::new();
    if total == 0 || target == 0 {
        return allocation;
    }

    let mut fractions: Vec<(usize, f64)> = Vec::with_capacity(class_counts.len());
    let mut allocated = 0;
    for (&class, &count) in class_counts {
        let share = target as f64 * count as f64 / total as f64;
        let floor = (share.floor() as usize).min(count);
        allocation.insert(class, floor);
        allocated += floor;
        fractions.push((class, share - share.floor()));
    }

    // Descending fractional part, class index as the deterministic tiebreak.
    fractions.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut remaining = target.saturating_sub(allocated);
    while remaining > 0 {
        let mut progressed = false;
        for &(class, _) in &fractions {
            if remaining == 0 {
                break;
            }
            let slot = allocation.entry(class).or_insert(0);
            if *slot < class_counts[&class] {
                *slot += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break; // every class pool is consumed
        }
    }

    allocation
}

/// Select replay samples from the historical pool.
///
/// Embeddings are computed in parallel and L2-normalized; samples whose
/// images fail to load are dropped. Herding picks the samples nearest their
/// class centroid; the remainder is seeded-random. For a given seed, pool,
/// and embedding function the selection is deterministic.
pub fn select_replay_samples(
    pool: &[TrainSample],
    extractor: &dyn EmbeddingExtractor,
    config: &ReplayConfig,
) -> ReplaySelection {
    let mut summary = ReplaySummary {
        requested_quota: config.quota,
        pool_size: pool.len(),
        ..Default::default()
    };

    let quota = config.quota.min(pool.len());
    summary.effective_quota = quota;
    if quota == 0 {
        return ReplaySelection {
            samples: Vec::new(),
            summary,
        };
    }

    // Embed every loadable sample, keeping pool indices stable.
    let embedded: Vec<(usize, Vec<f32>)> = pool
        .par_iter()
        .enumerate()
        .filter_map(|(idx, sample)| match extractor.embed(&sample.image_path) {
            Ok(embedding) => Some((idx, l2_normalize(embedding))),
            Err(err) => {
                warn!(
                    "replay: dropping {} (embedding failed: {err:#})",
                    sample.image_path.display()
                );
                None
            }
        })
        .collect();
    summary.valid_pool = embedded.len();

    let herding_target = ((quota as f64 * config.herding_ratio).round() as usize).min(quota);
    let random_target = quota - herding_target;
    summary.herding_target = herding_target;
    summary.random_target = random_target;

    // Group valid samples by class.
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(idx, _) in &embedded {
        by_class.entry(pool[idx].class_index).or_default().push(idx);
    }
    let class_counts: BTreeMap<usize, usize> =
        by_class.iter().map(|(&c, v)| (c, v.len())).collect();
    let embeddings: BTreeMap<usize, &Vec<f32>> =
        embedded.iter().map(|(idx, e)| (*idx, e)).collect();

    let allocation = largest_remainder_allocation(&class_counts, herding_target);

    // Herding: per class, the k samples nearest the class centroid.
    let mut selected: BTreeSet<usize> = BTreeSet::new();
    for (&class, members) in &by_class {
        let k = allocation.get(&class).copied().unwrap_or(0);
        if k == 0 {
            continue;
        }

        let dim = embeddings[&members[0]].len();
        let mut centroid = vec![0.0f32; dim];
        for &idx in members {
            for (c, x) in centroid.iter_mut().zip(embeddings[&idx].iter()) {
                *c += x;
            }
        }
        for c in &mut centroid {
            *c /= members.len() as f32;
        }

        let mut by_distance: Vec<(f32, usize)> = members
            .iter()
            .map(|&idx| (l2_distance(embeddings[&idx], &centroid), idx))
            .collect();
        by_distance.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        selected.extend(by_distance.into_iter().take(k).map(|(_, idx)| idx));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let remaining_after = |selected: &BTreeSet<usize>| -> Vec<usize> {
        embedded
            .iter()
            .map(|(idx, _)| *idx)
            .filter(|idx| !selected.contains(idx))
            .collect()
    };

    // Top up an under-filled herding phase with seeded random picks.
    if selected.len() < herding_target {
        let mut remaining = remaining_after(&selected);
        remaining.shuffle(&mut rng);
        let needed = herding_target - selected.len();
        selected.extend(remaining.into_iter().take(needed));
    }
    summary.herding_selected = selected.len();

    // Random phase.
    let mut remaining = remaining_after(&selected);
    remaining.shuffle(&mut rng);
    let random_taken = remaining.len().min(random_target);
    selected.extend(remaining.into_iter().take(random_taken));
    summary.random_selected = random_taken;

    // Fill any residual shortfall, then down-sample any excess, both seeded.
    if selected.len() < quota {
        let mut remaining = remaining_after(&selected);
        remaining.shuffle(&mut rng);
        let needed = quota - selected.len();
        selected.extend(remaining.into_iter().take(needed));
    }
    if selected.len() > quota {
        let mut chosen: Vec<usize> = selected.into_iter().collect();
        chosen.shuffle(&mut rng);
        chosen.truncate(quota);
        selected = chosen.into_iter().collect();
    }

    summary.total_selected = selected.len();
    let samples = selected.into_iter().map(|idx| pool[idx].clone()).collect();
    ReplaySelection { samples, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::path::{Path, PathBuf};

    /// Deterministic embedding derived from the file name; no IO involved.
    struct HashEmbedder;

    impl EmbeddingExtractor for HashEmbedder {
        fn embed(&self, image_path: &Path) -> Result<Vec<f32>> {
            let name = image_path.to_string_lossy();
            if name.contains("broken") {
                bail!("unreadable image");
            }
            let mut state = 1469598103934665603u64;
            for b in name.as_bytes() {
                state ^= *b as u64;
                state = state.wrapping_mul(1099511628211);
            }
            Ok((0..8)
                .map(|i| ((state.rotate_left(i * 8) & 0xffff) as f32) / 65535.0)
                .collect())
        }
    }

    fn pool(classes: &[(usize, usize)]) -> Vec<TrainSample> {
        let mut samples = Vec::new();
        for &(class, count) in classes {
            for i in 0..count {
                samples.push(TrainSample {
                    image_path: PathBuf::from(format!("pool/c{class}_{i:03}.jpg")),
                    class_index: class,
                });
            }
        }
        samples
    }

    fn config(quota: usize, herding: f64, seed: u64) -> ReplayConfig {
        ReplayConfig {
            quota,
            herding_ratio: herding,
            random_ratio: 1.0 - herding,
            seed,
        }
    }

    #[test]
    fn test_same_seed_is_deterministic() {
        let pool = pool(&[(0, 40), (1, 30), (2, 30)]);
        let a = select_replay_samples(&pool, &HashEmbedder, &config(20, 0.8, 42));
        let b = select_replay_samples(&pool, &HashEmbedder, &config(20, 0.8, 42));
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.summary.total_selected, 20);
    }

    #[test]
    fn test_different_seed_changes_random_picks() {
        let pool = pool(&[(0, 60), (1, 60)]);
        let a = select_replay_samples(&pool, &HashEmbedder, &config(10, 0.0, 42));
        let b = select_replay_samples(&pool, &HashEmbedder, &config(10, 0.0, 43));
        assert_ne!(a.samples, b.samples);
    }

    #[test]
    fn test_quota_clamps_to_pool_size() {
        let pool = pool(&[(0, 4), (1, 3)]);
        let selection = select_replay_samples(&pool, &HashEmbedder, &config(500, 0.8, 42));
        assert_eq!(selection.summary.effective_quota, 7);
        assert_eq!(selection.samples.len(), 7);
    }

    #[test]
    fn test_zero_quota_is_empty() {
        let pool = pool(&[(0, 10)]);
        let selection = select_replay_samples(&pool, &HashEmbedder, &config(0, 0.8, 42));
        assert!(selection.samples.is_empty());
    }

    #[test]
    fn test_failed_embeddings_are_dropped() {
        let mut samples = pool(&[(0, 6)]);
        samples.push(TrainSample {
            image_path: PathBuf::from("pool/broken.jpg"),
            class_index: 0,
        });
        let selection = select_replay_samples(&samples, &HashEmbedder, &config(7, 1.0, 42));
        assert_eq!(selection.summary.valid_pool, 6);
        assert_eq!(selection.samples.len(), 6);
        assert!(selection
            .samples
            .iter()
            .all(|s| !s.image_path.to_string_lossy().contains("broken")));
    }

    #[test]
    fn test_largest_remainder_allocation_proportional() {
        let counts = BTreeMap::from([(0, 50), (1, 30), (2, 20)]);
        let allocation = largest_remainder_allocation(&counts, 10);
        assert_eq!(allocation[&0], 5);
        assert_eq!(allocation[&1], 3);
        assert_eq!(allocation[&2], 2);
    }

    #[test]
    fn test_largest_remainder_caps_at_class_pool() {
        // A target beyond the pool cannot over-allocate any class.
        let counts = BTreeMap::from([(0, 50), (1, 2)]);
        let allocation = largest_remainder_allocation(&counts, 60);
        assert_eq!(allocation[&0], 50);
        assert_eq!(allocation[&1], 2);
    }

    #[test]
    fn test_largest_remainder_assigns_leftover_by_fraction() {
        let counts = BTreeMap::from([(0, 50), (1, 2)]);
        // Shares are 19.23 and 0.77; the leftover slot goes to the class
        // with the larger fractional part.
        let allocation = largest_remainder_allocation(&counts, 20);
        assert_eq!(allocation[&0], 19);
        assert_eq!(allocation[&1], 1);
    }

    #[test]
    fn test_herding_prefers_centroid_neighbors() {
        // Three samples sit at a known spot, one is a far outlier; with one
        // herding slot per... quota 3 of 4 should keep the cluster.
        struct PlantedEmbedder;
        impl EmbeddingExtractor for PlantedEmbedder {
            fn embed(&self, image_path: &Path) -> Result<Vec<f32>> {
                let name = image_path.to_string_lossy();
                Ok(if name.contains("outlier") {
                    vec![1.0, 0.0]
                } else if name.contains("a") {
                    vec![0.0, 1.0]
                } else if name.contains("b") {
                    vec![0.05, 1.0]
                } else {
                    vec![-0.05, 1.0]
                })
            }
        }

        let samples = vec![
            TrainSample { image_path: PathBuf::from("a.jpg"), class_index: 0 },
            TrainSample { image_path: PathBuf::from("b.jpg"), class_index: 0 },
            TrainSample { image_path: PathBuf::from("c.jpg"), class_index: 0 },
            TrainSample { image_path: PathBuf::from("outlier.jpg"), class_index: 0 },
        ];

        let selection = select_replay_samples(&samples, &PlantedEmbedder, &config(3, 1.0, 42));
        assert_eq!(selection.samples.len(), 3);
        assert!(selection
            .samples
            .iter()
            .all(|s| !s.image_path.to_string_lossy().contains("outlier")));
    }

    #[test]
    fn test_summary_counts() {
        let pool = pool(&[(0, 50), (1, 50)]);
        let selection = select_replay_samples(&pool, &HashEmbedder, &config(20, 0.8, 42));
        assert_eq!(selection.summary.herding_target, 16);
        assert_eq!(selection.summary.random_target, 4);
        assert_eq!(selection.summary.herding_selected, 16);
        assert_eq!(selection.summary.random_selected, 4);
        assert_eq!(selection.summary.total_selected, 20);
    }
}

use crate::types::FeatureId;
use ahash::AHashMap;
use itertools::Itertools;
use rand::Rng;
use std::cmp::Ordering;

/// A multiset of candidate features for one set operation. A feature appearing `n`
/// times is `n` times as likely to be sampled. The pool only grows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkerPool {
    entries: Vec<FeatureId>,
}

impl MarkerPool {
    pub fn new(markers: &[FeatureId]) -> Self {
        Self {
            entries: markers.to_vec(),
        }
    }

    pub fn extend<I: IntoIterator<Item = FeatureId>>(&mut self, features: I) {
        self.entries.extend(features);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FeatureId] {
        &self.entries
    }

    /// Distinct features paired with their multiplicity, in first-occurrence order.
    pub fn multiplicities(&self) -> Vec<(FeatureId, usize)> {
        multiplicities(&self.entries)
    }
}

pub(crate) fn multiplicities(entries: &[FeatureId]) -> Vec<(FeatureId, usize)> {
    let mut position: AHashMap<FeatureId, usize> = AHashMap::with_capacity(entries.len());
    let mut counts: Vec<(FeatureId, usize)> = Vec::new();
    for &id in entries {
        match position.get(&id) {
            Some(&slot) => counts[slot].1 += 1,
            None => {
                position.insert(id, counts.len());
                counts.push((id, 1));
            }
        }
    }
    counts
}

/// Draws up to `k` distinct features from a multiset, weighting each by its
/// multiplicity, in a single pass.
///
/// Each distinct feature gets the key `ln(u) / w` with `u` uniform on (0, 1) and `w`
/// its multiplicity; the `k` largest keys win (Efraimidis and Spirakis). When the
/// pool holds no more than `k` distinct features, all of them are returned. The
/// result is sorted.
pub fn weighted_sample<R: Rng + ?Sized>(
    entries: &[FeatureId],
    k: usize,
    rng: &mut R,
) -> Vec<FeatureId> {
    let counts = multiplicities(entries);
    if counts.len() <= k {
        let mut all: Vec<FeatureId> = counts.into_iter().map(|(id, _)| id).collect();
        all.sort_unstable();
        return all;
    }

    let mut keyed: Vec<(f64, FeatureId)> = counts
        .into_iter()
        .map(|(id, weight)| {
            let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            (u.ln() / weight as f64, id)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let mut chosen: Vec<FeatureId> = keyed.into_iter().take(k).map(|(_, id)| id).collect();
    chosen.sort_unstable();
    chosen
}

/// Every combination of `sampled` with size in `[min, max]`, smallest first. Each
/// combination is sorted. Size zero contributes the single empty combination.
pub fn combine_features(sampled: &[FeatureId], min: usize, max: usize) -> Vec<Vec<FeatureId>> {
    let mut sorted = sampled.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let max = max.min(sorted.len());
    let mut combos = Vec::new();
    for size in min..=max {
        if size == 0 {
            combos.push(Vec::new());
            continue;
        }
        combos.extend(sorted.iter().copied().combinations(size));
    }
    combos
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ids(raw: &[usize]) -> Vec<FeatureId> {
        raw.iter().map(|&i| FeatureId(i)).collect()
    }

    #[test]
    fn small_pools_return_every_distinct_feature() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool = ids(&[4, 1, 4, 4, 2]);
        assert_eq!(weighted_sample(&pool, 3, &mut rng), ids(&[1, 2, 4]));
        assert_eq!(weighted_sample(&pool, 10, &mut rng), ids(&[1, 2, 4]));
    }

    #[test]
    fn sample_never_repeats_a_feature() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut pool = ids(&[0, 1, 2, 3, 4, 5, 6, 7]);
        pool.extend(std::iter::repeat_n(FeatureId(3), 50));
        for _ in 0..200 {
            let drawn = weighted_sample(&pool, 4, &mut rng);
            assert_eq!(drawn.len(), 4);
            let mut unique = drawn.clone();
            unique.dedup();
            assert_eq!(unique, drawn);
        }
    }

    #[test]
    fn heavy_features_are_drawn_more_often() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pool = ids(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        pool.extend(std::iter::repeat_n(FeatureId(9), 40));

        let draws = 2000;
        let heavy = (0..draws)
            .filter(|_| weighted_sample(&pool, 1, &mut rng) == ids(&[9]))
            .count();
        // Weight 41 out of 50 total.
        assert!(heavy > draws * 7 / 10, "heavy feature drawn {heavy} times");
    }

    #[test]
    fn zero_limit_yields_only_the_empty_combination() {
        let combos = combine_features(&ids(&[1, 2, 3]), 0, 0);
        assert_eq!(combos, vec![Vec::<FeatureId>::new()]);
        assert!(combine_features(&[], 0, 3) == vec![Vec::<FeatureId>::new()]);
    }

    #[test]
    fn combinations_cover_every_size_in_range() {
        let combos = combine_features(&ids(&[3, 1, 2]), 0, 2);
        assert_eq!(
            combos,
            vec![
                vec![],
                ids(&[1]),
                ids(&[2]),
                ids(&[3]),
                ids(&[1, 2]),
                ids(&[1, 3]),
                ids(&[2, 3]),
            ]
        );
        assert_eq!(combine_features(&ids(&[1, 2, 3]), 2, 2).len(), 3);
    }

    #[test]
    fn pool_tracks_multiplicity_in_first_seen_order() {
        let mut pool = MarkerPool::new(&ids(&[5, 2]));
        pool.extend(ids(&[2, 7, 2]));
        assert_eq!(pool.len(), 5);
        assert_eq!(
            pool.multiplicities(),
            vec![(FeatureId(5), 1), (FeatureId(2), 3), (FeatureId(7), 1)]
        );
    }
}

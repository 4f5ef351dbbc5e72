//! Passenger ejection.
//!
//! A passenger is a feature that rides along in a setwork because it was combined with
//! a feature that is truly associated with the phenotype. Within one trial, when a
//! larger setwork shares a base feature with a smaller one, every feature it adds must
//! buy roughly an order of magnitude of significance; otherwise the larger setwork is
//! ejected.

use crate::search::{BaseNames, SetworkArena};
use crate::types::Barcode;
use std::collections::BTreeSet;

/// Whether the larger setwork fails to improve enough on the smaller one.
///
/// `added` is the number of features the larger setwork has beyond the smaller one.
#[inline]
pub fn is_passenger(p_small: f64, p_large: f64, added: usize, eject_fraction: f64) -> bool {
    p_small / (10.0 * added as f64 * eject_fraction) <= p_large
}

/// Barcodes among `local` to eject. All pairs are judged against the arena as it was
/// before any removal.
pub fn find_passengers(
    local: &[Barcode],
    arena: &SetworkArena,
    base_names: &BaseNames,
    eject_fraction: f64,
) -> BTreeSet<Barcode> {
    let held: Vec<_> = local
        .iter()
        .filter_map(|&b| arena.get(b).map(|r| (b, r, r.setwork.distinct_features())))
        .collect();

    let mut ejected = BTreeSet::new();
    for (i, (b0, r0, f0)) in held.iter().enumerate() {
        for (b1, r1, f1) in &held[i + 1..] {
            if f0.len() == f1.len() || !base_names.overlap(&r0.setwork, &r1.setwork) {
                continue;
            }
            let (small, small_p, large, large_p, large_barcode) = if f0.len() < f1.len() {
                (f0, r0.p_value, f1, r1.p_value, *b1)
            } else {
                (f1, r1.p_value, f0, r0.p_value, *b0)
            };
            let added = large.difference(small).count();
            if is_passenger(small_p, large_p, added, eject_fraction) {
                ejected.insert(large_barcode);
            }
        }
    }

    if !ejected.is_empty() {
        log::trace!("Ejecting {} of {} setworks from this trial", ejected.len(), held.len());
    }
    ejected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SignificanceRecord;
    use crate::stats::{ContingencyTable, EffectSize, Performance};
    use crate::store::FeatureStore;
    use crate::types::{FeatureId, Interaction, Setwork};
    use ndarray::Array2;

    fn store() -> FeatureStore {
        let features: Vec<String> = ["F1:M", "F2:M", "F3:M", "F1>2:E"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        FeatureStore::new(
            vec!["s1".into()],
            features.clone(),
            Array2::default((4, 1)),
            &[],
            &features,
        )
        .unwrap()
    }

    fn record(union: &[usize], intersection: &[usize], p_value: f64) -> SignificanceRecord {
        let ids = |raw: &[usize]| -> Vec<FeatureId> { raw.iter().map(|&i| FeatureId(i)).collect() };
        SignificanceRecord {
            setwork: Setwork::new(ids(union), ids(intersection), vec![]),
            p_value,
            interaction: Interaction::CoOccurring,
            table: ContingencyTable::default(),
            performance: Performance::default(),
            effect_size: EffectSize::default(),
        }
    }

    #[test]
    fn threshold_of_one_order_of_magnitude_per_feature() {
        // 1e-6 / (10 * 1 * 0.1) = 1e-6, which is not above 1e-5.
        assert!(is_passenger(1e-6, 1e-5, 1, 0.1));
        assert!(!is_passenger(1e-6, 1e-7, 1, 0.1));
        // Two added features at a fraction of one need a twentyfold gain.
        assert!(is_passenger(1e-3, 6e-5, 2, 1.0));
        assert!(!is_passenger(1e-3, 4e-5, 2, 1.0));
    }

    #[test]
    fn larger_setwork_without_gain_is_ejected() {
        let store = store();
        let names = BaseNames::new(&store);
        let mut arena = SetworkArena::new();
        let small = arena.insert(record(&[0], &[], 1e-6));
        let large = arena.insert(record(&[0, 1], &[], 1e-5));

        let ejected = find_passengers(&[small, large], &arena, &names, 0.1);
        assert_eq!(ejected.into_iter().collect::<Vec<_>>(), vec![large]);
    }

    #[test]
    fn significant_growth_is_kept() {
        let store = store();
        let names = BaseNames::new(&store);
        let mut arena = SetworkArena::new();
        let small = arena.insert(record(&[0], &[], 1e-4));
        let large = arena.insert(record(&[1], &[0], 1e-9));

        assert!(find_passengers(&[small, large], &arena, &names, 0.1).is_empty());
    }

    #[test]
    fn unrelated_or_equal_sized_pairs_are_ignored() {
        let store = store();
        let names = BaseNames::new(&store);
        let mut arena = SetworkArena::new();
        let lone = arena.insert(record(&[2], &[], 1e-8));
        let pair = arena.insert(record(&[0, 1], &[], 0.5));
        let other_pair = arena.insert(record(&[0, 2], &[], 0.9));

        assert!(find_passengers(&[lone, pair], &arena, &names, 0.1).is_empty());
        assert!(find_passengers(&[pair, other_pair], &arena, &names, 0.1).is_empty());
    }

    #[test]
    fn threshold_variants_count_as_shared_features() {
        let store = store();
        let names = BaseNames::new(&store);
        let mut arena = SetworkArena::new();
        let small = arena.insert(record(&[3], &[], 1e-6));
        let large = arena.insert(record(&[0, 1], &[], 1e-2));

        let ejected = find_passengers(&[small, large], &arena, &names, 0.1);
        assert!(ejected.contains(&large));
    }
}

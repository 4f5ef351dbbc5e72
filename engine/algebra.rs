//! Three-valued set algebra over feature rows.
//!
//! A setwork is evaluated as `((OR union) AND intersection...) AND NOT difference...`.
//! Missing values are carried through each step according to [`Variate::or`],
//! [`Variate::and`] and [`Variate::and_not`].

use crate::store::FeatureStore;
use crate::types::{FeatureId, Setwork, Variate};
use ndarray::{Array1, Zip};

/// The derived variate vector of a setwork, aligned to the store's labels.
pub type FeatureVector = Array1<Variate>;

/// Three-valued OR over the given rows. `None` when `features` is empty.
pub fn union(store: &FeatureStore, features: &[FeatureId]) -> Option<FeatureVector> {
    let (first, rest) = features.split_first()?;
    let mut acc = store.row(*first).to_owned();
    for &id in rest {
        Zip::from(&mut acc)
            .and(&store.row(id))
            .for_each(|a, &b| *a = a.or(b));
    }
    Some(acc)
}

/// Three-valued AND over the given rows and, if present, an already assembled union.
/// `None` when there is nothing to intersect.
pub fn intersection(
    store: &FeatureStore,
    features: &[FeatureId],
    union: Option<FeatureVector>,
) -> Option<FeatureVector> {
    let mut rows = features.iter();
    let mut acc = match union {
        Some(vector) => vector,
        None => store.row(*rows.next()?).to_owned(),
    };
    for &id in rows {
        Zip::from(&mut acc)
            .and(&store.row(id))
            .for_each(|a, &b| *a = a.and(b));
    }
    Some(acc)
}

/// Removes each given row from `base` in turn.
pub fn difference(
    store: &FeatureStore,
    mut base: FeatureVector,
    features: &[FeatureId],
) -> FeatureVector {
    for &id in features {
        Zip::from(&mut base)
            .and(&store.row(id))
            .for_each(|a, &b| *a = a.and_not(b));
    }
    base
}

/// Evaluates a setwork into its feature vector.
///
/// An empty union list is skipped rather than treated as all zeros. When both the
/// union and the intersection lists are empty there is no base set to work from and
/// the setwork is undefined.
pub fn assemble(store: &FeatureStore, setwork: &Setwork) -> Option<FeatureVector> {
    let union = union(store, &setwork.union);
    let base = intersection(store, &setwork.intersection, union)?;
    Some(difference(store, base, &setwork.difference))
}

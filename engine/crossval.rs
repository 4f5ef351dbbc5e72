// ========================================================================================
//                                  Cross-Validation
// ========================================================================================

use crate::algebra::assemble;
use crate::config::{ConfigError, SearchConfig};
use crate::progress::SearchProgressObserver;
use crate::results::{
    ConsensusEntry, ConsensusResult, FoldEntry, FoldResult, Provenance, ResultEntry, VoteSummary,
};
use crate::search::Search;
use crate::stats::{
    ContingencyTable, LogFactorials, Performance, contingency_table, evaluate_with_interaction,
};
use crate::store::FeatureStore;
use crate::types::{Barcode, FeatureId, Interaction, NamedSetwork, Variate};
use crate::validate::resolve_setwork;
use ndarray::{Array1, Axis};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};

/// One split of the labels. Indices refer to label columns of the full store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub cases: Vec<usize>,
    pub controls: Vec<usize>,
    /// Every label not held out, in store order.
    pub training: Vec<usize>,
}

impl Fold {
    /// Held-out cases followed by held-out controls.
    pub fn held_out(&self) -> Vec<usize> {
        self.cases.iter().chain(&self.controls).copied().collect()
    }
}

pub fn fold_count(n_labels: usize, fold_size: usize) -> usize {
    n_labels.div_ceil(fold_size)
}

/// Splits the labels into `ceil(n / fold_size)` folds.
///
/// Cases and controls are shuffled separately and dealt round-robin, so every fold gets
/// a near-equal share of each. For leave-one-out the control folds are reversed so that
/// cases and controls are not held out in lockstep. Labels with a missing phenotype are
/// never held out.
pub fn partition_folds<R: Rng + ?Sized>(
    store: &FeatureStore,
    phenotype: FeatureId,
    fold_size: usize,
    rng: &mut R,
) -> Vec<Fold> {
    let n = store.n_labels();
    if fold_size == 0 || n == 0 {
        return Vec::new();
    }
    let k = fold_count(n, fold_size);
    let row = store.row(phenotype);

    let mut cases: Vec<usize> = (0..n).filter(|&j| row[j] == Variate::One).collect();
    let mut controls: Vec<usize> = (0..n).filter(|&j| row[j] == Variate::Zero).collect();
    cases.shuffle(rng);
    controls.shuffle(rng);

    let deal = |labels: &[usize]| -> Vec<Vec<usize>> {
        (0..k)
            .map(|f| labels.iter().skip(f).step_by(k).copied().collect())
            .collect()
    };
    let case_folds = deal(&cases);
    let mut control_folds = deal(&controls);
    if fold_size == 1 {
        control_folds.reverse();
    }

    case_folds
        .into_iter()
        .zip(control_folds)
        .enumerate()
        .map(|(index, (cases, controls))| {
            let held: BTreeSet<usize> = cases.iter().chain(&controls).copied().collect();
            let training = (0..n).filter(|j| !held.contains(j)).collect();
            Fold {
                index,
                cases,
                controls,
                training,
            }
        })
        .collect()
}

/// Searches the training labels of one fold and scores the retained setworks on the
/// held-out labels.
#[allow(clippy::too_many_arguments)]
pub fn run_fold<R, O>(
    store: &FeatureStore,
    config: &SearchConfig,
    phenotype: FeatureId,
    fold: &Fold,
    total_folds: usize,
    inputs: &[String],
    rng: &mut R,
    observer: &mut O,
) -> Result<FoldResult, ConfigError>
where
    R: Rng + ?Sized,
    O: SearchProgressObserver + ?Sized,
{
    let training = store.restrict_labels(&fold.training);
    let search = Search::new(&training, config)?;
    let outcome = search.run_with_observer(phenotype, rng, observer);

    let held = fold.held_out();
    let held_out_phenotype: Array1<Variate> = store.row(phenotype).select(Axis(0), &held);

    let entries = outcome
        .retained
        .iter()
        .filter_map(|retained| {
            let full = assemble(store, &retained.record.setwork)?;
            let predictions = full.select(Axis(0), &held);
            let held_out_table = contingency_table(predictions.view(), held_out_phenotype.view());
            Some(FoldEntry {
                entry: ResultEntry::from_retained(&search, retained),
                held_out_predictions: predictions.to_vec(),
                held_out_table,
            })
        })
        .collect::<Vec<_>>();

    log::info!(
        "Fold {} of {}: {} training labels, {} held out, {} setworks selected",
        fold.index + 1,
        total_folds,
        fold.training.len(),
        held.len(),
        entries.len()
    );

    Ok(FoldResult {
        fold: fold.index,
        total_folds,
        provenance: Provenance::new(
            config,
            inputs,
            store.feature_name(phenotype),
            training.n_labels(),
        ),
        held_out_labels: held.iter().map(|&j| store.labels()[j].clone()).collect(),
        held_out_phenotype: held_out_phenotype.to_vec(),
        entries,
    })
}

/// Partitions the labels and runs this node's share of the folds.
pub fn run_cross_validation<R, O>(
    store: &FeatureStore,
    config: &SearchConfig,
    phenotype: FeatureId,
    inputs: &[String],
    rng: &mut R,
    observer: &mut O,
) -> Result<Vec<FoldResult>, ConfigError>
where
    R: Rng + ?Sized,
    O: SearchProgressObserver + ?Sized,
{
    config.validate()?;
    let fold_size = config.fold_size.ok_or(ConfigError::FoldSize)?;
    let folds = partition_folds(store, phenotype, fold_size, rng);
    log::info!(
        "Cross-validating '{}' over {} folds of up to {} labels (node {} of {})",
        store.feature_name(phenotype),
        folds.len(),
        fold_size,
        config.multi_process.node,
        config.multi_process.total_nodes
    );

    config
        .multi_process
        .share(&folds)
        .map(|(_, fold)| run_fold(store, config, phenotype, fold, folds.len(), inputs, rng, observer))
        .collect()
}

type ConsensusKey = (NamedSetwork, Interaction);

/// Setworks selected in every fold, re-evaluated on all labels in the direction they
/// were selected in. Empty when any fold is missing or selected nothing.
pub fn strict_consensus(
    folds: &[FoldResult],
    store: &FeatureStore,
    phenotype: FeatureId,
    config: &SearchConfig,
) -> Vec<ConsensusEntry> {
    let Some(first) = folds.first() else {
        return Vec::new();
    };
    let expected = first.total_folds;
    let indices: BTreeSet<usize> = folds.iter().map(|f| f.fold).collect();
    if indices.len() != expected || folds.len() != expected {
        log::warn!(
            "Strict consensus needs all {} folds, found {} distinct",
            expected,
            indices.len()
        );
        return Vec::new();
    }
    if folds.iter().any(|f| f.entries.is_empty()) {
        log::info!("At least one fold selected no setworks; strict consensus is empty");
        return Vec::new();
    }

    // Fold count, pooled held-out table and first barcode seen for each key.
    let mut selected: BTreeMap<ConsensusKey, (usize, ContingencyTable, Barcode)> = BTreeMap::new();
    for fold in folds {
        let mut seen = BTreeSet::new();
        for fold_entry in &fold.entries {
            let key = (fold_entry.entry.setwork.clone(), fold_entry.entry.interaction);
            if !seen.insert(key.clone()) {
                continue;
            }
            let slot = selected
                .entry(key)
                .or_insert((0, ContingencyTable::default(), fold_entry.entry.barcode));
            slot.0 += 1;
            slot.1.merge(&fold_entry.held_out_table);
        }
    }

    let factorials = LogFactorials::new(store.n_labels());
    let response = store.row(phenotype);
    let consensus: Vec<ConsensusEntry> = selected
        .into_iter()
        .filter(|(_, (count, _, _))| *count == expected)
        .filter_map(|((named, interaction), (_, pooled, barcode))| {
            let setwork = match resolve_setwork(store, &named) {
                Ok(setwork) => setwork,
                Err(missing) => {
                    log::warn!("Consensus setwork {named} names unknown feature '{missing}'");
                    return None;
                }
            };
            let vector = assemble(store, &setwork)?;
            let evaluation =
                evaluate_with_interaction(vector.view(), response, &factorials, interaction);
            Some(ConsensusEntry {
                entry: ResultEntry::from_evaluation(
                    barcode,
                    named,
                    &evaluation,
                    config.confidence_level,
                ),
                held_out_table: pooled,
                held_out_performance: Performance::new(&pooled, interaction),
            })
        })
        .collect();

    log::info!(
        "{} setworks were selected in all {} folds",
        consensus.len(),
        expected
    );
    consensus
}

/// Predicts every held-out label by majority vote of the setworks selected in its
/// fold. A mutually exclusive setwork votes for the opposite of its call; missing
/// calls abstain. Ties and labels without votes are left unpredicted.
pub fn vote(folds: &[FoldResult]) -> VoteSummary {
    let mut summary = VoteSummary::default();
    for fold in folds {
        for (j, &truth) in fold.held_out_phenotype.iter().enumerate() {
            let (mut yes, mut no) = (0usize, 0usize);
            for fold_entry in &fold.entries {
                let Some(&call) = fold_entry.held_out_predictions.get(j) else {
                    continue;
                };
                let call = match (call.as_bool(), fold_entry.entry.interaction) {
                    (None, _) => continue,
                    (Some(c), Interaction::CoOccurring) => c,
                    (Some(c), Interaction::MutuallyExclusive) => !c,
                };
                if call {
                    yes += 1;
                } else {
                    no += 1;
                }
            }

            let prediction = match yes.cmp(&no) {
                std::cmp::Ordering::Greater => Variate::One,
                std::cmp::Ordering::Less => Variate::Zero,
                std::cmp::Ordering::Equal => {
                    summary.omitted_labels += 1;
                    continue;
                }
            };
            let pair = contingency_table(
                Array1::from(vec![prediction]).view(),
                Array1::from(vec![truth]).view(),
            );
            if pair.total() == 0 {
                summary.omitted_labels += 1;
                continue;
            }
            summary.table.merge(&pair);
            summary.predicted_labels += 1;
        }
    }
    summary.performance = Performance::new(&summary.table, Interaction::CoOccurring);
    summary
}

/// Strict consensus and vote summary of a complete set of fold results.
pub fn consensus(
    folds: &[FoldResult],
    store: &FeatureStore,
    phenotype: FeatureId,
    config: &SearchConfig,
    inputs: &[String],
) -> ConsensusResult {
    ConsensusResult {
        provenance: Provenance::new(
            config,
            inputs,
            store.feature_name(phenotype),
            store.n_labels(),
        ),
        folds: folds.len(),
        entries: strict_consensus(folds, store, phenotype, config),
        vote: vote(folds),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ConfidenceIntervals;
    use crate::stats::{ConfidenceLevel, EffectSize};
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn store_with_phenotype(phenotype: &[Variate]) -> FeatureStore {
        let n = phenotype.len();
        let marker: Vec<Variate> = phenotype.to_vec();
        let mut rows = phenotype.to_vec();
        rows.extend(marker);
        let features = vec!["Resp:Drug".to_string(), "A:Mut".to_string()];
        FeatureStore::new(
            (0..n).map(|i| format!("s{i}")).collect(),
            features.clone(),
            Array2::from_shape_vec((2, n), rows).unwrap(),
            &features[..1],
            &features[1..],
        )
        .unwrap()
    }

    fn named(union: &[&str]) -> NamedSetwork {
        NamedSetwork {
            union: union.iter().map(|s| s.to_string()).collect(),
            intersection: vec![],
            difference: vec![],
        }
    }

    fn entry(union: &[&str], interaction: Interaction, predictions: &[Variate]) -> FoldEntry {
        let table = ContingencyTable::default();
        let performance = Performance::default();
        FoldEntry {
            entry: ResultEntry {
                barcode: Barcode(0),
                setwork: named(union),
                interaction,
                p_value: 0.01,
                q_value: Some(0.02),
                sample_count: 0,
                case_count: 0,
                table,
                performance,
                effect_size: EffectSize::default(),
                confidence_intervals: ConfidenceIntervals::new(
                    &table,
                    interaction,
                    &performance,
                    ConfidenceLevel::NinetyFive,
                ),
            },
            held_out_predictions: predictions.to_vec(),
            held_out_table: ContingencyTable::new(1, 0, 0, 1),
        }
    }

    fn fold(index: usize, total: usize, phenotype: &[Variate], entries: Vec<FoldEntry>) -> FoldResult {
        FoldResult {
            fold: index,
            total_folds: total,
            provenance: Provenance::new(&SearchConfig::default(), &[], "Resp:Drug", 0),
            held_out_labels: (0..phenotype.len()).map(|i| format!("h{index}_{i}")).collect(),
            held_out_phenotype: phenotype.to_vec(),
            entries,
        }
    }

    #[test]
    fn fold_count_rounds_up() {
        assert_eq!(fold_count(103, 10), 11);
        assert_eq!(fold_count(100, 10), 10);
        assert_eq!(fold_count(7, 1), 7);
    }

    #[test]
    fn folds_cover_every_called_label_once_and_balance_classes() {
        let phenotype: Vec<Variate> = (0..23)
            .map(|i| match i {
                0..=8 => Variate::One,
                22 => Variate::Missing,
                _ => Variate::Zero,
            })
            .collect();
        let store = store_with_phenotype(&phenotype);
        let mut rng = StdRng::seed_from_u64(17);
        let folds = partition_folds(&store, FeatureId(0), 5, &mut rng);
        assert_eq!(folds.len(), 5);

        let mut held: Vec<usize> = folds.iter().flat_map(|f| f.held_out()).collect();
        held.sort_unstable();
        assert_eq!(held, (0..22).collect::<Vec<_>>());

        for fold in &folds {
            assert!((1..=2).contains(&fold.cases.len()));
            assert!((2..=3).contains(&fold.controls.len()));
            assert!(fold.training.contains(&22));
            assert!(fold.training.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(fold.training.len() + fold.held_out().len(), 23);
        }
    }

    #[test]
    fn leave_one_out_interleaves_cases_and_controls() {
        let phenotype = [Variate::One, Variate::One, Variate::Zero, Variate::Zero];
        let store = store_with_phenotype(&phenotype);
        let mut rng = StdRng::seed_from_u64(3);
        let folds = partition_folds(&store, FeatureId(0), 1, &mut rng);
        assert_eq!(folds.len(), 4);
        let shapes: Vec<(usize, usize)> =
            folds.iter().map(|f| (f.cases.len(), f.controls.len())).collect();
        assert_eq!(shapes, vec![(1, 0), (1, 0), (0, 1), (0, 1)]);
    }

    #[test]
    fn strict_consensus_requires_every_fold() {
        let phenotype = [Variate::One, Variate::Zero];
        let store = store_with_phenotype(&[Variate::One, Variate::One, Variate::Zero, Variate::Zero]);
        let calls = [Variate::One, Variate::Zero];
        let folds = vec![
            fold(0, 2, &phenotype, vec![entry(&["A:Mut"], Interaction::CoOccurring, &calls)]),
            fold(
                1,
                2,
                &phenotype,
                vec![
                    entry(&["A:Mut"], Interaction::CoOccurring, &calls),
                    entry(&["Resp:Drug"], Interaction::CoOccurring, &calls),
                ],
            ),
        ];

        let config = SearchConfig::default();
        let consensus = strict_consensus(&folds, &store, FeatureId(0), &config);
        assert_eq!(consensus.len(), 1);
        let only = &consensus[0];
        assert_eq!(only.entry.setwork, named(&["A:Mut"]));
        assert_eq!(only.entry.q_value, None);
        assert_eq!(only.held_out_table, ContingencyTable::new(2, 0, 0, 2));
        assert_eq!(only.entry.table, ContingencyTable::new(2, 0, 0, 2));

        assert!(strict_consensus(&folds[..1], &store, FeatureId(0), &config).is_empty());

        let mut with_empty = folds.clone();
        with_empty[1].entries.clear();
        assert!(strict_consensus(&with_empty, &store, FeatureId(0), &config).is_empty());
    }

    #[test]
    fn vote_uses_majority_and_inverts_mutually_exclusive_calls() {
        use Variate::{Missing as M, One as I, Zero as O};
        let phenotype = [I, O, I, O];
        let entries = vec![
            entry(&["A:Mut"], Interaction::CoOccurring, &[I, O, O, M]),
            entry(&["B:Mut"], Interaction::MutuallyExclusive, &[O, I, I, M]),
            entry(&["C:Mut"], Interaction::CoOccurring, &[M, O, M, M]),
        ];
        let summary = vote(&[fold(0, 1, &phenotype, entries)]);

        // Label 0: yes, yes -> One. Label 1: no, no, no -> Zero.
        // Label 2: no, no -> Zero (a miss). Label 3: no votes.
        assert_eq!(summary.predicted_labels, 3);
        assert_eq!(summary.omitted_labels, 1);
        assert_eq!(summary.table, ContingencyTable::new(1, 0, 1, 1));
        assert_eq!(summary.performance.sensitivity, 0.5);
        assert_eq!(summary.performance.specificity, 1.0);
    }

    #[test]
    fn tied_votes_are_omitted() {
        use Variate::{One as I, Zero as O};
        let entries = vec![
            entry(&["A:Mut"], Interaction::CoOccurring, &[I]),
            entry(&["B:Mut"], Interaction::CoOccurring, &[O]),
        ];
        let summary = vote(&[fold(0, 1, &[I], entries)]);
        assert_eq!(summary.predicted_labels, 0);
        assert_eq!(summary.omitted_labels, 1);
        assert_eq!(summary.table, ContingencyTable::default());
    }
}

//! Exhaustive one-to-one association tests.
//!
//! Supervised mode tests every marker against each phenotype this node owns.
//! Unsupervised mode tests every unordered pair of markers against each other. Both
//! correct their p-values as one family per run (per phenotype when supervised) and
//! keep what falls under the FDR threshold.

use crate::adjust::{CorrectionMethod, adjust};
use crate::config::SearchConfig;
use crate::stats::{ContingencyTable, EffectSize, LogFactorials, Performance, evaluate};
use crate::store::FeatureStore;
use crate::types::{FeatureId, Interaction};
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairwiseMode {
    Supervised,
    Unsupervised,
}

/// One feature tested against one target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairwiseEntry {
    pub feature: String,
    /// The phenotype, or the second marker when unsupervised.
    pub target: String,
    pub interaction: Interaction,
    pub p_value: f64,
    pub q_value: f64,
    pub sample_count: u64,
    pub case_count: u64,
    pub table: ContingencyTable,
    /// Only computed against a phenotype.
    pub performance: Option<Performance>,
    pub effect_size: EffectSize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairwiseResult {
    pub mode: PairwiseMode,
    pub inputs: Vec<String>,
    pub phenotype: Option<String>,
    pub label_count: usize,
    pub correction: CorrectionMethod,
    pub fdr: f64,
    /// Number of tests corrected together.
    pub tests: usize,
    pub entries: Vec<PairwiseEntry>,
}

/// Every marker against each phenotype in this node's share.
pub fn supervised(store: &FeatureStore, config: &SearchConfig, inputs: &[String]) -> Vec<PairwiseResult> {
    let factorials = LogFactorials::new(store.n_labels());
    config
        .multi_process
        .share(store.phenotypes())
        .map(|(_, &phenotype)| {
            let response = store.row(phenotype);
            let markers: Vec<FeatureId> = store
                .markers()
                .iter()
                .copied()
                .filter(|&m| m != phenotype)
                .collect();

            let tested: Vec<PairwiseEntry> = markers
                .par_iter()
                .filter_map(|&marker| {
                    let evaluation = evaluate(store.row(marker), response, &factorials);
                    if config.force_cooccurring
                        && evaluation.interaction == Interaction::MutuallyExclusive
                    {
                        return None;
                    }
                    Some(PairwiseEntry {
                        feature: store.feature_name(marker).to_string(),
                        target: store.feature_name(phenotype).to_string(),
                        interaction: evaluation.interaction,
                        p_value: evaluation.test.p_value,
                        q_value: 1.0,
                        sample_count: evaluation.sample_count(),
                        case_count: evaluation.case_count(),
                        table: evaluation.table,
                        performance: Some(evaluation.performance),
                        effect_size: evaluation.effect_size,
                    })
                })
                .collect();

            let tests = tested.len();
            let entries = correct_and_filter(tested, config)
                .into_iter()
                .filter(|e| {
                    e.performance
                        .as_ref()
                        .is_none_or(|p| config.minimum_performance.passes(p))
                })
                .collect::<Vec<_>>();
            log::info!(
                "'{}': {} of {} marker tests pass {} at FDR {}",
                store.feature_name(phenotype),
                entries.len(),
                tests,
                config.correction,
                config.fdr
            );

            PairwiseResult {
                mode: PairwiseMode::Supervised,
                inputs: inputs.to_vec(),
                phenotype: Some(store.feature_name(phenotype).to_string()),
                label_count: store.n_labels(),
                correction: config.correction,
                fdr: config.fdr,
                tests,
                entries,
            }
        })
        .collect()
}

/// Every unordered pair of distinct markers, the later one taken as the target.
pub fn unsupervised(store: &FeatureStore, config: &SearchConfig, inputs: &[String]) -> PairwiseResult {
    let factorials = LogFactorials::new(store.n_labels());
    let pairs: Vec<(FeatureId, FeatureId)> =
        store.markers().iter().copied().tuple_combinations().collect();

    let tested: Vec<PairwiseEntry> = pairs
        .par_iter()
        .map(|&(a, b)| {
            let evaluation = evaluate(store.row(a), store.row(b), &factorials);
            PairwiseEntry {
                feature: store.feature_name(a).to_string(),
                target: store.feature_name(b).to_string(),
                interaction: evaluation.interaction,
                p_value: evaluation.test.p_value,
                q_value: 1.0,
                sample_count: evaluation.sample_count(),
                case_count: evaluation.case_count(),
                table: evaluation.table,
                performance: None,
                effect_size: evaluation.effect_size,
            }
        })
        .collect();

    let tests = tested.len();
    let entries = correct_and_filter(tested, config);
    log::info!(
        "{} of {} marker pairs pass {} at FDR {}",
        entries.len(),
        tests,
        config.correction,
        config.fdr
    );

    PairwiseResult {
        mode: PairwiseMode::Unsupervised,
        inputs: inputs.to_vec(),
        phenotype: None,
        label_count: store.n_labels(),
        correction: config.correction,
        fdr: config.fdr,
        tests,
        entries,
    }
}

fn correct_and_filter(mut tested: Vec<PairwiseEntry>, config: &SearchConfig) -> Vec<PairwiseEntry> {
    let p_values: BTreeMap<usize, f64> = tested.iter().map(|e| e.p_value).enumerate().collect();
    let q_values = adjust(&p_values, config.correction);
    for (i, entry) in tested.iter_mut().enumerate() {
        entry.q_value = q_values.get(&i).copied().unwrap_or(1.0);
    }
    tested.retain(|e| e.q_value < config.fdr);
    tested
}

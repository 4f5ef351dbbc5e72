//! Persisted result records.
//!
//! A search writes one [`SearchResult`] per phenotype, cross-validation writes one
//! [`FoldResult`] per fold, and the consensus step writes a [`ConsensusResult`]. All of
//! them are plain serde structs written as TOML, so downstream reporting only needs
//! these types.

use crate::adjust::CorrectionMethod;
use crate::config::{BooleanSetLimits, MinimumPerformance, OptimizationParams, RankMethod, SearchConfig};
use crate::priors::PriorsMode;
use crate::search::{RetainedSetwork, Search, SearchOutcome, SignificanceRecord};
use crate::stats::{
    ConfidenceLevel, ContingencyTable, EffectSize, Evaluation, Performance, confidence_interval,
};
use crate::types::{Barcode, Interaction, NamedSetwork, Variate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("Failed to read or write result file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML result file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize result to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ResultsError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ResultsError> {
    let toml_string = fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_string)?)
}

/// Normal-approximation intervals around the four predictive rates, each using the
/// count of positions its rate is a fraction of.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceIntervals {
    pub level: ConfidenceLevel,
    pub sensitivity: (f64, f64),
    pub specificity: (f64, f64),
    pub ppv: (f64, f64),
    pub npv: (f64, f64),
}

impl ConfidenceIntervals {
    pub fn new(
        table: &ContingencyTable,
        interaction: Interaction,
        performance: &Performance,
        level: ConfidenceLevel,
    ) -> Self {
        let t = match interaction {
            Interaction::CoOccurring => *table,
            Interaction::MutuallyExclusive => table.inverted(),
        };
        Self {
            level,
            sensitivity: confidence_interval(performance.sensitivity, t.true_pos + t.false_neg, level),
            specificity: confidence_interval(performance.specificity, t.true_neg + t.false_pos, level),
            ppv: confidence_interval(performance.ppv, t.true_pos + t.false_pos, level),
            npv: confidence_interval(performance.npv, t.true_neg + t.false_neg, level),
        }
    }
}

/// One setwork and its statistics against a phenotype.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub barcode: Barcode,
    pub setwork: NamedSetwork,
    pub interaction: Interaction,
    pub p_value: f64,
    /// Absent when the entry was re-evaluated outside a corrected search.
    pub q_value: Option<f64>,
    pub sample_count: u64,
    pub case_count: u64,
    pub table: ContingencyTable,
    pub performance: Performance,
    pub effect_size: EffectSize,
    pub confidence_intervals: ConfidenceIntervals,
}

impl ResultEntry {
    pub fn from_record(
        barcode: Barcode,
        setwork: NamedSetwork,
        record: &SignificanceRecord,
        q_value: Option<f64>,
        level: ConfidenceLevel,
    ) -> Self {
        Self {
            barcode,
            setwork,
            interaction: record.interaction,
            p_value: record.p_value,
            q_value,
            sample_count: record.sample_count(),
            case_count: record.case_count(),
            table: record.table,
            performance: record.performance,
            effect_size: record.effect_size,
            confidence_intervals: ConfidenceIntervals::new(
                &record.table,
                record.interaction,
                &record.performance,
                level,
            ),
        }
    }

    pub fn from_evaluation(
        barcode: Barcode,
        setwork: NamedSetwork,
        evaluation: &Evaluation,
        level: ConfidenceLevel,
    ) -> Self {
        Self {
            barcode,
            setwork,
            interaction: evaluation.interaction,
            p_value: evaluation.test.p_value,
            q_value: None,
            sample_count: evaluation.sample_count(),
            case_count: evaluation.case_count(),
            table: evaluation.table,
            performance: evaluation.performance,
            effect_size: evaluation.effect_size,
            confidence_intervals: ConfidenceIntervals::new(
                &evaluation.table,
                evaluation.interaction,
                &evaluation.performance,
                level,
            ),
        }
    }

    pub(crate) fn from_retained(search: &Search<'_>, retained: &RetainedSetwork) -> Self {
        Self::from_record(
            retained.barcode,
            search.named(&retained.record.setwork),
            &retained.record,
            Some(retained.q_value),
            search.config().confidence_level,
        )
    }
}

/// The parameters a result was produced with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub inputs: Vec<String>,
    pub phenotype: String,
    pub label_count: usize,
    pub correction: CorrectionMethod,
    pub fdr: f64,
    pub rank_method: RankMethod,
    pub minimum_performance: MinimumPerformance,
    pub optimization: OptimizationParams,
    pub set_limits: BooleanSetLimits,
    pub eject_fraction: Option<f64>,
    pub bandwidth: bool,
    pub force_cooccurring: bool,
    pub priors: Option<PriorsMode>,
    pub seed: u64,
    pub permute_phenotype: bool,
}

impl Provenance {
    pub fn new(config: &SearchConfig, inputs: &[String], phenotype: &str, label_count: usize) -> Self {
        Self {
            inputs: inputs.to_vec(),
            phenotype: phenotype.to_string(),
            label_count,
            correction: config.correction,
            fdr: config.fdr,
            rank_method: config.rank_method,
            minimum_performance: config.minimum_performance,
            optimization: config.optimization.clone(),
            set_limits: config.set_limits,
            eject_fraction: config.eject_fraction,
            bandwidth: config.bandwidth,
            force_cooccurring: config.force_cooccurring,
            priors: config.priors.as_ref().map(|p| p.mode),
            seed: config.seed,
            permute_phenotype: config.permute_phenotype,
        }
    }
}

/// Retained setworks of one search over one phenotype.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub provenance: Provenance,
    pub permutation_min_q: Option<f64>,
    pub entries: Vec<ResultEntry>,
}

impl SearchResult {
    pub fn from_outcome(search: &Search<'_>, outcome: &SearchOutcome, inputs: &[String]) -> Self {
        let store = search.store();
        Self {
            provenance: Provenance::new(
                search.config(),
                inputs,
                store.feature_name(outcome.phenotype),
                store.n_labels(),
            ),
            permutation_min_q: outcome.permutation_min_q,
            entries: outcome
                .retained
                .iter()
                .map(|r| ResultEntry::from_retained(search, r))
                .collect(),
        }
    }
}

/// A setwork selected on a fold's training labels, with its calls on the held-out
/// labels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoldEntry {
    pub entry: ResultEntry,
    /// Aligned to [`FoldResult::held_out_labels`].
    pub held_out_predictions: Vec<Variate>,
    pub held_out_table: ContingencyTable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub total_folds: usize,
    pub provenance: Provenance,
    pub held_out_labels: Vec<String>,
    pub held_out_phenotype: Vec<Variate>,
    pub entries: Vec<FoldEntry>,
}

/// A setwork selected in every fold, re-evaluated on all labels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusEntry {
    pub entry: ResultEntry,
    /// Held-out calls of every fold added together.
    pub held_out_table: ContingencyTable,
    pub held_out_performance: Performance,
}

/// Majority-vote prediction over every fold's selected setworks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteSummary {
    pub table: ContingencyTable,
    pub performance: Performance,
    pub predicted_labels: usize,
    /// Held-out labels with a tied vote or no usable vote.
    pub omitted_labels: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub provenance: Provenance,
    pub folds: usize,
    pub entries: Vec<ConsensusEntry>,
    pub vote: VoteSummary,
}

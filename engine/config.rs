// ========================================================================================
//                                Search Configuration
// ========================================================================================

use crate::adjust::CorrectionMethod;
use crate::priors::{Priors, PriorsMode};
use crate::stats::{ConfidenceLevel, Performance};
use crate::types::SetOperation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("{0}")]
    InvalidValue(String),
    #[error("Optimization needs a positive repopulation frequency, got {0}.")]
    ZeroRepopulateFrequency(usize),
    #[error("The fraction to repopulate must lie in (0, 1], got {0}.")]
    RepopulatePercent(f64),
    #[error("The FDR threshold must lie in (0, 1], got {0}.")]
    Fdr(f64),
    #[error("The eject fraction must be positive, got {0}.")]
    EjectFraction(f64),
    #[error("Minimum performance cutoff '{name}' must lie in [0, 1], got {value}.")]
    PerformanceCutoff { name: &'static str, value: f64 },
    #[error("Cross-validation needs a fold size of at least one.")]
    FoldSize,
    #[error("Node index {node} is not below the total node count {total_nodes}.")]
    NodeIndex { node: usize, total_nodes: usize },
    #[error("Prior feature '{0}' is not present in the data.")]
    UnknownPriorFeature(String),
    #[error("Prior feature '{0}' is a phenotype and cannot be combined into setworks.")]
    PriorIsPhenotype(String),
    #[error("The phenotype '{0}' is not present in the data.")]
    UnknownPhenotype(String),
    #[error("No marker features are available to search over.")]
    NoMarkers,
}

/// Trial budget and the exploitation schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationParams {
    pub trials: usize,
    /// Repopulate the marker pools every this many trials.
    pub repopulate_frequency: usize,
    /// Fraction of the ranked records whose features are fed back into the pools.
    pub percent_to_repopulate: f64,
}

impl Default for OptimizationParams {
    fn default() -> Self {
        Self {
            trials: 1000,
            repopulate_frequency: 100,
            percent_to_repopulate: 0.01,
        }
    }
}

/// Maximum number of sampled features per set operation. A limit of zero leaves that
/// operation empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanSetLimits {
    pub union: usize,
    pub intersection: usize,
    pub difference: usize,
}

impl BooleanSetLimits {
    pub fn new(union: usize, intersection: usize, difference: usize) -> Self {
        Self {
            union,
            intersection,
            difference,
        }
    }

    pub fn limit(&self, op: SetOperation) -> usize {
        match op {
            SetOperation::Union => self.union,
            SetOperation::Intersection => self.intersection,
            SetOperation::Difference => self.difference,
        }
    }
}

/// Lower bounds a retained setwork's performance must meet. Unset bounds always pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MinimumPerformance {
    pub sensitivity: Option<f64>,
    pub specificity: Option<f64>,
    pub ppv: Option<f64>,
    pub npv: Option<f64>,
    pub accuracy: Option<f64>,
}

impl MinimumPerformance {
    pub fn passes(&self, performance: &Performance) -> bool {
        let gate = |cutoff: Option<f64>, value: f64| cutoff.is_none_or(|c| value >= c);
        gate(self.sensitivity, performance.sensitivity)
            && gate(self.specificity, performance.specificity)
            && gate(self.ppv, performance.ppv)
            && gate(self.npv, performance.npv)
            && gate(self.accuracy, performance.accuracy)
    }

    fn cutoffs(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("sensitivity", self.sensitivity),
            ("specificity", self.specificity),
            ("ppv", self.ppv),
            ("npv", self.npv),
            ("accuracy", self.accuracy),
        ]
    }
}

/// Parses whitespace- or comma-separated `metric=value` tokens such as
/// `sens=0.8 spec=0.7`. Only the first three letters of the metric are significant.
impl FromStr for MinimumPerformance {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut gates = MinimumPerformance::default();
        for token in s.split(|c: char| c == ',' || c.is_whitespace()) {
            if token.is_empty() {
                continue;
            }
            let Some((metric, value)) = token.split_once('=') else {
                return Err(ConfigError::InvalidValue(format!(
                    "minimum performance token '{token}' is not of the form metric=value"
                )));
            };
            let value: f64 = value.trim().parse().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "minimum performance value in '{token}' is not a number"
                ))
            })?;
            let prefix: String = metric.trim().to_ascii_lowercase().chars().take(3).collect();
            let slot = match prefix.as_str() {
                "sen" => &mut gates.sensitivity,
                "spe" => &mut gates.specificity,
                "ppv" => &mut gates.ppv,
                "npv" => &mut gates.npv,
                "acc" => &mut gates.accuracy,
                _ => {
                    return Err(ConfigError::InvalidValue(format!(
                        "unknown minimum performance metric '{metric}'; expected sens, spec, ppv, npv, or acc"
                    )));
                }
            };
            *slot = Some(value);
        }
        Ok(gates)
    }
}

/// How retained setworks are ordered when choosing which to exploit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RankMethod {
    #[default]
    BalancedAccuracy,
    /// Sensitivity, then specificity.
    Sensitivity,
    /// Specificity, then sensitivity.
    Specificity,
    MeanPredictiveValue,
    /// NPV, then PPV.
    Npv,
    /// PPV, then NPV.
    Ppv,
    Accuracy,
    Mcc,
}

impl RankMethod {
    /// Primary and secondary sort keys, both larger-is-better.
    pub fn score(self, p: &Performance) -> (f64, f64) {
        match self {
            Self::BalancedAccuracy => (p.balanced_accuracy(), 0.0),
            Self::Sensitivity => (p.sensitivity, p.specificity),
            Self::Specificity => (p.specificity, p.sensitivity),
            Self::MeanPredictiveValue => (p.mean_predictive_value(), 0.0),
            Self::Npv => (p.npv, p.ppv),
            Self::Ppv => (p.ppv, p.npv),
            Self::Accuracy => (p.accuracy, 0.0),
            Self::Mcc => (p.mcc, 0.0),
        }
    }

    /// Descending order by score.
    pub fn compare(self, a: &Performance, b: &Performance) -> Ordering {
        let (a0, a1) = self.score(a);
        let (b0, b1) = self.score(b);
        b0.total_cmp(&a0).then(b1.total_cmp(&a1))
    }
}

impl FromStr for RankMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "balancedaccuracy" => Ok(Self::BalancedAccuracy),
            "sensitivity" | "sens" => Ok(Self::Sensitivity),
            "specificity" | "spec" => Ok(Self::Specificity),
            "meanpredictivevalue" => Ok(Self::MeanPredictiveValue),
            "npv" => Ok(Self::Npv),
            "ppv" => Ok(Self::Ppv),
            "accuracy" => Ok(Self::Accuracy),
            "mcc" => Ok(Self::Mcc),
            _ => Err(format!(
                "unknown rank method '{s}'; expected BalancedAccuracy, Sensitivity, Specificity, MeanPredictiveValue, NPV, PPV, Accuracy, or MCC"
            )),
        }
    }
}

impl fmt::Display for RankMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BalancedAccuracy => "BalancedAccuracy",
            Self::Sensitivity => "Sensitivity",
            Self::Specificity => "Specificity",
            Self::MeanPredictiveValue => "MeanPredictiveValue",
            Self::Npv => "NPV",
            Self::Ppv => "PPV",
            Self::Accuracy => "Accuracy",
            Self::Mcc => "MCC",
        })
    }
}

impl TryFrom<String> for RankMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RankMethod> for String {
    fn from(value: RankMethod) -> Self {
        value.to_string()
    }
}

/// Prior features and how to inject them into each trial.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorsConfig {
    pub mode: PriorsMode,
    #[serde(flatten)]
    pub features: Priors,
}

/// Static partition of work across independent processes. This process handles the
/// items whose index is congruent to `node` modulo `total_nodes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiProcess {
    pub node: usize,
    pub total_nodes: usize,
}

impl Default for MultiProcess {
    fn default() -> Self {
        Self {
            node: 0,
            total_nodes: 1,
        }
    }
}

impl MultiProcess {
    #[inline]
    pub fn owns(&self, index: usize) -> bool {
        index % self.total_nodes == self.node
    }

    /// The items of `all` this node is responsible for.
    pub fn share<'a, T>(&self, all: &'a [T]) -> impl Iterator<Item = (usize, &'a T)> + 'a {
        let (node, step) = (self.node, self.total_nodes.max(1));
        all.iter().enumerate().skip(node).step_by(step)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub optimization: OptimizationParams,
    pub set_limits: BooleanSetLimits,
    pub correction: CorrectionMethod,
    pub fdr: f64,
    pub rank_method: RankMethod,
    pub minimum_performance: MinimumPerformance,
    /// `None` turns passenger ejection off.
    pub eject_fraction: Option<f64>,
    /// Allow several thresholded variants of one base feature in a setwork.
    pub bandwidth: bool,
    pub force_cooccurring: bool,
    pub priors: Option<PriorsConfig>,
    pub seed: u64,
    pub permute_phenotype: bool,
    pub multi_process: MultiProcess,
    /// Held-out labels per cross-validation fold.
    pub fold_size: Option<usize>,
    pub confidence_level: ConfidenceLevel,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            optimization: OptimizationParams::default(),
            set_limits: BooleanSetLimits::default(),
            correction: CorrectionMethod::BenjaminiHochberg,
            fdr: 0.05,
            rank_method: RankMethod::BalancedAccuracy,
            minimum_performance: MinimumPerformance::default(),
            eject_fraction: Some(0.1),
            bandwidth: false,
            force_cooccurring: false,
            priors: None,
            seed: 0,
            permute_phenotype: false,
            multi_process: MultiProcess::default(),
            fold_size: None,
            confidence_level: ConfidenceLevel::NinetyFive,
        }
    }
}

impl SearchConfig {
    /// Reads a TOML configuration. Absent keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: SearchConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value that does not depend on the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let opt = &self.optimization;
        if opt.repopulate_frequency == 0 {
            return Err(ConfigError::ZeroRepopulateFrequency(opt.repopulate_frequency));
        }
        if !(opt.percent_to_repopulate > 0.0 && opt.percent_to_repopulate <= 1.0) {
            return Err(ConfigError::RepopulatePercent(opt.percent_to_repopulate));
        }
        if !(self.fdr > 0.0 && self.fdr <= 1.0) {
            return Err(ConfigError::Fdr(self.fdr));
        }
        if let Some(fraction) = self.eject_fraction {
            if !(fraction > 0.0 && fraction.is_finite()) {
                return Err(ConfigError::EjectFraction(fraction));
            }
        }
        for (name, cutoff) in self.minimum_performance.cutoffs() {
            if let Some(value) = cutoff {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::PerformanceCutoff { name, value });
                }
            }
        }
        if self.fold_size == Some(0) {
            return Err(ConfigError::FoldSize);
        }
        let mp = self.multi_process;
        if mp.total_nodes == 0 || mp.node >= mp.total_nodes {
            return Err(ConfigError::NodeIndex {
                node: mp.node,
                total_nodes: mp.total_nodes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SearchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.optimization.trials, 1000);
        assert_eq!(config.eject_fraction, Some(0.1));
        assert_eq!(config.set_limits, BooleanSetLimits::new(0, 0, 0));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: SearchConfig = toml::from_str(
            r#"
            fdr = 0.1
            correction = "bonferroni"
            rank_method = "mcc"

            [set_limits]
            union = 2
            intersection = 1
            difference = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.fdr, 0.1);
        assert_eq!(config.correction, CorrectionMethod::Bonferroni);
        assert_eq!(config.rank_method, RankMethod::Mcc);
        assert_eq!(config.set_limits.limit(SetOperation::Union), 2);
        assert_eq!(config.optimization, OptimizationParams::default());
    }

    #[test]
    fn bad_method_names_fail_to_parse() {
        let err = toml::from_str::<SearchConfig>(r#"correction = "fisher""#);
        assert!(err.is_err());
        let err = toml::from_str::<SearchConfig>(r#"rank_method = "f1""#);
        assert!(err.is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = SearchConfig::default();
        config.fdr = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Fdr(_))));

        let mut config = SearchConfig::default();
        config.multi_process = MultiProcess {
            node: 2,
            total_nodes: 2,
        };
        assert!(matches!(config.validate(), Err(ConfigError::NodeIndex { .. })));

        let mut config = SearchConfig::default();
        config.fold_size = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::FoldSize)));

        let mut config = SearchConfig::default();
        config.minimum_performance.sensitivity = Some(1.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PerformanceCutoff { name: "sensitivity", .. })
        ));
    }

    #[test]
    fn minimum_performance_tokens() {
        let gates: MinimumPerformance = "Sens=0.8 specificity=0.7,npv=0.5".parse().unwrap();
        assert_eq!(gates.sensitivity, Some(0.8));
        assert_eq!(gates.specificity, Some(0.7));
        assert_eq!(gates.npv, Some(0.5));
        assert_eq!(gates.ppv, None);

        let good = Performance {
            sensitivity: 0.9,
            specificity: 0.7,
            npv: 0.5,
            ..Performance::default()
        };
        assert!(gates.passes(&good));
        let bad = Performance {
            specificity: 0.69,
            ..good
        };
        assert!(!gates.passes(&bad));

        assert!("sens:0.8".parse::<MinimumPerformance>().is_err());
        assert!("f1=0.8".parse::<MinimumPerformance>().is_err());
    }

    #[test]
    fn rank_method_breaks_ties_on_secondary_metric() {
        let a = Performance {
            sensitivity: 0.8,
            specificity: 0.6,
            ..Performance::default()
        };
        let b = Performance {
            sensitivity: 0.8,
            specificity: 0.9,
            ..Performance::default()
        };
        assert_eq!(RankMethod::Sensitivity.compare(&a, &b), Ordering::Greater);
        assert_eq!(RankMethod::Specificity.compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn multi_process_strides_items() {
        let mp = MultiProcess {
            node: 1,
            total_nodes: 3,
        };
        let items = ["a", "b", "c", "d", "e"];
        let mine: Vec<_> = mp.share(&items).map(|(_, x)| *x).collect();
        assert_eq!(mine, vec!["b", "e"]);
        assert!(mp.owns(4));
        assert!(!mp.owns(0));
    }
}

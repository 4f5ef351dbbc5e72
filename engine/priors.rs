use crate::combine::{multiplicities, weighted_sample};
use crate::config::{ConfigError, PriorsConfig};
use crate::results::SearchResult;
use crate::store::FeatureStore;
use crate::types::{FeatureId, SetOperation};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Largest number of prior features drawn for one operation in the random modes.
const MAX_PRIOR_DRAW: usize = 10;

#[derive(Error, Debug)]
pub enum PriorsError {
    #[error("Failed to read or write priors file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line {line_number} of the priors file is not of the form '<operation> = <features>': '{line}'")]
    MalformedLine { line_number: usize, line: String },
    #[error("Unknown set operation '{0}' in priors file; expected union, intersection, or difference.")]
    UnknownOperation(String),
}

/// How prior features enter each trial's combinations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PriorsMode {
    /// Every prior feature goes into every combination.
    #[default]
    Strict,
    /// A multiplicity-weighted subset, drawn again each trial.
    Weighted,
    /// A uniform subset of the distinct prior features, drawn again each trial.
    Stochastic,
}

impl FromStr for PriorsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "weighted" => Ok(Self::Weighted),
            "stochastic" => Ok(Self::Stochastic),
            _ => Err(format!(
                "unknown priors mode '{s}'; expected strict, weighted, or stochastic"
            )),
        }
    }
}

impl fmt::Display for PriorsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Strict => "strict",
            Self::Weighted => "weighted",
            Self::Stochastic => "stochastic",
        })
    }
}

impl TryFrom<String> for PriorsMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PriorsMode> for String {
    fn from(value: PriorsMode) -> Self {
        value.to_string()
    }
}

/// Prior feature keys per set operation. Repeats are meaningful: they weight the
/// feature in weighted mode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Priors {
    pub union: Vec<String>,
    pub intersection: Vec<String>,
    pub difference: Vec<String>,
}

impl Priors {
    /// Reads lines of the form `union = A B C`. Blank lines and `#` comments are
    /// skipped; an operation that never appears has no priors.
    pub fn parse(text: &str) -> Result<Self, PriorsError> {
        let mut priors = Priors::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, features)) = line.split_once('=') else {
                return Err(PriorsError::MalformedLine {
                    line_number: idx + 1,
                    line: raw.to_string(),
                });
            };
            let list = match key.trim().to_ascii_lowercase().as_str() {
                "union" => &mut priors.union,
                "intersection" => &mut priors.intersection,
                "difference" => &mut priors.difference,
                other => return Err(PriorsError::UnknownOperation(other.to_string())),
            };
            *list = features.split_whitespace().map(str::to_string).collect();
        }
        Ok(priors)
    }

    pub fn load(path: &Path) -> Result<Self, PriorsError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Pools the features of every retained setwork, keeping repeats so that features
    /// found often weigh more in a later weighted search.
    pub fn from_results(result: &SearchResult) -> Self {
        let mut priors = Priors::default();
        for entry in &result.entries {
            priors.union.extend(entry.setwork.union.iter().cloned());
            priors.intersection.extend(entry.setwork.intersection.iter().cloned());
            priors.difference.extend(entry.setwork.difference.iter().cloned());
        }
        priors
    }

    pub fn to_file_string(&self) -> String {
        format!(
            "union = {}\nintersection = {}\ndifference = {}\n",
            self.union.join(" "),
            self.intersection.join(" "),
            self.difference.join(" ")
        )
    }

    pub fn save(&self, path: &Path) -> Result<(), PriorsError> {
        fs::write(path, self.to_file_string())?;
        Ok(())
    }

    pub fn list(&self, op: SetOperation) -> &[String] {
        match op {
            SetOperation::Union => &self.union,
            SetOperation::Intersection => &self.intersection,
            SetOperation::Difference => &self.difference,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.union.is_empty() && self.intersection.is_empty() && self.difference.is_empty()
    }
}

/// Priors with every key resolved against a feature store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPriors {
    mode: PriorsMode,
    lists: [Vec<FeatureId>; 3],
}

impl ResolvedPriors {
    pub fn resolve(config: &PriorsConfig, store: &FeatureStore) -> Result<Self, ConfigError> {
        let mut lists: [Vec<FeatureId>; 3] = Default::default();
        for op in SetOperation::ALL {
            lists[op.index()] = config
                .features
                .list(op)
                .iter()
                .map(|key| {
                    let id = store
                        .feature_id(key)
                        .ok_or_else(|| ConfigError::UnknownPriorFeature(key.clone()))?;
                    if store.phenotypes().contains(&id) {
                        return Err(ConfigError::PriorIsPhenotype(key.clone()));
                    }
                    Ok(id)
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(Self {
            mode: config.mode,
            lists,
        })
    }

    /// Picks this trial's prior features for each operation.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> [Vec<FeatureId>; 3] {
        let mut drawn: [Vec<FeatureId>; 3] = Default::default();
        for op in SetOperation::ALL {
            let list = &self.lists[op.index()];
            let distinct: Vec<FeatureId> = multiplicities(list).into_iter().map(|(id, _)| id).collect();
            drawn[op.index()] = match self.mode {
                PriorsMode::Strict => distinct,
                PriorsMode::Weighted => {
                    let count = draw_count(rng).min(distinct.len());
                    weighted_sample(list, count, rng)
                }
                PriorsMode::Stochastic => {
                    let count = draw_count(rng).min(distinct.len());
                    distinct.choose_multiple(rng, count).copied().collect()
                }
            };
        }
        drawn
    }

    /// Adds this trial's prior features to every combination of the matching
    /// operation. Combinations that become identical collapse into one.
    pub fn inject<R: Rng + ?Sized>(&self, combinations: &mut [Vec<Vec<FeatureId>>; 3], rng: &mut R) {
        let drawn = self.draw(rng);
        for op in SetOperation::ALL {
            let prior = &drawn[op.index()];
            if prior.is_empty() {
                continue;
            }
            let combos = &mut combinations[op.index()];
            for combo in combos.iter_mut() {
                combo.extend_from_slice(prior);
                combo.sort_unstable();
                combo.dedup();
            }
            combos.sort();
            combos.dedup();
        }
    }
}

/// Draws a size in `1..=10` where size `j` has weight `11 - j`.
fn draw_count<R: Rng + ?Sized>(rng: &mut R) -> usize {
    let total: usize = (1..=MAX_PRIOR_DRAW).sum();
    let mut ticket = rng.gen_range(0..total);
    for size in 1..=MAX_PRIOR_DRAW {
        let weight = MAX_PRIOR_DRAW + 1 - size;
        if ticket < weight {
            return size;
        }
        ticket -= weight;
    }
    MAX_PRIOR_DRAW
}

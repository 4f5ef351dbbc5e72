// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One cell of a binary feature vector. Missing values are a first-class state and
/// propagate through the set algebra instead of being coerced to zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Variate {
    #[default]
    Zero,
    One,
    Missing,
}

impl Variate {
    #[inline]
    pub fn from_bool(value: bool) -> Self {
        if value { Self::One } else { Self::Zero }
    }

    #[inline]
    pub fn is_missing(self) -> bool {
        self == Self::Missing
    }

    /// `Some(true)` for one, `Some(false)` for zero, `None` when missing.
    #[inline]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Zero => Some(false),
            Self::One => Some(true),
            Self::Missing => None,
        }
    }

    /// Three-valued OR: one dominates, then missing.
    #[inline]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::One, _) | (_, Self::One) => Self::One,
            (Self::Missing, _) | (_, Self::Missing) => Self::Missing,
            _ => Self::Zero,
        }
    }

    /// Three-valued AND: zero dominates, then missing.
    #[inline]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Zero, _) | (_, Self::Zero) => Self::Zero,
            (Self::Missing, _) | (_, Self::Missing) => Self::Missing,
            _ => Self::One,
        }
    }

    /// `self AND NOT other`, zero whenever `self` is zero or `other` is one.
    #[inline]
    pub fn and_not(self, other: Self) -> Self {
        match (self, other) {
            (Self::Zero, _) | (_, Self::One) => Self::Zero,
            (Self::One, Self::Zero) => Self::One,
            _ => Self::Missing,
        }
    }
}

impl From<Variate> for i8 {
    fn from(value: Variate) -> Self {
        match value {
            Variate::Zero => 0,
            Variate::One => 1,
            Variate::Missing => -1,
        }
    }
}

impl TryFrom<i8> for Variate {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            -1 => Ok(Self::Missing),
            other => Err(format!("invalid variate code {other}; expected 0, 1, or -1")),
        }
    }
}

/// Row index of a feature inside a [`crate::store::FeatureStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureId(pub usize);

/// Process-unique identifier of a scored setwork. Issued from a monotonic counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Barcode(pub u64);

impl fmt::Display for Barcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SW{:08}", self.0)
    }
}

/// Direction of association between a predictor and the phenotype.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interaction {
    #[serde(rename = "Co-occurring")]
    CoOccurring,
    #[serde(rename = "MutuallyExclusive")]
    MutuallyExclusive,
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CoOccurring => f.write_str("Co-occurring"),
            Self::MutuallyExclusive => f.write_str("MutuallyExclusive"),
        }
    }
}

impl std::str::FromStr for Interaction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "cooccurring" => Ok(Self::CoOccurring),
            "mutuallyexclusive" => Ok(Self::MutuallyExclusive),
            _ => Err(format!(
                "unknown interaction '{s}'; expected 'Co-occurring' or 'MutuallyExclusive'"
            )),
        }
    }
}

/// The three Boolean set operations a setwork is composed of, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SetOperation {
    Union,
    Intersection,
    Difference,
}

impl SetOperation {
    pub const ALL: [SetOperation; 3] = [Self::Union, Self::Intersection, Self::Difference];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::Union => 0,
            Self::Intersection => 1,
            Self::Difference => 2,
        }
    }
}

/// A composite predictor: `((∪ union) ∩ intersection...) − difference...`.
///
/// Each list is kept sorted and free of repeats, so two setworks with the same
/// contents always compare and hash equal regardless of how they were generated.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Setwork {
    pub union: Vec<FeatureId>,
    pub intersection: Vec<FeatureId>,
    pub difference: Vec<FeatureId>,
}

impl Setwork {
    pub fn new(
        mut union: Vec<FeatureId>,
        mut intersection: Vec<FeatureId>,
        mut difference: Vec<FeatureId>,
    ) -> Self {
        for list in [&mut union, &mut intersection, &mut difference] {
            list.sort_unstable();
            list.dedup();
        }
        Self {
            union,
            intersection,
            difference,
        }
    }

    pub fn operation(&self, op: SetOperation) -> &[FeatureId] {
        match op {
            SetOperation::Union => &self.union,
            SetOperation::Intersection => &self.intersection,
            SetOperation::Difference => &self.difference,
        }
    }

    /// All features across the triple, in union, intersection, difference order.
    pub fn features(&self) -> impl Iterator<Item = FeatureId> + '_ {
        self.union
            .iter()
            .chain(&self.intersection)
            .chain(&self.difference)
            .copied()
    }

    pub fn distinct_features(&self) -> BTreeSet<FeatureId> {
        self.features().collect()
    }
}

/// A setwork expressed with feature keys instead of store-local indices. This is the
/// form that survives persistence and is compared across cross-validation folds.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamedSetwork {
    pub union: Vec<String>,
    pub intersection: Vec<String>,
    pub difference: Vec<String>,
}

impl fmt::Display for NamedSetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "U[{}] I[{}] D[{}]",
            self.union.join(", "),
            self.intersection.join(", "),
            self.difference.join(", ")
        )
    }
}

/// The underlying feature name of a key, with any threshold or data-type suffix
/// stripped: `TP53>=1.5:Expression` and `TP53:Mutation` both reduce to `TP53`.
pub fn base_feature_name(feature: &str) -> &str {
    feature
        .split(|c: char| c == ':' || c == '<' || c == '>' || c.is_whitespace())
        .find(|part| !part.is_empty())
        .unwrap_or(feature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Variate; 3] = [Variate::Zero, Variate::One, Variate::Missing];

    #[test]
    fn three_valued_or_only_missing_without_a_one() {
        for a in ALL {
            for b in ALL {
                let expected = if a == Variate::One || b == Variate::One {
                    Variate::One
                } else if a.is_missing() || b.is_missing() {
                    Variate::Missing
                } else {
                    Variate::Zero
                };
                assert_eq!(a.or(b), expected, "{a:?} OR {b:?}");
                assert_eq!(a.or(b), b.or(a));
            }
        }
    }

    #[test]
    fn three_valued_and_only_missing_without_a_zero() {
        for a in ALL {
            for b in ALL {
                let expected = if a == Variate::Zero || b == Variate::Zero {
                    Variate::Zero
                } else if a.is_missing() || b.is_missing() {
                    Variate::Missing
                } else {
                    Variate::One
                };
                assert_eq!(a.and(b), expected, "{a:?} AND {b:?}");
            }
        }
    }

    #[test]
    fn and_not_truth_table() {
        assert_eq!(Variate::One.and_not(Variate::Zero), Variate::One);
        assert_eq!(Variate::One.and_not(Variate::One), Variate::Zero);
        assert_eq!(Variate::Zero.and_not(Variate::Missing), Variate::Zero);
        assert_eq!(Variate::Missing.and_not(Variate::One), Variate::Zero);
        assert_eq!(Variate::One.and_not(Variate::Missing), Variate::Missing);
        assert_eq!(Variate::Missing.and_not(Variate::Zero), Variate::Missing);
    }

    #[test]
    fn setwork_normalizes_order_and_repeats() {
        let a = Setwork::new(
            vec![FeatureId(3), FeatureId(1), FeatureId(3)],
            vec![],
            vec![FeatureId(9), FeatureId(2)],
        );
        let b = Setwork::new(
            vec![FeatureId(1), FeatureId(3)],
            vec![],
            vec![FeatureId(2), FeatureId(9)],
        );
        assert_eq!(a, b);
        assert_eq!(a.union, vec![FeatureId(1), FeatureId(3)]);
        assert_eq!(a.distinct_features().len(), 4);
    }

    #[test]
    fn base_feature_name_strips_threshold_and_type() {
        assert_eq!(base_feature_name("TP53>=1.5:Expression"), "TP53");
        assert_eq!(base_feature_name("TP53<-0.5:Expression"), "TP53");
        assert_eq!(base_feature_name("TP53:Mutation"), "TP53");
        assert_eq!(base_feature_name("KRAS"), "KRAS");
        assert_eq!(base_feature_name("Smoker.2:Clinical"), "Smoker.2");
    }

    #[test]
    fn variate_codes_round_trip_through_i8() {
        for v in ALL {
            let code: i8 = v.into();
            assert_eq!(Variate::try_from(code).unwrap(), v);
        }
        assert!(Variate::try_from(2).is_err());
    }

    #[test]
    fn interaction_parses_loosely() {
        assert_eq!("co-occurring".parse::<Interaction>().unwrap(), Interaction::CoOccurring);
        assert_eq!(
            "MutuallyExclusive".parse::<Interaction>().unwrap(),
            Interaction::MutuallyExclusive
        );
        assert!("sideways".parse::<Interaction>().is_err());
    }
}

//! Re-evaluation of externally supplied setworks.
//!
//! Setworks found on one data set can be checked against another by naming their
//! features. Rows that cannot be assessed on the new store are reported as such rather
//! than failing the whole run.

use crate::algebra::assemble;
use crate::results::ResultEntry;
use crate::stats::{ConfidenceLevel, LogFactorials, evaluate, evaluate_with_interaction};
use crate::store::FeatureStore;
use crate::types::{Barcode, FeatureId, Interaction, NamedSetwork, Setwork};
use serde::{Deserialize, Serialize};

/// One setwork to validate. Without an interaction the direction favoured by the test
/// on the new data is used.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetworkRow {
    pub union: Vec<String>,
    pub intersection: Vec<String>,
    pub difference: Vec<String>,
    pub interaction: Option<Interaction>,
}

impl SetworkRow {
    pub fn named(&self) -> NamedSetwork {
        NamedSetwork {
            union: self.union.clone(),
            intersection: self.intersection.clone(),
            difference: self.difference.clone(),
        }
    }
}

/// File layout of a list of setworks to validate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetworkList {
    pub setworks: Vec<SetworkRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Assessed(ResultEntry),
    Unassessable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub phenotype: String,
    /// Position of the row in the input list.
    pub row: usize,
    pub setwork: NamedSetwork,
    pub outcome: ValidationOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub inputs: Vec<String>,
    pub label_count: usize,
    pub records: Vec<ValidationRecord>,
}

/// Maps every feature key of a named setwork to the store. The error carries the first
/// key the store does not hold.
pub fn resolve_setwork(store: &FeatureStore, named: &NamedSetwork) -> Result<Setwork, String> {
    let ids = |keys: &[String]| -> Result<Vec<FeatureId>, String> {
        keys.iter()
            .map(|key| store.feature_id(key).ok_or_else(|| key.clone()))
            .collect()
    };
    Ok(Setwork::new(
        ids(&named.union)?,
        ids(&named.intersection)?,
        ids(&named.difference)?,
    ))
}

/// Evaluates every row against every phenotype of the store.
pub fn validate_setworks(
    store: &FeatureStore,
    rows: &[SetworkRow],
    level: ConfidenceLevel,
) -> Vec<ValidationRecord> {
    let factorials = LogFactorials::new(store.n_labels());

    let assembled: Vec<Result<_, String>> = rows
        .iter()
        .map(|row| {
            let setwork = resolve_setwork(store, &row.named())
                .map_err(|key| format!("unknown feature '{key}'"))?;
            assemble(store, &setwork)
                .ok_or_else(|| "setwork has neither union nor intersection features".to_string())
        })
        .collect();

    let mut records = Vec::with_capacity(rows.len() * store.phenotypes().len());
    for &phenotype in store.phenotypes() {
        let response = store.row(phenotype);
        for (index, (row, vector)) in rows.iter().zip(&assembled).enumerate() {
            let named = row.named();
            let outcome = match vector {
                Ok(vector) => {
                    let evaluation = match row.interaction {
                        Some(interaction) => evaluate_with_interaction(
                            vector.view(),
                            response,
                            &factorials,
                            interaction,
                        ),
                        None => evaluate(vector.view(), response, &factorials),
                    };
                    ValidationOutcome::Assessed(ResultEntry::from_evaluation(
                        Barcode(index as u64),
                        named.clone(),
                        &evaluation,
                        level,
                    ))
                }
                Err(reason) => ValidationOutcome::Unassessable {
                    reason: reason.clone(),
                },
            };
            records.push(ValidationRecord {
                phenotype: store.feature_name(phenotype).to_string(),
                row: index,
                setwork: named,
                outcome,
            });
        }
    }

    let unassessable = assembled.iter().filter(|a| a.is_err()).count();
    if unassessable > 0 {
        log::warn!("{unassessable} of {} setworks could not be assessed on this data", rows.len());
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ContingencyTable;
    use crate::types::Variate;
    use ndarray::Array2;

    fn store() -> FeatureStore {
        use Variate::{Missing as M, One as I, Zero as O};
        let features: Vec<String> = ["Resp:Drug", "A:Mut", "B:Mut"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        FeatureStore::new(
            (0..6).map(|i| format!("s{i}")).collect(),
            features.clone(),
            Array2::from_shape_vec(
                (3, 6),
                vec![
                    I, I, I, O, O, O, //
                    I, I, O, O, O, M, //
                    O, O, O, I, I, I,
                ],
            )
            .unwrap(),
            &features[..1],
            &features[1..],
        )
        .unwrap()
    }

    fn row(union: &[&str], interaction: Option<Interaction>) -> SetworkRow {
        SetworkRow {
            union: union.iter().map(|s| s.to_string()).collect(),
            interaction,
            ..SetworkRow::default()
        }
    }

    #[test]
    fn resolves_known_names_and_reports_the_first_unknown() {
        let store = store();
        let named = row(&["B:Mut", "A:Mut"], None).named();
        let setwork = resolve_setwork(&store, &named).unwrap();
        assert_eq!(setwork.union, vec![FeatureId(1), FeatureId(2)]);

        let missing = row(&["A:Mut", "Z:Mut"], None).named();
        assert_eq!(resolve_setwork(&store, &missing).unwrap_err(), "Z:Mut");
    }

    #[test]
    fn assessed_rows_carry_statistics_without_q_values() {
        let store = store();
        let records = validate_setworks(
            &store,
            &[row(&["A:Mut"], None), row(&["B:Mut"], Some(Interaction::CoOccurring))],
            ConfidenceLevel::NinetyFive,
        );
        assert_eq!(records.len(), 2);

        let ValidationOutcome::Assessed(a) = &records[0].outcome else {
            panic!("A should be assessable");
        };
        assert_eq!(a.table, ContingencyTable::new(2, 0, 1, 2));
        assert_eq!(a.sample_count, 5);
        assert_eq!(a.q_value, None);

        let ValidationOutcome::Assessed(b) = &records[1].outcome else {
            panic!("B should be assessable");
        };
        assert_eq!(b.interaction, Interaction::CoOccurring);
        assert_eq!(b.performance.sensitivity, 0.0);
    }

    #[test]
    fn unknown_or_empty_rows_are_unassessable() {
        let store = store();
        let records = validate_setworks(
            &store,
            &[row(&["Z:Mut"], None), SetworkRow::default()],
            ConfidenceLevel::NinetyFive,
        );
        assert!(
            records
                .iter()
                .all(|r| matches!(r.outcome, ValidationOutcome::Unassessable { .. }))
        );
    }

    #[test]
    fn setwork_list_reads_from_toml() {
        let text = r#"
            [[setworks]]
            union = ["A:Mut"]
            interaction = "MutuallyExclusive"

            [[setworks]]
            intersection = ["A:Mut", "B:Mut"]
        "#;
        let list: SetworkList = toml::from_str(text).unwrap();
        assert_eq!(list.setworks.len(), 2);
        assert_eq!(list.setworks[0].interaction, Some(Interaction::MutuallyExclusive));
        assert!(list.setworks[1].union.is_empty());
    }
}

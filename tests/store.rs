use setwork::store::{FeatureStore, StoreError, load_binary_matrix};
use setwork::types::Variate;
use std::fs;
use std::path::Path;

fn write(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn tsv_and_csv_matrices_merge_into_one_store() {
    let dir = tempfile::tempdir().unwrap();
    let mutations = write(
        dir.path(),
        "mutations.tsv",
        "Feature\ts1\ts2\ts3\ts4\n\
         TP53\t1\t0\tNA\t1\n\
         KRAS\t0\t0\t0\t1\n\
         EGFR:Mutation\t1\t1\t1.0\t0\n",
    );
    let response = write(
        dir.path(),
        "drug.csv",
        "Feature,s4,s3,s2,s1,s9\n\
         Erlotinib,1,0,0.0,1,1\n",
    );

    let matrices = vec![
        load_binary_matrix(&mutations, "Mutation", "NA").unwrap(),
        load_binary_matrix(&response, "Drug", "NA").unwrap(),
    ];
    assert_eq!(
        matrices[0].features,
        vec!["TP53:Mutation", "KRAS:Mutation", "EGFR:Mutation"]
    );
    assert_eq!(matrices[0].rows[0][2], Variate::Missing);
    assert_eq!(matrices[0].rows[2][2], Variate::One);

    let store = FeatureStore::from_matrices(&matrices, Some("Drug"), 2).unwrap();
    assert_eq!(store.labels(), &["s1", "s2", "s3", "s4"]);
    assert_eq!(store.markers().len(), 2);
    assert!(store.feature_id("KRAS:Mutation").is_none());

    let drug = store.feature_id("Erlotinib:Drug").unwrap();
    assert_eq!(store.phenotypes(), &[drug]);
    assert_eq!(
        store.row(drug).to_vec(),
        vec![Variate::One, Variate::Zero, Variate::Zero, Variate::One]
    );
}

#[test]
fn short_rows_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "bad.tsv", "Feature\ts1\ts2\nA\t1\n");
    let err = load_binary_matrix(&path, "X", "NA").unwrap_err();
    assert!(matches!(
        err,
        StoreError::RowLengthMismatch {
            found: 1,
            expected: 2,
            ..
        }
    ));
}

#[test]
fn empty_file_is_an_empty_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "empty.tsv", "");
    let err = load_binary_matrix(&path, "X", "NA").unwrap_err();
    assert!(matches!(err, StoreError::EmptyMatrix { .. }));
}

#[test]
fn unknown_phenotype_type_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "m.tsv", "Feature\ts1\nA\t1\n");
    let matrix = load_binary_matrix(&path, "Mutation", "NA").unwrap();
    let err = FeatureStore::from_matrices(&[matrix], Some("Drug"), 0).unwrap_err();
    assert!(matches!(err, StoreError::UnknownPhenotypeType(_)));
}

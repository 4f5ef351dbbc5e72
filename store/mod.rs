//! # Feature Store
//!
//! The single input contract of the search engine: an ordered list of sample labels,
//! an ordered list of binary feature keys, and the feature × label matrix of
//! [`Variate`]s that aligns them. The store also records which features are
//! phenotypes (responses) and which are markers (explanatory candidates).
//!
//! The store validates its own shape once at construction and is read-only to the
//! engine afterwards. Every later lookup from feature key to row goes through the
//! precomputed `feature_index` map instead of scanning the key list.

pub mod load;

use crate::types::{FeatureId, Variate};
use ahash::AHashMap;
use ndarray::{Array2, ArrayView1, Axis};
use thiserror::Error;

pub use load::{BinaryMatrix, load_binary_matrix};

/// Shape and content failures detected while building a [`FeatureStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error reading delimited matrix: {0}")]
    Csv(#[from] csv::Error),
    #[error("Matrix '{source_name}' is empty or has no header row.")]
    EmptyMatrix { source_name: String },
    #[error(
        "Row for feature '{feature}' in '{source_name}' has {found} values, but the header declares {expected} labels."
    )]
    RowLengthMismatch {
        source_name: String,
        feature: String,
        found: usize,
        expected: usize,
    },
    #[error("Variate matrix has shape {found:?}, expected ({features}, {labels}).")]
    ShapeMismatch {
        found: (usize, usize),
        features: usize,
        labels: usize,
    },
    #[error("The label '{0}' appears more than once.")]
    DuplicateLabel(String),
    #[error("The feature '{0}' appears more than once.")]
    DuplicateFeature(String),
    #[error("No labels are shared by every input matrix.")]
    EmptyLabelIntersection,
    #[error("The feature '{0}' is not present in the store.")]
    UnknownFeature(String),
    #[error("No input matrix has data type '{0}', so no phenotype can be designated.")]
    UnknownPhenotypeType(String),
}

/// Validated, label-aligned binary data ready for the search engine.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    labels: Vec<String>,
    features: Vec<String>,
    variates: Array2<Variate>,
    feature_index: AHashMap<String, FeatureId>,
    phenotypes: Vec<FeatureId>,
    markers: Vec<FeatureId>,
}

impl FeatureStore {
    /// Builds a store from aligned parts. `variates` must have one row per feature and
    /// one column per label. Phenotypes and markers are given by feature key.
    pub fn new(
        labels: Vec<String>,
        features: Vec<String>,
        variates: Array2<Variate>,
        phenotypes: &[String],
        markers: &[String],
    ) -> Result<Self, StoreError> {
        if variates.dim() != (features.len(), labels.len()) {
            return Err(StoreError::ShapeMismatch {
                found: variates.dim(),
                features: features.len(),
                labels: labels.len(),
            });
        }

        let mut seen_labels = ahash::AHashSet::with_capacity(labels.len());
        for label in &labels {
            if !seen_labels.insert(label.as_str()) {
                return Err(StoreError::DuplicateLabel(label.clone()));
            }
        }

        let mut feature_index = AHashMap::with_capacity(features.len());
        for (row, feature) in features.iter().enumerate() {
            if feature_index
                .insert(feature.clone(), FeatureId(row))
                .is_some()
            {
                return Err(StoreError::DuplicateFeature(feature.clone()));
            }
        }

        let resolve = |keys: &[String]| -> Result<Vec<FeatureId>, StoreError> {
            keys.iter()
                .map(|key| {
                    feature_index
                        .get(key)
                        .copied()
                        .ok_or_else(|| StoreError::UnknownFeature(key.clone()))
                })
                .collect()
        };
        let phenotypes = resolve(phenotypes)?;
        let markers = resolve(markers)?;

        Ok(Self {
            labels,
            features,
            variates,
            feature_index,
            phenotypes,
            markers,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn n_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    pub fn phenotypes(&self) -> &[FeatureId] {
        &self.phenotypes
    }

    pub fn markers(&self) -> &[FeatureId] {
        &self.markers
    }

    #[inline]
    pub fn feature_id(&self, key: &str) -> Option<FeatureId> {
        self.feature_index.get(key).copied()
    }

    #[inline]
    pub fn feature_name(&self, id: FeatureId) -> &str {
        &self.features[id.0]
    }

    /// The variate vector of one feature, aligned to [`Self::labels`].
    #[inline]
    pub fn row(&self, id: FeatureId) -> ArrayView1<'_, Variate> {
        self.variates.row(id.0)
    }

    /// A store over the same features restricted to the given label columns, in the
    /// given order. Feature ids remain valid in the restricted store.
    pub fn restrict_labels(&self, columns: &[usize]) -> FeatureStore {
        FeatureStore {
            labels: columns.iter().map(|&c| self.labels[c].clone()).collect(),
            features: self.features.clone(),
            variates: self.variates.select(Axis(1), columns),
            feature_index: self.feature_index.clone(),
            phenotypes: self.phenotypes.clone(),
            markers: self.markers.clone(),
        }
    }

    /// Merges parsed matrices into one store.
    ///
    /// Only labels present in every matrix are kept, in the order of the first
    /// matrix. Features with fewer than `feature_min` positive calls over the
    /// retained labels are dropped. Features from the matrix whose data type equals
    /// `phenotype_type` become phenotypes; all others become markers. With no
    /// `phenotype_type` every feature is a marker.
    pub fn from_matrices(
        matrices: &[BinaryMatrix],
        phenotype_type: Option<&str>,
        feature_min: usize,
    ) -> Result<FeatureStore, StoreError> {
        let Some(first) = matrices.first() else {
            return Err(StoreError::EmptyLabelIntersection);
        };

        if let Some(kind) = phenotype_type {
            if !matrices.iter().any(|m| m.data_type == kind) {
                return Err(StoreError::UnknownPhenotypeType(kind.to_string()));
            }
        }

        let column_maps: Vec<AHashMap<&str, usize>> = matrices
            .iter()
            .map(|m| {
                m.labels
                    .iter()
                    .enumerate()
                    .map(|(i, l)| (l.as_str(), i))
                    .collect()
            })
            .collect();

        let labels: Vec<String> = first
            .labels
            .iter()
            .filter(|label| column_maps.iter().all(|map| map.contains_key(label.as_str())))
            .cloned()
            .collect();
        if labels.is_empty() {
            return Err(StoreError::EmptyLabelIntersection);
        }

        let mut features = Vec::new();
        let mut rows: Vec<Variate> = Vec::new();
        let mut phenotypes = Vec::new();
        let mut markers = Vec::new();
        let mut dropped = 0usize;

        for (matrix, columns) in matrices.iter().zip(&column_maps) {
            let is_phenotype = phenotype_type.is_some_and(|kind| matrix.data_type == kind);
            for (feature, values) in matrix.features.iter().zip(&matrix.rows) {
                let aligned: Vec<Variate> = labels
                    .iter()
                    .map(|label| values[columns[label.as_str()]])
                    .collect();
                let positives = aligned.iter().filter(|&&v| v == Variate::One).count();
                if positives < feature_min {
                    dropped += 1;
                    continue;
                }
                rows.extend_from_slice(&aligned);
                features.push(feature.clone());
                if is_phenotype {
                    phenotypes.push(feature.clone());
                } else {
                    markers.push(feature.clone());
                }
            }
        }

        log::info!(
            "Feature store: {} labels, {} markers, {} phenotypes ({} features below the minimum of {} positives dropped)",
            labels.len(),
            markers.len(),
            phenotypes.len(),
            dropped,
            feature_min
        );

        let variates = Array2::from_shape_vec((features.len(), labels.len()), rows).map_err(
            |_| StoreError::ShapeMismatch {
                found: (0, 0),
                features: features.len(),
                labels: labels.len(),
            },
        )?;

        FeatureStore::new(labels, features, variates, &phenotypes, &markers)
    }
}

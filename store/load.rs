use super::StoreError;
use crate::types::Variate;
use std::path::Path;

/// A parsed binary matrix from one input file, not yet aligned to other inputs.
#[derive(Debug, Clone)]
pub struct BinaryMatrix {
    /// Name of the data type, e.g. `Mutation` or `Drug`. Appended to feature keys.
    pub data_type: String,
    pub labels: Vec<String>,
    pub features: Vec<String>,
    /// One row per feature, aligned to `labels`.
    pub rows: Vec<Vec<Variate>>,
}

/// Reads a feature × label matrix. The first row is the header of labels (its first
/// cell is ignored), and each following row is a feature key followed by its values.
///
/// `.csv` files are comma separated; everything else is tab separated. Cells equal
/// to `na_token` become missing, `0` becomes zero, and any other value is a positive
/// call. Feature keys without a `:` get `:<data_type>` appended.
pub fn load_binary_matrix(
    path: &Path,
    data_type: &str,
    na_token: &str,
) -> Result<BinaryMatrix, StoreError> {
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };
    let source_name = path.display().to_string();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut records = reader.records();
    let header = match records.next() {
        Some(record) => record?,
        None => return Err(StoreError::EmptyMatrix { source_name }),
    };
    let labels: Vec<String> = header
        .iter()
        .skip(1)
        .filter(|cell| !cell.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        return Err(StoreError::EmptyMatrix { source_name });
    }

    let mut features = Vec::new();
    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let mut cells = record.iter();
        let Some(key) = cells.next().filter(|k| !k.is_empty()) else {
            continue;
        };
        let values: Vec<Variate> = cells
            .filter(|cell| !cell.is_empty())
            .map(|cell| parse_call(cell, na_token))
            .collect();
        if values.len() != labels.len() {
            return Err(StoreError::RowLengthMismatch {
                source_name,
                feature: key.to_string(),
                found: values.len(),
                expected: labels.len(),
            });
        }

        let feature = if key.contains(':') {
            key.to_string()
        } else {
            format!("{key}:{data_type}")
        };
        features.push(feature);
        rows.push(values);
    }

    log::debug!(
        "Loaded '{}' as {}: {} features x {} labels",
        source_name,
        data_type,
        features.len(),
        labels.len()
    );

    Ok(BinaryMatrix {
        data_type: data_type.to_string(),
        labels,
        features,
        rows,
    })
}

fn parse_call(cell: &str, na_token: &str) -> Variate {
    if cell == na_token {
        return Variate::Missing;
    }
    match cell.parse::<f64>() {
        Ok(value) if value == 0.0 => Variate::Zero,
        _ => Variate::One,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_tab_separated_matrix_with_missing_values() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        writeln!(file, "id\ts1\ts2\ts3").unwrap();
        writeln!(file, "TP53\t1\t0\tNA").unwrap();
        writeln!(file, "KRAS:Custom\t0\t2\t0.0").unwrap();

        let matrix = load_binary_matrix(file.path(), "Mutation", "NA").unwrap();
        assert_eq!(matrix.labels, vec!["s1", "s2", "s3"]);
        assert_eq!(matrix.features, vec!["TP53:Mutation", "KRAS:Custom"]);
        assert_eq!(
            matrix.rows[0],
            vec![Variate::One, Variate::Zero, Variate::Missing]
        );
        assert_eq!(matrix.rows[1], vec![Variate::Zero, Variate::One, Variate::Zero]);
    }

    #[test]
    fn rejects_short_rows() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "id,s1,s2").unwrap();
        writeln!(file, "A,1").unwrap();

        let err = load_binary_matrix(file.path(), "X", "NA").unwrap_err();
        assert!(matches!(err, StoreError::RowLengthMismatch { found: 1, expected: 2, .. }));
    }
}

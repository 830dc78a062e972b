use std::collections::BTreeMap;

use csv::ReaderBuilder;
use cw_types::Scalar;

use crate::StorageError;

/// Parse an uploaded CSV string into insertable field maps. Per-field
/// scalar inference is trim-then-probe: empty cells become null, then
/// numeric, then boolean, then text.
pub fn read_csv_rows(input: &str) -> Result<Vec<BTreeMap<String, Scalar>>, StorageError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(StorageError::MissingHeaders);
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let mut fields = BTreeMap::new();
        for (idx, header) in headers.iter().enumerate() {
            let cell = record.get(idx).unwrap_or_default();
            fields.insert(header.to_owned(), parse_scalar(cell));
        }
        rows.push(fields);
    }

    Ok(rows)
}

fn parse_scalar(cell: &str) -> Scalar {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Scalar::Null;
    }

    if let Ok(value) = trimmed.parse::<f64>() {
        return Scalar::Number(value);
    }
    if let Ok(value) = trimmed.parse::<bool>() {
        return Scalar::Bool(value);
    }

    Scalar::Text(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use cw_types::Scalar;

    use super::read_csv_rows;
    use crate::StorageError;

    #[test]
    fn cells_infer_null_numeric_bool_and_text() {
        let input = "region,price,active\nnorth, 10.5 ,true\n,,\n";
        let rows = read_csv_rows(input).expect("read");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["region"], Scalar::from("north"));
        assert_eq!(rows[0]["price"], Scalar::Number(10.5));
        assert_eq!(rows[0]["active"], Scalar::Bool(true));
        assert!(rows[1]["region"].is_missing());
        assert!(rows[1]["price"].is_missing());
    }

    #[test]
    fn headerless_input_is_rejected() {
        let err = read_csv_rows("").expect_err("no headers");
        assert!(matches!(err, StorageError::MissingHeaders));
    }
}

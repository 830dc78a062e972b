#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use cw_types::{DType, Scalar, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("field '{field}' is not present on record {record_id}")]
    MissingField { record_id: String, field: String },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// One ingested row. Fields are schema-on-read: the map carries whatever
/// keys the upload had, and nothing outside ingestion is allowed to assume
/// a fixed column set. Records are immutable after ingestion and addressed
/// by `(owner_id, dataset_id, index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: String,
    owner_id: String,
    dataset_id: String,
    index: u64,
    fields: BTreeMap<String, Scalar>,
}

impl Record {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        dataset_id: impl Into<String>,
        index: u64,
        fields: BTreeMap<String, Scalar>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            dataset_id: dataset_id.into(),
            index,
            fields,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    #[must_use]
    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Scalar> {
        &self.fields
    }

    /// Raw field lookup. `None` means the key is absent entirely, which is
    /// distinct from a present `Scalar::Null`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }

    /// Field lookup that folds absence into `Scalar::Null`, for call paths
    /// where the two are equivalent (equality predicates, labels).
    #[must_use]
    pub fn field_or_null(&self, name: &str) -> Scalar {
        self.fields.get(name).cloned().unwrap_or(Scalar::Null)
    }

    /// Strictly coerced numeric field, for formula evaluation.
    pub fn number_field(&self, name: &str) -> Result<f64, RecordError> {
        let value = self.field(name).ok_or_else(|| RecordError::MissingField {
            record_id: self.id.clone(),
            field: name.to_owned(),
        })?;
        Ok(value.strict_number()?)
    }

    pub fn text_field(&self, name: &str) -> Result<&str, RecordError> {
        match self.field(name) {
            Some(Scalar::Text(v)) => Ok(v),
            _ => Err(RecordError::MissingField {
                record_id: self.id.clone(),
                field: name.to_owned(),
            }),
        }
    }
}

/// Advisory column metadata derived by sampling a dataset's records.
/// Never enforced at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub dtype: DType,
    pub nullable: bool,
}

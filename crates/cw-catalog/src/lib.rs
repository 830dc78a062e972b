#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use cw_record::ColumnDescriptor;
use cw_store::{PageRequest, RowStore, StorageError};
use cw_types::{DType, common_dtype};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Reports the set of known columns for a user/dataset scope. Descriptors
/// are advisory: they describe what sampling observed, not what writes
/// must conform to.
pub trait ColumnCatalog {
    fn list_columns(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<ColumnDescriptor>, CatalogError>;
}

pub const DEFAULT_SAMPLE_SIZE: usize = 100;

/// Derives descriptors by sampling up to `sample_size` records and
/// folding field dtypes through the common-dtype lattice. A column absent
/// from some sampled record, or null in any, is nullable. Incompatible
/// dtype mixes degrade to `Text` instead of erroring.
#[derive(Debug)]
pub struct SampledCatalog<'a, S: RowStore> {
    store: &'a S,
    sample_size: usize,
}

impl<'a, S: RowStore> SampledCatalog<'a, S> {
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    #[must_use]
    pub fn with_sample_size(store: &'a S, sample_size: usize) -> Self {
        Self {
            store,
            sample_size: sample_size.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnFold {
    dtype: DType,
    nullable: bool,
    seen_in: usize,
}

impl<S: RowStore> ColumnCatalog for SampledCatalog<'_, S> {
    fn list_columns(
        &self,
        owner_id: &str,
        dataset_id: Option<&str>,
    ) -> Result<Vec<ColumnDescriptor>, CatalogError> {
        let page = PageRequest::new(1, self.sample_size)?;
        let sample = self.store.fetch(owner_id, dataset_id, &[], None, &page)?;

        let mut folds: BTreeMap<String, ColumnFold> = BTreeMap::new();
        for record in &sample.records {
            for (name, value) in record.fields() {
                let fold = folds.entry(name.clone()).or_insert(ColumnFold {
                    dtype: DType::Null,
                    nullable: false,
                    seen_in: 0,
                });
                fold.seen_in += 1;
                fold.nullable |= value.is_missing();
                fold.dtype = common_dtype(fold.dtype, value.dtype());
            }
        }

        let sampled = sample.records.len();
        Ok(folds
            .into_iter()
            .map(|(name, fold)| ColumnDescriptor {
                name,
                dtype: fold.dtype,
                nullable: fold.nullable || fold.seen_in < sampled,
            })
            .collect())
    }
}

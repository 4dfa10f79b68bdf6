//! Single-key left join of record batches.

use arrow::array::{Array, ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{cast, take};
use arrow::datatypes::Schema;
use arrow::error::ArrowError;
use arrow::row::{RowConverter, SortField};
use std::collections::HashMap;
use std::sync::Arc;

/// Left-join `right` onto `left` on the `key` column, appending `columns`
/// from `right`.
///
/// Every left row is kept exactly once, in order. When several right rows
/// share a key the first one wins; null keys never match. The right key is
/// cast to the left key's type. Appended columns are nullable.
pub fn left_join(
    left: &RecordBatch,
    right: &RecordBatch,
    key: &str,
    columns: &[String],
) -> Result<RecordBatch, ArrowError> {
    let left_schema = left.schema();
    let right_schema = right.schema();
    let left_key = left.column(left_schema.index_of(key)?).clone();
    let right_key = cast(right.column(right_schema.index_of(key)?), left_key.data_type())?;

    let converter = RowConverter::new(vec![SortField::new(left_key.data_type().clone())])?;
    let right_rows = converter.convert_columns(&[right_key.clone()])?;
    let mut first_match = HashMap::with_capacity(right_rows.num_rows());
    for (i, row) in right_rows.iter().enumerate() {
        if right_key.is_valid(i) {
            first_match.entry(row).or_insert(i as u32);
        }
    }

    let left_rows = converter.convert_columns(&[left_key.clone()])?;
    let indices: UInt32Array = left_rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            if left_key.is_valid(i) {
                first_match.get(&row).copied()
            } else {
                None
            }
        })
        .collect();

    let mut fields: Vec<_> = left_schema.fields().iter().cloned().collect();
    let mut arrays: Vec<ArrayRef> = left.columns().to_vec();
    for name in columns {
        let index = right_schema.index_of(name)?;
        let field = right_schema.field(index).clone().with_nullable(true);
        fields.push(Arc::new(field));
        arrays.push(take(right.column(index), &indices, None)?);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

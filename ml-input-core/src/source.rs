//! In-memory source stages
//!
//! File-backed sources live in the readers crate; everything here produces
//! records from values the caller already holds.

use std::sync::Arc;

use tracing::trace;

use crate::dataset::{Dataset, DatasetBase, RecordIterator};
use crate::error::{Error, Result};
use crate::record::{Record, Value};
use crate::schema::{DType, PartialShape, Signature, TensorSpec};
use crate::tensor::Tensor;

/// Fully defined spec describing a concrete value
pub fn spec_of(value: &Value) -> TensorSpec {
    match value {
        Value::Dense(t) => TensorSpec::dense(t.dtype(), t.shape()),
        Value::Sparse(s) => TensorSpec::sparse(s.dtype(), s.shape_usize()),
    }
}

/// Fully defined signature describing a concrete record
pub fn signature_of(record: &Record) -> Signature {
    Signature::new(record.values().iter().map(spec_of).collect())
}

fn leading_extent(value: &Value) -> Result<usize> {
    match value {
        Value::Dense(t) => t
            .shape()
            .first()
            .copied()
            .ok_or_else(|| Error::invalid_argument("cannot slice a scalar component")),
        Value::Sparse(s) => s
            .shape_usize()
            .first()
            .copied()
            .ok_or_else(|| Error::invalid_argument("cannot slice a scalar sparse component")),
    }
}

fn slice_value(value: &Value, index: usize) -> Result<Value> {
    Ok(match value {
        Value::Dense(t) => Value::Dense(t.slice_outer(index)?),
        Value::Sparse(s) => Value::Sparse(s.slice_outer(index)?),
    })
}

/// Yields one record per index along the components' shared leading axis
struct SliceDataset {
    components: Arc<Vec<Value>>,
    len: usize,
    signature: Signature,
}

impl DatasetBase for SliceDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let components = Arc::clone(&self.components);
        let len = self.len;
        let mut next = 0;
        Ok(Box::new(move || -> Result<Option<Record>> {
            if next >= len {
                return Ok(None);
            }
            let values = components
                .iter()
                .map(|c| slice_value(c, next))
                .collect::<Result<Vec<_>>>()?;
            next += 1;
            Ok(Some(Record::new(values)))
        }))
    }

    fn debug_name(&self) -> &'static str {
        "TensorSliceDataset"
    }
}

/// Yields a fixed list of records once
struct RecordsDataset {
    records: Arc<Vec<Record>>,
    signature: Signature,
}

impl DatasetBase for RecordsDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let records = Arc::clone(&self.records);
        let mut next = 0;
        Ok(Box::new(move || -> Result<Option<Record>> {
            let record = records.get(next).cloned();
            next += 1;
            Ok(record)
        }))
    }

    fn debug_name(&self) -> &'static str {
        "RecordsDataset"
    }
}

/// Yields the same record forever
struct ConstantDataset {
    record: Record,
    signature: Signature,
}

impl DatasetBase for ConstantDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let record = self.record.clone();
        Ok(Box::new(move || -> Result<Option<Record>> { Ok(Some(record.clone())) }))
    }

    fn debug_name(&self) -> &'static str {
        "ConstantDataset"
    }
}

/// Yields int64 scalars from `start` towards `stop` by `step`
struct RangeDataset {
    start: i64,
    stop: i64,
    step: i64,
    signature: Signature,
}

impl DatasetBase for RangeDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        if self.step == 0 {
            return Err(Error::invalid_argument("range step must not be zero"));
        }
        let (stop, step) = (self.stop, self.step);
        let mut next = self.start;
        trace!(start = self.start, stop, step, "range iterator created");
        Ok(Box::new(move || -> Result<Option<Record>> {
            let more = if step > 0 { next < stop } else { next > stop };
            if !more {
                return Ok(None);
            }
            let value = next;
            next = next.saturating_add(step);
            Ok(Some(Record::single(Tensor::scalar(value))))
        }))
    }

    fn debug_name(&self) -> &'static str {
        "RangeDataset"
    }
}

impl Dataset {
    /// One record per slice of the components along their leading axis
    ///
    /// Every component must have rank at least one and all leading axes
    /// must have the same extent.
    pub fn from_tensor_slices(components: Vec<Value>) -> Result<Dataset> {
        if components.is_empty() {
            return Err(Error::invalid_argument("at least one component is required"));
        }
        let extents = components
            .iter()
            .map(leading_extent)
            .collect::<Result<Vec<_>>>()?;
        let len = extents[0];
        if let Some(bad) = extents.iter().position(|&e| e != len) {
            return Err(Error::invalid_argument(format!(
                "all components must have the same size in the leading dimension: component 0 has {} but component {} has {}",
                len, bad, extents[bad]
            )));
        }
        let signature = Signature::new(
            components
                .iter()
                .map(|c| {
                    let spec = spec_of(c);
                    let trailing = spec.shape.dims().map(|d| d[1..].to_vec()).unwrap_or_default();
                    TensorSpec {
                        shape: PartialShape::from(trailing),
                        ..spec
                    }
                })
                .collect(),
        );
        Ok(Dataset::new(SliceDataset {
            components: Arc::new(components),
            len,
            signature,
        }))
    }

    /// Convenience for slicing a single dense tensor
    pub fn from_tensor_slice(tensor: Tensor) -> Result<Dataset> {
        Self::from_tensor_slices(vec![Value::Dense(tensor)])
    }

    /// Exactly one record holding the whole components
    pub fn from_tensors(components: Vec<Value>) -> Dataset {
        let record = Record::new(components);
        let signature = signature_of(&record);
        Dataset::new(RecordsDataset {
            records: Arc::new(vec![record]),
            signature,
        })
    }

    /// A finite pipeline over records already held in memory
    ///
    /// Every record must match `signature`. The pipeline owns the records
    /// and may be iterated any number of times.
    pub fn from_records(signature: Signature, records: Vec<Record>) -> Result<Dataset> {
        for (i, record) in records.iter().enumerate() {
            signature
                .check_record(record)
                .map_err(|e| Error::invalid_argument(format!("record {i}: {e}")))?;
        }
        Ok(Dataset::new(RecordsDataset {
            records: Arc::new(records),
            signature,
        }))
    }

    /// An infinite pipeline repeating one record
    pub fn constant(record: Record) -> Dataset {
        let signature = signature_of(&record);
        Dataset::new(ConstantDataset { record, signature })
    }

    /// Int64 scalars in `[start, stop)` advancing by `step`
    pub fn range(start: i64, stop: i64, step: i64) -> Dataset {
        Dataset::new(RangeDataset {
            start,
            stop,
            step,
            signature: Signature::single(TensorSpec::scalar(DType::Int64)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::SparseTensor;

    fn ints(ds: &Dataset) -> Vec<i64> {
        ds.collect_records()
            .unwrap()
            .iter()
            .map(|r| r.scalar::<i64>(0).unwrap())
            .collect()
    }

    #[test]
    fn test_from_tensor_slices() {
        let a = Tensor::from_vec(vec![3, 2], vec![1i32, 2, 3, 4, 5, 6]).unwrap();
        let b = Tensor::strings(["x", "y", "z"]);
        let ds = Dataset::from_tensor_slices(vec![a.into(), b.into()]).unwrap();
        assert_eq!(ds.signature().to_string(), "(int32[2], string[])");

        let records = ds.collect_records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].dense(0).unwrap().as_slice::<i32>().unwrap(), &[5, 6]);
        assert_eq!(records[1].scalar::<Vec<u8>>(1).unwrap(), b"y".to_vec());
    }

    #[test]
    fn test_from_tensor_slices_rejects_mismatched_extents() {
        let a = Tensor::vector(vec![1i64, 2, 3]);
        let b = Tensor::vector(vec![1i64, 2]);
        let err = Dataset::from_tensor_slices(vec![a.into(), b.into()]).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(Dataset::from_tensor_slice(Tensor::scalar(1i64)).is_err());
    }

    #[test]
    fn test_sparse_slices() {
        let sparse = SparseTensor::new(
            vec![vec![0, 0], vec![1, 0], vec![1, 2]],
            Tensor::vector(vec![10i64, 20, 30]),
            vec![2, 3],
        )
        .unwrap();
        let ds = Dataset::from_tensor_slices(vec![sparse.into()]).unwrap();
        let records = ds.collect_records().unwrap();
        let second = records[1].sparse(0).unwrap();
        assert_eq!(second.indices(), &[vec![0], vec![2]]);
        assert_eq!(second.values().as_slice::<i64>().unwrap(), &[20, 30]);
        assert_eq!(second.dense_shape(), &[3]);
    }

    #[test]
    fn test_range() {
        assert_eq!(ints(&Dataset::range(0, 5, 2)), vec![0, 2, 4]);
        assert_eq!(ints(&Dataset::range(5, 0, -2)), vec![5, 3, 1]);
        assert!(ints(&Dataset::range(3, 3, 1)).is_empty());
        assert!(Dataset::range(0, 5, 0).make_iterator().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_constant_is_unbounded() {
        let ds = Dataset::constant(Record::single(Tensor::scalar(7i64)));
        let mut iter = ds.make_iterator().unwrap();
        for _ in 0..1000 {
            assert_eq!(iter.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), 7);
        }
    }

    #[test]
    fn test_from_records_validates() {
        let sig = Signature::single(TensorSpec::scalar(DType::Int64));
        let bad = Record::single(Tensor::scalar(1.0f32));
        assert!(Dataset::from_records(sig.clone(), vec![bad]).is_err());
        let ds = Dataset::from_records(sig, Vec::new()).unwrap();
        assert!(ds.collect_records().unwrap().is_empty());
    }
}

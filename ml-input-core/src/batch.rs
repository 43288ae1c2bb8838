//! Batching stages
//!
//! All batching stages collect up to `batch_size` consecutive records. The
//! final batch of a finite upstream may be short; an exhausted upstream
//! never produces an empty batch.

use tracing::trace;

use crate::dataset::{Dataset, DatasetBase, RecordIterator};
use crate::error::{Error, Result};
use crate::record::{Record, Value};
use crate::schema::{PartialShape, Signature, TensorSpec, ValueKind};
use crate::tensor::{strides_of, SparseTensor, Tensor, TensorData};

/// Convert a size argument to `usize`, requiring it to be positive
pub(crate) fn positive_size(what: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| Error::invalid_argument(format!("{what} must be greater than zero, got {value}")))
}

/// Pull up to `n` records from `input`
fn pull_batch(input: &mut dyn RecordIterator, n: usize) -> Result<Vec<Record>> {
    let mut records = Vec::with_capacity(n);
    while records.len() < n {
        match input.get_next()? {
            Some(record) => records.push(record),
            None => break,
        }
    }
    Ok(records)
}

fn reject_sparse(signature: &Signature, stage: &str) -> Result<()> {
    if signature.components().iter().any(|c| c.kind == ValueKind::Sparse) {
        return Err(Error::Unimplemented(format!(
            "{stage} does not support sparse components"
        )));
    }
    Ok(())
}

fn component<'a>(records: &'a [Record], index: usize) -> Result<Vec<&'a Tensor>> {
    records.iter().map(|r| r.dense(index)).collect()
}

/// Stacks consecutive records along a new leading axis
struct BatchDataset {
    input: Dataset,
    batch_size: i64,
    signature: Signature,
}

impl DatasetBase for BatchDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let batch_size = positive_size("batch size", self.batch_size)?;
        let mut input = self.input.make_iterator()?;
        let arity = self.signature.len();
        Ok(Box::new(move || -> Result<Option<Record>> {
            let records = pull_batch(input.as_mut(), batch_size)?;
            if records.is_empty() {
                return Ok(None);
            }
            trace!(size = records.len(), "batch assembled");
            let stacked = (0..arity)
                .map(|j| Tensor::stack(&component(&records, j)?))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(Record::from_tensors(stacked)))
        }))
    }

    fn debug_name(&self) -> &'static str {
        "BatchDataset"
    }
}

/// Pads each component to a common shape, then stacks
struct PaddedBatchDataset {
    input: Dataset,
    batch_size: i64,
    padded_shapes: Vec<PartialShape>,
    padding_values: Vec<Option<Tensor>>,
    signature: Signature,
}

/// Pad and stack one component of a batch
fn pad_component(tensors: &[&Tensor], padded: &PartialShape, padding: Option<&Tensor>) -> Result<Tensor> {
    let dims = padded
        .dims()
        .ok_or_else(|| Error::internal("padded shape of unknown rank"))?;
    let mut out_shape = Vec::with_capacity(dims.len() + 1);
    out_shape.push(tensors.len());
    for t in tensors {
        if t.ndim() != dims.len() {
            return Err(Error::invalid_argument(format!(
                "cannot pad a component of shape {:?} to padded shape {}",
                t.shape(),
                padded
            )));
        }
    }
    for (axis, fixed) in dims.iter().enumerate() {
        let observed = tensors.iter().map(|t| t.shape()[axis]).max().unwrap_or(0);
        match fixed {
            Some(size) if observed > *size => {
                return Err(Error::data_loss(format!(
                    "attempted to pad to a smaller size than the input element: axis {axis} has size {observed} but the padded size is {size}"
                )));
            }
            Some(size) => out_shape.push(*size),
            None => out_shape.push(observed),
        }
    }
    let dtype = tensors[0].dtype();
    let mut out = match padding {
        Some(value) => Tensor::filled_like(value, out_shape)?,
        None => Tensor::zeros(dtype, out_shape),
    };
    for (i, t) in tensors.iter().enumerate() {
        out.write_padded(i, t)?;
    }
    Ok(out)
}

impl DatasetBase for PaddedBatchDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let batch_size = positive_size("batch size", self.batch_size)?;
        let mut input = self.input.make_iterator()?;
        let padded_shapes = self.padded_shapes.clone();
        let padding_values = self.padding_values.clone();
        Ok(Box::new(move || -> Result<Option<Record>> {
            let records = pull_batch(input.as_mut(), batch_size)?;
            if records.is_empty() {
                return Ok(None);
            }
            let padded = padded_shapes
                .iter()
                .zip(&padding_values)
                .enumerate()
                .map(|(j, (shape, value))| pad_component(&component(&records, j)?, shape, value.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(Record::from_tensors(padded)))
        }))
    }

    fn debug_name(&self) -> &'static str {
        "PaddedBatchDataset"
    }
}

/// Re-represents a batch of ragged records as one sparse value
struct DenseToSparseBatchDataset {
    input: Dataset,
    batch_size: i64,
    row_shape: Vec<usize>,
    signature: Signature,
}

/// Build the sparse batch from records already checked against `row_shape`
fn sparse_batch(tensors: &[&Tensor], row_shape: &[usize]) -> Result<SparseTensor> {
    let total: usize = tensors.iter().map(|t| t.len()).sum();
    let mut indices = Vec::with_capacity(total);
    let mut values = TensorData::zeros(tensors[0].dtype(), 0);
    for (i, t) in tensors.iter().enumerate() {
        let strides = strides_of(t.shape());
        for flat in 0..t.len() {
            let mut index = Vec::with_capacity(row_shape.len() + 1);
            index.push(i as i64);
            let mut rem = flat;
            for stride in &strides {
                index.push((rem / stride) as i64);
                rem %= stride;
            }
            indices.push(index);
        }
        values.extend_from(t.data())?;
    }
    let mut dense_shape = Vec::with_capacity(row_shape.len() + 1);
    dense_shape.push(tensors.len() as i64);
    dense_shape.extend(row_shape.iter().map(|&d| d as i64));
    SparseTensor::new(indices, Tensor::new(vec![total], values)?, dense_shape)
}

impl DatasetBase for DenseToSparseBatchDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let batch_size = positive_size("batch size", self.batch_size)?;
        let mut input = self.input.make_iterator()?;
        let row_shape = self.row_shape.clone();
        Ok(Box::new(move || -> Result<Option<Record>> {
            let mut records = Vec::with_capacity(batch_size);
            while records.len() < batch_size {
                let Some(record) = input.get_next()? else {
                    break;
                };
                let t = record.dense(0)?;
                if t.ndim() != row_shape.len() {
                    return Err(Error::invalid_argument(format!(
                        "input element had shape {:?} that is incompatible with the row shape {:?}",
                        t.shape(),
                        row_shape
                    )));
                }
                if t.shape().iter().zip(&row_shape).any(|(d, r)| d > r) {
                    return Err(Error::data_loss(format!(
                        "input element had shape {:?} that is larger than the row shape {:?}",
                        t.shape(),
                        row_shape
                    )));
                }
                records.push(record);
            }
            if records.is_empty() {
                return Ok(None);
            }
            let sparse = sparse_batch(&component(&records, 0)?, &row_shape)?;
            Ok(Some(Record::single(Value::Sparse(sparse))))
        }))
    }

    fn debug_name(&self) -> &'static str {
        "DenseToSparseBatchDataset"
    }
}

impl Dataset {
    /// Stack up to `batch_size` consecutive records per output record
    ///
    /// A non-positive `batch_size` fails when the iterator is initialized.
    pub fn batch(&self, batch_size: i64) -> Result<Dataset> {
        reject_sparse(self.signature(), "batch")?;
        let signature = self
            .signature()
            .map_components(|c| TensorSpec::dense(c.dtype, c.shape.with_leading(None)));
        Ok(Dataset::new(BatchDataset {
            input: self.clone(),
            batch_size,
            signature,
        }))
    }

    /// Like [`Dataset::batch`], padding every component to a common shape
    ///
    /// Unknown axes in `padded_shapes` pad to the largest size observed in
    /// each batch. Known axes pad to exactly that size; a record larger than
    /// a known axis fails the batch with a data loss error. Padding values
    /// must be scalars of each component's element kind and default to zero
    /// (empty string for strings).
    pub fn padded_batch(
        &self,
        batch_size: i64,
        padded_shapes: Vec<PartialShape>,
        padding_values: Option<Vec<Tensor>>,
    ) -> Result<Dataset> {
        let input_sig = self.signature();
        reject_sparse(input_sig, "padded_batch")?;
        if padded_shapes.len() != input_sig.len() {
            return Err(Error::invalid_argument(format!(
                "expected {} padded shapes, got {}",
                input_sig.len(),
                padded_shapes.len()
            )));
        }
        for (j, (spec, padded)) in input_sig.components().iter().zip(&padded_shapes).enumerate() {
            let Some(padded_dims) = padded.dims() else {
                return Err(Error::invalid_argument(format!(
                    "padded shape for component {j} must have a known rank"
                )));
            };
            let Some(dims) = spec.shape.dims() else {
                continue;
            };
            if dims.len() != padded_dims.len() {
                return Err(Error::invalid_argument(format!(
                    "padded shape {padded} for component {j} is incompatible with its shape {}",
                    spec.shape
                )));
            }
            for (axis, (d, p)) in dims.iter().zip(padded_dims).enumerate() {
                if let (Some(d), Some(p)) = (d, p) {
                    if d > p {
                        return Err(Error::invalid_argument(format!(
                            "padded shape {padded} for component {j} is smaller than the component on axis {axis}: {d} > {p}"
                        )));
                    }
                }
            }
        }
        let padding_values = match padding_values {
            None => vec![None; input_sig.len()],
            Some(values) => {
                if values.len() != input_sig.len() {
                    return Err(Error::invalid_argument(format!(
                        "expected {} padding values, got {}",
                        input_sig.len(),
                        values.len()
                    )));
                }
                for (j, (spec, value)) in input_sig.components().iter().zip(&values).enumerate() {
                    if value.ndim() != 0 || value.dtype() != spec.dtype {
                        return Err(Error::invalid_argument(format!(
                            "padding value for component {j} must be a {} scalar",
                            spec.dtype
                        )));
                    }
                }
                values.into_iter().map(Some).collect()
            }
        };
        let signature = Signature::new(
            input_sig
                .components()
                .iter()
                .zip(&padded_shapes)
                .map(|(c, p)| TensorSpec::dense(c.dtype, p.with_leading(None)))
                .collect(),
        );
        Ok(Dataset::new(PaddedBatchDataset {
            input: self.clone(),
            batch_size,
            padded_shapes,
            padding_values,
            signature,
        }))
    }

    /// Collect up to `batch_size` ragged records into one sparse value of
    /// dense shape `[records, *row_shape]`
    pub fn dense_to_sparse_batch(&self, batch_size: i64, row_shape: Vec<usize>) -> Result<Dataset> {
        let input_sig = self.signature();
        let spec = match input_sig.components() {
            [spec] if spec.kind == ValueKind::Dense => spec,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "dense_to_sparse_batch requires a single dense component, got {input_sig}"
                )))
            }
        };
        if spec.shape.rank().is_some_and(|r| r != row_shape.len()) {
            return Err(Error::invalid_argument(format!(
                "row shape {:?} is incompatible with the component shape {}",
                row_shape, spec.shape
            )));
        }
        let signature = Signature::single(TensorSpec::sparse(
            spec.dtype,
            PartialShape::fully_defined(&row_shape).with_leading(None),
        ));
        Ok(Dataset::new(DenseToSparseBatchDataset {
            input: self.clone(),
            batch_size,
            row_shape,
            signature,
        }))
    }
}

//! Tensor implementations for record components
//!
//! Dense tensors store their elements contiguously in row-major order in a
//! [`TensorData`] vector of the matching element kind. Sparse tensors are
//! `(indices, values, dense_shape)` triples.

use std::fmt;
use std::mem::size_of;

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::schema::DType;

/// Typed element storage of a dense tensor
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Boolean elements
    Bool(Vec<bool>),

    /// 8-bit unsigned elements
    UInt8(Vec<u8>),

    /// 32-bit signed elements
    Int32(Vec<i32>),

    /// 64-bit signed elements
    Int64(Vec<i64>),

    /// 32-bit float elements
    Float32(Vec<f32>),

    /// 64-bit float elements
    Float64(Vec<f64>),

    /// Byte string elements
    String(Vec<Vec<u8>>),
}

/// Run `$body` with `$v` bound to the inner vector, whatever its kind
macro_rules! with_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::Bool($v) => $body,
            TensorData::UInt8($v) => $body,
            TensorData::Int32($v) => $body,
            TensorData::Int64($v) => $body,
            TensorData::Float32($v) => $body,
            TensorData::Float64($v) => $body,
            TensorData::String($v) => $body,
        }
    };
}

/// Build a new `TensorData` of the same kind from the inner vector
macro_rules! map_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::Bool($v) => TensorData::Bool($body),
            TensorData::UInt8($v) => TensorData::UInt8($body),
            TensorData::Int32($v) => TensorData::Int32($body),
            TensorData::Int64($v) => TensorData::Int64($body),
            TensorData::Float32($v) => TensorData::Float32($body),
            TensorData::Float64($v) => TensorData::Float64($body),
            TensorData::String($v) => TensorData::String($body),
        }
    };
}

/// Run `$body` on two storages of the same kind, `$mismatch` otherwise
macro_rules! zip_data {
    ($a:expr, $b:expr, $x:ident, $y:ident => $body:expr, $mismatch:expr) => {
        match ($a, $b) {
            (TensorData::Bool($x), TensorData::Bool($y)) => $body,
            (TensorData::UInt8($x), TensorData::UInt8($y)) => $body,
            (TensorData::Int32($x), TensorData::Int32($y)) => $body,
            (TensorData::Int64($x), TensorData::Int64($y)) => $body,
            (TensorData::Float32($x), TensorData::Float32($y)) => $body,
            (TensorData::Float64($x), TensorData::Float64($y)) => $body,
            (TensorData::String($x), TensorData::String($y)) => $body,
            _ => $mismatch,
        }
    };
}

impl TensorData {
    /// Element kind of this storage
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Bool(_) => DType::Bool,
            TensorData::UInt8(_) => DType::UInt8,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Int64(_) => DType::Int64,
            TensorData::Float32(_) => DType::Float32,
            TensorData::Float64(_) => DType::Float64,
            TensorData::String(_) => DType::String,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        with_data!(self, v => v.len())
    }

    /// Whether there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `len` copies of the semantic zero of `dtype`
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Bool => TensorData::Bool(vec![false; len]),
            DType::UInt8 => TensorData::UInt8(vec![0; len]),
            DType::Int32 => TensorData::Int32(vec![0; len]),
            DType::Int64 => TensorData::Int64(vec![0; len]),
            DType::Float32 => TensorData::Float32(vec![0.0; len]),
            DType::Float64 => TensorData::Float64(vec![0.0; len]),
            DType::String => TensorData::String(vec![Vec::new(); len]),
        }
    }

    /// `len` copies of the first element of `self`
    fn repeat_first(&self, len: usize) -> Result<Self> {
        if self.is_empty() {
            return Err(Error::invalid_argument("fill value must have one element"));
        }
        Ok(map_data!(self, v => vec![v[0].clone(); len]))
    }

    /// Copy of the elements in `range`
    fn slice(&self, start: usize, end: usize) -> Self {
        map_data!(self, v => v[start..end].to_vec())
    }

    /// Append all elements of `other`, which must have the same kind
    pub fn extend_from(&mut self, other: &TensorData) -> Result<()> {
        let (left, right) = (self.dtype(), other.dtype());
        zip_data!(self, other, a, b => {
            a.extend_from_slice(b);
            Ok(())
        }, Err(Error::invalid_argument(format!(
            "cannot combine {left} and {right} elements"
        ))))
    }

    /// Write `src[i]` to `self[offsets[i]]` for every element of `src`
    pub fn scatter(&mut self, offsets: &[usize], src: &TensorData) -> Result<()> {
        if offsets.len() != src.len() {
            return Err(Error::internal("scatter offsets do not match source length"));
        }
        let (left, right) = (self.dtype(), src.dtype());
        let len = self.len();
        if offsets.iter().any(|&o| o >= len) {
            return Err(Error::internal("scatter offset out of bounds"));
        }
        zip_data!(self, src, dst, s => {
            for (&offset, value) in offsets.iter().zip(s.iter()) {
                dst[offset] = value.clone();
            }
            Ok(())
        }, Err(Error::invalid_argument(format!(
            "cannot write {right} elements into a {left} tensor"
        ))))
    }
}

/// Scalar types that can be stored in a [`Tensor`]
pub trait Element: Clone + Send + Sync + fmt::Debug + 'static {
    /// Element kind of this type
    const DTYPE: DType;

    /// Wrap a vector of elements into tensor storage
    fn into_data(values: Vec<Self>) -> TensorData;

    /// Borrow the elements of a storage of this kind
    fn from_data(data: &TensorData) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn into_data(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }

            fn from_data(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(bool, Bool);
impl_element!(u8, UInt8);
impl_element!(i32, Int32);
impl_element!(i64, Int64);
impl_element!(f32, Float32);
impl_element!(f64, Float64);
impl_element!(Vec<u8>, String);

/// Row-major strides, in elements, of a shape
pub(crate) fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// A dense multidimensional tensor
#[derive(Clone, PartialEq)]
pub struct Tensor {
    /// Shape of the tensor (dimensions)
    shape: Vec<usize>,

    /// Elements in row-major order
    data: TensorData,
}

impl Tensor {
    /// Create a tensor from a shape and matching storage
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::invalid_argument(format!(
                "{} elements do not fill a tensor of shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { shape, data })
    }

    /// Create a tensor from a vector of elements
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        Self::new(shape, T::into_data(values))
    }

    /// A rank-0 tensor
    pub fn scalar<T: Element>(value: T) -> Self {
        Self {
            shape: Vec::new(),
            data: T::into_data(vec![value]),
        }
    }

    /// A rank-1 tensor
    pub fn vector<T: Element>(values: Vec<T>) -> Self {
        Self {
            shape: vec![values.len()],
            data: T::into_data(values),
        }
    }

    /// A rank-0 byte string tensor
    pub fn string(value: impl AsRef<[u8]>) -> Self {
        Self::scalar(value.as_ref().to_vec())
    }

    /// A rank-1 byte string tensor
    pub fn strings<S: AsRef<[u8]>>(values: impl IntoIterator<Item = S>) -> Self {
        Self::vector(values.into_iter().map(|s| s.as_ref().to_vec()).collect())
    }

    /// A tensor of the given shape where every element equals `value`
    pub fn fill<T: Element>(shape: Vec<usize>, value: T) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: T::into_data(vec![value; len]),
        }
    }

    /// A tensor of the given shape filled with the zero of `dtype`
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: TensorData::zeros(dtype, len),
        }
    }

    /// Reinterpret raw bytes as a vector of plain-old-data elements in
    /// native byte order
    pub fn decode_raw<T: Element + Pod>(bytes: &[u8]) -> Result<Self> {
        let width = size_of::<T>();
        if bytes.len() % width != 0 {
            return Err(Error::invalid_argument(format!(
                "input of {} bytes is not a multiple of the element size {}",
                bytes.len(),
                width
            )));
        }
        let values: Vec<T> = bytes
            .chunks_exact(width)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        Ok(Self::vector(values))
    }

    /// Get the shape of this tensor
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions in this tensor
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements in this tensor
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if this tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element kind
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Element storage
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Take the element storage
    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Borrow the elements as a typed slice
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        T::from_data(&self.data).ok_or_else(|| {
            Error::invalid_argument(format!(
                "expected a {} tensor, got a {} tensor",
                T::DTYPE,
                self.dtype()
            ))
        })
    }

    /// The single element of a scalar tensor
    pub fn scalar_value<T: Element>(&self) -> Result<T> {
        if !self.shape.is_empty() {
            return Err(Error::invalid_argument(format!(
                "expected a scalar, got a tensor of shape {:?}",
                self.shape
            )));
        }
        Ok(self.as_slice::<T>()?[0].clone())
    }

    /// The `index`-th slice along the leading axis
    pub fn slice_outer(&self, index: usize) -> Result<Tensor> {
        let Some((&outer, inner_shape)) = self.shape.split_first() else {
            return Err(Error::invalid_argument("cannot slice a scalar tensor"));
        };
        if index >= outer {
            return Err(Error::invalid_argument(format!(
                "slice index {index} is out of bounds for axis of size {outer}"
            )));
        }
        let row: usize = inner_shape.iter().product();
        Ok(Tensor {
            shape: inner_shape.to_vec(),
            data: self.data.slice(index * row, (index + 1) * row),
        })
    }

    /// Gather elements of a vector at the given positions
    pub fn select(&self, positions: &[usize]) -> Result<Tensor> {
        if self.ndim() != 1 {
            return Err(Error::invalid_argument("select requires a vector"));
        }
        if positions.iter().any(|&p| p >= self.len()) {
            return Err(Error::invalid_argument("select position out of bounds"));
        }
        Ok(Tensor {
            shape: vec![positions.len()],
            data: map_data!(&self.data, v => positions.iter().map(|&p| v[p].clone()).collect()),
        })
    }

    /// Stack tensors of identical kind and shape along a new leading axis
    pub fn stack(tensors: &[&Tensor]) -> Result<Tensor> {
        let Some(first) = tensors.first() else {
            return Err(Error::invalid_argument("cannot stack an empty list of tensors"));
        };
        let mut data = first.data.clone();
        for (i, t) in tensors.iter().enumerate().skip(1) {
            if t.shape != first.shape {
                return Err(Error::invalid_argument(format!(
                    "cannot batch tensors with different shapes: element 0 has shape {:?} but element {} has shape {:?}",
                    first.shape, i, t.shape
                )));
            }
            data.extend_from(&t.data)?;
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(tensors.len());
        shape.extend_from_slice(&first.shape);
        Ok(Tensor { shape, data })
    }

    /// Build a tensor of `shape` filled with the single element of `fill`
    pub fn filled_like(fill: &Tensor, shape: Vec<usize>) -> Result<Tensor> {
        let len = shape.iter().product();
        Ok(Tensor {
            shape,
            data: fill.data.repeat_first(len)?,
        })
    }

    /// Copy `src` into the region of `self` whose origin is `leading_index`
    /// along the first axis and zero along every other axis
    ///
    /// `src` must have rank `self.ndim() - 1` and fit inside the trailing axes.
    pub fn write_padded(&mut self, leading_index: usize, src: &Tensor) -> Result<()> {
        if src.ndim() + 1 != self.ndim() {
            return Err(Error::internal("padded write with mismatched ranks"));
        }
        let dst_strides = strides_of(&self.shape);
        let src_strides = strides_of(&src.shape);
        let base = leading_index * dst_strides[0];
        let offsets: Vec<usize> = (0..src.len())
            .map(|flat| {
                let mut rem = flat;
                let mut offset = base;
                for (axis, stride) in src_strides.iter().enumerate() {
                    let coord = rem / stride;
                    rem %= stride;
                    offset += coord * dst_strides[axis + 1];
                }
                offset
            })
            .collect();
        self.data.scatter(&offsets, &src.data)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor<{}>{{ shape: {:?}, data: ", self.dtype(), self.shape)?;
        with_data!(&self.data, v => write!(f, "{v:?}"))?;
        f.write_str(" }")
    }
}

/// A sparse tensor in coordinate format
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTensor {
    /// One coordinate tuple per stored value
    indices: Vec<Vec<i64>>,

    /// Stored values, rank 1
    values: Tensor,

    /// Shape of the equivalent dense tensor
    dense_shape: Vec<i64>,
}

impl SparseTensor {
    /// Create a sparse tensor, validating the triple
    pub fn new(indices: Vec<Vec<i64>>, values: Tensor, dense_shape: Vec<i64>) -> Result<Self> {
        if values.ndim() != 1 {
            return Err(Error::invalid_argument("sparse values must be a vector"));
        }
        if indices.len() != values.len() {
            return Err(Error::invalid_argument(format!(
                "sparse tensor has {} indices but {} values",
                indices.len(),
                values.len()
            )));
        }
        if dense_shape.iter().any(|&d| d < 0) {
            return Err(Error::invalid_argument("dense shape must be non-negative"));
        }
        for index in &indices {
            if index.len() != dense_shape.len() {
                return Err(Error::invalid_argument(format!(
                    "index {:?} does not have rank {}",
                    index,
                    dense_shape.len()
                )));
            }
            if index.iter().zip(&dense_shape).any(|(&i, &d)| i < 0 || i >= d) {
                return Err(Error::invalid_argument(format!(
                    "index {index:?} is out of bounds for dense shape {dense_shape:?}"
                )));
            }
        }
        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    /// Coordinate tuples
    pub fn indices(&self) -> &[Vec<i64>] {
        &self.indices
    }

    /// Stored values
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Shape of the equivalent dense tensor
    pub fn dense_shape(&self) -> &[i64] {
        &self.dense_shape
    }

    /// Number of stored values
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Element kind
    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    /// Dense shape as unsigned sizes
    pub fn shape_usize(&self) -> Vec<usize> {
        // dense_shape is validated non-negative on construction
        self.dense_shape.iter().map(|&d| d.unsigned_abs() as usize).collect()
    }

    /// The `index`-th slice along the leading axis of the dense shape
    pub fn slice_outer(&self, index: usize) -> Result<SparseTensor> {
        let Some((&outer, inner_shape)) = self.dense_shape.split_first() else {
            return Err(Error::invalid_argument("cannot slice a scalar sparse tensor"));
        };
        let index = i64::try_from(index)
            .map_err(|_| Error::invalid_argument("slice index is too large"))?;
        if index >= outer {
            return Err(Error::invalid_argument(format!(
                "slice index {index} is out of bounds for axis of size {outer}"
            )));
        }
        let (positions, indices): (Vec<usize>, Vec<Vec<i64>>) = self
            .indices
            .iter()
            .enumerate()
            .filter(|(_, idx)| idx[0] == index)
            .map(|(pos, idx)| (pos, idx[1..].to_vec()))
            .unzip();
        Ok(SparseTensor {
            indices,
            values: self.values.select(&positions)?,
            dense_shape: inner_shape.to_vec(),
        })
    }

    /// Materialize the dense tensor, filling unset positions with zero
    pub fn to_dense(&self) -> Result<Tensor> {
        let shape = self.shape_usize();
        let strides = strides_of(&shape);
        let mut dense = Tensor::zeros(self.dtype(), shape);
        let offsets: Vec<usize> = self
            .indices
            .iter()
            .map(|index| {
                index
                    .iter()
                    .zip(&strides)
                    .map(|(&i, s)| i.unsigned_abs() as usize * s)
                    .sum()
            })
            .collect();
        dense.data.scatter(&offsets, self.values.data())?;
        Ok(dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_and_stack() {
        let t = Tensor::from_vec(vec![3, 2], vec![1i64, 2, 3, 4, 5, 6]).unwrap();
        let row = t.slice_outer(1).unwrap();
        assert_eq!(row.shape(), &[2]);
        assert_eq!(row.as_slice::<i64>().unwrap(), &[3, 4]);

        let a = t.slice_outer(0).unwrap();
        let c = t.slice_outer(2).unwrap();
        let stacked = Tensor::stack(&[&a, &c]).unwrap();
        assert_eq!(stacked.shape(), &[2, 2]);
        assert_eq!(stacked.as_slice::<i64>().unwrap(), &[1, 2, 5, 6]);
        assert!(t.slice_outer(3).is_err());
    }

    #[test]
    fn test_stack_rejects_mismatched_shapes() {
        let a = Tensor::vector(vec![1i32, 2]);
        let b = Tensor::vector(vec![1i32, 2, 3]);
        assert!(Tensor::stack(&[&a, &b]).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_write_padded() {
        let mut out = Tensor::fill(vec![2, 2, 3], -1i32);
        let src = Tensor::from_vec(vec![1, 2], vec![7i32, 8]).unwrap();
        out.write_padded(1, &src).unwrap();
        assert_eq!(
            out.as_slice::<i32>().unwrap(),
            &[-1, -1, -1, -1, -1, -1, 7, 8, -1, -1, -1, -1]
        );
    }

    #[test]
    fn test_decode_raw() {
        let bytes: Vec<u8> = [1u16, 2, 3].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let t = Tensor::decode_raw::<u8>(&bytes).unwrap();
        assert_eq!(t.len(), 6);
        let words: Vec<u8> = 0x0102_0304i32.to_ne_bytes().to_vec();
        let t = Tensor::decode_raw::<i32>(&words).unwrap();
        assert_eq!(t.as_slice::<i32>().unwrap(), &[0x0102_0304]);
        assert!(Tensor::decode_raw::<i64>(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_sparse_to_dense() {
        let sparse = SparseTensor::new(
            vec![vec![0, 1], vec![1, 0]],
            Tensor::vector(vec![5i64, 6]),
            vec![2, 2],
        )
        .unwrap();
        let dense = sparse.to_dense().unwrap();
        assert_eq!(dense.as_slice::<i64>().unwrap(), &[0, 5, 6, 0]);
        assert!(SparseTensor::new(vec![vec![2, 0]], Tensor::vector(vec![1i64]), vec![2, 2]).is_err());
    }
}

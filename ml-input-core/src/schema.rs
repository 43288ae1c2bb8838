//! Static description of the records a stage produces
//!
//! A [`Signature`] lists one [`TensorSpec`] per record component. Shapes are
//! partial: the rank may be unknown, and each axis may be unknown until a
//! concrete record fixes it at runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{Record, Value};

/// Scalar element kind of a tensor component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Boolean
    Bool,

    /// 8-bit unsigned integer
    UInt8,

    /// 32-bit signed integer
    Int32,

    /// 64-bit signed integer
    Int64,

    /// 32-bit floating point
    Float32,

    /// 64-bit floating point
    Float64,

    /// Variable-length byte string
    String,
}

impl DType {
    /// Size of one element in bytes, `None` for variable-size kinds
    pub fn size_bytes(self) -> Option<usize> {
        match self {
            DType::Bool | DType::UInt8 => Some(1),
            DType::Int32 | DType::Float32 => Some(4),
            DType::Int64 | DType::Float64 => Some(8),
            DType::String => None,
        }
    }

    /// Check if this kind is numeric
    pub fn is_numeric(self) -> bool {
        !matches!(self, DType::Bool | DType::String)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::UInt8 => "uint8",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::String => "string",
        };
        f.write_str(name)
    }
}

/// A shape whose rank and axis sizes may be partially unknown
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialShape {
    /// Axis sizes, `None` when the rank itself is unknown
    dims: Option<Vec<Option<usize>>>,
}

impl PartialShape {
    /// A shape of unknown rank
    pub fn unknown() -> Self {
        Self { dims: None }
    }

    /// The rank-0 shape
    pub fn scalar() -> Self {
        Self { dims: Some(Vec::new()) }
    }

    /// A shape with the given axes, `None` marking an unknown axis
    pub fn new(dims: impl IntoIterator<Item = Option<usize>>) -> Self {
        Self {
            dims: Some(dims.into_iter().collect()),
        }
    }

    /// A shape of known rank whose axes are all unknown
    pub fn unknown_of_rank(rank: usize) -> Self {
        Self {
            dims: Some(vec![None; rank]),
        }
    }

    /// A fully defined shape
    pub fn fully_defined(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Some))
    }

    /// Build a shape from signed sizes where `-1` marks an unknown axis
    ///
    /// Any other negative size is rejected.
    pub fn from_i64(dims: &[i64]) -> Result<Self> {
        let dims = dims
            .iter()
            .map(|&d| match d {
                -1 => Ok(None),
                d if d < 0 => Err(Error::invalid_argument(format!(
                    "shape dimension must be non-negative or -1, got {d}"
                ))),
                d => usize::try_from(d)
                    .map(Some)
                    .map_err(|_| Error::invalid_argument(format!("shape dimension {d} is too large"))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dims: Some(dims) })
    }

    /// Rank of the shape, if known
    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// Axis sizes, if the rank is known
    pub fn dims(&self) -> Option<&[Option<usize>]> {
        self.dims.as_deref()
    }

    /// Size of one axis, `None` when the rank or that axis is unknown
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.as_ref().and_then(|d| d.get(axis).copied().flatten())
    }

    /// Whether every axis is known
    pub fn is_fully_defined(&self) -> bool {
        self.dims
            .as_ref()
            .is_some_and(|d| d.iter().all(Option::is_some))
    }

    /// Axis sizes when the shape is fully defined
    pub fn to_shape(&self) -> Option<Vec<usize>> {
        self.dims.as_ref()?.iter().copied().collect()
    }

    /// Two shapes are compatible when their ranks match (or either is unknown)
    /// and every pair of axes is equal or has an unknown side
    pub fn is_compatible_with(&self, other: &PartialShape) -> bool {
        match (&self.dims, &other.dims) {
            (Some(a), Some(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| match (x, y) {
                        (Some(x), Some(y)) => x == y,
                        _ => true,
                    })
            }
            _ => true,
        }
    }

    /// Check a concrete runtime shape against this partial shape
    pub fn is_compatible_with_shape(&self, shape: &[usize]) -> bool {
        match &self.dims {
            None => true,
            Some(dims) => {
                dims.len() == shape.len()
                    && dims.iter().zip(shape).all(|(d, s)| d.map_or(true, |d| d == *s))
            }
        }
    }

    /// Prepend an axis, as done by batching stages
    pub fn with_leading(&self, dim: Option<usize>) -> Self {
        match &self.dims {
            None => Self::unknown(),
            Some(dims) => {
                let mut out = Vec::with_capacity(dims.len() + 1);
                out.push(dim);
                out.extend_from_slice(dims);
                Self { dims: Some(out) }
            }
        }
    }

    /// Keep the rank but forget every axis size
    pub fn relaxed(&self) -> Self {
        match self.rank() {
            Some(rank) => Self::unknown_of_rank(rank),
            None => Self::unknown(),
        }
    }
}

impl From<&[usize]> for PartialShape {
    fn from(dims: &[usize]) -> Self {
        Self::fully_defined(dims)
    }
}

impl From<Vec<usize>> for PartialShape {
    fn from(dims: Vec<usize>) -> Self {
        Self::fully_defined(&dims)
    }
}

impl From<Vec<Option<usize>>> for PartialShape {
    fn from(dims: Vec<Option<usize>>) -> Self {
        Self { dims: Some(dims) }
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => f.write_str("<unknown>"),
            Some(dims) => {
                f.write_str("[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match d {
                        Some(d) => write!(f, "{d}")?,
                        None => f.write_str("?")?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

/// Whether a component is a dense array or a sparse triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Dense n-dimensional array
    Dense,

    /// `(indices, values, dense_shape)` triple
    Sparse,
}

/// Static description of one record component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Dense or sparse
    pub kind: ValueKind,

    /// Element kind
    pub dtype: DType,

    /// Shape (the dense shape for sparse components)
    pub shape: PartialShape,
}

impl TensorSpec {
    /// A dense component spec
    pub fn dense(dtype: DType, shape: impl Into<PartialShape>) -> Self {
        Self {
            kind: ValueKind::Dense,
            dtype,
            shape: shape.into(),
        }
    }

    /// A sparse component spec
    pub fn sparse(dtype: DType, shape: impl Into<PartialShape>) -> Self {
        Self {
            kind: ValueKind::Sparse,
            dtype,
            shape: shape.into(),
        }
    }

    /// A dense scalar spec
    pub fn scalar(dtype: DType) -> Self {
        Self::dense(dtype, PartialShape::scalar())
    }

    /// Check compatibility with another spec
    pub fn is_compatible_with(&self, other: &TensorSpec) -> bool {
        self.kind == other.kind && self.dtype == other.dtype && self.shape.is_compatible_with(&other.shape)
    }

    /// Check a runtime value against this spec
    pub fn check_value(&self, value: &Value) -> Result<()> {
        let (kind, dtype, shape) = match value {
            Value::Dense(t) => (ValueKind::Dense, t.dtype(), t.shape().to_vec()),
            Value::Sparse(s) => (ValueKind::Sparse, s.dtype(), s.shape_usize()),
        };
        if kind != self.kind || dtype != self.dtype {
            return Err(Error::invalid_argument(format!(
                "expected a {:?} {} value, got a {:?} {} value",
                self.kind, self.dtype, kind, dtype
            )));
        }
        if !self.shape.is_compatible_with_shape(&shape) {
            return Err(Error::invalid_argument(format!(
                "value of shape {:?} is incompatible with expected shape {}",
                shape, self.shape
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValueKind::Dense => write!(f, "{}{}", self.dtype, self.shape),
            ValueKind::Sparse => write!(f, "sparse {}{}", self.dtype, self.shape),
        }
    }
}

/// Output signature of a stage: one spec per record component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    components: Vec<TensorSpec>,
}

impl Signature {
    /// Create a signature from component specs
    pub fn new(components: Vec<TensorSpec>) -> Self {
        Self { components }
    }

    /// A single-component signature
    pub fn single(spec: TensorSpec) -> Self {
        Self::new(vec![spec])
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the signature has no components
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Component specs
    pub fn components(&self) -> &[TensorSpec] {
        &self.components
    }

    /// One component spec
    pub fn component(&self, index: usize) -> Option<&TensorSpec> {
        self.components.get(index)
    }

    /// Concatenate signatures, as done by `zip`
    pub fn concat<'a>(signatures: impl IntoIterator<Item = &'a Signature>) -> Self {
        Self {
            components: signatures
                .into_iter()
                .flat_map(|s| s.components.iter().cloned())
                .collect(),
        }
    }

    /// Apply a transformation to every component spec
    pub fn map_components(&self, f: impl FnMut(&TensorSpec) -> TensorSpec) -> Self {
        Self {
            components: self.components.iter().map(f).collect(),
        }
    }

    /// Two signatures are compatible when they have the same arity and
    /// pairwise compatible components
    pub fn is_compatible_with(&self, other: &Signature) -> bool {
        self.len() == other.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a.is_compatible_with(b))
    }

    /// Check a runtime record against this signature
    pub fn check_record(&self, record: &Record) -> Result<()> {
        if record.len() != self.len() {
            return Err(Error::invalid_argument(format!(
                "record has {} components but the signature expects {}",
                record.len(),
                self.len()
            )));
        }
        for (i, (spec, value)) in self.components.iter().zip(record.values()).enumerate() {
            spec.check_value(value)
                .map_err(|e| Error::invalid_argument(format!("component {i}: {e}")))?;
        }
        Ok(())
    }

    /// Serialize the signature as JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::internal(format!("cannot serialize signature: {e}")))
    }

    /// Parse a signature from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid_argument(format!("malformed signature: {e}")))
    }
}

impl From<TensorSpec> for Signature {
    fn from(spec: TensorSpec) -> Self {
        Self::single(spec)
    }
}

impl From<Vec<TensorSpec>> for Signature {
    fn from(components: Vec<TensorSpec>) -> Self {
        Self::new(components)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{c}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_compatibility() {
        let a = PartialShape::new([None, Some(3)]);
        assert!(a.is_compatible_with(&PartialShape::fully_defined(&[7, 3])));
        assert!(!a.is_compatible_with(&PartialShape::fully_defined(&[7, 4])));
        assert!(!a.is_compatible_with(&PartialShape::fully_defined(&[3])));
        assert!(a.is_compatible_with(&PartialShape::unknown()));
        assert!(a.is_compatible_with_shape(&[0, 3]));
        assert!(!a.is_compatible_with_shape(&[2, 3, 1]));
    }

    #[test]
    fn test_shape_from_i64() {
        let s = PartialShape::from_i64(&[-1, 37]).unwrap();
        assert_eq!(s, PartialShape::new([None, Some(37)]));
        assert_eq!(s.to_string(), "[?, 37]");
        assert!(PartialShape::from_i64(&[-5]).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_leading_and_relaxed() {
        let s = PartialShape::fully_defined(&[2, 3]).with_leading(None);
        assert_eq!(s, PartialShape::new([None, Some(2), Some(3)]));
        assert_eq!(s.relaxed(), PartialShape::unknown_of_rank(3));
        assert_eq!(PartialShape::unknown().with_leading(Some(1)), PartialShape::unknown());
    }

    #[test]
    fn test_signature_json() {
        let sig = Signature::new(vec![
            TensorSpec::scalar(DType::Int64),
            TensorSpec::sparse(DType::String, PartialShape::new([None, Some(4)])),
        ]);
        let json = sig.to_json().unwrap();
        assert_eq!(Signature::from_json(&json).unwrap(), sig);
        assert_eq!(sig.to_string(), "(int64[], sparse string[?, 4])");
    }
}

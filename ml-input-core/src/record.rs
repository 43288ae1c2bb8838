//! Records flowing between pipeline stages
//!
//! A record is an ordered tuple of component values. Each value is either a
//! dense [`Tensor`] or a [`SparseTensor`].

use std::fmt;

use crate::error::{Error, Result};
use crate::tensor::{Element, SparseTensor, Tensor};

/// One component of a record
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A dense tensor
    Dense(Tensor),

    /// A sparse tensor
    Sparse(SparseTensor),
}

impl Value {
    /// Borrow the dense tensor, failing for sparse values
    pub fn as_dense(&self) -> Result<&Tensor> {
        match self {
            Value::Dense(t) => Ok(t),
            Value::Sparse(_) => Err(Error::invalid_argument("expected a dense component")),
        }
    }

    /// Borrow the sparse tensor, failing for dense values
    pub fn as_sparse(&self) -> Result<&SparseTensor> {
        match self {
            Value::Sparse(s) => Ok(s),
            Value::Dense(_) => Err(Error::invalid_argument("expected a sparse component")),
        }
    }

    /// Whether this is a sparse value
    pub fn is_sparse(&self) -> bool {
        matches!(self, Value::Sparse(_))
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Dense(t)
    }
}

impl From<SparseTensor> for Value {
    fn from(s: SparseTensor) -> Self {
        Value::Sparse(s)
    }
}

/// An ordered tuple of component values
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record(Vec<Value>);

impl Record {
    /// Create a record from its components
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Create a record with a single component
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Create a record from dense components
    pub fn from_tensors(tensors: Vec<Tensor>) -> Self {
        Self(tensors.into_iter().map(Value::Dense).collect())
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no components
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All components
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Take ownership of all components
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Component `index`
    pub fn get(&self, index: usize) -> Result<&Value> {
        self.0.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "component {} requested from a record with {} components",
                index,
                self.0.len()
            ))
        })
    }

    /// Dense component `index`
    pub fn dense(&self, index: usize) -> Result<&Tensor> {
        self.get(index)?.as_dense()
    }

    /// Sparse component `index`
    pub fn sparse(&self, index: usize) -> Result<&SparseTensor> {
        self.get(index)?.as_sparse()
    }

    /// Scalar element of dense component `index`
    pub fn scalar<T: Element>(&self, index: usize) -> Result<T> {
        self.dense(index)?.scalar_value()
    }

    /// Concatenate the components of several records
    pub fn concat(records: impl IntoIterator<Item = Record>) -> Self {
        Self(records.into_iter().flat_map(|r| r.0).collect())
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<Tensor> for Record {
    fn from(t: Tensor) -> Self {
        Self::single(t)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match v {
                Value::Dense(t) => write!(f, "{}{:?}", t.dtype(), t.shape())?,
                Value::Sparse(s) => write!(f, "sparse {}{:?}", s.dtype(), s.dense_shape())?,
            }
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accessors() {
        let r = Record::from_tensors(vec![Tensor::scalar(3i64), Tensor::string("abc")]);
        assert_eq!(r.len(), 2);
        assert_eq!(r.scalar::<i64>(0).unwrap(), 3);
        assert_eq!(r.scalar::<Vec<u8>>(1).unwrap(), b"abc".to_vec());
        assert!(r.get(2).is_err());
        assert!(r.sparse(0).is_err());
        assert_eq!(r.to_string(), "(int64[], string[])");
    }

    #[test]
    fn test_concat() {
        let a = Record::single(Tensor::scalar(1i32));
        let b = Record::from_tensors(vec![Tensor::scalar(2i32), Tensor::scalar(3i32)]);
        let c = Record::concat([a, b]);
        assert_eq!(c.len(), 3);
        assert_eq!(c.scalar::<i32>(2).unwrap(), 3);
    }
}

//! Core traits, data structures, and stages for ML input pipelines
//!
//! This crate provides the record model, the stage traits every pipeline
//! step implements, the in-memory sources, the sequential transform,
//! batching and windowing stages, and the iterator protocol consumers use
//! to pull records. Pipelines are lazy: nothing is read or computed until a
//! record is pulled.

#![warn(missing_docs)]

pub mod batch;
pub mod dataset;
pub mod error;
pub mod function;
pub mod iterator;
pub mod record;
pub mod resource;
pub mod schema;
pub mod source;
pub mod tensor;
pub mod transform;
pub mod window;

// Re-export key types for convenience
pub use dataset::{Dataset, DatasetBase, RecordIterator};
pub use error::{Error, Result};
pub use function::CapturedFunction;
pub use iterator::PipelineIterator;
pub use record::{Record, Value};
pub use resource::{HashTable, Resource, Variable};
pub use schema::{DType, PartialShape, Signature, TensorSpec, ValueKind};
pub use tensor::{Element, SparseTensor, Tensor, TensorData};

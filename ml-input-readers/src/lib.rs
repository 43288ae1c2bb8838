//! File-backed record sources for ML input pipelines
//!
//! Every source in this crate yields single-component records holding one
//! byte-string scalar and concatenates its files in the order given. Files
//! are opened lazily and closed as soon as they are exhausted, so a source
//! can be repeated or re-initialized without leaking handles.

#![warn(missing_docs)]

mod error;

pub mod common;
pub mod compression;
pub mod fixed_length;
pub mod text;
pub mod tfrecord;

pub use compression::CompressionType;
pub use error::{Error, Result};
pub use fixed_length::FixedLengthRecordDataset;
pub use text::TextLineDataset;
pub use tfrecord::{TfRecordDataset, TfRecordOptions, TfRecordWriter};

// Re-export core types
pub use ml_input_core::{error::Result as CoreResult, Dataset, Record};

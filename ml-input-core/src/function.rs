//! User functions applied by pipeline stages
//!
//! Per-record computations are opaque closures. They may fail, in which
//! case the error is surfaced to the caller of `get_next` unchanged.

use std::fmt;
use std::sync::Arc;

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::resource::Resource;

/// Record to record computation used by `map`
pub type MapFn = Arc<dyn Fn(Record) -> Result<Record> + Send + Sync>;

/// Record predicate used by `filter`
pub type PredicateFn = Arc<dyn Fn(&Record) -> Result<bool> + Send + Sync>;

/// Bucketing key used by `group_by_window`
pub type KeyFn = Arc<dyn Fn(&Record) -> Result<i64> + Send + Sync>;

/// Reduction of one flushed window to a new pipeline
pub type WindowFn = Arc<dyn Fn(i64, Dataset) -> Result<Dataset> + Send + Sync>;

/// Record to pipeline expansion used by `flat_map`
pub type FlatMapFn = Arc<dyn Fn(Record) -> Result<Dataset> + Send + Sync>;

/// A map function together with the resources it references
#[derive(Clone)]
pub struct CapturedFunction {
    /// The computation
    func: MapFn,

    /// Resources that must be initialized before the first call
    captures: Vec<Arc<dyn Resource>>,
}

impl CapturedFunction {
    /// Wrap a function that captures nothing
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            captures: Vec::new(),
        }
    }

    /// Wrap a function that references external resources
    pub fn with_captures<F>(func: F, captures: Vec<Arc<dyn Resource>>) -> Self
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            captures,
        }
    }

    /// Resources referenced by the function
    pub fn captures(&self) -> &[Arc<dyn Resource>] {
        &self.captures
    }

    /// Fail with a precondition error if any captured resource is uninitialized
    pub fn check_captures(&self) -> Result<()> {
        match self.captures.iter().find(|r| !r.is_initialized()) {
            Some(resource) => Err(Error::failed_precondition(format!(
                "function captures resource `{}` which has not been initialized",
                resource.name()
            ))),
            None => Ok(()),
        }
    }

    /// Apply the function to one record
    pub fn call(&self, record: Record) -> Result<Record> {
        (self.func)(record)
    }
}

impl fmt::Debug for CapturedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.captures.iter().map(|r| r.name()).collect();
        f.debug_struct("CapturedFunction")
            .field("captures", &names)
            .finish_non_exhaustive()
    }
}

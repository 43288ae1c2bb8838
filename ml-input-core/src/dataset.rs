//! Dataset trait and the cloneable pipeline handle
//!
//! A pipeline is a tree of immutable stage descriptions. Each stage
//! implements [`DatasetBase`]: it declares an output [`Signature`] and
//! creates fresh [`RecordIterator`] cursors on demand. Stages pull from
//! their upstream lazily, one record at a time.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::iterator::PipelineIterator;
use crate::record::Record;
use crate::schema::Signature;

/// An immutable description of one pipeline stage
pub trait DatasetBase: Send + Sync {
    /// Static description of the records this stage produces
    fn signature(&self) -> &Signature;

    /// Create a fresh cursor positioned at the start of this stage's output
    ///
    /// Argument values (sizes, counts) are validated here, so a
    /// misconfigured stage fails when its iterator is initialized.
    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>>;

    /// Short name used in logs and debug output
    fn debug_name(&self) -> &'static str;
}

/// A mutable cursor over the output of one stage
pub trait RecordIterator: Send {
    /// Produce the next record, or `Ok(None)` at end of stream
    fn get_next(&mut self) -> Result<Option<Record>>;
}

impl<F> RecordIterator for F
where
    F: FnMut() -> Result<Option<Record>> + Send,
{
    fn get_next(&mut self) -> Result<Option<Record>> {
        (self)()
    }
}

impl fmt::Debug for dyn RecordIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordIterator")
    }
}

/// A shared handle to a pipeline stage
///
/// Cloning is cheap; clones describe the same stage. Combinators such as
/// [`Dataset::map`] and [`Dataset::batch`] return new handles whose stage
/// pulls from this one.
#[derive(Clone)]
pub struct Dataset {
    inner: Arc<dyn DatasetBase>,
}

impl Dataset {
    /// Wrap a stage implementation
    pub fn new(stage: impl DatasetBase + 'static) -> Self {
        Self {
            inner: Arc::new(stage),
        }
    }

    /// Static description of the records this pipeline produces
    pub fn signature(&self) -> &Signature {
        self.inner.signature()
    }

    /// Create a fresh cursor over this pipeline
    pub fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        self.inner.make_iterator()
    }

    /// Short name of the outermost stage
    pub fn debug_name(&self) -> &'static str {
        self.inner.debug_name()
    }

    /// Create an iterator bound to this pipeline and already initialized
    pub fn make_one_shot_iterator(&self) -> Result<PipelineIterator> {
        let iterator = PipelineIterator::from_dataset(self.clone());
        iterator.initialize()?;
        Ok(iterator)
    }

    /// Drain the whole pipeline into memory
    ///
    /// Never returns for infinite pipelines.
    pub fn collect_records(&self) -> Result<Vec<Record>> {
        let mut iter = self.make_iterator()?;
        let mut out = Vec::new();
        while let Some(record) = iter.get_next()? {
            out.push(record);
        }
        Ok(out)
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("stage", &self.debug_name())
            .field("signature", &self.signature().to_string())
            .finish()
    }
}

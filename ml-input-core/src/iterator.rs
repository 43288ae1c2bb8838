//! The iterator protocol exposed to pipeline consumers
//!
//! A [`PipelineIterator`] moves through `Uninitialized -> Ready -> Exhausted`.
//! `initialize` (re)creates every stage cursor beneath it, `get_next` pulls
//! one record and `dispose` releases the cursors, stopping any workers they
//! own. All methods take `&self`; concurrent callers are serialized.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::dataset::{Dataset, RecordIterator};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::schema::Signature;

/// Lifecycle state of an iterator
enum State {
    /// No cursor exists
    Uninitialized,

    /// Records may be pulled
    Ready(Box<dyn RecordIterator>),

    /// End of stream was reached
    Exhausted,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Uninitialized => "uninitialized",
            State::Ready(_) => "ready",
            State::Exhausted => "exhausted",
        }
    }
}

/// A mutable cursor over a pipeline
pub struct PipelineIterator {
    /// Identifier used in logs
    id: Uuid,

    /// Signature every bound pipeline must be compatible with
    structure: Signature,

    /// Pipeline used by [`PipelineIterator::initialize`]
    dataset: Option<Dataset>,

    /// Current cursor state
    state: Mutex<State>,
}

impl PipelineIterator {
    /// An iterator bound to one pipeline; call `initialize` before pulling
    pub fn from_dataset(dataset: Dataset) -> Self {
        Self {
            id: Uuid::new_v4(),
            structure: dataset.signature().clone(),
            dataset: Some(dataset),
            state: Mutex::new(State::Uninitialized),
        }
    }

    /// An unbound iterator that can be initialized with any pipeline whose
    /// signature is compatible with `structure`
    pub fn from_structure(structure: Signature) -> Self {
        Self {
            id: Uuid::new_v4(),
            structure,
            dataset: None,
            state: Mutex::new(State::Uninitialized),
        }
    }

    /// Identifier of this iterator
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Signature of the records this iterator yields
    pub fn structure(&self) -> &Signature {
        &self.structure
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::internal(format!("iterator {} state lock is poisoned", self.id)))
    }

    /// (Re)initialize with the bound pipeline, resetting all stage state
    pub fn initialize(&self) -> Result<()> {
        let dataset = self.dataset.as_ref().ok_or_else(|| {
            Error::failed_precondition("iterator was created from a structure; use initialize_with")
        })?;
        self.initialize_with(dataset)
    }

    /// (Re)initialize with `dataset`, which must be compatible with this
    /// iterator's structure
    ///
    /// On failure the previous state is kept.
    pub fn initialize_with(&self, dataset: &Dataset) -> Result<()> {
        if !dataset.signature().is_compatible_with(&self.structure) {
            return Err(Error::invalid_argument(format!(
                "pipeline signature {} is incompatible with iterator structure {}",
                dataset.signature(),
                self.structure
            )));
        }
        let cursor = dataset.make_iterator()?;
        let previous = std::mem::replace(&mut *self.lock()?, State::Ready(cursor));
        debug!(
            iterator = %self.id,
            stage = dataset.debug_name(),
            previous = previous.name(),
            "iterator initialized"
        );
        // previous cursor is released outside the lock
        drop(previous);
        Ok(())
    }

    /// Pull the next record, `Ok(None)` at end of stream
    ///
    /// Pulling from an uninitialized iterator is a precondition error. Once
    /// exhausted, every call returns `Ok(None)` until re-initialized. Errors
    /// from stages are returned unchanged and leave the iterator ready.
    pub fn get_next(&self) -> Result<Option<Record>> {
        let mut state = self.lock()?;
        let cursor = match &mut *state {
            State::Uninitialized => {
                return Err(Error::failed_precondition(format!(
                    "iterator {} has not been initialized",
                    self.id
                )))
            }
            State::Exhausted => return Ok(None),
            State::Ready(cursor) => cursor,
        };
        match cursor.get_next()? {
            Some(record) => Ok(Some(record)),
            None => {
                trace!(iterator = %self.id, "end of stream");
                let finished = std::mem::replace(&mut *state, State::Exhausted);
                drop(state);
                drop(finished);
                Ok(None)
            }
        }
    }

    /// Release all stage cursors and return to the uninitialized state
    ///
    /// Idempotent.
    pub fn dispose(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lock()?, State::Uninitialized);
        if !matches!(previous, State::Uninitialized) {
            debug!(iterator = %self.id, previous = previous.name(), "iterator disposed");
        }
        drop(previous);
        Ok(())
    }

    /// Whether the iterator has reached end of stream
    pub fn is_exhausted(&self) -> bool {
        self.lock().map(|s| matches!(*s, State::Exhausted)).unwrap_or(false)
    }

    /// Adapt into a standard iterator of results, ending at end of stream
    pub fn records(&self) -> Records<'_> {
        Records { iterator: self }
    }
}

impl Drop for PipelineIterator {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if matches!(state, State::Ready(_)) {
                trace!(iterator = %self.id, "releasing iterator");
            }
        }
    }
}

impl fmt::Debug for PipelineIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().map(|s| s.name()).unwrap_or("poisoned");
        f.debug_struct("PipelineIterator")
            .field("id", &self.id)
            .field("structure", &self.structure.to_string())
            .field("state", &state)
            .finish()
    }
}

/// Standard iterator adapter returned by [`PipelineIterator::records`]
pub struct Records<'a> {
    iterator: &'a PipelineIterator,
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iterator.get_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::schema::{DType, TensorSpec};

    fn ints(iter: &PipelineIterator) -> Vec<i64> {
        iter.records()
            .map(|r| r.unwrap().scalar::<i64>(0).unwrap())
            .collect()
    }

    #[test]
    fn test_lifecycle() {
        let iter = PipelineIterator::from_dataset(Dataset::range(0, 3, 1));
        assert!(iter.get_next().unwrap_err().is_failed_precondition());

        iter.initialize().unwrap();
        assert_eq!(ints(&iter), vec![0, 1, 2]);
        assert!(iter.is_exhausted());
        assert!(iter.get_next().unwrap().is_none());
        assert!(iter.get_next().unwrap().is_none());

        iter.initialize().unwrap();
        assert_eq!(ints(&iter), vec![0, 1, 2]);

        iter.dispose().unwrap();
        iter.dispose().unwrap();
        assert!(iter.get_next().unwrap_err().is_failed_precondition());
    }

    #[test]
    fn test_reinitialize_mid_stream_resets() {
        let iter = Dataset::range(0, 5, 1).make_one_shot_iterator().unwrap();
        assert!(iter.get_next().unwrap().is_some());
        assert!(iter.get_next().unwrap().is_some());
        iter.initialize().unwrap();
        assert_eq!(ints(&iter), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_from_structure() {
        let sig = Signature::single(TensorSpec::scalar(DType::Int64));
        let iter = PipelineIterator::from_structure(sig);
        assert!(iter.initialize().unwrap_err().is_failed_precondition());

        iter.initialize_with(&Dataset::range(0, 2, 1)).unwrap();
        assert_eq!(ints(&iter), vec![0, 1]);
        iter.initialize_with(&Dataset::range(10, 12, 1)).unwrap();
        assert_eq!(ints(&iter), vec![10, 11]);

        let floats = Dataset::from_tensor_slice(crate::tensor::Tensor::vector(vec![1.0f32])).unwrap();
        assert!(iter.initialize_with(&floats).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_initialize_reports_invalid_arguments() {
        let iter = PipelineIterator::from_dataset(Dataset::range(0, 4, 1).batch(0).unwrap());
        assert!(iter.initialize().unwrap_err().is_invalid_argument());
        assert!(iter.get_next().unwrap_err().is_failed_precondition());
    }

    #[test]
    fn test_concurrent_get_next() {
        let iter = Arc::new(Dataset::range(0, 1000, 1).make_one_shot_iterator().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let iter = Arc::clone(&iter);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(record) = iter.get_next().unwrap() {
                        seen.push(record.scalar::<i64>(0).unwrap());
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let seen = handle.join().unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        assert_eq!(all.len(), 1000);
        assert_eq!(all.into_iter().collect::<HashSet<_>>().len(), 1000);
    }
}

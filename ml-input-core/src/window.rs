//! Keyed windowing stage
//!
//! `group_by_window` buffers records per key and reduces every full window
//! through a caller supplied function that returns a new pipeline over the
//! window. Windows are emitted as soon as they fill; the remaining short
//! windows are flushed in ascending key order once upstream is exhausted.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::batch::positive_size;
use crate::dataset::{Dataset, DatasetBase, RecordIterator};
use crate::error::{Error, Result};
use crate::function::{KeyFn, WindowFn};
use crate::record::Record;
use crate::schema::{Signature, TensorSpec};

struct GroupByWindowDataset {
    input: Dataset,
    key_fn: KeyFn,
    window_fn: WindowFn,
    window_size: i64,
    signature: Signature,
}

struct GroupByWindowIterator {
    input: Box<dyn RecordIterator>,
    input_signature: Signature,
    output_signature: Signature,
    key_fn: KeyFn,
    window_fn: WindowFn,
    window_size: usize,
    /// Pending windows by key
    windows: BTreeMap<i64, Vec<Record>>,
    /// Cursor over the reduction of the window being emitted
    current: Option<Box<dyn RecordIterator>>,
    input_done: bool,
}

impl GroupByWindowIterator {
    /// Reduce a flushed window and start emitting its records
    fn start_window(&mut self, key: i64, window: Vec<Record>) -> Result<()> {
        debug!(key, size = window.len(), "flushing window");
        let window = Dataset::from_records(self.input_signature.clone(), window)?;
        let reduced = (self.window_fn)(key, window)?;
        if !reduced.signature().is_compatible_with(&self.output_signature) {
            return Err(Error::invalid_argument(format!(
                "window function returned a pipeline with signature {} which is incompatible with {}",
                reduced.signature(),
                self.output_signature
            )));
        }
        self.current = Some(reduced.make_iterator()?);
        Ok(())
    }
}

impl RecordIterator for GroupByWindowIterator {
    fn get_next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(record) = current.get_next()? {
                    return Ok(Some(record));
                }
                self.current = None;
            }

            if !self.input_done {
                match self.input.get_next()? {
                    Some(record) => {
                        let key = (self.key_fn)(&record)?;
                        let window = self.windows.entry(key).or_default();
                        window.push(record);
                        if window.len() >= self.window_size {
                            let full = self.windows.remove(&key).unwrap_or_default();
                            self.start_window(key, full)?;
                        }
                    }
                    None => {
                        debug!(pending = self.windows.len(), "window input exhausted");
                        self.input_done = true;
                    }
                }
                continue;
            }

            match self.windows.pop_first() {
                Some((key, window)) => self.start_window(key, window)?,
                None => return Ok(None),
            }
        }
    }
}

impl DatasetBase for GroupByWindowDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let window_size = positive_size("window size", self.window_size)?;
        Ok(Box::new(GroupByWindowIterator {
            input: self.input.make_iterator()?,
            input_signature: self.input.signature().clone(),
            output_signature: self.signature.clone(),
            key_fn: Arc::clone(&self.key_fn),
            window_fn: Arc::clone(&self.window_fn),
            window_size,
            windows: BTreeMap::new(),
            current: None,
            input_done: false,
        }))
    }

    fn debug_name(&self) -> &'static str {
        "GroupByWindowDataset"
    }
}

impl Dataset {
    /// Group records by `key_fn` into windows of `window_size` records and
    /// replace each window by the records of `window_fn(key, window)`
    ///
    /// The output signature is obtained by applying `window_fn` to an empty
    /// window and forgetting every axis size, since windows may be short.
    pub fn group_by_window<K, W>(&self, key_fn: K, window_fn: W, window_size: i64) -> Result<Dataset>
    where
        K: Fn(&Record) -> Result<i64> + Send + Sync + 'static,
        W: Fn(i64, Dataset) -> Result<Dataset> + Send + Sync + 'static,
    {
        let empty = Dataset::from_records(self.signature().clone(), Vec::new())?;
        let traced = window_fn(0, empty)?;
        let signature = traced.signature().map_components(|c| TensorSpec {
            shape: c.shape.relaxed(),
            ..c.clone()
        });
        Ok(Dataset::new(GroupByWindowDataset {
            input: self.clone(),
            key_fn: Arc::new(key_fn),
            window_fn: Arc::new(window_fn),
            window_size,
            signature,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn parity_windows(values: Vec<i64>, window_size: i64) -> Dataset {
        Dataset::from_tensor_slice(Tensor::vector(values))
            .unwrap()
            .group_by_window(
                |r| Ok(r.scalar::<i64>(0)? % 2),
                move |_, window| window.batch(window_size),
                window_size,
            )
            .unwrap()
    }

    fn contents(ds: &Dataset) -> Vec<Vec<i64>> {
        ds.collect_records()
            .unwrap()
            .iter()
            .map(|r| r.dense(0).unwrap().as_slice::<i64>().unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_full_windows_then_short_windows_in_key_order() {
        let ds = parity_windows(vec![0, 0, 0, 0, 1, 1, 1, 1, 1, 0, 0, 0], 4);
        assert_eq!(
            contents(&ds),
            vec![vec![0, 0, 0, 0], vec![1, 1, 1, 1], vec![0, 0, 0], vec![1]]
        );
    }

    #[test]
    fn test_short_windows_flush_in_ascending_key_order() {
        let ds = parity_windows(vec![3, 5, 2], 4);
        assert_eq!(contents(&ds), vec![vec![2], vec![3, 5]]);
    }

    #[test]
    fn test_windows_emit_before_upstream_ends() {
        let ds = Dataset::range(0, i64::MAX, 1)
            .group_by_window(
                |r| Ok(i64::from(r.scalar::<i64>(0)? % 3 == 0)),
                |_, window| window.batch(2),
                2,
            )
            .unwrap();
        let mut iter = ds.make_iterator().unwrap();
        let first = iter.get_next().unwrap().unwrap();
        assert_eq!(first.dense(0).unwrap().as_slice::<i64>().unwrap(), &[1, 2]);
        let second = iter.get_next().unwrap().unwrap();
        assert_eq!(second.dense(0).unwrap().as_slice::<i64>().unwrap(), &[0, 3]);
    }

    #[test]
    fn test_signature_is_relaxed() {
        let ds = parity_windows(vec![1, 2, 3], 2);
        assert_eq!(ds.signature().to_string(), "(int64[?])");
    }

    #[test]
    fn test_zero_window_size_fails_at_initialize() {
        let ds = parity_windows(vec![1, 2, 3], 0);
        assert!(ds.make_iterator().unwrap_err().is_invalid_argument());
    }
}

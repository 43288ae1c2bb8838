//! Sequential transform stages
//!
//! Every stage here pulls exactly as many upstream records as it needs to
//! produce one output record, so output order always follows pull order.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::dataset::{Dataset, DatasetBase, RecordIterator};
use crate::error::{Error, Result};
use crate::function::{CapturedFunction, FlatMapFn, PredicateFn};
use crate::record::Record;
use crate::resource::Resource;
use crate::schema::Signature;

/// Applies a captured function to every record
struct MapDataset {
    input: Dataset,
    func: CapturedFunction,
    signature: Signature,
}

/// Cursor for [`MapDataset`]
pub struct MapIterator {
    input: Box<dyn RecordIterator>,
    func: CapturedFunction,
    signature: Signature,
    captures_checked: bool,
}

impl MapIterator {
    /// Create a cursor applying `func` to every record of `input`
    ///
    /// Captured resources are checked on the first pull, and each output
    /// record is checked against `signature`.
    pub fn new(input: Box<dyn RecordIterator>, func: CapturedFunction, signature: Signature) -> Self {
        Self {
            input,
            func,
            signature,
            captures_checked: false,
        }
    }
}

impl RecordIterator for MapIterator {
    fn get_next(&mut self) -> Result<Option<Record>> {
        if !self.captures_checked {
            self.func.check_captures()?;
            self.captures_checked = true;
        }
        let Some(record) = self.input.get_next()? else {
            return Ok(None);
        };
        let out = self.func.call(record)?;
        self.signature.check_record(&out)?;
        Ok(Some(out))
    }
}

impl DatasetBase for MapDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        Ok(Box::new(MapIterator::new(
            self.input.make_iterator()?,
            self.func.clone(),
            self.signature.clone(),
        )))
    }

    fn debug_name(&self) -> &'static str {
        "MapDataset"
    }
}

/// Map whose function owns state created per run
struct MapWithStateDataset<S> {
    input: Dataset,
    init: Arc<dyn Fn() -> S + Send + Sync>,
    func: Arc<dyn Fn(&mut S, Record) -> Result<Record> + Send + Sync>,
    signature: Signature,
}

impl<S: Send + 'static> DatasetBase for MapWithStateDataset<S> {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let mut input = self.input.make_iterator()?;
        let mut state = (self.init)();
        let func = Arc::clone(&self.func);
        let signature = self.signature.clone();
        Ok(Box::new(move || -> Result<Option<Record>> {
            let Some(record) = input.get_next()? else {
                return Ok(None);
            };
            let out = func(&mut state, record)?;
            signature.check_record(&out)?;
            Ok(Some(out))
        }))
    }

    fn debug_name(&self) -> &'static str {
        "MapWithStateDataset"
    }
}

/// Keeps only records satisfying a predicate
struct FilterDataset {
    input: Dataset,
    predicate: PredicateFn,
}

impl DatasetBase for FilterDataset {
    fn signature(&self) -> &Signature {
        self.input.signature()
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let mut input = self.input.make_iterator()?;
        let predicate = Arc::clone(&self.predicate);
        Ok(Box::new(move || -> Result<Option<Record>> {
            while let Some(record) = input.get_next()? {
                if predicate(&record)? {
                    return Ok(Some(record));
                }
            }
            Ok(None)
        }))
    }

    fn debug_name(&self) -> &'static str {
        "FilterDataset"
    }
}

/// Re-runs its upstream from the beginning a number of times
struct RepeatDataset {
    input: Dataset,
    count: i64,
}

struct RepeatIterator {
    input: Dataset,
    count: i64,
    epoch: i64,
    current: Option<Box<dyn RecordIterator>>,
    produced_this_epoch: bool,
    finished: bool,
}

impl RecordIterator for RepeatIterator {
    fn get_next(&mut self) -> Result<Option<Record>> {
        loop {
            if self.finished || (self.count >= 0 && self.epoch >= self.count) {
                return Ok(None);
            }
            if self.current.is_none() {
                self.produced_this_epoch = false;
                self.current = Some(self.input.make_iterator()?);
            }
            let next = match self.current.as_mut() {
                Some(iter) => iter.get_next()?,
                None => None,
            };
            if let Some(record) = next {
                self.produced_this_epoch = true;
                return Ok(Some(record));
            }
            self.current = None;
            self.epoch += 1;
            debug!(epoch = self.epoch, count = self.count, "repeat epoch finished");
            if !self.produced_this_epoch {
                // an empty epoch would repeat forever
                self.finished = true;
            }
        }
    }
}

impl DatasetBase for RepeatDataset {
    fn signature(&self) -> &Signature {
        self.input.signature()
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        Ok(Box::new(RepeatIterator {
            input: self.input.clone(),
            count: self.count,
            epoch: 0,
            current: None,
            produced_this_epoch: false,
            finished: false,
        }))
    }

    fn debug_name(&self) -> &'static str {
        "RepeatDataset"
    }
}

/// Combines one record from each child per step
struct ZipDataset {
    inputs: Vec<Dataset>,
    signature: Signature,
}

impl DatasetBase for ZipDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let mut inputs = self
            .inputs
            .iter()
            .map(Dataset::make_iterator)
            .collect::<Result<Vec<_>>>()?;
        let mut finished = false;
        Ok(Box::new(move || -> Result<Option<Record>> {
            if finished {
                return Ok(None);
            }
            let mut parts = Vec::with_capacity(inputs.len());
            for input in &mut inputs {
                match input.get_next()? {
                    Some(record) => parts.push(record),
                    None => {
                        finished = true;
                        return Ok(None);
                    }
                }
            }
            Ok(Some(Record::concat(parts)))
        }))
    }

    fn debug_name(&self) -> &'static str {
        "ZipDataset"
    }
}

/// Drops the first `count` records
struct SkipDataset {
    input: Dataset,
    count: i64,
}

impl DatasetBase for SkipDataset {
    fn signature(&self) -> &Signature {
        self.input.signature()
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let mut input = self.input.make_iterator()?;
        let mut remaining = self.count;
        Ok(Box::new(move || -> Result<Option<Record>> {
            // a negative count skips everything
            while remaining != 0 {
                if input.get_next()?.is_none() {
                    remaining = 0;
                    return Ok(None);
                }
                if remaining > 0 {
                    remaining -= 1;
                }
            }
            input.get_next()
        }))
    }

    fn debug_name(&self) -> &'static str {
        "SkipDataset"
    }
}

/// Yields at most `count` records
struct TakeDataset {
    input: Dataset,
    count: i64,
}

impl DatasetBase for TakeDataset {
    fn signature(&self) -> &Signature {
        self.input.signature()
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let mut input = self.input.make_iterator()?;
        let mut taken = 0;
        let count = self.count;
        Ok(Box::new(move || -> Result<Option<Record>> {
            if count >= 0 && taken >= count {
                return Ok(None);
            }
            let record = input.get_next()?;
            if record.is_some() {
                taken += 1;
            }
            Ok(record)
        }))
    }

    fn debug_name(&self) -> &'static str {
        "TakeDataset"
    }
}

/// Expands each record into a pipeline and concatenates them
struct FlatMapDataset {
    input: Dataset,
    func: FlatMapFn,
    signature: Signature,
}

impl DatasetBase for FlatMapDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let mut input = self.input.make_iterator()?;
        let func = Arc::clone(&self.func);
        let signature = self.signature.clone();
        let mut current: Option<Box<dyn RecordIterator>> = None;
        Ok(Box::new(move || -> Result<Option<Record>> {
            loop {
                if let Some(inner) = &mut current {
                    if let Some(record) = inner.get_next()? {
                        return Ok(Some(record));
                    }
                    current = None;
                }
                let Some(record) = input.get_next()? else {
                    return Ok(None);
                };
                let expanded = func(record)?;
                if !expanded.signature().is_compatible_with(&signature) {
                    return Err(Error::invalid_argument(format!(
                        "flat_map function returned a pipeline with signature {} but {} was declared",
                        expanded.signature(),
                        signature
                    )));
                }
                current = Some(expanded.make_iterator()?);
            }
        }))
    }

    fn debug_name(&self) -> &'static str {
        "FlatMapDataset"
    }
}

/// Emits records in a random order drawn from a sliding buffer
struct ShuffleDataset {
    input: Dataset,
    buffer_size: i64,
    seed: Option<u64>,
}

struct ShuffleIterator {
    input: Box<dyn RecordIterator>,
    buffer: Vec<Record>,
    capacity: usize,
    rng: StdRng,
    input_done: bool,
}

impl RecordIterator for ShuffleIterator {
    fn get_next(&mut self) -> Result<Option<Record>> {
        while !self.input_done && self.buffer.len() < self.capacity {
            match self.input.get_next()? {
                Some(record) => self.buffer.push(record),
                None => {
                    trace!(buffered = self.buffer.len(), "shuffle input exhausted");
                    self.input_done = true;
                }
            }
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let index = self.rng.gen_range(0..self.buffer.len());
        Ok(Some(self.buffer.swap_remove(index)))
    }
}

impl DatasetBase for ShuffleDataset {
    fn signature(&self) -> &Signature {
        self.input.signature()
    }

    fn make_iterator(&self) -> Result<Box<dyn RecordIterator>> {
        let capacity = usize::try_from(self.buffer_size)
            .ok()
            .filter(|&c| c > 0)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "shuffle buffer size must be greater than zero, got {}",
                    self.buffer_size
                ))
            })?;
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Box::new(ShuffleIterator {
            input: self.input.make_iterator()?,
            buffer: Vec::with_capacity(capacity.min(1 << 16)),
            capacity,
            rng,
            input_done: false,
        }))
    }

    fn debug_name(&self) -> &'static str {
        "ShuffleDataset"
    }
}

impl Dataset {
    /// Apply `func` to every record
    ///
    /// `signature` declares the structure of the records `func` returns;
    /// each output is checked against it.
    pub fn map<F>(&self, signature: Signature, func: F) -> Dataset
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
    {
        self.map_captured(signature, CapturedFunction::new(func))
    }

    /// Apply `func`, which references external resources, to every record
    ///
    /// The resources must be initialized before the first record is pulled,
    /// otherwise that pull fails with a precondition error.
    pub fn map_capturing<F>(&self, signature: Signature, captures: Vec<Arc<dyn Resource>>, func: F) -> Dataset
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
    {
        self.map_captured(signature, CapturedFunction::with_captures(func, captures))
    }

    /// Apply an already wrapped function to every record
    pub fn map_captured(&self, signature: Signature, func: CapturedFunction) -> Dataset {
        Dataset::new(MapDataset {
            input: self.clone(),
            func,
            signature,
        })
    }

    /// Apply `func` with a mutable state created by `init` on every
    /// initialization, so each run sees the same sequence of states
    pub fn map_with_state<S, I, F>(&self, signature: Signature, init: I, func: F) -> Dataset
    where
        S: Send + 'static,
        I: Fn() -> S + Send + Sync + 'static,
        F: Fn(&mut S, Record) -> Result<Record> + Send + Sync + 'static,
    {
        Dataset::new(MapWithStateDataset {
            input: self.clone(),
            init: Arc::new(init),
            func: Arc::new(func),
            signature,
        })
    }

    /// Keep only the records for which `predicate` returns true
    pub fn filter<P>(&self, predicate: P) -> Dataset
    where
        P: Fn(&Record) -> Result<bool> + Send + Sync + 'static,
    {
        Dataset::new(FilterDataset {
            input: self.clone(),
            predicate: Arc::new(predicate),
        })
    }

    /// Re-run the whole pipeline `count` times, forever when `count < 0`
    pub fn repeat(&self, count: i64) -> Dataset {
        Dataset::new(RepeatDataset {
            input: self.clone(),
            count,
        })
    }

    /// Combine one record from each pipeline per step, ending with the
    /// shortest
    pub fn zip(datasets: &[Dataset]) -> Result<Dataset> {
        if datasets.is_empty() {
            return Err(Error::invalid_argument("zip requires at least one pipeline"));
        }
        let signature = Signature::concat(datasets.iter().map(Dataset::signature));
        Ok(Dataset::new(ZipDataset {
            inputs: datasets.to_vec(),
            signature,
        }))
    }

    /// Zip this pipeline with one other
    pub fn zip_with(&self, other: &Dataset) -> Dataset {
        let signature = Signature::concat([self.signature(), other.signature()]);
        Dataset::new(ZipDataset {
            inputs: vec![self.clone(), other.clone()],
            signature,
        })
    }

    /// Drop the first `count` records, all of them when `count < 0`
    pub fn skip(&self, count: i64) -> Dataset {
        Dataset::new(SkipDataset {
            input: self.clone(),
            count,
        })
    }

    /// Keep at most `count` records, all of them when `count < 0`
    pub fn take(&self, count: i64) -> Dataset {
        Dataset::new(TakeDataset {
            input: self.clone(),
            count,
        })
    }

    /// Replace each record by the records of the pipeline `func` builds
    /// from it
    pub fn flat_map<F>(&self, signature: Signature, func: F) -> Dataset
    where
        F: Fn(Record) -> Result<Dataset> + Send + Sync + 'static,
    {
        Dataset::new(FlatMapDataset {
            input: self.clone(),
            func: Arc::new(func),
            signature,
        })
    }

    /// Randomly reorder records using a buffer of `buffer_size` records
    ///
    /// With a seed, every initialization reproduces the same order.
    pub fn shuffle(&self, buffer_size: i64, seed: Option<u64>) -> Dataset {
        Dataset::new(ShuffleDataset {
            input: self.clone(),
            buffer_size,
            seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Variable;
    use crate::schema::{DType, TensorSpec};
    use crate::tensor::Tensor;

    fn int_sig() -> Signature {
        Signature::single(TensorSpec::scalar(DType::Int64))
    }

    fn ints(ds: &Dataset) -> Vec<i64> {
        ds.collect_records()
            .unwrap()
            .iter()
            .map(|r| r.scalar::<i64>(0).unwrap())
            .collect()
    }

    fn square(r: Record) -> Result<Record> {
        let x = r.scalar::<i64>(0)?;
        Ok(Record::single(Tensor::scalar(x * x)))
    }

    #[test]
    fn test_map_and_filter() {
        let ds = Dataset::range(0, 6, 1)
            .map(int_sig(), square)
            .filter(|r| Ok(r.scalar::<i64>(0)? % 2 == 0));
        assert_eq!(ints(&ds), vec![0, 4, 16]);
    }

    #[test]
    fn test_map_error_surfaces() {
        let ds = Dataset::range(0, 3, 1).map(int_sig(), |r| {
            if r.scalar::<i64>(0)? == 1 {
                Err(Error::evaluation("check failed"))
            } else {
                Ok(r)
            }
        });
        let mut iter = ds.make_iterator().unwrap();
        assert!(iter.get_next().unwrap().is_some());
        assert!(matches!(iter.get_next(), Err(Error::Evaluation(_))));
        assert_eq!(iter.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), 2);
    }

    #[test]
    fn test_map_rejects_undeclared_structure() {
        let ds = Dataset::range(0, 3, 1).map(int_sig(), |_| Ok(Record::single(Tensor::scalar(1.5f64))));
        let mut iter = ds.make_iterator().unwrap();
        assert!(iter.get_next().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_map_capturing_requires_initialized_resource() {
        let counter = Arc::new(Variable::new("counter"));
        let captured = Arc::clone(&counter);
        let captures: Vec<Arc<dyn Resource>> = vec![counter.clone()];
        let ds = Dataset::range(0, 3, 1).map_capturing(int_sig(), captures, move |_| {
            Ok(Record::single(Tensor::scalar(captured.assign_add(1)?)))
        });

        // construction and iterator creation succeed, the first pull fails
        let mut iter = ds.make_iterator().unwrap();
        assert!(iter.get_next().unwrap_err().is_failed_precondition());

        counter.initialize(0).unwrap();
        assert_eq!(ints(&ds), vec![0, 1, 2]);
    }

    #[test]
    fn test_repeat() {
        let ds = Dataset::range(0, 3, 1);
        assert_eq!(ints(&ds.repeat(2)), vec![0, 1, 2, 0, 1, 2]);
        assert!(ints(&ds.repeat(0)).is_empty());

        let mut forever = ds.repeat(-1).make_iterator().unwrap();
        for i in 0..30 {
            assert_eq!(forever.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), i % 3);
        }
    }

    #[test]
    fn test_repeat_of_empty_pipeline_ends() {
        let ds = Dataset::range(0, 0, 1).repeat(-1);
        assert!(ints(&ds).is_empty());
    }

    #[test]
    fn test_zip_ends_with_shortest() {
        let ds = Dataset::range(0, 10, 1).zip_with(&Dataset::range(100, 103, 1));
        assert_eq!(ds.signature().len(), 2);
        let records = ds.collect_records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].scalar::<i64>(1).unwrap(), 102);
        assert!(Dataset::zip(&[]).is_err());
    }

    #[test]
    fn test_skip_and_take() {
        let ds = Dataset::range(0, 10, 1);
        assert_eq!(ints(&ds.skip(7)), vec![7, 8, 9]);
        assert!(ints(&ds.skip(-1)).is_empty());
        assert_eq!(ints(&ds.take(2)), vec![0, 1]);
        assert_eq!(ints(&ds.take(-1)).len(), 10);
        assert_eq!(ints(&ds.skip(2).take(3)), vec![2, 3, 4]);
    }

    #[test]
    fn test_flat_map() {
        let ds = Dataset::range(1, 4, 1).flat_map(int_sig(), |r| {
            let n = r.scalar::<i64>(0)?;
            Ok(Dataset::range(0, n, 1))
        });
        assert_eq!(ints(&ds), vec![0, 0, 1, 0, 1, 2]);
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let ds = Dataset::range(0, 50, 1).shuffle(10, Some(42));
        let first = ints(&ds);
        let second = ints(&ds);
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert!(ds.shuffle(0, None).make_iterator().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_map_with_state_restarts_per_run() {
        let ds = Dataset::range(0, 4, 1).map_with_state(
            int_sig(),
            || 0i64,
            |total, r| {
                *total += r.scalar::<i64>(0)?;
                Ok(Record::single(Tensor::scalar(*total)))
            },
        );
        assert_eq!(ints(&ds), vec![0, 1, 3, 6]);
        assert_eq!(ints(&ds), vec![0, 1, 3, 6]);
    }
}

//! Parallel map stage for ML input pipelines
//!
//! [`ParallelMapExt::parallel_map`] applies a per-record function on a
//! fixed pool of worker threads while keeping upstream order. At most
//! `output_buffer_size` records are in flight or waiting for the consumer.
//! Workers start on the first pull and are stopped and joined when the
//! iterator is disposed or dropped.

#![warn(missing_docs)]

mod map;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ml_input_core::{CapturedFunction, Dataset, Record, Resource, Result, Signature};

use crate::map::ParallelMapDataset;

/// Configuration for a parallel map stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelMapOptions {
    /// Number of worker threads, `<= 1` maps sequentially
    pub num_threads: usize,

    /// Capacity of the ordered output buffer, must be positive
    pub output_buffer_size: usize,
}

impl Default for ParallelMapOptions {
    fn default() -> Self {
        let num_threads = num_cpus::get();
        Self {
            num_threads,
            output_buffer_size: num_threads,
        }
    }
}

impl ParallelMapOptions {
    /// Options with explicit sizes
    pub fn new(num_threads: usize, output_buffer_size: usize) -> Self {
        Self {
            num_threads,
            output_buffer_size,
        }
    }
}

/// Parallel variants of `Dataset::map`
pub trait ParallelMapExt {
    /// Apply `func` to every record on `options.num_threads` workers,
    /// yielding results in upstream order
    fn parallel_map<F>(&self, signature: Signature, options: ParallelMapOptions, func: F) -> Dataset
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static;

    /// Like [`ParallelMapExt::parallel_map`] for a function that references
    /// external resources, which must be initialized before the first pull
    fn parallel_map_capturing<F>(
        &self,
        signature: Signature,
        options: ParallelMapOptions,
        captures: Vec<Arc<dyn Resource>>,
        func: F,
    ) -> Dataset
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static;

    /// Parallel map over an already wrapped function
    fn parallel_map_captured(&self, signature: Signature, options: ParallelMapOptions, func: CapturedFunction) -> Dataset;
}

impl ParallelMapExt for Dataset {
    fn parallel_map<F>(&self, signature: Signature, options: ParallelMapOptions, func: F) -> Dataset
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
    {
        self.parallel_map_captured(signature, options, CapturedFunction::new(func))
    }

    fn parallel_map_capturing<F>(
        &self,
        signature: Signature,
        options: ParallelMapOptions,
        captures: Vec<Arc<dyn Resource>>,
        func: F,
    ) -> Dataset
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
    {
        self.parallel_map_captured(signature, options, CapturedFunction::with_captures(func, captures))
    }

    fn parallel_map_captured(&self, signature: Signature, options: ParallelMapOptions, func: CapturedFunction) -> Dataset {
        Dataset::new(ParallelMapDataset {
            input: self.clone(),
            func,
            signature,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use ml_input_core::{DType, Error, Tensor, TensorSpec, Variable};
    use rand::Rng;
    use test_case::test_case;

    fn int_sig() -> Signature {
        Signature::single(TensorSpec::scalar(DType::Int64))
    }

    /// Squares its input after a random delay so workers finish out of order
    fn jittered_square(r: Record) -> Result<Record> {
        let x = r.scalar::<i64>(0)?;
        thread::sleep(Duration::from_micros(rand::thread_rng().gen_range(0..200)));
        Ok(Record::single(Tensor::scalar(x * x)))
    }

    fn ints(ds: &Dataset) -> Vec<i64> {
        ds.collect_records()
            .unwrap()
            .iter()
            .map(|r| r.scalar::<i64>(0).unwrap())
            .collect()
    }

    #[test_case(1, 1)]
    #[test_case(1, 2)]
    #[test_case(2, 2)]
    #[test_case(2, 4)]
    #[test_case(8, 8)]
    #[test_case(8, 16)]
    fn test_preserves_order(num_threads: usize, output_buffer_size: usize) {
        let ds = Dataset::range(0, 7, 1).repeat(18).parallel_map(
            int_sig(),
            ParallelMapOptions::new(num_threads, output_buffer_size),
            jittered_square,
        );
        let expected: Vec<i64> = (0..18).flat_map(|_| (0..7).map(|x| x * x)).collect();
        assert_eq!(ints(&ds), expected);
    }

    #[test]
    fn test_error_is_local_to_its_slot() {
        let ds = Dataset::range(0, 10, 1).parallel_map(int_sig(), ParallelMapOptions::new(4, 4), |r| {
            let x = r.scalar::<i64>(0)?;
            if x == 3 {
                return Err(Error::evaluation("numeric check failed"));
            }
            jittered_square(r)
        });
        let mut iter = ds.make_iterator().unwrap();
        for x in 0..3 {
            assert_eq!(iter.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), x * x);
        }
        assert!(matches!(iter.get_next(), Err(Error::Evaluation(_))));
        for x in 4..10 {
            assert_eq!(iter.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), x * x);
        }
        assert!(iter.get_next().unwrap().is_none());
        assert!(iter.get_next().unwrap().is_none());
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let ds = Dataset::range(0, 4, 1).parallel_map(int_sig(), ParallelMapOptions::new(2, 2), |r| {
            assert_ne!(r.scalar::<i64>(0)?, 2, "boom");
            Ok(r)
        });
        let mut iter = ds.make_iterator().unwrap();
        assert_eq!(iter.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), 0);
        assert_eq!(iter.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), 1);
        assert!(matches!(iter.get_next(), Err(Error::Internal(_))));
        assert_eq!(iter.get_next().unwrap().unwrap().scalar::<i64>(0).unwrap(), 3);
    }

    #[test]
    fn test_uninitialized_capture_fails_on_first_pull() {
        let counter = Arc::new(Variable::new("counter"));
        let captured = Arc::clone(&counter);
        let captures: Vec<Arc<dyn Resource>> = vec![counter.clone()];
        let ds = Dataset::range(0, 8, 1).parallel_map_capturing(
            int_sig(),
            ParallelMapOptions::new(4, 4),
            captures,
            move |r| {
                captured.assign_add(1)?;
                Ok(r)
            },
        );
        let mut iter = ds.make_iterator().unwrap();
        assert!(iter.get_next().unwrap_err().is_failed_precondition());

        counter.initialize(0).unwrap();
        assert_eq!(ints(&ds).len(), 8);
        assert_eq!(counter.read().unwrap(), 8);
    }

    #[test]
    fn test_zero_buffer_fails_at_initialize() {
        let ds = Dataset::range(0, 3, 1).parallel_map(int_sig(), ParallelMapOptions::new(2, 0), Ok);
        assert!(ds.make_iterator().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_drop_mid_stream_stops_workers() {
        let ds = Dataset::range(0, i64::MAX, 1).parallel_map(int_sig(), ParallelMapOptions::new(8, 8), jittered_square);
        for _ in 0..20 {
            let mut iter = ds.make_iterator().unwrap();
            for _ in 0..5 {
                assert!(iter.get_next().unwrap().is_some());
            }
            drop(iter);
        }
    }

    #[test]
    fn test_default_options() {
        let options = ParallelMapOptions::default();
        assert!(options.num_threads >= 1);
        assert_eq!(options.output_buffer_size, options.num_threads);
    }
}

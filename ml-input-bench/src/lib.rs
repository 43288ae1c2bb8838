//! Throughput benchmarks for ML input pipelines

use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use ml_input_core::{DType, Dataset, PartialShape, Record, Signature, Tensor, TensorSpec};
use ml_input_parallel::{ParallelMapExt, ParallelMapOptions};
use ml_input_readers::{CompressionType, TfRecordDataset, TfRecordOptions, TfRecordWriter};

/// Benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Number of timed iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Records produced by each source
    pub num_records: i64,

    /// Batch size for the batching pipelines
    pub batch_size: i64,

    /// Number of workers for the parallel map
    pub num_threads: usize,

    /// Output buffer of the parallel map
    pub output_buffer_size: usize,

    /// Arithmetic rounds the map function performs per record
    pub work_per_record: u32,

    /// Compression of the generated record container
    pub compression: CompressionType,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let parallel = ParallelMapOptions::default();
        Self {
            iterations: 5,
            warmup_iterations: 1,
            num_records: 100_000,
            batch_size: 64,
            num_threads: parallel.num_threads,
            output_buffer_size: parallel.output_buffer_size,
            work_per_record: 200,
            compression: CompressionType::None,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Elements pulled per iteration
    pub elements: usize,

    /// Throughput (elements/second)
    pub throughput: f64,
}

/// Drain a fresh iterator over `dataset`, returning the number of elements
pub fn drain(dataset: &Dataset) -> anyhow::Result<usize> {
    let mut iter = dataset.make_iterator()?;
    let mut count = 0;
    while iter.get_next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Time `dataset` over the configured number of iterations
pub fn run_benchmark(name: &str, config: &BenchConfig, dataset: &Dataset) -> anyhow::Result<BenchResult> {
    ensure!(config.iterations > 0, "iterations must be greater than zero");
    for _ in 0..config.warmup_iterations {
        drain(dataset).with_context(|| format!("warmup of {name}"))?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let mut elements = 0;
    let start_total = Instant::now();
    for _ in 0..config.iterations {
        let start = Instant::now();
        elements = drain(dataset).with_context(|| format!("iteration of {name}"))?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let iterations = u32::try_from(times.len()).context("too many iterations")?;
    let avg_time = times.iter().sum::<Duration>() / iterations;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    #[allow(clippy::cast_precision_loss)]
    let throughput = (elements * times.len()) as f64 / total_time.as_secs_f64();

    debug!(benchmark = name, ?avg_time, elements, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        elements,
        throughput,
    })
}

fn int_signature() -> Signature {
    Signature::single(TensorSpec::scalar(DType::Int64))
}

/// Busy arithmetic standing in for per-record preprocessing
fn busy_square(rounds: u32) -> impl Fn(Record) -> ml_input_core::Result<Record> + Send + Sync + 'static {
    move |record| {
        let x = record.scalar::<i64>(0)?;
        let mut acc = x;
        for i in 0..rounds {
            acc = acc.wrapping_mul(31).wrapping_add(i64::from(i)) % 1_000_003;
        }
        Ok(Record::single(Tensor::scalar(x * x + acc % 2)))
    }
}

/// Plain range source
pub fn range_pipeline(config: &BenchConfig) -> Dataset {
    Dataset::range(0, config.num_records, 1)
}

/// Range source stacked into fixed-size batches
pub fn batch_pipeline(config: &BenchConfig) -> anyhow::Result<Dataset> {
    Ok(range_pipeline(config).batch(config.batch_size)?)
}

/// Sequential map followed by batching
pub fn map_pipeline(config: &BenchConfig) -> anyhow::Result<Dataset> {
    Ok(range_pipeline(config)
        .map(int_signature(), busy_square(config.work_per_record))
        .batch(config.batch_size)?)
}

/// Parallel map followed by batching
pub fn parallel_map_pipeline(config: &BenchConfig) -> anyhow::Result<Dataset> {
    let options = ParallelMapOptions::new(config.num_threads, config.output_buffer_size);
    Ok(range_pipeline(config)
        .parallel_map(int_signature(), options, busy_square(config.work_per_record))
        .batch(config.batch_size)?)
}

/// Variable-length vectors padded to the longest element of each batch
pub fn padded_batch_pipeline(config: &BenchConfig) -> anyhow::Result<Dataset> {
    let ds = range_pipeline(config).map(
        Signature::single(TensorSpec::dense(DType::Int64, PartialShape::unknown_of_rank(1))),
        |record| {
            let x = record.scalar::<i64>(0)?;
            let len = usize::try_from(x % 17).unwrap_or_default();
            Ok(Record::single(Tensor::fill(vec![len], x)))
        },
    );
    Ok(ds.padded_batch(config.batch_size, vec![PartialShape::new([None])], None)?)
}

/// Writes a record container into `dir` and returns a source reading it
pub fn tfrecord_pipeline(config: &BenchConfig, dir: &TempDir) -> anyhow::Result<Dataset> {
    let path = dir.path().join("bench.tfrecord");
    let mut writer = TfRecordWriter::create(&path, config.compression)?;
    for i in 0..config.num_records {
        writer.write(format!("record {i:08}").as_bytes())?;
    }
    writer.finish()?;
    info!(path = %path.display(), records = config.num_records, "wrote benchmark input");
    Ok(TfRecordDataset::new([&path], TfRecordOptions::with_compression(config.compression)).into_dataset())
}

/// Run every benchmark with `config`
pub fn run_all(config: &BenchConfig) -> anyhow::Result<Vec<BenchResult>> {
    let dir = TempDir::new()?;
    let pipelines = [
        ("range", range_pipeline(config)),
        ("batch", batch_pipeline(config)?),
        ("map", map_pipeline(config)?),
        ("parallel_map", parallel_map_pipeline(config)?),
        ("padded_batch", padded_batch_pipeline(config)?),
        ("tfrecord", tfrecord_pipeline(config, &dir)?),
    ];
    pipelines
        .iter()
        .map(|(name, dataset)| run_benchmark(name, config, dataset))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BenchConfig {
        BenchConfig {
            iterations: 1,
            warmup_iterations: 0,
            num_records: 100,
            batch_size: 8,
            num_threads: 2,
            output_buffer_size: 4,
            work_per_record: 4,
            compression: CompressionType::Gzip,
        }
    }

    #[test]
    fn test_map_pipelines_agree() {
        let config = small_config();
        let sequential = map_pipeline(&config).unwrap().collect_records().unwrap();
        let parallel = parallel_map_pipeline(&config).unwrap().collect_records().unwrap();
        assert_eq!(sequential, parallel);
        assert_eq!(sequential.len(), 13);
    }

    #[test]
    fn test_run_all_counts_elements() {
        let results = run_all(&small_config()).unwrap();
        let elements: Vec<(&str, usize)> = results.iter().map(|r| (r.name.as_str(), r.elements)).collect();
        assert_eq!(
            elements,
            vec![
                ("range", 100),
                ("batch", 13),
                ("map", 13),
                ("parallel_map", 13),
                ("padded_batch", 13),
                ("tfrecord", 100),
            ]
        );
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: BenchConfig = serde_json::from_str(r#"{"num_records": 10, "compression": "Zlib"}"#).unwrap();
        assert_eq!(config.num_records, 10);
        assert_eq!(config.compression, CompressionType::Zlib);
        assert_eq!(config.batch_size, BenchConfig::default().batch_size);
    }
}

//! Benchmark runner for ML input pipelines
//!
//! Usage: `ml-input-bench [config.json]`. Fields missing from the config
//! file keep their defaults. Log verbosity follows `RUST_LOG`.

use std::fs;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ml_input_bench::{run_all, BenchConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?
        }
        None => BenchConfig::default(),
    };
    info!(?config, "running benchmarks");

    println!("=== ML Input Pipeline Benchmarks ===");
    for result in run_all(&config)? {
        println!("\nBenchmark: {}", result.name);
        println!("  Elements:     {}", result.elements);
        println!("  Total time:   {:?}", result.total_time);
        println!("  Average time: {:?}", result.avg_time);
        println!("  Min time:     {:?}", result.min_time);
        println!("  Max time:     {:?}", result.max_time);
        println!("  Throughput:   {:.2} elements/sec", result.throughput);
    }
    Ok(())
}

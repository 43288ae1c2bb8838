//! Property tests for batching and windowing

use ml_input_core::{DType, Dataset, PartialShape, Record, Signature, Tensor, TensorSpec};
use proptest::prelude::*;
use test_case::test_case;

fn ints(values: &[i64]) -> Dataset {
    Dataset::from_tensor_slice(Tensor::vector(values.to_vec())).unwrap()
}

/// Int64 vector records whose lengths are given by `lengths`
fn ragged(lengths: Vec<usize>) -> Dataset {
    let sig = Signature::single(TensorSpec::dense(DType::Int64, PartialShape::unknown_of_rank(1)));
    let records = lengths
        .into_iter()
        .enumerate()
        .map(|(i, n)| {
            let start = i64::try_from(i * 100).unwrap();
            Record::single(Tensor::vector((start..start + i64::try_from(n).unwrap()).collect()))
        })
        .collect();
    Dataset::from_records(sig, records).unwrap()
}

fn flatten(batches: &[Record]) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| b.dense(0).unwrap().as_slice::<i64>().unwrap().to_vec())
        .collect()
}

#[test_case(0, 3 ; "empty")]
#[test_case(6, 3 ; "exact multiple")]
#[test_case(7, 3 ; "short tail")]
#[test_case(2, 5 ; "single short batch")]
fn batch_counts(len: i64, batch_size: i64) {
    let values: Vec<i64> = (0..len).collect();
    let batches = ints(&values).batch(batch_size).unwrap().collect_records().unwrap();
    let expected = usize::try_from((len + batch_size - 1) / batch_size).unwrap();
    assert_eq!(batches.len(), expected);
    assert_eq!(flatten(&batches), values);
}

proptest! {
    #[test]
    fn batch_slices_upstream_in_order(values in prop::collection::vec(any::<i64>(), 0..60), batch_size in 1usize..10) {
        let batches = ints(&values).batch(batch_size as i64).unwrap().collect_records().unwrap();
        prop_assert_eq!(batches.len(), values.len().div_ceil(batch_size));
        for (i, batch) in batches.iter().enumerate() {
            let rows = batch.dense(0).unwrap().shape()[0];
            let expected = if i + 1 == batches.len() && values.len() % batch_size != 0 {
                values.len() % batch_size
            } else {
                batch_size
            };
            prop_assert_eq!(rows, expected);
        }
        prop_assert_eq!(flatten(&batches), values);
    }

    #[test]
    fn padded_batch_pads_to_batch_maximum(lengths in prop::collection::vec(0usize..8, 1..20), batch_size in 1usize..6) {
        let ds = ragged(lengths.clone())
            .padded_batch(batch_size as i64, vec![PartialShape::unknown_of_rank(1)], Some(vec![Tensor::scalar(-1i64)]))
            .unwrap();
        let batches = ds.collect_records().unwrap();
        for (batch, chunk) in batches.iter().zip(lengths.chunks(batch_size)) {
            let t = batch.dense(0).unwrap();
            let width = chunk.iter().copied().max().unwrap_or(0);
            prop_assert_eq!(t.shape(), &[chunk.len(), width][..]);
            let data = t.as_slice::<i64>().unwrap();
            for (row, &n) in chunk.iter().enumerate() {
                let padding = &data[row * width + n..(row + 1) * width];
                prop_assert!(padding.iter().all(|&v| v == -1));
            }
        }
    }

    #[test]
    fn dense_to_sparse_batch_round_trips(lengths in prop::collection::vec(0usize..6, 1..20), batch_size in 1usize..6) {
        let originals = ragged(lengths.clone()).collect_records().unwrap();
        let ds = ragged(lengths.clone()).dense_to_sparse_batch(batch_size as i64, vec![6]).unwrap();
        let batches = ds.collect_records().unwrap();
        let mut recovered = Vec::new();
        for (batch, chunk) in batches.iter().zip(lengths.chunks(batch_size)) {
            let sparse = batch.sparse(0).unwrap();
            prop_assert_eq!(sparse.dense_shape()[0], chunk.len() as i64);
            let dense = sparse.to_dense().unwrap();
            for (row, &n) in chunk.iter().enumerate() {
                let slice = dense.slice_outer(row).unwrap();
                recovered.push(slice.as_slice::<i64>().unwrap()[..n].to_vec());
            }
        }
        let expected: Vec<Vec<i64>> = originals
            .iter()
            .map(|r| r.dense(0).unwrap().as_slice::<i64>().unwrap().to_vec())
            .collect();
        prop_assert_eq!(recovered, expected);
    }

    #[test]
    fn group_by_window_preserves_records(values in prop::collection::vec(0i64..20, 0..80), buckets in 1i64..5, window_size in 1i64..6) {
        let ds = ints(&values)
            .group_by_window(
                move |r| Ok(r.scalar::<i64>(0)? % buckets),
                move |_, window| window.batch(window_size),
                window_size,
            )
            .unwrap();
        let windows = ds.collect_records().unwrap();
        let mut seen = Vec::new();
        let mut short_seen = false;
        for window in &windows {
            let items = window.dense(0).unwrap().as_slice::<i64>().unwrap().to_vec();
            prop_assert!(items.iter().all(|v| v % buckets == items[0] % buckets));
            if (items.len() as i64) < window_size {
                short_seen = true;
            } else {
                // full windows never follow the flush of short ones
                prop_assert!(!short_seen);
            }
            seen.extend(items);
        }
        let mut expected = values.clone();
        expected.sort_unstable();
        seen.sort_unstable();
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn reinitialize_reproduces_seeded_shuffle() {
    let ds = ints(&(0..100).collect::<Vec<_>>()).shuffle(16, Some(7)).batch(10).unwrap();
    let iter = ds.make_one_shot_iterator().unwrap();
    let first: Vec<Record> = iter.records().collect::<Result<_, _>>().unwrap();
    iter.initialize().unwrap();
    let second: Vec<Record> = iter.records().collect::<Result<_, _>>().unwrap();
    assert_eq!(first, second);
}

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use soma_query::{IntIndexer, SomaError, NOT_FOUND};

fn shuffled_keys(n: usize, seed: u64) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys: Vec<i64> = (0..n as i64).map(|i| i * 7919 - 1_000_000).collect();
    keys.shuffle(&mut rng);
    keys
}

#[test]
fn resolving_build_keys_returns_identity() {
    let keys = shuffled_keys(10_000, 42);
    let idx  = IntIndexer::from_keys(&keys, 4).unwrap();
    let out  = idx.resolve(&keys, 4).unwrap();
    assert_eq!(out, (0..keys.len() as i64).collect::<Vec<_>>());
}

#[test]
fn thread_count_does_not_change_results() {
    let keys = shuffled_keys(5_000, 7);
    let mut rng = StdRng::seed_from_u64(8);
    let probe: Vec<i64> = (0..2_000).map(|_| keys[rng.gen_range(0..keys.len())] + rng.gen_range(0..2)).collect();

    let expected = IntIndexer::from_keys(&keys, 1).unwrap().resolve(&probe, 1).unwrap();
    for threads in 2..=8 {
        let idx = IntIndexer::from_keys(&keys, threads).unwrap();
        assert_eq!(idx.resolve(&probe, threads).unwrap(), expected, "threads={threads}");
        assert_eq!(idx.resolve(&probe, 1).unwrap(), expected);
    }
}

#[test]
fn subset_resolves_to_original_offsets() {
    let keys = shuffled_keys(1_000, 99);
    let idx  = IntIndexer::from_keys(&keys, 3).unwrap();
    let picks: Vec<usize> = (0..keys.len()).step_by(13).rev().collect();
    let subset: Vec<i64>  = picks.iter().map(|&i| keys[i]).collect();
    let got = idx.resolve(&subset, 3).unwrap();
    assert_eq!(got, picks.iter().map(|&i| i as i64).collect::<Vec<_>>());
}

#[test]
fn absent_keys_resolve_to_sentinel() {
    let idx = IntIndexer::from_keys(&[1, 11, 101, 1001, 10001, 100001, 1000001, 10000001], 4).unwrap();
    assert_eq!(idx.resolve(&[101, 999, 1], 4).unwrap(), vec![2, NOT_FOUND, 0]);
    assert_eq!(idx.resolve(&[i64::MIN, i64::MAX, 0], 2).unwrap(), vec![NOT_FOUND; 3]);
}

#[test]
fn duplicates_are_rejected_for_every_thread_count() {
    let mut keys = shuffled_keys(500, 3);
    keys.push(keys[17]);
    for threads in [1, 2, 5, 16] {
        let err = IntIndexer::from_keys(&keys, threads).unwrap_err();
        assert!(matches!(err, SomaError::DuplicateKey { first: 17, second: 500, .. }), "{err}");
    }
}

#[test]
fn built_indexer_can_be_shared_across_threads() {
    let keys = shuffled_keys(2_000, 11);
    let idx  = IntIndexer::from_keys(&keys, 2).unwrap();
    std::thread::scope(|s| {
        for t in 0..4 {
            let (idx, keys) = (&idx, &keys);
            s.spawn(move || {
                let part = &keys[t * 500..(t + 1) * 500];
                let got  = idx.resolve(part, 2).unwrap();
                assert_eq!(got[0], (t * 500) as i64);
            });
        }
    });
}

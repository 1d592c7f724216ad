//! Concurrency and property tests for revision ordering.

use etcd_shim::{KeyRange, KvEngine, RangeOptions, Revision};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_concurrent_puts_get_distinct_revisions() {
    let engine = Arc::new(KvEngine::in_memory());
    let threads = 8;
    let per_thread = 250;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..per_thread)
                    .map(|i| {
                        // Half the threads share one key
                        let key = if t % 2 == 0 {
                            "shared".to_string()
                        } else {
                            format!("t{}/{}", t, i)
                        };
                        engine.put(key, "v").unwrap().revision
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let revisions = handle.join().unwrap();
        assert!(revisions.windows(2).all(|w| w[0] < w[1]));
        for rev in revisions {
            assert!(seen.insert(rev), "revision {} issued twice", rev);
        }
    }

    let total = (threads * per_thread) as Revision;
    assert_eq!(seen.len() as Revision, total);
    assert_eq!(engine.current_revision(), total);
    assert_eq!(engine.get("shared").unwrap().unwrap().version, total / 2);
}

#[test]
fn test_cas_race_has_one_winner() {
    for _ in 0..50 {
        let engine = Arc::new(KvEngine::in_memory());
        let base = engine.put("lock", "free").unwrap().revision;
        let barrier = Arc::new(Barrier::new(2));

        let cas = {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.compare_and_swap("lock", base, "cas").unwrap()
            })
        };
        let competing = {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.compare_and_swap("lock", base, "other").unwrap()
            })
        };

        let a = cas.join().unwrap();
        let b = competing.join().unwrap();
        assert!(a.succeeded ^ b.succeeded, "exactly one writer must win");

        let (winner, loser) = if a.succeeded { (a, b) } else { (b, a) };
        // The loser learns the revision it lost to
        assert_eq!(loser.revision, winner.revision);
        assert_eq!(engine.current_revision(), base + 1);
    }
}

#[test]
fn test_put_between_check_and_commit_fails_cas() {
    let engine = Arc::new(KvEngine::in_memory());
    let base = engine.put("k", "0").unwrap().revision;
    let barrier = Arc::new(Barrier::new(2));

    let writer = {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            engine.put("k", "plain").unwrap().revision
        })
    };
    barrier.wait();
    let cas = engine.compare_and_swap("k", base, "cas").unwrap();
    let put_rev = writer.join().unwrap();

    let value = engine.get("k").unwrap().unwrap();
    if cas.succeeded {
        // CAS went first, the plain put landed on top
        assert!(cas.revision < put_rev);
        assert_eq!(value.value, b"plain");
    } else {
        assert_eq!(cas.revision, put_rev);
        assert_eq!(value.value, b"plain");
    }
}

#[test]
fn test_readers_never_see_partial_delete() {
    let engine = Arc::new(KvEngine::in_memory());
    for i in 0..100 {
        engine.put(format!("batch/{:03}", i), "v").unwrap();
    }

    let reader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for _ in 0..200 {
                let count = engine
                    .range(&KeyRange::prefix("batch/"), RangeOptions::default())
                    .unwrap()
                    .count;
                assert!(count == 100 || count == 0, "observed {} keys", count);
            }
        })
    };

    engine.delete_range(&KeyRange::prefix("batch/")).unwrap();
    reader.join().unwrap();
}

// --- Properties ---

#[derive(Clone, Debug)]
enum Op {
    Put(u8, u8),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        (0u8..8).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_range_matches_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let engine = KvEngine::in_memory();
        let mut model: BTreeMap<Vec<u8>, (Vec<u8>, i64)> = BTreeMap::new();
        let mut last_revision = 0;

        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    let key = vec![b'k', *k];
                    let rev = engine.put(key.clone(), vec![*v]).unwrap().revision;
                    prop_assert!(rev > last_revision);
                    last_revision = rev;
                    let version = model.get(&key).map(|(_, ver)| ver + 1).unwrap_or(1);
                    model.insert(key, (vec![*v], version));
                }
                Op::Delete(k) => {
                    let key = vec![b'k', *k];
                    let resp = engine.delete_range(&KeyRange::single(key.clone())).unwrap();
                    let existed = model.remove(&key).is_some();
                    prop_assert_eq!(resp.deleted, usize::from(existed));
                    if existed {
                        prop_assert!(resp.revision > last_revision);
                        last_revision = resp.revision;
                    } else {
                        prop_assert_eq!(resp.revision, last_revision);
                    }
                }
            }
        }

        let resp = engine.range(&KeyRange::all(), RangeOptions::default()).unwrap();
        let actual: Vec<_> = resp
            .kvs
            .iter()
            .map(|kv| (kv.key.clone(), (kv.value.clone(), kv.version)))
            .collect();
        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(resp.header_revision, last_revision);
    }

    #[test]
    fn prop_history_reads_are_stable(values in prop::collection::vec(any::<u8>(), 1..30)) {
        let engine = KvEngine::in_memory();
        let revisions: Vec<_> = values
            .iter()
            .map(|v| engine.put("k", vec![*v]).unwrap().revision)
            .collect();

        for (rev, value) in revisions.iter().zip(&values) {
            let resp = engine.range(&KeyRange::single("k"), RangeOptions::at(*rev)).unwrap();
            prop_assert_eq!(&resp.kvs[0].value, &vec![*value]);
            prop_assert_eq!(resp.kvs[0].mod_revision, *rev);
        }
    }
}

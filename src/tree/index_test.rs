use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, convert::TryFrom, sync::Arc, thread};

use crate::{types::ByteKey, Config};

use super::*;

fn small_config() -> Config {
    let mut config = Config::default();
    config.set_max_workers(64).unwrap();
    config
}

fn insert_retry<K, P>(index: &Index<K, P>, key: K, payload: P, worker_id: usize)
where
    K: crate::types::FeatureKey + 'static,
    P: 'static + Copy + Default + Send + Sync,
{
    loop {
        match index.insert(key.clone(), payload, worker_id) {
            Ok((_, inserted)) => {
                assert!(inserted);
                break;
            }
            Err(err) if err.is_retry() => thread::yield_now(),
            Err(err) => panic!("insert: {}", err),
        }
    }
}

fn get_retry<K, P>(index: &Index<K, P>, key: &K, worker_id: usize) -> Option<P>
where
    K: crate::types::FeatureKey + 'static,
    P: 'static + Copy + Default + Send + Sync,
{
    loop {
        match index.get(key, worker_id) {
            Ok(payload) => break Some(payload),
            Err(Error::KeyNotFound(_, _)) => break None,
            Err(err) if err.is_retry() => thread::yield_now(),
            Err(err) => panic!("get: {}", err),
        }
    }
}

#[test]
fn test_bulk_load_then_point_read() {
    let index: Index<ByteKey<16>, u64> = Index::new("test-bulk", small_config()).unwrap();
    let items: Vec<(ByteKey<16>, u64)> = vec![
        (ByteKey::try_from("apple").unwrap(), 1),
        (ByteKey::try_from("banana").unwrap(), 2),
        (ByteKey::try_from("cherry").unwrap(), 3),
    ];
    index.bulk_load(&items).unwrap();
    assert_eq!(index.len(), 3);

    let worker_id = index.register_worker().unwrap();
    let banana = ByteKey::try_from("banana").unwrap();
    assert_eq!(index.get(&banana, worker_id).unwrap(), 2);

    let blueberry = ByteKey::try_from("blueberry").unwrap();
    match index.get(&blueberry, worker_id) {
        Err(Error::KeyNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    let mut out = vec![];
    index.scan(&ByteKey::min_key(), 100, &mut out).unwrap();
    assert_eq!(out, items);

    assert_eq!(index.first_key(), Some(items[0].0));
    assert_eq!(index.last_key(), Some(items[2].0));

    index.validate().unwrap();
    index.close().unwrap();
}

#[test]
fn test_bulk_load_errors() {
    let index: Index<u64, u64> = Index::new("test-bulk-err", small_config()).unwrap();

    assert!(index.bulk_load(&[]).is_err());
    assert!(index.bulk_load(&[(10, 1), (5, 2)]).is_err());
    // duplicates in the input need the duplicates option.
    assert!(index.bulk_load(&[(5, 1), (5, 2)]).is_err());

    index.bulk_load(&[(5, 1), (10, 2)]).unwrap();
    assert!(index.bulk_load(&[(20, 3)]).is_err(), "index not empty");
}

// insert from empty, growth goes through expansion and splits.
#[test]
fn test_insert_growth() {
    let index: Index<ByteKey<8>, u64> = Index::new("test-growth", small_config()).unwrap();
    let worker_id = index.register_worker().unwrap();

    let keys: Vec<ByteKey<8>> = (0..1000)
        .map(|i| ByteKey::try_from(format!("k{:04}", i).as_str()).unwrap())
        .collect();
    for (i, key) in keys.iter().enumerate() {
        insert_retry(&index, *key, i as u64, worker_id);
    }
    index.sync().unwrap();

    assert_eq!(index.len(), 1000);
    let mut out = vec![];
    index.scan(&ByteKey::min_key(), 1000, &mut out).unwrap();
    assert_eq!(out.len(), 1000);
    for (i, (key, payload)) in out.iter().enumerate() {
        assert_eq!(key, &keys[i]);
        assert_eq!(*payload, i as u64);
    }

    let stats = index.to_stats().unwrap();
    assert!(stats.n_expansions >= 1, "{}", stats);
    assert!(stats.n_bg_jobs >= 1, "{}", stats);

    index.validate().unwrap();
    index.close().unwrap();
}

#[test]
fn test_duplicate_rejection() {
    let index: Index<u64, u64> = Index::new("test-dup", small_config()).unwrap();
    let worker_id = index.register_worker().unwrap();

    let (_, inserted) = index.insert(42, 1, worker_id).unwrap();
    assert!(inserted);
    match index.insert(42, 2, worker_id) {
        Err(Error::DuplicateKey(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|(_, b)| b)),
    }
    assert_eq!(index.len(), 1);
    assert_eq!(get_retry(&index, &42, worker_id), Some(1));
}

#[test]
fn test_duplicates_allowed() {
    let mut config = small_config();
    config.set_allow_duplicates(true);
    let index: Index<u64, u64> = Index::new("test-dup-ok", config).unwrap();
    let worker_id = index.register_worker().unwrap();

    insert_retry(&index, 7, 1, worker_id);
    insert_retry(&index, 7, 2, worker_id);
    index.sync().unwrap();
    assert_eq!(index.len(), 2);

    // both entries are retrievable at some position.
    let mut out = vec![];
    index.scan(&0, 10, &mut out).unwrap();
    let mut payloads: Vec<u64> = out.iter().map(|(_, p)| *p).collect();
    payloads.sort_unstable();
    assert_eq!(payloads, vec![1, 2]);
}

// spec scenario: two writers over disjoint ranges, with concurrent
// background restructuring.
#[test]
fn test_insert_under_concurrent_restructure() {
    let n_per_thread = 20_000_u64;
    let index: Arc<Index<u64, u64>> =
        Arc::new(Index::new("test-concurrent", small_config()).unwrap());

    let mut handles = vec![];
    for t in 0..2_u64 {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            let worker_id = index.register_worker().unwrap();
            let start = t * n_per_thread;
            for key in start..(start + n_per_thread) {
                insert_retry(&index, key, key + 1, worker_id);
                if key % 97 == 0 {
                    // interleave reads while restructuring runs.
                    assert_eq!(get_retry(&index, &key, worker_id), Some(key + 1));
                }
            }
        }));
    }
    for handle in handles.into_iter() {
        handle.join().unwrap();
    }
    index.sync().unwrap();

    assert_eq!(index.len(), (2 * n_per_thread) as usize);
    index.validate().unwrap();

    let mut out = vec![];
    index.scan(&0, usize::MAX, &mut out).unwrap();
    assert_eq!(out.len(), (2 * n_per_thread) as usize);
    for (i, (key, payload)) in out.iter().enumerate() {
        assert_eq!(*key, i as u64);
        assert_eq!(*payload, (i + 1) as u64);
    }
}

// spec scenario: small leaves force continuous restructuring, every
// structural invariant must hold at the end.
#[test]
fn test_restructure_invariants() {
    let mut config = small_config();
    // 64 slots per leaf with (u64, u64) entries.
    config.set_max_node_size(1024).unwrap();
    let max_slots = config.max_data_node_slots(16);
    assert_eq!(max_slots, 64);

    let index: Index<u64, u64> = Index::new("test-restructure", config).unwrap();
    let worker_id = index.register_worker().unwrap();

    for key in 0..10_000_u64 {
        insert_retry(&index, key, key, worker_id);
    }
    index.sync().unwrap();

    index.validate().unwrap();
    for leaf in index.collect_leaves().iter() {
        let data = leaf.as_data().unwrap();
        assert!(data.arr.read().num_keys <= max_slots);
    }

    let stats = index.to_stats().unwrap();
    assert!(
        stats.n_splits_sideways + stats.n_splits_downwards >= 1,
        "{}",
        stats
    );
    assert!(stats.n_data_nodes >= (10_000 / max_slots), "{}", stats);

    let mut out = vec![];
    index.scan(&0, usize::MAX, &mut out).unwrap();
    assert_eq!(out.len(), 10_000);
    index.close().unwrap();
}

// gets and scans race live background drains, no sync() before reading.
// In-place installs relocate entries inside a leaf, committed keys must
// stay visible and scans must neither duplicate nor drop entries.
#[test]
fn test_reads_during_live_drains() {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};

    let mut config = small_config();
    config.set_delta_index_capacity(64); // small buffers, constant churn
    let index: Arc<Index<u64, u64>> =
        Arc::new(Index::new("test-live-drains", config).unwrap());

    // evens live in main arrays from the start.
    let n = 5_000_u64;
    let evens: Vec<(u64, u64)> = (0..n).map(|i| (i * 2, i)).collect();
    index.bulk_load(&evens).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    // odd keys below this are committed inserts.
    let watermark = Arc::new(AtomicU64::new(0));

    let writer = {
        let index = Arc::clone(&index);
        let (done, watermark) = (Arc::clone(&done), Arc::clone(&watermark));
        thread::spawn(move || {
            let worker_id = index.register_worker().unwrap();
            for i in 0..n {
                let key = (i * 2) + 1;
                insert_retry(&index, key, key, worker_id);
                watermark.store(key + 1, SeqCst);
            }
            done.store(true, SeqCst);
        })
    };

    let reader = {
        let index = Arc::clone(&index);
        let (done, watermark) = (Arc::clone(&done), Arc::clone(&watermark));
        thread::spawn(move || {
            let worker_id = index.register_worker().unwrap();
            let want_evens: Vec<u64> = (0..n).map(|i| i * 2).collect();
            let mut scans = 0_usize;
            while !done.load(SeqCst) || scans < 4 {
                // a committed key never reads as not-found, even while an
                // install migrates it from a delta-buffer into the array.
                let mark = watermark.load(SeqCst);
                if mark > 0 {
                    let key = mark - 1;
                    assert_eq!(get_retry(&index, &key, worker_id), Some(key));
                }

                let mut out = vec![];
                index.scan(&0, usize::MAX, &mut out).unwrap();
                for pair in out.windows(2) {
                    assert!(pair[0].0 < pair[1].0, "scan emitted a duplicate");
                }
                let got_evens: Vec<u64> =
                    out.iter().map(|(k, _)| *k).filter(|k| k % 2 == 0).collect();
                assert_eq!(got_evens, want_evens, "scan dropped entries");
                scans += 1;
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    index.sync().unwrap();
    index.validate().unwrap();
    assert_eq!(index.len(), (2 * n) as usize);
}

#[test]
fn test_erase() {
    let index: Index<u64, u64> = Index::new("test-erase", small_config()).unwrap();
    let items: Vec<(u64, u64)> = (0..100).map(|i| (i * 2, i)).collect();
    index.bulk_load(&items).unwrap();
    let worker_id = index.register_worker().unwrap();

    assert_eq!(index.erase(&10).unwrap(), 1);
    assert_eq!(index.len(), 99);
    assert_eq!(get_retry(&index, &10, worker_id), None);
    assert_eq!(index.erase(&10).unwrap(), 0);
    assert_eq!(index.erase(&11).unwrap(), 0, "never existed");

    // insert, erase leaves the set unchanged.
    insert_retry(&index, 10, 5, worker_id);
    index.sync().unwrap(); // erase is refused while a job is pending
    assert_eq!(index.erase(&10).unwrap(), 1);
    assert_eq!(index.len(), 99);
    index.validate().unwrap();
}

// tiny delta-buffers saturate quickly, foreground writers live off the
// retry-later handshake and still make progress.
#[test]
fn test_retry_later_handshake() {
    let mut config = small_config();
    config.set_delta_index_capacity(4);
    let index: Index<u64, u64> = Index::new("test-retry", config).unwrap();
    let worker_id = index.register_worker().unwrap();

    for key in 0..2_000_u64 {
        insert_retry(&index, key, key, worker_id);
    }
    index.sync().unwrap();

    assert_eq!(index.len(), 2_000);
    index.validate().unwrap();
    for key in (0..2_000_u64).step_by(113) {
        assert_eq!(get_retry(&index, &key, worker_id), Some(key));
    }
}

#[test]
fn test_bound_iterators() {
    let index: Index<u64, u64> = Index::new("test-bounds", small_config()).unwrap();
    index.bulk_load(&[(10, 1), (20, 2), (30, 3)]).unwrap();

    let mut iter = index.lower_bound(&15).unwrap();
    assert_eq!(iter.next(), Some((20, 2)));

    let mut iter = index.lower_bound(&20).unwrap();
    assert_eq!(iter.next(), Some((20, 2)));

    // lower bound past the max key is end.
    let mut iter = index.lower_bound(&31).unwrap();
    assert_eq!(iter.next(), None);

    // upper bound of the last key is end.
    let mut iter = index.upper_bound(&30).unwrap();
    assert_eq!(iter.next(), None);

    let mut iter = index.upper_bound(&10).unwrap();
    assert_eq!(iter.next(), Some((20, 2)));

    let collected: Vec<(u64, u64)> = index.lower_bound(&0).unwrap().collect();
    assert_eq!(collected, vec![(10, 1), (20, 2), (30, 3)]);
}

#[test]
fn test_random_against_btreemap() {
    let seed: u64 = random();
    println!("test_random_against_btreemap seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut reference = BTreeMap::new();
    while reference.len() < 10_000 {
        reference.insert(rng.gen::<u64>() >> 4, rng.gen::<u64>());
    }
    let items: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();

    let index: Index<u64, u64> = Index::new("test-random", small_config()).unwrap();
    index.bulk_load(&items).unwrap();
    let worker_id = index.register_worker().unwrap();

    let mut out = vec![];
    index.scan(&0, usize::MAX, &mut out).unwrap();
    assert_eq!(out, items);

    for _ in 0..1000 {
        let (key, payload) = &items[rng.gen::<usize>() % items.len()];
        assert_eq!(get_retry(&index, key, worker_id), Some(*payload));
        let probe = rng.gen::<u64>();
        assert_eq!(
            get_retry(&index, &probe, worker_id),
            reference.get(&probe).copied()
        );
    }
    index.validate().unwrap();
}

#[test]
fn test_byte_key_domain() {
    let index: Index<ByteKey<8>, u64> = Index::new("test-domain", small_config()).unwrap();
    let items: Vec<(ByteKey<8>, u64)> = vec![
        (ByteKey::try_from("apple").unwrap(), 1),
        (ByteKey::try_from("banana").unwrap(), 2),
        (ByteKey::try_from("cherry").unwrap(), 3),
    ];
    index.bulk_load(&items).unwrap();
    let worker_id = index.register_worker().unwrap();

    // inside the bulk-loaded domain.
    let blueberry = ByteKey::try_from("bluebe").unwrap();
    insert_retry(&index, blueberry, 4, worker_id);

    // outside the fixed domain.
    let zebra = ByteKey::try_from("zebra").unwrap();
    match index.insert(zebra, 5, worker_id) {
        Err(Error::DomainViolation(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|(_, b)| b)),
    }

    // numeric keys widen the domain instead.
    let numeric: Index<u64, u64> = Index::new("test-domain-num", small_config()).unwrap();
    numeric.bulk_load(&[(100, 1), (200, 2)]).unwrap();
    let w = numeric.register_worker().unwrap();
    insert_retry(&numeric, 5_000, 3, w);
    let stats = numeric.to_stats().unwrap();
    assert_eq!(stats.n_domain_expansions, 1);
}

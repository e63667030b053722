use arbitrary::{Arbitrary, Unstructured};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::collections::BTreeMap;

use super::*;

fn sorted_items(n: u64, stride: u64) -> Vec<(u64, u64)> {
    (0..n).map(|i| (i * stride, i)).collect()
}

fn check_invariants(arr: &GappedArray<u64, u64>) {
    let capacity = arr.capacity();
    assert_eq!(arr.num_keys_in_range(0, capacity), arr.num_keys);

    // slot keys are non-decreasing, gap slots carry the next present key
    // to the right, or the end sentinel.
    let mut sentinel = u64::max_key();
    for pos in (0..capacity).rev() {
        if arr.check_exists(pos) {
            sentinel = arr.keys[pos];
        } else {
            assert_eq!(arr.keys[pos], sentinel, "gap sentinel at {}", pos);
        }
    }
    for pos in 1..capacity {
        assert!(arr.keys[pos - 1] <= arr.keys[pos], "sorted at {}", pos);
    }
}

#[test]
fn test_build_and_find() {
    let items = sorted_items(1000, 3);
    let arr = GappedArray::build(&items, items.len() + 1, None, false, 0.5).unwrap();

    assert_eq!(arr.num_keys, 1000);
    assert!(arr.capacity() >= 1001);
    check_invariants(&arr);

    for (key, payload) in items.iter() {
        let (pos, got) = arr.find_key(key).unwrap();
        assert!(arr.check_exists(pos));
        assert_eq!(got, *payload, "key {}", key);
    }
    // missing keys, between and outside the loaded range.
    assert_eq!(arr.find_key(&1), None);
    assert_eq!(arr.find_key(&(3000 * 3)), None);

    assert_eq!(arr.first_key(), Some(0));
    assert_eq!(arr.last_key(), Some(999 * 3));
}

#[test]
fn test_find_lower_upper() {
    let items = sorted_items(100, 10);
    let arr = GappedArray::build(&items, items.len() + 1, None, false, 0.0).unwrap();

    // lower bound of an absent key and a present key.
    let pos = arr.find_lower(&95);
    assert_eq!(arr.keys[pos], 100);
    let pos = arr.find_lower(&100);
    assert_eq!(arr.keys[pos], 100);

    // upper bound steps past an exact match.
    let pos = arr.find_upper(&100);
    assert_eq!(arr.keys[pos], 110);

    // past the last key both return capacity.
    assert_eq!(arr.find_lower(&99_999), arr.capacity());
    assert_eq!(arr.find_upper(&990), arr.capacity());
}

#[test]
fn test_insert_entry_random() {
    let seed: u64 = random();
    println!("test_insert_entry_random seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut arr: GappedArray<u64, u64> = GappedArray::empty(4096, crate::model::LinearModel::zero::<u64>());
    let mut reference = BTreeMap::new();

    for i in 0..4000_u64 {
        let key = (rng.gen::<u64>() % 100_000) + 1;
        match arr.insert_entry(&key, i, false).unwrap() {
            ArrInsert::Done(pos) => {
                assert!(arr.check_exists(pos));
                assert_eq!(arr.keys[pos], key);
                reference.insert(key, i);
            }
            ArrInsert::Duplicate(_) => {
                assert!(reference.contains_key(&key), "false duplicate {}", key);
            }
            ArrInsert::Full => unreachable!(),
        }
    }

    assert_eq!(arr.num_keys, reference.len());
    check_invariants(&arr);

    for (key, payload) in reference.iter() {
        let (_, got) = arr.find_key(key).unwrap();
        assert_eq!(got, *payload);
    }

    // entries come back in key order.
    let entries = arr.to_entries();
    let want: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries, want);
}

#[test]
fn test_insert_entry_duplicates_allowed() {
    let mut arr: GappedArray<u64, u64> =
        GappedArray::empty(64, crate::model::LinearModel::zero::<u64>());
    for payload in 0..3_u64 {
        match arr.insert_entry(&42, payload, true).unwrap() {
            ArrInsert::Done(_) => (),
            _ => panic!("duplicate rejected"),
        }
    }
    assert_eq!(arr.num_keys, 3);
    let entries = arr.to_entries();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|(k, _)| *k == 42));
    // each payload is retrievable at some position.
    let mut payloads: Vec<u64> = entries.iter().map(|(_, p)| *p).collect();
    payloads.sort_unstable();
    assert_eq!(payloads, vec![0, 1, 2]);
}

#[test]
fn test_insert_entry_full() {
    let mut arr: GappedArray<u64, u64> =
        GappedArray::empty(4, crate::model::LinearModel::zero::<u64>());
    for i in 0..4_u64 {
        match arr.insert_entry(&i, i, false).unwrap() {
            ArrInsert::Done(_) => (),
            _ => panic!("unexpected"),
        }
    }
    match arr.insert_entry(&10, 10, false).unwrap() {
        ArrInsert::Full => (),
        _ => panic!("full array accepted an insert"),
    }
}

#[test]
fn test_closest_gap() {
    let seed: u64 = random();
    println!("test_closest_gap seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    for _ in 0..20 {
        let capacity = 64 + (rng.gen::<usize>() % 512);
        let mut arr: GappedArray<u64, u64> =
            GappedArray::empty(capacity, crate::model::LinearModel::zero::<u64>());
        // occupy a random subset.
        for pos in 0..capacity {
            if rng.gen::<u64>() % 100 < 80 {
                crate::util::set_bit(&mut arr.bitmap, pos);
            }
        }

        for _ in 0..64 {
            let pos = rng.gen::<usize>() % capacity;
            let got = arr.closest_gap(pos);

            // reference: linear scan both directions.
            let left = (0..=pos).rev().find(|i| !arr.check_exists(*i));
            let right = ((pos + 1)..capacity).find(|i| !arr.check_exists(*i));
            let want = match (left, right) {
                (Some(l), Some(r)) => {
                    if (pos - l) <= (r - pos) {
                        Some(l)
                    } else {
                        Some(r)
                    }
                }
                (l, r) => l.or(r),
            };
            assert_eq!(got, want, "pos {} capacity {}", pos, capacity);
        }
    }
}

#[test]
fn test_erase() {
    let items = sorted_items(200, 2);
    let mut arr = GappedArray::build(&items, items.len() + 1, None, false, 0.0).unwrap();

    assert_eq!(arr.erase(&11), None); // absent
    assert_eq!(arr.erase(&10), Some(5));
    assert_eq!(arr.num_keys, 199);
    assert_eq!(arr.find_key(&10), None);
    check_invariants(&arr);

    // erase the last key, trailing slots fall back to the end sentinel.
    assert_eq!(arr.erase(&398), Some(199));
    check_invariants(&arr);
    assert_eq!(arr.last_key(), Some(396));

    // erase everything.
    for (key, _) in items.iter() {
        arr.erase(key);
    }
    assert_eq!(arr.num_keys, 0);
    check_invariants(&arr);
}

#[test]
fn test_expected_stats_accumulator() {
    let mut acc = ExpectedStats::default();
    // perfectly predicted dense run of 8.
    for pos in 0..8 {
        acc.accumulate(pos, pos);
    }
    assert_eq!(acc.mean_search_iters(), 0.0);
    assert_eq!(acc.mean_shifts(), (8 * 8 / 4) as f64 / 8.0);

    // an off-by-three prediction accumulates log2(4) = 2 iterations.
    let mut acc = ExpectedStats::default();
    acc.accumulate(10, 7);
    assert_eq!(acc.mean_search_iters(), 2.0);
}

#[test]
fn test_expected_cost_monotone_in_error() {
    // a good model prices cheaper than a broken one.
    let items = sorted_items(10_000, 1);
    let good = crate::model::build_model(
        &items.iter().map(|(k, _)| *k).collect::<Vec<u64>>(),
        false,
    )
    .unwrap();
    let broken = crate::model::LinearModel::new(vec![0.0], 0.0);

    let (good_cost, _, _) = expected_cost(&items, 1.0, 0.5, Some(&good), false).unwrap();
    let (broken_cost, _, _) = expected_cost(&items, 1.0, 0.5, Some(&broken), false).unwrap();
    assert!(good_cost < broken_cost, "{} vs {}", good_cost, broken_cost);
}

#[test]
fn test_data_node_insert_codes() {
    let items = sorted_items(64, 1);
    let arr = GappedArray::build(&items, items.len() + 1, None, false, 0.0).unwrap();
    let node: DataNode<u64, u64> = DataNode::new(arr, u64::min_key(), 1, 0, 1 << 20);

    assert_eq!(node.status(), Status::WriteArray);
    assert_eq!(node.len(), 64);

    // capacity is 65, the insert that fills the last gap must demand a
    // restructure.
    match node.insert_fg(&1_000, 1, false, 128).unwrap() {
        Insert::NeedsRestructure(_) => (),
        code => panic!("unexpected {:?}", code),
    }

    // duplicates surface before thresholds.
    match node.insert_fg(&10, 1, false, 128).unwrap() {
        Insert::Duplicate(_) => (),
        code => panic!("unexpected {:?}", code),
    }
}

#[test]
fn test_data_node_delta_protocol() {
    let items = sorted_items(100, 2);
    let arr = GappedArray::build(&items, items.len() + 1, None, false, 0.0).unwrap();
    let node: DataNode<u64, u64> = DataNode::new(arr, u64::min_key(), 1, 0, 1 << 20);

    // enter restructuring, writes land in the primary delta.
    node.activate_delta(8);
    assert_eq!(node.status(), Status::WriteDelta);

    match node.insert_fg(&1, 100, false, 8).unwrap() {
        Insert::Ok(_) => (),
        code => panic!("unexpected {:?}", code),
    }
    assert_eq!(node.find_payload(&1).unwrap(), Some(100));
    // pre-existing keys in the frozen main array are still duplicates.
    match node.insert_fg(&10, 1, false, 8).unwrap() {
        Insert::Duplicate(_) => (),
        code => panic!("unexpected {:?}", code),
    }

    // fill the primary, the shadow takes over.
    let mut key = 1_000;
    loop {
        let full = {
            let deltas = node.deltas.read();
            let is_full = deltas.primary.as_ref().unwrap().arr.read().is_full();
            is_full
        };
        if full {
            break;
        }
        match node.insert_fg(&key, key, false, 8).unwrap() {
            Insert::Ok(_) => (),
            code => panic!("unexpected {:?}", code),
        }
        key += 1;
    }
    match node.insert_fg(&key, key, false, 8).unwrap() {
        Insert::Ok(_) => (),
        code => panic!("unexpected {:?}", code),
    }
    assert_eq!(node.status(), Status::WriteTmpDelta);
    assert_eq!(node.find_payload(&key).unwrap(), Some(key));

    // merged snapshot covers main plus frozen primary, not the shadow.
    let merged = node.snapshot_merged(None, None);
    assert!(merged.len() > 100);
    assert!(merged.windows(2).all(|w| w[0].0 < w[1].0));
    assert!(merged.iter().any(|(k, _)| *k == 1));

    // erase is refused while restructuring.
    assert!(node.erase_fg(&10).unwrap_err().is_retry());

    // install a rebuilt array, the shadow becomes the primary and a
    // drain is still owed. Every install moves the layout generation by
    // two, back to even.
    assert_eq!(node.generation(), 0);
    let new_arr = GappedArray::build(&merged, merged.len() + 1, None, false, 0.0).unwrap();
    let leftover = node.install_rebuilt(new_arr);
    assert!(leftover);
    assert_eq!(node.generation(), 2);
    assert_eq!(node.status(), Status::WriteDelta);
    assert_eq!(node.find_payload(&1).unwrap(), Some(100));
    assert_eq!(node.find_payload(&key).unwrap(), Some(key));

    // second round, no shadow grew meanwhile, the leaf settles.
    node.freeze_primary();
    let merged = node.snapshot_merged(None, None);
    let new_arr = GappedArray::build(&merged, merged.len() + 1, None, false, 0.0).unwrap();
    let leftover = node.install_rebuilt(new_arr);
    assert!(!leftover);
    assert_eq!(node.generation(), 4);
    assert_eq!(node.status(), Status::WriteArray);
    assert_eq!(node.find_payload(&key).unwrap(), Some(key));
    assert_eq!(node.len(), merged.len());
}

#[derive(Arbitrary, Debug)]
enum Op {
    Insert(u16, u64),
    Erase(u16),
    Find(u16),
}

#[test]
fn test_gapped_array_ops_fuzz() {
    let seed: u64 = random();
    println!("test_gapped_array_ops_fuzz seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut bytes = vec![0_u8; 64 * 1024];
    rng.fill(bytes.as_mut_slice());
    let mut u = Unstructured::new(&bytes);

    let mut arr: GappedArray<u64, u64> =
        GappedArray::empty(1 << 16, crate::model::LinearModel::zero::<u64>());
    let mut reference: BTreeMap<u64, u64> = BTreeMap::new();

    while let Ok(op) = u.arbitrary::<Op>() {
        if u.is_empty() {
            break;
        }
        match op {
            Op::Insert(key, payload) => {
                let key = key as u64;
                match arr.insert_entry(&key, payload, false).unwrap() {
                    ArrInsert::Done(_) => {
                        assert_eq!(reference.insert(key, payload), None);
                    }
                    ArrInsert::Duplicate(_) => {
                        assert!(reference.contains_key(&key));
                    }
                    ArrInsert::Full => unreachable!(),
                }
            }
            Op::Erase(key) => {
                let key = key as u64;
                assert_eq!(arr.erase(&key), reference.remove(&key));
            }
            Op::Find(key) => {
                let key = key as u64;
                let got = arr.find_key(&key).map(|(_, payload)| payload);
                assert_eq!(got, reference.get(&key).copied(), "key {}", key);
            }
        }
    }

    check_invariants(&arr);
    let entries = arr.to_entries();
    let want: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries, want);
}

#[test]
fn test_merge_sorted() {
    let a = vec![(1_u64, 1_u64), (3, 3), (5, 5)];
    let b = vec![(2_u64, 2_u64), (3, 30), (6, 6)];
    let merged = merge_sorted(a, b);
    let keys: Vec<u64> = merged.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![1, 2, 3, 3, 5, 6]);
    assert_eq!(merge_sorted(Vec::<(u64, u64)>::new(), vec![]), vec![]);
}

#[test]
fn test_snapshot_merged_bounds() {
    let items = sorted_items(10, 10);
    let arr = GappedArray::build(&items, items.len() + 1, None, false, 0.0).unwrap();
    let node: DataNode<u64, u64> = DataNode::new(arr, u64::min_key(), 1, 0, 1 << 20);

    node.activate_delta(16);
    for key in [5_u64, 15, 95].iter() {
        node.insert_fg(key, *key, false, 16).unwrap();
    }

    // delta entries outside [lo, hi) are clipped, main entries stay.
    let merged = node.snapshot_merged(Some(&10), Some(&90));
    assert!(merged.iter().any(|(k, _)| *k == 15));
    assert!(!merged.iter().any(|(k, _)| *k == 5));
    assert!(!merged.iter().any(|(k, _)| *k == 95));
    assert!(merged.iter().any(|(k, _)| *k == 0));
}

use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

fn params(total_keys: usize, max_fanout: usize) -> CostParams {
    CostParams {
        insert_frac: 0.5,
        approximate_model: false,
        approximate_cost: false,
        max_data_node_keys: 1 << 16,
        min_keys_per_data_node: 16,
        max_fanout,
        node_meta_size: 512.0,
        total_keys,
    }
}

fn check_partition(partition: &Partition, num_keys: usize) {
    let nodes = &partition.nodes;
    assert!(!nodes.is_empty());
    assert_eq!(nodes[0].left, 0);
    assert_eq!(nodes[nodes.len() - 1].right, num_keys);
    for pair in nodes.windows(2) {
        assert_eq!(pair[0].right, pair[1].left, "partition not contiguous");
    }
    for node in nodes.iter() {
        assert!(node.left < node.right, "empty partition");
        assert!(node.level <= partition.depth);
    }
    // spans sum up to the fanout.
    let spans: usize = nodes
        .iter()
        .map(|node| 1_usize << (partition.depth - node.level))
        .sum();
    assert_eq!(spans, 1_usize << partition.depth);
}

#[test]
fn test_bulk_uniform_keys() {
    let seed: u64 = random();
    println!("test_bulk_uniform_keys seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut keys: Vec<u64> = (0..10_000).map(|_| rng.gen::<u64>() >> 8).collect();
    keys.sort_unstable();
    keys.dedup();
    let items: Vec<(u64, u64)> = keys.iter().map(|k| (*k, 0_u64)).collect();

    let partition = find_best_fanout_bulk(&items, &params(items.len(), 1 << 10)).unwrap();
    check_partition(&partition, items.len());
    // uniform keys are near-linear, a single level of many children
    // should win over one fat data node.
    assert!(partition.depth > 0, "depth {}", partition.depth);
    assert!(partition.parent_model.slope[0] > 0.0);
}

#[test]
fn test_bulk_tiny_input() {
    let items: Vec<(u64, u64)> = vec![(42, 1)];
    let partition = find_best_fanout_bulk(&items, &params(1, 16)).unwrap();
    assert_eq!(partition.depth, 0);
    assert_eq!(partition.nodes.len(), 1);

    let items: Vec<(u64, u64)> = vec![];
    let partition = find_best_fanout_bulk(&items, &params(0, 16)).unwrap();
    assert_eq!(partition.depth, 0);
}

#[test]
fn test_bulk_respects_min_keys() {
    let items: Vec<(u64, u64)> = (0..64).map(|i| (i, i)).collect();
    let mut p = params(64, 1 << 10);
    p.min_keys_per_data_node = 64;
    let partition = find_best_fanout_bulk(&items, &p).unwrap();
    // fanout 2 would leave 32 keys per child, below the bound.
    assert_eq!(partition.depth, 0);
}

#[test]
fn test_existing_node_prefers_expand_when_small() {
    // a read-only workload over perfectly linear keys, both depths price
    // the same search cost and the model-size term tips to depth ZERO.
    let items: Vec<(u64, u64)> = (0..32).map(|i| (i * 3, i)).collect();
    let mut p = params(32, 2);
    p.insert_frac = 0.0;
    let partition = find_best_fanout_existing(&items, &p).unwrap();
    check_partition(&partition, items.len());
    assert_eq!(partition.depth, 0);
}

#[test]
fn test_existing_node_split_is_binary() {
    let seed: u64 = random();
    println!("test_existing_node_split_is_binary seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    // two dense clusters far apart make one linear model expensive,
    // splitting pays for itself.
    let mut keys: Vec<u64> = vec![];
    for _ in 0..4_000 {
        keys.push(rng.gen::<u64>() % 10_000);
    }
    for _ in 0..4_000 {
        keys.push((u64::MAX / 2) + (rng.gen::<u64>() % 10_000));
    }
    keys.sort_unstable();
    keys.dedup();
    let items: Vec<(u64, u64)> = keys.iter().map(|k| (*k, 0_u64)).collect();

    let partition = find_best_fanout_existing(&items, &params(items.len(), 2)).unwrap();
    check_partition(&partition, items.len());
    assert!(partition.depth <= 1, "splits are binary");
    if partition.depth == 1 {
        assert_eq!(partition.nodes.len(), 2);
        // the boundary falls between the clusters.
        let boundary_key = items[partition.nodes[1].left].0;
        assert!(boundary_key > 10_000, "boundary {}", boundary_key);
    }
}

#[test]
fn test_merge_nodes_upwards_keeps_partition_sound() {
    // whatever merging decides, the collected partition must stay
    // contiguous with power-of-two aligned spans.
    let items: Vec<(u64, u64)> = (0..256).map(|i| (i, i)).collect();
    let partition = find_best_fanout_bulk(&items, &params(256, 8)).unwrap();
    check_partition(&partition, items.len());
}

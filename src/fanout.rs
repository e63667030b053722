//! Module `fanout` implement the bottom-up, cost driven, search for the
//! best power-of-two fanout and key partitioning of a node.
//!
//! Every candidate depth `d` trains a global model mapping keys to
//! `[0, 2^d)`, partitions the sorted key sequence by binary-searching each
//! child boundary, prices every partition as a data node with the
//! intra-node cost model, and adds a traversal cost that grows with the
//! fanout. Adjacent children are merged upward when doing so reduces the
//! expected cost.

use crate::{
    model::{self, LinearModel, ModelBuilder},
    node::data,
    types::FeatureKey,
    Error, Result,
};

/// One node of the fanout tree, a partition `[left, right)` of the input
/// keys, priced as a data node.
#[derive(Clone)]
pub struct FanoutNode {
    pub level: usize,
    pub node_id: usize,
    pub cost: f64,
    pub left: usize,
    pub right: usize,
    pub used: bool,
    pub expected_search_iters: f64,
    pub expected_shifts: f64,
    /// Model trained over the partition's dense positions.
    pub model: LinearModel,
    pub num_keys: usize,
}

/// Result of a fanout search: the chosen depth, its expected cost, the
/// model for the would-be parent, mapping keys to `[0, 2^depth)`, and the
/// chosen partitions in key order.
pub struct Partition {
    pub depth: usize,
    pub cost: f64,
    pub parent_model: LinearModel,
    pub nodes: Vec<FanoutNode>,
}

/// Cost-model inputs threaded through the search.
#[derive(Clone)]
pub struct CostParams {
    /// Expected, or empirically observed, fraction of inserts.
    pub insert_frac: f64,
    pub approximate_model: bool,
    pub approximate_cost: bool,
    /// Partitions larger than this are priced with an extra traversal
    /// level, they can't be data nodes as-is.
    pub max_data_node_keys: usize,
    /// Bulk loading stops deepening once partitions would hold fewer keys.
    pub min_keys_per_data_node: usize,
    pub max_fanout: usize,
    /// Metadata footprint of a data node plus one pointer, in bytes.
    pub node_meta_size: f64,
    /// Index-wide key count, weighs model size against global benefit.
    pub total_keys: usize,
}

// price one partition as a data node and append it to `level_nodes`.
fn push_node<K, P>(
    items: &[(K, P)],
    num_keys: usize,
    level: usize,
    node_id: usize,
    left: usize,
    right: usize,
    params: &CostParams,
    cost: &mut f64,
    level_nodes: &mut Vec<FanoutNode>,
) -> Result<()>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let part = &items[left..right];
    let keys: Vec<K> = part.iter().map(|(k, _)| k.clone()).collect();
    let model = model::build_model(&keys, params.approximate_model)?;

    let (mut node_cost, iters, shifts) = data::expected_cost(
        part,
        data::INIT_DENSITY,
        params.insert_frac,
        Some(&model),
        params.approximate_cost,
    )?;
    if part.len() > params.max_data_node_keys {
        // too big to be a data node, price in an extra traversal level.
        node_cost += data::NODE_LOOKUPS_WEIGHT;
    }

    *cost += node_cost * (part.len() as f64) / (num_keys as f64);
    level_nodes.push(FanoutNode {
        level,
        node_id,
        cost: node_cost,
        left,
        right,
        used: false,
        expected_search_iters: iters,
        expected_shifts: shifts,
        model,
        num_keys: part.len(),
    });
    Ok(())
}

// compute one complete level of the fanout tree, `cdf_model` maps keys to
// `[0, 2^level)`.
fn compute_level<K, P>(
    items: &[(K, P)],
    level: usize,
    cdf_model: &LinearModel,
    params: &CostParams,
) -> Result<(f64, Vec<FanoutNode>)>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let num_keys = items.len();
    let fanout = 1_usize << level;
    let mut cost = 0.0;
    let mut level_nodes = Vec::with_capacity(fanout);

    let mut right_boundary = 0_usize;
    let mut i = 0;
    while i < fanout {
        let left_boundary = right_boundary;
        right_boundary = if i == fanout - 1 {
            num_keys
        } else {
            // first key predicted past child i.
            let (mut l, mut r) = (left_boundary, num_keys);
            while l < r {
                let mid = l + (r - l) / 2;
                if cdf_model.predict(&items[mid].0) <= (i as i64) {
                    l = mid + 1;
                } else {
                    r = mid;
                }
            }
            l
        };

        if left_boundary == right_boundary {
            // empty data nodes are not allowed.
            right_boundary += 1;
        }
        if num_keys - right_boundary < fanout - i - 1 {
            // not enough keys left, give one key to each remaining child.
            right_boundary = num_keys - (fanout - i - 1);
            push_node(
                items, num_keys, level, i, left_boundary, right_boundary, params, &mut cost,
                &mut level_nodes,
            )?;
            for j in (i + 1)..fanout {
                let left_boundary = right_boundary;
                right_boundary += 1;
                push_node(
                    items, num_keys, level, j, left_boundary, right_boundary, params, &mut cost,
                    &mut level_nodes,
                )?;
            }
            break;
        }
        push_node(
            items, num_keys, level, i, left_boundary, right_boundary, params, &mut cost,
            &mut level_nodes,
        )?;
        i += 1;
    }

    cost += traversal_cost(fanout, num_keys, params);
    Ok((cost, level_nodes))
}

fn traversal_cost(fanout: usize, num_keys: usize, params: &CostParams) -> f64 {
    let total = std::cmp::max(params.total_keys, num_keys) as f64;
    data::NODE_LOOKUPS_WEIGHT
        + (data::MODEL_SIZE_WEIGHT * (fanout as f64) * params.node_meta_size * total
            / (num_keys as f64))
}

// starting from the chosen depth, merge sibling pairs upward when that
// reduces the expected cost. Merging is legal only when the pair's outer
// boundaries coincide with the parent candidate's boundaries.
fn merge_nodes_upwards(
    fanout_tree: &mut [Vec<FanoutNode>],
    start_level: usize,
    mut best_cost: f64,
    num_keys: usize,
    params: &CostParams,
) -> f64 {
    let total = std::cmp::max(params.total_keys, num_keys) as f64;
    for level in (1..=start_level).rev() {
        let level_fanout = 1_usize << level;
        let mut at_least_one_merge = false;
        for i in 0..(level_fanout / 2) {
            let (left, right) = (&fanout_tree[level][2 * i], &fanout_tree[level][2 * i + 1]);
            if !(left.used && right.used) {
                continue;
            }
            let parent = &fanout_tree[level - 1][i];
            let num_node_keys = parent.num_keys as f64;
            let saving = (left.cost * (left.num_keys as f64) / num_node_keys)
                + (right.cost * (right.num_keys as f64) / num_node_keys)
                - parent.cost
                + (data::MODEL_SIZE_WEIGHT * params.node_meta_size * total / num_node_keys);
            if saving < 0.0 {
                continue;
            }
            if left.left != parent.left || right.right != parent.right {
                // boundary mismatch, merging would change key placement.
                continue;
            }
            fanout_tree[level][2 * i].used = false;
            fanout_tree[level][2 * i + 1].used = false;
            fanout_tree[level - 1][i].used = true;
            best_cost -= saving * num_node_keys / (num_keys as f64);
            at_least_one_merge = true;
        }
        if !at_least_one_merge {
            break;
        }
    }
    best_cost
}

// collect used nodes across levels, ordered left to right.
fn collect_used_nodes(fanout_tree: &[Vec<FanoutNode>], max_level: usize) -> Vec<FanoutNode> {
    let max_level = std::cmp::min(max_level, fanout_tree.len() - 1);
    let mut used: Vec<FanoutNode> = fanout_tree
        .iter()
        .take(max_level + 1)
        .flatten()
        .filter(|node| node.used)
        .cloned()
        .collect();
    used.sort_by_key(|node| node.node_id << (max_level - node.level));
    used
}

// train the CDF model, mapping keys into [0, 1).
fn build_cdf_model<K, P>(items: &[(K, P)]) -> Result<LinearModel>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let n = items.len();
    let mut builder = ModelBuilder::new();
    for (i, (key, _)) in items.iter().enumerate() {
        builder.add(key, (i as f64) / ((n - 1) as f64));
    }
    builder.build()
}

fn single_node_partition<K, P>(items: &[(K, P)], params: &CostParams) -> Result<Partition>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let keys: Vec<K> = items.iter().map(|(k, _)| k.clone()).collect();
    let model = model::build_model(&keys, params.approximate_model)?;
    let (cost, iters, shifts) = data::expected_cost(
        items,
        data::INIT_DENSITY,
        params.insert_frac,
        Some(&model),
        params.approximate_cost,
    )?;
    Ok(Partition {
        depth: 0,
        cost,
        parent_model: LinearModel::zero::<K>(),
        nodes: vec![FanoutNode {
            level: 0,
            node_id: 0,
            cost,
            left: 0,
            right: items.len(),
            used: true,
            expected_search_iters: iters,
            expected_shifts: shifts,
            model,
            num_keys: items.len(),
        }],
    })
}

/// Choose the best fanout for bulk loading sorted `items` under a fresh
/// node. Deepens the fanout tree until cost increases twice in a row,
/// then merges children upward.
pub fn find_best_fanout_bulk<K, P>(items: &[(K, P)], params: &CostParams) -> Result<Partition>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let num_keys = items.len();
    if num_keys < 2 {
        return single_node_partition(items, params);
    }

    let base = single_node_partition(items, params)?;
    let mut best_level = 0_usize;
    let mut best_cost = base.nodes[0].cost + data::NODE_LOOKUPS_WEIGHT;
    let mut fanout_costs = vec![best_cost];
    let mut fanout_tree: Vec<Vec<FanoutNode>> = {
        let mut level0 = base.nodes;
        // the flag is decided below, once every level is priced.
        level0.iter_mut().for_each(|node| node.used = false);
        vec![level0]
    };

    let cdf = build_cdf_model(items)?;

    let mut level = 1_usize;
    loop {
        let fanout = 1_usize << level;
        if fanout > params.max_fanout
            || (num_keys / fanout) <= params.min_keys_per_data_node
        {
            break;
        }
        let mut cdf_model = cdf.clone();
        cdf_model.expand(fanout as f64);
        let (cost, level_nodes) = compute_level(items, level, &cdf_model, params)?;

        fanout_costs.push(cost);
        let n = fanout_costs.len();
        if n >= 3 && fanout_costs[n - 1] > fanout_costs[n - 2] && fanout_costs[n - 2] > fanout_costs[n - 3]
        {
            // cost increased twice in a row, deeper trees won't help.
            break;
        }
        if cost < best_cost {
            best_cost = cost;
            best_level = level;
        }
        fanout_tree.push(level_nodes);
        level += 1;
    }

    for node in fanout_tree[best_level].iter_mut() {
        node.used = true;
    }
    let best_cost = merge_nodes_upwards(&mut fanout_tree, best_level, best_cost, num_keys, params);
    let nodes = collect_used_nodes(&fanout_tree, best_level);
    if nodes.is_empty() {
        return err_at!(Fatal, msg: "empty fanout partition over {} keys", num_keys);
    }

    let mut parent_model = cdf;
    parent_model.expand((1_usize << best_level) as f64);
    Ok(Partition {
        depth: best_level,
        cost: best_cost,
        parent_model,
        nodes,
    })
}

/// Choose how to re-shape an existing, overflowing, leaf given its merged
/// key stream: depth `0` means expand in place, depth `d > 0` means split
/// into `2^d` leaves. The search is capped at `params.max_fanout`, splits
/// replace a leaf with at most two leaves, so callers pass `2`.
pub fn find_best_fanout_existing<K, P>(items: &[(K, P)], params: &CostParams) -> Result<Partition>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let num_keys = items.len();
    if num_keys < 2 {
        return single_node_partition(items, params);
    }

    let mut best_level = 0_usize;
    let mut best_cost = f64::MAX;
    let mut best_model = LinearModel::zero::<K>();
    let mut fanout_costs = vec![];
    let mut fanout_tree: Vec<Vec<FanoutNode>> = vec![];

    let cdf = build_cdf_model(items)?;
    let mut cdf_model = cdf.clone();

    let mut level = 0_usize;
    loop {
        let fanout = 1_usize << level;
        if fanout > params.max_fanout {
            break;
        }
        if level > 0 {
            cdf_model.expand(2.0);
        }
        let (cost, level_nodes) = compute_level(items, level, &cdf_model, params)?;

        fanout_costs.push(cost);
        let n = fanout_costs.len();
        if n >= 3 && fanout_costs[n - 1] > fanout_costs[n - 2] && fanout_costs[n - 2] > fanout_costs[n - 3]
        {
            break;
        }
        if cost < best_cost {
            best_cost = cost;
            best_level = level;
            best_model = cdf_model.clone();
        }
        fanout_tree.push(level_nodes);
        level += 1;
    }

    for node in fanout_tree[best_level].iter_mut() {
        node.used = true;
    }
    let best_cost = merge_nodes_upwards(&mut fanout_tree, best_level, best_cost, num_keys, params);
    let nodes = collect_used_nodes(&fanout_tree, best_level);
    if nodes.is_empty() {
        return err_at!(Fatal, msg: "empty fanout partition over {} keys", num_keys);
    }

    Ok(Partition {
        depth: best_level,
        cost: best_cost,
        parent_model: best_model,
        nodes,
    })
}

#[cfg(test)]
#[path = "fanout_test.rs"]
mod fanout_test;

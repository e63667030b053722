//! Module `restructure` implement the background maintenance engine.
//!
//! Foreground inserts that push a leaf past its thresholds enqueue a
//! [Job] while holding the leaf's insert mutex, then return. Background
//! workers drain the queue:
//!
//! * [Job::Expand] rebuilds the leaf's main array, merging in the frozen
//!   primary delta-buffer, and retrains the model when the leaf is small.
//! * [Job::Restructure] runs the fanout search over the merged key stream
//!   and either expands in place, splits the leaf sideways into two
//!   children of the same parent, or splits downwards by replacing the
//!   leaf with a fresh model node holding two leaves.
//!
//! Split children initially share the old leaf's live delta-buffer, the
//! job drains it into each child's own range right after installing them.
//! Old leaves are released only after a reclamation barrier proves no
//! reader still holds a pre-replacement reference.

use log::{debug, error};

use std::sync::{atomic::Ordering::SeqCst, Arc, MutexGuard, Weak};

use crate::{
    fanout,
    model::LinearModel,
    node::{DataNode, GappedArray, ModelNode, Node, Status},
    tree::index::Shared,
    tree::stats::Counters,
    types::FeatureKey,
    util::thread::Rx,
    Error, Result,
};

// Below this many keys a rebuilt leaf retrains its model from scratch,
// larger leaves reuse the old model rescaled to the new capacity.
const RETRAIN_THRESHOLD: usize = 50;

/// Background task, one per overflowing leaf.
pub(crate) enum Job<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    Expand { leaf: Arc<Node<K, P>> },
    Restructure { leaf: Arc<Node<K, P>> },
    /// Queue barrier, replies once every job enqueued before it is done.
    Sync,
}

/// Main loop for one background worker thread.
pub(crate) fn main_loop<K, P>(shared: Arc<Shared<K, P>>, rx: Rx<Job<K, P>, ()>) -> Result<()>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let worker_id = shared.registry.register()?;

    loop {
        // parked workers must not hold up reclamation barriers.
        shared.registry.start_waiting(worker_id);
        let msg = rx.recv();
        shared.registry.stop_waiting(worker_id);

        match msg {
            Ok((Job::Sync, resp)) => {
                if let Some(tx) = resp {
                    tx.send(()).ok();
                }
            }
            Ok((Job::Expand { leaf }, _)) => {
                let res = handle_expand(&shared, &leaf, worker_id);
                finish_job(&shared, res)?;
            }
            Ok((Job::Restructure { leaf }, _)) => {
                let res = handle_restructure(&shared, &leaf, worker_id);
                finish_job(&shared, res)?;
            }
            Err(_) => break Ok(()), // disconnected, queue fully drained
        }
    }
}

fn finish_job<K, P>(shared: &Arc<Shared<K, P>>, res: Result<()>) -> Result<()>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    shared.pending_jobs.fetch_sub(1, SeqCst);
    Counters::incr(&shared.counters.n_bg_jobs);
    if let Err(err) = res.as_ref() {
        error!(target: "remi  ", "{:?}, background job {}", shared.name, err);
    }
    res
}

fn lock_insert_mutex<'a, K, P>(leaf: &'a DataNode<K, P>) -> Result<MutexGuard<'a, ()>>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    match leaf.insert_mutex.lock() {
        Ok(guard) => Ok(guard),
        Err(err) => err_at!(ThreadFail, msg: "insert mutex {}", err),
    }
}

// dense model for a rebuilt leaf: retrain small leaves, rescale the
// current model for large ones.
fn dense_model<K, P>(leaf: &DataNode<K, P>, merged_len: usize) -> Option<LinearModel>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    if merged_len < RETRAIN_THRESHOLD {
        return None;
    }
    let arr = leaf.arr.read();
    let mut model = arr.model.clone();
    model.expand((merged_len as f64) / (arr.capacity() as f64));
    Some(model)
}

// rebuild the leaf in place until no delta-buffer is left behind. Every
// iteration freezes the primary, merges it with the main array into a
// fresh array, installs it and promotes the shadow. A leaf that settles
// above the slot budget is handed back to the queue for a split.
fn rebuild_until_drained<K, P>(
    shared: &Arc<Shared<K, P>>,
    leaf_arc: &Arc<Node<K, P>>,
    mut first_model: Option<LinearModel>,
    lo: Option<&K>,
    hi: Option<&K>,
    worker_id: usize,
) -> Result<()>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let leaf = match leaf_arc.as_data() {
        Some(leaf) => leaf,
        None => return err_at!(Fatal, msg: "drain on interior node"),
    };
    let config = &shared.config;
    loop {
        {
            let _guard = lock_insert_mutex(leaf)?;
            leaf.freeze_primary();
        }
        let items = leaf.snapshot_merged(lo, hi);

        let model = match first_model.take() {
            Some(model) => Some(model),
            None => dense_model(leaf, items.len()),
        };
        let new_arr = GappedArray::build(
            &items,
            items.len() + 1,
            model,
            config.approximate_model_computation,
            config.expected_insert_frac,
        )?;
        let grew = new_arr.capacity() > leaf.arr.read().capacity();

        let leftover = {
            let _guard = lock_insert_mutex(leaf)?;
            leaf.install_rebuilt(new_arr)
        };
        shared.registry.progress(worker_id);
        Counters::incr(&shared.counters.n_drains);
        if grew {
            Counters::incr(&shared.counters.n_expansions);
        }

        if !leftover {
            break;
        }
    }

    let _guard = lock_insert_mutex(leaf)?;
    if !leaf.is_retired() && leaf.status() == Status::WriteArray {
        let num_keys = leaf.arr.read().num_keys;
        if num_keys > shared.max_data_node_slots() {
            leaf.activate_delta(config.delta_capacity(num_keys));
            shared.post(Job::Restructure {
                leaf: Arc::clone(leaf_arc),
            })?;
        }
    }
    Ok(())
}

// expand the leaf in place, merging the delta-buffer and retraining when
// the leaf is small.
fn handle_expand<K, P>(
    shared: &Arc<Shared<K, P>>,
    leaf_arc: &Arc<Node<K, P>>,
    worker_id: usize,
) -> Result<()>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let leaf = match leaf_arc.as_data() {
        Some(leaf) => leaf,
        None => return err_at!(Fatal, msg: "expand job on interior node"),
    };
    if leaf.is_retired() {
        return Ok(());
    }

    rebuild_until_drained(shared, leaf_arc, None, None, None, worker_id)?;
    debug!(target: "remi  ", "{:?}, expanded leaf at level {}", shared.name, leaf.level);
    Ok(())
}

// choose between expand-in-place, split-sideways and split-downwards,
// then carry it out.
fn handle_restructure<K, P>(
    shared: &Arc<Shared<K, P>>,
    leaf_arc: &Arc<Node<K, P>>,
    worker_id: usize,
) -> Result<()>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let leaf = match leaf_arc.as_data() {
        Some(leaf) => leaf,
        None => return err_at!(Fatal, msg: "restructure job on interior node"),
    };
    if leaf.is_retired() {
        return Ok(());
    }

    {
        let _guard = lock_insert_mutex(leaf)?;
        leaf.freeze_primary();
    }
    let items = leaf.snapshot_merged(None, None);
    shared.registry.progress(worker_id);

    let insert_frac = leaf.arr.read().frac_inserts();
    // splits replace one leaf with at most two, cap the fanout search.
    let params = shared.cost_params(insert_frac, 2);
    let mut partition = fanout::find_best_fanout_existing(&items, &params)?;

    if (partition.depth == 0 || partition.nodes.len() < 2)
        && items.len() > shared.max_data_node_slots()
    {
        // the cost model favored expanding, but the merged stream busts
        // the slot budget, split down the middle instead.
        partition = forced_binary_partition(&items)?;
    }

    if partition.depth == 0 || partition.nodes.len() < 2 {
        // expand in place, with a force-retrained model.
        let model = Some(partition.nodes[0].model.clone());
        rebuild_until_drained(shared, leaf_arc, model, None, None, worker_id)?;
        leaf.arr.read().reset_stats();
        return Ok(());
    }

    split_leaf(shared, leaf_arc, leaf, &items, &partition, worker_id)
}

fn forced_binary_partition<K, P>(items: &[(K, P)]) -> Result<fanout::Partition>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let mid = items.len() / 2;
    let parent_model = {
        let mut builder = crate::model::ModelBuilder::new();
        builder.add(&items[0].0, 0.0);
        builder.add(&items[mid].0, 1.0);
        builder.build()?
    };

    let price = |left: usize, right: usize, node_id: usize| -> Result<fanout::FanoutNode> {
        let keys: Vec<K> = items[left..right].iter().map(|(k, _)| k.clone()).collect();
        let model = crate::model::build_model(&keys, false)?;
        Ok(fanout::FanoutNode {
            level: 1,
            node_id,
            cost: 0.0,
            left,
            right,
            used: true,
            expected_search_iters: 0.0,
            expected_shifts: 0.0,
            model,
            num_keys: right - left,
        })
    };

    Ok(fanout::Partition {
        depth: 1,
        cost: 0.0,
        parent_model,
        nodes: vec![price(0, mid, 0)?, price(mid, items.len(), 1)?],
    })
}

fn split_leaf<K, P>(
    shared: &Arc<Shared<K, P>>,
    leaf_arc: &Arc<Node<K, P>>,
    leaf: &DataNode<K, P>,
    items: &[(K, P)],
    partition: &fanout::Partition,
    worker_id: usize,
) -> Result<()>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let config = &shared.config;
    let max_slots = shared.max_data_node_slots();

    let parent_arc = match leaf_arc.to_parent() {
        Some(parent) => parent,
        None => return err_at!(Fatal, msg: "splitting leaf without parent"),
    };
    let parent = match parent_arc.as_model() {
        Some(parent) => parent,
        None => return err_at!(Fatal, msg: "leaf parent is not a model node"),
    };
    let (start, span) = match parent.locate_child(leaf_arc) {
        Some(found) => found,
        None => return err_at!(Fatal, msg: "leaf not found under its parent"),
    };

    let depth = partition.depth; // 1, splits are binary
    let fanout = 1_usize << depth;
    let dup = leaf.duplication_factor as usize;
    let downwards = (parent.num_children() * fanout) / (1_usize << dup) > config.max_fanout()
        || Arc::ptr_eq(&parent_arc, &shared.superroot)
        || depth > dup;

    let boundary = partition.nodes[1].left;
    let mid_key = items[boundary].0.clone();

    let (child_level, child_dup) = match downwards {
        true => (leaf.level + 1, 0_u8),
        false => (leaf.level, (dup - depth) as u8),
    };

    let build_child = |slice: &[(K, P)],
                       model: &LinearModel,
                       pivot: K|
     -> Result<Arc<Node<K, P>>> {
        let arr = GappedArray::build(
            slice,
            slice.len() + 1,
            Some(model.clone()),
            config.approximate_model_computation,
            config.expected_insert_frac,
        )?;
        Ok(Arc::new(Node::Data(DataNode::new(
            arr,
            pivot,
            child_level,
            child_dup,
            max_slots,
        ))))
    };

    let left_arc = build_child(
        &items[..boundary],
        &partition.nodes[0].model,
        leaf.pivot.clone(),
    )?;
    let right_arc = build_child(
        &items[boundary..],
        &partition.nodes[1].model,
        mid_key.clone(),
    )?;
    shared.registry.progress(worker_id);

    // publish under the old leaf's insert mutex: in-flight foreground
    // writers are out, late ones will see the retired flag and retry.
    let shared_delta = {
        let _guard = lock_insert_mutex(leaf)?;

        let shadow = leaf.deltas.read().shadow.clone();
        if let Some(buf) = shadow.as_ref() {
            // children adopt the live buffer, reference counted, writes
            // for either range keep landing in it until drained.
            for child in [&left_arc, &right_arc].iter() {
                let data = child.as_data().unwrap();
                data.deltas.write().primary = Some(Arc::clone(buf));
                data.set_status(Status::WriteDelta);
            }
        }

        leaf.retire();
        if downwards {
            let node = ModelNode::new(
                partition.parent_model.clone(),
                leaf.pivot.clone(),
                leaf.level,
                leaf.duplication_factor,
            );
            *node.children.write() = vec![Arc::clone(&left_arc), Arc::clone(&right_arc)];
            let node_arc = Arc::new(Node::Model(node));
            left_arc.set_parent(&node_arc);
            right_arc.set_parent(&node_arc);
            node_arc.set_parent(&parent_arc);

            let slots = vec![Arc::clone(&node_arc); span];
            parent.replace_children(start, &slots)?;
            Counters::incr(&shared.counters.n_splits_downwards);
        } else {
            left_arc.set_parent(&parent_arc);
            right_arc.set_parent(&parent_arc);

            let half = span / 2;
            let mut slots = Vec::with_capacity(span);
            (0..half).for_each(|_| slots.push(Arc::clone(&left_arc)));
            (0..half).for_each(|_| slots.push(Arc::clone(&right_arc)));
            parent.replace_children(start, &slots)?;
            Counters::incr(&shared.counters.n_splits_sideways);
        }

        link_split_leaves(leaf, &left_arc, &right_arc);
        shadow
    };

    // no reader shall still be inside the old leaf once it goes.
    shared.registry.barrier(worker_id);

    if shared_delta.is_some() {
        rebuild_until_drained(shared, &left_arc, None, None, Some(&mid_key), worker_id)?;
        rebuild_until_drained(shared, &right_arc, None, Some(&mid_key), None, worker_id)?;
    }

    debug!(
        target: "remi  ",
        "{:?}, split leaf at level {} {}", shared.name, leaf.level,
        if downwards { "downwards" } else { "sideways" }
    );
    Ok(())
}

// splice the two replacement leaves into the leaf ring. Neighbors that
// are themselves mid-split are reached through their pending markers.
fn link_split_leaves<K, P>(
    old: &DataNode<K, P>,
    left_arc: &Arc<Node<K, P>>,
    right_arc: &Arc<Node<K, P>>,
) where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let left = left_arc.as_data().unwrap();
    let right = right_arc.as_data().unwrap();

    *old.pending_left.write() = Arc::downgrade(left_arc);
    *old.pending_right.write() = Arc::downgrade(right_arc);

    *left.next_leaf.write() = Arc::downgrade(right_arc);
    *right.prev_leaf.write() = Arc::downgrade(left_arc);

    match old.prev_leaf.read().upgrade() {
        Some(prev_arc) => {
            let prev = prev_arc.as_data().unwrap();
            let target_arc = match prev.pending_right.read().upgrade() {
                Some(replacement) => replacement,
                None => Arc::clone(&prev_arc),
            };
            *target_arc.as_data().unwrap().next_leaf.write() = Arc::downgrade(left_arc);
            *left.prev_leaf.write() = Arc::downgrade(&target_arc);
        }
        None => {
            *left.prev_leaf.write() = Weak::new();
        }
    }

    match old.next_leaf.read().upgrade() {
        Some(next_arc) => {
            let next = next_arc.as_data().unwrap();
            let target_arc = match next.pending_left.read().upgrade() {
                Some(replacement) => replacement,
                None => Arc::clone(&next_arc),
            };
            *target_arc.as_data().unwrap().prev_leaf.write() = Arc::downgrade(right_arc);
            *right.next_leaf.write() = Arc::downgrade(&target_arc);
        }
        None => {
            *right.next_leaf.write() = Weak::new();
        }
    }
}

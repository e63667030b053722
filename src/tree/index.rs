//! Module `index` implement the public entry points of the learned index.

use log::{debug, info};

use std::{
    sync::atomic::{AtomicUsize, Ordering::SeqCst},
    sync::{Arc, TryLockError, Weak},
};

use crate::{
    config::Config,
    fanout::{self, CostParams},
    model::LinearModel,
    node::{DataNode, GappedArray, Insert, ModelNode, Node},
    rcu,
    tree::restructure::{self, Job},
    tree::stats::{Counters, Stats},
    types::FeatureKey,
    util::{thread, Spinlock},
    Error, Result,
};

// State shared between the facade and the background workers.
pub(crate) struct Shared<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub(crate) name: String,
    pub(crate) config: Config,
    pub(crate) superroot: Arc<Node<K, P>>,
    pub(crate) registry: rcu::Registry,
    pub(crate) counters: Counters,
    pub(crate) num_keys: AtomicUsize,
    pub(crate) pending_jobs: AtomicUsize,
    // job channels, filled once the pool is spawned, cleared at close so
    // the pool threads see the disconnect.
    pub(crate) txs: std::sync::Mutex<Vec<thread::Tx<Job<K, P>, ()>>>,
}

impl<K, P> Shared<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// Enqueue a background job. Background workers use this too, to
    /// hand an oversized leaf back after a drain.
    pub(crate) fn post(&self, job: Job<K, P>) -> Result<()> {
        let txs = match self.txs.lock() {
            Ok(txs) => txs,
            Err(err) => return err_at!(ThreadFail, msg: "job txs {}", err),
        };
        if txs.is_empty() {
            // shutting down, the final drain happens in close_wait.
            return Ok(());
        }
        self.pending_jobs.fetch_add(1, SeqCst);
        let n: usize = rand::random::<usize>() % txs.len();
        txs[n].post(job)
    }

    pub(crate) fn entry_size(&self) -> usize {
        std::mem::size_of::<K>() + std::mem::size_of::<P>()
    }

    pub(crate) fn max_data_node_slots(&self) -> usize {
        self.config.max_data_node_slots(self.entry_size())
    }

    pub(crate) fn node_meta_size(&self) -> f64 {
        (std::mem::size_of::<DataNode<K, P>>() + 8) as f64
    }

    pub(crate) fn cost_params(&self, insert_frac: f64, max_fanout: usize) -> CostParams {
        CostParams {
            insert_frac,
            approximate_model: self.config.approximate_model_computation,
            approximate_cost: self.config.approximate_cost_computation,
            max_data_node_keys: self.max_data_node_slots(),
            min_keys_per_data_node: self.config.min_keys_per_data_node,
            max_fanout,
            node_meta_size: self.node_meta_size(),
            total_keys: self.num_keys.load(SeqCst),
        }
    }
}

/// Index type, a concurrent learned index over ordered `(key,payload)`
/// entries.
///
/// * Keys implement [FeatureKey], payloads are small copy types.
/// * Point lookups and inserts are driven by caller threads that register
///   a stable worker-id via [Index::register_worker].
/// * Structural maintenance runs on a background pool owned by this type,
///   foreground operations that collide with it get [Error::RetryLater]
///   and are expected to retry, the retry resumes below the superroot.
pub struct Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    shared: Arc<Shared<K, P>>,
    // per-worker resume hint, the parent of the leaf that bounced a
    // foreground operation.
    hints: Vec<Spinlock<Option<(K, Weak<Node<K, P>>)>>>,
    domain: Spinlock<Option<(K, K)>>,

    pool: Option<thread::Pool<Job<K, P>, (), Result<()>>>,
    txs: Vec<thread::Tx<Job<K, P>, ()>>,
}

impl<K, P> Index<K, P>
where
    K: FeatureKey + 'static,
    P: 'static + Copy + Default + Send + Sync,
{
    /// Create an empty index with `config`. The background pool is spawned
    /// here and lives until [Index::close] or drop.
    pub fn new(name: &str, config: Config) -> Result<Index<K, P>> {
        let superroot = {
            let node = ModelNode::new(LinearModel::zero::<K>(), K::min_key(), 0, 0);
            Arc::new(Node::Model(node))
        };
        {
            // root starts as an empty data node, so that the first splits
            // go through the regular downward-split machinery.
            let max_slots = config.max_data_node_slots(
                std::mem::size_of::<K>() + std::mem::size_of::<P>(),
            );
            let arr = GappedArray::empty(1, LinearModel::zero::<K>());
            let root = Arc::new(Node::Data(DataNode::new(
                arr,
                K::min_key(),
                1,
                0,
                max_slots,
            )));
            root.set_parent(&superroot);
            let model = superroot.as_model().unwrap();
            model.children.write().push(root);
        }

        let shared = Arc::new(Shared {
            name: name.to_string(),
            config: config.clone(),
            superroot,
            registry: rcu::Registry::new(config.max_workers),
            counters: Counters::default(),
            num_keys: AtomicUsize::new(0),
            pending_jobs: AtomicUsize::new(0),
            txs: std::sync::Mutex::new(vec![]),
        });

        let mut pool = thread::Pool::new(&format!("{}-bg", name));
        pool.set_pool_size(config.bg_pool_size);
        {
            let shared = Arc::clone(&shared);
            pool.spawn(move |rx| {
                let shared = Arc::clone(&shared);
                move || restructure::main_loop(shared, rx)
            });
        }
        let txs = pool.to_txs();
        *shared.txs.lock().unwrap() = pool.to_txs();

        info!(target: "remi  ", "{:?}, spawned {} background threads", name, config.bg_pool_size);

        let mut hints = Vec::with_capacity(config.max_workers);
        (0..config.max_workers).for_each(|_| hints.push(Spinlock::new(None)));

        Ok(Index {
            shared,
            hints,
            domain: Spinlock::new(None),
            pool: Some(pool),
            txs,
        })
    }

    /// Close this index, shutting down the background pool after it drains
    /// pending jobs.
    pub fn close(mut self) -> Result<()> {
        self.do_close()
    }

    fn do_close(&mut self) -> Result<()> {
        self.txs.clear();
        if let Ok(mut txs) = self.shared.txs.lock() {
            txs.clear();
        }
        if let Some(pool) = self.pool.take() {
            for result in pool.close_wait()? {
                result?;
            }
        }
        Ok(())
    }
}

impl<K, P> Drop for Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    fn drop(&mut self) {
        self.txs.clear();
        if let Ok(mut txs) = self.shared.txs.lock() {
            txs.clear();
        }
        if let Some(pool) = self.pool.take() {
            pool.close_wait().ok();
        }
    }
}

impl<K, P> Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// Identify this index instance.
    #[inline]
    pub fn to_name(&self) -> String {
        self.shared.name.clone()
    }

    /// Number of entries, approximate while writers are active.
    #[inline]
    pub fn len(&self) -> usize {
        self.shared.num_keys.load(SeqCst)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the calling thread, the returned worker-id shall be passed
    /// to [Index::get] and [Index::insert].
    pub fn register_worker(&self) -> Result<usize> {
        self.shared.registry.register()
    }

    /// Smallest key present.
    pub fn first_key(&self) -> Option<K> {
        let mut leaf = self.leftmost_leaf();
        loop {
            let data = leaf.as_data().unwrap();
            if let Some(key) = data.arr.read().first_key() {
                return Some(key);
            }
            let next = data.next_leaf.read().upgrade()?;
            leaf = next;
        }
    }

    /// Largest key present.
    pub fn last_key(&self) -> Option<K> {
        let mut leaf = self.rightmost_leaf();
        loop {
            let data = leaf.as_data().unwrap();
            if let Some(key) = data.arr.read().last_key() {
                return Some(key);
            }
            let prev = data.prev_leaf.read().upgrade()?;
            leaf = prev;
        }
    }
}

// descend machinery
impl<K, P> Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    // lock-free descent from `start`, or the superroot, to the leaf owning
    // `key`. Returns the leaf and the traversal path of (model-node,
    // child-slot) pairs.
    fn descend(
        &self,
        key: &K,
        worker_id: Option<usize>,
        start: Option<Arc<Node<K, P>>>,
    ) -> Result<(Arc<Node<K, P>>, Vec<(Arc<Node<K, P>>, usize)>)> {
        let mut cur = start.unwrap_or_else(|| Arc::clone(&self.shared.superroot));
        let mut path = vec![];

        loop {
            if cur.is_leaf() {
                return Ok((cur, path));
            }
            let (child, bucket) = cur.as_model().unwrap().find_child(key)?;
            path.push((Arc::clone(&cur), bucket));
            if let Some(worker_id) = worker_id {
                // quiescent point between model-node hops.
                self.shared.registry.progress(worker_id);
            }
            cur = child;
        }
    }

    fn leftmost_leaf(&self) -> Arc<Node<K, P>> {
        let mut cur = Arc::clone(&self.shared.superroot);
        loop {
            if cur.is_leaf() {
                return cur;
            }
            let child = {
                let children = cur.as_model().unwrap().children.read();
                Arc::clone(&children[0])
            };
            cur = child;
        }
    }

    fn rightmost_leaf(&self) -> Arc<Node<K, P>> {
        let mut cur = Arc::clone(&self.shared.superroot);
        loop {
            if cur.is_leaf() {
                return cur;
            }
            let child = {
                let children = cur.as_model().unwrap().children.read();
                Arc::clone(&children[children.len() - 1])
            };
            cur = child;
        }
    }

    // stash the parent of a bouncing leaf, the worker's next attempt for
    // the same key resumes there instead of the superroot.
    fn stash_hint(
        &self,
        worker_id: Option<usize>,
        key: &K,
        path: &[(Arc<Node<K, P>>, usize)],
    ) {
        if let Some(worker_id) = worker_id {
            if let Some((parent, _)) = path.last() {
                *self.hints[worker_id].write() = Some((key.clone(), Arc::downgrade(parent)));
            }
        }
        Counters::incr(&self.shared.counters.n_retries);
    }

    fn take_hint(&self, worker_id: Option<usize>, key: &K) -> Option<Arc<Node<K, P>>> {
        let worker_id = worker_id?;
        let hint = self.hints[worker_id].write().take()?;
        match hint {
            (hint_key, node) if hint_key.eq(key) => node.upgrade(),
            _ => None,
        }
    }
}

// write operations
impl<K, P> Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// Insert `(key, payload)`. On success returns an iterator positioned
    /// at the entry and whether a fresh entry was made.
    ///
    /// Errors: [Error::DuplicateKey] when duplicates are disallowed,
    /// [Error::RetryLater] when a concurrent restructure holds the leaf,
    /// [Error::DomainViolation] for fixed-domain keys outside the domain.
    pub fn insert(&self, key: K, payload: P, worker_id: usize) -> Result<(Iter<K, P>, bool)> {
        self.track_domain(&key)?;
        self.shared.registry.stop_waiting(worker_id);
        let result = self.do_insert(key, payload, worker_id);
        // quiescent till the next operation.
        self.shared.registry.start_waiting(worker_id);
        result
    }

    fn do_insert(&self, key: K, payload: P, worker_id: usize) -> Result<(Iter<K, P>, bool)> {
        let start = self.take_hint(Some(worker_id), &key);
        let (leaf_arc, path) = self.descend(&key, Some(worker_id), start)?;
        let leaf = match leaf_arc.as_data() {
            Some(leaf) => leaf,
            None => return err_at!(Fatal, msg: "descend landed on interior node"),
        };

        let guard = match leaf.insert_mutex.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                self.stash_hint(Some(worker_id), &key, &path);
                return err_at!(RetryLater, msg: "leaf insert mutex held");
            }
            Err(TryLockError::Poisoned(err)) => {
                return err_at!(ThreadFail, msg: "insert mutex {}", err)
            }
        };
        if leaf.is_retired() {
            // raced with a background replacement, this leaf is dead.
            std::mem::drop(guard);
            self.stash_hint(Some(worker_id), &key, &path);
            return err_at!(RetryLater, msg: "leaf retired");
        }

        let delta_capacity = {
            let num_keys = leaf.arr.read().num_keys;
            self.shared.config.delta_capacity(num_keys)
        };
        let allow_duplicates = self.shared.config.allow_duplicates;
        // installs for this leaf serialize behind the held insert mutex,
        // the generation is stable here.
        let generation = leaf.generation();
        match leaf.insert_fg(&key, payload, allow_duplicates, delta_capacity)? {
            Insert::Ok(pos) => {
                self.shared.num_keys.fetch_add(1, SeqCst);
                Ok((self.iter_at(Arc::clone(&leaf_arc), pos, generation), true))
            }
            Insert::Duplicate(_) => err_at!(DuplicateKey, msg: "{:?}", key),
            Insert::NeedsExpand(pos) => {
                self.shared.num_keys.fetch_add(1, SeqCst);
                leaf.activate_delta(delta_capacity);
                self.enqueue(Job::Expand {
                    leaf: Arc::clone(&leaf_arc),
                })?;
                debug!(target: "remi  ", "{:?}, expand enqueued", self.shared.name);
                Ok((self.iter_at(Arc::clone(&leaf_arc), pos, generation), true))
            }
            Insert::NeedsRestructure(pos) => {
                self.shared.num_keys.fetch_add(1, SeqCst);
                leaf.activate_delta(delta_capacity);
                self.enqueue(Job::Restructure {
                    leaf: Arc::clone(&leaf_arc),
                })?;
                debug!(target: "remi  ", "{:?}, restructure enqueued", self.shared.name);
                Ok((self.iter_at(Arc::clone(&leaf_arc), pos, generation), true))
            }
            Insert::DeltaFull => {
                self.stash_hint(Some(worker_id), &key, &path);
                err_at!(RetryLater, msg: "delta buffers full")
            }
        }
    }

    /// Remove the entry matching `key`, returns the number of removed
    /// entries, `0` or `1`.
    pub fn erase(&self, key: &K) -> Result<usize> {
        let (leaf_arc, _path) = self.descend(key, None, None)?;
        let leaf = match leaf_arc.as_data() {
            Some(leaf) => leaf,
            None => return err_at!(Fatal, msg: "descend landed on interior node"),
        };

        let guard = match leaf.insert_mutex.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                Counters::incr(&self.shared.counters.n_retries);
                return err_at!(RetryLater, msg: "leaf insert mutex held");
            }
            Err(TryLockError::Poisoned(err)) => {
                return err_at!(ThreadFail, msg: "insert mutex {}", err)
            }
        };
        if leaf.is_retired() {
            std::mem::drop(guard);
            Counters::incr(&self.shared.counters.n_retries);
            return err_at!(RetryLater, msg: "leaf retired");
        }

        match leaf.erase_fg(key)? {
            Some(_) => {
                self.shared.num_keys.fetch_sub(1, SeqCst);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn enqueue(&self, job: Job<K, P>) -> Result<()> {
        self.shared.post(job)
    }

    // track the key-domain. Expandable key types widen it as keys land
    // outside. Fixed-domain key types enforce the domain established at
    // bulk load, an index built empty stays unbounded.
    fn track_domain(&self, key: &K) -> Result<()> {
        let mut domain = self.domain.write();
        match domain.as_mut() {
            None if K::EXPANDABLE => {
                *domain = Some((key.clone(), key.clone()));
                Ok(())
            }
            None => Ok(()),
            Some((min, max)) => {
                if key.ge(min) && key.le(max) {
                    Ok(())
                } else if K::EXPANDABLE {
                    if key.lt(min) {
                        *min = key.clone();
                    }
                    if key.gt(max) {
                        *max = key.clone();
                    }
                    Counters::incr(&self.shared.counters.n_domain_expansions);
                    Ok(())
                } else {
                    err_at!(DomainViolation, msg: "key {:?} outside fixed domain", key)
                }
            }
        }
    }
}

// read operations
impl<K, P> Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// Point lookup.
    ///
    /// Errors: [Error::KeyNotFound], and [Error::RetryLater] when a
    /// concurrent restructure holds the leaf.
    pub fn get(&self, key: &K, worker_id: usize) -> Result<P> {
        self.shared.registry.stop_waiting(worker_id);
        let result = self.do_get(key, worker_id);
        // quiescent till the next operation.
        self.shared.registry.start_waiting(worker_id);
        result
    }

    fn do_get(&self, key: &K, worker_id: usize) -> Result<P> {
        let start = self.take_hint(Some(worker_id), key);
        let (leaf_arc, path) = self.descend(key, Some(worker_id), start)?;
        let leaf = match leaf_arc.as_data() {
            Some(leaf) => leaf,
            None => return err_at!(Fatal, msg: "descend landed on interior node"),
        };

        match leaf.find_payload(key) {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) if leaf.is_retired() => {
                // the leaf got replaced under this descent, its arrays can
                // miss writes that went to the replacement.
                self.stash_hint(Some(worker_id), key, &path);
                err_at!(RetryLater, msg: "leaf retired")
            }
            Ok(None) => err_at!(KeyNotFound, msg: "{:?}", key),
            Err(err) if err.is_retry() => {
                self.stash_hint(Some(worker_id), key, &path);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Iterator positioned at the first entry with key not less than
    /// `key`, possibly end.
    pub fn lower_bound(&self, key: &K) -> Result<Iter<K, P>> {
        let (leaf_arc, _) = self.descend(key, None, None)?;
        let (pos, generation) = {
            let leaf = leaf_arc.as_data().unwrap();
            stable_position(leaf, |arr| arr.find_lower(key))
        };
        let mut iter = self.iter_at(leaf_arc, pos, generation);
        iter.from = Some((key.clone(), true));
        Ok(iter)
    }

    /// Iterator positioned at the first entry with key greater than `key`,
    /// possibly end.
    pub fn upper_bound(&self, key: &K) -> Result<Iter<K, P>> {
        let (leaf_arc, _) = self.descend(key, None, None)?;
        let (pos, generation) = {
            let leaf = leaf_arc.as_data().unwrap();
            stable_position(leaf, |arr| arr.find_upper(key))
        };
        let mut iter = self.iter_at(leaf_arc, pos, generation);
        iter.from = Some((key.clone(), false));
        Ok(iter)
    }

    /// Ordered scan from `from_key`, append up to `max_count` entries into
    /// `out`. Returns the number of entries appended.
    pub fn scan(&self, from_key: &K, max_count: usize, out: &mut Vec<(K, P)>) -> Result<usize> {
        let mut iter = self.lower_bound(from_key)?;
        let mut count = 0;
        while count < max_count {
            match iter.next() {
                Some(entry) => {
                    out.push(entry);
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn iter_at(&self, leaf: Arc<Node<K, P>>, pos: usize, generation: u64) -> Iter<K, P> {
        Iter {
            index: self,
            leaf: Some(leaf),
            pos,
            generation,
            last: None,
            from: None,
        }
    }
}

// slot position computed against a stable array layout, along with the
// generation it was computed on. Retries while an install is mid-swap.
fn stable_position<K, P, F>(leaf: &DataNode<K, P>, f: F) -> (usize, u64)
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
    F: Fn(&GappedArray<K, P>) -> usize,
{
    loop {
        let generation = leaf.generation();
        if (generation & 1) == 0 {
            let pos = f(&leaf.arr.read());
            if leaf.generation() == generation {
                break (pos, generation);
            }
        }
        std::thread::yield_now();
    }
}

// bulk loading
impl<K, P> Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// Populate an empty index from a sorted `(key, payload)` sequence.
    /// Rejects a non-empty index, an empty sequence and an unsorted
    /// sequence.
    pub fn bulk_load(&self, items: &[(K, P)]) -> Result<()> {
        if !self.is_empty() {
            return err_at!(InvalidInput, msg: "bulk load into non-empty index");
        } else if items.is_empty() {
            return err_at!(InvalidInput, msg: "bulk load from empty sequence");
        }
        for pair in items.windows(2) {
            let sorted = match self.shared.config.allow_duplicates {
                true => pair[0].0.le(&pair[1].0),
                false => pair[0].0.lt(&pair[1].0),
            };
            if !sorted {
                return err_at!(InvalidInput, msg: "bulk load sequence not sorted");
            }
        }

        *self.domain.write() = Some((items[0].0.clone(), items[items.len() - 1].0.clone()));

        let root = self.build_subtree(items, K::min_key(), 1, 0)?;
        root.set_parent(&self.shared.superroot);
        {
            let model = self.shared.superroot.as_model().unwrap();
            let mut children = model.children.write();
            children.clear();
            children.push(Arc::clone(&root));
        }
        self.link_all_leaves();
        self.shared.num_keys.store(items.len(), SeqCst);

        info!(
            target: "remi  ",
            "{:?}, bulk loaded {} entries", self.shared.name, items.len()
        );
        Ok(())
    }

    // cost-driven recursive construction, partitions too large for one
    // data node become nested model nodes.
    fn build_subtree(
        &self,
        items: &[(K, P)],
        pivot: K,
        level: usize,
        duplication_factor: u8,
    ) -> Result<Arc<Node<K, P>>> {
        let config = &self.shared.config;
        let max_slots = self.shared.max_data_node_slots();
        let params = self
            .shared
            .cost_params(config.expected_insert_frac, config.max_fanout());

        let partition = fanout::find_best_fanout_bulk(items, &params)?;
        if partition.depth == 0 && items.len() <= max_slots {
            let node = &partition.nodes[0];
            let arr = GappedArray::build(
                items,
                items.len() + 1,
                Some(node.model.clone()),
                config.approximate_model_computation,
                config.expected_insert_frac,
            )?;
            let leaf = DataNode::new(arr, pivot, level, duplication_factor, max_slots);
            return Ok(Arc::new(Node::Data(leaf)));
        }
        if partition.depth == 0 {
            // one partition, but too big for a data node, halve it.
            let mid = items.len() / 2;
            return self.build_two_way(items, mid, pivot, level, duplication_factor);
        }

        let node = ModelNode::new(partition.parent_model.clone(), pivot.clone(), level, duplication_factor);
        let node_arc = Arc::new(Node::Model(node));

        let children: Vec<(Arc<Node<K, P>>, usize)> = {
            use rayon::prelude::*;

            let jobs: Vec<(usize, &fanout::FanoutNode)> =
                partition.nodes.iter().enumerate().collect();
            let built: Result<Vec<(Arc<Node<K, P>>, usize)>> = jobs
                .into_par_iter()
                .map(|(i, fnode)| {
                    let span = 1_usize << (partition.depth - fnode.level);
                    let dup = (partition.depth - fnode.level) as u8;
                    let child_pivot = match i {
                        0 => pivot.clone(),
                        _ => items[fnode.left].0.clone(),
                    };
                    let slice = &items[fnode.left..fnode.right];
                    let child = if slice.len() > max_slots {
                        self.build_subtree(slice, child_pivot, level + 1, dup)?
                    } else {
                        let arr = GappedArray::build(
                            slice,
                            slice.len() + 1,
                            Some(fnode.model.clone()),
                            config.approximate_model_computation,
                            config.expected_insert_frac,
                        )?;
                        Arc::new(Node::Data(DataNode::new(
                            arr,
                            child_pivot,
                            level + 1,
                            dup,
                            max_slots,
                        )))
                    };
                    Ok((child, span))
                })
                .collect();
            built?
        };

        {
            let model = node_arc.as_model().unwrap();
            let mut slots = model.children.write();
            for (child, span) in children.iter() {
                child.set_parent(&node_arc);
                for _ in 0..*span {
                    slots.push(Arc::clone(child));
                }
            }
            debug_assert!(slots.len() == (1_usize << partition.depth));
        }
        Ok(node_arc)
    }

    // fallback shape: an interior node with two equal halves.
    fn build_two_way(
        &self,
        items: &[(K, P)],
        mid: usize,
        pivot: K,
        level: usize,
        duplication_factor: u8,
    ) -> Result<Arc<Node<K, P>>> {
        let mut builder = crate::model::ModelBuilder::new();
        builder.add(&items[0].0, 0.0);
        builder.add(&items[mid].0, 1.0);
        let model = builder.build()?;

        let node = ModelNode::new(model, pivot.clone(), level, duplication_factor);
        let node_arc = Arc::new(Node::Model(node));

        let left = self.build_subtree(&items[..mid], pivot, level + 1, 0)?;
        let right = self.build_subtree(&items[mid..], items[mid].0.clone(), level + 1, 0)?;
        {
            let model = node_arc.as_model().unwrap();
            let mut slots = model.children.write();
            left.set_parent(&node_arc);
            right.set_parent(&node_arc);
            slots.push(left);
            slots.push(right);
        }
        Ok(node_arc)
    }

    // stitch the leaf ring, in-order.
    fn link_all_leaves(&self) {
        let leaves = self.collect_leaves();
        for pair in leaves.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            *prev.as_data().unwrap().next_leaf.write() = Arc::downgrade(next);
            *next.as_data().unwrap().prev_leaf.write() = Arc::downgrade(prev);
        }
    }

    fn collect_leaves(&self) -> Vec<Arc<Node<K, P>>> {
        let mut leaves = vec![];
        collect_leaves_from(&self.shared.superroot, &mut leaves);
        leaves
    }
}

// pre-order walk, leaves in key order.
fn collect_leaves_from<K, P>(node: &Arc<Node<K, P>>, leaves: &mut Vec<Arc<Node<K, P>>>)
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    match node.as_ref() {
        Node::Data(_) => leaves.push(Arc::clone(node)),
        Node::Model(model) => {
            let children = model.children_snapshot();
            let mut slot = 0;
            while slot < children.len() {
                let child = &children[slot];
                let span = 1_usize << child.duplication_factor();
                collect_leaves_from(child, leaves);
                slot += span;
            }
        }
    }
}

// maintenance and introspection
impl<K, P> Index<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// Block till the background queue is drained and no job is running.
    /// Mostly used by tests and by batch phases between workloads.
    pub fn sync(&self) -> Result<()> {
        loop {
            for tx in self.txs.iter() {
                tx.request(Job::Sync)?;
            }
            if self.shared.pending_jobs.load(SeqCst) == 0 {
                break Ok(());
            }
            std::thread::yield_now();
        }
    }

    /// Gather statistics from the tree and the maintenance counters.
    pub fn to_stats(&self) -> Result<Stats> {
        let mut stats = Stats::new(&self.shared.name);
        stats.n_count = self.len();
        stats.fill_counters(&self.shared.counters);

        let mut depth = 0;
        let mut stack = vec![(Arc::clone(&self.shared.superroot), 0_usize)];
        while let Some((node, level)) = stack.pop() {
            depth = std::cmp::max(depth, level);
            match node.as_ref() {
                Node::Data(_) => stats.n_data_nodes += 1,
                Node::Model(model) => {
                    stats.n_model_nodes += 1;
                    let children = model.children_snapshot();
                    let mut slot = 0;
                    while slot < children.len() {
                        let child = &children[slot];
                        let span = 1_usize << child.duplication_factor();
                        stack.push((Arc::clone(child), level + 1));
                        slot += span;
                    }
                }
            }
        }
        stats.depth = depth;
        Ok(stats)
    }

    /// Validate every structural invariant of the tree:
    ///
    /// * bitmap population matches `num_keys` in every gapped array,
    /// * gap slots carry the next present key to the right, or the end
    ///   sentinel,
    /// * the in-order key sequence is non-decreasing,
    /// * children of every model node form power-of-two aligned ranges,
    /// * child pivots are non-decreasing and within the parent range,
    /// * the leaf ring agrees with the in-order leaf sequence.
    pub fn validate(&self) -> Result<()> {
        self.validate_node(&self.shared.superroot)?;

        let leaves = self.collect_leaves();
        let mut last_key: Option<K> = None;
        for leaf in leaves.iter() {
            let data = leaf.as_data().unwrap();
            let arr = data.arr.read();
            for (_, key, _) in arr.iter_present(0) {
                if let Some(last) = last_key.as_ref() {
                    if key.lt(last) {
                        return err_at!(Fatal, msg: "in-order keys decrease at {:?}", key);
                    }
                }
                last_key = Some(key.clone());
            }
        }

        for pair in leaves.windows(2) {
            let next = pair[0].as_data().unwrap().next_leaf.read().upgrade();
            match next {
                Some(next) if Arc::ptr_eq(&next, &pair[1]) => (),
                _ => return err_at!(Fatal, msg: "leaf ring does not match in-order leaves"),
            }
            let prev = pair[1].as_data().unwrap().prev_leaf.read().upgrade();
            match prev {
                Some(prev) if Arc::ptr_eq(&prev, &pair[0]) => (),
                _ => return err_at!(Fatal, msg: "leaf ring does not match in-order leaves"),
            }
        }
        Ok(())
    }

    fn validate_node(&self, node: &Arc<Node<K, P>>) -> Result<()> {
        match node.as_ref() {
            Node::Data(data) => {
                let arr = data.arr.read();
                let capacity = arr.capacity();
                let bits = arr.num_keys_in_range(0, capacity);
                if bits != arr.num_keys {
                    return err_at!(
                        Fatal,
                        msg: "bitmap bits {} vs num_keys {}", bits, arr.num_keys
                    );
                }
                if arr.expansion_threshold > capacity {
                    return err_at!(Fatal, msg: "expansion threshold beyond capacity");
                }
                // gap slots carry the next present key to the right.
                let mut sentinel = K::max_key();
                for pos in (0..capacity).rev() {
                    if arr.check_exists(pos) {
                        sentinel = arr.keys[pos].clone();
                    } else if !arr.keys[pos].eq(&sentinel) {
                        return err_at!(Fatal, msg: "gap sentinel wrong at slot {}", pos);
                    }
                }
                Ok(())
            }
            Node::Model(model) => {
                model.validate_children()?;
                let children = model.children_snapshot();
                let mut last_pivot: Option<K> = None;
                let mut slot = 0;
                while slot < children.len() {
                    let child = &children[slot];
                    let pivot = child.to_pivot();
                    if pivot.lt(&model.pivot) {
                        return err_at!(Fatal, msg: "child pivot below parent pivot");
                    }
                    if let Some(last) = last_pivot.as_ref() {
                        if pivot.lt(last) {
                            return err_at!(Fatal, msg: "child pivots decrease");
                        }
                    }
                    last_pivot = Some(pivot);
                    self.validate_node(child)?;
                    slot += 1_usize << child.duplication_factor();
                }
                Ok(())
            }
        }
    }
}

/// Iterator over index entries, in key order.
///
/// The iterator holds a leaf reference, an in-leaf slot and the array
/// layout generation the slot was computed on. Advancing decodes the
/// presence bitmap, and hops leaves through the atomic leaf ring. A leaf
/// retired by a concurrent split, or rebuilt in place by a concurrent
/// drain (which moves the generation), makes the iterator re-seek past
/// the last yielded key, so entries are neither duplicated nor skipped.
/// Iterators are not valid across a retry-later boundary.
pub struct Iter<'a, K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    index: &'a Index<K, P>,
    leaf: Option<Arc<Node<K, P>>>,
    pos: usize,
    generation: u64,
    last: Option<K>,
    // the bound this iterator was created from, `true` for inclusive,
    // re-seeks fall back to it before any entry was yielded.
    from: Option<(K, bool)>,
}

impl<'a, K, P> Iterator for Iter<'a, K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    type Item = (K, P);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf_arc = self.leaf.as_ref()?.clone();
            let leaf = leaf_arc.as_data().unwrap();

            // the slot is only meaningful against the layout it was
            // computed on. An odd generation is an install mid-swap, a
            // moved generation is a completed in-place rebuild.
            let generation = leaf.generation();
            if leaf.is_retired() || (generation & 1) == 1 || generation != self.generation {
                self.reseek();
                continue;
            }

            let entry = {
                let arr = leaf.arr.read();
                let pos = arr.next_filled_position(self.pos, false);
                if pos < arr.capacity() {
                    Some((pos, arr.keys[pos].clone(), arr.payloads[pos]))
                } else {
                    None
                }
            };
            // an install or a split could have swapped the array between
            // the generation check and the latched read.
            if leaf.is_retired() || leaf.generation() != generation {
                self.reseek();
                continue;
            }
            match entry {
                Some((pos, key, payload)) => {
                    self.pos = pos + 1;
                    self.last = Some(key.clone());
                    return Some((key, payload));
                }
                None => match leaf.next_leaf.read().upgrade() {
                    Some(next) => {
                        self.generation = next.as_data().unwrap().generation();
                        self.leaf = Some(next);
                        self.pos = 0;
                    }
                    None => {
                        self.leaf = None;
                        return None;
                    }
                },
            }
        }
    }
}

impl<'a, K, P> Iter<'a, K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    // current leaf got replaced, or rebuilt in place, resume right after
    // the last yielded key, or at the iterator's origin bound when
    // nothing was yielded yet.
    fn reseek(&mut self) {
        let target = match (self.last.as_ref(), self.from.as_ref()) {
            (Some(key), _) => self.index.upper_bound(key),
            (None, Some((key, true))) => self.index.lower_bound(key),
            (None, Some((key, false))) => self.index.upper_bound(key),
            (None, None) => {
                let leftmost = self.index.leftmost_leaf();
                // slot ZERO is valid against any layout.
                self.generation = leftmost.as_data().unwrap().generation();
                self.leaf = Some(leftmost);
                self.pos = 0;
                return;
            }
        };
        match target {
            Ok(iter) => {
                self.leaf = iter.leaf;
                self.pos = iter.pos;
                self.generation = iter.generation;
            }
            Err(_) => self.leaf = None,
        }
    }
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;

//! Module `data` implement the leaf node of the learned index.
//!
//! Entries live in a _gapped array_: a sparse `(key,payload)` slot array
//! with a presence bitmap and a trained model that predicts a key's slot.
//! Gap slots hold a copy of the next present key to the right, trailing
//! gaps hold the max-key sentinel, so the slot array stays sorted and
//! exponential search terminates inside a run.
//!
//! A leaf also carries up to two delta-buffers that absorb inserts while a
//! background job restructures the main array, refer to [Status] for the
//! hand-off protocol.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering::SeqCst},
    sync::{Arc, Mutex, Weak},
};

use crate::{
    model::{self, LinearModel},
    node::Node,
    types::FeatureKey,
    util::{self, Spinlock},
    Error, Result,
};

// Intra-node cost model weights.
pub(crate) const EXP_SEARCH_ITERATIONS_WEIGHT: f64 = 20.0;
pub(crate) const SHIFTS_WEIGHT: f64 = 0.5;
pub(crate) const NODE_LOOKUPS_WEIGHT: f64 = 20.0;
pub(crate) const MODEL_SIZE_WEIGHT: f64 = 5e-7;

// Density after bulk loading, expanding and contracting. The concurrent
// design keeps all three at 1.0, growth is driven by merging delta-buffers
// rather than by slack inside the main array.
pub(crate) const INIT_DENSITY: f64 = 1.0;
pub(crate) const MAX_DENSITY: f64 = 1.0;

// Shifts-per-insert beyond which a node's cost is catastrophic.
const CATASTROPHE_SHIFTS: f64 = 100.0;
// Empirical cost beyond this multiple of expected cost deviates
// significantly.
const DEVIATION_FACTOR: f64 = 1.5;

// Sampling schedule for approximate cost computation.
const COST_SAMPLE_LOWER_BOUND: usize = 512;
const COST_REL_CHANGE_THRESHOLD: f64 = 0.1;

/// Write status of a leaf, where do foreground inserts land.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub enum Status {
    /// No pending background job, inserts go to the main array.
    WriteArray = 0,
    /// A background job is pending, inserts go to the primary
    /// delta-buffer.
    WriteDelta = 1,
    /// The primary delta-buffer is frozen, either it filled up or the
    /// background job snapshotted it, inserts go to the shadow buffer.
    WriteTmpDelta = 2,
}

impl From<u8> for Status {
    fn from(val: u8) -> Status {
        match val {
            0 => Status::WriteArray,
            1 => Status::WriteDelta,
            2 => Status::WriteTmpDelta,
            _ => unreachable!(),
        }
    }
}

/// Return code of a foreground insert into a leaf.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Insert {
    /// Inserted cleanly at slot.
    Ok(usize),
    /// Key already present at slot, duplicates are disallowed.
    Duplicate(usize),
    /// Inserted, and the node crossed its expansion threshold, caller
    /// shall enqueue an expand job.
    NeedsExpand(usize),
    /// Inserted, and the node is full or its cost went bad, caller shall
    /// enqueue a restructure job.
    NeedsRestructure(usize),
    /// Not inserted, every delta-buffer is full, caller shall surface
    /// retry-later.
    DeltaFull,
}

// Return code of an insert into one gapped array.
pub(crate) enum ArrInsert {
    Done(usize),
    Duplicate(usize),
    Full,
}

/// Sparse model-addressed slot array, refer to the [module][self]
/// documentation.
pub struct GappedArray<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub(crate) keys: Vec<K>,
    pub(crate) payloads: Vec<P>,
    pub(crate) bitmap: Vec<u64>,
    pub(crate) model: LinearModel,
    pub(crate) num_keys: usize,
    pub(crate) expansion_threshold: usize,

    // expectations, computed when the array is (re)built.
    pub(crate) cost: f64,
    pub(crate) expected_avg_search_iters: f64,
    pub(crate) expected_avg_shifts: f64,

    // empirical counters, survive resizes via carry-over.
    num_shifts: AtomicU64,
    num_exp_search_iterations: AtomicU64,
    num_lookups: AtomicU64,
    num_inserts: AtomicU64,
}

impl<K, P> GappedArray<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// An empty array of `capacity` slots, predictions served by `model`.
    pub fn empty(capacity: usize, model: LinearModel) -> GappedArray<K, P> {
        let capacity = std::cmp::max(capacity, 1);
        GappedArray {
            keys: vec![K::max_key(); capacity],
            payloads: vec![P::default(); capacity],
            bitmap: util::new_bitmap(capacity),
            model,
            num_keys: 0,
            expansion_threshold: capacity,

            cost: 0.0,
            expected_avg_search_iters: 0.0,
            expected_avg_shifts: 0.0,

            num_shifts: AtomicU64::new(0),
            num_exp_search_iterations: AtomicU64::new(0),
            num_lookups: AtomicU64::new(0),
            num_inserts: AtomicU64::new(0),
        }
    }

    /// Build an array over sorted `items`, placing each entry at, or right
    /// of, its predicted slot. `model`, when given, is a model trained
    /// over the dense positions `0..items.len()`, else one is trained
    /// here. `capacity` is clamped to leave at least one gap.
    pub fn build(
        items: &[(K, P)],
        capacity: usize,
        model: Option<LinearModel>,
        approximate: bool,
        insert_frac: f64,
    ) -> Result<GappedArray<K, P>> {
        let n = items.len();
        let capacity = std::cmp::max(capacity, n + 1);

        let mut model = match model {
            Some(model) => model,
            None => {
                let keys: Vec<K> = items.iter().map(|(k, _)| k.clone()).collect();
                model::build_model(&keys, approximate)?
            }
        };
        if n > 0 {
            model.expand((capacity as f64) / (n as f64));
        }

        let mut arr = GappedArray::empty(capacity, model);
        let mut acc = ExpectedStats::default();
        let mut last_pos: Option<usize> = None;
        for (i, (key, payload)) in items.iter().enumerate() {
            let predicted = arr.predict_position(key);
            let lo = last_pos.map_or(0, |p| p + 1);
            let hi = capacity - (n - i); // room for the remaining entries
            let pos = std::cmp::min(std::cmp::max(predicted, lo), hi);

            arr.keys[pos] = key.clone();
            arr.payloads[pos] = *payload;
            util::set_bit(&mut arr.bitmap, pos);
            acc.accumulate(pos, predicted);
            last_pos = Some(pos);
        }
        arr.num_keys = n;
        arr.fill_gap_sentinels();

        arr.expected_avg_search_iters = acc.mean_search_iters();
        arr.expected_avg_shifts = acc.mean_shifts();
        arr.cost = (EXP_SEARCH_ITERATIONS_WEIGHT * arr.expected_avg_search_iters)
            + (SHIFTS_WEIGHT * arr.expected_avg_shifts * insert_frac);
        arr.expansion_threshold = expansion_threshold(capacity, n);

        Ok(arr)
    }

    // Overwrite every gap slot with the next present key to the right,
    // trailing gaps get the max-key sentinel.
    fn fill_gap_sentinels(&mut self) {
        let mut sentinel = K::max_key();
        for pos in (0..self.capacity()).rev() {
            if util::check_bit(&self.bitmap, pos) {
                sentinel = self.keys[pos].clone();
            } else {
                self.keys[pos] = sentinel.clone();
            }
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_keys >= self.capacity()
    }

    #[inline]
    pub fn check_exists(&self, pos: usize) -> bool {
        util::check_bit(&self.bitmap, pos)
    }

    /// Model predicted slot for key, clamped into `[0, capacity)`.
    #[inline]
    pub fn predict_position(&self, key: &K) -> usize {
        let predicted = self.model.predict(key);
        let max_pos = (self.capacity() - 1) as i64;
        std::cmp::max(0, std::cmp::min(predicted, max_pos)) as usize
    }

    /// First slot holding a key greater than `key`, in `[0, capacity]`.
    /// The result can be a gap slot.
    pub fn upper_bound(&self, key: &K) -> usize {
        self.num_lookups.fetch_add(1, SeqCst);
        self.exponential_search_upper_bound(self.predict_position(key), key)
    }

    /// First slot holding a key not less than `key`, in `[0, capacity]`.
    /// The result can be a gap slot.
    pub fn lower_bound(&self, key: &K) -> usize {
        self.num_lookups.fetch_add(1, SeqCst);
        self.exponential_search_lower_bound(self.predict_position(key), key)
    }

    // Double the bound from slot `m` until it brackets the upper bound of
    // `key`, then binary search within the bracket.
    pub(crate) fn exponential_search_upper_bound(&self, m: usize, key: &K) -> usize {
        let capacity = self.capacity();
        let mut bound = 1_usize;
        let (l, r) = if self.keys[m].gt(key) {
            let size = m;
            while bound < size && self.keys[m - bound].gt(key) {
                bound *= 2;
                self.num_exp_search_iterations.fetch_add(1, SeqCst);
            }
            (m - std::cmp::min(bound, size), m - bound / 2)
        } else {
            let size = capacity - m;
            while bound < size && self.keys[m + bound].le(key) {
                bound *= 2;
                self.num_exp_search_iterations.fetch_add(1, SeqCst);
            }
            (m + bound / 2, m + std::cmp::min(bound, size))
        };
        self.binary_search_upper_bound(l, r, key)
    }

    pub(crate) fn exponential_search_lower_bound(&self, m: usize, key: &K) -> usize {
        let capacity = self.capacity();
        let mut bound = 1_usize;
        let (l, r) = if self.keys[m].ge(key) {
            let size = m;
            while bound < size && self.keys[m - bound].ge(key) {
                bound *= 2;
                self.num_exp_search_iterations.fetch_add(1, SeqCst);
            }
            (m - std::cmp::min(bound, size), m - bound / 2)
        } else {
            let size = capacity - m;
            while bound < size && self.keys[m + bound].lt(key) {
                bound *= 2;
                self.num_exp_search_iterations.fetch_add(1, SeqCst);
            }
            (m + bound / 2, m + std::cmp::min(bound, size))
        };
        self.binary_search_lower_bound(l, r, key)
    }

    // First slot in `[l, r)` with key greater than `key`, else `r`.
    fn binary_search_upper_bound(&self, mut l: usize, mut r: usize, key: &K) -> usize {
        while l < r {
            let mid = l + (r - l) / 2;
            if self.keys[mid].le(key) {
                l = mid + 1;
            } else {
                r = mid;
            }
        }
        l
    }

    // First slot in `[l, r)` with key not less than `key`, else `r`.
    fn binary_search_lower_bound(&self, mut l: usize, mut r: usize, key: &K) -> usize {
        while l < r {
            let mid = l + (r - l) / 2;
            if self.keys[mid].ge(key) {
                r = mid;
            } else {
                l = mid + 1;
            }
        }
        l
    }

    /// Slot of `key` if present. The last slot holding a given key value
    /// is the present one, earlier ones are gap sentinels.
    pub fn find_key(&self, key: &K) -> Option<(usize, P)> {
        self.num_lookups.fetch_add(1, SeqCst);
        let pos = self.exponential_search_upper_bound(self.predict_position(key), key);
        if pos == 0 {
            return None;
        }
        let pos = pos - 1;
        if self.check_exists(pos) && self.keys[pos].eq(key) {
            Some((pos, self.payloads[pos]))
        } else {
            None
        }
    }

    /// First present slot with key not less than `key`, `capacity` when
    /// none.
    pub fn find_lower(&self, key: &K) -> usize {
        let pos = self.lower_bound(key);
        self.next_filled_position(pos, false)
    }

    /// First present slot with key greater than `key`, `capacity` when
    /// none.
    pub fn find_upper(&self, key: &K) -> usize {
        let pos = self.upper_bound(key);
        self.next_filled_position(pos, false)
    }

    /// First present slot at or after `pos`, after `pos` when `exclusive`.
    pub fn next_filled_position(&self, pos: usize, exclusive: bool) -> usize {
        let pos = if exclusive { pos + 1 } else { pos };
        util::next_set_slot(&self.bitmap, pos, self.capacity())
    }

    // Slot to insert `key` at, taking the prediction into account, along
    // with the upper-bound slot. With duplicates the insert slot lands to
    // the right of existing entries of the same key.
    fn find_insert_position(&self, key: &K) -> (usize, usize) {
        let predicted = self.predict_position(key);
        let pos = self.exponential_search_upper_bound(predicted, key);
        if predicted <= pos || self.check_exists(pos) {
            (pos, pos)
        } else {
            // place as close as possible to the predicted slot while
            // keeping the array sorted.
            let next = self.next_filled_position(pos, true);
            (std::cmp::min(predicted, next - 1), pos)
        }
    }

    /// Insert one entry. `Full` is returned when there is no gap left,
    /// callers decide between growing and surfacing backpressure.
    /// Duplicates are detected before the capacity check.
    pub(crate) fn insert_entry(
        &mut self,
        key: &K,
        payload: P,
        allow_duplicates: bool,
    ) -> Result<ArrInsert> {
        let (ins_pos, upper_pos) = self.find_insert_position(key);
        if !allow_duplicates && upper_pos > 0 && self.keys[upper_pos - 1].eq(key) {
            return Ok(ArrInsert::Duplicate(upper_pos - 1));
        }
        if self.is_full() {
            return Ok(ArrInsert::Full);
        }

        let pos = if ins_pos < self.capacity() && !self.check_exists(ins_pos) {
            self.insert_element_at(key, payload, ins_pos);
            ins_pos
        } else {
            self.insert_using_shifts(key, payload, ins_pos)?
        };
        self.num_keys += 1;
        self.num_inserts.fetch_add(1, SeqCst);
        Ok(ArrInsert::Done(pos))
    }

    // Write the entry into a gap slot and overwrite preceding gaps with
    // the key, so runs stay sorted for exponential search.
    fn insert_element_at(&mut self, key: &K, payload: P, pos: usize) {
        self.keys[pos] = key.clone();
        self.payloads[pos] = payload;
        util::set_bit(&mut self.bitmap, pos);

        let mut i = pos;
        while i > 0 && !self.check_exists(i - 1) {
            i -= 1;
            self.keys[i] = key.clone();
        }
    }

    // Insert into an occupied slot by shifting an interior run by one,
    // towards the closest gap on either side.
    fn insert_using_shifts(&mut self, key: &K, payload: P, pos: usize) -> Result<usize> {
        let gap_pos = match self.closest_gap(pos) {
            Some(gap_pos) => gap_pos,
            None => return err_at!(Fatal, msg: "no gap in gapped-array {}", self.capacity()),
        };
        util::set_bit(&mut self.bitmap, gap_pos);

        if gap_pos >= pos {
            for i in (pos + 1..=gap_pos).rev() {
                self.keys[i] = self.keys[i - 1].clone();
                self.payloads[i] = self.payloads[i - 1];
            }
            self.insert_element_at(key, payload, pos);
            self.num_shifts.fetch_add((gap_pos - pos) as u64, SeqCst);
            Ok(pos)
        } else {
            for i in gap_pos..(pos - 1) {
                self.keys[i] = self.keys[i + 1].clone();
                self.payloads[i] = self.payloads[i + 1];
            }
            self.insert_element_at(key, payload, pos - 1);
            self.num_shifts.fetch_add((pos - 1 - gap_pos) as u64, SeqCst);
            Ok(pos - 1)
        }
    }

    /// Closest gap slot to `pos`, in either direction, scanning the bitmap
    /// a word at a time with leading/trailing zero counts. `pos` itself
    /// when it is a gap.
    pub(crate) fn closest_gap(&self, pos: usize) -> Option<usize> {
        let capacity = self.capacity();
        let pos = std::cmp::min(pos, capacity - 1);

        let left = self.nearest_gap_left(pos);
        let right = self.nearest_gap_right(pos, capacity);
        match (left, right) {
            (Some(l), Some(r)) => {
                if (pos - l) <= (r - pos) {
                    Some(l)
                } else {
                    Some(r)
                }
            }
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        }
    }

    // Greatest gap slot at, or left of, `pos`.
    fn nearest_gap_left(&self, pos: usize) -> Option<usize> {
        let (mut word_id, bit_pos) = (pos >> 6, pos & 0x3F);
        let mask = if bit_pos == 63 {
            u64::MAX
        } else {
            (1_u64 << (bit_pos + 1)) - 1
        };
        let mut gaps = !self.bitmap[word_id] & mask;
        loop {
            if gaps != 0 {
                let top = 63 - (gaps.leading_zeros() as usize);
                return Some((word_id << 6) + top);
            }
            if word_id == 0 {
                return None;
            }
            word_id -= 1;
            gaps = !self.bitmap[word_id];
        }
    }

    // Smallest gap slot at, or right of, `pos`, bounded by `capacity`.
    fn nearest_gap_right(&self, pos: usize, capacity: usize) -> Option<usize> {
        let (mut word_id, bit_pos) = (pos >> 6, pos & 0x3F);
        let mut gaps = !self.bitmap[word_id] & !((1_u64 << bit_pos) - 1);
        loop {
            if gaps != 0 {
                let gap_pos = (word_id << 6) + (gaps.trailing_zeros() as usize);
                return if gap_pos < capacity { Some(gap_pos) } else { None };
            }
            word_id += 1;
            if word_id >= self.bitmap.len() {
                return None;
            }
            gaps = !self.bitmap[word_id];
        }
    }

    /// Remove `key` if present. The freed slot, and the gap run left of
    /// it, are rewritten with the next present key to the right.
    pub fn erase(&mut self, key: &K) -> Option<P> {
        let (pos, payload) = self.find_key(key)?;
        util::unset_bit(&mut self.bitmap, pos);
        self.num_keys -= 1;

        let next = util::next_set_slot(&self.bitmap, pos, self.capacity());
        let sentinel = if next == self.capacity() {
            K::max_key()
        } else {
            self.keys[next].clone()
        };
        let mut i = pos;
        loop {
            self.keys[i] = sentinel.clone();
            if i == 0 || self.check_exists(i - 1) {
                break;
            }
            i -= 1;
        }
        Some(payload)
    }

    /// Number of present entries in slot range `[left, right)`.
    pub fn num_keys_in_range(&self, left: usize, right: usize) -> usize {
        util::count_bits_in_range(&self.bitmap, left, right)
    }

    /// First present slot, `capacity` when empty.
    pub fn first_pos(&self) -> usize {
        util::next_set_slot(&self.bitmap, 0, self.capacity())
    }

    /// Key of the first present slot.
    pub fn first_key(&self) -> Option<K> {
        match self.first_pos() {
            pos if pos < self.capacity() => Some(self.keys[pos].clone()),
            _ => None,
        }
    }

    /// Key of the last present slot.
    pub fn last_key(&self) -> Option<K> {
        (0..self.capacity())
            .rev()
            .find(|pos| self.check_exists(*pos))
            .map(|pos| self.keys[pos].clone())
    }

    /// Iterate present entries, in slot order, starting at slot `from`.
    pub fn iter_present(&self, from: usize) -> ArrIter<K, P> {
        ArrIter { arr: self, pos: from }
    }

    /// Clone out every present entry, in key order.
    pub fn to_entries(&self) -> Vec<(K, P)> {
        self.iter_present(0)
            .map(|(_, k, p)| (k.clone(), *p))
            .collect()
    }
}

/// Iterator over present slots of one gapped array.
pub struct ArrIter<'a, K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    arr: &'a GappedArray<K, P>,
    pos: usize,
}

impl<'a, K, P> Iterator for ArrIter<'a, K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    type Item = (usize, &'a K, &'a P);

    fn next(&mut self) -> Option<Self::Item> {
        let pos = util::next_set_slot(&self.arr.bitmap, self.pos, self.arr.capacity());
        if pos >= self.arr.capacity() {
            None
        } else {
            self.pos = pos + 1;
            Some((pos, &self.arr.keys[pos], &self.arr.payloads[pos]))
        }
    }
}

// Empirical statistics and the cost model over them.
impl<K, P> GappedArray<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub fn shifts_per_insert(&self) -> f64 {
        match self.num_inserts.load(SeqCst) {
            0 => 0.0,
            inserts => (self.num_shifts.load(SeqCst) as f64) / (inserts as f64),
        }
    }

    pub fn exp_search_iterations_per_operation(&self) -> f64 {
        let ops = self.num_inserts.load(SeqCst) + self.num_lookups.load(SeqCst);
        match ops {
            0 => 0.0,
            ops => (self.num_exp_search_iterations.load(SeqCst) as f64) / (ops as f64),
        }
    }

    pub fn frac_inserts(&self) -> f64 {
        let inserts = self.num_inserts.load(SeqCst);
        match inserts + self.num_lookups.load(SeqCst) {
            0 => 0.0,
            ops => (inserts as f64) / (ops as f64),
        }
    }

    pub fn empirical_cost(&self) -> f64 {
        if (self.num_inserts.load(SeqCst) + self.num_lookups.load(SeqCst)) == 0 {
            return 0.0;
        }
        (EXP_SEARCH_ITERATIONS_WEIGHT * self.exp_search_iterations_per_operation())
            + (SHIFTS_WEIGHT * self.shifts_per_insert() * self.frac_inserts())
    }

    /// Whether empirical cost deviates significantly from the expected
    /// cost computed at build time.
    pub fn significant_cost_deviation(&self) -> bool {
        let emp = self.empirical_cost();
        emp > NODE_LOOKUPS_WEIGHT && emp > (DEVIATION_FACTOR * self.cost)
    }

    /// Whether cost is catastrophically high, forcing a restructure.
    pub fn catastrophic_cost(&self) -> bool {
        self.shifts_per_insert() > CATASTROPHE_SHIFTS
            || self.expected_avg_shifts > CATASTROPHE_SHIFTS
    }

    pub fn reset_stats(&self) {
        self.num_shifts.store(0, SeqCst);
        self.num_exp_search_iterations.store(0, SeqCst);
        self.num_lookups.store(0, SeqCst);
        self.num_inserts.store(0, SeqCst);
    }

    pub(crate) fn carry_stats_from(&self, other: &GappedArray<K, P>) {
        self.num_shifts.store(other.num_shifts.load(SeqCst), SeqCst);
        self.num_exp_search_iterations
            .store(other.num_exp_search_iterations.load(SeqCst), SeqCst);
        self.num_lookups.store(other.num_lookups.load(SeqCst), SeqCst);
        self.num_inserts.store(other.num_inserts.load(SeqCst), SeqCst);
    }
}

fn expansion_threshold(capacity: usize, num_keys: usize) -> usize {
    let threshold = f64::max((capacity as f64) * MAX_DENSITY, (num_keys + 1) as f64);
    std::cmp::min(threshold as usize, capacity)
}

/// Search-iterations and shifts accumulator, the expected cost of a node
/// is computed over these while placing a dense key sequence.
///
/// A dense region of n keys contributes approximately n²/4 expected
/// shifts. Search iterations accumulate `log2(|predicted - actual| + 1)`.
#[derive(Default)]
pub(crate) struct ExpectedStats {
    cumulative_log_error: f64,
    last_position: Option<usize>,
    dense_region_start: usize,
    num_expected_shifts: u64,
    count: usize,
}

impl ExpectedStats {
    pub(crate) fn accumulate(&mut self, actual: usize, predicted: usize) {
        let diff = if actual > predicted {
            actual - predicted
        } else {
            predicted - actual
        };
        self.cumulative_log_error += ((diff + 1) as f64).log2();

        match self.last_position {
            Some(last) if actual > last + 1 => {
                let len = (last - self.dense_region_start + 1) as u64;
                self.num_expected_shifts += (len * len) / 4;
                self.dense_region_start = actual;
            }
            None => self.dense_region_start = actual,
            _ => (),
        }
        self.last_position = Some(actual);
        self.count += 1;
    }

    pub(crate) fn mean_search_iters(&self) -> f64 {
        match self.count {
            0 => 0.0,
            n => self.cumulative_log_error / (n as f64),
        }
    }

    pub(crate) fn mean_shifts(&self) -> f64 {
        match self.count {
            0 => 0.0,
            n => {
                let last = self.last_position.unwrap_or(0);
                let len = (last - self.dense_region_start + 1) as u64;
                let shifts = self.num_expected_shifts + (len * len) / 4;
                (shifts as f64) / (n as f64)
            }
        }
    }
}

/// Expected cost of treating sorted `items` as one data node at `density`,
/// without building it. Placement is simulated against `model`, or against
/// a freshly trained one. Returns `(cost, search_iters, shifts)`.
pub fn expected_cost<K, P>(
    items: &[(K, P)],
    density: f64,
    insert_frac: f64,
    model: Option<&LinearModel>,
    approximate: bool,
) -> Result<(f64, f64, f64)>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let n = items.len();
    if n == 0 {
        return Ok((0.0, 0.0, 0.0));
    }

    if approximate && n > (COST_SAMPLE_LOWER_BOUND * 4) {
        return expected_cost_sampling(items, density, insert_frac, model);
    }
    expected_cost_exact(items, density, insert_frac, model)
}

fn expected_cost_exact<K, P>(
    items: &[(K, P)],
    density: f64,
    insert_frac: f64,
    model: Option<&LinearModel>,
) -> Result<(f64, f64, f64)>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let n = items.len();
    let capacity = std::cmp::max((n as f64 / density) as usize, n + 1);

    let mut model = match model {
        Some(model) => model.clone(),
        None => {
            let keys: Vec<K> = items.iter().map(|(k, _)| k.clone()).collect();
            model::build_model(&keys, false)?
        }
    };
    model.expand((capacity as f64) / (n as f64));

    // place implicitly, accumulating stats without building the node.
    let mut acc = ExpectedStats::default();
    let mut last_pos: Option<usize> = None;
    for (i, (key, _)) in items.iter().enumerate() {
        let predicted = {
            let p = model.predict(key);
            std::cmp::max(0, std::cmp::min(p, (capacity - 1) as i64)) as usize
        };
        let lo = last_pos.map_or(0, |p| p + 1);
        let hi = capacity - (n - i);
        let pos = std::cmp::min(std::cmp::max(predicted, lo), hi);
        acc.accumulate(pos, predicted);
        last_pos = Some(pos);
    }

    let (iters, shifts) = (acc.mean_search_iters(), acc.mean_shifts());
    let cost = (EXP_SEARCH_ITERATIONS_WEIGHT * iters) + (SHIFTS_WEIGHT * shifts * insert_frac);
    Ok((cost, iters, shifts))
}

// progressively grow the sample until the cost estimate stabilizes.
fn expected_cost_sampling<K, P>(
    items: &[(K, P)],
    density: f64,
    insert_frac: f64,
    model: Option<&LinearModel>,
) -> Result<(f64, f64, f64)>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let mut step = 1_usize;
    {
        let mut sample_size = items.len();
        while sample_size >= COST_SAMPLE_LOWER_BOUND {
            sample_size /= 2;
            step *= 2;
        }
        step /= 2;
    }

    let sample = |step: usize| -> Vec<(K, P)> {
        items.iter().step_by(step).cloned().collect()
    };

    let mut estimate = expected_cost_exact(&sample(step), density, insert_frac, model)?;
    while step > 1 {
        step /= 2;
        let refined = expected_cost_exact(&sample(step), density, insert_frac, model)?;
        let change = match estimate.0 {
            cost if cost == 0.0 => refined.0,
            cost => ((refined.0 - cost) / cost).abs(),
        };
        estimate = refined;
        if change < COST_REL_CHANGE_THRESHOLD {
            break;
        }
    }
    Ok(estimate)
}

/// Delta-buffer, a gapped array that absorbs inserts while the owning
/// leaf is restructured in the background. Shared across split children
/// via its [Arc] reference count.
pub struct DeltaBuffer<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub(crate) arr: Spinlock<GappedArray<K, P>>,
}

impl<K, P> DeltaBuffer<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub fn new(capacity: usize, model: LinearModel) -> DeltaBuffer<K, P> {
        DeltaBuffer {
            arr: Spinlock::new(GappedArray::empty(capacity, model)),
        }
    }

    pub fn len(&self) -> usize {
        self.arr.read().num_keys
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// The pair of delta-buffers owned by a leaf.
pub(crate) struct DeltaPair<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub(crate) primary: Option<Arc<DeltaBuffer<K, P>>>,
    pub(crate) shadow: Option<Arc<DeltaBuffer<K, P>>>,
}

impl<K, P> Default for DeltaPair<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    fn default() -> Self {
        DeltaPair {
            primary: None,
            shadow: None,
        }
    }
}

impl<K, P> DeltaPair<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    fn snapshot(
        &self,
    ) -> (
        Option<Arc<DeltaBuffer<K, P>>>,
        Option<Arc<DeltaBuffer<K, P>>>,
    ) {
        (self.primary.clone(), self.shadow.clone())
    }
}

/// Leaf node. Refer to the [module][self] documentation for the layout
/// and the delta hand-off protocol.
pub struct DataNode<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub(crate) arr: Spinlock<GappedArray<K, P>>,
    pub(crate) deltas: Spinlock<DeltaPair<K, P>>,
    pub(crate) insert_mutex: Mutex<()>,
    status: AtomicU8,
    retired: AtomicBool,
    // array layout version, odd while a background install is swapping
    // the main array and the delta pair. Readers that compute slot
    // positions, or that want a definitive miss across the array and the
    // delta-buffers, validate against this word.
    generation: AtomicU64,

    pub(crate) pivot: K,
    pub(crate) level: usize,
    pub(crate) duplication_factor: u8,
    pub(crate) max_slots: usize,

    pub(crate) parent: Spinlock<Weak<Node<K, P>>>,
    pub(crate) prev_leaf: Spinlock<Weak<Node<K, P>>>,
    pub(crate) next_leaf: Spinlock<Weak<Node<K, P>>>,
    pub(crate) pending_left: Spinlock<Weak<Node<K, P>>>,
    pub(crate) pending_right: Spinlock<Weak<Node<K, P>>>,
}

impl<K, P> DataNode<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    /// Create a leaf from a pre-built gapped array.
    pub fn new(
        arr: GappedArray<K, P>,
        pivot: K,
        level: usize,
        duplication_factor: u8,
        max_slots: usize,
    ) -> DataNode<K, P> {
        DataNode {
            arr: Spinlock::new(arr),
            deltas: Spinlock::new(DeltaPair::default()),
            insert_mutex: Mutex::new(()),
            status: AtomicU8::new(Status::WriteArray as u8),
            retired: AtomicBool::new(false),
            generation: AtomicU64::new(0),

            pivot,
            level,
            duplication_factor,
            max_slots,

            parent: Spinlock::new(Weak::new()),
            prev_leaf: Spinlock::new(Weak::new()),
            next_leaf: Spinlock::new(Weak::new()),
            pending_left: Spinlock::new(Weak::new()),
            pending_right: Spinlock::new(Weak::new()),
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from(self.status.load(SeqCst))
    }

    #[inline]
    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, SeqCst);
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(SeqCst)
    }

    /// Current array-layout version. Odd means a background install is
    /// mid-swap and slot positions are unstable.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(SeqCst)
    }

    #[inline]
    pub(crate) fn retire(&self) {
        self.retired.store(true, SeqCst);
    }

    /// Number of present entries, main array and delta-buffers together.
    /// Approximate under concurrency, used for stats and decisions.
    pub fn len(&self) -> usize {
        let mut len = self.arr.read().num_keys;
        let (primary, shadow) = self.deltas.read().snapshot();
        if let Some(buf) = primary {
            len += buf.len()
        }
        if let Some(buf) = shadow {
            len += buf.len()
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point lookup under try-read locks, in order: main array, primary
    /// delta, shadow delta. Contention surfaces as retry-later.
    ///
    /// A miss is definitive only when the layout generation did not move
    /// between the array probe and the delta probes. A concurrent install
    /// migrates entries delta-to-array as two separate latch scopes, a
    /// reader straddling that swap could miss the key on both sides.
    pub fn find_payload(&self, key: &K) -> Result<Option<P>> {
        let generation = self.generation();
        if (generation & 1) == 1 {
            return err_at!(RetryLater, msg: "leaf install in flight");
        }

        {
            let arr = match self.arr.try_read() {
                Some(arr) => arr,
                None => return err_at!(RetryLater, msg: "leaf array busy"),
            };
            if let Some((_, payload)) = arr.find_key(key) {
                return Ok(Some(payload));
            }
        }

        let (primary, shadow) = match self.deltas.try_read() {
            Some(deltas) => deltas.snapshot(),
            None => return err_at!(RetryLater, msg: "leaf deltas busy"),
        };
        for buf in [primary, shadow].iter().flatten() {
            let arr = match buf.arr.try_read() {
                Some(arr) => arr,
                None => return err_at!(RetryLater, msg: "delta buffer busy"),
            };
            if let Some((_, payload)) = arr.find_key(key) {
                return Ok(Some(payload));
            }
        }

        if self.generation() != generation {
            return err_at!(RetryLater, msg: "leaf install raced the lookup");
        }
        Ok(None)
    }

    /// Foreground insert, caller holds this leaf's `insert_mutex`.
    pub(crate) fn insert_fg(
        &self,
        key: &K,
        payload: P,
        allow_duplicates: bool,
        delta_capacity: usize,
    ) -> Result<Insert> {
        match self.status() {
            Status::WriteArray => self.insert_at_array(key, payload, allow_duplicates),
            status => self.insert_at_delta(key, payload, allow_duplicates, delta_capacity, status),
        }
    }

    fn insert_at_array(&self, key: &K, payload: P, allow_duplicates: bool) -> Result<Insert> {
        let mut arr = self.arr.write();
        let pos = match arr.insert_entry(key, payload, allow_duplicates)? {
            ArrInsert::Duplicate(pos) => return Ok(Insert::Duplicate(pos)),
            ArrInsert::Full => {
                // the insert that fills the last gap reports
                // needs-restructure, a full array can't take another write.
                return err_at!(Fatal, msg: "insert on full leaf array");
            }
            ArrInsert::Done(pos) => pos,
        };

        if arr.catastrophic_cost() {
            return Ok(Insert::NeedsRestructure(pos));
        }
        if arr.num_keys == arr.capacity() {
            return Ok(Insert::NeedsRestructure(pos));
        }
        if arr.num_keys >= arr.expansion_threshold {
            if arr.significant_cost_deviation() || arr.catastrophic_cost() {
                return Ok(Insert::NeedsRestructure(pos));
            }
            if arr.num_keys > self.max_slots {
                return Ok(Insert::NeedsRestructure(pos));
            }
            return Ok(Insert::NeedsExpand(pos));
        }
        Ok(Insert::Ok(pos))
    }

    fn insert_at_delta(
        &self,
        key: &K,
        payload: P,
        allow_duplicates: bool,
        delta_capacity: usize,
        status: Status,
    ) -> Result<Insert> {
        if !allow_duplicates {
            // key can pre-exist in the frozen arrays.
            let arr = self.arr.read();
            if let Some((pos, _)) = arr.find_key(key) {
                return Ok(Insert::Duplicate(pos));
            }
        }

        let (primary, shadow) = self.deltas.read().snapshot();

        let mut try_primary = status == Status::WriteDelta;
        if try_primary {
            let buf = match primary.as_ref() {
                Some(buf) => buf,
                None => return err_at!(Fatal, msg: "write-delta leaf without primary"),
            };
            let mut arr = buf.arr.write();
            match arr.insert_entry(key, payload, allow_duplicates)? {
                ArrInsert::Done(pos) => return Ok(Insert::Ok(pos)),
                ArrInsert::Duplicate(pos) => return Ok(Insert::Duplicate(pos)),
                ArrInsert::Full => try_primary = false, // fall through to the shadow
            }
        }
        if !try_primary && !allow_duplicates {
            // full, or frozen, primary still holds keys to check against.
            if let Some(buf) = primary.as_ref() {
                let arr = buf.arr.read();
                if let Some((pos, _)) = arr.find_key(key) {
                    return Ok(Insert::Duplicate(pos));
                }
            }
        }

        // primary is full or frozen, write lands in the shadow buffer,
        // allocated on demand.
        let shadow = match shadow {
            Some(shadow) => shadow,
            None => {
                let model = self.arr.read().model.clone();
                let shadow = Arc::new(DeltaBuffer::new(delta_capacity, model));
                self.deltas.write().shadow = Some(Arc::clone(&shadow));
                shadow
            }
        };
        self.set_status(Status::WriteTmpDelta);

        let mut arr = shadow.arr.write();
        match arr.insert_entry(key, payload, allow_duplicates)? {
            ArrInsert::Done(pos) => Ok(Insert::Ok(pos)),
            ArrInsert::Duplicate(pos) => Ok(Insert::Duplicate(pos)),
            ArrInsert::Full => Ok(Insert::DeltaFull),
        }
    }

    /// Foreground erase, caller holds this leaf's `insert_mutex`. Leaves
    /// under background maintenance surface retry-later.
    pub(crate) fn erase_fg(&self, key: &K) -> Result<Option<P>> {
        match self.status() {
            Status::WriteArray => Ok(self.arr.write().erase(key)),
            _ => err_at!(RetryLater, msg: "leaf under restructure"),
        }
    }

    /// Allocate the primary delta-buffer and make this leaf absorb writes
    /// into it. Caller holds `insert_mutex` and is about to enqueue a
    /// background job.
    pub(crate) fn activate_delta(&self, delta_capacity: usize) {
        let mut deltas = self.deltas.write();
        if deltas.primary.is_none() {
            let model = self.arr.read().model.clone();
            deltas.primary = Some(Arc::new(DeltaBuffer::new(delta_capacity, model)));
        }
        self.set_status(Status::WriteDelta);
    }

    /// Background: freeze the primary delta-buffer, follow-on writes go to
    /// the lazily allocated shadow. Caller holds `insert_mutex`.
    pub(crate) fn freeze_primary(&self) {
        if self.status() == Status::WriteDelta {
            self.set_status(Status::WriteTmpDelta);
        }
    }

    /// Background: merged snapshot of the main array and the frozen
    /// primary delta-buffer, in key order. Delta entries are clipped to
    /// `[lo, hi)`, a split child draining a shared buffer reads only its
    /// own key range.
    pub(crate) fn snapshot_merged(&self, lo: Option<&K>, hi: Option<&K>) -> Vec<(K, P)> {
        let in_range = |key: &K| {
            lo.map_or(true, |l| key.ge(l)) && hi.map_or(true, |h| key.lt(h))
        };
        let arr = self.arr.read();
        let (primary, _) = self.deltas.read().snapshot();
        match primary {
            Some(buf) => {
                let delta: Vec<(K, P)> = {
                    let delta = buf.arr.read();
                    let entries = delta
                        .iter_present(0)
                        .filter(|(_, key, _)| in_range(key))
                        .map(|(_, key, payload)| (key.clone(), *payload));
                    entries.collect()
                };
                merge_sorted(arr.to_entries(), delta)
            }
            None => arr.to_entries(),
        }
    }

    /// Background: swap in a rebuilt main array, retire the merged primary
    /// and promote the shadow. Caller holds `insert_mutex`. Returns true
    /// when a non-empty promoted primary is left behind, callers re-enqueue
    /// a drain job for it.
    ///
    /// The generation word goes odd for the duration of the two swaps and
    /// even again after, readers validate their slot positions and their
    /// array-plus-delta misses against it.
    pub(crate) fn install_rebuilt(&self, new_arr: GappedArray<K, P>) -> bool {
        {
            let arr = self.arr.read();
            new_arr.carry_stats_from(&arr);
        }

        self.generation.fetch_add(1, SeqCst);
        *self.arr.write() = new_arr;

        let mut deltas = self.deltas.write();
        deltas.primary = deltas.shadow.take();
        let leftover = match deltas.primary.as_ref() {
            Some(buf) if !buf.is_empty() => {
                self.set_status(Status::WriteDelta);
                true
            }
            Some(_) => {
                deltas.primary = None;
                self.set_status(Status::WriteArray);
                false
            }
            None => {
                self.set_status(Status::WriteArray);
                false
            }
        };
        self.generation.fetch_add(1, SeqCst);
        leftover
    }

    /// Memory footprint of slots and bitmap, in bytes.
    pub fn data_size(&self) -> usize {
        let arr = self.arr.read();
        let capacity = arr.capacity();
        (capacity * std::mem::size_of::<K>())
            + (capacity * std::mem::size_of::<P>())
            + (arr.bitmap.len() * 8)
    }
}

// merge two sorted entry lists into one.
pub(crate) fn merge_sorted<K, P>(a: Vec<(K, P)>, b: Vec<(K, P)>) -> Vec<(K, P)>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut ia, mut ib) = (a.into_iter(), b.into_iter());
    let (mut xa, mut xb) = (ia.next(), ib.next());
    loop {
        match (xa.take(), xb.take()) {
            (Some(ea), Some(eb)) => {
                if ea.0.le(&eb.0) {
                    out.push(ea);
                    xa = ia.next();
                    xb = Some(eb);
                } else {
                    out.push(eb);
                    xa = Some(ea);
                    xb = ib.next();
                }
            }
            (Some(ea), None) => {
                out.push(ea);
                xa = ia.next();
            }
            (None, Some(eb)) => {
                out.push(eb);
                xb = ib.next();
            }
            (None, None) => break,
        }
    }
    out
}

#[cfg(test)]
#[path = "data_test.rs"]
mod data_test;

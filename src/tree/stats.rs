//! Module `stats` implement statistics for the index.

use std::{
    fmt, result,
    sync::atomic::{AtomicUsize, Ordering::SeqCst},
};

// Maintenance and workload counters, index wide.
#[derive(Default)]
pub(crate) struct Counters {
    /// Leaves expanded in place by the background pool.
    pub(crate) n_expansions: AtomicUsize,
    /// Delta-buffers merged back into a leaf's main array.
    pub(crate) n_drains: AtomicUsize,
    /// Leaves split into two, children installed under the same parent.
    pub(crate) n_splits_sideways: AtomicUsize,
    /// Leaves replaced by a fresh model node with two children.
    pub(crate) n_splits_downwards: AtomicUsize,
    /// Retry-later responses handed to callers.
    pub(crate) n_retries: AtomicUsize,
    /// Key-domain widenings from out-of-domain inserts.
    pub(crate) n_domain_expansions: AtomicUsize,
    /// Background jobs completed.
    pub(crate) n_bg_jobs: AtomicUsize,
}

impl Counters {
    pub(crate) fn incr(field: &AtomicUsize) {
        field.fetch_add(1, SeqCst);
    }
}

/// Statistic type, for [Index][crate::Index].
pub struct Stats {
    pub name: String,
    /// Number of index entries, approximate under concurrency.
    pub n_count: usize,
    /// Number of leaf nodes.
    pub n_data_nodes: usize,
    /// Number of interior nodes, superroot included.
    pub n_model_nodes: usize,
    /// Maximum leaf depth, superroot at depth ZERO.
    pub depth: usize,
    pub n_expansions: usize,
    pub n_drains: usize,
    pub n_splits_sideways: usize,
    pub n_splits_downwards: usize,
    pub n_retries: usize,
    pub n_domain_expansions: usize,
    pub n_bg_jobs: usize,
}

impl Stats {
    pub(crate) fn new(name: &str) -> Stats {
        Stats {
            name: name.to_string(),
            n_count: Default::default(),
            n_data_nodes: Default::default(),
            n_model_nodes: Default::default(),
            depth: Default::default(),
            n_expansions: Default::default(),
            n_drains: Default::default(),
            n_splits_sideways: Default::default(),
            n_splits_downwards: Default::default(),
            n_retries: Default::default(),
            n_domain_expansions: Default::default(),
            n_bg_jobs: Default::default(),
        }
    }

    pub(crate) fn fill_counters(&mut self, counters: &Counters) {
        self.n_expansions = counters.n_expansions.load(SeqCst);
        self.n_drains = counters.n_drains.load(SeqCst);
        self.n_splits_sideways = counters.n_splits_sideways.load(SeqCst);
        self.n_splits_downwards = counters.n_splits_downwards.load(SeqCst);
        self.n_retries = counters.n_retries.load(SeqCst);
        self.n_domain_expansions = counters.n_domain_expansions.load(SeqCst);
        self.n_bg_jobs = counters.n_bg_jobs.load(SeqCst);
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        writeln!(f, "remi.name = {}", self.name)?;
        writeln!(
            f,
            "remi = {{ n_count={}, n_data_nodes={}, n_model_nodes={}, depth={} }}",
            self.n_count, self.n_data_nodes, self.n_model_nodes, self.depth,
        )?;
        writeln!(
            f,
            "remi.maintenance = {{ expansions={}, drains={}, sideways={}, downwards={} }}",
            self.n_expansions, self.n_drains, self.n_splits_sideways, self.n_splits_downwards,
        )?;
        writeln!(
            f,
            "remi.workload = {{ retries={}, domain_expansions={}, bg_jobs={} }}",
            self.n_retries, self.n_domain_expansions, self.n_bg_jobs,
        )
    }
}

//! Module `config` implement configuration options for the index.

use serde::{Deserialize, Serialize};

use std::convert::TryFrom;

use crate::{Error, Result};

/// Default maximum size of a single node, in bytes, 16MB.
pub const MAX_NODE_SIZE: usize = 1 << 24;

/// Default number of background maintenance threads.
pub const BG_POOL_SIZE: usize = 1;

/// Default lower bound on number of keys hosted by a data node, used to
/// bound the fanout search while bulk loading.
pub const MIN_KEYS_PER_DATA_NODE: usize = 100;

/// Fallback capacity for delta-buffers, when the configured capacity is
/// `0/auto` and the leaf is near-empty.
pub const MIN_DELTA_CAPACITY: usize = 1024;

/// Configuration type for building an [Index][crate::Index].
///
/// Refer to the `set_*` methods for usage. Configuration can also be
/// deserialized from toml text, missing options fall back to defaults:
///
/// ```ignore
/// let config = Config::try_from(r#"max_node_size_bytes = 65536"#).unwrap();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Expected fraction of write operations in the workload, in `[0,1]`.
    /// Biases the intra-node cost model while bulk loading and splitting,
    /// `0` assumes a read-only workload.
    #[serde(default)]
    pub expected_insert_frac: f64,
    /// Maximum size of any single node, in bytes. Derives the maximum
    /// fanout of model nodes and the maximum slots of data nodes.
    #[serde(default = "Config::default_max_node_size")]
    pub max_node_size_bytes: usize,
    /// Train intra-node models over progressively grown samples, instead
    /// of every key.
    #[serde(default = "Config::default_true")]
    pub approximate_model_computation: bool,
    /// Estimate node costs over samples, instead of every key.
    #[serde(default)]
    pub approximate_cost_computation: bool,
    /// Capacity of per-leaf delta-buffers, `0` means auto, sized after the
    /// leaf's population.
    #[serde(default)]
    pub delta_index_capacity: usize,
    /// Whether the index shall hold multiple entries for the same key.
    #[serde(default)]
    pub allow_duplicates: bool,
    /// Maximum number of workers, foreground and background together, that
    /// can register with the index. Fixed at construction.
    #[serde(default = "Config::default_max_workers")]
    pub max_workers: usize,
    /// Number of background maintenance threads.
    #[serde(default = "Config::default_bg_pool_size")]
    pub bg_pool_size: usize,
    /// Lower bound on keys hosted per data node, bounds the bulk-load
    /// fanout search.
    #[serde(default = "Config::default_min_keys")]
    pub min_keys_per_data_node: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            expected_insert_frac: 0.0,
            max_node_size_bytes: Self::default_max_node_size(),
            approximate_model_computation: true,
            approximate_cost_computation: false,
            delta_index_capacity: 0,
            allow_duplicates: false,
            max_workers: Self::default_max_workers(),
            bg_pool_size: Self::default_bg_pool_size(),
            min_keys_per_data_node: Self::default_min_keys(),
        }
    }
}

impl TryFrom<&str> for Config {
    type Error = Error;

    fn try_from(text: &str) -> Result<Config> {
        err_at!(InvalidInput, toml::from_str(text), "invalid config toml")
    }
}

impl Config {
    fn default_max_node_size() -> usize {
        MAX_NODE_SIZE
    }

    fn default_true() -> bool {
        true
    }

    fn default_max_workers() -> usize {
        (num_cpus::get() * 2) + BG_POOL_SIZE
    }

    fn default_bg_pool_size() -> usize {
        BG_POOL_SIZE
    }

    fn default_min_keys() -> usize {
        MIN_KEYS_PER_DATA_NODE
    }
}

impl Config {
    /// Refer to [Config::expected_insert_frac].
    pub fn set_expected_insert_frac(&mut self, frac: f64) -> Result<&mut Self> {
        if !(0.0..=1.0).contains(&frac) {
            return err_at!(InvalidInput, msg: "insert frac {} outside [0,1]", frac);
        }
        self.expected_insert_frac = frac;
        Ok(self)
    }

    /// Refer to [Config::max_node_size_bytes].
    pub fn set_max_node_size(&mut self, bytes: usize) -> Result<&mut Self> {
        if bytes == 0 {
            return err_at!(InvalidInput, msg: "max node size can't be ZERO");
        }
        self.max_node_size_bytes = bytes;
        Ok(self)
    }

    /// Refer to [Config::approximate_model_computation] and
    /// [Config::approximate_cost_computation].
    pub fn set_approximate(&mut self, model: bool, cost: bool) -> &mut Self {
        self.approximate_model_computation = model;
        self.approximate_cost_computation = cost;
        self
    }

    /// Refer to [Config::delta_index_capacity].
    pub fn set_delta_index_capacity(&mut self, capacity: usize) -> &mut Self {
        self.delta_index_capacity = capacity;
        self
    }

    /// Refer to [Config::allow_duplicates].
    pub fn set_allow_duplicates(&mut self, allow: bool) -> &mut Self {
        self.allow_duplicates = allow;
        self
    }

    /// Refer to [Config::max_workers].
    pub fn set_max_workers(&mut self, max_workers: usize) -> Result<&mut Self> {
        if max_workers <= self.bg_pool_size {
            return err_at!(InvalidInput, msg: "need worker slots beyond {} bg threads", self.bg_pool_size);
        }
        self.max_workers = max_workers;
        Ok(self)
    }

    /// Refer to [Config::bg_pool_size].
    pub fn set_bg_pool_size(&mut self, pool_size: usize) -> Result<&mut Self> {
        if pool_size == 0 {
            return err_at!(InvalidInput, msg: "background pool can't be empty");
        }
        self.bg_pool_size = pool_size;
        Ok(self)
    }

    /// Refer to [Config::min_keys_per_data_node].
    pub fn set_min_keys_per_data_node(&mut self, min_keys: usize) -> &mut Self {
        self.min_keys_per_data_node = min_keys;
        self
    }
}

impl Config {
    /// Maximum fanout of a model node, derived from the node size budget,
    /// assuming 8-byte child pointers. Always a power of two.
    pub fn max_fanout(&self) -> usize {
        let fanout = std::cmp::max(2, self.max_node_size_bytes / 8);
        match fanout.is_power_of_two() {
            true => fanout,
            false => fanout.next_power_of_two() / 2,
        }
    }

    /// Maximum slots of a data node, derived from the node size budget and
    /// the entry footprint.
    pub fn max_data_node_slots(&self, entry_size: usize) -> usize {
        std::cmp::max(16, self.max_node_size_bytes / std::cmp::max(1, entry_size))
    }

    /// Capacity for a fresh delta-buffer over a leaf holding `num_keys`.
    pub fn delta_capacity(&self, num_keys: usize) -> usize {
        match self.delta_index_capacity {
            0 => std::cmp::max(num_keys, MIN_DELTA_CAPACITY),
            n => n,
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

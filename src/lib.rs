//! Package implement a learned index for ordered `(key,value)` data-set,
//! optimized for concurrent readers and writers.
//!
//! Unlike comparison based trees, interior nodes carry a trained linear
//! regression that predicts the child slot for a key, and leaf nodes carry
//! a trained model that predicts the key's slot within a sparse, gapped
//! array. Model mis-prediction is corrected with exponential search, and
//! kept in check by retraining during structural maintenance.
//!
//! Quick points on concurrency:
//!
//! * Read operations descend the tree without blocking, protected by a
//!   quiescent-state based reclamation scheme, refer [rcu] module.
//! * Write operations serialize per-leaf, through the leaf's insert mutex.
//! * Structural changes, like splitting and expanding a leaf, are done by
//!   a pool of background threads, while foreground writes land in the
//!   leaf's delta-buffer, refer [node] and [tree] modules.
//! * Callers observing a concurrent restructure get [Error::RetryLater],
//!   a cooperative backpressure signal, and are expected to retry.
//!
//! Index operations are available via [Index] type. Keys implement
//! [FeatureKey], numeric types and fixed-width byte-strings are supplied
//! out of the box.

#![allow(clippy::needless_range_loop)]

#[macro_use]
mod error;

pub mod config;
pub mod fanout;
pub mod model;
pub mod node;
pub mod rcu;
pub mod tree;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::Error;
pub use model::{LeastSquares, LinearModel, ModelBuilder};
pub use tree::{Index, Iter, Stats};
pub use types::{ByteKey, FeatureKey};

/// Type alias for Result return type, used by this package.
pub type Result<T> = std::result::Result<T, Error>;

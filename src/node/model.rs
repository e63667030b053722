//! Module `model` implement the interior node of the learned index.
//!
//! A model node routes a key to one of its `num_children` child slots,
//! `num_children` is always a power of two. A child advertising
//! duplication-factor `d` occupies `2^d` consecutive slots, all holding
//! the same reference, which lets a background job replace an arbitrary
//! subtree by overwriting a contiguous slot range under the write latch.

use std::sync::{Arc, Weak};

use crate::{
    model::LinearModel,
    node::Node,
    types::FeatureKey,
    util::Spinlock,
    Error, Result,
};

/// Interior node, refer to the [module][self] documentation.
pub struct ModelNode<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub(crate) model: LinearModel,
    pub(crate) children: Spinlock<Vec<Arc<Node<K, P>>>>,
    pub(crate) pivot: K,
    pub(crate) level: usize,
    pub(crate) duplication_factor: u8,
    pub(crate) parent: Spinlock<Weak<Node<K, P>>>,
}

impl<K, P> ModelNode<K, P>
where
    K: FeatureKey,
    P: Copy + Default + Send + Sync,
{
    pub fn new(
        model: LinearModel,
        pivot: K,
        level: usize,
        duplication_factor: u8,
    ) -> ModelNode<K, P> {
        ModelNode {
            model,
            children: Spinlock::new(Vec::default()),
            pivot,
            level,
            duplication_factor,
            parent: Spinlock::new(Weak::new()),
        }
    }

    /// Number of child slots, a power of two.
    pub fn num_children(&self) -> usize {
        self.children.read().len()
    }

    /// Pick the child for `key`: predict, clamp, round the slot down to
    /// the child's duplication alignment, then walk leftward while the
    /// chosen child's pivot exceeds the key, correcting floating point
    /// misprediction, and finally walk rightward one child-span at a time
    /// while the next child's pivot is still not greater than the key.
    ///
    /// Returns the child and its aligned slot.
    pub fn find_child(&self, key: &K) -> Result<(Arc<Node<K, P>>, usize)> {
        let children = self.children.read();
        let num_children = children.len();
        if num_children == 0 {
            return err_at!(Fatal, msg: "model node without children");
        }

        let predicted = self.model.predict_double(key) as i64;
        let mut bucket =
            std::cmp::max(0, std::cmp::min(predicted, (num_children - 1) as i64)) as usize;
        let mut child = Arc::clone(&children[bucket]);
        bucket -= bucket % (1_usize << child.duplication_factor());

        while key.lt(&child.to_pivot()) {
            if bucket == 0 {
                return err_at!(Fatal, msg: "key below every pivot of model node");
            }
            bucket -= 1;
            child = Arc::clone(&children[bucket]);
            bucket -= bucket % (1_usize << child.duplication_factor());
        }

        if child.to_pivot().lt(key) {
            loop {
                let span = 1_usize << child.duplication_factor();
                let next_bucket = bucket + span;
                if next_bucket >= num_children {
                    break;
                }
                let next = Arc::clone(&children[next_bucket]);
                if key.lt(&next.to_pivot()) {
                    break;
                }
                bucket = next_bucket;
                child = next;
            }
        }

        Ok((child, bucket))
    }

    /// Slot range `[start, start+span)` currently held by `child`, located
    /// by pointer identity.
    pub(crate) fn locate_child(&self, child: &Arc<Node<K, P>>) -> Option<(usize, usize)> {
        let children = self.children.read();
        let start = children.iter().position(|c| Arc::ptr_eq(c, child))?;
        let span = 1_usize << child.duplication_factor();
        let start = start - (start % span);
        Some((start, span))
    }

    /// Overwrite child slots `[start, start+replacement.len())`, under the
    /// write latch. Every duplicate of a replaced child must be covered by
    /// the range.
    pub(crate) fn replace_children(
        &self,
        start: usize,
        replacement: &[Arc<Node<K, P>>],
    ) -> Result<()> {
        let mut children = self.children.write();
        if start + replacement.len() > children.len() {
            return err_at!(
                Fatal,
                msg: "replace range {}+{} beyond fanout {}", start, replacement.len(), children.len()
            );
        }
        for (i, node) in replacement.iter().enumerate() {
            children[start + i] = Arc::clone(node);
        }
        Ok(())
    }

    /// Snapshot of the children slots.
    pub fn children_snapshot(&self) -> Vec<Arc<Node<K, P>>> {
        self.children.read().iter().map(Arc::clone).collect()
    }

    /// Verify the power-of-two partitioning of children: every child's
    /// slot range is `2^d` wide, aligned on its own width, and every slot
    /// in the range holds the same reference.
    pub fn validate_children(&self) -> Result<()> {
        let children = self.children.read();
        let num_children = children.len();
        if !num_children.is_power_of_two() {
            return err_at!(Fatal, msg: "fanout {} not a power of two", num_children);
        }

        let mut slot = 0;
        while slot < num_children {
            let child = &children[slot];
            let span = 1_usize << child.duplication_factor();
            if slot % span != 0 {
                return err_at!(Fatal, msg: "child at {} mis-aligned for span {}", slot, span);
            }
            if slot + span > num_children {
                return err_at!(Fatal, msg: "child at {} span {} beyond fanout", slot, span);
            }
            for i in slot..(slot + span) {
                if !Arc::ptr_eq(&children[i], child) {
                    return err_at!(Fatal, msg: "duplicated child differs at slot {}", i);
                }
            }
            slot += span;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod model_test;

//! Ordering engine: relocate one element of a sibling sequence and assign
//! fresh zero-based positions to every sibling.
//!
//! Pure functions only. Callers submit the whole position mapping, not a
//! delta, so interleaved reorders cannot drift.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OrderingError {
    #[error("index {index} out of range for {len} siblings")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Result of a reorder: the new sequence and one position per identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reordered<K> {
    pub order: Vec<K>,
    /// `(identity, position)` in new order; positions are `0..n`.
    pub positions: Vec<(K, i64)>,
}

impl<K: Copy> Reordered<K> {
    fn from_order(order: Vec<K>) -> Self {
        let positions = order
            .iter()
            .enumerate()
            .map(|(i, k)| (*k, i as i64))
            .collect();
        Self { order, positions }
    }
}

/// Move `order[source]` so it ends up at index `target`.
///
/// Both indices must be in `0..order.len()`. `source == target` returns the
/// original order unchanged.
pub fn move_item<K: Copy + fmt::Debug>(
    order: &[K],
    source: usize,
    target: usize,
) -> Result<Reordered<K>, OrderingError> {
    let len = order.len();
    for index in [source, target] {
        if index >= len {
            return Err(OrderingError::IndexOutOfRange { index, len });
        }
    }

    let mut next = order.to_vec();
    if source != target {
        let item = next.remove(source);
        next.insert(target, item);
    }
    Ok(Reordered::from_order(next))
}

/// Result of moving one element from one sequence into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transferred<K> {
    pub moved: K,
    pub source: Reordered<K>,
    pub target: Reordered<K>,
}

/// Take `source[from]` and insert it into `target` at `to`.
///
/// `from` must be in `0..source.len()`, `to` in `0..=target.len()`
/// (inserting at the end of a list is allowed).
pub fn transfer<K: Copy + fmt::Debug>(
    source: &[K],
    target: &[K],
    from: usize,
    to: usize,
) -> Result<Transferred<K>, OrderingError> {
    if from >= source.len() {
        return Err(OrderingError::IndexOutOfRange {
            index: from,
            len: source.len(),
        });
    }
    if to > target.len() {
        return Err(OrderingError::IndexOutOfRange {
            index: to,
            len: target.len(),
        });
    }

    let mut remaining = source.to_vec();
    let moved = remaining.remove(from);
    let mut receiving = target.to_vec();
    receiving.insert(to, moved);

    Ok(Transferred {
        moved,
        source: Reordered::from_order(remaining),
        target: Reordered::from_order(receiving),
    })
}

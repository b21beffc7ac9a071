//! Ordered sibling collection with an in-flight optimistic ledger.
//!
//! Each optimistic write records the exact pre-image it replaced. A failed
//! write is reverted against *its own* pre-image, never a global snapshot,
//! so a late failure cannot roll back over a newer optimistic change:
//!
//! ```text
//!   apply(op1)  [A,B,C] -> [B,A,C]     ledger: op1{pre=[A,B,C]}
//!   apply(op2)  [B,A,C] -> [B,C,A]     ledger: op1, op2{pre=[B,A,C]}
//!   revert(op1) visible state kept     ledger: op2{pre=[A,B,C]}
//!   revert(op2) -> [A,B,C]             ledger: empty
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::Positioned;

/// Identity of one optimistic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl OpId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        OpId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a revert did to visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertOutcome {
    /// The op was the newest in flight; its pre-image is visible again.
    Restored,
    /// Newer ops are still in flight; the pre-image was handed to the next one.
    Deferred,
    /// A newer op already confirmed (or the cache was refetched); nothing to undo.
    Superseded,
}

#[derive(Debug, Clone)]
struct InFlight<T> {
    op: OpId,
    pre_image: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct OrderedCollection<T> {
    items: Vec<T>,
    in_flight: Vec<InFlight<T>>,
}

impl<T> Default for OrderedCollection<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            in_flight: Vec::new(),
        }
    }
}

impl<T: Positioned + Clone> OrderedCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from store output, sorted stably by position.
    pub fn from_unsorted(items: Vec<T>) -> Self {
        let mut collection = Self {
            items,
            in_flight: Vec::new(),
        };
        collection.sort_by_position();
        collection
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<T::Id> {
        self.items.iter().map(|item| item.id()).collect()
    }

    pub fn index_of(&self, id: T::Id) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    pub fn contains(&self, id: T::Id) -> bool {
        self.index_of(id).is_some()
    }

    pub fn get(&self, id: T::Id) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    /// Replace everything with a fresh fetch. Outstanding ops lose their
    /// ability to revert: the refetched state is authoritative.
    pub fn replace_all(&mut self, items: Vec<T>) {
        self.items = items;
        self.sort_by_position();
        self.in_flight.clear();
    }

    /// Append unless an item with the same identity is already present.
    pub fn insert_if_absent(&mut self, item: T) -> bool {
        if self.contains(item.id()) {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Insert keeping position order; ties land after existing equals.
    pub fn insert_sorted(&mut self, item: T) -> bool {
        if self.contains(item.id()) {
            return false;
        }
        let at = self
            .items
            .iter()
            .position(|existing| existing.position() > item.position())
            .unwrap_or(self.items.len());
        self.items.insert(at, item);
        true
    }

    /// Patch the item in place. `f` returns whether ordering may have
    /// changed; if so the collection is re-sorted. `None` if absent.
    pub fn patch<F>(&mut self, id: T::Id, f: F) -> Option<bool>
    where
        F: FnOnce(&mut T) -> bool,
    {
        let item = self.items.iter_mut().find(|item| item.id() == id)?;
        let reorder = f(item);
        if reorder {
            self.sort_by_position();
        }
        Some(reorder)
    }

    pub fn remove(&mut self, id: T::Id) -> Option<T> {
        let index = self.index_of(id)?;
        Some(self.items.remove(index))
    }

    /// Stable sort: equal positions keep their current relative order.
    pub fn sort_by_position(&mut self) {
        self.items.sort_by_key(|item| item.position());
    }

    /// Replace visible state with `next`, recording the pre-image under `op`.
    pub fn apply_optimistic(&mut self, op: OpId, next: Vec<T>) {
        let pre_image = std::mem::replace(&mut self.items, next);
        self.in_flight.push(InFlight { op, pre_image });
    }

    /// The store accepted `op`. It and every older op become final.
    pub fn confirm(&mut self, op: OpId) -> bool {
        match self.in_flight.iter().position(|f| f.op == op) {
            Some(index) => {
                self.in_flight.drain(..=index);
                true
            }
            None => false,
        }
    }

    /// The store rejected `op`; undo it against its own pre-image.
    pub fn revert(&mut self, op: OpId) -> RevertOutcome {
        let Some(index) = self.in_flight.iter().position(|f| f.op == op) else {
            log::debug!("revert of {op:?} superseded by a newer confirm or refetch");
            return RevertOutcome::Superseded;
        };
        let failed = self.in_flight.remove(index);
        match self.in_flight.get_mut(index) {
            Some(newer) => {
                log::debug!("revert of {op:?} deferred to {:?}", newer.op);
                newer.pre_image = failed.pre_image;
                RevertOutcome::Deferred
            }
            None => {
                self.items = failed.pre_image;
                RevertOutcome::Restored
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn holds(&self, op: OpId) -> bool {
        self.in_flight.iter().any(|f| f.op == op)
    }

    /// The next newer op in flight after `op`, if `op` is held at all.
    pub fn successor(&self, op: OpId) -> Option<OpId> {
        let index = self.in_flight.iter().position(|f| f.op == op)?;
        self.in_flight.get(index + 1).map(|f| f.op)
    }

    /// Retire a failed `op` without touching visible state, leaving its
    /// pre-image to be restored if `heir` fails too. Used when the same op
    /// is still covered by `heir` in a sibling collection, so both sides
    /// stay in step.
    pub fn hand_off(&mut self, op: OpId, heir: OpId) -> RevertOutcome {
        let Some(index) = self.in_flight.iter().position(|f| f.op == op) else {
            return RevertOutcome::Superseded;
        };
        let failed = self.in_flight.remove(index);
        match self.in_flight.get_mut(index) {
            Some(newer) => newer.pre_image = failed.pre_image,
            None => self.in_flight.push(InFlight {
                op: heir,
                pre_image: failed.pre_image,
            }),
        }
        log::debug!("revert of {op:?} handed to {heir:?}");
        RevertOutcome::Deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoardId, List, ListId};

    fn list(id: i64, position: i64) -> List {
        List {
            id: ListId(id),
            title: format!("list-{id}"),
            board_id: BoardId(1),
            position,
        }
    }

    fn ids(c: &OrderedCollection<List>) -> Vec<i64> {
        c.items().iter().map(|l| l.id.0).collect()
    }

    fn abc() -> OrderedCollection<List> {
        OrderedCollection::from_unsorted(vec![list(1, 0), list(2, 1), list(3, 2)])
    }

    fn swapped(c: &OrderedCollection<List>, a: usize, b: usize) -> Vec<List> {
        let mut next = c.items().to_vec();
        next.swap(a, b);
        next
    }

    #[test]
    fn test_from_unsorted_stable() {
        let c = OrderedCollection::from_unsorted(vec![list(1, 5), list(2, 0), list(3, 5), list(4, 1)]);
        assert_eq!(ids(&c), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_insert_if_absent_dedupes() {
        let mut c = abc();
        assert!(!c.insert_if_absent(list(2, 9)));
        assert!(c.insert_if_absent(list(4, 9)));
        assert_eq!(ids(&c), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_single_revert_restores_exactly() {
        let mut c = abc();
        let op = OpId::next();
        let next = swapped(&c, 0, 1);
        c.apply_optimistic(op, next);
        assert_eq!(ids(&c), vec![2, 1, 3]);

        assert_eq!(c.revert(op), RevertOutcome::Restored);
        assert_eq!(ids(&c), vec![1, 2, 3]);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn test_older_failure_does_not_undo_newer_change() {
        let mut c = abc();
        let op1 = OpId::next();
        let next = swapped(&c, 0, 1);
        c.apply_optimistic(op1, next); // [2,1,3]
        let op2 = OpId::next();
        let next = swapped(&c, 1, 2);
        c.apply_optimistic(op2, next); // [2,3,1]

        assert_eq!(c.revert(op1), RevertOutcome::Deferred);
        assert_eq!(ids(&c), vec![2, 3, 1]);

        assert_eq!(c.revert(op2), RevertOutcome::Restored);
        assert_eq!(ids(&c), vec![1, 2, 3]);
    }

    #[test]
    fn test_newer_confirm_supersedes_older_revert() {
        let mut c = abc();
        let op1 = OpId::next();
        let next = swapped(&c, 0, 1);
        c.apply_optimistic(op1, next);
        let op2 = OpId::next();
        let next = swapped(&c, 1, 2);
        c.apply_optimistic(op2, next);

        assert!(c.confirm(op2));
        assert_eq!(c.revert(op1), RevertOutcome::Superseded);
        assert_eq!(ids(&c), vec![2, 3, 1]);
    }

    #[test]
    fn test_newer_failure_after_older_confirm() {
        let mut c = abc();
        let op1 = OpId::next();
        let next = swapped(&c, 0, 1);
        c.apply_optimistic(op1, next); // [2,1,3]
        let op2 = OpId::next();
        let next = swapped(&c, 1, 2);
        c.apply_optimistic(op2, next); // [2,3,1]

        assert!(c.confirm(op1));
        assert_eq!(c.revert(op2), RevertOutcome::Restored);
        assert_eq!(ids(&c), vec![2, 1, 3]);
    }

    #[test]
    fn test_refetch_clears_ledger() {
        let mut c = abc();
        let op = OpId::next();
        let next = swapped(&c, 0, 2);
        c.apply_optimistic(op, next);
        c.replace_all(vec![list(7, 0)]);
        assert_eq!(c.revert(op), RevertOutcome::Superseded);
        assert_eq!(ids(&c), vec![7]);
    }

    #[test]
    fn test_patch_resorts_on_move() {
        let mut c = abc();
        let moved = c
            .patch(ListId(1), |l| {
                l.position = 10;
                true
            })
            .unwrap();
        assert!(moved);
        assert_eq!(ids(&c), vec![2, 3, 1]);
        assert!(c.patch(ListId(99), |_| false).is_none());
    }

    #[test]
    fn test_hand_off_keeps_state_until_heir_resolves() {
        let mut c = abc();
        let op1 = OpId::next();
        let next = swapped(&c, 0, 1);
        c.apply_optimistic(op1, next); // [2,1,3]
        let heir = OpId::next();

        assert_eq!(c.hand_off(op1, heir), RevertOutcome::Deferred);
        assert_eq!(ids(&c), vec![2, 1, 3]);
        assert!(!c.holds(op1));
        assert!(c.holds(heir));

        assert_eq!(c.revert(heir), RevertOutcome::Restored);
        assert_eq!(ids(&c), vec![1, 2, 3]);
    }

    #[test]
    fn test_hand_off_confirmed_heir_keeps_state() {
        let mut c = abc();
        let op1 = OpId::next();
        let next = swapped(&c, 0, 1);
        c.apply_optimistic(op1, next);
        let heir = OpId::next();
        c.hand_off(op1, heir);

        assert!(c.confirm(heir));
        assert_eq!(ids(&c), vec![2, 1, 3]);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn test_successor() {
        let mut c = abc();
        let op1 = OpId::next();
        let next = swapped(&c, 0, 1);
        c.apply_optimistic(op1, next);
        assert_eq!(c.successor(op1), None);

        let op2 = OpId::next();
        let next = swapped(&c, 1, 2);
        c.apply_optimistic(op2, next);
        assert_eq!(c.successor(op1), Some(op2));
        assert_eq!(c.successor(OpId::next()), None);
    }

    #[test]
    fn test_insert_sorted() {
        let mut c = abc();
        assert!(c.insert_sorted(list(4, 1)));
        assert_eq!(ids(&c), vec![1, 2, 4, 3]);
    }
}

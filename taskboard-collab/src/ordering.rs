//! Dense renumbering of columns and tasks.
//!
//! Every sibling list (columns of a project, tasks of a column) keeps its
//! `order` values at exactly `1..=N`. A move takes the entity out of the
//! list, re-inserts it at the requested 1-based slot and renumbers the
//! whole list by position; a delete only renumbers.
//!
//! ```text
//! siblings (sorted)  A=1  B=2  C=3        move D to 2
//!                     │    ╲    ╲
//! new list           A=1  D=2  B=3  C=4   changed = [D, B, C]
//! ```
//!
//! Only entities whose `order` actually changed are reported, so callers
//! write the minimum and a repeated move is a no-op.

use crate::model::{Column, Task};

/// An entity with an identity and a position among its siblings.
pub trait Ordered {
    fn key(&self) -> i64;
    fn order(&self) -> i64;
    fn set_order(&mut self, order: i64);
}

impl Ordered for Column {
    fn key(&self) -> i64 {
        self.id
    }

    fn order(&self) -> i64 {
        self.order
    }

    fn set_order(&mut self, order: i64) {
        self.order = order;
    }
}

impl Ordered for Task {
    fn key(&self) -> i64 {
        self.id
    }

    fn order(&self) -> i64 {
        self.order
    }

    fn set_order(&mut self, order: i64) {
        self.order = order;
    }
}

/// Result of a renumbering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Renumbered<T> {
    /// Full list in its new order, `order` fields already rewritten
    pub items: Vec<T>,
    /// Keys of the entities whose `order` differs from before
    pub changed: Vec<i64>,
}

impl<T: Ordered> Renumbered<T> {
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn was_changed(&self, key: i64) -> bool {
        self.changed.contains(&key)
    }

    /// Entities that need to be written back.
    pub fn changed_items(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter(move |item| self.was_changed(item.key()))
    }

    pub fn get(&self, key: i64) -> Option<&T> {
        self.items.iter().find(|item| item.key() == key)
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Sort by `order`, ties broken by key.
pub fn sort_siblings<T: Ordered>(items: &mut [T]) {
    items.sort_by_key(|item| (item.order(), item.key()));
}

/// Clamp a requested 1-based position into `1..=sibling_count + 1`.
pub fn clamp_position(requested: i64, sibling_count: usize) -> usize {
    let last = sibling_count as i64 + 1;
    requested.clamp(1, last) as usize
}

/// Insert `entity` at `requested` among `siblings` and renumber everything.
///
/// Out-of-range positions are clamped, never rejected. A sibling sharing
/// the entity's key is discarded so a stale list cannot duplicate it.
pub fn reorder<T: Ordered>(entity: T, mut siblings: Vec<T>, requested: i64) -> Renumbered<T> {
    siblings.retain(|sibling| sibling.key() != entity.key());
    sort_siblings(&mut siblings);
    let position = clamp_position(requested, siblings.len());
    siblings.insert(position - 1, entity);
    renumber(siblings)
}

/// Close the gaps left by a removal.
pub fn compact<T: Ordered>(mut siblings: Vec<T>) -> Renumbered<T> {
    sort_siblings(&mut siblings);
    renumber(siblings)
}

fn renumber<T: Ordered>(mut items: Vec<T>) -> Renumbered<T> {
    let mut changed = Vec::new();
    for (index, item) in items.iter_mut().enumerate() {
        let order = index as i64 + 1;
        if item.order() != order {
            item.set_order(order);
            changed.push(item.key());
        }
    }
    Renumbered { items, changed }
}

//! Replicated character sequence (RGA).
//!
//! Elements are kept in document order, tombstones included. A new element
//! is placed right after its origin, skipping every element with a larger
//! `(clock, actor)` key:
//!
//! ```text
//! origin ─┬─ "dog" (clock 1, actor B)   larger key, skipped
//!         └─ "cat" (clock 1, actor A)   inserted here
//! ```
//!
//! Because a child always carries a larger clock than its origin, the
//! resulting order is the depth-first walk of the origin tree with siblings
//! sorted by descending key, whatever order the elements arrived in.
//!
//! Reference: Roh et al., Replicated abstract data types (2011)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::op::ElemId;

/// One character, possibly tombstoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElemId,
    pub origin: Option<ElemId>,
    pub value: char,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Sequence {
    elements: Vec<Element>,
    ids: HashSet<ElemId>,
    visible: usize,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from elements already in document order.
    pub fn from_elements(elements: Vec<Element>) -> Self {
        let ids = elements.iter().map(|e| e.id).collect();
        let visible = elements.iter().filter(|e| !e.deleted).count();
        Self { elements, ids, visible }
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn contains(&self, id: &ElemId) -> bool {
        self.ids.contains(id)
    }

    fn position(&self, id: &ElemId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.elements.iter().position(|e| e.id == *id)
    }

    /// Integrate an element. Returns `false` if it is already present or
    /// its origin is unknown; the sequence is untouched in both cases.
    pub fn integrate(&mut self, element: Element) -> bool {
        if self.contains(&element.id) {
            return false;
        }
        let mut idx = match element.origin {
            None => 0,
            Some(origin) => match self.position(&origin) {
                Some(pos) => pos + 1,
                None => return false,
            },
        };
        while idx < self.elements.len() && self.elements[idx].id > element.id {
            idx += 1;
        }
        if !element.deleted {
            self.visible += 1;
        }
        self.ids.insert(element.id);
        self.elements.insert(idx, element);
        true
    }

    /// Tombstone an element. Returns `true` if it was visible.
    pub fn delete(&mut self, id: &ElemId) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let element = &mut self.elements[pos];
        if element.deleted {
            return false;
        }
        element.deleted = true;
        self.visible -= 1;
        true
    }

    /// Visible character count.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Total element count including tombstones.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Id of the `index`-th visible character.
    pub fn visible_id_at(&self, index: usize) -> Option<ElemId> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .nth(index)
            .map(|e| e.id)
    }

    /// Ids of `len` visible characters starting at `index`.
    pub fn visible_range(&self, index: usize, len: usize) -> Vec<ElemId> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .skip(index)
            .take(len)
            .map(|e| e.id)
            .collect()
    }

    /// Materialized text.
    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.value)
            .collect()
    }
}

//! Selection state shared by the views of one session.

use crate::events::{SubscriptionId, Subscribers};
use crate::id::ObjectId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionChanged {
    pub selection: Vec<ObjectId>,
}

/// Ordered set of selected object ids.
#[derive(Debug, Default)]
pub struct SelectionContext {
    selected: Vec<ObjectId>,
    listeners: Subscribers<SelectionChanged>,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_change(
        &mut self,
        callback: impl FnMut(&SelectionChanged) + Send + 'static,
    ) -> SubscriptionId {
        self.listeners.subscribe(callback)
    }

    pub fn remove_listener(&mut self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Replace the selection with a single id.
    pub fn set(&mut self, id: ObjectId) {
        if self.selected.len() == 1 && self.selected[0] == id {
            return;
        }
        self.selected = vec![id];
        self.fire();
    }

    pub fn add(&mut self, id: ObjectId) {
        if self.selected.contains(&id) {
            return;
        }
        self.selected.push(id);
        self.fire();
    }

    pub fn remove(&mut self, id: &ObjectId) {
        let before = self.selected.len();
        self.selected.retain(|s| s != id);
        if self.selected.len() != before {
            self.fire();
        }
    }

    pub fn clear(&mut self) {
        if self.selected.is_empty() {
            return;
        }
        self.selected.clear();
        self.fire();
    }

    pub fn selection(&self) -> &[ObjectId] {
        &self.selected
    }

    /// Most recently selected id.
    pub fn primary(&self) -> Option<&ObjectId> {
        self.selected.last()
    }

    pub fn is_selected(&self, id: &ObjectId) -> bool {
        self.selected.contains(id)
    }

    fn fire(&mut self) {
        let event = SelectionChanged {
            selection: self.selected.clone(),
        };
        self.listeners.emit(&event);
    }
}

//! Linear undo/redo over recorded operations.
//!
//! ```text
//!   submit(op) ──► open unit ──boundary()/quiet window──► done ──undo()──► undone
//!                                                          ▲                │
//!                                                          └─────redo()─────┘
//! ```
//!
//! Undo applies inverse operations, last-first, through the same sink the
//! edits went through, tagged [`Origin::Undo`], so they replicate like
//! any other edit. Array positions are looked up again at application
//! time instead of trusting indices recorded earlier.

use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::GraphError;
use crate::graph::{DocGraph, OperationSink};
use crate::id::ObjectId;
use crate::operation::{Operation, Origin};

/// Undo queue configuration.
#[derive(Debug, Clone)]
pub struct UndoConfig {
    /// Close the open unit when no op was submitted for this long.
    /// `None` = only explicit `boundary()` calls close units.
    pub merge_window: Option<Duration>,
    /// Maximum undoable units kept (oldest dropped first).
    pub max_units: usize,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            merge_window: Some(Duration::from_millis(500)),
            max_units: 500,
        }
    }
}

impl UndoConfig {
    /// Explicit boundaries only, so tests do not depend on timing.
    pub fn for_testing() -> Self {
        Self {
            merge_window: None,
            max_units: 64,
        }
    }
}

/// One user-visible action: a contiguous run of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UndoUnit {
    ops: Vec<Operation>,
}

impl UndoUnit {
    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug)]
pub struct UndoQueue {
    config: UndoConfig,
    done: VecDeque<UndoUnit>,
    undone: Vec<UndoUnit>,
    open: UndoUnit,
    last_submit: Option<Instant>,
}

impl Default for UndoQueue {
    fn default() -> Self {
        Self::new(UndoConfig::default())
    }
}

impl UndoQueue {
    pub fn new(config: UndoConfig) -> Self {
        Self {
            config,
            done: VecDeque::new(),
            undone: Vec::new(),
            open: UndoUnit::default(),
            last_submit: None,
        }
    }

    /// Record a forward operation into the open unit.
    ///
    /// Any new operation invalidates the redo stack.
    pub fn submit(&mut self, op: Operation) {
        if !self.undone.is_empty() {
            log::debug!("discarding {} redo units", self.undone.len());
            self.undone.clear();
        }
        if let (Some(window), Some(last)) = (self.config.merge_window, self.last_submit) {
            if last.elapsed() > window {
                self.close_unit();
            }
        }
        self.open.ops.push(op);
        self.last_submit = Some(Instant::now());
    }

    /// Close the open unit; the next submit starts a new one.
    pub fn boundary(&mut self) {
        self.close_unit();
    }

    pub fn can_undo(&self) -> bool {
        !self.done.is_empty() || !self.open.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.done.len() + usize::from(!self.open.is_empty())
    }

    pub fn redo_depth(&self) -> usize {
        self.undone.len()
    }

    pub fn clear(&mut self) {
        self.done.clear();
        self.undone.clear();
        self.open = UndoUnit::default();
        self.last_submit = None;
    }

    /// Revert the most recent unit. `Ok(false)` when there is nothing to undo.
    ///
    /// A unit is reverted whole or not at all: if any inverse fails, the
    /// graph is left untouched and the unit is dropped.
    pub fn undo<S: OperationSink + ?Sized>(&mut self, sink: &mut S) -> Result<bool, GraphError> {
        self.close_unit();
        let Some(unit) = self.done.pop_back() else {
            return Ok(false);
        };
        let steps = plan(sink.graph(), unit.ops.iter().rev(), invert).map_err(|e| {
            log::warn!("undo aborted, unit dropped: {e}");
            e
        })?;
        for step in steps {
            sink.apply(step, Origin::Undo)?;
        }
        self.undone.push(unit);
        Ok(true)
    }

    /// Re-apply the most recently undone unit. `Ok(false)` when empty.
    pub fn redo<S: OperationSink + ?Sized>(&mut self, sink: &mut S) -> Result<bool, GraphError> {
        let Some(unit) = self.undone.pop() else {
            return Ok(false);
        };
        let steps = plan(sink.graph(), unit.ops.iter(), reapply).map_err(|e| {
            log::warn!("redo aborted, unit dropped: {e}");
            e
        })?;
        for step in steps {
            sink.apply(step, Origin::Redo)?;
        }
        self.push_done(unit);
        Ok(true)
    }

    fn close_unit(&mut self) {
        if !self.open.is_empty() {
            let unit = std::mem::take(&mut self.open);
            self.push_done(unit);
        }
    }

    fn push_done(&mut self, unit: UndoUnit) {
        self.done.push_back(unit);
        while self.done.len() > self.config.max_units {
            self.done.pop_front();
        }
    }
}

type Derive = fn(&Operation, &DocGraph) -> Result<Option<Operation>, GraphError>;

/// Derive and trial-apply every step on a fork of `graph`.
fn plan<'a>(
    graph: &DocGraph,
    ops: impl Iterator<Item = &'a Operation>,
    derive: Derive,
) -> Result<Vec<Operation>, GraphError> {
    let mut scratch = graph.fork();
    let mut steps = Vec::new();
    for op in ops {
        if let Some(step) = derive(op, &scratch)? {
            scratch.apply(step.clone(), Origin::Replay)?;
            steps.push(step);
        }
    }
    Ok(steps)
}

/// Current position of `value` in `array`, preferring `hint` when it still matches.
fn locate(graph: &DocGraph, array: &ObjectId, value: &Value, hint: Option<usize>) -> Option<usize> {
    if let Some(i) = hint {
        if graph.element_at(array, i) == Some(value) {
            return Some(i);
        }
    }
    graph.index_of(array, value)
}

/// Operation that reverts `op`. Creations have no inverse.
fn invert(op: &Operation, graph: &DocGraph) -> Result<Option<Operation>, GraphError> {
    let inverse = match op {
        Operation::CreateObject { .. } | Operation::CreateArray { .. } => None,
        Operation::SetProperty {
            object,
            name,
            previous,
            ..
        } => Some(Operation::set_property(
            object.clone(),
            name.clone(),
            previous.clone(),
            graph.property(object, name).cloned(),
        )),
        Operation::InsertElement {
            object,
            after,
            value,
            index,
        } => {
            let hint = match (index, after) {
                (Some(i), _) => Some(*i),
                (None, Some(after)) => graph.index_of(object, after).map(|i| i + 1),
                (None, None) => Some(0),
            };
            let index = locate(graph, object, value, hint).ok_or_else(|| {
                GraphError::MissingElement {
                    array: object.clone(),
                    element: value.clone(),
                }
            })?;
            Some(Operation::remove_element(object.clone(), index, Some(value.clone())))
        }
        Operation::RemoveElement {
            object,
            index,
            value,
        } => {
            let Some(value) = value else {
                log::warn!("remove on {object} carries no value, cannot invert");
                return Ok(None);
            };
            let len = graph
                .array_len(object)
                .ok_or_else(|| GraphError::MissingArray(object.clone()))?;
            let at = (*index).min(len);
            let after = at
                .checked_sub(1)
                .and_then(|i| graph.element_at(object, i))
                .cloned();
            Some(Operation::insert_element_at(object.clone(), after, value.clone(), at))
        }
    };
    Ok(inverse)
}

/// Operation that re-does `op` against the current graph.
fn reapply(op: &Operation, graph: &DocGraph) -> Result<Option<Operation>, GraphError> {
    let forward = match op {
        Operation::CreateObject { .. } | Operation::CreateArray { .. } => None,
        Operation::SetProperty {
            object,
            name,
            value,
            ..
        } => Some(Operation::set_property(
            object.clone(),
            name.clone(),
            value.clone(),
            graph.property(object, name).cloned(),
        )),
        Operation::InsertElement { .. } => Some(op.clone()),
        Operation::RemoveElement {
            object,
            index,
            value,
        } => {
            let index = match value {
                Some(v) => locate(graph, object, v, Some(*index)).ok_or_else(|| {
                    GraphError::MissingElement {
                        array: object.clone(),
                        element: v.clone(),
                    }
                })?,
                None => *index,
            };
            Some(Operation::remove_element(object.clone(), index, value.clone()))
        }
    };
    Ok(forward)
}

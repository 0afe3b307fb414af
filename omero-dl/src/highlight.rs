//! Completion state of explorer nodes relative to the download queue.

use std::collections::HashMap;

use crate::hierarchy::{NodeId, Tree};
use crate::queue::QueueTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Highlight {
    #[default]
    None,
    Partial,
    Full,
}

impl Highlight {
    pub fn marker(self) -> &'static str {
        match self {
            Highlight::None => "[ ]",
            Highlight::Partial => "[~]",
            Highlight::Full => "[x]",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Highlights {
    states: HashMap<NodeId, Highlight>,
}

impl Highlights {
    /// Nodes never reconciled read as `None`.
    pub fn get(&self, node: NodeId) -> Highlight {
        self.states.get(&node).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn count(&self, state: Highlight) -> usize {
        self.states.values().filter(|value| **value == state).count()
    }
}

/// Assigns a state to every explorer node, bottom-up per project.
///
/// A leaf is `Full` when its identity is queued. An inner node is `Full`
/// only when every child is `Full`, `None` when no child is, and `Partial`
/// otherwise; a partial child therefore never counts as included.
pub fn reconcile(explorer: &Tree, queue: &QueueTree) -> Highlights {
    let mut highlights = Highlights::default();
    for project in explorer.roots() {
        visit(explorer, queue, *project, &mut highlights);
    }
    highlights
}

fn visit(explorer: &Tree, queue: &QueueTree, node: NodeId, out: &mut Highlights) -> Highlight {
    let Some(current) = explorer.get(node) else {
        return Highlight::None;
    };

    let state = if current.is_leaf() {
        if queue.contains(current.entity()) {
            Highlight::Full
        } else {
            Highlight::None
        }
    } else {
        let total = current.children().len();
        let mut full = 0;
        let mut touched = 0;
        for child in current.children() {
            match visit(explorer, queue, *child, out) {
                Highlight::Full => {
                    full += 1;
                    touched += 1;
                }
                Highlight::Partial => touched += 1,
                Highlight::None => {}
            }
        }
        if full == total {
            Highlight::Full
        } else if full > 0 || touched > 0 {
            Highlight::Partial
        } else {
            Highlight::None
        }
    };
    out.states.insert(node, state);
    state
}

//! Window tokens - completion tracking for cohorts of sibling contexts
//!
//! A [`WindowToken`] is opened for every `start` call and seeded with the ids of the
//! contexts that call spawned. Each time a context is replaced by its successors the
//! window is rebound: the old id leaves `todo`, the new ids join it. A context that
//! resolves without successors simply leaves. Accumulator nodes call
//! [`WindowToken::try_fire`] once they have consumed their inputs; the window fires when
//! nothing is left to do, and it fires at most once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Cohort tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowToken {
    /// Window id
    pub id: String,

    /// Every id ever added
    pub origin: BTreeSet<String>,

    /// Ids not yet resolved
    pub todo: BTreeSet<String>,

    /// Whether the window has fired
    pub fired: bool,
}

impl WindowToken {
    /// Open an empty window
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin: BTreeSet::new(),
            todo: BTreeSet::new(),
            fired: false,
        }
    }

    /// Open a window seeded with `ids` as both origin and todo
    pub fn seeded<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut window = Self::new();
        for id in ids {
            window.add(id);
        }
        window
    }

    /// Track a new item
    pub fn add(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.origin.insert(id.clone());
        self.todo.insert(id);
    }

    /// Resolve an item; returns whether it was outstanding
    pub fn remove(&mut self, id: &str) -> bool {
        self.todo.remove(id)
    }

    /// Replace `removed` by `added` in one step
    pub fn rebind(&mut self, removed: &[String], added: &[String]) {
        for id in added {
            self.add(id.clone());
        }
        for id in removed {
            self.remove(id);
        }
    }

    /// Fire the window if nothing is left to do
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn try_fire(&mut self) -> bool {
        if self.fired || !self.todo.is_empty() {
            return false;
        }
        self.fired = true;
        true
    }

    /// Whether every outstanding item is among `ids`
    pub fn is_covered_by<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> bool {
        let present: BTreeSet<&String> = ids.into_iter().collect();
        !self.todo.is_empty() && self.todo.iter().all(|id| present.contains(id))
    }
}

impl Default for WindowToken {
    fn default() -> Self {
        Self::new()
    }
}

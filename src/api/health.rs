//! Shared counters for the /health endpoint.
//! Updated by the decorator and the balance watcher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Engine activity counters. Written by session tasks, read by the API.
#[derive(Default)]
pub struct StatusBoard {
    /// Reconciliation passes completed.
    pub passes: AtomicU64,
    /// Items currently carrying at least one decoration.
    pub decorated_items: AtomicU64,
    pub decorations_attached: AtomicU64,
    pub decorations_removed: AtomicU64,
    /// Per-item decoration failures; never abort a pass.
    pub item_failures: AtomicU64,
    /// True while the balance decoration is attached.
    pub balance_attached: AtomicBool,
    pub balance_renders: AtomicU64,
    pub balance_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusSnapshot {
    pub passes: u64,
    pub decorated_items: u64,
    pub decorations_attached: u64,
    pub decorations_removed: u64,
    pub item_failures: u64,
    pub balance_attached: bool,
    pub balance_renders: u64,
    pub balance_errors: u64,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_passes(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_decorated_items(&self, n: usize) {
        self.decorated_items.store(n as u64, Ordering::Relaxed);
    }

    pub fn add_attached(&self, n: usize) {
        self.decorations_attached.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_removed(&self, n: usize) {
        self.decorations_removed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_item_failures(&self, n: usize) {
        self.item_failures.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn set_balance_attached(&self, v: bool) {
        self.balance_attached.store(v, Ordering::Relaxed);
    }

    pub fn inc_balance_renders(&self) {
        self.balance_renders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_balance_errors(&self) {
        self.balance_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            decorated_items: self.decorated_items.load(Ordering::Relaxed),
            decorations_attached: self.decorations_attached.load(Ordering::Relaxed),
            decorations_removed: self.decorations_removed.load(Ordering::Relaxed),
            item_failures: self.item_failures.load(Ordering::Relaxed),
            balance_attached: self.balance_attached.load(Ordering::Relaxed),
            balance_renders: self.balance_renders.load(Ordering::Relaxed),
            balance_errors: self.balance_errors.load(Ordering::Relaxed),
        }
    }
}

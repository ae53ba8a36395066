//! In-memory hint map of mounted snapshots.
//!
//! Purely an optimization for idempotency checks; the kernel mount table
//! queried through [`crate::mountinfo`] stays authoritative.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MountTracker {
    mounted: Mutex<HashSet<String>>,
}

impl MountTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mounted(&self, id: &str) {
        self.mounted.lock().unwrap().insert(id.to_string());
    }

    pub fn set_unmounted(&self, id: &str) {
        self.mounted.lock().unwrap().remove(id);
    }

    pub fn is_mounted(&self, id: &str) -> bool {
        self.mounted.lock().unwrap().contains(id)
    }

    pub fn clear(&self) {
        self.mounted.lock().unwrap().clear();
    }
}

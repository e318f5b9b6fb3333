//! Process-wide mapping from callsite identity to format descriptor.
//!
//! Producers append descriptors under a mutex, exactly once per callsite;
//! the returned `log_id` is the registration index and stays stable for the
//! process lifetime. The consumer never takes the mutex per record: it keeps
//! a private shadow of the registry that it grows on demand whenever a
//! record references an id beyond the shadow's length.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::format::{StaticLogInfo, UNREGISTERED_LOG_ID};

/// Append-only descriptor registry shared by all producers.
pub struct LogRegistry {
    registered_info: Mutex<Vec<Arc<StaticLogInfo>>>,
}

impl LogRegistry {
    pub fn new() -> LogRegistry {
        LogRegistry {
            registered_info: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callsite's descriptor and stores the assigned id into
    /// `slot`. Idempotent: when the slot already carries an id, the existing
    /// entry is returned and `info` is discarded.
    pub fn register(&self, slot: &AtomicI32, info: StaticLogInfo) -> (i32, Arc<StaticLogInfo>) {
        let mut registered = self.registered_info.lock().unwrap();

        let existing = slot.load(Ordering::Relaxed);
        if existing != UNREGISTERED_LOG_ID {
            return (existing, registered[existing as usize].clone());
        }

        let log_id = registered.len() as i32;
        let entry = Arc::new(info);
        registered.push(entry.clone());
        slot.store(log_id, Ordering::Release);
        (log_id, entry)
    }

    pub fn len(&self) -> usize {
        self.registered_info.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every entry beyond `shadow`'s current length into it.
    fn copy_new_entries(&self, shadow: &mut Vec<Arc<StaticLogInfo>>) {
        let registered = self.registered_info.lock().unwrap();
        for entry in registered.iter().skip(shadow.len()) {
            shadow.push(entry.clone());
        }
    }
}

impl Default for LogRegistry {
    fn default() -> LogRegistry {
        LogRegistry::new()
    }
}

/// Consumer-private snapshot of the registry. Lookups after a refresh touch
/// no lock.
pub struct ShadowRegistry {
    entries: Vec<Arc<StaticLogInfo>>,
}

impl ShadowRegistry {
    pub fn new() -> ShadowRegistry {
        ShadowRegistry { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, log_id: u64) -> Option<&Arc<StaticLogInfo>> {
        self.entries.get(log_id as usize)
    }

    /// Grows the shadow from the shared registry under its mutex.
    pub fn refresh(&mut self, registry: &LogRegistry) {
        registry.copy_new_entries(&mut self.entries);
    }
}

impl Default for ShadowRegistry {
    fn default() -> ShadowRegistry {
        ShadowRegistry::new()
    }
}

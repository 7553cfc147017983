//! Mutation observation shared by page hosts.
//!
//! A host owns an [`ObserverRegistry`] and reports every document change to it; callers hold a
//! [`MutationObserver`] that yields the records matching the options they registered with.
//! Disconnecting is idempotent and also happens on drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

/// Which kinds of change an observer wants to hear about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveOptions {
    /// Nodes added to or removed from a target.
    pub child_list: bool,
    /// Attribute writes on a target.
    pub attributes: bool,
    /// Extend observation from the document element to all of its descendants.
    pub subtree: bool,
}

impl ObserveOptions {
    /// Child-list changes anywhere under the document element.
    pub fn child_list_subtree() -> Self {
        Self {
            child_list: true,
            attributes: false,
            subtree: true,
        }
    }
}

/// A single document change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRecord {
    /// Children were inserted or removed.
    ChildList {
        /// True when the changed node is a descendant of the document element rather than the
        /// document element itself.
        nested: bool,
    },
    /// An attribute was written.
    Attributes {
        /// Attribute name.
        name: String,
        /// True when the element is a descendant of the document element.
        nested: bool,
    },
}

impl MutationRecord {
    fn is_observed_by(&self, options: &ObserveOptions) -> bool {
        let (wanted, nested) = match self {
            Self::ChildList { nested } => (options.child_list, *nested),
            Self::Attributes { nested, .. } => (options.attributes, *nested),
        };
        wanted && (options.subtree || !nested)
    }
}

struct ObserverEntry {
    id: u64,
    options: ObserveOptions,
    sender: mpsc::UnboundedSender<MutationRecord>,
}

/// Fan-out point for document mutations.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<ObserverEntry>>,
}

impl ObserverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new observer.
    pub fn register(self: &Arc<Self>, options: ObserveOptions) -> MutationObserver {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.entries().push(ObserverEntry {
            id,
            options,
            sender,
        });
        MutationObserver {
            id,
            records: receiver,
            registry: Arc::downgrade(self),
            connected: true,
        }
    }

    /// Delivers `record` to every connected observer whose options match it.
    pub fn notify(&self, record: &MutationRecord) {
        self.entries().retain(|entry| {
            if !record.is_observed_by(&entry.options) {
                return !entry.sender.is_closed();
            }
            entry.sender.send(record.clone()).is_ok()
        });
    }

    /// Number of observers still connected.
    pub fn active(&self) -> usize {
        self.entries().len()
    }

    fn remove(&self, id: u64) {
        self.entries().retain(|entry| entry.id != id);
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ObserverEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a registered observer.
pub struct MutationObserver {
    id: u64,
    records: mpsc::UnboundedReceiver<MutationRecord>,
    registry: Weak<ObserverRegistry>,
    connected: bool,
}

impl MutationObserver {
    /// Waits for the next matching record; `None` once disconnected or the host is gone.
    pub async fn next_record(&mut self) -> Option<MutationRecord> {
        if !self.connected {
            return None;
        }
        self.records.recv().await
    }

    /// Stops delivery. Returns `true` only for the call that actually disconnected.
    pub fn disconnect(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.connected = false;
        self.records.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        true
    }

    /// Whether records are still being delivered.
    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for MutationObserver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

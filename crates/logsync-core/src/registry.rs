//! Tracker registry
//!
//! Owns the one [`TopicLogTracker`] per topic of a storage root. Trackers are
//! created lazily on first reference; creation and removal are announced to
//! registered [`TrackerEventListener`]s outside of any lock.

use crate::Result;
use crate::storage::LogStorage;
use crate::tracker::TopicLogTracker;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Observer of topics appearing and disappearing
pub trait TrackerEventListener: Send + Sync {
    /// A tracker was created for `tracker.topic()`
    fn on_new_topic(&self, tracker: &Arc<TopicLogTracker>);

    /// A tracker was removed
    fn on_remove_topic(&self, tracker: &Arc<TopicLogTracker>);
}

/// Per-process set of topic trackers
pub struct TrackerRegistry {
    storage: LogStorage,
    trackers: DashMap<String, Arc<TopicLogTracker>>,
    listeners: RwLock<Vec<Arc<dyn TrackerEventListener>>>,
}

impl std::fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("root", &self.storage.root())
            .field("trackers", &self.trackers.len())
            .finish()
    }
}

impl TrackerRegistry {
    /// Create an empty registry over `storage`
    pub fn new(storage: LogStorage) -> Self {
        Self {
            storage,
            trackers: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Storage backing the registry
    pub fn storage(&self) -> &LogStorage {
        &self.storage
    }

    /// Register a topic lifecycle listener
    pub fn add_listener(&self, listener: Arc<dyn TrackerEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Tracker for `topic`, created and loaded on first use
    pub fn get(&self, topic: &str) -> Result<Arc<TopicLogTracker>> {
        if let Some(tracker) = self.trackers.get(topic) {
            return Ok(tracker.clone());
        }

        let tracker = match self.trackers.entry(topic.to_string()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                LogStorage::validate_topic(topic)?;
                let tracker = TopicLogTracker::open(topic, self.storage.topic_dir(topic))?;
                entry.insert(tracker.clone());
                tracker
            }
        };

        tracing::debug!(topic, max_offset = tracker.max_offset(), "tracker created");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_new_topic(&tracker);
        }
        Ok(tracker)
    }

    /// Tracker for `topic` if it was already created
    pub fn peek(&self, topic: &str) -> Option<Arc<TopicLogTracker>> {
        self.trackers.get(topic).map(|t| t.clone())
    }

    /// Forget `topic`, dropping its cursors and listeners
    pub fn remove(&self, topic: &str) -> Option<Arc<TopicLogTracker>> {
        let (_, tracker) = self.trackers.remove(topic)?;
        tracker.close();

        tracing::debug!(topic, "tracker removed");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_remove_topic(&tracker);
        }
        Some(tracker)
    }

    /// Topics with a directory in storage
    pub fn topic_ids(&self) -> Result<BTreeSet<String>> {
        self.storage.topic_ids()
    }

    /// Trackers created so far
    pub fn trackers(&self) -> Vec<Arc<TopicLogTracker>> {
        self.trackers.iter().map(|t| t.value().clone()).collect()
    }
}

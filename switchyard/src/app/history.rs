use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde_derive::Serialize;
use tokio::sync::broadcast;

/// Last probe outcome of one real outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    pub time: SystemTime,
    /// Milliseconds, 0 when the probe failed.
    pub delay: u16,
    /// Empty on success.
    pub err: String,
}

impl History {
    pub fn success(delay: u16) -> Self {
        History {
            time: SystemTime::now(),
            delay,
            err: String::new(),
        }
    }

    pub fn failure(err: String) -> Self {
        History {
            time: SystemTime::now(),
            delay: 0,
            err,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub delay: u16,
    pub err: String,
}

impl From<&History> for ProbeResult {
    fn from(h: &History) -> Self {
        ProbeResult {
            delay: h.delay,
            err: h.err.clone(),
        }
    }
}

/// Shared store of probe results, keyed by real outbound tag. Every write
/// publishes the affected tag to subscribers.
pub struct HistoryStorage {
    entries: RwLock<HashMap<String, History>>,
    notify: broadcast::Sender<String>,
}

impl Default for HistoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStorage {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(64);
        HistoryStorage {
            entries: RwLock::new(HashMap::new()),
            notify,
        }
    }

    pub fn load(&self, tag: &str) -> Option<History> {
        self.entries.read().get(tag).cloned()
    }

    pub fn store(&self, tag: &str, history: History) {
        self.entries.write().insert(tag.to_string(), history);
        let _ = self.notify.send(tag.to_string());
    }

    pub fn delete(&self, tag: &str) {
        if self.entries.write().remove(tag).is_some() {
            let _ = self.notify.send(tag.to_string());
        }
    }

    /// Forgets a recorded failure after the outbound proved usable again.
    pub fn clear_error(&self, tag: &str) {
        let changed = {
            let mut entries = self.entries.write();
            match entries.get_mut(tag) {
                Some(h) if !h.err.is_empty() => {
                    if h.delay == 0 {
                        entries.remove(tag);
                    } else {
                        h.err.clear();
                    }
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self.notify.send(tag.to_string());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }

    pub fn snapshot(&self) -> HashMap<String, History> {
        self.entries.read().clone()
    }
}

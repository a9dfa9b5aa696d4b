use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};

/// A change made by another client sharing the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedStoreEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Receives the changes other clients make to a shared store.
#[derive(Clone)]
pub struct SharedStoreSubscription {
    receiver: Receiver<SharedStoreEvent>,
}

impl SharedStoreSubscription {
    pub fn new(receiver: Receiver<SharedStoreEvent>) -> Self {
        Self { receiver }
    }

    /// Waits for the next change. Returns `None` once the store is gone.
    pub async fn next(&self) -> Option<SharedStoreEvent> {
        self.receiver.recv().await.ok()
    }

    pub fn try_next(&self) -> Option<SharedStoreEvent> {
        self.receiver.try_recv().ok()
    }
}

/// String key/value storage visible to every client of the same database,
/// with change notifications delivered to all clients except the writer.
pub trait SharedStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    fn remove(&self, key: &str);

    /// Writes `value` (or removes the key for `None`) only when the current
    /// value equals `expected`. Returns whether the write happened.
    fn compare_and_set(&self, key: &str, expected: Option<&str>, value: Option<String>) -> bool;

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    fn subscribe(&self) -> SharedStoreSubscription;
}

struct Subscriber {
    origin: u64,
    sender: Sender<SharedStoreEvent>,
}

#[derive(Default)]
struct SharedArea {
    entries: BTreeMap<String, String>,
    subscribers: Vec<Subscriber>,
}

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

/// Process-local shared store. Every handle obtained through `connect` acts as
/// a separate client: its own writes are not echoed back to its subscriptions.
pub struct InMemorySharedStore {
    origin: u64,
    area: Arc<Mutex<SharedArea>>,
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self {
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
            area: Arc::new(Mutex::new(SharedArea::default())),
        }
    }

    /// Another client's handle onto the same storage area.
    pub fn connect(&self) -> Self {
        Self {
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
            area: self.area.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedArea> {
        self.area
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, area: &mut SharedArea, key: &str, value: Option<String>) {
        let old_value = match &value {
            Some(value) => area.entries.insert(key.to_string(), value.clone()),
            None => area.entries.remove(key),
        };
        if old_value == value {
            return;
        }
        let event = SharedStoreEvent {
            key: key.to_string(),
            old_value,
            new_value: value,
        };
        let origin = self.origin;
        area.subscribers.retain(|subscriber| {
            if subscriber.origin == origin {
                return !subscriber.sender.is_closed();
            }
            subscriber.sender.try_send(event.clone()).is_ok()
        });
    }
}

impl SharedStore for InMemorySharedStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut area = self.lock();
        self.write(&mut area, key, Some(value));
    }

    fn remove(&self, key: &str) {
        let mut area = self.lock();
        self.write(&mut area, key, None);
    }

    fn compare_and_set(&self, key: &str, expected: Option<&str>, value: Option<String>) -> bool {
        let mut area = self.lock();
        if area.entries.get(key).map(String::as_str) != expected {
            return false;
        }
        self.write(&mut area, key, value);
        true
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn subscribe(&self) -> SharedStoreSubscription {
        let (sender, receiver) = async_channel::unbounded();
        self.lock().subscribers.push(Subscriber {
            origin: self.origin,
            sender,
        });
        SharedStoreSubscription::new(receiver)
    }
}

//! Observable values with optional persistence, and delivery through a
//! primary context.
//!
//! An [`ObservableValue`] notifies every registered observer when it is
//! set; a newly registered observer immediately receives the current value.
//! When backed by a [`PersistentStore`] the value is loaded at construction
//! and saved on every set. Store failures are logged and otherwise ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A thread (typically a UI thread) on which notifications must run.
pub trait PrimaryContext: Send + Sync + 'static {
    /// Schedule `task` to run on the primary context.
    fn post(&self, task: Box<dyn FnOnce() + Send + 'static>);

    /// Returns true if the caller is already running on the primary context.
    fn is_current(&self) -> bool;
}

/// Run `task` on `context` if one is configured and we are not already on it.
pub(crate) fn deliver<F>(context: Option<&Arc<dyn PrimaryContext>>, task: F)
where
    F: FnOnce() + Send + 'static,
{
    match context {
        Some(context) if !context.is_current() => context.post(Box::new(task)),
        _ => task(),
    }
}

/// Key/value persistence for observable values.
pub trait PersistentStore: Send + Sync + 'static {
    /// Load the value stored under `key` and the time it was stored.
    fn load(&self, key: &str) -> anyhow::Result<Option<(Value, u64)>>;

    /// Store `value` under `key` with its timestamp in ms since the epoch.
    fn save(&self, key: &str, value: &Value, timestamp: u64) -> anyhow::Result<()>;
}

#[derive(Serialize, Deserialize)]
struct StoredValue {
    value: Value,
    timestamp: u64,
}

/// [`PersistentStore`] keeping one JSON file per key in a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store keeping one `<key>.json` file per value under `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        JsonFileStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl PersistentStore for JsonFileStore {
    fn load(&self, key: &str) -> anyhow::Result<Option<(Value, u64)>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let stored: StoredValue = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(Some((stored.value, stored.timestamp)))
    }

    fn save(&self, key: &str, value: &Value, timestamp: u64) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let stored = StoredValue {
            value: value.clone(),
            timestamp,
        };
        fs::write(self.path(key), serde_json::to_vec(&stored)?)?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObserverId(u64);

type Observer<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

struct ObservableState<T> {
    value: Option<T>,
    set_at: Option<u64>,
    observers: BTreeMap<ObserverId, Observer<T>>,
}

/// A value that notifies observers when it changes.
pub struct ObservableValue<T> {
    state: Mutex<ObservableState<T>>,
    next_observer: AtomicU64,
    store: Option<(Arc<dyn PersistentStore>, String)>,
    context: Option<Arc<dyn PrimaryContext>>,
}

impl<T> ObservableValue<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Unset value with no store.
    pub fn new() -> Self {
        ObservableValue {
            state: Mutex::new(ObservableState {
                value: None,
                set_at: None,
                observers: BTreeMap::new(),
            }),
            next_observer: AtomicU64::new(1),
            store: None,
            context: None,
        }
    }

    /// Value set to `value`, with no store.
    pub fn with_value(value: T) -> Self {
        let observable = Self::new();
        {
            let mut state = observable.lock();
            state.value = Some(value);
            state.set_at = Some(now_millis());
        }
        observable
    }

    /// Back the value with `store` under `key`, loading what is stored.
    pub fn persistent(store: Arc<dyn PersistentStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let observable = Self::new();
        match store.load(&key) {
            Ok(Some((value, timestamp))) => match serde_json::from_value::<T>(value) {
                Ok(value) => {
                    let mut state = observable.lock();
                    state.value = Some(value);
                    state.set_at = Some(timestamp);
                }
                Err(e) => warn!(key = %key, error = %e, "stored value has the wrong shape"),
            },
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "failed to load stored value"),
        }
        ObservableValue {
            store: Some((store, key)),
            ..observable
        }
    }

    /// Deliver notifications through `context`.
    pub fn with_context(mut self, context: Arc<dyn PrimaryContext>) -> Self {
        self.context = Some(context);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ObservableState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current value, if set.
    pub fn get(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// When the value was last set, in ms since the epoch.
    pub fn set_at(&self) -> Option<u64> {
        self.lock().set_at
    }

    /// Replace the value, persist it and notify observers.
    pub fn set(&self, value: T) {
        let timestamp = now_millis();
        let observers: Vec<Observer<T>> = {
            let mut state = self.lock();
            state.value = Some(value.clone());
            state.set_at = Some(timestamp);
            state.observers.values().cloned().collect()
        };
        if let Some((store, key)) = &self.store {
            match serde_json::to_value(&value) {
                Ok(json) => {
                    if let Err(e) = store.save(key, &json, timestamp) {
                        warn!(key = %key, error = %e, "failed to persist value");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "value is not serializable"),
            }
        }
        for observer in observers {
            let value = value.clone();
            deliver(self.context.as_ref(), move || observer(value));
        }
    }

    /// Register `observer`; it is called right away if a value is present.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let observer: Observer<T> = Arc::new(observer);
        let current = {
            let mut state = self.lock();
            state.observers.insert(id, observer.clone());
            state.value.clone()
        };
        if let Some(value) = current {
            deliver(self.context.as_ref(), move || observer(value));
        }
        id
    }

    /// Remove an observer; returns false if it was not registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.lock().observers.remove(&id).is_some()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }
}

impl<T> Default for ObservableValue<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

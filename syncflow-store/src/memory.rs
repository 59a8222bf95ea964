// Copyright 2025 LiveKit, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use syncflow_protocol::is_server_timestamp;
use tokio::sync::mpsc;

use crate::{
    ChildEvent, ChildSubscription, SignalStore, StoreError, StorePath, StoreResult, Subscription,
    ValueSubscription,
};

struct ValueWatcher {
    path: StorePath,
    last: Option<Value>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct ChildWatcher {
    path: StorePath,
    last: BTreeMap<String, Value>,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct Faults {
    offline: bool,
    failing_writes: u32,
}

struct StoreInner {
    root: Value,
    value_watchers: Vec<ValueWatcher>,
    child_watchers: Vec<ChildWatcher>,
    faults: Faults,
    last_push_millis: u64,
    push_counter: u32,
}

/// In-process implementation of [`SignalStore`].
///
/// Notifications are queued while the tree lock is held, so every subscriber
/// observes the writes to a path in the order they were applied. Timestamps
/// placeholders are resolved against the local clock.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("value_watchers", &inner.value_watchers.len())
            .field("child_watchers", &inner.child_watchers.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                root: Value::Object(Map::new()),
                value_watchers: Vec::new(),
                child_watchers: Vec::new(),
                faults: Faults::default(),
                last_push_millis: 0,
                push_counter: 0,
            }),
        }
    }

    /// Synchronous read, for tests and diagnostics.
    pub fn value_at(&self, path: &StorePath) -> Option<Value> {
        let inner = self.inner.lock();
        get_at(&inner.root, path.segments()).cloned()
    }

    /// While offline every operation fails with a retryable error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().faults.offline = offline;
    }

    /// Makes the next `count` writes fail with a retryable error.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().faults.failing_writes = count;
    }

    /// Number of live subscriptions, closed ones are pruned first.
    pub fn subscription_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.value_watchers.retain(|w| !w.tx.is_closed());
        inner.child_watchers.retain(|w| !w.tx.is_closed());
        inner.value_watchers.len() + inner.child_watchers.len()
    }

    fn write<F>(&self, path: &StorePath, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreInner) -> StoreResult<()>,
    {
        if path.is_root() {
            return Err(StoreError::InvalidPath("cannot write the root".to_owned()));
        }

        let mut inner = self.inner.lock();
        if inner.faults.offline {
            return Err(StoreError::Unavailable("store is offline".to_owned()));
        }
        if inner.faults.failing_writes > 0 {
            inner.faults.failing_writes -= 1;
            log::debug!("injected failure for write to {}", path);
            return Err(StoreError::Unavailable(format!("write to {} failed", path)));
        }

        apply(&mut inner)?;
        inner.notify();
        Ok(())
    }
}

impl StoreInner {
    fn next_push_key(&mut self) -> String {
        let now = now_millis().max(self.last_push_millis);
        if now == self.last_push_millis {
            self.push_counter += 1;
        } else {
            self.last_push_millis = now;
            self.push_counter = 0;
        }
        format!("-{:013}{:06}", now, self.push_counter)
    }

    fn notify(&mut self) {
        let root = &self.root;

        self.value_watchers.retain_mut(|watcher| {
            let current = get_at(root, watcher.path.segments()).cloned();
            if current == watcher.last {
                return !watcher.tx.is_closed();
            }
            watcher.last = current.clone();
            watcher.tx.send(current).is_ok()
        });

        self.child_watchers.retain_mut(|watcher| {
            let current = children_at(root, &watcher.path);
            let mut events = Vec::new();
            for (key, value) in &current {
                match watcher.last.get(key) {
                    None => events.push(ChildEvent::Added { key: key.clone(), value: value.clone() }),
                    Some(previous) if previous != value => {
                        events.push(ChildEvent::Changed { key: key.clone(), value: value.clone() })
                    }
                    Some(_) => {}
                }
            }
            for key in watcher.last.keys() {
                if !current.contains_key(key) {
                    events.push(ChildEvent::Removed { key: key.clone() });
                }
            }
            watcher.last = current;
            events.into_iter().all(|event| watcher.tx.send(event).is_ok()) && !watcher.tx.is_closed()
        });
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn set(&self, path: &StorePath, value: Value) -> StoreResult<()> {
        let value = prepare(value, path)?;
        self.write(path, |inner| {
            set_at(&mut inner.root, path.segments(), value);
            Ok(())
        })
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> StoreResult<()> {
        let mut writes = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let target = path.join(&key)?;
            if target == *path {
                return Err(StoreError::InvalidPath(format!("{}/{}", path, key)));
            }
            let value = prepare(value, &target)?;
            writes.push((target, value));
        }

        self.write(path, |inner| {
            for (target, value) in writes {
                set_at(&mut inner.root, target.segments(), value);
            }
            Ok(())
        })
    }

    async fn push(&self, path: &StorePath, value: Value) -> StoreResult<String> {
        let value = prepare(value, path)?;
        let mut pushed = None;
        self.write(path, |inner| {
            let key = inner.next_push_key();
            let target = path.child(&key)?;
            set_at(&mut inner.root, target.segments(), value);
            pushed = Some(key);
            Ok(())
        })?;

        pushed.ok_or_else(|| StoreError::InvalidPath(path.to_string()))
    }

    async fn get(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        let inner = self.inner.lock();
        if inner.faults.offline {
            return Err(StoreError::Unavailable("store is offline".to_owned()));
        }
        Ok(get_at(&inner.root, path.segments()).cloned())
    }

    async fn remove(&self, path: &StorePath) -> StoreResult<()> {
        self.write(path, |inner| {
            set_at(&mut inner.root, path.segments(), Value::Null);
            Ok(())
        })
    }

    fn on_value_changed(&self, path: &StorePath) -> StoreResult<ValueSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let current = get_at(&inner.root, path.segments()).cloned();
        let _ = tx.send(current.clone());
        inner.value_watchers.push(ValueWatcher { path: path.clone(), last: current, tx });
        Ok(Subscription::new(rx))
    }

    fn on_child_event(&self, path: &StorePath) -> StoreResult<ChildSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let current = children_at(&inner.root, path);
        for (key, value) in &current {
            let _ = tx.send(ChildEvent::Added { key: key.clone(), value: value.clone() });
        }
        inner.child_watchers.push(ChildWatcher { path: path.clone(), last: current, tx });
        Ok(Subscription::new(rx))
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

/// Resolves timestamp placeholders and drops empty branches, which the store
/// never keeps.
fn prepare(value: Value, path: &StorePath) -> StoreResult<Value> {
    fn resolve(value: Value, now: u64, depth: usize, path: &StorePath) -> StoreResult<Value> {
        if depth > 32 {
            return Err(StoreError::InvalidValue {
                path: path.to_string(),
                reason: "value is nested too deeply".to_owned(),
            });
        }
        if is_server_timestamp(&value) {
            return Ok(Value::from(now));
        }
        match value {
            Value::Object(map) => {
                let mut resolved = Map::new();
                for (key, child) in map {
                    if key.is_empty() || key.contains('/') {
                        return Err(StoreError::InvalidValue {
                            path: path.to_string(),
                            reason: format!("invalid key {:?}", key),
                        });
                    }
                    let child = resolve(child, now, depth + 1, path)?;
                    if !is_empty_node(&child) {
                        resolved.insert(key, child);
                    }
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other),
        }
    }

    resolve(value, now_millis(), 0, path)
}

fn is_empty_node(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn get_at<'a>(node: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = node;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    if is_empty_node(current) {
        return None;
    }
    Some(current)
}

fn children_at(root: &Value, path: &StorePath) -> BTreeMap<String, Value> {
    match get_at(root, path.segments()) {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    }
}

fn set_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }

    if let Value::Object(map) = node {
        if rest.is_empty() {
            if is_empty_node(&value) {
                map.remove(first);
            } else {
                map.insert(first.clone(), value);
            }
            return;
        }

        let child = map.entry(first.clone()).or_insert(Value::Null);
        set_at(child, rest, value);
        if is_empty_node(child) {
            map.remove(first);
        }
    }
}

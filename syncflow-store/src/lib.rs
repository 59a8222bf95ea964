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

//! Access to the shared real-time store used as the signaling transport.
//!
//! The store is a tree of JSON values addressed by `/`-separated paths. It
//! offers last-write-wins per leaf, at-least-once change notifications and no
//! transaction spanning several paths.

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
mod path;
mod subscription;

pub use memory::MemoryStore;
pub use path::StorePath;
pub use subscription::{ChildEvent, ChildSubscription, Subscription, ValueSubscription};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied at {0}")]
    PermissionDenied(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid value at {path}: {reason}")]
    InvalidValue { path: String, reason: String },
}

impl StoreError {
    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait SignalStore: Send + Sync + Debug + 'static {
    /// Replaces the value at `path`, a null value removes it.
    async fn set(&self, path: &StorePath, value: Value) -> StoreResult<()>;

    /// Writes every entry of `fields` below `path`. Keys may be relative
    /// paths (`"a/b"`).
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> StoreResult<()>;

    /// Appends `value` under a new, chronologically ordered key and returns the key.
    async fn push(&self, path: &StorePath, value: Value) -> StoreResult<String>;

    async fn get(&self, path: &StorePath) -> StoreResult<Option<Value>>;

    async fn remove(&self, path: &StorePath) -> StoreResult<()>;

    /// Emits the current value right away, then every change. `None` means
    /// nothing is stored at `path`.
    fn on_value_changed(&self, path: &StorePath) -> StoreResult<ValueSubscription>;

    /// Emits `Added` for every existing child right away, then every child
    /// added, changed or removed.
    fn on_child_event(&self, path: &StorePath) -> StoreResult<ChildSubscription>;
}

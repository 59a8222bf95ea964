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

use std::fmt;

use crate::{StoreError, StoreResult};

const FORBIDDEN_CHARS: [char; 5] = ['.', '#', '$', '[', ']'];

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(path: &str) -> StoreResult<Self> {
        Self::root().join(path)
    }

    /// Appends a relative path, which may itself contain several segments.
    pub fn join(&self, relative: &str) -> StoreResult<Self> {
        let mut segments = self.segments.clone();
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            validate_segment(segment)?;
            segments.push(segment.to_owned());
        }
        Ok(Self { segments })
    }

    /// Appends exactly one segment, `/` is not accepted.
    pub fn child(&self, segment: &str) -> StoreResult<Self> {
        if segment.is_empty() || segment.contains('/') {
            return Err(StoreError::InvalidPath(format!("{}/{}", self, segment)));
        }
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_owned());
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.segments.split_last()?;
        Some(Self { segments: parent.to_vec() })
    }

    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn starts_with(&self, prefix: &StorePath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

fn validate_segment(segment: &str) -> StoreResult<()> {
    if segment.chars().any(|c| FORBIDDEN_CHARS.contains(&c) || c.is_control()) {
        return Err(StoreError::InvalidPath(segment.to_owned()));
    }
    Ok(())
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

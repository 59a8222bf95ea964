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

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use syncflow_store::StorePath;
use syncflow_webrtc::prelude::RtcConfiguration;

use crate::{
    call_engine::{EngineError, EngineResult},
    signaling::{AddressingStrategy, DeviceAddressing, IdentityAddressing},
};

pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Where call records are written in the shared store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    /// Phone to desktop calls, records under the callee device.
    #[default]
    Device,
    /// User to user calls, records under the callee identity.
    Identity,
}

impl AddressingMode {
    pub fn strategy(&self, namespace: &str) -> EngineResult<Arc<dyn AddressingStrategy>> {
        let namespace = StorePath::parse(namespace)
            .map_err(|err| EngineError::Config(format!("invalid namespace: {}", err)))?;
        Ok(match self {
            AddressingMode::Device => Arc::new(DeviceAddressing::new(namespace)),
            AddressingMode::Identity => Arc::new(IdentityAddressing::new(namespace)),
        })
    }
}

/// Bounded retry for store operations, only applied to retryable errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "backoff_ms", with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Duration::from_millis(250) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub addressing: AddressingMode,
    /// Root of every path written by the engine.
    pub namespace: String,
    #[serde(rename = "ring_timeout_ms", with = "duration_ms")]
    pub ring_timeout: Duration,
    #[serde(rename = "disconnect_grace_ms", with = "duration_ms")]
    pub disconnect_grace: Duration,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Check that the callee exists in the store before creating a record.
    pub verify_target: bool,
    /// The caller deletes the record once the call is over.
    pub remove_record_on_end: bool,
    pub rtc_config: RtcConfiguration,
    /// Shown on the callee side, optional.
    pub caller_name: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            addressing: AddressingMode::default(),
            namespace: "users".to_owned(),
            ring_timeout: DEFAULT_RING_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
            verify_target: false,
            remove_record_on_end: false,
            rtc_config: RtcConfiguration::default(),
            caller_name: None,
        }
    }
}

impl CallOptions {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let options: CallOptions = serde_json::from_str(json)
            .map_err(|err| EngineError::Config(format!("failed to parse options: {}", err)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.namespace.trim_matches('/').is_empty() {
            return Err(EngineError::Config("namespace must not be empty".to_owned()));
        }
        StorePath::parse(&self.namespace)
            .map_err(|err| EngineError::Config(format!("invalid namespace: {}", err)))?;

        for (name, value) in [
            ("ring_timeout", self.ring_timeout),
            ("disconnect_grace", self.disconnect_grace),
            ("connect_timeout", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(EngineError::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = CallOptions::default();
        options.validate().unwrap();
        assert_eq!(options.ring_timeout, Duration::from_secs(60));
        assert_eq!(options.disconnect_grace, Duration::from_secs(5));
        assert_eq!(options.retry.max_attempts, 3);
    }

    #[test]
    fn from_json_reads_millis_and_keeps_defaults() {
        let options = CallOptions::from_json(
            r#"{ "addressing": "identity", "ring_timeout_ms": 1500, "retry": { "max_attempts": 5 } }"#,
        )
        .unwrap();
        assert_eq!(options.addressing, AddressingMode::Identity);
        assert_eq!(options.ring_timeout, Duration::from_millis(1500));
        assert_eq!(options.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.retry.backoff, Duration::from_millis(250));
        assert_eq!(options.namespace, "users");
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(matches!(
            CallOptions::from_json(r#"{ "ring_timeout_ms": 0 }"#),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            CallOptions::from_json(r#"{ "namespace": "us.ers" }"#),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(CallOptions::from_json("{ nope"), Err(EngineError::Config(_))));

        let options =
            CallOptions { retry: RetryPolicy { max_attempts: 0, ..Default::default() }, ..Default::default() };
        assert!(options.validate().is_err());
    }
}

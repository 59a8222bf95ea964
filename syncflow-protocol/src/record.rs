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

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Wire names of the record fields.
pub mod fields {
    pub const CALL_ID: &str = "callId";
    pub const CALLER_ID: &str = "callerId";
    pub const CALLEE_ID: &str = "calleeId";
    pub const CALLER_NAME: &str = "callerName";
    pub const IS_VIDEO: &str = "isVideo";
    pub const STATUS: &str = "status";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CALLER: &str = "ice_caller";
    pub const ICE_CALLEE: &str = "ice_callee";
    pub const CREATED_AT: &str = "createdAt";
    pub const ANSWERED_AT: &str = "answeredAt";
    pub const ENDED_AT: &str = "endedAt";
}

/// Placeholder resolved by the store to its own clock at write time.
pub fn server_timestamp() -> Value {
    let mut sentinel = Map::new();
    sentinel.insert(".sv".to_owned(), Value::String("timestamp".to_owned()));
    Value::Object(sentinel)
}

pub fn is_server_timestamp(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.get(".sv") == Some(&Value::String("timestamp".to_owned())))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown call status: {0}")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Rejected,
    Missed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
            CallStatus::Missed => "missed",
            CallStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Ringing | CallStatus::Active)
    }

    /// ringing -> active is the only forward move before a terminal value,
    /// and nothing leaves a terminal value.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (CallStatus::Ringing, CallStatus::Active) => true,
            (_, next) => next.is_terminal(),
        }
    }
}

impl FromStr for CallStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(CallStatus::Ringing),
            "active" => Ok(CallStatus::Active),
            "ended" => Ok(CallStatus::Ended),
            "rejected" => Ok(CallStatus::Rejected),
            "missed" => Ok(CallStatus::Missed),
            "failed" => Ok(CallStatus::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of the record an endpoint owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    pub fn remote(&self) -> CallRole {
        match self {
            CallRole::Caller => CallRole::Callee,
            CallRole::Callee => CallRole::Caller,
        }
    }

    /// Field holding the candidates generated by this role.
    pub fn candidates_field(&self) -> &'static str {
        match self {
            CallRole::Caller => fields::ICE_CALLER,
            CallRole::Callee => fields::ICE_CALLEE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescriptionPayload {
    pub fn is_empty(&self) -> bool {
        self.sdp.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub is_video: bool,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescriptionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescriptionPayload>,
    #[serde(rename = "ice_caller", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ice_caller_candidates: BTreeMap<String, IceCandidatePayload>,
    #[serde(rename = "ice_callee", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ice_callee_candidates: BTreeMap<String, IceCandidatePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

impl CallRecord {
    pub fn new_ringing(
        call_id: impl Into<String>,
        caller_id: impl Into<String>,
        callee_id: impl Into<String>,
        is_video: bool,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            caller_id: caller_id.into(),
            callee_id: callee_id.into(),
            caller_name: None,
            is_video,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            ice_caller_candidates: BTreeMap::new(),
            ice_callee_candidates: BTreeMap::new(),
            created_at: None,
            answered_at: None,
            ended_at: None,
        }
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Serializes the record for an initial write, `createdAt` is left to
    /// the store clock.
    pub fn to_initial_value(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert(fields::CREATED_AT.to_owned(), server_timestamp());
        }
        Ok(value)
    }

    pub fn candidates(&self, role: CallRole) -> &BTreeMap<String, IceCandidatePayload> {
        match role {
            CallRole::Caller => &self.ice_caller_candidates,
            CallRole::Callee => &self.ice_callee_candidates,
        }
    }

    pub fn has_offer(&self) -> bool {
        self.offer.as_ref().map(|offer| !offer.is_empty()).unwrap_or(false)
    }
}

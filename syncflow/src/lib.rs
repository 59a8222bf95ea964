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

//! Peer-to-peer call signaling for SyncFlow.
//!
//! Two endpoints negotiate an audio or video session through a shared
//! real-time store: the caller writes a call record with its offer, the
//! callee answers into the same record and both sides trickle their ICE
//! candidates next to it. [`CallEngine`] drives that exchange and owns the
//! lifecycle of the call.

pub mod call_engine;
pub mod id;
pub mod options;
pub mod prelude;
pub mod signaling;

pub mod webrtc {
    pub use syncflow_webrtc::*;
}

pub mod store {
    pub use syncflow_store::*;
}

pub mod protocol {
    pub use syncflow_protocol::*;
}

pub use call_engine::{
    CallEngine, CallEvent, CallEvents, CallState, EngineError, EngineResult, FailureReason,
};
pub use id::{CallId, EndpointId};
pub use options::{AddressingMode, CallOptions, RetryPolicy};

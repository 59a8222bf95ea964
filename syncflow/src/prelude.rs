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

pub use crate::call_engine::{
    CallEngine, CallEvent, CallEvents, CallState, EngineError, EngineResult, FailureReason,
};
pub use crate::id::*;
pub use crate::options::{AddressingMode, CallOptions, RetryPolicy};
pub use crate::signaling::{
    AddressingStrategy, CallRoute, DeviceAddressing, IdentityAddressing, SignalChannel,
    SignalError, SignalResult,
};

pub use syncflow_protocol::{CallRecord, CallRole, CallStatus};
pub use syncflow_store::{MemoryStore, SignalStore, StorePath};
pub use syncflow_webrtc::prelude::{CameraFacing, PeerConnectionFactory, RtcConfiguration};

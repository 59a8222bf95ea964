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

use syncflow_protocol::CallStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Nobody answered before the ring timeout.
    Timeout,
    /// The media engine or the store failed while setting up the session.
    Negotiation(String),
    /// The connection was lost and did not come back within the grace period.
    Dropped,
    /// The remote side marked the call as failed.
    RemoteFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("no answer"),
            FailureReason::Negotiation(reason) => write!(f, "negotiation failed: {}", reason),
            FailureReason::Dropped => f.write_str("connection lost"),
            FailureReason::RemoteFailed => f.write_str("remote failure"),
        }
    }
}

/// Lifecycle of the call owned by this process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Initializing,
    Ringing,
    Connecting,
    Connected,
    Failed(FailureReason),
    Ended,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Failed(_) | CallState::Ended)
    }

    /// A call exists and has not reached a terminal state yet.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != CallState::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StateEvent {
    Initiate,
    IncomingRinging,
    OfferSent,
    IncomingPresented,
    RemoteAnswerObserved,
    LocalAnswerSent,
    RingTimeout,
    IceConnected,
    IceFailed,
    ConnectTimeout,
    GraceExpired,
    LocalEnd,
    RemoteStatus(CallStatus),
    RecordRemoved,
    SetupError(String),
    Reset,
}

impl CallState {
    /// Returns the next state, or `None` when `event` does not apply to the
    /// current state.
    pub(crate) fn next(&self, event: &StateEvent) -> Option<CallState> {
        use CallState::*;

        let next = match (self, event) {
            (Idle, StateEvent::Initiate | StateEvent::IncomingRinging) => Initializing,
            (Initializing, StateEvent::OfferSent | StateEvent::IncomingPresented) => Ringing,
            (Ringing, StateEvent::RemoteAnswerObserved | StateEvent::LocalAnswerSent) => Connecting,
            (Initializing | Ringing, StateEvent::RingTimeout) => Failed(FailureReason::Timeout),
            (Connecting, StateEvent::IceConnected) => Connected,
            (Connecting, StateEvent::IceFailed) => {
                Failed(FailureReason::Negotiation("ice connection failed".to_owned()))
            }
            (Connecting, StateEvent::ConnectTimeout) => {
                Failed(FailureReason::Negotiation("connection timed out".to_owned()))
            }
            (Connected, StateEvent::IceFailed | StateEvent::GraceExpired) => {
                Failed(FailureReason::Dropped)
            }
            (state, StateEvent::LocalEnd | StateEvent::RecordRemoved) if state.is_active() => Ended,
            (state, StateEvent::RemoteStatus(status)) if state.is_active() => match status {
                CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed => Ended,
                CallStatus::Failed => Failed(FailureReason::RemoteFailed),
                CallStatus::Ringing | CallStatus::Active => return None,
            },
            (state, StateEvent::SetupError(reason)) if state.is_active() => {
                Failed(FailureReason::Negotiation(reason.clone()))
            }
            (state, StateEvent::Reset) if state.is_terminal() => Idle,
            _ => return None,
        };
        Some(next)
    }
}

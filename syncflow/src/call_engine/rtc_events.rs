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

use futures_util::Stream;
use syncflow_webrtc::{self as rtc, prelude::*};
use tokio::sync::mpsc;

use super::peer_transport::PeerTransport;

pub type RtcEmitter = mpsc::UnboundedSender<RtcEvent>;
pub type RtcEvents = mpsc::UnboundedReceiver<RtcEvent>;

#[derive(Debug)]
pub enum RtcEvent {
    CandidateGenerated(IceCandidate),
    ConnectionStateChanged(IceConnectionState),
    TrackReceived(TrackEvent),
    RenegotiationRequested,
}

/// Handlers used to forward events to a channel
/// Every callback here may be called from a media engine thread

fn on_ice_candidate(emitter: RtcEmitter) -> rtc::peer_connection::OnIceCandidate {
    Box::new(move |candidate| {
        let _ = emitter.send(RtcEvent::CandidateGenerated(candidate));
    })
}

fn on_ice_connection_state_change(
    emitter: RtcEmitter,
) -> rtc::peer_connection::OnIceConnectionChange {
    Box::new(move |state| {
        let _ = emitter.send(RtcEvent::ConnectionStateChanged(state));
    })
}

fn on_track(emitter: RtcEmitter) -> rtc::peer_connection::OnTrack {
    Box::new(move |event| {
        let _ = emitter.send(RtcEvent::TrackReceived(event));
    })
}

fn on_negotiation_needed(emitter: RtcEmitter) -> rtc::peer_connection::OnNegotiationNeeded {
    Box::new(move || {
        let _ = emitter.send(RtcEvent::RenegotiationRequested);
    })
}

pub fn forward_pc_events(transport: &PeerTransport, rtc_emitter: RtcEmitter) {
    let peer_connection = transport.peer_connection();
    peer_connection.on_ice_candidate(Some(on_ice_candidate(rtc_emitter.clone())));
    peer_connection
        .on_ice_connection_state_change(Some(on_ice_connection_state_change(rtc_emitter.clone())));
    peer_connection.on_track(Some(on_track(rtc_emitter.clone())));
    peer_connection.on_negotiation_needed(Some(on_negotiation_needed(rtc_emitter)));
}

pub fn detach_pc_events(transport: &PeerTransport) {
    let peer_connection = transport.peer_connection();
    peer_connection.on_ice_candidate(None);
    peer_connection.on_ice_connection_state_change(None);
    peer_connection.on_track(None);
    peer_connection.on_negotiation_needed(None);
}

pub fn into_stream(mut events: RtcEvents) -> impl Stream<Item = RtcEvent> + Send + Unpin {
    futures_util::stream::poll_fn(move |cx| events.poll_recv(cx))
}

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

use std::fmt::Debug;

use async_trait::async_trait;

use crate::{
    ice_candidate::IceCandidate,
    media_stream_track::{CameraFacing, MediaStreamTrack, TrackKind},
    session_description::SessionDescription,
    RtcError,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveLocalPrAnswer,
    HaveRemoteOffer,
    HaveRemotePrAnswer,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {}

#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub track: MediaStreamTrack,
    pub stream_ids: Vec<String>,
}

pub type OnIceCandidate = Box<dyn FnMut(IceCandidate) + Send + Sync>;
pub type OnIceConnectionChange = Box<dyn FnMut(IceConnectionState) + Send + Sync>;
pub type OnNegotiationNeeded = Box<dyn FnMut() + Send + Sync>;
pub type OnTrack = Box<dyn FnMut(TrackEvent) + Send + Sync>;

/// One peer connection of the media engine.
///
/// Every async operation must complete before the next negotiation step is
/// started. `add_ice_candidate` is safe to call any time after creation,
/// duplicate submissions are ignored by the engine.
#[async_trait]
pub trait PeerConnection: Send + Sync + Debug {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self, options: AnswerOptions)
        -> Result<SessionDescription, RtcError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Starts capturing `kind` and attaches the resulting track to the connection.
    fn add_local_track(&self, kind: TrackKind) -> Result<MediaStreamTrack, RtcError>;

    fn set_track_enabled(&self, track: &MediaStreamTrack, enabled: bool) -> Result<(), RtcError>;

    fn replace_video_source(
        &self,
        track: &MediaStreamTrack,
        facing: CameraFacing,
    ) -> Result<(), RtcError>;

    fn current_local_description(&self) -> Option<SessionDescription>;

    fn current_remote_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn close(&self);

    fn on_ice_candidate(&self, f: Option<OnIceCandidate>);

    fn on_ice_connection_state_change(&self, f: Option<OnIceConnectionChange>);

    fn on_negotiation_needed(&self, f: Option<OnNegotiationNeeded>);

    fn on_track(&self, f: Option<OnTrack>);
}

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

#![allow(dead_code)]

use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use syncflow::{
    prelude::*,
    store::StorePath,
    webrtc::{
        peer_connection::{OnIceCandidate, OnIceConnectionChange, OnNegotiationNeeded, OnTrack},
        prelude::*,
    },
};
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(300);
pub const CANDIDATES_PER_DESCRIPTION: u32 = 2;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct Callbacks {
    on_ice_candidate: Option<OnIceCandidate>,
    on_ice_connection_change: Option<OnIceConnectionChange>,
    on_negotiation_needed: Option<OnNegotiationNeeded>,
    on_track: Option<OnTrack>,
}

/// Scripted peer connection.
///
/// Every local description produces a couple of candidates. With
/// `auto_connect` the ICE state becomes `Connected` as soon as both
/// descriptions are set.
pub struct FakePeerConnection {
    id: u32,
    auto_connect: bool,
    ops: Mutex<Vec<String>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    ice_state: Mutex<IceConnectionState>,
    callbacks: Mutex<Callbacks>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<(MediaStreamTrack, bool)>>,
    facing: Mutex<CameraFacing>,
    closed: AtomicBool,
}

impl Debug for FakePeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakePeerConnection").field("id", &self.id).finish()
    }
}

impl FakePeerConnection {
    fn new(id: u32, auto_connect: bool) -> Self {
        Self {
            id,
            auto_connect,
            ops: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            ice_state: Mutex::new(IceConnectionState::New),
            callbacks: Mutex::new(Callbacks::default()),
            remote_candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            facing: Mutex::new(CameraFacing::Front),
            closed: AtomicBool::new(false),
        }
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().push(op.into());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn position(&self, op: &str) -> Option<usize> {
        self.ops.lock().iter().position(|recorded| recorded == op)
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates.lock().iter().map(|c| c.candidate()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn track_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.tracks.lock().iter().find(|(track, _)| track.kind() == kind).map(|(_, on)| *on)
    }

    pub fn facing(&self) -> CameraFacing {
        *self.facing.lock()
    }

    pub fn emit_ice_state(&self, state: IceConnectionState) {
        *self.ice_state.lock() = state;
        if let Some(callback) = self.callbacks.lock().on_ice_connection_change.as_mut() {
            callback(state);
        }
    }

    pub fn emit_track(&self, kind: TrackKind) {
        let event = TrackEvent {
            track: MediaStreamTrack::new(format!("remote-{}-{}", self.id, kind.as_str()), kind),
            stream_ids: vec![format!("stream-{}", self.id)],
        };
        if let Some(callback) = self.callbacks.lock().on_track.as_mut() {
            callback(event);
        }
    }

    fn emit_candidates(&self, sdp_type: SdpType) {
        let mut callbacks = self.callbacks.lock();
        let Some(callback) = callbacks.on_ice_candidate.as_mut() else {
            return;
        };
        for n in 0..CANDIDATES_PER_DESCRIPTION {
            let sdp = format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host {}", self.id, self.id, n, sdp_type);
            if let Ok(candidate) = IceCandidate::parse("0", 0, &sdp) {
                callback(candidate);
            }
        }
    }

    fn maybe_connect(&self) {
        if self.auto_connect && self.local.lock().is_some() && self.remote.lock().is_some() {
            self.emit_ice_state(IceConnectionState::Checking);
            self.emit_ice_state(IceConnectionState::Connected);
        }
    }

    fn description(&self, sdp_type: SdpType) -> Result<SessionDescription, RtcError> {
        let sdp = format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n", self.id);
        SessionDescription::parse(&sdp, sdp_type).map_err(|err| RtcError::invalid_sdp(err.to_string()))
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self, _options: OfferOptions) -> Result<SessionDescription, RtcError> {
        self.record("create_offer");
        self.description(SdpType::Offer)
    }

    async fn create_answer(&self, _options: AnswerOptions) -> Result<SessionDescription, RtcError> {
        if self.remote.lock().is_none() {
            self.record("create_answer:rejected");
            return Err(RtcError::invalid_state("create_answer without a remote offer"));
        }
        self.record("create_answer");
        self.description(SdpType::Answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        self.record(format!("set_local:{}", desc.sdp_type()));
        let sdp_type = desc.sdp_type();
        *self.local.lock() = Some(desc);
        self.emit_candidates(sdp_type);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        self.record(format!("set_remote:{}", desc.sdp_type()));
        *self.remote.lock() = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        if self.remote.lock().is_none() {
            self.record("add_candidate:rejected");
            return Err(RtcError::invalid_state("no remote description"));
        }
        self.record("add_candidate");
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    fn add_local_track(&self, kind: TrackKind) -> Result<MediaStreamTrack, RtcError> {
        let track = MediaStreamTrack::new(format!("local-{}-{}", self.id, kind.as_str()), kind);
        self.record(format!("add_track:{}", kind.as_str()));
        self.tracks.lock().push((track.clone(), true));
        Ok(track)
    }

    fn set_track_enabled(&self, track: &MediaStreamTrack, enabled: bool) -> Result<(), RtcError> {
        let mut tracks = self.tracks.lock();
        let entry = tracks
            .iter_mut()
            .find(|(local, _)| local == track)
            .ok_or_else(|| RtcError::invalid_state("unknown track"))?;
        entry.1 = enabled;
        Ok(())
    }

    fn replace_video_source(
        &self,
        track: &MediaStreamTrack,
        facing: CameraFacing,
    ) -> Result<(), RtcError> {
        if track.kind() != TrackKind::Video {
            return Err(RtcError::invalid_state("not a video track"));
        }
        *self.facing.lock() = facing;
        Ok(())
    }

    fn current_local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    fn current_remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    fn signaling_state(&self) -> SignalingState {
        match (self.local.lock().as_ref(), self.remote.lock().as_ref()) {
            (Some(_), Some(_)) | (None, None) => SignalingState::Stable,
            (Some(_), None) => SignalingState::HaveLocalOffer,
            (None, Some(_)) => SignalingState::HaveRemoteOffer,
        }
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        *self.ice_state.lock()
    }

    fn close(&self) {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
    }

    fn on_ice_candidate(&self, f: Option<OnIceCandidate>) {
        self.callbacks.lock().on_ice_candidate = f;
    }

    fn on_ice_connection_state_change(&self, f: Option<OnIceConnectionChange>) {
        self.callbacks.lock().on_ice_connection_change = f;
    }

    fn on_negotiation_needed(&self, f: Option<OnNegotiationNeeded>) {
        self.callbacks.lock().on_negotiation_needed = f;
    }

    fn on_track(&self, f: Option<OnTrack>) {
        self.callbacks.lock().on_track = f;
    }
}

#[derive(Debug)]
pub struct FakeFactory {
    auto_connect: bool,
    fail_next: AtomicBool,
    next_id: AtomicU32,
    connections: Mutex<Vec<Arc<FakePeerConnection>>>,
}

impl FakeFactory {
    /// Connections reach `Connected` on their own once negotiated.
    pub fn connecting() -> Arc<Self> {
        Arc::new(Self::with_auto_connect(true))
    }

    /// ICE state changes only happen through [`FakePeerConnection::emit_ice_state`].
    pub fn manual() -> Arc<Self> {
        Arc::new(Self::with_auto_connect(false))
    }

    fn with_auto_connect(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            fail_next: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_connection(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakePeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn last(&self) -> Result<Arc<FakePeerConnection>> {
        self.connections.lock().last().cloned().ok_or_else(|| anyhow!("no peer connection created"))
    }
}

impl PeerConnectionFactory for FakeFactory {
    fn create_peer_connection(
        &self,
        _config: RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RtcError::internal("no capture device available"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pc = Arc::new(FakePeerConnection::new(id, self.auto_connect));
        self.connections.lock().push(pc.clone());
        Ok(pc)
    }
}

pub fn test_options(addressing: AddressingMode) -> CallOptions {
    CallOptions { addressing, ..Default::default() }
}

pub struct TestPeer {
    pub engine: CallEngine,
    pub events: CallEvents,
    pub factory: Arc<FakeFactory>,
}

pub fn test_peer(
    store: &Arc<MemoryStore>,
    id: &str,
    factory: Arc<FakeFactory>,
    options: CallOptions,
) -> Result<TestPeer> {
    let (engine, events) = CallEngine::new(id, store.clone(), factory.clone(), options)?;
    Ok(TestPeer { engine, events, factory })
}

impl TestPeer {
    pub async fn next_event(&mut self) -> Result<CallEvent> {
        timeout(EVENT_TIMEOUT, self.events.recv())
            .await?
            .ok_or_else(|| anyhow!("event stream closed"))
    }

    /// Skips events until the engine reports `expected`.
    pub async fn wait_for_state(&mut self, expected: CallState) -> Result<()> {
        loop {
            if let CallEvent::StateChanged { state, .. } = self.next_event().await? {
                if state == expected {
                    return Ok(());
                }
            }
        }
    }

    pub async fn wait_for_incoming(&mut self) -> Result<(CallId, EndpointId, bool)> {
        loop {
            if let CallEvent::IncomingCall { call_id, caller, is_video, .. } =
                self.next_event().await?
            {
                return Ok((call_id, caller, is_video));
            }
        }
    }

    pub async fn wait_for_end(&mut self) -> Result<CallState> {
        loop {
            if let CallEvent::CallEnded { final_state, .. } = self.next_event().await? {
                return Ok(final_state);
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn pc(&self) -> Result<Arc<FakePeerConnection>> {
        self.factory.last()
    }
}

pub fn ended_count(events: &[CallEvent]) -> usize {
    events.iter().filter(|event| matches!(event, CallEvent::CallEnded { .. })).count()
}

pub fn states(events: &[CallEvent]) -> Vec<CallState> {
    events
        .iter()
        .filter_map(|event| match event {
            CallEvent::StateChanged { state, .. } => Some(state.clone()),
            _ => None,
        })
        .collect()
}

/// Places a call from `caller` to `callee` and waits until both sides are connected.
pub async fn connect_call(
    caller: &mut TestPeer,
    callee: &mut TestPeer,
    is_video: bool,
) -> Result<CallId> {
    let callee_id = callee.engine.local_id().clone();
    let call_id = caller.engine.start_call(callee_id, is_video).await?;

    let (incoming, from, video) = callee.wait_for_incoming().await?;
    if incoming != call_id || from != *caller.engine.local_id() || video != is_video {
        bail!("unexpected incoming call {} from {}", incoming, from);
    }
    callee.engine.answer_call(&incoming, is_video).await?;

    caller.wait_for_state(CallState::Connected).await?;
    callee.wait_for_state(CallState::Connected).await?;
    Ok(call_id)
}

pub fn record_path(mode: AddressingMode, callee: &str, call_id: &CallId) -> Result<StorePath> {
    let collection = match mode {
        AddressingMode::Device => "calls",
        AddressingMode::Identity => "incoming_syncflow_calls",
    };
    Ok(StorePath::parse(&format!("users/{}/{}/{}", callee, collection, call_id))?)
}

pub fn status_at(store: &MemoryStore, path: &StorePath) -> Option<String> {
    let status = store.value_at(&path.child("status").ok()?)?;
    status.as_str().map(str::to_owned)
}

/// Plays the callee side of a call by writing straight into the store.
pub async fn write_remote_answer(store: &MemoryStore, path: &StorePath) -> Result<()> {
    let mut update = Map::new();
    update.insert("answer".to_owned(), json!({ "type": "answer", "sdp": "v=0\r\no=- 99 2 IN IP4 127.0.0.1\r\n" }));
    update.insert("status".to_owned(), Value::from("active"));
    store.update(path, update).await?;
    Ok(())
}

pub async fn push_remote_candidate(store: &MemoryStore, path: &StorePath, n: u32) -> Result<String> {
    let candidate = json!({
        "candidate": format!("candidate:99 1 udp 2122260223 192.168.1.{} 6000 typ host", n),
        "sdpMid": "0",
        "sdpMLineIndex": 0,
    });
    Ok(store.push(&path.child("ice_callee")?, candidate).await?)
}

/// Lets every engine task run until it is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

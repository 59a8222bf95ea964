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

use std::{collections::HashSet, sync::Arc, time::Duration};

use serde_json::Value;
use syncflow_protocol::{CallRecord, CallRole, CallStatus, IceCandidatePayload, SessionDescriptionPayload};
use syncflow_store::ChildEvent;
use syncflow_webrtc::prelude::*;
use tokio::{sync::mpsc, time::Instant};

use super::{
    media::MediaTracks,
    peer_transport::PeerTransport,
    rtc_events,
    supervisor::{with_retry, Supervisor},
    CallSignal, EngineCommandSender, EngineError, EngineResult,
};
use crate::{
    id::CallId,
    options::RetryPolicy,
    signaling::{
        candidate_to_payload, decode, description_to_payload, payload_to_candidate,
        payload_to_description, CallRoute, SignalChannel, SignalError,
    },
};

/// Negotiation and bookkeeping of one call attempt.
///
/// A session owns exactly one peer connection, created with the session and
/// closed by [`CallSession::close`]. It is never reused for another call.
#[derive(Debug)]
pub struct CallSession {
    call_id: CallId,
    route: CallRoute,
    role: CallRole,
    is_video: bool,
    caller_name: Option<String>,
    transport: PeerTransport,
    media: MediaTracks,
    supervisor: Supervisor,
    channel: SignalChannel,
    retry: RetryPolicy,
    seen_remote_candidates: HashSet<String>,
    pending_local_candidates: Vec<IceCandidate>,
    // Local candidates are only written once the record (or the answer) exists.
    signaling_ready: bool,
    record_exists: bool,
    // The incoming record was seen with a terminal status.
    record_settled: bool,
    answer_applied: bool,
    connected_at: Option<Instant>,
}

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generation: u64,
        route: CallRoute,
        role: CallRole,
        is_video: bool,
        peer_connection: Arc<dyn PeerConnection>,
        channel: SignalChannel,
        retry: RetryPolicy,
        commands: EngineCommandSender,
    ) -> Self {
        let transport = PeerTransport::new(peer_connection, role);
        let mut supervisor = Supervisor::new(generation, commands);

        let (rtc_emitter, rtc_events) = mpsc::unbounded_channel();
        rtc_events::forward_pc_events(&transport, rtc_emitter);
        supervisor.forward(rtc_events::into_stream(rtc_events), CallSignal::Rtc);

        Self {
            call_id: route.call_id.clone(),
            route,
            role,
            is_video,
            caller_name: None,
            transport,
            media: MediaTracks::default(),
            supervisor,
            channel,
            retry,
            seen_remote_candidates: HashSet::new(),
            pending_local_candidates: Vec::new(),
            signaling_ready: false,
            // The callee only learns about calls from existing records.
            record_exists: role == CallRole::Callee,
            record_settled: false,
            answer_applied: false,
            connected_at: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.supervisor.generation()
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn route(&self) -> &CallRoute {
        &self.route
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_video(&self) -> bool {
        self.is_video
    }

    pub fn caller_name(&self) -> Option<&str> {
        self.caller_name.as_deref()
    }

    pub fn set_caller_name(&mut self, caller_name: Option<String>) {
        self.caller_name = caller_name;
    }

    pub fn mark_record_settled(&mut self) {
        self.record_settled = true;
    }

    pub fn record_settled(&self) -> bool {
        self.record_settled
    }

    pub fn supervisor(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    /// Caller side: publishes local tracks, the offer and the ringing record,
    /// then starts watching the callee half of the record.
    pub async fn send_offer(&mut self) -> EngineResult<()> {
        let pc = self.transport.peer_connection();
        self.media.publish(pc.as_ref(), self.is_video)?;

        let offer = self
            .transport
            .create_offer(OfferOptions {
                offer_to_receive_audio: true,
                offer_to_receive_video: self.is_video,
            })
            .await?;

        let mut record = CallRecord::new_ringing(
            self.route.call_id.as_str(),
            self.route.caller.as_str(),
            self.route.callee.as_str(),
            self.is_video,
        );
        record.caller_name = self.caller_name.clone();
        record.offer = Some(description_to_payload(&offer));

        let (channel, route, role) = (&self.channel, &self.route, self.role);
        with_retry(&self.retry, "create call record", || {
            channel.create_record(route, role, &record)
        })
        .await?;
        self.record_exists = true;
        log::debug!("call {} offered to {}", self.call_id, self.route.callee);

        self.watch_status()?;
        let answers = self.channel.watch_answer(&self.route)?;
        self.supervisor.forward(answers, CallSignal::Answer);
        let candidates = self.channel.watch_candidates(&self.route, CallRole::Callee)?;
        self.supervisor.forward(candidates, CallSignal::RemoteCandidate);

        self.flush_local_candidates().await;
        Ok(())
    }

    pub fn watch_status(&mut self) -> EngineResult<()> {
        let status = self.channel.watch_status(&self.route)?;
        self.supervisor.forward(status, CallSignal::Status);
        Ok(())
    }

    /// Callee side: applies the stored offer, then publishes local tracks and
    /// the answer.
    pub async fn answer(&mut self, with_video: bool) -> EngineResult<()> {
        let (channel, route, role) = (&self.channel, &self.route, self.role);
        let record = with_retry(&self.retry, "read call record", || channel.read_record(route))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("call {} no longer exists", route.call_id)))?;

        let offer = record
            .offer
            .filter(|offer| !offer.is_empty())
            .ok_or_else(|| EngineError::NotFound(format!("call {} has no offer", route.call_id)))?;
        let offer = payload_to_description(&offer, SdpType::Offer)?;

        let proof = self.transport.apply_remote_offer(offer).await?;

        let pc = self.transport.peer_connection();
        self.media.publish(pc.as_ref(), self.is_video && with_video)?;
        let answer = self.transport.create_answer(proof, AnswerOptions::default()).await?;

        let payload = description_to_payload(&answer);
        with_retry(&self.retry, "write answer", || channel.write_answer(route, role, &payload))
            .await
            .map_err(|err| match err {
                SignalError::RecordMissing(path) => EngineError::NotFound(path),
                err => err.into(),
            })?;
        log::debug!("call {} answered", self.call_id);

        let candidates = self.channel.watch_candidates(&self.route, CallRole::Caller)?;
        self.supervisor.forward(candidates, CallSignal::RemoteCandidate);

        self.flush_local_candidates().await;
        Ok(())
    }

    /// Applies the remote answer once. Returns whether it was applied now.
    pub async fn on_remote_answer(&mut self, value: Option<Value>) -> EngineResult<bool> {
        if self.role != CallRole::Caller || self.answer_applied {
            return Ok(false);
        }
        let Some(value) = value else {
            return Ok(false);
        };

        let payload: SessionDescriptionPayload = decode("answer", value)?;
        if payload.is_empty() {
            log::warn!("ignoring empty answer for call {}", self.call_id);
            return Ok(false);
        }

        let answer = payload_to_description(&payload, SdpType::Answer)?;
        self.transport.set_remote_description(answer).await?;
        self.answer_applied = true;
        Ok(true)
    }

    pub async fn on_remote_candidate(&mut self, event: ChildEvent) {
        let ChildEvent::Added { key, value } = event else {
            return;
        };
        if !self.seen_remote_candidates.insert(key.clone()) {
            return;
        }

        let candidate = decode::<IceCandidatePayload>("candidate", value)
            .and_then(|payload| payload_to_candidate(&payload));
        match candidate {
            Ok(candidate) => {
                if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                    log::warn!("failed to add remote candidate {}: {}", key, err);
                }
            }
            Err(err) => log::warn!("ignoring malformed candidate {}: {}", key, err),
        }
    }

    pub async fn on_local_candidate(&mut self, candidate: IceCandidate) {
        if !self.signaling_ready {
            self.pending_local_candidates.push(candidate);
            return;
        }
        self.publish_candidate(&candidate).await;
    }

    async fn publish_candidate(&self, candidate: &IceCandidate) {
        let payload = candidate_to_payload(candidate);
        let (channel, route, role) = (&self.channel, &self.route, self.role);
        if let Err(err) = with_retry(&self.retry, "publish candidate", || {
            channel.append_candidate(route, role, &payload)
        })
        .await
        {
            log::warn!("dropping local candidate for call {}: {}", self.call_id, err);
        }
    }

    async fn flush_local_candidates(&mut self) {
        self.signaling_ready = true;
        let pending = std::mem::take(&mut self.pending_local_candidates);
        for candidate in &pending {
            self.publish_candidate(candidate).await;
        }
    }

    /// Best effort, a failure only means the remote side learns about the
    /// end of the call through its own timers.
    pub async fn write_status(&self, status: CallStatus) -> bool {
        if !self.record_exists {
            return false;
        }

        let (channel, route, role) = (&self.channel, &self.route, self.role);
        match with_retry(&self.retry, "write call status", || {
            channel.write_status(route, role, status)
        })
        .await
        {
            Ok(written) => written,
            Err(err) => {
                log::error!("failed to mark call {} as {}: {}", self.call_id, status, err);
                false
            }
        }
    }

    pub async fn remove_record(&self) {
        if !self.record_exists {
            return;
        }

        let (channel, route, role) = (&self.channel, &self.route, self.role);
        if let Err(err) =
            with_retry(&self.retry, "remove call record", || channel.remove_record(route, role)).await
        {
            log::warn!("failed to remove record of call {}: {}", self.call_id, err);
        }
    }

    pub fn set_microphone_enabled(&mut self, enabled: bool) -> EngineResult<()> {
        let pc = self.transport.peer_connection();
        self.media.set_microphone_enabled(pc.as_ref(), enabled)
    }

    pub fn set_camera_enabled(&mut self, enabled: bool) -> EngineResult<()> {
        if !self.is_video {
            return Err(EngineError::InvalidState("not a video call".to_owned()));
        }
        let pc = self.transport.peer_connection();
        self.media.set_camera_enabled(pc.as_ref(), enabled)
    }

    pub fn switch_camera(&mut self) -> EngineResult<CameraFacing> {
        let pc = self.transport.peer_connection();
        self.media.switch_camera(pc.as_ref())
    }

    pub fn mark_connected(&mut self) {
        if self.connected_at.is_none() {
            self.connected_at = Some(Instant::now());
        }
    }

    /// Time spent connected, `None` if the call never connected.
    pub fn duration(&self) -> Option<Duration> {
        self.connected_at.map(|at| at.elapsed())
    }

    pub fn close(&mut self) {
        self.supervisor.shutdown();
        rtc_events::detach_pc_events(&self.transport);
        self.transport.close();
        self.media.clear();
    }
}

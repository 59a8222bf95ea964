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

use std::{
    collections::HashSet,
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use syncflow_protocol::{CallRecord, CallRole, CallStatus};
use syncflow_store::{ChildEvent, SignalStore};
use syncflow_webrtc::prelude::*;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    id::{CallId, EndpointId},
    options::CallOptions,
    signaling::{decode, decode_status, CallRoute, SignalChannel, SignalError},
};

mod call_session;
mod media;
mod peer_transport;
mod rtc_events;
mod state;
mod supervisor;

use call_session::CallSession;
use rtc_events::RtcEvent;
pub use state::{CallState, FailureReason};
use state::StateEvent;
use supervisor::{with_retry, TimerKind};

pub type CallEvents = mpsc::UnboundedReceiver<CallEvent>;
pub type EngineResult<T> = Result<T, EngineError>;

pub(crate) type EngineCommandSender = mpsc::UnboundedSender<EngineCommand>;
type CallEmitter = mpsc::UnboundedSender<CallEvent>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no local identity, sign in before placing calls")]
    NotAuthenticated,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("another call is in progress")]
    Busy,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("signal failure: {0}")]
    Signal(#[from] SignalError),
    #[error("internal webrtc failure: {0}")]
    Rtc(#[from] RtcError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("the call engine is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged {
        call_id: CallId,
        state: CallState,
    },
    IncomingCall {
        call_id: CallId,
        caller: EndpointId,
        caller_name: Option<String>,
        is_video: bool,
    },
    RemoteTrack {
        call_id: CallId,
        track: MediaStreamTrack,
        stream_ids: Vec<String>,
    },
    /// Sent exactly once per call, right before the engine returns to idle.
    CallEnded {
        call_id: CallId,
        final_state: CallState,
        /// Time spent connected.
        duration: Option<Duration>,
    },
}

/// Everything that happens inside a call, tagged by the supervisor.
#[derive(Debug)]
pub(crate) enum CallSignal {
    Answer(Option<Value>),
    Status(Option<Value>),
    RemoteCandidate(ChildEvent),
    Rtc(RtcEvent),
    Timer { kind: TimerKind, seq: u64 },
}

#[derive(Debug)]
pub(crate) enum EngineCommand {
    StartCall {
        target: EndpointId,
        is_video: bool,
        reply: oneshot::Sender<EngineResult<CallId>>,
    },
    AnswerCall {
        call_id: CallId,
        with_video: bool,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    RejectCall {
        call_id: CallId,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    EndCall {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SetMicrophoneEnabled {
        enabled: bool,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SetCameraEnabled {
        enabled: bool,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SwitchCamera {
        reply: oneshot::Sender<EngineResult<CameraFacing>>,
    },
    Incoming(ChildEvent),
    Call {
        generation: u64,
        signal: CallSignal,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Places, receives and supervises calls for one local endpoint.
///
/// Every user command, store notification, media engine callback and timer
/// is handled by a single task, one at a time. At most one call exists at
/// any moment.
pub struct CallEngine {
    local_id: EndpointId,
    commands: EngineCommandSender,
    state: watch::Receiver<CallState>,
    engine_task: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local_id", &self.local_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl CallEngine {
    /// Starts the engine and begins watching for incoming calls.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        local_id: impl Into<EndpointId>,
        store: Arc<dyn SignalStore>,
        factory: Arc<dyn PeerConnectionFactory>,
        options: CallOptions,
    ) -> EngineResult<(Self, CallEvents)> {
        let local_id = local_id.into();
        if local_id.is_empty() {
            return Err(EngineError::NotAuthenticated);
        }
        options.validate()?;

        let addressing = options.addressing.strategy(&options.namespace)?;
        let channel = SignalChannel::new(store, addressing);
        let incoming = channel.watch_incoming(&local_id)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (emitter, events) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);

        let incoming_task = tokio::spawn({
            let commands = commands.clone();
            async move {
                let mut incoming = incoming;
                while let Some(event) = incoming.recv().await {
                    if commands.send(EngineCommand::Incoming(event)).is_err() {
                        break;
                    }
                }
            }
        });

        let task = EngineTask {
            local_id: local_id.clone(),
            options,
            channel,
            factory,
            commands: commands.clone(),
            emitter,
            state_tx,
            state: CallState::Idle,
            active: None,
            next_generation: 0,
            handled: HandledCalls::default(),
            incoming_task,
        };
        let engine_task = tokio::spawn(task.run(command_rx));

        log::info!("call engine started for {}", local_id);
        Ok((
            Self { local_id, commands, state: state_rx, engine_task: Mutex::new(Some(engine_task)) },
            events,
        ))
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Calls `target` and returns once the record is ringing.
    pub async fn start_call(
        &self,
        target: impl Into<EndpointId>,
        is_video: bool,
    ) -> EngineResult<CallId> {
        let target = target.into();
        self.request(|reply| EngineCommand::StartCall { target, is_video, reply }).await
    }

    pub async fn answer_call(&self, call_id: &CallId, with_video: bool) -> EngineResult<()> {
        let call_id = call_id.clone();
        self.request(|reply| EngineCommand::AnswerCall { call_id, with_video, reply }).await
    }

    pub async fn reject_call(&self, call_id: &CallId) -> EngineResult<()> {
        let call_id = call_id.clone();
        self.request(|reply| EngineCommand::RejectCall { call_id, reply }).await
    }

    /// Hangs up the current call. Ending when no call exists is a no-op.
    pub async fn end_call(&self) -> EngineResult<()> {
        self.request(|reply| EngineCommand::EndCall { reply }).await
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> EngineResult<()> {
        self.request(|reply| EngineCommand::SetMicrophoneEnabled { enabled, reply }).await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> EngineResult<()> {
        self.request(|reply| EngineCommand::SetCameraEnabled { enabled, reply }).await
    }

    pub async fn switch_camera(&self) -> EngineResult<CameraFacing> {
        self.request(|reply| EngineCommand::SwitchCamera { reply }).await
    }

    /// Ends the current call, if any, and stops the engine.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(EngineCommand::Close { reply: Some(reply) }).is_ok() {
            let _ = done.await;
        }

        let engine_task = self.engine_task.lock().take();
        if let Some(engine_task) = engine_task {
            let _ = engine_task.await;
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> EngineCommand,
    ) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)?
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::Close { reply: None });
    }
}

struct EngineTask {
    local_id: EndpointId,
    options: CallOptions,
    channel: SignalChannel,
    factory: Arc<dyn PeerConnectionFactory>,
    commands: EngineCommandSender,
    emitter: CallEmitter,
    state_tx: watch::Sender<CallState>,
    state: CallState,
    active: Option<CallSession>,
    next_generation: u64,
    handled: HandledCalls,
    incoming_task: JoinHandle<()>,
}

impl EngineTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                EngineCommand::Close { reply } => {
                    self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                command => self.handle_command(command).await,
            }
        }
        log::debug!("call engine task for {} stopped", self.local_id);
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::StartCall { target, is_video, reply } => {
                let _ = reply.send(self.start_call(target, is_video).await);
            }
            EngineCommand::AnswerCall { call_id, with_video, reply } => {
                let _ = reply.send(self.answer_call(call_id, with_video).await);
            }
            EngineCommand::RejectCall { call_id, reply } => {
                let _ = reply.send(self.reject_call(call_id).await);
            }
            EngineCommand::EndCall { reply } => {
                self.finish(StateEvent::LocalEnd, Some(CallStatus::Ended)).await;
                let _ = reply.send(Ok(()));
            }
            EngineCommand::SetMicrophoneEnabled { enabled, reply } => {
                let _ = reply.send(self.session_mut().and_then(|s| s.set_microphone_enabled(enabled)));
            }
            EngineCommand::SetCameraEnabled { enabled, reply } => {
                let _ = reply.send(self.session_mut().and_then(|s| s.set_camera_enabled(enabled)));
            }
            EngineCommand::SwitchCamera { reply } => {
                let _ = reply.send(self.session_mut().and_then(|s| s.switch_camera()));
            }
            EngineCommand::Incoming(event) => self.on_incoming_event(event).await,
            EngineCommand::Call { generation, signal } => {
                self.on_call_signal(generation, signal).await;
            }
            EngineCommand::Close { .. } => {}
        }
    }

    fn session_mut(&mut self) -> EngineResult<&mut CallSession> {
        self.active.as_mut().ok_or_else(|| EngineError::InvalidState("no active call".to_owned()))
    }

    fn set_state(&mut self, call_id: &CallId, state: CallState) {
        log::info!("call {}: {:?} -> {:?}", call_id, self.state, state);
        self.state = state.clone();
        self.state_tx.send_replace(state.clone());
        let _ = self.emitter.send(CallEvent::StateChanged { call_id: call_id.clone(), state });
    }

    /// Applies `event` to the state of the active call. Events that do not
    /// apply to the current state are ignored.
    fn transition(&mut self, event: StateEvent) -> bool {
        let Some(call_id) = self.active.as_ref().map(|session| session.call_id().clone()) else {
            return false;
        };

        match self.state.next(&event) {
            Some(next) => {
                self.set_state(&call_id, next);
                true
            }
            None => {
                log::debug!("call {}: ignoring {:?} while {:?}", call_id, event, self.state);
                false
            }
        }
    }

    /// Moves the active call to the terminal state for `event`, writes
    /// `status` to the record and cleans up. Does nothing when no call is
    /// active or `event` does not apply.
    async fn finish(&mut self, event: StateEvent, status: Option<CallStatus>) {
        let Some(session) = self.active.as_ref() else {
            return;
        };
        let Some(next) = self.state.next(&event) else {
            log::debug!("call {}: ignoring {:?} while {:?}", session.call_id(), event, self.state);
            return;
        };

        if let Some(status) = status {
            session.write_status(status).await;
        }
        self.cleanup(next).await;
    }

    /// Runs at most once per call, later calls find no active session.
    async fn cleanup(&mut self, final_state: CallState) {
        let Some(mut session) = self.active.take() else {
            return;
        };
        let call_id = session.call_id().clone();
        session.close();
        // Until its terminal status is seen the record may still look ringing.
        if session.role() == CallRole::Callee && !session.record_settled() {
            self.handled.insert(call_id.as_str());
        }
        self.set_state(&call_id, final_state.clone());

        if self.options.remove_record_on_end && session.role() == CallRole::Caller {
            session.remove_record().await;
        }

        let _ = self.emitter.send(CallEvent::CallEnded {
            call_id: call_id.clone(),
            final_state,
            duration: session.duration(),
        });

        if let Some(idle) = self.state.next(&StateEvent::Reset) {
            self.set_state(&call_id, idle);
        }
    }

    async fn fail_setup(&mut self, err: &EngineError) {
        log::error!("call setup failed: {}", err);
        self.finish(StateEvent::SetupError(err.to_string()), Some(CallStatus::Failed)).await;
    }

    /// Reports a call that failed before it had a session.
    fn abort_call(&mut self, call_id: &CallId, event: StateEvent, reason: String) {
        let Some(initializing) = self.state.next(&event) else {
            return;
        };
        self.set_state(call_id, initializing);
        let failed = CallState::Failed(FailureReason::Negotiation(reason));
        self.set_state(call_id, failed.clone());
        let _ = self.emitter.send(CallEvent::CallEnded {
            call_id: call_id.clone(),
            final_state: failed,
            duration: None,
        });
        self.set_state(call_id, CallState::Idle);
    }

    fn begin_session(
        &mut self,
        route: CallRoute,
        role: CallRole,
        is_video: bool,
        event: StateEvent,
    ) -> EngineResult<()> {
        let created = self.factory.create_peer_connection(self.options.rtc_config.clone());
        let peer_connection = match created {
            Ok(peer_connection) => peer_connection,
            Err(err) => {
                self.abort_call(&route.call_id, event, err.to_string());
                return Err(err.into());
            }
        };

        self.next_generation += 1;
        let session = CallSession::new(
            self.next_generation,
            route,
            role,
            is_video,
            peer_connection,
            self.channel.clone(),
            self.options.retry.clone(),
            self.commands.clone(),
        );
        self.active = Some(session);
        self.transition(event);
        Ok(())
    }

    async fn start_call(&mut self, target: EndpointId, is_video: bool) -> EngineResult<CallId> {
        if self.active.is_some() {
            return Err(EngineError::Busy);
        }
        if target.is_empty() {
            return Err(EngineError::NotFound("no call target".to_owned()));
        }
        if target == self.local_id {
            return Err(EngineError::InvalidState("cannot call yourself".to_owned()));
        }
        if self.options.verify_target {
            let channel = &self.channel;
            let exists =
                with_retry(&self.options.retry, "look up call target", || channel.endpoint_exists(&target))
                    .await?;
            if !exists {
                return Err(EngineError::NotFound(format!("{} is not registered", target)));
            }
        }

        let call_id = CallId::generate();
        let route =
            CallRoute { call_id: call_id.clone(), caller: self.local_id.clone(), callee: target };
        log::info!("calling {} (call {}, video: {})", route.callee, call_id, is_video);
        self.begin_session(route, CallRole::Caller, is_video, StateEvent::Initiate)?;

        if let Err(err) = self.send_offer().await {
            self.fail_setup(&err).await;
            return Err(err);
        }
        Ok(call_id)
    }

    async fn send_offer(&mut self) -> EngineResult<()> {
        let caller_name = self.options.caller_name.clone();
        let session = self.session_mut()?;
        session.set_caller_name(caller_name);
        session.send_offer().await?;

        self.transition(StateEvent::OfferSent);
        let ring_timeout = self.options.ring_timeout;
        self.session_mut()?.supervisor().arm(TimerKind::Ring, ring_timeout);
        Ok(())
    }

    async fn answer_call(&mut self, call_id: CallId, with_video: bool) -> EngineResult<()> {
        let session = match self.active.as_mut() {
            Some(session) if *session.call_id() == call_id => session,
            _ => return Err(EngineError::NotFound(format!("no incoming call {}", call_id))),
        };
        if session.role() != CallRole::Callee {
            return Err(EngineError::InvalidState("cannot answer an outgoing call".to_owned()));
        }
        if !matches!(self.state, CallState::Initializing | CallState::Ringing) {
            return Err(EngineError::InvalidState(format!("cannot answer while {:?}", self.state)));
        }

        if let Err(err) = session.answer(with_video).await {
            self.fail_setup(&err).await;
            return Err(err);
        }

        if self.state == CallState::Initializing {
            self.transition(StateEvent::IncomingPresented);
        }
        self.transition(StateEvent::LocalAnswerSent);
        let connect_timeout = self.options.connect_timeout;
        let supervisor = self.session_mut()?.supervisor();
        supervisor.disarm(TimerKind::Ring);
        supervisor.arm(TimerKind::Connect, connect_timeout);
        Ok(())
    }

    async fn reject_call(&mut self, call_id: CallId) -> EngineResult<()> {
        let session = match self.active.as_ref() {
            Some(session) if *session.call_id() == call_id => session,
            _ => return Err(EngineError::NotFound(format!("no incoming call {}", call_id))),
        };
        if session.role() != CallRole::Callee {
            return Err(EngineError::InvalidState("cannot reject an outgoing call".to_owned()));
        }
        if !matches!(self.state, CallState::Initializing | CallState::Ringing) {
            return Err(EngineError::InvalidState("the call was already answered".to_owned()));
        }

        log::info!("rejecting call {}", call_id);
        self.finish(StateEvent::LocalEnd, Some(CallStatus::Rejected)).await;
        Ok(())
    }

    async fn on_incoming_event(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Added { key, value } | ChildEvent::Changed { key, value } => {
                self.on_incoming_record(key, value).await;
            }
            ChildEvent::Removed { key } => {
                self.handled.forget(&key);
            }
        }
    }

    async fn on_incoming_record(&mut self, key: String, value: Value) {
        let record: CallRecord = match decode("record", value) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("ignoring unreadable call record {}: {}", key, err);
                return;
            }
        };
        if record.call_id != key {
            log::warn!("call record {} carries call id {}", key, record.call_id);
        }

        if let Some(session) = self.active.as_mut() {
            if session.call_id().as_str() == key {
                if record.status.is_terminal() {
                    session.mark_record_settled();
                } else if session.role() == CallRole::Callee
                    && self.state == CallState::Initializing
                    && record.has_offer()
                {
                    self.present_incoming();
                }
                return;
            }
        }

        if record.status.is_terminal() {
            self.handled.forget(&key);
            return;
        }
        if record.status != CallStatus::Ringing || self.handled.contains(&key) {
            return;
        }
        if self.local_id != *record.callee_id.as_str() || self.local_id == *record.caller_id.as_str()
        {
            log::warn!("ignoring call record {} not addressed to {}", key, self.local_id);
            return;
        }

        let route = CallRoute {
            call_id: key.clone().into(),
            caller: record.caller_id.clone().into(),
            callee: self.local_id.clone(),
        };

        if self.active.is_some() {
            if self.handled.insert(&key) {
                log::info!("declining call {} from {}, busy", route.call_id, route.caller);
                let channel = &self.channel;
                let declined = with_retry(&self.options.retry, "decline call", || {
                    channel.write_status(&route, CallRole::Callee, CallStatus::Rejected)
                })
                .await;
                if let Err(err) = declined {
                    log::warn!("failed to decline call {}: {}", route.call_id, err);
                }
            }
            return;
        }

        log::info!("incoming call {} from {}", route.call_id, route.caller);
        if let Err(err) =
            self.begin_session(route, CallRole::Callee, record.is_video, StateEvent::IncomingRinging)
        {
            log::error!("failed to set up incoming call {}: {}", key, err);
            return;
        }

        let ring_timeout = self.options.ring_timeout;
        let watched = match self.session_mut() {
            Ok(session) => {
                session.set_caller_name(record.caller_name.clone());
                session.supervisor().arm(TimerKind::Ring, ring_timeout);
                session.watch_status()
            }
            Err(err) => Err(err),
        };
        if let Err(err) = watched {
            self.fail_setup(&err).await;
            return;
        }

        if record.has_offer() {
            self.present_incoming();
        }
    }

    /// The incoming record carries its offer, the user can now answer.
    fn present_incoming(&mut self) {
        if !self.transition(StateEvent::IncomingPresented) {
            return;
        }
        if let Some(session) = &self.active {
            let _ = self.emitter.send(CallEvent::IncomingCall {
                call_id: session.call_id().clone(),
                caller: session.route().caller.clone(),
                caller_name: session.caller_name().map(str::to_owned),
                is_video: session.is_video(),
            });
        }
    }

    async fn on_call_signal(&mut self, generation: u64, signal: CallSignal) {
        let Some(session) = self.active.as_mut() else {
            return;
        };
        if session.generation() != generation {
            log::debug!("dropping {:?} from a previous call", signal);
            return;
        }

        match signal {
            CallSignal::Answer(value) => self.on_remote_answer(value).await,
            CallSignal::Status(value) => self.on_remote_status(value).await,
            CallSignal::RemoteCandidate(event) => session.on_remote_candidate(event).await,
            CallSignal::Rtc(event) => self.on_rtc_event(event).await,
            CallSignal::Timer { kind, seq } => {
                if session.supervisor().fired(kind, seq) {
                    self.on_timer(kind).await;
                }
            }
        }
    }

    async fn on_remote_answer(&mut self, value: Option<Value>) {
        let Ok(session) = self.session_mut() else {
            return;
        };
        match session.on_remote_answer(value).await {
            Ok(true) => {
                if self.transition(StateEvent::RemoteAnswerObserved) {
                    let connect_timeout = self.options.connect_timeout;
                    if let Ok(session) = self.session_mut() {
                        session.supervisor().disarm(TimerKind::Ring);
                        session.supervisor().arm(TimerKind::Connect, connect_timeout);
                    }
                }
            }
            Ok(false) => {}
            Err(err) => self.fail_setup(&err).await,
        }
    }

    async fn on_remote_status(&mut self, value: Option<Value>) {
        let Some(value) = value else {
            log::info!("call record was removed");
            self.finish(StateEvent::RecordRemoved, None).await;
            return;
        };

        match decode_status(&value) {
            Ok(status) if status.is_terminal() => {
                log::info!("remote side marked the call {}", status);
                self.finish(StateEvent::RemoteStatus(status), None).await;
            }
            Ok(_) => {}
            Err(err) => log::warn!("ignoring unreadable call status: {}", err),
        }
    }

    async fn on_rtc_event(&mut self, event: RtcEvent) {
        match event {
            RtcEvent::CandidateGenerated(candidate) => {
                if let Ok(session) = self.session_mut() {
                    session.on_local_candidate(candidate).await;
                }
            }
            RtcEvent::ConnectionStateChanged(state) => self.on_ice_state(state).await,
            RtcEvent::TrackReceived(event) => {
                if let Some(session) = &self.active {
                    let _ = self.emitter.send(CallEvent::RemoteTrack {
                        call_id: session.call_id().clone(),
                        track: event.track,
                        stream_ids: event.stream_ids,
                    });
                }
            }
            RtcEvent::RenegotiationRequested => {
                log::debug!("renegotiation is not supported, ignoring");
            }
        }
    }

    async fn on_ice_state(&mut self, ice_state: IceConnectionState) {
        log::debug!("ice connection state: {:?}", ice_state);
        let grace = self.options.disconnect_grace;

        match ice_state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if self.state == CallState::Connecting {
                    if self.transition(StateEvent::IceConnected) {
                        if let Ok(session) = self.session_mut() {
                            session.mark_connected();
                            session.supervisor().disarm(TimerKind::Connect);
                        }
                    }
                } else if self.state == CallState::Connected {
                    if let Ok(session) = self.session_mut() {
                        if session.supervisor().is_armed(TimerKind::Grace) {
                            log::info!("connection of call {} restored", session.call_id());
                            session.supervisor().disarm(TimerKind::Grace);
                        }
                    }
                }
            }
            IceConnectionState::Disconnected => {
                if self.state == CallState::Connected {
                    if let Ok(session) = self.session_mut() {
                        if !session.supervisor().is_armed(TimerKind::Grace) {
                            log::warn!("call {} disconnected, waiting {:?}", session.call_id(), grace);
                            session.supervisor().arm(TimerKind::Grace, grace);
                        }
                    }
                }
            }
            IceConnectionState::Failed => {
                self.finish(StateEvent::IceFailed, Some(CallStatus::Failed)).await;
            }
            _ => {}
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        log::info!("{:?} timer expired", kind);
        match kind {
            TimerKind::Ring => self.finish(StateEvent::RingTimeout, Some(CallStatus::Missed)).await,
            TimerKind::Connect => {
                self.finish(StateEvent::ConnectTimeout, Some(CallStatus::Failed)).await
            }
            TimerKind::Grace => self.finish(StateEvent::GraceExpired, Some(CallStatus::Failed)).await,
        }
    }

    async fn shutdown(&mut self) {
        self.finish(StateEvent::LocalEnd, Some(CallStatus::Ended)).await;
        self.incoming_task.abort();
    }
}

/// Incoming records that were declined while busy or whose call is over.
///
/// A key is kept until its record shows a terminal status or disappears, so
/// the set only holds calls that could still ring.
#[derive(Debug, Default)]
struct HandledCalls {
    keys: HashSet<String>,
}

impl HandledCalls {
    fn insert(&mut self, key: &str) -> bool {
        self.keys.insert(key.to_owned())
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn forget(&mut self, key: &str) {
        self.keys.remove(key);
    }
}

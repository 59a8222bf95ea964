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

//! Call protocol messages expressed as reads, writes and subscriptions on the
//! shared store.
//!
//! The channel never retries, retryable failures are reported as such and
//! the call engine decides what to do with them.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use syncflow_protocol::{
    fields, server_timestamp, CallRecord, CallRole, CallStatus, IceCandidatePayload,
    SessionDescriptionPayload,
};
use syncflow_store::{
    ChildSubscription, SignalStore, StoreError, StorePath, ValueSubscription,
};
use syncflow_webrtc::prelude::*;
use thiserror::Error;

use crate::id::EndpointId;

mod addressing;

pub use addressing::{
    AddressingStrategy, CallRoute, DeviceAddressing, IdentityAddressing, RecordField,
    DEVICE_COLLECTION, IDENTITY_COLLECTION,
};

pub type SignalResult<T> = Result<T, SignalError>;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("{role:?} is not allowed to write {field:?}")]
    Forbidden { role: CallRole, field: RecordField },
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("no call record at {0}")]
    RecordMissing(String),
    #[error("call is already {current}, cannot become {requested}")]
    StatusConflict { current: CallStatus, requested: CallStatus },
}

impl SignalError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SignalError::Store(err) if err.is_retryable())
    }
}

#[derive(Debug, Clone)]
pub struct SignalChannel {
    store: Arc<dyn SignalStore>,
    addressing: Arc<dyn AddressingStrategy>,
}

impl SignalChannel {
    pub fn new(store: Arc<dyn SignalStore>, addressing: Arc<dyn AddressingStrategy>) -> Self {
        Self { store, addressing }
    }

    pub fn addressing(&self) -> &Arc<dyn AddressingStrategy> {
        &self.addressing
    }

    pub async fn write(&self, path: &StorePath, value: Value) -> SignalResult<()> {
        Ok(self.store.set(path, value).await?)
    }

    /// Reads the value at `path` once.
    pub async fn read_once(&self, path: &StorePath) -> SignalResult<Option<Value>> {
        Ok(self.store.get(path).await?)
    }

    pub fn subscribe_value(&self, path: &StorePath) -> SignalResult<ValueSubscription> {
        Ok(self.store.on_value_changed(path)?)
    }

    pub fn subscribe_changes(&self, path: &StorePath) -> SignalResult<ChildSubscription> {
        Ok(self.store.on_child_event(path)?)
    }

    pub async fn append_child(&self, path: &StorePath, value: Value) -> SignalResult<String> {
        Ok(self.store.push(path, value).await?)
    }

    pub fn record_path(&self, route: &CallRoute) -> SignalResult<StorePath> {
        Ok(self.addressing.record_path(route)?)
    }

    fn field_path(&self, route: &CallRoute, field: &str) -> SignalResult<StorePath> {
        Ok(self.record_path(route)?.child(field)?)
    }

    fn check_owner(&self, role: CallRole, field: RecordField) -> SignalResult<()> {
        if self.addressing.may_write(role, field) {
            Ok(())
        } else {
            Err(SignalError::Forbidden { role, field })
        }
    }

    /// Publishes a new ringing record. Depending on the addressing mode the
    /// offer is part of the same write or follows as a sub-field write.
    pub async fn create_record(
        &self,
        route: &CallRoute,
        role: CallRole,
        record: &CallRecord,
    ) -> SignalResult<()> {
        self.check_owner(role, RecordField::Record)?;
        let path = self.record_path(route)?;

        if self.addressing.embeds_offer_in_record() {
            let value = record.to_initial_value().map_err(|err| encode_error("record", err))?;
            log::debug!("creating call record {} with offer", path);
            return self.write(&path, value).await;
        }

        let mut initial = record.clone();
        let offer = initial.offer.take();
        let value = initial.to_initial_value().map_err(|err| encode_error("record", err))?;
        log::debug!("creating call record {}", path);
        self.write(&path, value).await?;

        if let Some(offer) = offer {
            self.write_offer(route, role, &offer).await?;
        }
        Ok(())
    }

    pub async fn write_offer(
        &self,
        route: &CallRoute,
        role: CallRole,
        offer: &SessionDescriptionPayload,
    ) -> SignalResult<()> {
        self.check_owner(role, RecordField::Offer)?;
        let value = serde_json::to_value(offer).map_err(|err| encode_error("offer", err))?;
        self.write(&self.field_path(route, fields::OFFER)?, value).await
    }

    /// Writes the answer and moves the record to `active` in one update.
    pub async fn write_answer(
        &self,
        route: &CallRoute,
        role: CallRole,
        answer: &SessionDescriptionPayload,
    ) -> SignalResult<()> {
        self.check_owner(role, RecordField::Answer)?;
        let current = self.read_status(route).await?;
        match current {
            None => return Err(SignalError::RecordMissing(self.record_path(route)?.to_string())),
            Some(CallStatus::Ringing) => {}
            Some(current) => {
                return Err(SignalError::StatusConflict { current, requested: CallStatus::Active })
            }
        }

        let mut update = Map::new();
        update.insert(
            fields::ANSWER.to_owned(),
            serde_json::to_value(answer).map_err(|err| encode_error("answer", err))?,
        );
        update.insert(fields::STATUS.to_owned(), Value::from(CallStatus::Active.as_str()));
        update.insert(fields::ANSWERED_AT.to_owned(), server_timestamp());
        Ok(self.store.update(&self.record_path(route)?, update).await?)
    }

    /// Appends a local candidate to the collection owned by `role`.
    pub async fn append_candidate(
        &self,
        route: &CallRoute,
        role: CallRole,
        candidate: &IceCandidatePayload,
    ) -> SignalResult<String> {
        self.check_owner(role, RecordField::candidates_of(role))?;
        let value =
            serde_json::to_value(candidate).map_err(|err| encode_error("candidate", err))?;
        self.append_child(&self.field_path(route, role.candidates_field())?, value).await
    }

    /// Moves the record to `status` when the current status allows it.
    ///
    /// Returns false without writing when the record is gone or the
    /// transition is not allowed (e.g. the remote side already ended it).
    pub async fn write_status(
        &self,
        route: &CallRoute,
        role: CallRole,
        status: CallStatus,
    ) -> SignalResult<bool> {
        self.check_owner(role, RecordField::Status)?;
        let Some(current) = self.read_status(route).await? else {
            return Ok(false);
        };
        if !current.can_transition_to(status) {
            log::debug!("not writing status {} over {} for {}", status, current, route.call_id);
            return Ok(false);
        }

        let mut update = Map::new();
        update.insert(fields::STATUS.to_owned(), Value::from(status.as_str()));
        if status == CallStatus::Active {
            update.insert(fields::ANSWERED_AT.to_owned(), server_timestamp());
        } else if status.is_terminal() {
            update.insert(fields::ENDED_AT.to_owned(), server_timestamp());
        }
        self.store.update(&self.record_path(route)?, update).await?;
        Ok(true)
    }

    pub async fn read_status(&self, route: &CallRoute) -> SignalResult<Option<CallStatus>> {
        self.read_once(&self.field_path(route, fields::STATUS)?)
            .await?
            .map(|value| decode_status(&value))
            .transpose()
    }

    pub async fn read_record(&self, route: &CallRoute) -> SignalResult<Option<CallRecord>> {
        self.read_once(&self.record_path(route)?)
            .await?
            .map(|value| decode("record", value))
            .transpose()
    }

    pub async fn remove_record(&self, route: &CallRoute, role: CallRole) -> SignalResult<()> {
        self.check_owner(role, RecordField::Record)?;
        Ok(self.store.remove(&self.record_path(route)?).await?)
    }

    pub async fn endpoint_exists(&self, endpoint: &EndpointId) -> SignalResult<bool> {
        Ok(self.read_once(&self.addressing.endpoint_path(endpoint)?).await?.is_some())
    }

    pub fn watch_answer(&self, route: &CallRoute) -> SignalResult<ValueSubscription> {
        self.subscribe_value(&self.field_path(route, fields::ANSWER)?)
    }

    pub fn watch_status(&self, route: &CallRoute) -> SignalResult<ValueSubscription> {
        self.subscribe_value(&self.field_path(route, fields::STATUS)?)
    }

    /// Candidates published by `from`.
    pub fn watch_candidates(
        &self,
        route: &CallRoute,
        from: CallRole,
    ) -> SignalResult<ChildSubscription> {
        self.subscribe_changes(&self.field_path(route, from.candidates_field())?)
    }

    /// Every record addressed to `local`.
    pub fn watch_incoming(&self, local: &EndpointId) -> SignalResult<ChildSubscription> {
        self.subscribe_changes(&self.addressing.incoming_collection(local)?)
    }
}

fn encode_error(what: &'static str, err: serde_json::Error) -> SignalError {
    SignalError::Decode { what, reason: err.to_string() }
}

pub fn decode<T: DeserializeOwned>(what: &'static str, value: Value) -> SignalResult<T> {
    serde_json::from_value(value).map_err(|err| SignalError::Decode { what, reason: err.to_string() })
}

pub fn decode_status(value: &Value) -> SignalResult<CallStatus> {
    value
        .as_str()
        .ok_or_else(|| SignalError::Decode { what: "status", reason: format!("{}", value) })?
        .parse()
        .map_err(|err: syncflow_protocol::UnknownStatus| SignalError::Decode {
            what: "status",
            reason: err.to_string(),
        })
}

pub fn description_to_payload(desc: &SessionDescription) -> SessionDescriptionPayload {
    SessionDescriptionPayload { sdp_type: desc.sdp_type().to_string(), sdp: desc.sdp().to_owned() }
}

pub fn payload_to_description(
    payload: &SessionDescriptionPayload,
    expected: SdpType,
) -> SignalResult<SessionDescription> {
    let sdp_type: SdpType = payload
        .sdp_type
        .parse()
        .map_err(|err: &str| SignalError::Decode { what: "sdp type", reason: err.to_owned() })?;
    if sdp_type != expected {
        return Err(SignalError::Decode {
            what: "sdp type",
            reason: format!("expected {}, got {}", expected, sdp_type),
        });
    }
    SessionDescription::parse(&payload.sdp, sdp_type)
        .map_err(|err| SignalError::Decode { what: "session description", reason: err.to_string() })
}

pub fn candidate_to_payload(candidate: &IceCandidate) -> IceCandidatePayload {
    IceCandidatePayload {
        candidate: candidate.candidate(),
        sdp_mid: candidate.sdp_mid(),
        sdp_m_line_index: candidate.sdp_mline_index(),
    }
}

pub fn payload_to_candidate(payload: &IceCandidatePayload) -> SignalResult<IceCandidate> {
    IceCandidate::parse(&payload.sdp_mid, payload.sdp_m_line_index, &payload.candidate)
        .map_err(|err| SignalError::Decode { what: "ice candidate", reason: err.to_string() })
}

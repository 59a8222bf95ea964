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
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use syncflow_protocol::CallRole;
use syncflow_webrtc::prelude::*;
use tokio::sync::Mutex as AsyncMutex;

use super::{EngineError, EngineResult};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

struct TransportInner {
    pending_candidates: Vec<IceCandidate>,
    has_remote_description: bool,
}

/// Wraps the one peer connection of a call and enforces the negotiation order.
pub struct PeerTransport {
    id: u64,
    role: CallRole,
    peer_connection: Arc<dyn PeerConnection>,
    inner: Arc<AsyncMutex<TransportInner>>,
}

/// Proof that a remote offer was applied to a transport.
///
/// Only [`PeerTransport::apply_remote_offer`] creates it and
/// [`PeerTransport::create_answer`] consumes it, so an answer can never be
/// created before the remote description is set.
#[derive(Debug)]
pub struct RemoteOfferApplied {
    transport_id: u64,
}

impl Debug for PeerTransport {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("PeerTransport").field("id", &self.id).field("role", &self.role).finish()
    }
}

impl PeerTransport {
    pub fn new(peer_connection: Arc<dyn PeerConnection>, role: CallRole) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            role,
            peer_connection,
            inner: Arc::new(AsyncMutex::new(TransportInner {
                pending_candidates: Vec::default(),
                has_remote_description: false,
            })),
        }
    }

    pub fn peer_connection(&self) -> Arc<dyn PeerConnection> {
        self.peer_connection.clone()
    }

    /// Candidates received before the remote description are kept until it is set.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.has_remote_description {
            inner.pending_candidates.push(candidate);
            return Ok(());
        }

        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    pub async fn set_remote_description(
        &self,
        remote_description: SessionDescription,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        self.peer_connection.set_remote_description(remote_description).await?;
        inner.has_remote_description = true;

        for candidate in inner.pending_candidates.drain(..) {
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                log::warn!("failed to add buffered ice candidate: {}", err);
            }
        }
        Ok(())
    }

    /// Creates the offer and applies it as the local description.
    pub async fn create_offer(&self, options: OfferOptions) -> EngineResult<SessionDescription> {
        if self.role != CallRole::Caller {
            return Err(EngineError::Negotiation("only the caller creates an offer".to_owned()));
        }

        let offer = self.peer_connection.create_offer(options).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    pub async fn apply_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> EngineResult<RemoteOfferApplied> {
        if self.role != CallRole::Callee {
            return Err(EngineError::Negotiation("only the callee applies an offer".to_owned()));
        }
        if offer.sdp_type() != SdpType::Offer {
            return Err(EngineError::Negotiation(format!(
                "expected an offer, got {}",
                offer.sdp_type()
            )));
        }

        self.set_remote_description(offer).await?;
        Ok(RemoteOfferApplied { transport_id: self.id })
    }

    /// Creates the answer and applies it as the local description.
    pub async fn create_answer(
        &self,
        proof: RemoteOfferApplied,
        options: AnswerOptions,
    ) -> EngineResult<SessionDescription> {
        if proof.transport_id != self.id {
            return Err(EngineError::Negotiation(
                "the remote offer was applied to another transport".to_owned(),
            ));
        }

        let answer = self.peer_connection.create_answer(options).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub fn close(&self) {
        self.peer_connection.close();
    }
}

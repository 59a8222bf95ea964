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

use syncflow_protocol::CallRole;
use syncflow_store::{StorePath, StoreResult};

use crate::id::{CallId, EndpointId};

pub const DEVICE_COLLECTION: &str = "calls";
pub const IDENTITY_COLLECTION: &str = "incoming_syncflow_calls";

/// The two endpoints of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallRoute {
    pub call_id: CallId,
    pub caller: EndpointId,
    pub callee: EndpointId,
}

impl CallRoute {
    pub fn endpoint(&self, role: CallRole) -> &EndpointId {
        match role {
            CallRole::Caller => &self.caller,
            CallRole::Callee => &self.callee,
        }
    }
}

/// Parts of a call record a party may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    /// Creating or deleting the whole record.
    Record,
    Offer,
    Answer,
    CallerCandidates,
    CalleeCandidates,
    Status,
}

impl RecordField {
    pub fn candidates_of(role: CallRole) -> Self {
        match role {
            CallRole::Caller => RecordField::CallerCandidates,
            CallRole::Callee => RecordField::CalleeCandidates,
        }
    }
}

/// Decides where a call lives in the store and who may write what.
pub trait AddressingStrategy: Send + Sync + Debug {
    fn namespace(&self) -> &StorePath;

    /// Name of the per-endpoint collection holding incoming call records.
    fn collection(&self) -> &'static str;

    /// Whether the offer is part of the initial record write.
    fn embeds_offer_in_record(&self) -> bool;

    fn record_path(&self, route: &CallRoute) -> StoreResult<StorePath> {
        self.incoming_collection(&route.callee)?.child(route.call_id.as_str())
    }

    fn incoming_collection(&self, local: &EndpointId) -> StoreResult<StorePath> {
        self.endpoint_path(local)?.child(self.collection())
    }

    fn endpoint_path(&self, endpoint: &EndpointId) -> StoreResult<StorePath> {
        self.namespace().child(endpoint.as_str())
    }

    fn may_write(&self, role: CallRole, field: RecordField) -> bool {
        match field {
            RecordField::Record | RecordField::Offer | RecordField::CallerCandidates => {
                role == CallRole::Caller
            }
            RecordField::Answer | RecordField::CalleeCandidates => role == CallRole::Callee,
            RecordField::Status => true,
        }
    }
}

/// Records under the callee device, the record is created first and every
/// negotiation message is a separate sub-field write.
#[derive(Debug, Clone)]
pub struct DeviceAddressing {
    namespace: StorePath,
}

impl DeviceAddressing {
    pub fn new(namespace: StorePath) -> Self {
        Self { namespace }
    }
}

impl AddressingStrategy for DeviceAddressing {
    fn namespace(&self) -> &StorePath {
        &self.namespace
    }

    fn collection(&self) -> &'static str {
        DEVICE_COLLECTION
    }

    fn embeds_offer_in_record(&self) -> bool {
        false
    }
}

/// Records under the callee user identity, the caller writes the whole
/// record including its offer at once.
#[derive(Debug, Clone)]
pub struct IdentityAddressing {
    namespace: StorePath,
}

impl IdentityAddressing {
    pub fn new(namespace: StorePath) -> Self {
        Self { namespace }
    }
}

impl AddressingStrategy for IdentityAddressing {
    fn namespace(&self) -> &StorePath {
        &self.namespace
    }

    fn collection(&self) -> &'static str {
        IDENTITY_COLLECTION
    }

    fn embeds_offer_in_record(&self) -> bool {
        true
    }
}

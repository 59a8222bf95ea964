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

use crate::session_description::SdpParseError;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    sdp_mid: String,
    sdp_mline_index: i32,
    candidate: String,
}

impl IceCandidate {
    pub fn parse(
        sdp_mid: &str,
        sdp_mline_index: i32,
        sdp: &str,
    ) -> Result<IceCandidate, SdpParseError> {
        let sdp = sdp.trim();
        if sdp.is_empty() {
            return Err(SdpParseError {
                line: String::new(),
                description: "empty ice candidate".to_owned(),
            });
        }

        if sdp_mline_index < 0 {
            return Err(SdpParseError {
                line: sdp.to_owned(),
                description: format!("invalid m-line index {}", sdp_mline_index),
            });
        }

        Ok(IceCandidate {
            sdp_mid: sdp_mid.to_owned(),
            sdp_mline_index,
            candidate: sdp.to_owned(),
        })
    }

    pub fn sdp_mid(&self) -> String {
        self.sdp_mid.clone()
    }

    pub fn sdp_mline_index(&self) -> i32 {
        self.sdp_mline_index
    }

    pub fn candidate(&self) -> String {
        self.candidate.clone()
    }
}

impl ToString for IceCandidate {
    fn to_string(&self) -> String {
        self.candidate()
    }
}

impl Debug for IceCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceCandidate")
            .field("sdp_mid", &self.sdp_mid)
            .field("candidate", &self.candidate)
            .finish()
    }
}

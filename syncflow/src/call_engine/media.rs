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

use syncflow_webrtc::prelude::*;

use super::{EngineError, EngineResult};

/// Local tracks of the current call.
///
/// Toggles only enable or disable existing tracks, nothing here triggers a
/// renegotiation. Toggles made before the tracks exist are applied when they
/// are published.
#[derive(Debug)]
pub struct MediaTracks {
    audio: Option<MediaStreamTrack>,
    video: Option<MediaStreamTrack>,
    microphone_enabled: bool,
    camera_enabled: bool,
    facing: CameraFacing,
}

impl Default for MediaTracks {
    fn default() -> Self {
        Self {
            audio: None,
            video: None,
            microphone_enabled: true,
            camera_enabled: true,
            facing: CameraFacing::default(),
        }
    }
}

impl MediaTracks {
    pub fn publish(&mut self, pc: &dyn PeerConnection, with_video: bool) -> EngineResult<()> {
        if self.audio.is_some() {
            return Err(EngineError::InvalidState("local tracks already published".to_owned()));
        }

        let audio = pc.add_local_track(TrackKind::Audio)?;
        if !self.microphone_enabled {
            pc.set_track_enabled(&audio, false)?;
        }
        self.audio = Some(audio);

        if with_video {
            let video = pc.add_local_track(TrackKind::Video)?;
            if self.facing != CameraFacing::default() {
                pc.replace_video_source(&video, self.facing)?;
            }
            if !self.camera_enabled {
                pc.set_track_enabled(&video, false)?;
            }
            self.video = Some(video);
        }

        log::debug!("published local tracks (video: {})", with_video);
        Ok(())
    }

    pub fn set_microphone_enabled(
        &mut self,
        pc: &dyn PeerConnection,
        enabled: bool,
    ) -> EngineResult<()> {
        if let Some(audio) = &self.audio {
            pc.set_track_enabled(audio, enabled)?;
        }
        self.microphone_enabled = enabled;
        Ok(())
    }

    pub fn set_camera_enabled(&mut self, pc: &dyn PeerConnection, enabled: bool) -> EngineResult<()> {
        if let Some(video) = &self.video {
            pc.set_track_enabled(video, enabled)?;
        }
        self.camera_enabled = enabled;
        Ok(())
    }

    /// Swaps the capture source of the existing video track.
    pub fn switch_camera(&mut self, pc: &dyn PeerConnection) -> EngineResult<CameraFacing> {
        let Some(video) = &self.video else {
            return Err(EngineError::InvalidState("the call has no video track".to_owned()));
        };

        let facing = self.facing.flipped();
        pc.replace_video_source(video, facing)?;
        self.facing = facing;
        Ok(facing)
    }

    pub fn clear(&mut self) {
        self.audio = None;
        self.video = None;
    }
}

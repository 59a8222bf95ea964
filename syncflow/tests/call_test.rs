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

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use common::*;
use serde_json::json;
use syncflow::prelude::*;
use syncflow::webrtc::prelude::{IceConnectionState, TrackKind};

mod common;

fn pair(store: &Arc<MemoryStore>, mode: AddressingMode) -> Result<(TestPeer, TestPeer)> {
    let alice = test_peer(store, "alice", FakeFactory::connecting(), test_options(mode))?;
    let bob = test_peer(store, "bob", FakeFactory::connecting(), test_options(mode))?;
    Ok((alice, bob))
}

#[tokio::test(start_paused = true)]
async fn video_call_connects_both_sides() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    let call_id = connect_call(&mut alice, &mut bob, true).await?;
    assert_eq!(alice.engine.state(), CallState::Connected);
    assert_eq!(bob.engine.state(), CallState::Connected);

    let path = record_path(AddressingMode::Device, "bob", &call_id)?;
    assert_eq!(status_at(&store, &path).as_deref(), Some("active"));

    let record = store.value_at(&path).ok_or_else(|| anyhow!("record missing"))?;
    assert_eq!(record["callerId"], "alice");
    assert_eq!(record["calleeId"], "bob");
    assert_eq!(record["isVideo"], true);
    assert_eq!(record["offer"]["type"], "offer");
    assert_eq!(record["answer"]["type"], "answer");
    assert!(record["answeredAt"].is_i64());

    settle().await;
    let alice_pc = alice.pc()?;
    let bob_pc = bob.pc()?;
    assert_eq!(alice_pc.remote_candidates().len(), CANDIDATES_PER_DESCRIPTION as usize);
    assert_eq!(bob_pc.remote_candidates().len(), CANDIDATES_PER_DESCRIPTION as usize);
    assert_eq!(bob_pc.track_enabled(TrackKind::Video), Some(true));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn callee_applies_offer_before_creating_answer() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    connect_call(&mut alice, &mut bob, false).await?;

    let bob_pc = bob.pc()?;
    let set_remote = bob_pc.position("set_remote:offer").ok_or_else(|| anyhow!("offer never applied"))?;
    let create_answer = bob_pc.position("create_answer").ok_or_else(|| anyhow!("no answer created"))?;
    assert!(set_remote < create_answer);
    assert!(!bob_pc.ops().iter().any(|op| op.ends_with(":rejected")));

    let alice_pc = alice.pc()?;
    assert!(!alice_pc.ops().iter().any(|op| op.ends_with(":rejected")));
    assert_eq!(alice_pc.track_enabled(TrackKind::Video), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hang_up_ends_the_call_on_both_sides() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    let call_id = connect_call(&mut alice, &mut bob, false).await?;
    tokio::time::sleep(Duration::from_secs(42)).await;
    alice.engine.end_call().await?;

    assert_eq!(alice.wait_for_end().await?, CallState::Ended);
    assert_eq!(bob.wait_for_end().await?, CallState::Ended);
    settle().await;

    assert_eq!(alice.engine.state(), CallState::Idle);
    assert_eq!(bob.engine.state(), CallState::Idle);
    assert!(alice.pc()?.is_closed());
    assert!(bob.pc()?.is_closed());

    let path = record_path(AddressingMode::Device, "bob", &call_id)?;
    assert_eq!(status_at(&store, &path).as_deref(), Some("ended"));
    assert!(store.value_at(&path.child("endedAt")?).is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn call_ended_reports_connected_duration() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    connect_call(&mut alice, &mut bob, false).await?;
    tokio::time::sleep(Duration::from_secs(30)).await;
    bob.engine.end_call().await?;

    let duration = loop {
        if let CallEvent::CallEnded { duration, .. } = bob.next_event().await? {
            break duration;
        }
    };
    let duration = duration.ok_or_else(|| anyhow!("connected call without duration"))?;
    assert!(duration >= Duration::from_secs(30));
    assert_eq!(alice.wait_for_end().await?, CallState::Ended);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reject_marks_the_record_rejected() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    let call_id = alice.engine.start_call("bob", false).await?;
    let (incoming, _, _) = bob.wait_for_incoming().await?;
    bob.engine.reject_call(&incoming).await?;

    assert_eq!(bob.wait_for_end().await?, CallState::Ended);
    assert_eq!(alice.wait_for_end().await?, CallState::Ended);

    let path = record_path(AddressingMode::Device, "bob", &call_id)?;
    assert_eq!(status_at(&store, &path).as_deref(), Some("rejected"));
    assert!(bob.pc()?.position("create_answer").is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn caller_cancel_stops_the_ringing_callee() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    let call_id = alice.engine.start_call("bob", false).await?;
    bob.wait_for_incoming().await?;
    alice.engine.end_call().await?;

    assert_eq!(bob.wait_for_end().await?, CallState::Ended);
    assert!(matches!(
        bob.engine.answer_call(&call_id, false).await,
        Err(EngineError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn busy_callee_declines_a_second_call() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;
    let mut carol =
        test_peer(&store, "carol", FakeFactory::connecting(), test_options(AddressingMode::Device))?;

    connect_call(&mut alice, &mut bob, false).await?;

    let carol_call = carol.engine.start_call("bob", false).await?;
    assert_eq!(carol.wait_for_end().await?, CallState::Ended);

    let path = record_path(AddressingMode::Device, "bob", &carol_call)?;
    assert_eq!(status_at(&store, &path).as_deref(), Some("rejected"));

    settle().await;
    assert_eq!(bob.engine.state(), CallState::Connected);
    assert!(bob.drain_events().iter().all(|event| !matches!(event, CallEvent::IncomingCall { .. })));
    assert_eq!(bob.factory.connections().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn placing_a_second_call_is_busy() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    connect_call(&mut alice, &mut bob, false).await?;
    let err = alice.engine.start_call("carol", false).await.err();
    assert!(matches!(err, Some(EngineError::Busy)));
    assert_eq!(alice.engine.state(), CallState::Connected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn engine_requires_a_local_identity() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let result = CallEngine::new(
        "",
        store,
        FakeFactory::connecting(),
        test_options(AddressingMode::Device),
    );
    assert!(matches!(result, Err(EngineError::NotAuthenticated)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn invalid_targets_are_refused() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let mut options = test_options(AddressingMode::Device);
    options.verify_target = true;
    let mut alice = test_peer(&store, "alice", FakeFactory::connecting(), options)?;

    assert!(matches!(alice.engine.start_call("", false).await, Err(EngineError::NotFound(_))));
    assert!(matches!(alice.engine.start_call("ghost", false).await, Err(EngineError::NotFound(_))));
    assert!(matches!(
        alice.engine.start_call("alice", false).await,
        Err(EngineError::InvalidState(_))
    ));

    store.set(&StorePath::parse("users/bob/profile")?, json!({ "name": "Bob" })).await?;
    alice.engine.start_call("bob", false).await?;
    assert_eq!(alice.engine.state(), CallState::Ringing);

    let states = states(&alice.drain_events());
    assert_eq!(states, vec![CallState::Initializing, CallState::Ringing]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn media_failure_reports_a_failed_call() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let mut alice =
        test_peer(&store, "alice", FakeFactory::connecting(), test_options(AddressingMode::Device))?;

    alice.factory.fail_next_connection();
    let err = alice.engine.start_call("bob", true).await.err();
    assert!(matches!(err, Some(EngineError::Rtc(_))));

    let events = alice.drain_events();
    assert_eq!(ended_count(&events), 1);
    let states = states(&events);
    assert_eq!(states.first(), Some(&CallState::Initializing));
    assert!(matches!(states.get(1), Some(CallState::Failed(FailureReason::Negotiation(_)))));
    assert_eq!(states.last(), Some(&CallState::Idle));
    assert!(store.value_at(&StorePath::parse("users/bob")?).is_none());

    alice.engine.start_call("bob", true).await?;
    assert_eq!(alice.engine.state(), CallState::Ringing);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn media_controls_follow_the_active_call() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    assert!(matches!(
        alice.engine.set_microphone_enabled(false).await,
        Err(EngineError::InvalidState(_))
    ));

    connect_call(&mut alice, &mut bob, true).await?;
    let alice_pc = alice.pc()?;

    alice.engine.set_microphone_enabled(false).await?;
    assert_eq!(alice_pc.track_enabled(TrackKind::Audio), Some(false));
    alice.engine.set_camera_enabled(false).await?;
    assert_eq!(alice_pc.track_enabled(TrackKind::Video), Some(false));
    alice.engine.set_camera_enabled(true).await?;
    assert_eq!(alice_pc.track_enabled(TrackKind::Video), Some(true));

    assert_eq!(alice.engine.switch_camera().await?, CameraFacing::Back);
    assert_eq!(alice_pc.facing(), CameraFacing::Back);
    assert_eq!(alice.engine.switch_camera().await?, CameraFacing::Front);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn camera_controls_need_a_video_call() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    connect_call(&mut alice, &mut bob, false).await?;
    assert!(matches!(alice.engine.set_camera_enabled(false).await, Err(EngineError::InvalidState(_))));
    assert!(matches!(alice.engine.switch_camera().await, Err(EngineError::InvalidState(_))));
    alice.engine.set_microphone_enabled(false).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn remote_tracks_are_reported() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    let call_id = connect_call(&mut alice, &mut bob, true).await?;
    bob.pc()?.emit_track(TrackKind::Video);

    loop {
        if let CallEvent::RemoteTrack { call_id: id, track, stream_ids } = bob.next_event().await? {
            assert_eq!(id, call_id);
            assert_eq!(track.kind(), TrackKind::Video);
            assert_eq!(stream_ids.len(), 1);
            break;
        }
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closing_the_engine_ends_the_call() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    let call_id = connect_call(&mut alice, &mut bob, false).await?;
    alice.engine.close().await;

    assert_eq!(bob.wait_for_end().await?, CallState::Ended);
    let path = record_path(AddressingMode::Device, "bob", &call_id)?;
    assert_eq!(status_at(&store, &path).as_deref(), Some("ended"));
    assert!(matches!(alice.engine.start_call("bob", false).await, Err(EngineError::Closed)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ice_failure_while_connected_drops_the_call() -> Result<()> {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = pair(&store, AddressingMode::Device)?;

    connect_call(&mut alice, &mut bob, false).await?;
    alice.pc()?.emit_ice_state(IceConnectionState::Failed);

    assert_eq!(alice.wait_for_end().await?, CallState::Failed(FailureReason::Dropped));
    assert_eq!(bob.wait_for_end().await?, CallState::Failed(FailureReason::RemoteFailed));
    Ok(())
}

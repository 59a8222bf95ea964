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

use std::{collections::HashMap, future::Future, time::Duration};

use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;

use super::{CallSignal, EngineCommand, EngineCommandSender};
use crate::{options::RetryPolicy, signaling::SignalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Ring,
    Connect,
    Grace,
}

/// Owns every subscription and timer of one call.
///
/// All of them feed the engine command queue tagged with the call generation
/// and are aborted together by [`Supervisor::shutdown`].
#[derive(Debug)]
pub struct Supervisor {
    generation: u64,
    commands: EngineCommandSender,
    subscriptions: Vec<JoinHandle<()>>,
    timers: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_timer_seq: u64,
}

impl Supervisor {
    pub fn new(generation: u64, commands: EngineCommandSender) -> Self {
        Self {
            generation,
            commands,
            subscriptions: Vec::new(),
            timers: HashMap::new(),
            next_timer_seq: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Pumps `stream` into the engine until the stream ends or the
    /// supervisor shuts down.
    pub fn forward<S, F>(&mut self, mut stream: S, map: F)
    where
        S: Stream + Send + Unpin + 'static,
        S::Item: Send,
        F: Fn(S::Item) -> CallSignal + Send + 'static,
    {
        let generation = self.generation;
        let commands = self.commands.clone();
        self.subscriptions.push(tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let command = EngineCommand::Call { generation, signal: map(item) };
                if commands.send(command).is_err() {
                    break;
                }
            }
        }));
    }

    /// Arms `kind`, replacing a pending timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.disarm(kind);
        self.next_timer_seq += 1;
        let seq = self.next_timer_seq;
        let generation = self.generation;
        let commands = self.commands.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = commands.send(EngineCommand::Call {
                generation,
                signal: CallSignal::Timer { kind, seq },
            });
        });
        self.timers.insert(kind, (seq, handle));
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.timers.remove(&kind) {
            handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    /// Consumes a timer expiry. A timer that was disarmed or re-armed after
    /// the expiry was queued is reported as not fired.
    pub fn fired(&mut self, kind: TimerKind, seq: u64) -> bool {
        match self.timers.get(&kind) {
            Some((armed, _)) if *armed == seq => {
                self.timers.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn shutdown(&mut self) {
        for handle in self.subscriptions.drain(..) {
            handle.abort();
        }
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs `operation` until it succeeds, fails with a non retryable error or
/// the policy runs out of attempts.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut operation: F) -> SignalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SignalResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                log::warn!(
                    "{} failed (attempt {}/{}), retrying: {}",
                    what,
                    attempt,
                    policy.max_attempts,
                    err
                );
                attempt += 1;
                tokio::time::sleep(policy.backoff).await;
            }
            Err(err) => {
                log::error!("{} failed: {}", what, err);
                return Err(err);
            }
        }
    }
}

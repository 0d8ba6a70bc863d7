// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Heartbeat scheduling for the voice signalling socket (spec §4.J "Heartbeat").
//!
//! Grounded in `src/voice/gateway/heartbeat.rs`'s `VoiceHeartbeatHandler`: a spawned
//! task driven by `tokio::select!` over a sleep deadline and an inbound command
//! channel, generalised with the jittered initial interval and two-miss timeout the
//! signalling spec requires.

use std::time::Duration;

use log::*;
use rand::Rng;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::Instant;

use crate::signalling::messages::Heartbeat;

/// Messages delivered to the heartbeat task from the owning gateway.
#[derive(Debug, Clone)]
pub enum HeartbeatCommand {
    /// A HeartbeatAck was received; clears the missed-beat counter.
    Ack,
    /// Updates the `seq_ack` value carried on the next heartbeat (gateway v8+).
    SeqAck(u64),
    /// The relay sent an opcode-3 Heartbeat request; send one immediately.
    SendNow,
}

/// What the heartbeat task asks its owner to do.
#[derive(Debug, Clone)]
pub enum HeartbeatOutcome {
    /// Send this heartbeat payload now.
    Send(Heartbeat),
    /// Two consecutive intervals elapsed without an ack; the socket should be closed.
    AckTimeout,
}

/// Drives the heartbeat cadence: a random initial jitter in `[0, interval)`, then every
/// `interval`. Missing an ack for two consecutive intervals is reported as
/// [`HeartbeatOutcome::AckTimeout`].
pub struct HeartbeatScheduler {
    interval: Duration,
    gateway_version: u16,
    seq_ack: Option<u64>,
    missed: u8,
}

impl HeartbeatScheduler {
    pub fn new(interval: Duration, gateway_version: u16) -> Self {
        Self { interval, gateway_version, seq_ack: None, missed: 0 }
    }

    /// Runs until the owning task drops `commands` or an ack timeout fires, sending
    /// `outcomes` updates the caller drives the actual socket write from.
    pub async fn run(mut self, mut commands: Receiver<HeartbeatCommand>, outcomes: Sender<HeartbeatOutcome>) {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        let initial = Duration::from_secs_f64(self.interval.as_secs_f64() * jitter);
        let mut deadline = Instant::now() + initial;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.missed += 1;
                    if self.missed >= 2 {
                        let _ = outcomes.send(HeartbeatOutcome::AckTimeout).await;
                        return;
                    }

                    let heartbeat = Heartbeat {
                        t: now_millis(),
                        seq_ack: if self.gateway_version >= 8 { self.seq_ack } else { None },
                    };
                    if outcomes.send(HeartbeatOutcome::Send(heartbeat)).await.is_err() {
                        return;
                    }
                    deadline = Instant::now() + self.interval;
                }
                command = commands.recv() => {
                    match command {
                        Some(HeartbeatCommand::Ack) => {
                            self.missed = 0;
                        }
                        Some(HeartbeatCommand::SeqAck(seq)) => {
                            self.seq_ack = Some(seq);
                        }
                        Some(HeartbeatCommand::SendNow) => {
                            let heartbeat = Heartbeat {
                                t: now_millis(),
                                seq_ack: if self.gateway_version >= 8 { self.seq_ack } else { None },
                            };
                            if outcomes.send(HeartbeatOutcome::Send(heartbeat)).await.is_err() {
                                return;
                            }
                            deadline = Instant::now() + self.interval;
                        }
                        None => {
                            trace!("SIG: heartbeat command channel closed, stopping scheduler");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn omits_seq_ack_below_gateway_v8() {
        let (_cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(1);
        let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::channel(1);

        let scheduler = HeartbeatScheduler::new(Duration::from_millis(5), 4);
        tokio::spawn(scheduler.run(cmd_rx, outcome_tx));

        match outcome_rx.recv().await.unwrap() {
            HeartbeatOutcome::Send(beat) => assert_eq!(beat.seq_ack, None),
            other => panic!("expected Send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn includes_seq_ack_at_gateway_v8() {
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(4);
        let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::channel(4);

        cmd_tx.send(HeartbeatCommand::SeqAck(123)).await.unwrap();
        // Long interval so the queued command is drained well before the first tick.
        let scheduler = HeartbeatScheduler::new(Duration::from_millis(200), 8);
        tokio::spawn(scheduler.run(cmd_rx, outcome_tx));

        match outcome_rx.recv().await.unwrap() {
            HeartbeatOutcome::Send(beat) => assert_eq!(beat.seq_ack, Some(123)),
            other => panic!("expected Send, got {other:?}"),
        }
    }
}

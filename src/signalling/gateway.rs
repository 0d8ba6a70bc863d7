// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The signalling socket task: connects, performs the Hello/Identify handshake, and
//! drives the pure [`SignallingState`] machine against inbound frames.
//!
//! Grounded in `src/voice/gateway/gateway.rs`'s `VoiceGateway::spawn` /
//! `gateway_listen_task_tungstenite`, using `tokio-tungstenite` directly (the wasm
//! backend split is not carried over; this core targets native async runtimes only).

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::*;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::dave::ControlFrame;
use crate::errors::SignallingError;
use crate::signalling::events::SignallingEvents;
use crate::signalling::handle::{SignallingHandle, WsSink};
use crate::signalling::heartbeat::{HeartbeatCommand, HeartbeatOutcome, HeartbeatScheduler};
use crate::signalling::messages::*;
use crate::signalling::state::{SessionIdentity, SignallingAction, SignallingState};

type WsRecv = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// The signalling gateway protocol version this core speaks (spec §6).
const SIGNALLING_VERSION: u16 = 8;

/// Drives a [`SignallingState`] transition from outside the gateway task. The state
/// machine itself is never exposed directly, since it may only be mutated from the
/// single task that owns it (spec §5 "single-writer-per-session"); a `Session` feeds
/// these in through [`SignallingHandle::external_address_discovered`] once its UDP
/// discovery (owned by `Session`, not the signalling socket) resolves.
pub(crate) enum GatewayControl {
    ExternalAddressDiscovered { address: String, port: u16 },
}

pub struct SignallingGateway {
    state: SignallingState,
    events: Arc<Mutex<SignallingEvents>>,
    websocket_send: Arc<Mutex<WsSink>>,
    websocket_receive: WsRecv,
    heartbeat_commands: mpsc::Sender<HeartbeatCommand>,
    control: mpsc::Sender<GatewayControl>,
    control_receive: mpsc::Receiver<GatewayControl>,
    kill_send: broadcast::Sender<()>,
    kill_receive: broadcast::Receiver<()>,
}

impl SignallingGateway {
    /// Connects to `endpoint` (a bare host:port, as handed out by the main chat
    /// gateway's Voice-Server-Update), completes the Hello/Identify handshake, and
    /// spawns the listener and heartbeat tasks.
    pub async fn spawn(endpoint: &str, identity: SessionIdentity) -> Result<SignallingHandle, SignallingError> {
        let (mut gateway, heartbeat_outcome_rx) = Self::connect(endpoint, identity).await?;

        let identify_action = gateway.state.on_connected();
        gateway.apply_action(identify_action).await?;

        Ok(gateway.finish_spawn(heartbeat_outcome_rx))
    }

    /// Connects to `endpoint` and sends Resume instead of Identify, for reconnecting
    /// after a resumable close (spec §4.J "Resume", scenario S5). `seq_ack` is the
    /// last sequence number the caller observed before the disconnect, if any.
    pub async fn spawn_resume(
        endpoint: &str,
        identity: SessionIdentity,
        seq_ack: Option<u64>,
    ) -> Result<SignallingHandle, SignallingError> {
        let (mut gateway, heartbeat_outcome_rx) = Self::connect(endpoint, identity).await?;

        let resume_action = gateway.state.begin_resume(seq_ack);
        gateway.apply_action(resume_action).await?;

        Ok(gateway.finish_spawn(heartbeat_outcome_rx))
    }

    /// Shared connect-and-Hello setup for both a fresh Identify and a Resume.
    async fn connect(
        endpoint: &str,
        identity: SessionIdentity,
    ) -> Result<(SignallingGateway, mpsc::Receiver<HeartbeatOutcome>), SignallingError> {
        let url = format!("wss://{endpoint}/?v={SIGNALLING_VERSION}");
        trace!("SIG: connecting to {url}");

        let (stream, _response) = connect_async(&url)
            .await
            .map_err(|error| SignallingError::CannotConnect { error: error.to_string() })?;
        let (websocket_send, mut websocket_receive) = stream.split();
        let shared_send = Arc::new(Mutex::new(websocket_send));

        let hello = Self::await_hello(&mut websocket_receive).await?;
        info!("SIG: received Hello, heartbeat_interval={}ms", hello.heartbeat_interval_ms);

        let events = Arc::new(Mutex::new(SignallingEvents::default()));
        events.lock().await.hello.publish(hello).await;

        let (heartbeat_cmd_tx, heartbeat_cmd_rx) = mpsc::channel(8);
        let (heartbeat_outcome_tx, heartbeat_outcome_rx) = mpsc::channel(8);
        let scheduler = HeartbeatScheduler::new(
            Duration::from_secs_f64(hello.heartbeat_interval_ms / 1000.0),
            identity.gateway_version,
        );
        tokio::spawn(scheduler.run(heartbeat_cmd_rx, heartbeat_outcome_tx));

        let (kill_send, kill_receive) = broadcast::channel(4);
        let (control_send, control_receive) = mpsc::channel(4);

        let gateway = SignallingGateway {
            state: SignallingState::new(identity),
            events,
            websocket_send: shared_send,
            websocket_receive,
            heartbeat_commands: heartbeat_cmd_tx,
            control: control_send,
            control_receive,
            kill_send,
            kill_receive,
        };

        Ok((gateway, heartbeat_outcome_rx))
    }

    /// Builds the caller-facing handle and spawns the listener task, consuming `self`.
    fn finish_spawn(self, heartbeat_outcome_rx: mpsc::Receiver<HeartbeatOutcome>) -> SignallingHandle {
        let handle = SignallingHandle {
            events: self.events.clone(),
            websocket_send: self.websocket_send.clone(),
            heartbeat_commands: self.heartbeat_commands.clone(),
            control: self.control.clone(),
            kill_send: self.kill_send.clone(),
        };

        tokio::spawn(async move {
            self.listen_task(heartbeat_outcome_rx).await;
        });

        handle
    }

    async fn await_hello(websocket_receive: &mut WsRecv) -> Result<Hello, SignallingError> {
        let message = websocket_receive
            .next()
            .await
            .ok_or(SignallingError::CannotConnect { error: "stream closed before Hello".into() })?
            .map_err(|error| SignallingError::CannotConnect { error: error.to_string() })?;

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let code = frame.map(|frame| u16::from(frame.code)).unwrap_or(1006);
                return Err(SignallingError::from(code));
            }
            other => {
                return Err(SignallingError::CannotConnect { error: format!("unexpected first frame: {other:?}") })
            }
        };

        let received: ReceivePayload = serde_json::from_str(&text).map_err(|_| SignallingError::FailedToDecodePayload)?;
        if received.op_code != VOICE_HELLO {
            return Err(SignallingError::NonHelloOnInitiate { opcode: received.op_code });
        }
        serde_json::from_value(received.data).map_err(|_| SignallingError::FailedToDecodePayload)
    }

    async fn send_payload(&self, op_code: u8, data: serde_json::Value) -> Result<(), SignallingError> {
        let payload = SendPayload { op_code, data };
        let text = serde_json::to_string(&payload).map_err(|_| SignallingError::FailedToDecodePayload)?;
        self.websocket_send
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|error| SignallingError::CannotConnect { error: error.to_string() })
    }

    /// Carries out the side effect a state transition requested. `BeginIpDiscovery`,
    /// `SessionReady`, `Reconnect` and `EnterClosed` have no socket-level action of
    /// their own: they're surfaced through the published events and close handling
    /// below, since only the owning `Session` has the UDP handle and reconnection
    /// policy needed to act on them.
    async fn apply_action(&mut self, action: SignallingAction) -> Result<(), SignallingError> {
        match action {
            SignallingAction::SendIdentify(identify) => {
                self.send_payload(VOICE_IDENTIFY, serde_json::to_value(&identify).unwrap()).await
            }
            SignallingAction::SendSelectProtocol(select) => {
                self.send_payload(VOICE_SELECT_PROTOCOL, serde_json::to_value(&select).unwrap()).await
            }
            SignallingAction::SendResume(resume) => {
                self.send_payload(VOICE_RESUME, serde_json::to_value(&resume).unwrap()).await
            }
            SignallingAction::BeginIpDiscovery { .. }
            | SignallingAction::SessionReady { .. }
            | SignallingAction::Reconnect
            | SignallingAction::EnterClosed => Ok(()),
        }
    }

    async fn listen_task(mut self, mut heartbeat_outcomes: mpsc::Receiver<HeartbeatOutcome>) {
        loop {
            tokio::select! {
                Ok(_) = self.kill_receive.recv() => {
                    trace!("SIG: closing listener task");
                    break;
                }
                outcome = heartbeat_outcomes.recv() => {
                    match outcome {
                        Some(HeartbeatOutcome::Send(beat)) => {
                            if self.send_payload(VOICE_HEARTBEAT, serde_json::to_value(&beat).unwrap()).await.is_err() {
                                warn!("SIG: failed to send heartbeat, stopping gateway");
                                break;
                            }
                        }
                        Some(HeartbeatOutcome::AckTimeout) => {
                            warn!("SIG: heartbeat ack timeout, closing connection");
                            self.events.lock().await.error.publish(SignallingError::HeartbeatAckTimeout).await;
                            break;
                        }
                        None => break,
                    }
                }
                control = self.control_receive.recv() => {
                    match control {
                        Some(GatewayControl::ExternalAddressDiscovered { address, port }) => {
                            if let Ok(action) = self.state.on_external_address_discovered(address, port) {
                                let _ = self.apply_action(action).await;
                            }
                        }
                        None => {}
                    }
                }
                message = self.websocket_receive.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text_message(&text).await,
                        Some(Ok(Message::Binary(bytes))) => self.handle_binary_message(&bytes).await,
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|frame| u16::from(frame.code)).unwrap_or(1006);
                            self.handle_close(code).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => {
                            warn!("SIG: websocket is broken, stopping gateway");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_close(&mut self, code: u16) {
        let action = self.state.on_closed(code);
        // Published unconditionally: the owning Session decides whether to redial and
        // resume or give up, since only it holds the identity and backoff policy.
        self.events.lock().await.socket_closed.publish(code).await;
        if let SignallingAction::EnterClosed = action {
            self.events.lock().await.error.publish(SignallingError::from(code)).await;
        }
    }

    /// Dispatches a JSON text frame (spec §6: every opcode except DAVE control).
    async fn handle_text_message(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let Ok(payload) = serde_json::from_str::<ReceivePayload>(text) else {
            warn!("SIG: message unrecognised: {text}");
            return;
        };

        match payload.op_code {
            VOICE_READY => match serde_json::from_value::<Ready>(payload.data.clone()) {
                Ok(ready) => {
                    self.events.lock().await.ready.publish(ready.clone()).await;
                    if let Ok(action) = self.state.on_ready(ready) {
                        let _ = self.apply_action(action).await;
                    }
                }
                Err(error) => warn!("SIG: failed to parse Ready ({error})"),
            },
            VOICE_SESSION_DESCRIPTION => match serde_json::from_value::<SessionDescription>(payload.data.clone()) {
                Ok(description) => {
                    self.events.lock().await.session_description.publish(description.clone()).await;
                    let _ = self.state.on_session_description(description);
                }
                Err(error) => warn!("SIG: failed to parse SessionDescription ({error})"),
            },
            VOICE_SPEAKING => {
                if let Ok(speaking) = serde_json::from_value::<Speaking>(payload.data.clone()) {
                    self.events.lock().await.speaking.publish(speaking).await;
                }
            }
            VOICE_HEARTBEAT => {
                trace!("SIG: relay requested an immediate heartbeat");
                let _ = self.heartbeat_commands.send(HeartbeatCommand::SendNow).await;
            }
            VOICE_HEARTBEAT_ACK => {
                let _ = self.heartbeat_commands.send(HeartbeatCommand::Ack).await;
            }
            VOICE_RESUMED => {
                self.events.lock().await.resumed.publish(Resumed {}).await;
                let _ = self.state.on_resumed();
            }
            VOICE_CLIENT_DISCONNECT => {
                if let Ok(disconnect) = serde_json::from_value::<ClientDisconnect>(payload.data.clone()) {
                    self.events.lock().await.client_disconnect.publish(disconnect).await;
                }
            }
            VOICE_IDENTIFY | VOICE_SELECT_PROTOCOL | VOICE_RESUME | VOICE_HELLO => {
                info!("SIG: received unexpected opcode ({}) for the current state", payload.op_code);
            }
            other => {
                warn!("SIG: received unrecognised voice opcode ({other})");
            }
        }
    }

    /// Dispatches a binary frame, which carries DAVE control-plane messages (spec §6).
    async fn handle_binary_message(&mut self, bytes: &[u8]) {
        match ControlFrame::parse_inbound(bytes) {
            Ok((seq, frame)) => {
                self.state.note_seq_ack(u64::from(seq));
                let events = self.events.lock().await;
                events.seq_ack.publish(u64::from(seq)).await;
                events.dave_control.publish(frame).await;
            }
            Err(error) => warn!("SIG: failed to parse DAVE control frame ({error})"),
        }
    }
}

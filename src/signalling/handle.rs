// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The clonable send-side handle to a connected signalling socket.
//!
//! Grounded in `src/voice/gateway/handle.rs`'s `VoiceGatewayHandle`: a cheap `Clone`
//! wrapping the shared websocket sink and event publishers, so callers elsewhere in
//! the owning `Session` can send without holding the gateway task itself.

use std::sync::Arc;

use futures_util::SinkExt;
use log::*;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::dave::ControlFrame;
use crate::errors::SignallingError;
use crate::signalling::events::SignallingEvents;
use crate::signalling::gateway::GatewayControl;
use crate::signalling::heartbeat::HeartbeatCommand;
use crate::signalling::messages::*;

pub(super) type WsSink =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Clone)]
pub struct SignallingHandle {
    pub events: Arc<Mutex<SignallingEvents>>,
    pub(super) websocket_send: Arc<Mutex<WsSink>>,
    pub(super) heartbeat_commands: mpsc::Sender<HeartbeatCommand>,
    pub(crate) control: mpsc::Sender<GatewayControl>,
    pub(super) kill_send: broadcast::Sender<()>,
}

impl SignallingHandle {
    async fn send_json(&self, op_code: u8, data: serde_json::Value) -> Result<(), SignallingError> {
        let payload = SendPayload { op_code, data };
        let text = serde_json::to_string(&payload).map_err(|_| SignallingError::FailedToDecodePayload)?;
        self.websocket_send
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|error| SignallingError::CannotConnect { error: error.to_string() })
    }

    pub async fn send_identify(&self, identify: &Identify) -> Result<(), SignallingError> {
        trace!("SIG: sending Identify");
        self.send_json(VOICE_IDENTIFY, serde_json::to_value(identify).unwrap()).await
    }

    pub async fn send_select_protocol(&self, select: &SelectProtocol) -> Result<(), SignallingError> {
        trace!("SIG: sending SelectProtocol");
        self.send_json(VOICE_SELECT_PROTOCOL, serde_json::to_value(select).unwrap()).await
    }

    pub async fn send_speaking(&self, speaking: &Speaking) -> Result<(), SignallingError> {
        trace!("SIG: sending Speaking");
        self.send_json(VOICE_SPEAKING, serde_json::to_value(speaking).unwrap()).await
    }

    pub async fn send_resume(&self, resume: &Resume) -> Result<(), SignallingError> {
        trace!("SIG: sending Resume");
        self.send_json(VOICE_RESUME, serde_json::to_value(resume).unwrap()).await
    }

    /// Feeds the externally-discovered address/port (owned by the `Session`'s UDP
    /// transport, not this socket) back into the signalling state machine, so it can
    /// pick an AEAD mode and send Select-Protocol (spec §4.J).
    pub async fn external_address_discovered(&self, address: String, port: u16) {
        let _ = self.control.send(GatewayControl::ExternalAddressDiscovered { address, port }).await;
    }

    /// Forces an immediate heartbeat, used when the relay requests one via opcode 3.
    pub async fn request_heartbeat_now(&self) {
        let _ = self.heartbeat_commands.send(HeartbeatCommand::SendNow).await;
    }

    /// Sends a DAVE control-plane frame as a binary websocket message (spec §6).
    pub async fn send_dave_control(&self, frame: &ControlFrame) -> Result<(), SignallingError> {
        let bytes = frame.serialize_outbound();
        self.websocket_send
            .lock()
            .await
            .send(Message::Binary(bytes))
            .await
            .map_err(|error| SignallingError::CannotConnect { error: error.to_string() })
    }

    /// Closes the websocket and stops the listener and heartbeat tasks. The session
    /// may still choose to reconnect and resume afterwards.
    pub async fn close(&self) {
        let _ = self.kill_send.send(());
        let _ = self.websocket_send.lock().await.close().await;
    }
}

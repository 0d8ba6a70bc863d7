// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Published signalling events, one [`pubserve::Publisher`] per wire message type.
//!
//! Grounded in `src/voice/gateway/gateway.rs`'s `handle_event`, which publishes each
//! decoded payload to its `Publisher<T>` field.

use pubserve::Publisher;

use crate::dave::ControlFrame;
use crate::errors::SignallingError;
use crate::signalling::messages::{
    ClientDisconnect, Hello, Ready, Resumed, SessionDescription, Speaking,
};

#[derive(Default)]
pub struct SignallingEvents {
    pub hello: Publisher<Hello>,
    pub ready: Publisher<Ready>,
    pub session_description: Publisher<SessionDescription>,
    pub speaking: Publisher<Speaking>,
    pub resumed: Publisher<Resumed>,
    pub client_disconnect: Publisher<ClientDisconnect>,
    pub dave_control: Publisher<ControlFrame>,
    pub error: Publisher<SignallingError>,
    /// The close code the socket went down with, published on every close regardless
    /// of resumability. The owning `Session` holds the reconnect/resume policy and
    /// decides what to do with it.
    pub socket_closed: Publisher<u16>,
    /// The sequence number of the last DAVE control frame received, mirroring the
    /// value the signalling state machine tracks internally for the next
    /// heartbeat/resume's `seq_ack`.
    pub seq_ack: Publisher<u64>,
}

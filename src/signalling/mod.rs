// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The voice signalling control plane: a WebSocket handshake and state machine that
//! negotiates a UDP relay, an AEAD transport mode, and (optionally) DAVE E2EE, then
//! carries heartbeats, speaking indicators, and DAVE control frames.

#[cfg(feature = "client")]
pub mod gateway;
#[cfg(feature = "client")]
pub mod handle;
pub mod events;
pub mod heartbeat;
pub mod messages;
pub mod state;

#[cfg(feature = "client")]
pub use gateway::SignallingGateway;
#[cfg(feature = "client")]
pub use handle::SignallingHandle;
pub use events::SignallingEvents;
pub use heartbeat::{HeartbeatCommand, HeartbeatOutcome, HeartbeatScheduler};
pub use state::{SessionIdentity, SignallingAction, SignallingState, SignallingStateKind};

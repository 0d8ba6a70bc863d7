// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Voice signalling wire types (spec §6): one opcode, one payload struct each.
//!
//! Grounded in `src/types/events/voice_gateway/*.rs`: JSON text frames of
//! `{"op": <u8>, "d": <payload>}`, the same envelope shape, carried over serde_json.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::TransportMode;
use crate::Snowflake;

pub const VOICE_IDENTIFY: u8 = 0;
pub const VOICE_SELECT_PROTOCOL: u8 = 1;
pub const VOICE_READY: u8 = 2;
pub const VOICE_HEARTBEAT: u8 = 3;
pub const VOICE_SESSION_DESCRIPTION: u8 = 4;
pub const VOICE_SPEAKING: u8 = 5;
pub const VOICE_HEARTBEAT_ACK: u8 = 6;
pub const VOICE_RESUME: u8 = 7;
pub const VOICE_HELLO: u8 = 8;
pub const VOICE_RESUMED: u8 = 9;
pub const VOICE_CLIENT_DISCONNECT: u8 = 13;

/// Generic send envelope: `{"op": ..., "d": ...}`.
#[derive(Debug, Serialize, Clone)]
pub struct SendPayload {
    #[serde(rename = "op")]
    pub op_code: u8,
    #[serde(rename = "d")]
    pub data: Value,
}

/// Generic receive envelope; `d`'s shape depends on `op`.
#[derive(Debug, Deserialize, Clone)]
pub struct ReceivePayload {
    #[serde(rename = "op")]
    pub op_code: u8,
    #[serde(rename = "d")]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Identify {
    pub server_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_dave_protocol_version: Option<u16>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct Hello {
    #[serde(rename = "heartbeat_interval")]
    pub heartbeat_interval_ms: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<TransportMode>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: TransportMode,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionDescription {
    pub mode: TransportMode,
    pub secret_key: [u8; 32],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dave_protocol_version: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Heartbeat {
    /// Local wall-clock nonce.
    pub t: u64,
    /// Last received sequence number; omitted below gateway v8 (spec §9 Open Questions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct HeartbeatAck {
    pub t: u64,
}

bitflags::bitflags! {
    /// Speaking bitflags (spec §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SpeakingFlags: u8 {
        const MICROPHONE = 1 << 0;
        const SOUNDSHARE = 1 << 1;
        const PRIORITY = 1 << 2;
    }
}

impl Default for SpeakingFlags {
    fn default() -> Self {
        Self::MICROPHONE
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Speaking {
    pub speaking: u8,
    pub ssrc: u32,
    #[serde(default)]
    pub delay: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Snowflake>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Resume {
    pub server_id: Snowflake,
    pub session_id: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct Resumed {}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ClientDisconnect {
    pub user_id: Snowflake,
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The signalling control state machine: `Closed -> Opening -> Identified
//! -> Awaiting-UDP -> Selecting-Protocol -> Ready -> Closing`.
//!
//! Kept free of socket I/O so it can be driven and tested without a live connection,
//! the same separation the DAVE state machine (`src/dave/state.rs`) uses between
//! protocol logic and the transport that carries it.

use crate::errors::{SignallingError, NON_RESUMABLE_CLOSE_CODES};
use crate::signalling::messages::*;
use crate::transport::TransportMode;
use crate::Snowflake;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignallingStateKind {
    Closed,
    Opening,
    Identified,
    AwaitingUdp,
    SelectingProtocol,
    Ready,
    Closing,
}

/// Everything the state machine needs to (re)identify, carried across resumes.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub server_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    pub gateway_version: u16,
    pub max_dave_protocol_version: Option<u16>,
}

/// A side effect the caller (the owning `Session`) should perform. The state machine
/// itself never touches a socket.
#[derive(Debug, Clone)]
pub enum SignallingAction {
    SendIdentify(Identify),
    BeginIpDiscovery { ssrc: u32 },
    SendSelectProtocol(SelectProtocol),
    SessionReady { ssrc: u32, mode: TransportMode, secret_key: [u8; 32], dave_version: u16 },
    SendResume(Resume),
    Reconnect,
    EnterClosed,
}

pub struct SignallingState {
    identity: SessionIdentity,
    kind: SignallingStateKind,
    ssrc: Option<u32>,
    external_address: Option<(String, u16)>,
    offered_modes: Vec<TransportMode>,
    seq_ack: Option<u64>,
    last_close_code: Option<u16>,
}

impl SignallingState {
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            identity,
            kind: SignallingStateKind::Closed,
            ssrc: None,
            external_address: None,
            offered_modes: Vec::new(),
            seq_ack: None,
            last_close_code: None,
        }
    }

    pub fn kind(&self) -> SignallingStateKind {
        self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.kind == SignallingStateKind::Ready
    }

    /// Called once the WebSocket connects. Sends Identify and enters `Opening`, which
    /// becomes `Identified` once Ready arrives.
    pub fn on_connected(&mut self) -> SignallingAction {
        self.kind = SignallingStateKind::Opening;
        SignallingAction::SendIdentify(Identify {
            server_id: self.identity.server_id,
            user_id: self.identity.user_id,
            session_id: self.identity.session_id.clone(),
            token: self.identity.token.clone(),
            max_dave_protocol_version: self.identity.max_dave_protocol_version,
        })
    }

    /// Receipt of Ready yields `ssrc`, relay address, and supported AEAD modes; the
    /// client then performs IP discovery.
    pub fn on_ready(&mut self, ready: Ready) -> Result<SignallingAction, SignallingError> {
        if self.kind != SignallingStateKind::Opening {
            return Err(SignallingError::UnexpectedOpcode { opcode: VOICE_READY, state: "non-Opening" });
        }
        self.ssrc = Some(ready.ssrc);
        self.offered_modes = ready.modes;
        self.kind = SignallingStateKind::Identified;
        Ok(SignallingAction::BeginIpDiscovery { ssrc: ready.ssrc })
    }

    /// Called once IP discovery resolves the client's external address; selects the
    /// most-preferred mode the relay offered and sends Select-Protocol.
    pub fn on_external_address_discovered(
        &mut self,
        address: String,
        port: u16,
    ) -> Result<SignallingAction, SignallingError> {
        if self.kind != SignallingStateKind::Identified {
            return Err(SignallingError::UnexpectedOpcode { opcode: VOICE_SELECT_PROTOCOL, state: "non-Identified" });
        }
        let mode = TransportMode::select(&self.offered_modes).ok_or(SignallingError::UnknownEncryptionMode)?;
        self.external_address = Some((address.clone(), port));
        self.kind = SignallingStateKind::SelectingProtocol;

        Ok(SignallingAction::SendSelectProtocol(SelectProtocol {
            protocol: "udp".to_string(),
            data: SelectProtocolData { address, port, mode },
        }))
    }

    /// Session-Description carries the 32-byte key and optional DAVE version; receipt
    /// moves the state machine to `Ready`.
    pub fn on_session_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<SignallingAction, SignallingError> {
        if self.kind != SignallingStateKind::SelectingProtocol {
            return Err(SignallingError::UnexpectedOpcode {
                opcode: VOICE_SESSION_DESCRIPTION,
                state: "non-SelectingProtocol",
            });
        }
        self.kind = SignallingStateKind::Ready;
        let ssrc = self.ssrc.expect("ssrc assigned before SessionDescription by protocol contract");

        Ok(SignallingAction::SessionReady {
            ssrc,
            mode: description.mode,
            secret_key: description.secret_key,
            dave_version: description.dave_protocol_version.unwrap_or(0),
        })
    }

    /// Records the last seen sequence number for the next heartbeat's `seq_ack`.
    pub fn note_seq_ack(&mut self, seq: u64) {
        self.seq_ack = Some(seq);
    }

    /// Called when the socket closes with `code`. Resume is attempted unless `code`
    /// is in [`NON_RESUMABLE_CLOSE_CODES`].
    pub fn on_closed(&mut self, code: u16) -> SignallingAction {
        self.last_close_code = Some(code);
        self.kind = SignallingStateKind::Closing;

        if NON_RESUMABLE_CLOSE_CODES.contains(&code) {
            self.kind = SignallingStateKind::Closed;
            SignallingAction::EnterClosed
        } else {
            SignallingAction::Reconnect
        }
    }

    /// Builds the Resume payload to send after reconnecting.
    pub fn resume_payload(&self) -> SignallingAction {
        SignallingAction::SendResume(Resume {
            server_id: self.identity.server_id,
            session_id: self.identity.session_id.clone(),
            token: self.identity.token.clone(),
            seq_ack: self.seq_ack,
        })
    }

    /// Begins a resume attempt on a freshly (re)connected socket, in place of
    /// `on_connected`'s Identify. `seq_ack` is the last sequence number the owning
    /// `Session` observed before the disconnect, if any.
    pub fn begin_resume(&mut self, seq_ack: Option<u64>) -> SignallingAction {
        if seq_ack.is_some() {
            self.seq_ack = seq_ack;
        }
        self.kind = SignallingStateKind::Opening;
        self.resume_payload()
    }

    /// Receipt of `Resumed`: audio transmission resumes without renegotiation.
    pub fn on_resumed(&mut self) -> Result<(), SignallingError> {
        if self.kind != SignallingStateKind::Closing && self.kind != SignallingStateKind::Opening {
            return Err(SignallingError::UnexpectedOpcode { opcode: VOICE_RESUMED, state: "unexpected" });
        }
        self.kind = SignallingStateKind::Ready;
        Ok(())
    }

    /// Begins a graceful close; permitted from any state.
    pub fn begin_close(&mut self) {
        self.kind = SignallingStateKind::Closing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            server_id: Snowflake(1),
            user_id: Snowflake(2),
            session_id: "sess".to_string(),
            token: "tok".to_string(),
            gateway_version: 8,
            max_dave_protocol_version: None,
        }
    }

    #[test]
    fn happy_path_reaches_ready() {
        let mut state = SignallingState::new(identity());
        state.on_connected();
        assert_eq!(state.kind(), SignallingStateKind::Opening);

        state
            .on_ready(Ready { ssrc: 42, ip: "1.2.3.4".into(), port: 1234, modes: vec![TransportMode::Aes256GcmRtpsize] })
            .unwrap();
        assert_eq!(state.kind(), SignallingStateKind::Identified);

        state.on_external_address_discovered("5.6.7.8".into(), 4321).unwrap();
        assert_eq!(state.kind(), SignallingStateKind::SelectingProtocol);

        let action = state
            .on_session_description(SessionDescription {
                mode: TransportMode::Aes256GcmRtpsize,
                secret_key: [7u8; 32],
                dave_protocol_version: None,
            })
            .unwrap();
        assert_eq!(state.kind(), SignallingStateKind::Ready);
        assert!(matches!(action, SignallingAction::SessionReady { ssrc: 42, .. }));
    }

    #[test]
    fn non_resumable_close_enters_closed() {
        let mut state = SignallingState::new(identity());
        let action = state.on_closed(4004);
        assert_eq!(state.kind(), SignallingStateKind::Closed);
        assert!(matches!(action, SignallingAction::EnterClosed));
    }

    #[test]
    fn resumable_close_preserves_seq_ack() {
        let mut state = SignallingState::new(identity());
        state.note_seq_ack(123);
        let action = state.on_closed(1006);
        assert!(matches!(action, SignallingAction::Reconnect));

        let resume = state.resume_payload();
        match resume {
            SignallingAction::SendResume(resume) => {
                assert_eq!(resume.seq_ack, Some(123));
                assert_eq!(resume.server_id, Snowflake(1));
            }
            _ => panic!("expected SendResume"),
        }
    }

    #[test]
    fn begin_resume_reuses_preserved_seq_ack() {
        let mut state = SignallingState::new(identity());
        let action = state.begin_resume(Some(123));
        assert_eq!(state.kind(), SignallingStateKind::Opening);
        match action {
            SignallingAction::SendResume(resume) => assert_eq!(resume.seq_ack, Some(123)),
            _ => panic!("expected SendResume"),
        }
    }

    #[test]
    fn session_description_before_select_protocol_is_rejected() {
        let mut state = SignallingState::new(identity());
        let err = state
            .on_session_description(SessionDescription {
                mode: TransportMode::Aes256GcmRtpsize,
                secret_key: [0u8; 32],
                dave_protocol_version: None,
            })
            .unwrap_err();
        assert!(matches!(err, SignallingError::UnexpectedOpcode { .. }));
    }
}

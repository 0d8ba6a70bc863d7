// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! DAVE binary control-frame opcodes 21-31: `[seq(be16, server→client
//! only)] [opcode(u8)] [payload...]`.

use crate::errors::DaveError;

pub const OP_PREPARE_TRANSITION: u8 = 21;
pub const OP_PREPARE_EPOCH: u8 = 22;
pub const OP_MLS_PROPOSALS: u8 = 23;
pub const OP_MLS_WELCOME: u8 = 24;
pub const OP_ANNOUNCE_COMMIT_TRANSITION: u8 = 25;
pub const OP_EXECUTE_TRANSITION: u8 = 26;
pub const OP_TRANSITION_READY: u8 = 27;
pub const OP_MLS_KEY_PACKAGE: u8 = 28;
pub const OP_MLS_INVALID_COMMIT_WELCOME: u8 = 29;
pub const OP_MLS_EXTERNAL_SENDER: u8 = 30;
/// Kept distinct from [`OP_MLS_INVALID_COMMIT_WELCOME`]: some servers reuse opcode 31
/// for both soundboard requests and invalid-commit-welcome notifications, but this
/// core treats them as separate opcodes and never emits this one.
pub const OP_REQUEST_SOUNDBOARD_SOUNDS: u8 = 31;

/// One parsed DAVE control-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    PrepareTransition { transition_id: u64, protocol_version: u16 },
    PrepareEpoch { transition_id: u64, epoch_id: u64, protocol_version: u16 },
    MlsProposals { append: Vec<Vec<u8>>, revoke: Vec<Vec<u8>> },
    MlsWelcome { transition_id: u64, welcome: Vec<u8> },
    AnnounceCommitTransition { transition_id: u64, commit: Vec<u8> },
    ExecuteTransition { transition_id: u64 },
    TransitionReady { transition_id: u64 },
    MlsKeyPackage { package: Vec<u8> },
    MlsInvalidCommitWelcome { transition_id: u64 },
    MlsExternalSender { package: Vec<u8> },
}

impl ControlFrame {
    /// Parses a server→client frame, returning the sequence number alongside the
    /// decoded message (sequence numbers do not appear on client→server frames).
    pub fn parse_inbound(datagram: &[u8]) -> Result<(u16, ControlFrame), DaveError> {
        if datagram.len() < 3 {
            return Err(DaveError::InvalidCommitOrWelcome { error: "frame shorter than seq+opcode".into() });
        }
        let seq = u16::from_be_bytes([datagram[0], datagram[1]]);
        let frame = Self::parse_body(datagram[2], &datagram[3..])?;
        Ok((seq, frame))
    }

    /// Parses a client→server frame (no leading sequence number).
    pub fn parse_outbound(datagram: &[u8]) -> Result<ControlFrame, DaveError> {
        if datagram.is_empty() {
            return Err(DaveError::InvalidCommitOrWelcome { error: "empty control frame".into() });
        }
        Self::parse_body(datagram[0], &datagram[1..])
    }

    fn parse_body(opcode: u8, payload: &[u8]) -> Result<ControlFrame, DaveError> {
        let err = |what: &str| DaveError::InvalidCommitOrWelcome { error: format!("{what} for opcode {opcode}") };

        match opcode {
            OP_PREPARE_TRANSITION => {
                let (transition_id, rest) = read_be64(payload).ok_or_else(|| err("truncated transition_id"))?;
                let protocol_version = read_be16(rest).ok_or_else(|| err("truncated protocol_version"))?;
                Ok(ControlFrame::PrepareTransition { transition_id, protocol_version })
            }
            OP_PREPARE_EPOCH => {
                let (transition_id, rest) = read_be64(payload).ok_or_else(|| err("truncated transition_id"))?;
                let (epoch_id, rest) = read_be64(rest).ok_or_else(|| err("truncated epoch_id"))?;
                let protocol_version = read_be16(rest).ok_or_else(|| err("truncated protocol_version"))?;
                Ok(ControlFrame::PrepareEpoch { transition_id, epoch_id, protocol_version })
            }
            OP_MLS_PROPOSALS => {
                let (append, rest) = read_blob_list(payload).ok_or_else(|| err("malformed append list"))?;
                let (revoke, _) = read_blob_list(rest).ok_or_else(|| err("malformed revoke list"))?;
                Ok(ControlFrame::MlsProposals { append, revoke })
            }
            OP_MLS_WELCOME => {
                let (transition_id, rest) = read_be64(payload).ok_or_else(|| err("truncated transition_id"))?;
                Ok(ControlFrame::MlsWelcome { transition_id, welcome: rest.to_vec() })
            }
            OP_ANNOUNCE_COMMIT_TRANSITION => {
                let (transition_id, rest) = read_be64(payload).ok_or_else(|| err("truncated transition_id"))?;
                Ok(ControlFrame::AnnounceCommitTransition { transition_id, commit: rest.to_vec() })
            }
            OP_EXECUTE_TRANSITION => {
                let (transition_id, _) = read_be64(payload).ok_or_else(|| err("truncated transition_id"))?;
                Ok(ControlFrame::ExecuteTransition { transition_id })
            }
            OP_TRANSITION_READY => {
                let (transition_id, _) = read_be64(payload).ok_or_else(|| err("truncated transition_id"))?;
                Ok(ControlFrame::TransitionReady { transition_id })
            }
            OP_MLS_KEY_PACKAGE => Ok(ControlFrame::MlsKeyPackage { package: payload.to_vec() }),
            OP_MLS_INVALID_COMMIT_WELCOME => {
                let (transition_id, _) = read_be64(payload).ok_or_else(|| err("truncated transition_id"))?;
                Ok(ControlFrame::MlsInvalidCommitWelcome { transition_id })
            }
            OP_MLS_EXTERNAL_SENDER => Ok(ControlFrame::MlsExternalSender { package: payload.to_vec() }),
            _ => Err(err("unknown opcode")),
        }
    }

    /// Serialises a client→server frame (no sequence number prefix).
    pub fn serialize_outbound(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        self.write_body(&mut out);
        out
    }

    fn opcode(&self) -> u8 {
        match self {
            ControlFrame::PrepareTransition { .. } => OP_PREPARE_TRANSITION,
            ControlFrame::PrepareEpoch { .. } => OP_PREPARE_EPOCH,
            ControlFrame::MlsProposals { .. } => OP_MLS_PROPOSALS,
            ControlFrame::MlsWelcome { .. } => OP_MLS_WELCOME,
            ControlFrame::AnnounceCommitTransition { .. } => OP_ANNOUNCE_COMMIT_TRANSITION,
            ControlFrame::ExecuteTransition { .. } => OP_EXECUTE_TRANSITION,
            ControlFrame::TransitionReady { .. } => OP_TRANSITION_READY,
            ControlFrame::MlsKeyPackage { .. } => OP_MLS_KEY_PACKAGE,
            ControlFrame::MlsInvalidCommitWelcome { .. } => OP_MLS_INVALID_COMMIT_WELCOME,
            ControlFrame::MlsExternalSender { .. } => OP_MLS_EXTERNAL_SENDER,
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        match self {
            ControlFrame::PrepareTransition { transition_id, protocol_version } => {
                out.extend_from_slice(&transition_id.to_be_bytes());
                out.extend_from_slice(&protocol_version.to_be_bytes());
            }
            ControlFrame::PrepareEpoch { transition_id, epoch_id, protocol_version } => {
                out.extend_from_slice(&transition_id.to_be_bytes());
                out.extend_from_slice(&epoch_id.to_be_bytes());
                out.extend_from_slice(&protocol_version.to_be_bytes());
            }
            ControlFrame::MlsProposals { append, revoke } => {
                write_blob_list(out, append);
                write_blob_list(out, revoke);
            }
            ControlFrame::MlsWelcome { transition_id, welcome } => {
                out.extend_from_slice(&transition_id.to_be_bytes());
                out.extend_from_slice(welcome);
            }
            ControlFrame::AnnounceCommitTransition { transition_id, commit } => {
                out.extend_from_slice(&transition_id.to_be_bytes());
                out.extend_from_slice(commit);
            }
            ControlFrame::ExecuteTransition { transition_id }
            | ControlFrame::TransitionReady { transition_id }
            | ControlFrame::MlsInvalidCommitWelcome { transition_id } => {
                out.extend_from_slice(&transition_id.to_be_bytes());
            }
            ControlFrame::MlsKeyPackage { package } | ControlFrame::MlsExternalSender { package } => {
                out.extend_from_slice(package);
            }
        }
    }
}

fn read_be64(bytes: &[u8]) -> Option<(u64, &[u8])> {
    if bytes.len() < 8 {
        return None;
    }
    let (head, tail) = bytes.split_at(8);
    Some((u64::from_be_bytes(head.try_into().unwrap()), tail))
}

fn read_be16(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_blob_list(bytes: &[u8]) -> Option<(Vec<Vec<u8>>, &[u8])> {
    let (count, mut rest) = read_be16(bytes).map(|c| (c, &bytes[2..]))?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (len, tail) = read_be16(rest).map(|l| (l as usize, &rest[2..]))?;
        if tail.len() < len {
            return None;
        }
        let (item, tail) = tail.split_at(len);
        items.push(item.to_vec());
        rest = tail;
    }
    Some((items, rest))
}

fn write_blob_list(out: &mut Vec<u8>, items: &[Vec<u8>]) {
    out.extend_from_slice(&(items.len() as u16).to_be_bytes());
    for item in items {
        out.extend_from_slice(&(item.len() as u16).to_be_bytes());
        out.extend_from_slice(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_transition_round_trips_outbound() {
        let frame = ControlFrame::ExecuteTransition { transition_id: 77 };
        let bytes = frame.serialize_outbound();
        let parsed = ControlFrame::parse_outbound(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn prepare_transition_round_trips_inbound() {
        let mut bytes = vec![0x00, 0x09]; // seq = 9
        bytes.push(OP_PREPARE_TRANSITION);
        bytes.extend_from_slice(&42u64.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());

        let (seq, frame) = ControlFrame::parse_inbound(&bytes).unwrap();
        assert_eq!(seq, 9);
        assert_eq!(frame, ControlFrame::PrepareTransition { transition_id: 42, protocol_version: 1 });
    }

    #[test]
    fn mls_proposals_round_trip() {
        let frame = ControlFrame::MlsProposals {
            append: vec![vec![1, 2, 3]],
            revoke: vec![vec![4], vec![5, 6]],
        };
        let bytes = frame.serialize_outbound();
        assert_eq!(ControlFrame::parse_outbound(&bytes).unwrap(), frame);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let bytes = vec![200u8];
        assert!(ControlFrame::parse_outbound(&bytes).is_err());
    }
}

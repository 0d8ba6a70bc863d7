// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Writes/parses the 12-byte RTP header and combines header + ciphertext + trailing
//! transport-nonce counter into the wire packet.
//!
//! Built on `discortp::rtp`, generalised from xsalsa20poly1305 to the two AEAD
//! "rtpsize" modes this core implements.

use discortp::rtp::{MutableRtpPacket, Rtp, RtpPacket, RtpType};
use discortp::Packet;

use crate::errors::TransportError;
use crate::transport::cipher::{TransportCipher, RTP_HEADER_SIZE, TRANSPORT_NONCE_COUNTER_SIZE};

/// Fixed RTP payload type chorus voice connections use for Opus audio.
pub const VOICE_RTP_PAYLOAD_TYPE: u8 = 0x78;

/// Samples-per-channel advanced per 20ms Opus frame at 48kHz.
pub const RTP_TIMESTAMP_STEP: u32 = 960;

/// The decoded, authenticated contents of a received RTP packet:
/// `(ssrc, sequence, timestamp, plaintext)`.
#[derive(Debug, Clone)]
pub struct DecodedRtpPacket {
    pub ssrc: u32,
    pub sequence: u16,
    pub timestamp: u32,
    pub plaintext: Vec<u8>,
}

/// Builds the 12-byte RTP header bytes for the given fields.
pub fn build_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_SIZE] {
    let mut header = [0u8; RTP_HEADER_SIZE];
    header[0] = 0x80; // version=2, padding=0, extension=0, csrc_count=0
    header[1] = VOICE_RTP_PAYLOAD_TYPE;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Assembles, seals, and serialises a complete RTP packet: `rtp_header || ciphertext
/// || counter_be32`.
pub fn assemble(
    cipher: &TransportCipher,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    counter: u32,
    payload: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let header = build_header(sequence, timestamp, ssrc);
    let sealed = cipher.seal(&header, counter, payload)?;

    let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + sealed.len() + TRANSPORT_NONCE_COUNTER_SIZE);
    packet.extend_from_slice(&header);
    packet.extend_from_slice(&sealed);
    packet.extend_from_slice(&counter.to_be_bytes());
    Ok(packet)
}

/// Parses and decrypts a received datagram into its authenticated plaintext.
/// Rejects datagrams shorter than `12 + tag_size + 4`.
pub fn parse_and_open(cipher: &TransportCipher, datagram: &[u8]) -> Result<DecodedRtpPacket, TransportError> {
    let minimum = RTP_HEADER_SIZE + cipher.mode().tag_size() + TRANSPORT_NONCE_COUNTER_SIZE;
    if datagram.len() < minimum {
        return Err(TransportError::PacketTooShort {
            len: datagram.len(),
            minimum,
        });
    }

    let rtp = RtpPacket::new(datagram).ok_or(TransportError::PacketTooShort {
        len: datagram.len(),
        minimum,
    })?;

    let header: [u8; RTP_HEADER_SIZE] = datagram[0..RTP_HEADER_SIZE].try_into().unwrap();
    let counter_offset = datagram.len() - TRANSPORT_NONCE_COUNTER_SIZE;
    let counter = u32::from_be_bytes(datagram[counter_offset..].try_into().unwrap());
    let ciphertext = &datagram[RTP_HEADER_SIZE..counter_offset];

    let plaintext = cipher.open(&header, counter, ciphertext)?;

    Ok(DecodedRtpPacket {
        ssrc: rtp.get_ssrc(),
        sequence: rtp.get_sequence().into(),
        timestamp: rtp.get_timestamp().into(),
        plaintext,
    })
}

/// Builds an (unencrypted) `discortp` RTP representation, used when forwarding
/// already-decrypted payloads onwards through `discortp`-aware code (e.g. RTCP
/// demuxing shares the same wire parser). Mirrors `src/voice/udp/handler.rs`'s
/// reconstruction of a plaintext `Rtp` value after decryption.
pub fn to_discortp_rtp(decoded: &DecodedRtpPacket, marker: bool) -> Rtp {
    Rtp {
        version: 2,
        padding: 0,
        extension: 0,
        csrc_count: 0,
        csrc_list: Vec::new(),
        marker: marker as u8,
        payload_type: RtpType::Dynamic(VOICE_RTP_PAYLOAD_TYPE),
        sequence: decoded.sequence.into(),
        timestamp: decoded.timestamp.into(),
        ssrc: decoded.ssrc,
        payload: decoded.plaintext.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::cipher::TransportMode;

    #[test]
    fn header_assembly_matches_expected_bytes() {
        let header = build_header(0x0042, 0x0001_E000, 0xDEAD_BEEF);
        assert_eq!(
            header,
            [0x80, 0x78, 0x00, 0x42, 0x00, 0x01, 0xE0, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn round_trip_transport_packet() {
        for mode in TransportMode::PREFERENCE_ORDER {
            let cipher = TransportCipher::new(mode, [0x7Au8; 32]);
            let opus_payload = vec![0xAAu8; 40];

            let packet = assemble(&cipher, 10, 19200, 0xCAFEBABE, 0, &opus_payload).unwrap();
            let decoded = parse_and_open(&cipher, &packet).unwrap();

            assert_eq!(decoded.ssrc, 0xCAFEBABE);
            assert_eq!(decoded.sequence, 10);
            assert_eq!(decoded.timestamp, 19200);
            assert_eq!(decoded.plaintext, opus_payload);
        }
    }

    #[test]
    fn rejects_short_datagrams() {
        let cipher = TransportCipher::new(TransportMode::Aes256GcmRtpsize, [0u8; 32]);
        let err = parse_and_open(&cipher, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, TransportError::PacketTooShort { .. }));
    }

    #[test]
    fn authentication_failure_drops_packet() {
        let cipher = TransportCipher::new(TransportMode::Aes256GcmRtpsize, [0u8; 32]);
        let mut packet = assemble(&cipher, 1, 960, 1, 0, b"hello").unwrap();
        *packet.last_mut().unwrap() ^= 0xFF; // corrupt the trailing counter byte
        assert_eq!(parse_and_open(&cipher, &packet), Err(TransportError::DecryptFailed));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Builds/parses the DAVE E2EE frame: ULEB128 nonce, unencrypted ranges, supplemental
//! size, and the `0xFAFA` magic trailer (spec §3, §4.G, properties P4/P8, scenario S6).
//!
//! Generalises the teacher's AEAD seal/open pattern (`src/voice/crypto.rs`,
//! `src/transport/cipher.rs` in this crate) to AES-128-GCM with a truncated 8-byte tag,
//! the inner cipher DAVE specifies.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};

use crate::dave::uleb128;
use crate::errors::DaveError;

/// Truncated auth tag length DAVE uses, vs. the AEAD's native 16 bytes.
pub const TRUNCATED_TAG_SIZE: usize = 8;
pub const MAGIC_MARKER: [u8; 2] = [0xFA, 0xFA];
/// Conservative lower bound for a well-formed frame (spec §4.G "Validate length >= 11").
pub const MIN_FRAME_LEN: usize = 11;

/// A derived 16-byte frame key, bound to one `(user_id, ssrc, generation)` triple.
pub type FrameKey = [u8; 16];

/// The nonce value encoded in a DAVE frame: `generation` (high 8 bits) and the
/// per-generation frame counter (low 24 bits), per spec §4.F "Generation/nonce coupling".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaveNonce {
    pub generation: u8,
    pub counter: u32,
}

impl DaveNonce {
    pub fn new(generation: u8, counter: u32) -> Self {
        debug_assert!(counter < (1 << 24), "frame counter must fit in 24 bits");
        Self { generation, counter }
    }

    fn to_value(self) -> u32 {
        (u32::from(self.generation) << 24) | (self.counter & 0x00FF_FFFF)
    }

    fn from_value(value: u32) -> Self {
        Self {
            generation: (value >> 24) as u8,
            counter: value & 0x00FF_FFFF,
        }
    }
}

fn inner_nonce(counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[8..12].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Encrypts one Opus frame under `frame_key` and `nonce`, producing the full wire
/// layout: `ciphertext | tag(8) | nonce_uleb128 | ranges(empty) | supplemental_size | 0xFAFA`.
pub fn encode(frame_key: &FrameKey, nonce: DaveNonce, plaintext: &[u8]) -> Result<Vec<u8>, DaveError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(frame_key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&inner_nonce(nonce.counter)), Payload { msg: plaintext, aad: &[] })
        .map_err(|_| DaveError::FrameDecryptFailed)?;

    let (ciphertext, full_tag) = sealed.split_at(sealed.len() - 16);
    let tag = &full_tag[..TRUNCATED_TAG_SIZE];
    let nonce_bytes = uleb128::encode(nonce.to_value());
    let ranges: &[u8] = &[];

    let supplemental_size = (TRUNCATED_TAG_SIZE + nonce_bytes.len() + ranges.len() + 1 + 2) as u8;

    let mut frame = Vec::with_capacity(ciphertext.len() + supplemental_size as usize);
    frame.extend_from_slice(ciphertext);
    frame.extend_from_slice(tag);
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(ranges);
    frame.push(supplemental_size);
    frame.extend_from_slice(&MAGIC_MARKER);
    Ok(frame)
}

/// The plaintext and nonce recovered from a decoded DAVE frame.
pub struct DecodedFrame {
    pub nonce: DaveNonce,
    pub plaintext: Vec<u8>,
}

/// Validates framing and recovers the `(ciphertext, tag, nonce)` slices/value without
/// attempting decryption, so the `generation` half of the nonce can be read before a
/// frame key is known (a caller must derive the key from `generation` first).
fn parse_layout(datagram: &[u8]) -> Result<(&[u8], &[u8], DaveNonce), DaveError> {
    if datagram.len() < MIN_FRAME_LEN {
        return Err(DaveError::FrameTooShort { len: datagram.len() });
    }

    let len = datagram.len();
    if datagram[len - 2..] != MAGIC_MARKER {
        return Err(DaveError::BadMagicMarker);
    }

    let supplemental_size = datagram[len - 3] as usize;
    if supplemental_size < TRUNCATED_TAG_SIZE + 1 + 1 + 2 || supplemental_size > len {
        return Err(DaveError::FrameTooShort { len });
    }

    let supplemental_start = len - supplemental_size;
    let ciphertext = &datagram[..supplemental_start];
    let tag = &datagram[supplemental_start..supplemental_start + TRUNCATED_TAG_SIZE];

    let nonce_start = supplemental_start + TRUNCATED_TAG_SIZE;
    let (nonce_value, _nonce_consumed) = uleb128::decode(&datagram[nonce_start..len - 3])?;
    let nonce = DaveNonce::from_value(nonce_value);

    Ok((ciphertext, tag, nonce))
}

/// Reads a candidate DAVE frame's nonce (and therefore its `generation`) without
/// decrypting it, so the caller can look up the right frame key before calling
/// [`decode`] (spec §4.G "Extract `generation` ..., look up frame key ...").
pub fn peek_nonce(datagram: &[u8]) -> Result<DaveNonce, DaveError> {
    parse_layout(datagram).map(|(_, _, nonce)| nonce)
}

/// Parses and decrypts a DAVE frame. Rejects frames shorter than [`MIN_FRAME_LEN`] or
/// whose trailing two bytes are not [`MAGIC_MARKER`] (invariant I4, property P8,
/// scenario S6) without attempting any frame-key lookup.
pub fn decode(frame_key: &FrameKey, datagram: &[u8]) -> Result<DecodedFrame, DaveError> {
    let (ciphertext, tag, nonce) = parse_layout(datagram)?;

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(frame_key));
    let mut full_tag = [0u8; 16];
    full_tag[..TRUNCATED_TAG_SIZE].copy_from_slice(tag);

    let mut sealed = Vec::with_capacity(ciphertext.len() + 16);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(&full_tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&inner_nonce(nonce.counter)), Payload { msg: &sealed, aad: &[] })
        .map_err(|_| DaveError::FrameDecryptFailed)?;

    Ok(DecodedFrame { nonce, plaintext })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FrameKey {
        [0x5Au8; 16]
    }

    #[test]
    fn round_trip_property_p4() {
        let nonce = DaveNonce::new(3, 42);
        let plaintext = b"an opus frame of bytes";

        let frame = encode(&key(), nonce, plaintext).unwrap();
        let decoded = decode(&key(), &frame).unwrap();

        assert_eq!(decoded.nonce, nonce);
        assert_eq!(decoded.plaintext, plaintext);
    }

    #[test]
    fn rejects_bad_magic_marker_scenario_s6() {
        let nonce = DaveNonce::new(0, 1);
        let mut frame = encode(&key(), nonce, b"hello").unwrap();
        let len = frame.len();
        frame[len - 1] = 0xFB;

        assert_eq!(decode(&key(), &frame), Err(DaveError::BadMagicMarker));
    }

    #[test]
    fn rejects_short_frames() {
        assert_eq!(decode(&key(), &[0u8; 5]), Err(DaveError::FrameTooShort { len: 5 }));
    }

    #[test]
    fn generation_is_high_byte_of_nonce() {
        let nonce = DaveNonce::new(7, 0x00AB_CDEF & 0x00FF_FFFF);
        assert_eq!(DaveNonce::from_value(nonce.to_value()), nonce);
    }
}

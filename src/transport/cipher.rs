// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! AEAD seal/open under the selected voice encryption mode, using the 32-byte
//! session key handed down by Session-Description.
//!
//! Two modes are supported: AES-256-GCM-rtpsize and XChaCha20-Poly1305-rtpsize. Both
//! use the 12-byte RTP header as AAD and append a 4-byte big-endian transport nonce
//! counter after the ciphertext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::XChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::TransportError;

pub const RTP_HEADER_SIZE: usize = 12;
pub const TRANSPORT_NONCE_COUNTER_SIZE: usize = 4;

/// The two AEAD modes the core supports. Both are "rtpsize" variants: the RTP header
/// is the AAD and the final 4 bytes of the packet are the plaintext nonce counter.
///
/// See <https://discord.com/developers/docs/topics/voice-connections#transport-encryption-and-decryption>
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    #[serde(rename = "aead_aes256_gcm_rtpsize")]
    Aes256GcmRtpsize,
    #[serde(rename = "aead_xchacha20_poly1305_rtpsize")]
    XChaCha20Poly1305Rtpsize,
}

impl TransportMode {
    /// Preference order for `SelectProtocol`: AES-256-GCM first.
    pub const PREFERENCE_ORDER: [TransportMode; 2] =
        [TransportMode::Aes256GcmRtpsize, TransportMode::XChaCha20Poly1305Rtpsize];

    /// Picks the most preferred mode present in `offered`, if any.
    pub fn select(offered: &[TransportMode]) -> Option<TransportMode> {
        Self::PREFERENCE_ORDER
            .into_iter()
            .find(|preferred| offered.contains(preferred))
    }

    pub fn tag_size(self) -> usize {
        16
    }

    fn nonce_size(self) -> usize {
        match self {
            TransportMode::Aes256GcmRtpsize => 12,
            TransportMode::XChaCha20Poly1305Rtpsize => 24,
        }
    }
}

enum Aead256 {
    Aes256Gcm(Box<Aes256Gcm>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

/// Seals/opens RTP payloads under the session's selected AEAD mode and 32-byte key.
///
/// The key is held in a [`Zeroizing`] buffer and wiped on drop, so session teardown
/// destroys cipher state rather than leaving key material to linger in memory.
pub struct TransportCipher {
    mode: TransportMode,
    key: Zeroizing<[u8; 32]>,
    aead: Aead256,
}

impl TransportCipher {
    pub fn new(mode: TransportMode, secret_key: [u8; 32]) -> Self {
        let aead = match mode {
            TransportMode::Aes256GcmRtpsize => Aead256::Aes256Gcm(Box::new(Aes256Gcm::new(&secret_key.into()))),
            TransportMode::XChaCha20Poly1305Rtpsize => {
                Aead256::XChaCha20Poly1305(Box::new(XChaCha20Poly1305::new(&secret_key.into())))
            }
        };
        Self {
            mode,
            key: Zeroizing::new(secret_key),
            aead,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Builds the nonce for a given counter and (for XChaCha20Poly1305Rtpsize) RTP header.
    fn build_nonce(&self, rtp_header: &[u8; RTP_HEADER_SIZE], counter: u32) -> Vec<u8> {
        let mut nonce = Vec::with_capacity(self.mode.nonce_size());
        if self.mode == TransportMode::XChaCha20Poly1305Rtpsize {
            nonce.extend_from_slice(rtp_header);
            nonce.extend_from_slice(&[0u8; 8]);
        } else {
            nonce.extend_from_slice(&[0u8; 8]);
        }
        nonce.extend_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Seals `payload` under the RTP header as AAD and the given transport nonce
    /// counter. Returns `ciphertext || tag`; the caller appends the 4-byte counter.
    pub fn seal(
        &self,
        rtp_header: &[u8; RTP_HEADER_SIZE],
        counter: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let nonce = self.build_nonce(rtp_header, counter);
        let aad_payload = Payload { msg: payload, aad: rtp_header.as_slice() };

        let sealed = match &self.aead {
            Aead256::Aes256Gcm(cipher) => cipher.encrypt(aes_gcm::Nonce::from_slice(&nonce), aad_payload),
            Aead256::XChaCha20Poly1305(cipher) => {
                cipher.encrypt(chacha20poly1305::XNonce::from_slice(&nonce), aad_payload)
            }
        };

        sealed.map_err(|_| TransportError::BrokenSocket {
            error: "AEAD seal failed".into(),
        })
    }

    /// Opens `ciphertext` (without the trailing counter) under the RTP header as AAD
    /// and the given transport nonce counter.
    pub fn open(
        &self,
        rtp_header: &[u8; RTP_HEADER_SIZE],
        counter: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let nonce = self.build_nonce(rtp_header, counter);
        let aad_payload = Payload { msg: ciphertext, aad: rtp_header.as_slice() };

        let opened = match &self.aead {
            Aead256::Aes256Gcm(cipher) => cipher.decrypt(aes_gcm::Nonce::from_slice(&nonce), aad_payload),
            Aead256::XChaCha20Poly1305(cipher) => {
                cipher.decrypt(chacha20poly1305::XNonce::from_slice(&nonce), aad_payload)
            }
        };

        opened.map_err(|_| TransportError::DecryptFailed)
    }

    /// Returns the raw session key bytes. Used only by code that must derive further
    /// material from it (there is none on the hot path; present for completeness /
    /// diagnostics, never logged).
    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_header() -> [u8; 12] {
        [0x80, 0x78, 0x00, 0x42, 0x00, 0x01, 0xE0, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]
    }

    #[test]
    fn aes_gcm_nonce_construction_matches_expected_bytes() {
        let cipher = TransportCipher::new(TransportMode::Aes256GcmRtpsize, [0u8; 32]);
        let nonce = cipher.build_nonce(&rtp_header(), 7);
        assert_eq!(
            nonce,
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07]
        );
    }

    #[test]
    fn xchacha20_nonce_includes_rtp_header() {
        let cipher = TransportCipher::new(TransportMode::XChaCha20Poly1305Rtpsize, [0u8; 32]);
        let header = rtp_header();
        let nonce = cipher.build_nonce(&header, 7);
        assert_eq!(nonce.len(), 24);
        assert_eq!(&nonce[0..12], &header);
        assert_eq!(&nonce[12..20], &[0u8; 8]);
        assert_eq!(&nonce[20..24], &[0, 0, 0, 7]);
    }

    #[test]
    fn round_trip_both_modes() {
        for mode in TransportMode::PREFERENCE_ORDER {
            let cipher = TransportCipher::new(mode, [0x42u8; 32]);
            let header = rtp_header();
            let plaintext = b"opus payload bytes here";

            let sealed = cipher.seal(&header, 0, plaintext).unwrap();
            let opened = cipher.open(&header, 0, &sealed).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let cipher = TransportCipher::new(TransportMode::Aes256GcmRtpsize, [0x11u8; 32]);
        let header = rtp_header();
        let sealed = cipher.seal(&header, 3, b"payload").unwrap();

        let mut bad_header = header;
        bad_header[3] ^= 0xFF;
        assert_eq!(cipher.open(&bad_header, 3, &sealed), Err(TransportError::DecryptFailed));
    }

    #[test]
    fn wrong_counter_fails_authentication() {
        let cipher = TransportCipher::new(TransportMode::XChaCha20Poly1305Rtpsize, [0x22u8; 32]);
        let header = rtp_header();
        let sealed = cipher.seal(&header, 5, b"payload").unwrap();
        assert_eq!(cipher.open(&header, 6, &sealed), Err(TransportError::DecryptFailed));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Opus encode/decode capability contract and frame-size validation.
//!
//! Opus itself is never linked against directly: callers supply an [`Encoder`] and
//! [`Decoder`] implementation, the same external-collaborator pattern the consuming
//! application (not this crate) provides for the signalling transport/token.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::OpusError;
use crate::opus::{FRAME_SAMPLES_TOTAL, SAMPLE_RATE_HZ};

/// Encodes validated 20ms PCM frames into Opus packets.
///
/// Implementations wrap a real Opus encoder configured for
/// `(sample_rate=48000, channels=2, frame_size=960, bitrate:500..=512000)`.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, OpusError>;
}

/// Decodes Opus packets into PCM, with packet-loss concealment and FEC recovery.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decodes one Opus packet. `None` signals packet loss; the decoder produces
    /// concealment audio for the missing frame.
    async fn decode(&mut self, opus: Option<&[u8]>) -> Result<Vec<i16>, OpusError>;

    /// Recovers the *previous* frame from this packet's FEC side-data.
    async fn decode_fec(&mut self, opus: &[u8]) -> Result<Vec<i16>, OpusError>;
}

/// Validates frame size and drives an [`Encoder`]/[`Decoder`] pair, keeping the
/// transport's fixed 960-samples-per-channel contract in one place.
pub struct OpusPipeline<E, D> {
    encoder: E,
    decoder: D,
}

impl<E: Encoder, D: Decoder> OpusPipeline<E, D> {
    pub fn new(encoder: E, decoder: D) -> Self {
        Self { encoder, decoder }
    }

    /// Encodes one interleaved stereo PCM frame. Rejects any frame size other than
    /// [`FRAME_SAMPLES_TOTAL`]; alternative sizes are rejected at the boundary.
    pub async fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, OpusError> {
        if pcm.len() != FRAME_SAMPLES_TOTAL {
            return Err(OpusError::WrongFrameSize {
                got: pcm.len(),
                expected: FRAME_SAMPLES_TOTAL,
            });
        }
        self.encoder.encode(pcm).await
    }

    pub async fn decode(&mut self, opus: Option<&[u8]>) -> Result<Vec<i16>, OpusError> {
        self.decoder.decode(opus).await
    }

    pub async fn decode_fec(&mut self, opus: &[u8]) -> Result<Vec<i16>, OpusError> {
        self.decoder.decode_fec(opus).await
    }
}

/// One [`Decoder`] per observed SSRC, created lazily on first packet. Receive
/// demultiplexes by SSRC and dispatches each stream to its own decoder state.
pub struct DecoderPool<D> {
    decoders: HashMap<u32, D>,
    factory: Box<dyn Fn() -> D + Send + Sync>,
}

impl<D: Decoder> DecoderPool<D> {
    pub fn new(factory: impl Fn() -> D + Send + Sync + 'static) -> Self {
        Self { decoders: HashMap::new(), factory: Box::new(factory) }
    }

    /// Decodes one packet for `ssrc`, creating that SSRC's decoder on first use.
    pub async fn decode(&mut self, ssrc: u32, opus: Option<&[u8]>) -> Result<Vec<i16>, OpusError> {
        self.decoders.entry(ssrc).or_insert_with(|| (self.factory)()).decode(opus).await
    }

    pub async fn decode_fec(&mut self, ssrc: u32, opus: &[u8]) -> Result<Vec<i16>, OpusError> {
        self.decoders.entry(ssrc).or_insert_with(|| (self.factory)()).decode_fec(opus).await
    }

    /// Drops a decoder, e.g. once its SSRC's stream is known to have ended.
    pub fn remove(&mut self, ssrc: u32) {
        self.decoders.remove(&ssrc);
    }
}

/// Sanity bound used by session-level bitrate configuration.
pub const OPUS_BITRATE_RANGE: std::ops::RangeInclusive<u32> = 500..=512_000;

/// The sample rate every [`Encoder`]/[`Decoder`] implementation must be configured for.
pub fn expected_sample_rate() -> u32 {
    SAMPLE_RATE_HZ
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoEncoder;

    #[async_trait]
    impl Encoder for EchoEncoder {
        async fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, OpusError> {
            Ok(pcm.iter().flat_map(|s| s.to_le_bytes()).collect())
        }
    }

    struct NullDecoder;

    #[async_trait]
    impl Decoder for NullDecoder {
        async fn decode(&mut self, _opus: Option<&[u8]>) -> Result<Vec<i16>, OpusError> {
            Ok(vec![0i16; FRAME_SAMPLES_TOTAL])
        }

        async fn decode_fec(&mut self, _opus: &[u8]) -> Result<Vec<i16>, OpusError> {
            Ok(vec![0i16; FRAME_SAMPLES_TOTAL])
        }
    }

    #[tokio::test]
    async fn rejects_wrong_frame_size() {
        let mut pipeline = OpusPipeline::new(EchoEncoder, NullDecoder);
        let err = pipeline.encode(&[0i16; 100]).await.unwrap_err();
        assert_eq!(
            err,
            OpusError::WrongFrameSize { got: 100, expected: FRAME_SAMPLES_TOTAL }
        );
    }

    #[tokio::test]
    async fn accepts_exact_frame_size() {
        let mut pipeline = OpusPipeline::new(EchoEncoder, NullDecoder);
        let pcm = vec![42i16; FRAME_SAMPLES_TOTAL];
        let encoded = pipeline.encode(&pcm).await.unwrap();
        assert_eq!(encoded.len(), FRAME_SAMPLES_TOTAL * 2);
    }

    #[tokio::test]
    async fn decoder_pool_creates_one_decoder_per_ssrc() {
        let mut pool = DecoderPool::new(|| NullDecoder);
        pool.decode(111, None).await.unwrap();
        pool.decode(222, None).await.unwrap();
        assert_eq!(pool.decoders.len(), 2);

        pool.remove(111);
        assert_eq!(pool.decoders.len(), 1);
    }
}

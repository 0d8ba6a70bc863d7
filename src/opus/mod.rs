// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PCM-to-Opus packetisation pipeline: frame-size validation, silence-frame
//! bookkeeping, and the `Encoder`/`Decoder` capability contract the real Opus codec
//! binds to. Opus itself is an external collaborator, consumed only via the traits in
//! `pipeline.rs` — the same way gateway wire backends are treated as swappable trait
//! objects elsewhere in this crate.

mod pipeline;
mod silence;

pub use pipeline::{Decoder, DecoderPool, Encoder, OpusPipeline, OPUS_BITRATE_RANGE};
pub use silence::{SilenceFlush, SILENCE_FRAME, SILENCE_FRAME_COUNT};

/// Samples per channel in one 20ms frame at 48kHz.
pub const FRAME_SAMPLES_PER_CHANNEL: usize = 960;
/// Total interleaved stereo samples in one 20ms frame (960 * 2 channels).
pub const FRAME_SAMPLES_TOTAL: usize = FRAME_SAMPLES_PER_CHANNEL * 2;
pub const SAMPLE_RATE_HZ: u32 = 48_000;
pub const CHANNELS: u8 = 2;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RTP transport: AEAD-sealed voice packets, IP discovery, and UDP I/O.

pub mod buffer_pool;
pub mod cipher;
pub mod discovery;
pub mod nonce;
pub mod rtp;
pub mod udp;

pub use buffer_pool::BufferPool;
pub use cipher::{TransportCipher, TransportMode};
pub use discovery::ExternalAddress;
pub use nonce::NonceCounter;
pub use rtp::{DecodedRtpPacket, RTP_TIMESTAMP_STEP};
pub use udp::{discover_external_address, UdpEvents, UdpHandle};

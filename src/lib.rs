// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![allow(clippy::module_inception)]

//! Voice transport and end-to-end encryption core.
//!
//! This crate turns a stream of PCM (or already-encoded Opus) audio frames into a
//! cryptographically protected, sequenced RTP datagram stream suitable for UDP
//! transmission to a voice relay, and inverts that transformation on ingress. It also
//! implements the DAVE end-to-end encryption overlay (MLS-group-derived keys layered
//! beneath the transport cipher) and the signalling state machine that negotiates
//! protocol transitions with the relay.
//!
//! The main chat gateway, REST client, and MLS/Opus codec implementations are external
//! collaborators: they are consumed through the traits in [`opus`] and [`dave::mls`].

pub mod dave;
pub mod errors;
pub mod opus;
#[cfg(feature = "client")]
pub mod session;
pub mod signalling;
pub mod transport;

#[cfg(feature = "client")]
pub use session::{Session, SessionOptions};

/// A Discord/Spacebar-style snowflake identifier: server-assigned, monotonic, and
/// timestamp-embedding. Re-derived here (rather than depending on a wider entity
/// crate) since the voice core only ever treats it as an opaque u64 key.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snowflake(pub u64);

impl std::fmt::Display for Snowflake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl serde::Serialize for Snowflake {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Snowflake {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct SnowflakeVisitor;
        impl serde::de::Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a snowflake string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Snowflake, E>
            where
                E: serde::de::Error,
            {
                value
                    .parse()
                    .map(Snowflake)
                    .map_err(|_| serde::de::Error::custom("invalid snowflake"))
            }
        }
        deserializer.deserialize_str(SnowflakeVisitor)
    }
}

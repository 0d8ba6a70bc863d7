// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The MLS group adapter boundary.
//!
//! The MLS library itself is an external collaborator — consumed only through this
//! trait, mirroring how the Opus codec is consumed through `opus::{Encoder, Decoder}`
//! and how the gateway WebSocket backend is treated as a swappable trait object
//! elsewhere in this crate.

use async_trait::async_trait;

use crate::errors::DaveError;

/// Opaque MLS group state snapshot.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub epoch: u64,
    pub protocol_version: u16,
    pub roster: Vec<u64>,
}

/// Result of processing a commit or welcome: the new epoch and the freshly exported
/// secret material the key schedule derives frame keys from.
#[derive(Clone)]
pub struct EpochSecret {
    pub epoch: u64,
    pub exporter_secret: Vec<u8>,
}

/// Capability interface over an MLS group, producing epoch secrets and consuming
/// proposals/commits/welcomes.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Bootstraps the group's external sender from a `PrepareEpoch{epoch_id: 1}`
    /// announcement.
    async fn process_external_sender(&mut self, package: &[u8]) -> Result<(), DaveError>;

    /// Generates this client's MLS key package for a pending join.
    async fn generate_key_package(&mut self) -> Result<Vec<u8>, DaveError>;

    /// Applies append/revoke proposals to the local proposal buffer.
    async fn process_proposals(&mut self, append: &[Vec<u8>], revoke: &[Vec<u8>]) -> Result<(), DaveError>;

    /// Processes an incoming commit, advancing the group epoch.
    async fn process_commit(&mut self, commit: &[u8]) -> Result<EpochSecret, DaveError>;

    /// Processes a welcome, joining the group at the epoch it announces.
    async fn process_welcome(&mut self, welcome: &[u8]) -> Result<EpochSecret, DaveError>;

    /// Exports `length` bytes of keying material under `label` from the current epoch
    /// secret.
    async fn export_secret(&self, label: &str, length: usize) -> Result<Vec<u8>, DaveError>;

    /// The adapter's current view of the group, if any.
    fn state(&self) -> Option<GroupState>;
}

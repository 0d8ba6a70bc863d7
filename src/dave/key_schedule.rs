// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Derives per-`(user_id, ssrc, generation)` frame keys from the current MLS exporter
//! secret, and caches them with epoch-based invalidation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use hkdf::Hkdf;
use sha2::Sha256;

use crate::dave::frame::FrameKey;
use crate::errors::DaveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    user_id: u64,
    ssrc: u32,
    generation: u8,
}

struct CacheEntry {
    key: FrameKey,
    epoch: u64,
}

/// Caches derived frame keys, tagging each with the MLS epoch it was derived under so
/// stale entries can be dropped wholesale on an epoch change.
///
/// Reads take a snapshot `Arc` clone of the map rather than a lock guard, keeping
/// lookups lock-free via a generation-tagged replace-the-map pattern.
pub struct KeySchedule {
    exporter_secret: RwLock<Option<(u64, Vec<u8>)>>,
    cache: RwLock<Arc<HashMap<CacheKey, CacheEntry>>>,
}

impl Default for KeySchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySchedule {
    pub fn new() -> Self {
        Self {
            exporter_secret: RwLock::new(None),
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Installs a new exporter secret for `epoch`, evicting every cache entry from an
    /// older epoch.
    pub fn set_exporter_secret(&self, epoch: u64, secret: Vec<u8>) {
        *self.exporter_secret.write().unwrap() = Some((epoch, secret));

        let mut cache = self.cache.write().unwrap();
        let retained: HashMap<CacheKey, CacheEntry> = cache
            .iter()
            .filter(|(_, entry)| entry.epoch == epoch)
            .map(|(k, v)| (*k, CacheEntry { key: v.key, epoch: v.epoch }))
            .collect();
        *cache = Arc::new(retained);
    }

    /// Derives (or returns a cached) frame key for `(user_id, ssrc, generation)` via
    /// HKDF-Expand over the current exporter secret with a domain-separating label.
    pub fn frame_key(&self, user_id: u64, ssrc: u32, generation: u8) -> Result<FrameKey, DaveError> {
        let cache_key = CacheKey { user_id, ssrc, generation };

        let snapshot = self.cache.read().unwrap().clone();
        if let Some(entry) = snapshot.get(&cache_key) {
            return Ok(entry.key);
        }

        let (epoch, secret) = self
            .exporter_secret
            .read()
            .unwrap()
            .clone()
            .ok_or(DaveError::NoActiveGroup)?;

        let derived = derive_frame_key(&secret, user_id, ssrc, generation);

        let mut cache = self.cache.write().unwrap();
        let mut next: HashMap<CacheKey, CacheEntry> = (**cache)
            .iter()
            .map(|(k, v)| (*k, CacheEntry { key: v.key, epoch: v.epoch }))
            .collect();
        next.insert(cache_key, CacheEntry { key: derived, epoch });
        *cache = Arc::new(next);

        Ok(derived)
    }

    /// Invalidates every cached entry regardless of epoch (used on full session reset).
    pub fn clear(&self) {
        *self.cache.write().unwrap() = Arc::new(HashMap::new());
        *self.exporter_secret.write().unwrap() = None;
    }
}

fn derive_frame_key(exporter_secret: &[u8], user_id: u64, ssrc: u32, generation: u8) -> FrameKey {
    let mut info = Vec::with_capacity(8 + 4 + 1 + 16);
    info.extend_from_slice(b"dave frame key");
    info.extend_from_slice(&user_id.to_be_bytes());
    info.extend_from_slice(&ssrc.to_be_bytes());
    info.push(generation);

    let hk = Hkdf::<Sha256>::new(None, exporter_secret);
    let mut key = [0u8; 16];
    hk.expand(&info, &mut key).expect("16-byte output is within HKDF-SHA256's range");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_deterministic_keys() {
        let schedule = KeySchedule::new();
        schedule.set_exporter_secret(1, vec![0x11u8; 32]);

        let a = schedule.frame_key(7, 12345, 0).unwrap();
        let b = schedule.frame_key(7, 12345, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_generations_yield_different_keys() {
        let schedule = KeySchedule::new();
        schedule.set_exporter_secret(1, vec![0x22u8; 32]);

        let a = schedule.frame_key(7, 12345, 0).unwrap();
        let b = schedule.frame_key(7, 12345, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn epoch_change_invalidates_old_entries() {
        let schedule = KeySchedule::new();
        schedule.set_exporter_secret(1, vec![0x33u8; 32]);
        let old_key = schedule.frame_key(7, 12345, 0).unwrap();

        schedule.set_exporter_secret(2, vec![0x44u8; 32]);
        let new_key = schedule.frame_key(7, 12345, 0).unwrap();

        assert_ne!(old_key, new_key);
    }

    #[test]
    fn no_secret_yet_is_an_error() {
        let schedule = KeySchedule::new();
        assert_eq!(schedule.frame_key(1, 2, 0), Err(DaveError::NoActiveGroup));
    }
}

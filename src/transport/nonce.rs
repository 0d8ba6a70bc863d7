// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-session monotonic 32-bit transport nonce counter.
//!
//! For any two packets sealed under the same `secret_key`, the counter values must
//! differ. The counter is reset to 0 on every key rotation (new Session-Description,
//! DAVE execute-transition, or counter exhaustion).

use crate::errors::TransportError;

/// Monotonic counter appended to every AEAD-sealed RTP packet.
///
/// A value of `0xFFFF_FFFF` is a valid, usable counter value; the *next* call to
/// [`NonceCounter::next`] after it is reached returns
/// [`TransportError::NonceCounterExhausted`] instead of wrapping, since wrapping would
/// silently reuse a (counter, key) pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonceCounter(Option<u32>);

impl NonceCounter {
    pub fn new() -> Self {
        Self(None)
    }

    /// Resets the counter to its initial state, as happens on key rotation.
    pub fn reset(&mut self) {
        self.0 = None;
    }

    /// Returns the next counter value and advances the sequence.
    ///
    /// The first call after construction or reset returns `0`.
    pub fn next(&mut self) -> Result<u32, TransportError> {
        let next = match self.0 {
            None => 0,
            Some(u32::MAX) => return Err(TransportError::NonceCounterExhausted),
            Some(n) => n + 1,
        };
        self.0 = Some(next);
        Ok(next)
    }

    /// The most recently issued counter value, if any.
    pub fn current(&self) -> Option<u32> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_from_zero() {
        let mut counter = NonceCounter::new();
        assert_eq!(counter.next().unwrap(), 0);
        assert_eq!(counter.next().unwrap(), 1);
        assert_eq!(counter.next().unwrap(), 2);
    }

    #[test]
    fn reset_returns_to_zero() {
        let mut counter = NonceCounter::new();
        counter.next().unwrap();
        counter.next().unwrap();
        counter.reset();
        assert_eq!(counter.next().unwrap(), 0);
    }

    #[test]
    fn exhaustion_is_rejected_not_wrapped() {
        let mut counter = NonceCounter(Some(u32::MAX));
        assert_eq!(counter.next(), Err(TransportError::NonceCounterExhausted));
    }

    #[test]
    fn max_value_itself_is_usable() {
        let mut counter = NonceCounter(Some(u32::MAX - 1));
        assert_eq!(counter.next().unwrap(), u32::MAX);
    }
}

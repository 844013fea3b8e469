//! Anti-replay protection for record counters.
//!
//! Stream records arrive strictly in order, datagram records may be
//! reordered or lost. One sliding window covers both:
//! - Window size: 2048 bits
//! - Below window: reject
//! - Seen counter: reject
//! - Above highest: advance the window

use crate::core::{CryptoError, REPLAY_WINDOW_SIZE};

/// Anti-replay sliding window.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Bit `i` set means counter `highest - i` has been seen.
    bitmap: [u64; REPLAY_WINDOW_SIZE / 64],
    /// Highest counter seen so far
    highest: u64,
    /// Whether we've seen any records yet
    initialized: bool,
}

impl ReplayWindow {
    /// Create a new replay window.
    pub fn new() -> Self {
        Self {
            bitmap: [0; REPLAY_WINDOW_SIZE / 64],
            highest: 0,
            initialized: false,
        }
    }

    /// Check if a counter would be rejected (without updating).
    pub fn is_replay(&self, counter: u64) -> bool {
        if !self.initialized || counter > self.highest {
            return false;
        }
        let diff = self.highest - counter;
        if diff >= REPLAY_WINDOW_SIZE as u64 {
            return true;
        }
        self.bit(diff as usize)
    }

    /// Check a counter and mark it as seen.
    ///
    /// Must only be called after the record authenticated, otherwise a
    /// forged counter could advance the window.
    pub fn check_and_update(&mut self, counter: u64) -> Result<(), CryptoError> {
        if !self.initialized {
            self.highest = counter;
            self.initialized = true;
            self.set_bit(0);
            return Ok(());
        }

        if counter > self.highest {
            self.shift_window(counter - self.highest);
            self.highest = counter;
            self.set_bit(0);
            return Ok(());
        }

        if self.is_replay(counter) {
            return Err(CryptoError::ReplayDetected);
        }
        self.set_bit((self.highest - counter) as usize);
        Ok(())
    }

    fn bit(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    /// Shift the window towards older positions by `shift` counters.
    fn shift_window(&mut self, shift: u64) {
        if shift >= REPLAY_WINDOW_SIZE as u64 {
            self.bitmap = [0; REPLAY_WINDOW_SIZE / 64];
            return;
        }

        let shift_words = (shift / 64) as usize;
        let shift_bits = (shift % 64) as u32;

        if shift_words > 0 {
            for i in (shift_words..self.bitmap.len()).rev() {
                self.bitmap[i] = self.bitmap[i - shift_words];
            }
            for word in self.bitmap.iter_mut().take(shift_words) {
                *word = 0;
            }
        }

        // Carry flows from word i into word i + 1 (older positions).
        if shift_bits > 0 {
            let mut carry = 0u64;
            for word in self.bitmap.iter_mut() {
                let new_carry = *word >> (64 - shift_bits);
                *word = (*word << shift_bits) | carry;
                carry = new_carry;
            }
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

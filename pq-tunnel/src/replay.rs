//! Sliding-window replay filter for data-plane sequence numbers.
//!
//! The window remembers the highest sequence accepted and which of the
//! `size` sequences below it have been seen. A sequence is acceptable if it
//! is newer than the highest, or at most `size` behind it and unseen.
//! Bits live in a ring of u64 words indexed by `seq % capacity`.

use crate::error::DropReason;

#[derive(Clone, Debug)]
pub struct ReplayWindow {
    size: u64,
    highest: Option<u64>,
    bits: Vec<u64>,
}

impl ReplayWindow {
    pub fn new(size: u64) -> Self {
        let words = (size + 1).div_ceil(64) as usize;
        Self {
            size,
            highest: None,
            bits: vec![0u64; words],
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    fn capacity(&self) -> u64 {
        self.bits.len() as u64 * 64
    }

    fn slot(&self, seq: u64) -> (usize, u64) {
        let idx = seq % self.capacity();
        ((idx / 64) as usize, 1u64 << (idx % 64))
    }

    fn is_set(&self, seq: u64) -> bool {
        let (word, mask) = self.slot(seq);
        self.bits[word] & mask != 0
    }

    fn set(&mut self, seq: u64) {
        let (word, mask) = self.slot(seq);
        self.bits[word] |= mask;
    }

    fn clear(&mut self, seq: u64) {
        let (word, mask) = self.slot(seq);
        self.bits[word] &= !mask;
    }

    /// Would `seq` be accepted? Does not modify the window.
    pub fn check(&self, seq: u64) -> Result<(), DropReason> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if seq > highest {
            return Ok(());
        }
        if highest - seq > self.size || self.is_set(seq) {
            return Err(DropReason::ReplayDetected);
        }
        Ok(())
    }

    /// Record `seq` as seen. Call only after `check` succeeded for it.
    pub fn mark(&mut self, seq: u64) {
        match self.highest {
            Some(highest) if seq <= highest => self.set(seq),
            Some(highest) => {
                if seq - highest >= self.capacity() {
                    self.bits.iter_mut().for_each(|w| *w = 0);
                } else {
                    for stale in highest + 1..seq {
                        self.clear(stale);
                    }
                    self.clear(seq);
                }
                self.set(seq);
                self.highest = Some(seq);
            }
            None => {
                self.bits.iter_mut().for_each(|w| *w = 0);
                self.set(seq);
                self.highest = Some(seq);
            }
        }
    }

    /// `check` then `mark` in one step
    #[cfg(test)]
    pub(crate) fn accept(&mut self, seq: u64) -> Result<(), DropReason> {
        self.check(seq)?;
        self.mark(seq);
        Ok(())
    }
}

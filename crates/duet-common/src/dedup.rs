//! Duplicate detection for relayed messages.
//!
//! The relay delivers at most once but may deliver late and out of order,
//! and a sender may retransmit. Each sender instance numbers its messages
//! with a strictly increasing `seq`; receivers keep one [`SequenceWindow`]
//! per sender instance and drop anything already admitted.
//!
//! The window only answers "seen before?". It never holds messages back
//! to restore order.

use std::collections::HashMap;

/// Sliding bitmap over the most recent sequence numbers of one sender.
#[derive(Debug, Clone)]
pub struct SequenceWindow {
    /// Highest admitted sequence number, `None` before the first message.
    newest: Option<u64>,
    /// Bit `n` set means `newest - n` was admitted.
    seen: u128,
    span: u64,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceWindow {
    pub const DEFAULT_SPAN: u64 = 128;

    pub fn new() -> Self {
        Self::with_span(Self::DEFAULT_SPAN)
    }

    /// # Panics
    /// Panics if `span` is 0 or greater than 128.
    pub fn with_span(span: u64) -> Self {
        assert!((1..=128).contains(&span), "window span must be 1-128");
        Self {
            newest: None,
            seen: 0,
            span,
        }
    }

    /// Admit `seq` if it has not been seen. Returns `false` for duplicates
    /// and for numbers that fell behind the window.
    pub fn admit(&mut self, seq: u64) -> bool {
        let Some(newest) = self.newest else {
            self.newest = Some(seq);
            self.seen = 1;
            return true;
        };

        if seq > newest {
            let advance = seq - newest;
            self.seen = if advance >= 128 { 0 } else { self.seen << advance };
            self.seen |= 1;
            self.newest = Some(seq);
            return true;
        }

        let age = newest - seq;
        if age >= self.span {
            return false;
        }
        let bit = 1u128 << age;
        if self.seen & bit != 0 {
            return false;
        }
        self.seen |= bit;
        true
    }
}

/// One [`SequenceWindow`] per sender id and epoch.
///
/// A sender that restarts picks a new epoch and starts over at seq 1; the
/// old window stays behind and never blocks the new instance.
#[derive(Debug, Default, Clone)]
pub struct SenderWindows {
    windows: HashMap<(String, u64), SequenceWindow>,
}

impl SenderWindows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, sender: &str, epoch: u64, seq: u64) -> bool {
        self.windows
            .entry((sender.to_string(), epoch))
            .or_default()
            .admit(seq)
    }
}

//! Buffer-level FSK encoding.

use crate::frame::{encode_byte, BitTime, SignalLevel};
use fsk_common::error::{FskError, FskResult};
use serde::Serialize;
use tracing::debug;

/// Ordered hold durations, in ticks, alternating signal level.
///
/// The first delay is held at [`SignalLevel::Space`] (the first start bit);
/// every following delay is held at the opposite level of its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct DelaySequence {
    delays: Vec<u16>,
}

impl DelaySequence {
    /// Create an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the frame for one byte.
    pub fn push_byte(&mut self, byte: u8, bit_time: BitTime) {
        encode_byte(byte, bit_time, &mut self.delays);
    }

    /// Number of delays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// True if no bytes have been encoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// Borrow the raw delays.
    #[must_use]
    pub fn as_slice(&self) -> &[u16] {
        &self.delays
    }

    /// Take ownership of the raw delays.
    #[must_use]
    pub fn into_vec(self) -> Vec<u16> {
        self.delays
    }

    /// Sum of all delays in ticks.
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.delays.iter().map(|&d| u64::from(d)).sum()
    }

    /// Number of level transitions between the first and last delay.
    #[must_use]
    pub fn transitions(&self) -> usize {
        self.delays.len().saturating_sub(1)
    }

    /// Iterate `(level, delay)` pairs starting at the start bit's level.
    pub fn levels(&self) -> impl Iterator<Item = (SignalLevel, u16)> + '_ {
        self.delays.iter().scan(SignalLevel::Space.flip(), |level, &delay| {
            *level = level.flip();
            Some((*level, delay))
        })
    }
}

impl AsRef<[u16]> for DelaySequence {
    fn as_ref(&self) -> &[u16] {
        &self.delays
    }
}

impl From<DelaySequence> for Vec<u16> {
    fn from(seq: DelaySequence) -> Self {
        seq.delays
    }
}

/// Encode a buffer of bytes into one owned [`DelaySequence`].
///
/// The result is the concatenation of the per-byte encodings, in order.
///
/// # Errors
///
/// Returns [`FskError::InvalidInput`] for an empty buffer; nothing is
/// allocated in that case.
///
/// # Example
///
/// ```
/// use fsk_encoder::{encode_block, BitTime};
///
/// let t = BitTime::new(1).unwrap();
/// assert!(encode_block(&[], t).is_err());
///
/// let seq = encode_block(b"U", t).unwrap(); // 0x55
/// assert_eq!(seq.len(), 10);
/// ```
pub fn encode_block(data: &[u8], bit_time: BitTime) -> FskResult<DelaySequence> {
    if data.is_empty() {
        return Err(FskError::InvalidInput("cannot encode an empty buffer".into()));
    }

    // At most ten holds per byte.
    let mut seq = DelaySequence {
        delays: Vec::with_capacity(data.len() * 10),
    };
    for &byte in data {
        seq.push_byte(byte, bit_time);
    }

    debug!(
        bytes = data.len(),
        delays = seq.len(),
        bit_time = bit_time.ticks(),
        "Encoded FSK block"
    );
    Ok(seq)
}

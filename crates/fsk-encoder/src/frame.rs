//! Per-byte FSK frame encoding.
//!
//! A serial frame is one start bit (space), eight data bits sent LSB-first,
//! and one stop bit (mark). The encoder collapses runs of identical levels
//! into a single hold duration:
//!
//! ```text
//! byte 0x0F:  S  1  1  1  1  0  0  0  0  P
//!               ___________              ___
//!       _______|           |____________|
//!          1t       4t          4t       1t
//! ```

use fsk_common::config::PlayerConfig;
use fsk_common::error::{FskError, FskResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of bit periods in one frame (start + 8 data + stop).
pub const FRAME_BITS: u16 = 10;

/// Signal level on the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalLevel {
    /// Logical 0; the start bit level and the level playback begins at.
    #[default]
    Space,
    /// Logical 1; the stop bit and idle level.
    Mark,
}

impl SignalLevel {
    /// The opposite level.
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            Self::Space => Self::Mark,
            Self::Mark => Self::Space,
        }
    }

    fn from_bit(bit: u16) -> Self {
        if bit & 1 == 0 {
            Self::Space
        } else {
            Self::Mark
        }
    }
}

impl fmt::Display for SignalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Space => write!(f, "SPACE"),
            Self::Mark => write!(f, "MARK"),
        }
    }
}

/// Duration of one serial bit period, in ticks.
///
/// Always non-zero and small enough that a whole frame fits in a 16-bit
/// delay, so encoding can never overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BitTime(u16);

impl BitTime {
    /// Largest bit time whose full frame still fits in a `u16` delay.
    pub const MAX: u16 = u16::MAX / FRAME_BITS;

    /// Create a bit time of `ticks` ticks.
    ///
    /// # Errors
    ///
    /// Returns [`FskError::InvalidInput`] if `ticks` is zero or above [`BitTime::MAX`].
    pub fn new(ticks: u16) -> FskResult<Self> {
        if ticks == 0 || ticks > Self::MAX {
            return Err(FskError::InvalidInput(format!(
                "bit time must be in 1..={} ticks, got {ticks}",
                Self::MAX
            )));
        }
        Ok(Self(ticks))
    }

    /// Derive the bit time for `baud_rate` in units of `tick`, rounded to
    /// the nearest tick.
    ///
    /// # Errors
    ///
    /// Returns [`FskError::InvalidInput`] if the baud rate or tick is zero or
    /// the resulting bit time is out of range.
    pub fn from_baud(baud_rate: u32, tick: Duration) -> FskResult<Self> {
        let tick_ns = tick.as_nanos();
        if baud_rate == 0 || tick_ns == 0 {
            return Err(FskError::InvalidInput(format!(
                "cannot derive bit time from {baud_rate} baud with {tick:?} ticks"
            )));
        }
        let den = u128::from(baud_rate) * tick_ns;
        let ticks = (1_000_000_000u128 + den / 2) / den;
        let ticks = u16::try_from(ticks).map_err(|_| {
            FskError::InvalidInput(format!(
                "{baud_rate} baud needs {ticks} ticks per bit, more than {}",
                Self::MAX
            ))
        })?;
        Self::new(ticks)
    }

    /// Resolve the bit time a configuration asks for.
    ///
    /// An explicit `bit_time` wins over the `baud_rate` derivation.
    ///
    /// # Errors
    ///
    /// Propagates [`BitTime::new`] / [`BitTime::from_baud`] range errors.
    pub fn from_config(config: &PlayerConfig) -> FskResult<Self> {
        match config.bit_time {
            Some(ticks) => Self::new(ticks),
            None => Self::from_baud(config.baud_rate, config.tick),
        }
    }

    /// Bit time in ticks.
    #[must_use]
    pub fn ticks(self) -> u16 {
        self.0
    }
}

/// Append the run-length encoded hold durations for one framed byte.
///
/// The byte is treated as a 9-bit value with the stop bit (1) above bit 7,
/// preceded by the start bit (0). Bits are scanned LSB-first; while a bit
/// matches the current level its bit period is added to the running hold,
/// and each level change pushes the hold and starts a new one. The final
/// hold is always pushed and is always at mark level.
///
/// The pushed delays sum to exactly `10 * bit_time`.
///
/// # Example
///
/// ```
/// use fsk_encoder::{encode_byte, BitTime};
///
/// let t = BitTime::new(10).unwrap();
/// let mut delays = Vec::new();
/// encode_byte(0x0F, t, &mut delays);
/// assert_eq!(delays, vec![10, 40, 40, 10]);
/// ```
pub fn encode_byte(byte: u8, bit_time: BitTime, delays: &mut Vec<u16>) {
    let t = bit_time.ticks();
    let mut level = SignalLevel::Space;
    // start bit
    let mut hold = t;
    let mut bits = u16::from(byte) | 0x100;

    for _ in 0..9 {
        let bit = SignalLevel::from_bit(bits);
        if bit == level {
            hold += t;
        } else {
            delays.push(hold);
            level = bit;
            hold = t;
        }
        bits >>= 1;
    }
    delays.push(hold);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(byte: u8, ticks: u16) -> Vec<u16> {
        let mut delays = Vec::new();
        encode_byte(byte, BitTime::new(ticks).unwrap(), &mut delays);
        delays
    }

    /// Level sequence of the full frame: start, data LSB-first, stop.
    fn frame_levels(byte: u8) -> Vec<u8> {
        let mut levels = vec![0];
        levels.extend((0..8).map(|i| (byte >> i) & 1));
        levels.push(1);
        levels
    }

    #[test]
    fn test_every_byte_spans_ten_bit_times() {
        for t in [1u16, 7, 100, BitTime::MAX] {
            for byte in 0..=255u8 {
                let total: u32 = encode(byte, t).iter().map(|&d| u32::from(d)).sum();
                assert_eq!(total, 10 * u32::from(t), "byte {byte:#04x}, bit time {t}");
            }
        }
    }

    #[test]
    fn test_zero_byte_merges_start_and_data() {
        assert_eq!(encode(0x00, 5), vec![45, 5]);
    }

    #[test]
    fn test_ff_byte_merges_data_and_stop() {
        assert_eq!(encode(0xFF, 5), vec![5, 45]);
    }

    #[test]
    fn test_alternating_byte_has_one_hold_per_bit() {
        assert_eq!(encode(0x55, 3), vec![3; 10]);
    }

    #[test]
    fn test_aa_byte() {
        // start(0) + 0 merges, then alternating, last 1 merges with stop.
        assert_eq!(encode(0xAA, 1), vec![2, 1, 1, 1, 1, 1, 1, 2]);
    }

    #[test]
    fn test_hold_count_matches_level_boundaries() {
        for byte in 0..=255u8 {
            let levels = frame_levels(byte);
            let boundaries = levels.windows(2).filter(|w| w[0] != w[1]).count();
            assert_eq!(encode(byte, 1).len(), boundaries + 1, "byte {byte:#04x}");
        }
    }

    #[test]
    fn test_appends_to_existing_sequence() {
        let t = BitTime::new(2).unwrap();
        let mut delays = vec![99];
        encode_byte(0x00, t, &mut delays);
        assert_eq!(delays, vec![99, 18, 2]);
    }

    #[test]
    fn test_bit_time_range() {
        assert!(BitTime::new(0).is_err());
        assert!(BitTime::new(BitTime::MAX).is_ok());
        assert!(BitTime::new(BitTime::MAX + 1).is_err());
    }

    #[test]
    fn test_bit_time_from_baud() {
        let t = BitTime::from_baud(600, Duration::from_micros(1)).unwrap();
        assert_eq!(t.ticks(), 1667);

        let t = BitTime::from_baud(19_200, Duration::from_micros(1)).unwrap();
        assert_eq!(t.ticks(), 52);

        assert!(BitTime::from_baud(0, Duration::from_micros(1)).is_err());
        assert!(BitTime::from_baud(600, Duration::ZERO).is_err());
        // 1 baud in microsecond ticks needs a million ticks per bit.
        assert!(BitTime::from_baud(1, Duration::from_micros(1)).is_err());
    }

    #[test]
    fn test_bit_time_from_config() {
        let mut config = PlayerConfig::default();
        assert_eq!(BitTime::from_config(&config).unwrap().ticks(), 1667);

        config.bit_time = Some(42);
        assert_eq!(BitTime::from_config(&config).unwrap().ticks(), 42);
    }

    #[test]
    fn test_signal_level_flip() {
        assert_eq!(SignalLevel::Space.flip(), SignalLevel::Mark);
        assert_eq!(SignalLevel::Mark.flip(), SignalLevel::Space);
        assert_eq!(SignalLevel::default(), SignalLevel::Space);
    }
}

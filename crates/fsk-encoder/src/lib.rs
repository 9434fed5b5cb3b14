//! FSK bit-stream encoding.
//!
//! Converts serial bytes into the run-length encoded hold durations an FSK
//! sink needs to reproduce an asynchronous serial frame:
//!
//! - **Frames** ([`frame`]): [`BitTime`], [`SignalLevel`] and the per-byte encoder
//! - **Blocks** ([`block`]): [`DelaySequence`] and the buffer encoder
//!
//! # Example
//!
//! ```
//! use fsk_encoder::{encode_block, BitTime};
//!
//! let bit_time = BitTime::new(100).unwrap();
//! let delays = encode_block(&[0x00, 0xFF], bit_time).unwrap();
//!
//! // 0x00: start bit merges with eight zero data bits, stop bit alone.
//! // 0xFF: start bit alone, data bits merge with the stop bit.
//! assert_eq!(delays.as_slice(), &[900, 100, 100, 900]);
//! assert_eq!(delays.total_ticks(), 2 * 10 * 100);
//! ```

pub mod block;
pub mod frame;

// Re-export main types for convenience
pub use block::{encode_block, DelaySequence};
pub use frame::{encode_byte, BitTime, SignalLevel, FRAME_BITS};

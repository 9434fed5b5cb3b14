//! Level sink that only logs.
//!
//! Driving real hardware is left to the embedding application; this sink
//! lets the player exercise the full timing path without one.

use fsk_common::error::FskResult;
use fsk_encoder::SignalLevel;
use fsk_runtime::LevelSink;
use tracing::trace;

/// Logs each level change at trace level and counts them.
#[derive(Debug, Default)]
pub struct TracingSink {
    changes: usize,
    level: Option<SignalLevel>,
}

impl TracingSink {
    /// Create a sink with no level set yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set_level` calls received.
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Most recent level.
    pub fn level(&self) -> Option<SignalLevel> {
        self.level
    }
}

impl LevelSink for TracingSink {
    fn set_level(&mut self, level: SignalLevel) -> FskResult<()> {
        self.changes += 1;
        self.level = Some(level);
        trace!(%level, change = self.changes, "Line level");
        Ok(())
    }
}

#![doc = "Real-time FSK playback runtime."]

pub mod playback;
pub mod realtime;
pub mod wait;

pub use playback::*;
pub use realtime::*;
pub use wait::*;

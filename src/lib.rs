//! REELPLAY - timeline playback and asynchronous decode engine
//!
//! Re-exports all modules for use by binary targets.

// Core engine (promises, readers, pool, player)
pub mod core;

pub mod cli;
pub mod config;
pub mod decode;
pub mod entities;
pub mod error;
pub mod time;

// Re-export commonly used types
pub use config::EngineConfig;
pub use core::player::{Player, PlayerStats};
pub use core::promise::Ticket;
pub use decode::{DecoderBackend, DecoderRegistry};
pub use entities::{AudioFrame, Frame, FrameLayer, Timeline};
pub use error::{EngineError, EngineResult};
pub use time::{RationalTime, TimeRange};

//! Core engine modules - promises, readers, reader pool, player
//!
//! These modules form the decode/playback engine, independent of any UI.

pub mod player;
pub mod promise;
pub mod reader;
pub mod reader_pool;

// Re-exports for convenience
pub use player::{Player, PlayerStats};
pub use promise::{Promise, Ticket, Timeout};
pub use reader::{Reader, ReaderState};
pub use reader_pool::{canonical_path, ReaderPool};

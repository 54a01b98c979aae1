//! Entities module - composition graph and decoded frame types
//!
//! Pure data: nothing here spawns threads or talks to a decoder.
//! - `timeline`: tracks, clips, gaps, transitions and per-time resolution
//! - `transition`: blend kinds and dissolve factor math
//! - `frame`: decoded images/samples and the composited `Frame` handed to renderers

pub mod frame;
pub mod timeline;
pub mod transition;

pub use frame::{AudioFrame, AudioLayer, AudioUnit, Frame, FrameLayer, Image, PixelBuffer, PixelFormat, VideoFrame};
pub use timeline::{Blend, Clip, Coverage, Gap, Item, MediaReference, Timeline, TimelineLayout, Track, TrackKind, TrackLayout};
pub use transition::{Transition, TransitionKind};

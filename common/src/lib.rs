//! Common utilities for frame-clocked simulations
//!
//! This crate provides the per-object event bus and the frame scheduler
//! shared by every simulation in the workspace.

pub mod animation;
pub mod events;

pub use animation::*;
pub use events::*;

/// Timing constants shared by simulations
pub mod constants {
    /// Nominal frame duration in seconds
    pub const FRAME_DT: f64 = 1.0 / 60.0;
}

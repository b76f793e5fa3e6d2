//! Stern-Gerlach Experiment Simulation
//!
//! Particles travel through a graph of attachable apparatus. Analyzers
//! measure spin with the `cos²(Δθ/2)` law and collapse it, entangled pairs
//! stay anti-correlated, and a per-frame stepper advances every particle by
//! an arbitrary distance without skipping a single boundary event:
//!
//! - **Layout**: box-model attachment graph with a lazy position solver
//! - **Particles**: atoms and current loops with spin, entanglement and
//!   hidden-variable instruction tables
//! - **Apparatus**: source, analyzers, Stern-Gerlach magnet, gates, eraser,
//!   detector and the Ignore sink
//! - **Experiment**: run lifecycle, trigger points and the sub-stepping loop

pub mod apparatus;
pub mod config;
pub mod error;
pub mod events;
pub mod experiment;
pub mod graph;
pub mod layout;
pub mod measurement;
pub mod particle;
pub mod presets;
pub mod screen;

pub use apparatus::{Apparatus, ApparatusKind, SourceKind};
pub use config::ExperimentConfig;
pub use error::{Result, TopologyError};
pub use experiment::{Experiment, ExperimentControl};
pub use graph::{ApparatusGraph, NodeId};
pub use measurement::Outcome;
pub use particle::{Particle, ParticleId, ParticleKind, ParticleOutcome};

/// Scaled geometry and simulation defaults
pub mod constants {
    /// Probabilities are rounded to a multiple of 1 / this before sampling
    pub const PROBABILITY_RESOLUTION: f64 = 1e6;

    pub const SOURCE_LENGTH: f64 = 1.0;
    pub const ANALYZER_LENGTH: f64 = 2.0;
    pub const ANALYZER_PADDING: f64 = 0.1;
    pub const STERN_GERLACH_LENGTH: f64 = 3.0;
    pub const GATE_LENGTH: f64 = 1.5;
    pub const ERASER_LENGTH: f64 = 1.5;
    pub const DETECTOR_LENGTH: f64 = 0.8;
    pub const IGNORE_LENGTH: f64 = 0.5;
    pub const IGNORE_SPACING: f64 = 1.0;
    pub const DEFAULT_MARGIN: f64 = 0.5;

    /// Transverse offset of the top/bottom ports
    pub const OUTPUT_OFFSET: f64 = 0.4;

    pub const DEFAULT_SPEED: f64 = 4.0;
    pub const SHRINK_DISTANCE: f64 = 0.3;
    pub const MAX_TRAVEL_DISTANCE: f64 = 500.0;
    pub const SPIN_HISTORY_DEPTH: usize = 8;
    pub const GLOW_DECAY: f64 = 2.0;

    pub const SCREEN_DOT_RADIUS: f64 = 0.02;
    pub const SCREEN_DOT_ALPHA: f64 = 0.6;
    pub const SCREEN_SPREAD: f64 = 0.05;
    /// Normalized distance of the split beams from the screen centre
    pub const SCREEN_SPLIT: f64 = 0.5;
}

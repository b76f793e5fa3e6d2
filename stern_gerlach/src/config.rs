//! Experiment configuration

use crate::constants::*;

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    /// Travel distance per second of simulated time
    pub speed: f64,
    /// Distance over which a particle fades in or out at a body boundary
    pub shrink_distance: f64,
    /// Particles past this distance are force-terminated
    pub max_distance: f64,
    /// Depth of the spin undo stack used for erasure
    pub spin_history: usize,
    /// Glow fade per second
    pub glow_decay: f64,
    /// Auto-attached Ignore sinks end particles without a visible marker
    pub silent_ignore: bool,
    /// Fixed RNG seed; entropy when `None`
    pub seed: Option<u64>,
}

impl ExperimentConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            speed: DEFAULT_SPEED,
            shrink_distance: SHRINK_DISTANCE,
            max_distance: MAX_TRAVEL_DISTANCE,
            spin_history: SPIN_HISTORY_DEPTH,
            glow_decay: GLOW_DECAY,
            silent_ignore: false,
            seed: None,
        }
    }
}

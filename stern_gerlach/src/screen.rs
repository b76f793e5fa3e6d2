//! Detector screen behind a Stern-Gerlach magnet
//!
//! The simulation only decides where a particle lands; painting is left to
//! whatever implements `Screen`.

use rand::Rng;
use std::f64::consts::TAU;

pub trait Screen {
    /// Paint one impact at normalized coordinates in roughly [-1, 1]
    fn draw_dot(&mut self, x: f64, y: f64, radius: f64, alpha: f64);

    fn clear_screen(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dot {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub alpha: f64,
}

/// In-memory screen that keeps the most recent dots
#[derive(Debug, Clone, Default)]
pub struct DotBuffer {
    pub dots: Vec<Dot>,
    /// Oldest dots are dropped past this count; 0 keeps everything
    pub capacity: usize,
}

impl DotBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            dots: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

impl Screen for DotBuffer {
    fn draw_dot(&mut self, x: f64, y: f64, radius: f64, alpha: f64) {
        if self.capacity > 0 && self.dots.len() == self.capacity {
            self.dots.remove(0);
        }
        self.dots.push(Dot { x, y, radius, alpha });
    }

    fn clear_screen(&mut self) {
        self.dots.clear();
    }
}

/// Two independent standard normal samples (Box–Muller transform)
pub fn gaussian_pair<R: Rng + ?Sized>(rng: &mut R) -> (f64, f64) {
    // u1 in (0, 1] keeps the logarithm finite
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    let r = (-2.0 * u1.ln()).sqrt();
    (r * (TAU * u2).cos(), r * (TAU * u2).sin())
}

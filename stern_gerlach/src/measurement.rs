//! Spin measurement and collapse
//!
//! Shared by every analyzer-like apparatus. The visibility law is the closed
//! form `P(plus) = cos²(Δθ/2)` where `Δθ` is the spin angle relative to the
//! analyzer orientation. An undefined spin is treated as perpendicular to the
//! analyzer, giving an even split.

use crate::constants::PROBABILITY_RESOLUTION;
use crate::layout::{PortName, BOTTOM_PORT, TOP_PORT};
use crate::particle::{normalize_angle, ParticleId, ParticleKind, ParticlePool};
use rand::Rng;
use std::f64::consts::{FRAC_PI_2, PI, TAU};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Plus,
    Minus,
}

impl Outcome {
    pub fn from_plus(plus: bool) -> Self {
        if plus {
            Outcome::Plus
        } else {
            Outcome::Minus
        }
    }

    pub fn is_plus(self) -> bool {
        self == Outcome::Plus
    }

    /// Output a measured particle is routed through
    pub fn port(self) -> PortName {
        match self {
            Outcome::Plus => TOP_PORT,
            Outcome::Minus => BOTTOM_PORT,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Outcome::Plus => 1.0,
            Outcome::Minus => -1.0,
        }
    }

    /// Spin angle the particle is left in after this outcome
    pub fn eigen_angle(self, analyzer_angle: f64) -> f64 {
        match self {
            Outcome::Plus => analyzer_angle,
            Outcome::Minus => analyzer_angle + PI,
        }
    }
}

/// Snap a probability to the rounding grid and clamp it into [0, 1]
pub fn round_probability(p: f64) -> f64 {
    ((p * PROBABILITY_RESOLUTION).round() / PROBABILITY_RESOLUTION).clamp(0.0, 1.0)
}

/// Probability that a particle with `spin` is measured "plus"
pub fn probability_plus(spin: Option<f64>, analyzer_angle: f64) -> f64 {
    let spin = spin.unwrap_or(analyzer_angle + FRAC_PI_2);
    let relative = spin - analyzer_angle;
    round_probability((relative / 2.0).cos().powi(2))
}

/// Index of the 0°/120°/240° orientation closest to `angle`
pub fn orientation_bucket(angle: f64) -> usize {
    let third = TAU / 3.0;
    (normalize_angle(angle) / third).round() as usize % 3
}

/// Measure a particle against an analyzer orientation, collapsing its spin.
///
/// Hidden-variable particles read their outcome from their instruction table
/// without consulting the RNG. Current loops are classical: the analyzer only
/// sets the ambient field direction and the outcome follows the sign of the
/// moment's projection.
pub fn measure<R: Rng + ?Sized>(
    particles: &mut ParticlePool,
    id: ParticleId,
    analyzer_angle: f64,
    rng: &mut R,
) -> Outcome {
    let particle = particles.get_mut(id);

    if particle.kind == ParticleKind::CurrentLoop {
        particle.field_angle = Some(analyzer_angle);
        let moment = particle.spin().unwrap_or(analyzer_angle + FRAC_PI_2);
        return Outcome::from_plus((moment - analyzer_angle).cos() >= 0.0);
    }

    let outcome = match particle.instructions {
        Some(instructions) => Outcome::from_plus(instructions[orientation_bucket(analyzer_angle)]),
        None => {
            let p = probability_plus(particle.spin(), analyzer_angle);
            Outcome::from_plus(rng.gen::<f64>() < p)
        }
    };

    log::debug!(
        "Measured {:?} at {:.3} rad: {:?}",
        id,
        analyzer_angle,
        outcome
    );
    particles.set_spin(id, Some(outcome.eigen_angle(analyzer_angle)));
    outcome
}

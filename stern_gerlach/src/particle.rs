//! Particles travelling through the apparatus graph
//!
//! The experiment owns a fixed pool: the right-going atom, the left-going
//! atom (only used by entangled sources) and the current loop. Entanglement
//! links are stored as pool handles.

use crate::graph::NodeId;
use crate::layout::{Direction, PortName};
use glam::DVec3;
use std::f64::consts::{PI, TAU};

/// Handle into the particle pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleId(pub(crate) usize);

impl ParticleId {
    pub const RIGHT_ATOM: ParticleId = ParticleId(0);
    pub const LEFT_ATOM: ParticleId = ParticleId(1);
    pub const LOOP: ParticleId = ParticleId(2);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleKind {
    /// Spin-1/2 silver atom
    Atom,
    /// Classical magnetic moment
    CurrentLoop,
}

/// How a particle left the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleOutcome {
    Detected(NodeId),
    Blocked(NodeId),
    Ignored(NodeId),
    /// Force-terminated past the safety distance
    Lost,
}

/// Map any angle into [0, 2π)
pub fn normalize_angle(angle: f64) -> f64 {
    let a = angle.rem_euclid(TAU);
    if a >= TAU {
        0.0
    } else {
        a
    }
}

#[derive(Debug, Clone)]
pub struct Particle {
    pub kind: ParticleKind,
    /// Emitted in the current run
    pub active: bool,
    /// Render position, written after every frame
    pub position: DVec3,
    pub visible: bool,
    /// Cone-shrink factor in [0, 1]
    pub visibility: f64,
    pub direction: Direction,
    /// x coordinate the particle was emitted from
    pub origin: f64,
    /// Travelled distance along `direction`
    pub distance: f64,
    spin: Option<f64>,
    spin_history: Vec<Option<f64>>,
    pub entangled_with: Option<ParticleId>,
    /// Predetermined outcomes for the 0°, 120° and 240° orientations
    pub instructions: Option<[bool; 3]>,
    pub coming_from: Option<NodeId>,
    pub going_to: Option<NodeId>,
    /// Path label between `coming_from` and `going_to`; `None` while the
    /// particle travels both paths of a split apparatus at once
    pub path: Option<PortName>,
    pub detected: bool,
    pub outcome: Option<ParticleOutcome>,
    pub field_angle: Option<f64>,
    pub field_intensity: f64,
}

impl Particle {
    pub fn new(kind: ParticleKind) -> Self {
        Self {
            kind,
            active: false,
            position: DVec3::ZERO,
            visible: false,
            visibility: 1.0,
            direction: Direction::None,
            origin: 0.0,
            distance: 0.0,
            spin: None,
            spin_history: Vec::new(),
            entangled_with: None,
            instructions: None,
            coming_from: None,
            going_to: None,
            path: None,
            detected: false,
            outcome: None,
            field_angle: None,
            field_intensity: 0.0,
        }
    }

    /// Spin angle, `None` while undefined
    pub fn spin(&self) -> Option<f64> {
        self.spin
    }

    pub fn spin_history(&self) -> &[Option<f64>] {
        &self.spin_history
    }

    /// Still travelling in this run
    pub fn is_live(&self) -> bool {
        self.active && !self.detected
    }

    /// Put the particle back to its pre-run state
    pub fn reset(&mut self) {
        let kind = self.kind;
        *self = Particle::new(kind);
    }

    fn record_spin(&mut self, spin: Option<f64>, history_depth: usize) {
        if history_depth > 0 {
            if self.spin_history.len() == history_depth {
                self.spin_history.remove(0);
            }
            self.spin_history.push(self.spin);
        }
        self.spin = spin.map(normalize_angle);
    }
}

/// Fixed particle pool owned by an experiment
#[derive(Debug, Clone)]
pub struct ParticlePool {
    particles: Vec<Particle>,
    history_depth: usize,
}

impl ParticlePool {
    pub fn new(history_depth: usize) -> Self {
        Self {
            particles: vec![
                Particle::new(ParticleKind::Atom),
                Particle::new(ParticleKind::Atom),
                Particle::new(ParticleKind::CurrentLoop),
            ],
            history_depth,
        }
    }

    pub fn get(&self, id: ParticleId) -> &Particle {
        &self.particles[id.0]
    }

    pub fn get_mut(&mut self, id: ParticleId) -> &mut Particle {
        &mut self.particles[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = ParticleId> {
        (0..self.particles.len()).map(ParticleId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParticleId, &Particle)> {
        self.particles
            .iter()
            .enumerate()
            .map(|(i, p)| (ParticleId(i), p))
    }

    pub fn any_live(&self) -> bool {
        self.particles.iter().any(Particle::is_live)
    }

    /// Set the spin; an entangled partner is set to `spin + π` (or made
    /// undefined) in the same call, so both undo histories stay in step
    pub fn set_spin(&mut self, id: ParticleId, spin: Option<f64>) {
        let depth = self.history_depth;
        self.particles[id.0].record_spin(spin, depth);

        if let Some(partner) = self.particles[id.0].entangled_with {
            self.particles[partner.0].record_spin(spin.map(|angle| angle + PI), depth);
        }
    }

    /// Restore the spin the particle had before its most recent change.
    /// Returns the restored value, or `None` if there was nothing to undo.
    /// An entangled partner is rolled back with it.
    pub fn erase_spin(&mut self, id: ParticleId) -> Option<Option<f64>> {
        let particle = &mut self.particles[id.0];
        let previous = particle.spin_history.pop()?;
        particle.spin = previous;

        if let Some(partner) = particle.entangled_with {
            let partner = &mut self.particles[partner.0];
            partner.spin_history.pop();
            partner.spin = previous.map(|angle| normalize_angle(angle + PI));
        }
        Some(previous)
    }

    pub fn entangle(&mut self, a: ParticleId, b: ParticleId) {
        self.particles[a.0].entangled_with = Some(b);
        self.particles[b.0].entangled_with = Some(a);
    }

    pub fn reset_all(&mut self) {
        for particle in &mut self.particles {
            particle.reset();
        }
    }
}

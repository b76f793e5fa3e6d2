//! Event payloads published by apparatus and experiments

use crate::graph::NodeId;
use crate::measurement::Outcome;
use crate::particle::{ParticleId, ParticleOutcome};
use common::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApparatusEventKind {
    Enter,
    Leave,
    Interact,
    MoveInside,
    Measured,
    DetectParticle,
    Blocked,
    Ignored,
}

/// Published on the apparatus' own dispatcher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApparatusEvent {
    pub kind: ApparatusEventKind,
    pub node: NodeId,
    pub particle: ParticleId,
    /// Travelled distance of the particle when the event fired
    pub distance: f64,
    pub outcome: Option<Outcome>,
}

impl Event for ApparatusEvent {
    type Kind = ApparatusEventKind;

    fn kind(&self) -> ApparatusEventKind {
        self.kind
    }
}

/// Identifies a registered trigger point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentEventKind {
    Run,
    Trigger,
    Blocked,
    Ignored,
    Pause,
    Resume,
    End,
}

/// Published on the experiment's dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentEvent {
    Run {
        run: u64,
    },
    Trigger {
        trigger: TriggerId,
        particle: ParticleId,
        distance: f64,
    },
    Blocked {
        node: NodeId,
        particle: ParticleId,
    },
    Ignored {
        node: NodeId,
        particle: ParticleId,
        silent: bool,
    },
    Pause,
    Resume,
    End {
        run: u64,
        outcomes: Vec<(ParticleId, ParticleOutcome)>,
    },
}

impl Event for ExperimentEvent {
    type Kind = ExperimentEventKind;

    fn kind(&self) -> ExperimentEventKind {
        match self {
            ExperimentEvent::Run { .. } => ExperimentEventKind::Run,
            ExperimentEvent::Trigger { .. } => ExperimentEventKind::Trigger,
            ExperimentEvent::Blocked { .. } => ExperimentEventKind::Blocked,
            ExperimentEvent::Ignored { .. } => ExperimentEventKind::Ignored,
            ExperimentEvent::Pause => ExperimentEventKind::Pause,
            ExperimentEvent::Resume => ExperimentEventKind::Resume,
            ExperimentEvent::End { .. } => ExperimentEventKind::End,
        }
    }
}

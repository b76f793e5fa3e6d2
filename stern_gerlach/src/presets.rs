//! Ready-made experiments
//!
//! Each preset builds a complete apparatus chain behind a source and names
//! its detectors so hosts can print tallies. Presets are numbered 1 to 6 for
//! the demo binary.

use crate::apparatus::{Apparatus, ApparatusKind, SourceKind};
use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::experiment::Experiment;
use crate::graph::NodeId;
use crate::layout::{BOTTOM_PORT, DEFAULT_PORT, LEFT_PORT, RIGHT_PORT, TOP_PORT};
use crate::screen::{DotBuffer, Screen};
use common::Animate;
use std::cell::RefCell;
use std::f64::consts::FRAC_PI_2;
use std::rc::Rc;

/// Dots kept on a preset's screen
const SCREEN_CAPACITY: usize = 4096;

pub struct Preset {
    pub name: &'static str,
    pub experiment: Experiment,
    pub detectors: Vec<(&'static str, NodeId)>,
    /// Screen behind the Stern-Gerlach magnet, when the preset has one
    pub screen: Option<Rc<RefCell<DotBuffer>>>,
}

impl Preset {
    fn new(name: &'static str, experiment: Experiment) -> Self {
        Self {
            name,
            experiment,
            detectors: Vec::new(),
            screen: None,
        }
    }

    pub fn detector(&self, name: &str) -> Option<NodeId> {
        self.detectors
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    /// Detection count per named detector
    pub fn tallies(&self) -> Vec<(&'static str, u64)> {
        self.detectors
            .iter()
            .map(|(name, id)| (*name, self.experiment.detector_count(*id).unwrap_or(0)))
            .collect()
    }

    /// Name of the detector that absorbed `node`'s particle, if it is one of ours
    pub fn detector_name(&self, node: NodeId) -> Option<&'static str> {
        self.detectors
            .iter()
            .find(|(_, id)| *id == node)
            .map(|(name, _)| *name)
    }

    /// Attach a detector to each output of an analyzer
    fn add_detector_pair(
        &mut self,
        analyzer: NodeId,
        names: (&'static str, &'static str),
    ) -> Result<()> {
        for (port, name) in [(TOP_PORT, names.0), (BOTTOM_PORT, names.1)] {
            let id = self
                .experiment
                .attach_new(analyzer, port, Apparatus::detector())?;
            self.detectors.push((name, id));
        }
        Ok(())
    }
}

fn analyzer_with_detectors(
    name: &'static str,
    source: SourceKind,
    analyzer: Apparatus,
    config: ExperimentConfig,
) -> Result<Preset> {
    let mut preset = Preset::new(name, Experiment::new(source, config));
    let source = preset.experiment.source();
    let analyzer = preset.experiment.attach_new(source, RIGHT_PORT, analyzer)?;
    preset.add_detector_pair(analyzer, ("top", "bottom"))?;
    preset.experiment.update_layout();
    Ok(preset)
}

/// Spin-up atoms into an analyzer at the same angle
pub fn aligned(config: ExperimentConfig) -> Result<Preset> {
    analyzer_with_detectors(
        "aligned analyzer",
        SourceKind::Polarized(0.0),
        Apparatus::analyzer(0.0),
        config,
    )
}

/// Spin-up atoms into an analyzer turned by 90°
pub fn perpendicular(config: ExperimentConfig) -> Result<Preset> {
    analyzer_with_detectors(
        "perpendicular analyzer",
        SourceKind::Polarized(0.0),
        Apparatus::analyzer(FRAC_PI_2),
        config,
    )
}

fn pair(
    name: &'static str,
    source: SourceKind,
    right_angle: f64,
    left_angle: f64,
    config: ExperimentConfig,
) -> Result<Preset> {
    let mut preset = Preset::new(name, Experiment::new(source, config));
    let source = preset.experiment.source();

    let right = preset
        .experiment
        .attach_new(source, RIGHT_PORT, Apparatus::analyzer(right_angle))?;
    preset.add_detector_pair(right, ("right top", "right bottom"))?;

    let left = preset
        .experiment
        .attach_new(source, LEFT_PORT, Apparatus::analyzer(left_angle))?;
    preset.add_detector_pair(left, ("left top", "left bottom"))?;

    preset.experiment.update_layout();
    Ok(preset)
}

/// Entangled pair measured by two analyzers on either side of the source
pub fn entangled(right_angle: f64, left_angle: f64, config: ExperimentConfig) -> Result<Preset> {
    pair(
        "entangled pair",
        SourceKind::Entangled,
        right_angle,
        left_angle,
        config,
    )
}

/// Local hidden-variable pair with the same two-analyzer layout
pub fn hidden_variables(
    right_angle: f64,
    left_angle: f64,
    config: ExperimentConfig,
) -> Result<Preset> {
    pair(
        "hidden variables",
        SourceKind::HiddenVariables,
        right_angle,
        left_angle,
        config,
    )
}

/// Analyzer split by a gate and recombined by an eraser, then analyzed again
/// along the original spin direction
pub fn interference(
    top_open: bool,
    bottom_open: bool,
    quantum_eraser: bool,
    config: ExperimentConfig,
) -> Result<Preset> {
    let mut preset = Preset::new(
        "interference",
        Experiment::new(SourceKind::Polarized(0.0), config),
    );
    let experiment = &mut preset.experiment;
    let source = experiment.source();

    let splitter = experiment.attach_new(source, RIGHT_PORT, Apparatus::analyzer(FRAC_PI_2))?;
    let gate = experiment.attach_new(splitter, TOP_PORT, Apparatus::gate(top_open, bottom_open))?;
    let eraser = experiment.attach_new(gate, TOP_PORT, Apparatus::eraser(quantum_eraser))?;
    let analyzer = experiment.attach_new(eraser, DEFAULT_PORT, Apparatus::analyzer(0.0))?;

    preset.add_detector_pair(analyzer, ("top", "bottom"))?;
    preset.experiment.update_layout();
    Ok(preset)
}

/// Classical current loop through a Stern-Gerlach magnet with a screen
pub fn current_loop(moment: f64, config: ExperimentConfig) -> Result<Preset> {
    let mut preset = Preset::new(
        "current loop",
        Experiment::new(SourceKind::CurrentLoop(moment), config),
    );
    let source = preset.experiment.source();
    let magnet = preset
        .experiment
        .attach_new(source, RIGHT_PORT, Apparatus::stern_gerlach(0.0))?;
    preset.add_detector_pair(magnet, ("top", "bottom"))?;

    let screen = Rc::new(RefCell::new(DotBuffer::with_capacity(SCREEN_CAPACITY)));
    if let Some(ApparatusKind::SternGerlach(sg)) =
        preset.experiment.apparatus_mut(magnet).map(|a| &mut a.kind)
    {
        sg.screen = Some(screen.clone() as Rc<RefCell<dyn Screen>>);
    }
    preset.screen = Some(screen);

    preset.experiment.update_layout();
    Ok(preset)
}

/// Preset by its number in the demo menu
pub fn by_number(number: u32, config: ExperimentConfig) -> Option<Result<Preset>> {
    let preset = match number {
        1 => aligned(config),
        2 => perpendicular(config),
        3 => entangled(0.0, 0.0, config),
        4 => interference(true, true, false, config),
        5 => hidden_variables(0.0, 2.0 * std::f64::consts::FRAC_PI_3, config),
        6 => current_loop(FRAC_PI_2 / 2.0, config),
        _ => return None,
    };
    Some(preset)
}

/// Start a run and drive it frame by frame until it has ended. Returns false
/// if it was still going after `max_frames`.
pub fn run_to_completion(experiment: &mut Experiment, dt: f64, max_frames: usize) -> bool {
    experiment.run();
    let mut t = experiment.time();
    for _ in 0..max_frames {
        if !experiment.is_running() && !experiment.has_pending_run() {
            return true;
        }
        t += dt;
        experiment.animate(t, dt);
    }
    !experiment.is_running() && !experiment.has_pending_run()
}

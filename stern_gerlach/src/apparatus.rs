//! Apparatus variants
//!
//! Each apparatus is a node of the attachment graph. The variant decides what
//! happens when a particle reaches the centre of its body; the shared fields
//! carry layout, render state and the per-object event bus.

use crate::constants::*;
use crate::events::ApparatusEvent;
use crate::graph::NodeId;
use crate::layout::{
    BoxModel, Direction, InputSpec, OutputSpec, Port, PortName, BOTTOM_PORT, DEFAULT_PORT,
    LEFT_PORT, RIGHT_PORT, TOP_PORT,
};
use crate::screen::Screen;
use common::EventDispatcher;
use glam::DVec3;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Initial particle state emitted by a source
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceKind {
    /// Single atom with a definite spin angle
    Polarized(f64),
    /// Single atom with undefined spin
    Unpolarized,
    /// Pair of atoms with undefined, opposite spins
    Entangled,
    /// Entangled pair carrying complementary instruction tables
    HiddenVariables,
    /// Classical current loop with a magnetic moment angle
    CurrentLoop(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gate {
    pub top_open: bool,
    pub bottom_open: bool,
    /// Always measure, even with both paths open
    pub classical: bool,
}

impl Gate {
    pub fn is_open(&self, port: PortName) -> bool {
        match port {
            TOP_PORT => self.top_open,
            BOTTOM_PORT => self.bottom_open,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorGate {
    /// Detector spheres on the top and bottom paths
    pub detectors_visible: [bool; 2],
    /// Bypass pipes on the top and bottom paths
    pub bypass_visible: [bool; 2],
}

impl DetectorGate {
    /// A collapse is forced unless nothing that could measure is present
    pub fn forces_collapse(&self) -> bool {
        let detectors_hidden = !self.detectors_visible[0] && !self.detectors_visible[1];
        let bypass_shown = self.bypass_visible[0] && self.bypass_visible[1];
        !(detectors_hidden && bypass_shown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eraser {
    /// Erase which-path information on the way through
    pub quantum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Detector {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Ignore {
    pub silent: bool,
}

pub struct SternGerlach {
    pub screen: Option<Rc<RefCell<dyn Screen>>>,
    pub dots: u64,
    pub dot_radius: f64,
    pub dot_alpha: f64,
    /// Standard deviation of the impact jitter, in normalized screen units
    pub spread: f64,
}

impl SternGerlach {
    pub fn new() -> Self {
        Self {
            screen: None,
            dots: 0,
            dot_radius: SCREEN_DOT_RADIUS,
            dot_alpha: SCREEN_DOT_ALPHA,
            spread: SCREEN_SPREAD,
        }
    }

    pub fn clear_screen(&mut self) {
        self.dots = 0;
        if let Some(screen) = &self.screen {
            screen.borrow_mut().clear_screen();
        }
    }
}

impl Default for SternGerlach {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SternGerlach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SternGerlach")
            .field("screen", &self.screen.is_some())
            .field("dots", &self.dots)
            .field("dot_radius", &self.dot_radius)
            .field("dot_alpha", &self.dot_alpha)
            .field("spread", &self.spread)
            .finish()
    }
}

#[derive(Debug)]
pub enum ApparatusKind {
    Source(SourceKind),
    Analyzer,
    ExplodedAnalyzer,
    SternGerlach(SternGerlach),
    Gate(Gate),
    DetectorGate(DetectorGate),
    Eraser(Eraser),
    Detector(Detector),
    Ignore(Ignore),
}

impl ApparatusKind {
    pub fn label(&self) -> &'static str {
        match self {
            ApparatusKind::Source(_) => "source",
            ApparatusKind::Analyzer => "analyzer",
            ApparatusKind::ExplodedAnalyzer => "exploded analyzer",
            ApparatusKind::SternGerlach(_) => "stern-gerlach",
            ApparatusKind::Gate(_) => "gate",
            ApparatusKind::DetectorGate(_) => "detector gate",
            ApparatusKind::Eraser(_) => "eraser",
            ApparatusKind::Detector(_) => "detector",
            ApparatusKind::Ignore(_) => "ignore",
        }
    }

    pub fn is_attachable(&self) -> bool {
        !matches!(self, ApparatusKind::Source(_))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, ApparatusKind::Ignore(_))
    }

    /// Interaction happens on entering the body instead of at its centre
    pub fn interacts_on_enter(&self) -> bool {
        matches!(self, ApparatusKind::ExplodedAnalyzer)
    }

    /// Particles stay fully visible inside
    pub fn suppresses_shrink(&self) -> bool {
        matches!(self, ApparatusKind::SternGerlach(_))
    }
}

pub struct Apparatus {
    pub kind: ApparatusKind,
    pub layout: BoxModel,
    pub direction: Direction,
    angle: f64,
    pub position: DVec3,
    pub visible: bool,
    pub glow: f64,
    inputs: Vec<(PortName, InputSpec)>,
    outputs: Vec<(PortName, OutputSpec)>,
    pub(crate) attachments: Vec<(Port, NodeId)>,
    pub(crate) attached_to: Option<NodeId>,
    pub(crate) measure_count: u64,
    pub events: EventDispatcher<ApparatusEvent>,
}

impl Apparatus {
    pub fn new(kind: ApparatusKind, layout: BoxModel) -> Self {
        Self {
            kind,
            layout,
            direction: Direction::None,
            angle: 0.0,
            position: DVec3::ZERO,
            visible: true,
            glow: 0.0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attachments: Vec::new(),
            attached_to: None,
            measure_count: 0,
            events: EventDispatcher::new(),
        }
    }

    pub fn source(kind: SourceKind) -> Self {
        Self::new(
            ApparatusKind::Source(kind),
            BoxModel::new(SOURCE_LENGTH).with_margin(0.0, DEFAULT_MARGIN),
        )
        .with_output(RIGHT_PORT, Some(Direction::Right), 0.0)
        .with_output(LEFT_PORT, Some(Direction::Left), 0.0)
    }

    pub fn analyzer(angle: f64) -> Self {
        Self::new(ApparatusKind::Analyzer, analyzer_box())
            .with_angle(angle)
            .with_input(DEFAULT_PORT, 0.0)
            .with_output(TOP_PORT, None, OUTPUT_OFFSET)
            .with_output(BOTTOM_PORT, None, -OUTPUT_OFFSET)
    }

    pub fn exploded_analyzer(angle: f64) -> Self {
        Self::new(ApparatusKind::ExplodedAnalyzer, analyzer_box())
            .with_angle(angle)
            .with_input(DEFAULT_PORT, 0.0)
            .with_output(TOP_PORT, None, OUTPUT_OFFSET)
            .with_output(BOTTOM_PORT, None, -OUTPUT_OFFSET)
    }

    pub fn stern_gerlach(angle: f64) -> Self {
        Self::new(
            ApparatusKind::SternGerlach(SternGerlach::new()),
            BoxModel::new(STERN_GERLACH_LENGTH).with_margin(DEFAULT_MARGIN, DEFAULT_MARGIN),
        )
        .with_angle(angle)
        .with_input(DEFAULT_PORT, 0.0)
        .with_output(TOP_PORT, None, OUTPUT_OFFSET)
        .with_output(BOTTOM_PORT, None, -OUTPUT_OFFSET)
    }

    pub fn gate(top_open: bool, bottom_open: bool) -> Self {
        Self::new(
            ApparatusKind::Gate(Gate {
                top_open,
                bottom_open,
                classical: false,
            }),
            BoxModel::new(GATE_LENGTH).with_margin(DEFAULT_MARGIN, DEFAULT_MARGIN),
        )
        .with_split_ports()
    }

    pub fn detector_gate(detectors_visible: [bool; 2], bypass_visible: [bool; 2]) -> Self {
        Self::new(
            ApparatusKind::DetectorGate(DetectorGate {
                detectors_visible,
                bypass_visible,
            }),
            BoxModel::new(GATE_LENGTH).with_margin(DEFAULT_MARGIN, DEFAULT_MARGIN),
        )
        .with_split_ports()
    }

    pub fn eraser(quantum: bool) -> Self {
        Self::new(
            ApparatusKind::Eraser(Eraser { quantum }),
            BoxModel::new(ERASER_LENGTH).with_margin(DEFAULT_MARGIN, DEFAULT_MARGIN),
        )
        .with_input(TOP_PORT, OUTPUT_OFFSET)
        .with_input(BOTTOM_PORT, -OUTPUT_OFFSET)
        .with_output(DEFAULT_PORT, None, 0.0)
    }

    pub fn detector() -> Self {
        Self::new(
            ApparatusKind::Detector(Detector::default()),
            BoxModel::new(DETECTOR_LENGTH).with_margin(DEFAULT_MARGIN, 0.0),
        )
        .with_input(DEFAULT_PORT, 0.0)
    }

    pub fn ignore(silent: bool) -> Self {
        let mut ignore = Self::new(
            ApparatusKind::Ignore(Ignore { silent }),
            BoxModel::new(IGNORE_LENGTH).with_spacing(IGNORE_SPACING),
        )
        .with_input(DEFAULT_PORT, 0.0);
        ignore.visible = !silent;
        ignore
    }

    fn with_split_ports(self) -> Self {
        self.with_input(TOP_PORT, OUTPUT_OFFSET)
            .with_input(BOTTOM_PORT, -OUTPUT_OFFSET)
            .with_output(TOP_PORT, None, OUTPUT_OFFSET)
            .with_output(BOTTOM_PORT, None, -OUTPUT_OFFSET)
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = angle;
        self
    }

    pub fn with_input(mut self, name: PortName, offset: f64) -> Self {
        self.add_input(name, InputSpec { offset });
        self
    }

    pub fn with_output(mut self, name: PortName, direction: Option<Direction>, offset: f64) -> Self {
        self.add_output(name, OutputSpec { direction, offset });
        self
    }

    /// Declare or redeclare an input slot
    pub fn add_input(&mut self, name: PortName, spec: InputSpec) {
        match self.inputs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = spec,
            None => self.inputs.push((name, spec)),
        }
    }

    /// Declare or redeclare an output slot
    pub fn add_output(&mut self, name: PortName, spec: OutputSpec) {
        match self.outputs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = spec,
            None => self.outputs.push((name, spec)),
        }
    }

    pub fn inputs(&self) -> &[(PortName, InputSpec)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(PortName, OutputSpec)] {
        &self.outputs
    }

    pub fn output(&self, name: PortName) -> Option<&OutputSpec> {
        self.outputs.iter().find(|(n, _)| *n == name).map(|(_, s)| s)
    }

    pub fn is_multi_input(&self) -> bool {
        self.inputs.len() > 1
    }

    pub fn is_multi_output(&self) -> bool {
        self.outputs.len() > 1
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub(crate) fn set_angle_unchecked(&mut self, angle: f64) {
        self.angle = angle;
    }

    pub fn attached_to(&self) -> Option<NodeId> {
        self.attached_to
    }

    pub fn attachments(&self) -> &[(Port, NodeId)] {
        &self.attachments
    }

    /// Child reached through `port`: a child on that named output, or the
    /// multi-input child spanning every output
    pub fn attachment(&self, port: PortName) -> Option<NodeId> {
        self.attachments
            .iter()
            .find(|(p, _)| *p == Port::Named(port) || *p == Port::All)
            .map(|(_, id)| *id)
    }

    pub fn spanning_child(&self) -> Option<NodeId> {
        self.attachments
            .iter()
            .find(|(p, _)| *p == Port::All)
            .map(|(_, id)| *id)
    }

    pub fn is_output_free(&self, port: PortName) -> bool {
        self.attachment(port).is_none()
    }

    pub fn measure_count(&self) -> u64 {
        self.measure_count
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }
}

impl fmt::Debug for Apparatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Apparatus")
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("angle", &self.angle)
            .field("position", &self.position)
            .field("attachments", &self.attachments)
            .field("attached_to", &self.attached_to)
            .finish()
    }
}

fn analyzer_box() -> BoxModel {
    BoxModel::new(ANALYZER_LENGTH)
        .with_padding(ANALYZER_PADDING, ANALYZER_PADDING)
        .with_margin(DEFAULT_MARGIN, DEFAULT_MARGIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_gate_collapse_rule() {
        let quiet = DetectorGate {
            detectors_visible: [false, false],
            bypass_visible: [true, true],
        };
        assert!(!quiet.forces_collapse());

        let one_detector = DetectorGate {
            detectors_visible: [true, false],
            bypass_visible: [true, true],
        };
        assert!(one_detector.forces_collapse());

        let missing_pipe = DetectorGate {
            detectors_visible: [false, false],
            bypass_visible: [true, false],
        };
        assert!(missing_pipe.forces_collapse());
    }

    #[test]
    fn test_declared_ports() {
        let analyzer = Apparatus::analyzer(0.0);
        assert!(!analyzer.is_multi_input());
        assert!(analyzer.is_multi_output());
        assert!(analyzer.output(TOP_PORT).is_some());
        assert!(analyzer.output(DEFAULT_PORT).is_none());

        let eraser = Apparatus::eraser(true);
        assert!(eraser.is_multi_input());
        assert!(!eraser.is_multi_output());

        assert!(!Apparatus::source(SourceKind::Unpolarized).kind.is_attachable());
        assert!(Apparatus::detector().outputs().is_empty());
    }

    #[test]
    fn test_redeclared_output_replaces_spec() {
        let mut analyzer = Apparatus::analyzer(0.0);
        analyzer.add_output(
            TOP_PORT,
            OutputSpec {
                direction: Some(Direction::Left),
                offset: 2.0,
            },
        );
        assert_eq!(analyzer.outputs().len(), 2);
        assert_eq!(analyzer.output(TOP_PORT).map(|o| o.offset), Some(2.0));
    }
}

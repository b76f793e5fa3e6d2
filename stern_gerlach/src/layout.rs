//! Box-model layout primitives
//!
//! Every apparatus occupies a body of `length` along the travel axis,
//! surrounded by padding (added on both sides of the joint) and margins
//! (collapsed between neighbours, largest wins). `spacing` is extra distance
//! the child asks for in front of itself.

use glam::DVec3;

/// Travel direction along the x axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Left,
    Right,
    #[default]
    None,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Left => -1.0,
            Direction::Right => 1.0,
            Direction::None => 0.0,
        }
    }
}

/// Name of an input or output slot
pub type PortName = &'static str;

pub const DEFAULT_PORT: PortName = "default";
pub const TOP_PORT: PortName = "top";
pub const BOTTOM_PORT: PortName = "bottom";
pub const RIGHT_PORT: PortName = "right";
pub const LEFT_PORT: PortName = "left";

/// Attachment key on a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Named(PortName),
    /// Reserved catch-all used by a multi-input child spanning every output
    All,
}

impl Port {
    pub fn name(&self) -> &'static str {
        match self {
            Port::Named(name) => name,
            Port::All => "*",
        }
    }
}

/// Declared input slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    pub offset: f64,
}

/// Declared output slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSpec {
    /// `None` inherits the owner's direction
    pub direction: Option<Direction>,
    /// Transverse offset from the owner's axis
    pub offset: f64,
}

/// Spacing knobs every apparatus type supplies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxModel {
    pub length: f64,
    pub padding_left: f64,
    pub padding_right: f64,
    pub margin_left: f64,
    pub margin_right: f64,
    pub spacing: f64,
}

impl BoxModel {
    pub fn new(length: f64) -> Self {
        Self {
            length,
            padding_left: 0.0,
            padding_right: 0.0,
            margin_left: 0.0,
            margin_right: 0.0,
            spacing: 0.0,
        }
    }

    pub fn with_padding(mut self, left: f64, right: f64) -> Self {
        self.padding_left = left;
        self.padding_right = right;
        self
    }

    pub fn with_margin(mut self, left: f64, right: f64) -> Self {
        self.margin_left = left;
        self.margin_right = right;
        self
    }

    pub fn with_spacing(mut self, spacing: f64) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn half_length(&self) -> f64 {
        self.length * 0.5
    }

    /// Centre-to-centre distance from `self` (parent) to `child`
    pub fn gap_to(&self, child: &BoxModel) -> f64 {
        self.half_length()
            + child.half_length()
            + self.padding_right
            + child.padding_left
            + self.margin_right.max(child.margin_left)
            + child.spacing
    }
}

/// Transverse displacement of an output offset rotated by `angle` about x
pub fn transverse_offset(offset: f64, angle: f64) -> DVec3 {
    DVec3::new(0.0, offset * angle.cos(), offset * angle.sin())
}

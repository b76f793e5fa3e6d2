//! Attachment graph and position solver
//!
//! Apparatus live in an arena and reference each other by handle. Positions
//! are never authoritative: they are recomputed from every unattached root
//! whenever the topology or an angle changes.

use crate::apparatus::Apparatus;
use crate::error::{Result, TopologyError};
use crate::layout::{transverse_offset, BoxModel, Direction, Port, PortName};
use glam::DVec3;
use slotmap::SlotMap;
use std::ops::{Index, IndexMut};

slotmap::new_key_type! {
    /// Opaque apparatus handle
    pub struct NodeId;
}

#[derive(Debug)]
pub struct ApparatusGraph {
    nodes: SlotMap<NodeId, Apparatus>,
    detached: Vec<NodeId>,
    needs_update: bool,
    locked: bool,
    extent: (f64, f64),
}

impl ApparatusGraph {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            detached: Vec::new(),
            needs_update: true,
            locked: false,
            extent: (0.0, 0.0),
        }
    }

    pub fn add(&mut self, apparatus: Apparatus) -> NodeId {
        self.needs_update = true;
        self.nodes.insert(apparatus)
    }

    /// Drop a node that was never linked
    pub(crate) fn discard(&mut self, id: NodeId) -> Option<Apparatus> {
        let node = self.nodes.get(id)?;
        if node.attached_to.is_some() || !node.attachments.is_empty() {
            return None;
        }
        self.detached.retain(|d| *d != id);
        self.needs_update = true;
        self.nodes.remove(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Apparatus> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Apparatus> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys()
    }

    /// Nodes parked by `detach`
    pub fn detached(&self) -> &[NodeId] {
        &self.detached
    }

    /// Topology is frozen while locked, except for Ignore sinks
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    pub fn invalidate(&mut self) {
        self.needs_update = true;
    }

    /// Leftmost and rightmost body edge of the attached trees
    pub fn extent(&self) -> (f64, f64) {
        self.extent
    }

    pub fn center_x(&self) -> f64 {
        (self.extent.0 + self.extent.1) * 0.5
    }

    /// Attach `child` to `parent`. Single-input children take the named
    /// output; multi-input children span every output of the parent.
    pub fn attach(&mut self, parent: NodeId, child: NodeId, output: PortName) -> Result<()> {
        let (child_multi, child_is_ignore, child_attachable, child_attached) = {
            let c = self.nodes.get(child).ok_or(TopologyError::UnknownNode)?;
            (
                c.is_multi_input(),
                c.kind.is_ignore(),
                c.kind.is_attachable(),
                c.attached_to.is_some(),
            )
        };
        let p = self.nodes.get(parent).ok_or(TopologyError::UnknownNode)?;

        if !child_attachable {
            return Err(TopologyError::NotAttachable);
        }
        if self.locked && !child_is_ignore {
            return Err(TopologyError::ExperimentRunning);
        }
        if child_attached {
            return Err(TopologyError::AlreadyAttached);
        }
        if parent == child || self.is_ancestor(child, parent) {
            return Err(TopologyError::WouldCycle);
        }

        let key = if child_multi {
            if !p.is_multi_output() {
                return Err(TopologyError::MultiInputOnSingleOutput);
            }
            if let Some((port, _)) = p.attachments.first() {
                return Err(TopologyError::OutputOccupied(port.name().to_string()));
            }
            Port::All
        } else {
            if p.output(output).is_none() {
                return Err(TopologyError::UndeclaredOutput(output.to_string()));
            }
            if !p.is_output_free(output) {
                return Err(TopologyError::OutputOccupied(output.to_string()));
            }
            Port::Named(output)
        };

        log::debug!(
            "Attached {} to {} via {}",
            self.nodes[child].label(),
            self.nodes[parent].label(),
            key.name()
        );
        self.nodes[parent].attachments.push((key, child));
        self.nodes[child].attached_to = Some(parent);
        self.detached.retain(|id| *id != child);
        self.needs_update = true;
        Ok(())
    }

    /// Unlink `child` from its parent and park it
    pub fn detach(&mut self, child: NodeId) -> Result<()> {
        let node = self.nodes.get(child).ok_or(TopologyError::UnknownNode)?;
        if self.locked && !node.kind.is_ignore() {
            return Err(TopologyError::ExperimentRunning);
        }

        let parent = node.attached_to;
        if let Some(parent) = parent {
            self.nodes[parent].attachments.retain(|(_, id)| *id != child);
        }
        self.nodes[child].attached_to = None;
        if !self.detached.contains(&child) {
            self.detached.push(child);
        }
        self.needs_update = true;
        Ok(())
    }

    /// True if `ancestor` is on the path from `node` up to its root
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes.get(node).and_then(|n| n.attached_to);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(id).and_then(|n| n.attached_to);
        }
        false
    }

    /// `root` followed by every node attached below it, parents first
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                order.push(id);
                stack.extend(node.attachments.iter().rev().map(|(_, child)| *child));
            }
        }
        order
    }

    /// Declared outputs of `id` with nothing attached
    pub fn free_outputs(&self, id: NodeId) -> Vec<PortName> {
        self.nodes.get(id).map_or_else(Vec::new, |node| {
            node.outputs()
                .iter()
                .map(|(name, _)| *name)
                .filter(|name| node.is_output_free(*name))
                .collect()
        })
    }

    pub fn set_angle(&mut self, id: NodeId, angle: f64) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or(TopologyError::UnknownNode)?;
        node.set_angle_unchecked(angle);
        self.needs_update = true;
        Ok(())
    }

    pub fn set_layout(&mut self, id: NodeId, layout: BoxModel) -> Result<()> {
        if self.locked {
            return Err(TopologyError::ExperimentRunning);
        }
        let node = self.nodes.get_mut(id).ok_or(TopologyError::UnknownNode)?;
        node.layout = layout;
        self.needs_update = true;
        Ok(())
    }

    /// Solve positions only if something changed since the last solve
    pub fn ensure_layout(&mut self) {
        if self.needs_update {
            self.update_attachments();
        }
    }

    /// Recompute every position by walking down from each unattached root
    pub fn update_attachments(&mut self) {
        let roots: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.attached_to.is_none())
            .map(|(id, _)| id)
            .collect();

        let mut extent: Option<(f64, f64)> = None;

        for root in roots {
            let parked = self.detached.contains(&root);
            let mut stack = vec![root];

            while let Some(parent_id) = stack.pop() {
                let parent = &self.nodes[parent_id];
                if !parked {
                    let half = parent.layout.half_length();
                    let (lo, hi) = (parent.position.x - half, parent.position.x + half);
                    extent = Some(match extent {
                        Some((min, max)) => (min.min(lo), max.max(hi)),
                        None => (lo, hi),
                    });
                }

                let parent_position = parent.position;
                let parent_angle = parent.angle();
                let parent_direction = parent.direction;
                let parent_layout = parent.layout;

                let placements: Vec<(NodeId, Direction, f64, bool)> = parent
                    .attachments
                    .iter()
                    .map(|(port, child)| match port {
                        Port::Named(name) => {
                            let spec = parent.output(*name);
                            let direction = spec
                                .and_then(|s| s.direction)
                                .unwrap_or(parent_direction);
                            (*child, direction, spec.map_or(0.0, |s| s.offset), false)
                        }
                        Port::All => {
                            let direction = parent
                                .outputs()
                                .first()
                                .and_then(|(_, s)| s.direction)
                                .unwrap_or(parent_direction);
                            (*child, direction, 0.0, true)
                        }
                    })
                    .collect();

                for (child_id, direction, offset, spanning) in placements {
                    let child = &mut self.nodes[child_id];
                    let gap = parent_layout.gap_to(&child.layout);
                    child.direction = direction;
                    child.position = parent_position
                        + DVec3::X * gap * direction.sign()
                        + transverse_offset(offset, parent_angle);
                    if spanning {
                        child.set_angle_unchecked(parent_angle);
                    }
                    stack.push(child_id);
                }
            }
        }

        self.extent = extent.unwrap_or((0.0, 0.0));
        self.needs_update = false;
        log::trace!("Layout solved, extent {:?}", self.extent);
    }
}

impl Default for ApparatusGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<NodeId> for ApparatusGraph {
    type Output = Apparatus;

    fn index(&self, id: NodeId) -> &Apparatus {
        &self.nodes[id]
    }
}

impl IndexMut<NodeId> for ApparatusGraph {
    fn index_mut(&mut self, id: NodeId) -> &mut Apparatus {
        &mut self.nodes[id]
    }
}

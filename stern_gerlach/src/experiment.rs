//! Experiment lifecycle and the per-frame stepper
//!
//! Every frame each live particle is advanced by `speed × delta`. The advance
//! is cut into sub-steps that each stop at the nearest upcoming boundary (a
//! body face or centre of the two apparatus straddling the particle, or a
//! trigger point), so no enter/interact/leave event is skipped however thin
//! an apparatus is relative to one frame of travel.

use crate::apparatus::{Apparatus, ApparatusKind, SourceKind};
use crate::config::ExperimentConfig;
use crate::constants::{OUTPUT_OFFSET, SCREEN_SPLIT};
use crate::error::Result;
use crate::events::{
    ApparatusEvent, ApparatusEventKind, ExperimentEvent, ExperimentEventKind, TriggerId,
};
use crate::graph::{ApparatusGraph, NodeId};
use crate::layout::{
    transverse_offset, BoxModel, PortName, DEFAULT_PORT, LEFT_PORT, RIGHT_PORT,
};
use crate::measurement::{self, Outcome};
use crate::particle::{Particle, ParticleId, ParticleKind, ParticleOutcome, ParticlePool};
use crate::screen::gaussian_pair;
use common::{Animate, EventDispatcher};
use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Debug, Default)]
struct ControlFlags {
    paused: Cell<bool>,
    end_requested: Cell<bool>,
}

/// Shared handle for pausing or ending an experiment from inside a listener.
/// Requests take effect at the stepper's next loop check.
#[derive(Debug, Clone, Default)]
pub struct ExperimentControl {
    flags: Rc<ControlFlags>,
}

impl ExperimentControl {
    pub fn pause(&self) {
        self.flags.paused.set(true);
    }

    pub fn resume(&self) {
        self.flags.paused.set(false);
    }

    pub fn end(&self) {
        self.flags.end_requested.set(true);
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.get()
    }

    pub fn is_end_requested(&self) -> bool {
        self.flags.end_requested.get()
    }

    fn reset(&self) {
        self.flags.paused.set(false);
        self.flags.end_requested.set(false);
    }
}

/// Per-particle record of the last sub-step
#[derive(Debug, Clone, Default)]
pub struct ParticleHistory {
    /// Far face of `coming_from`
    pub from_dist: f64,
    /// Near face of `going_to`
    pub to_dist: f64,
    /// Distance reached by the last sub-step
    pub dist: f64,
    /// Apparatus this particle has already interacted with
    pub interacted: HashSet<NodeId>,
    /// Set once `going_to` absorbed the particle; it still has to cross the
    /// far face before it leaves the graph
    absorbed: Option<ParticleOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TriggerPoint {
    id: TriggerId,
    x: f64,
}

/// Body faces and centre of an apparatus, in travel distance of one particle
#[derive(Debug, Clone, Copy, PartialEq)]
struct Span {
    near: f64,
    center: f64,
    far: f64,
}

impl Span {
    fn contains(&self, dist: f64) -> bool {
        self.near <= dist && dist <= self.far
    }

    fn depth(&self, dist: f64) -> f64 {
        (dist - self.near).min(self.far - dist)
    }
}

/// What an apparatus decided for a particle at its interaction point
#[derive(Debug, Clone, Copy, PartialEq)]
enum Routing {
    Output(PortName),
    /// Continue on the current (possibly superposed) path
    Pass,
    Absorb(ParticleOutcome),
    Block,
}

pub struct Experiment {
    graph: ApparatusGraph,
    source: NodeId,
    particles: ParticlePool,
    history: Vec<ParticleHistory>,
    triggers: Vec<TriggerPoint>,
    pending_triggers: Vec<Vec<(f64, TriggerId)>>,
    next_trigger: u64,
    config: ExperimentConfig,
    rng: StdRng,
    control: ExperimentControl,
    running: bool,
    wait_after_end: bool,
    pending_run: bool,
    run_count: u64,
    last_outcomes: Vec<(ParticleId, ParticleOutcome)>,
    time: f64,
    pub events: EventDispatcher<ExperimentEvent>,
}

impl Experiment {
    pub fn new(source: SourceKind, config: ExperimentConfig) -> Self {
        let mut graph = ApparatusGraph::new();
        let source_id = graph.add(Apparatus::source(source));
        let particles = ParticlePool::new(config.spin_history);
        let slots = particles.ids().count();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let events = EventDispatcher::new();
        events.on_protected(ExperimentEventKind::End, |event: &ExperimentEvent| {
            if let ExperimentEvent::End { run, outcomes } = event {
                log::info!("Run {} finished: {:?}", run, outcomes);
            }
        });

        log::info!("Created experiment with {:?} source", source);

        Self {
            graph,
            source: source_id,
            particles,
            history: vec![ParticleHistory::default(); slots],
            triggers: Vec::new(),
            pending_triggers: vec![Vec::new(); slots],
            next_trigger: 0,
            config,
            rng,
            control: ExperimentControl::default(),
            running: false,
            wait_after_end: false,
            pending_run: false,
            run_count: 0,
            last_outcomes: Vec::new(),
            time: 0.0,
            events,
        }
    }

    // ----------------------------------------------------------------------
    // Topology
    // ----------------------------------------------------------------------

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        match self.graph[self.source].kind {
            ApparatusKind::Source(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn set_source_kind(&mut self, kind: SourceKind) -> Result<()> {
        if self.running {
            return Err(crate::error::TopologyError::ExperimentRunning);
        }
        self.graph[self.source].kind = ApparatusKind::Source(kind);
        Ok(())
    }

    pub fn add(&mut self, apparatus: Apparatus) -> NodeId {
        self.graph.add(apparatus)
    }

    pub fn attach(&mut self, parent: NodeId, child: NodeId, output: PortName) -> Result<()> {
        self.graph.attach(parent, child, output)
    }

    /// Add `apparatus` and attach it in one call
    pub fn attach_new(
        &mut self,
        parent: NodeId,
        output: PortName,
        apparatus: Apparatus,
    ) -> Result<NodeId> {
        let child = self.graph.add(apparatus);
        if let Err(err) = self.graph.attach(parent, child, output) {
            self.graph.discard(child);
            return Err(err);
        }
        Ok(child)
    }

    pub fn detach(&mut self, node: NodeId) -> Result<()> {
        self.graph.detach(node)
    }

    pub fn set_angle(&mut self, node: NodeId, angle: f64) -> Result<()> {
        self.graph.set_angle(node, angle)
    }

    pub fn set_layout(&mut self, node: NodeId, layout: BoxModel) -> Result<()> {
        self.graph.set_layout(node, layout)
    }

    pub fn graph(&self) -> &ApparatusGraph {
        &self.graph
    }

    pub fn apparatus(&self, node: NodeId) -> Option<&Apparatus> {
        self.graph.get(node)
    }

    /// Mutable access for variant settings (gate paths, screens, ...)
    pub fn apparatus_mut(&mut self, node: NodeId) -> Option<&mut Apparatus> {
        self.graph.get_mut(node)
    }

    /// Solve positions if the topology changed
    pub fn update_layout(&mut self) {
        self.graph.ensure_layout();
    }

    // ----------------------------------------------------------------------
    // State queries
    // ----------------------------------------------------------------------

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn control(&self) -> ExperimentControl {
        self.control.clone()
    }

    pub fn particles(&self) -> &ParticlePool {
        &self.particles
    }

    pub fn particle(&self, id: ParticleId) -> &Particle {
        self.particles.get(id)
    }

    pub fn history(&self, id: ParticleId) -> &ParticleHistory {
        &self.history[id.0]
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// A `run()` is waiting for the frame after the last `end()`
    pub fn has_pending_run(&self) -> bool {
        self.pending_run
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Terminal outcome of each particle of the last finished run
    pub fn last_outcomes(&self) -> &[(ParticleId, ParticleOutcome)] {
        &self.last_outcomes
    }

    pub fn detector_count(&self, node: NodeId) -> Option<u64> {
        match self.graph.get(node).map(|n| &n.kind) {
            Some(ApparatusKind::Detector(detector)) => Some(detector.count),
            _ => None,
        }
    }

    /// Zero every detector, measurement and screen counter
    pub fn reset_counts(&mut self) {
        let ids: Vec<NodeId> = self.graph.ids().collect();
        for id in ids {
            let node = &mut self.graph[id];
            node.measure_count = 0;
            match &mut node.kind {
                ApparatusKind::Detector(detector) => detector.count = 0,
                ApparatusKind::SternGerlach(sg) => sg.clear_screen(),
                _ => {}
            }
        }
    }

    // ----------------------------------------------------------------------
    // Trigger points
    // ----------------------------------------------------------------------

    /// Register a point on the x axis that notifies when a particle crosses
    /// it moving forward
    pub fn add_trigger_point(&mut self, x: f64) -> TriggerId {
        let id = TriggerId(self.next_trigger);
        self.next_trigger += 1;
        self.triggers.push(TriggerPoint { id, x });
        self.triggers.sort_by(|a, b| a.x.total_cmp(&b.x));

        if self.running {
            for pid in self.particles.ids().collect::<Vec<_>>() {
                let particle = self.particles.get(pid);
                if !particle.is_live() {
                    continue;
                }
                let dist = (x - particle.origin) * particle.direction.sign();
                if dist > particle.distance {
                    let pending = &mut self.pending_triggers[pid.0];
                    pending.push((dist, id));
                    pending.sort_by(|a, b| a.0.total_cmp(&b.0));
                }
            }
        }
        id
    }

    pub fn remove_trigger_point(&mut self, id: TriggerId) -> bool {
        let before = self.triggers.len();
        self.triggers.retain(|t| t.id != id);
        for pending in &mut self.pending_triggers {
            pending.retain(|(_, t)| *t != id);
        }
        before != self.triggers.len()
    }

    // ----------------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------------

    /// Start a run. While a previous run is being torn down the start is
    /// deferred to the next frame.
    pub fn run(&mut self) {
        if self.running {
            self.end();
        }
        if self.wait_after_end {
            log::debug!("Run deferred until the frame after teardown");
            self.pending_run = true;
            return;
        }
        self.start_run();
    }

    pub fn pause(&mut self) {
        if !self.control.is_paused() {
            self.control.pause();
            self.events.trigger(&ExperimentEvent::Pause);
        }
    }

    pub fn resume(&mut self) {
        if self.control.is_paused() {
            self.control.resume();
            self.events.trigger(&ExperimentEvent::Resume);
        }
    }

    /// Finish the current run and clear every particle
    pub fn end(&mut self) {
        if !self.running {
            return;
        }

        let outcomes: Vec<(ParticleId, ParticleOutcome)> = self
            .particles
            .iter()
            .filter(|(_, p)| p.active)
            .map(|(id, p)| (id, p.outcome.unwrap_or(ParticleOutcome::Lost)))
            .collect();

        self.particles.reset_all();
        for pending in &mut self.pending_triggers {
            pending.clear();
        }
        self.running = false;
        self.wait_after_end = true;
        self.graph.set_locked(false);
        self.control.reset();
        self.last_outcomes = outcomes.clone();

        self.events.trigger(&ExperimentEvent::End {
            run: self.run_count,
            outcomes,
        });
    }

    fn start_run(&mut self) {
        self.attach_ignore_sinks();
        self.graph.ensure_layout();

        self.particles.reset_all();
        for history in &mut self.history {
            *history = ParticleHistory::default();
        }
        self.control.reset();
        self.run_count += 1;
        self.running = true;
        self.graph.set_locked(true);

        match self.source_kind() {
            Some(SourceKind::Polarized(angle)) => {
                self.emit(ParticleId::RIGHT_ATOM, RIGHT_PORT);
                self.particles.set_spin(ParticleId::RIGHT_ATOM, Some(angle));
            }
            Some(SourceKind::Unpolarized) => {
                self.emit(ParticleId::RIGHT_ATOM, RIGHT_PORT);
            }
            Some(SourceKind::Entangled) => {
                self.particles
                    .entangle(ParticleId::RIGHT_ATOM, ParticleId::LEFT_ATOM);
                self.emit(ParticleId::RIGHT_ATOM, RIGHT_PORT);
                self.emit(ParticleId::LEFT_ATOM, LEFT_PORT);
            }
            Some(SourceKind::HiddenVariables) => {
                let instructions: [bool; 3] = [self.rng.gen(), self.rng.gen(), self.rng.gen()];
                self.particles
                    .entangle(ParticleId::RIGHT_ATOM, ParticleId::LEFT_ATOM);
                self.particles.get_mut(ParticleId::RIGHT_ATOM).instructions = Some(instructions);
                self.particles.get_mut(ParticleId::LEFT_ATOM).instructions =
                    Some(instructions.map(|plus| !plus));
                self.emit(ParticleId::RIGHT_ATOM, RIGHT_PORT);
                self.emit(ParticleId::LEFT_ATOM, LEFT_PORT);
            }
            Some(SourceKind::CurrentLoop(angle)) => {
                self.emit(ParticleId::LOOP, RIGHT_PORT);
                self.particles.set_spin(ParticleId::LOOP, Some(angle));
            }
            None => {}
        }

        log::info!("Run {} started", self.run_count);
        self.events.trigger(&ExperimentEvent::Run {
            run: self.run_count,
        });
    }

    /// Every output in the source tree must lead somewhere
    fn attach_ignore_sinks(&mut self) {
        for node in self.graph.descendants(self.source) {
            for port in self.graph.free_outputs(node) {
                let sink = self.graph.add(Apparatus::ignore(self.config.silent_ignore));
                if let Err(err) = self.graph.attach(node, sink, port) {
                    log::warn!("Could not terminate output {}: {}", port, err);
                }
            }
        }
    }

    fn emit(&mut self, pid: ParticleId, port: PortName) {
        let source = &self.graph[self.source];
        let direction = source
            .output(port)
            .and_then(|o| o.direction)
            .unwrap_or(source.direction);
        let origin = source.position;

        let particle = self.particles.get_mut(pid);
        particle.active = true;
        particle.visible = true;
        particle.direction = direction;
        particle.origin = origin.x;
        particle.distance = 0.0;
        particle.position = origin;
        particle.going_to = Some(self.source);
        particle.path = Some(port);

        let history = &mut self.history[pid.0];
        history.interacted.insert(self.source);

        let pending: Vec<(f64, TriggerId)> = self
            .triggers
            .iter()
            .map(|t| ((t.x - origin.x) * direction.sign(), t.id))
            .filter(|(dist, _)| *dist > 0.0)
            .collect();
        self.pending_triggers[pid.0] = pending;
        self.pending_triggers[pid.0].sort_by(|a, b| a.0.total_cmp(&b.0));

        self.notify(self.source, ApparatusEventKind::Enter, pid, None);
        self.notify(self.source, ApparatusEventKind::Interact, pid, None);
        self.apply_routing(pid, self.source, Routing::Output(port));
        self.record_history(pid);
    }

    // ----------------------------------------------------------------------
    // Stepping
    // ----------------------------------------------------------------------

    fn span(&self, pid: ParticleId, node: NodeId) -> Span {
        let particle = self.particles.get(pid);
        let apparatus = &self.graph[node];
        let center = (apparatus.position.x - particle.origin) * particle.direction.sign();
        let half = apparatus.layout.half_length();
        Span {
            near: center - half,
            center,
            far: center + half,
        }
    }

    /// Advance one particle by `total` travel distance
    fn step_particle(&mut self, pid: ParticleId, total: f64) {
        let mut remaining = total;

        while remaining > 0.0 {
            if self.control.is_paused() || self.control.is_end_requested() {
                break;
            }
            let particle = self.particles.get(pid);
            if !particle.is_live() {
                break;
            }

            let dist = particle.distance;
            let mut nearest = f64::INFINITY;
            let mut consider = |candidate: f64| {
                if candidate > dist && candidate < nearest {
                    nearest = candidate;
                }
            };

            if let Some(to) = particle.going_to.map(|id| self.span(pid, id)) {
                consider(to.far);
                consider(to.center);
                consider(to.near);
            }
            if let Some(from) = particle.coming_from.map(|id| self.span(pid, id)) {
                consider(from.far);
            }
            if let Some((trigger_dist, _)) = self.pending_triggers[pid.0].first() {
                consider(*trigger_dist);
            }

            let next = if nearest - dist <= remaining {
                remaining -= nearest - dist;
                nearest
            } else {
                let next = dist + remaining;
                remaining = 0.0;
                next
            };

            self.particles.get_mut(pid).distance = next;
            self.fire_boundary_events(pid, next);
            self.record_history(pid);

            if next > self.config.max_distance && self.particles.get(pid).is_live() {
                log::warn!(
                    "{:?} passed the safety distance {} and was terminated",
                    pid,
                    self.config.max_distance
                );
                self.finish(pid, ParticleOutcome::Lost);
            }
        }

        self.update_render_state(pid);
    }

    /// Fire every event at distance `now` in priority order: trigger points,
    /// move-inside, leave `coming_from`, terminal leave of `going_to`, enter
    /// `going_to`, interact with `going_to`
    fn fire_boundary_events(&mut self, pid: ParticleId, now: f64) {
        let prev = self.history[pid.0].dist;

        while let Some(&(trigger_dist, trigger)) = self.pending_triggers[pid.0].first() {
            if trigger_dist > now {
                break;
            }
            self.pending_triggers[pid.0].remove(0);
            log::debug!("{:?} crossed trigger {:?}", pid, trigger);
            self.events.trigger(&ExperimentEvent::Trigger {
                trigger,
                particle: pid,
                distance: trigger_dist,
            });
        }

        let (coming_from, going_to) = {
            let particle = self.particles.get(pid);
            (particle.coming_from, particle.going_to)
        };
        let to_span = going_to.map(|id| (id, self.span(pid, id)));
        let from_span = coming_from.map(|id| (id, self.span(pid, id)));

        let inside = match (to_span, from_span) {
            (Some((id, span)), _) if span.contains(now) => Some((id, span)),
            (_, Some((id, span))) if span.contains(now) => Some((id, span)),
            _ => None,
        };
        if let Some((id, span)) = inside {
            self.move_inside(pid, id, span, now);
        }

        if let Some((from, span)) = from_span {
            if prev < span.far && span.far <= now {
                self.notify(from, ApparatusEventKind::Leave, pid, None);
                self.on_leave(pid, from);
            }
        }

        let Some((to, span)) = to_span else {
            return;
        };

        if let Some(outcome) = self.history[pid.0].absorbed {
            if prev < span.far && span.far <= now {
                self.notify(to, ApparatusEventKind::Leave, pid, None);
                self.on_leave(pid, to);
                self.finish(pid, outcome);
            }
            return;
        }

        if prev < span.near && span.near <= now {
            self.notify(to, ApparatusEventKind::Enter, pid, None);
            if self.graph[to].kind.interacts_on_enter() {
                self.interact(pid, to);
                return;
            }
        }

        if prev < span.center && span.center <= now {
            self.interact(pid, to);
        }
    }

    fn record_history(&mut self, pid: ParticleId) {
        let (coming_from, going_to, dist) = {
            let particle = self.particles.get(pid);
            (particle.coming_from, particle.going_to, particle.distance)
        };
        let from_dist = coming_from.map(|id| self.span(pid, id).far);
        let to_dist = going_to.map(|id| self.span(pid, id).near);

        let history = &mut self.history[pid.0];
        history.dist = dist;
        if let Some(from_dist) = from_dist {
            history.from_dist = from_dist;
        }
        if let Some(to_dist) = to_dist {
            history.to_dist = to_dist;
        }
    }

    fn finish(&mut self, pid: ParticleId, outcome: ParticleOutcome) {
        let particle = self.particles.get_mut(pid);
        particle.detected = true;
        particle.visible = false;
        particle.outcome = Some(outcome);
        log::debug!("{:?} left the experiment: {:?}", pid, outcome);
    }

    // ----------------------------------------------------------------------
    // Apparatus behaviour
    // ----------------------------------------------------------------------

    fn notify(
        &self,
        node: NodeId,
        kind: ApparatusEventKind,
        pid: ParticleId,
        outcome: Option<Outcome>,
    ) {
        self.graph[node].events.trigger(&ApparatusEvent {
            kind,
            node,
            particle: pid,
            distance: self.particles.get(pid).distance,
            outcome,
        });
    }

    fn measure_at(&mut self, pid: ParticleId, node: NodeId) -> Outcome {
        let angle = self.graph[node].angle();
        let outcome = measurement::measure(&mut self.particles, pid, angle, &mut self.rng);
        self.graph[node].measure_count += 1;
        self.notify(node, ApparatusEventKind::Measured, pid, Some(outcome));
        outcome
    }

    /// Latched: runs at most once per apparatus per particle and run
    fn interact(&mut self, pid: ParticleId, node: NodeId) {
        if !self.history[pid.0].interacted.insert(node) {
            return;
        }
        self.graph[node].glow = 1.0;
        self.notify(node, ApparatusEventKind::Interact, pid, None);

        let routing = self.decide(pid, node);
        self.apply_routing(pid, node, routing);
    }

    fn decide(&mut self, pid: ParticleId, node: NodeId) -> Routing {
        let spanned = self.graph[node].spanning_child().is_some();

        match &self.graph[node].kind {
            ApparatusKind::Source(_) => Routing::Pass,
            ApparatusKind::Analyzer
            | ApparatusKind::ExplodedAnalyzer
            | ApparatusKind::SternGerlach(_) => {
                if spanned {
                    self.particles.get_mut(pid).path = None;
                    Routing::Pass
                } else {
                    Routing::Output(self.measure_at(pid, node).port())
                }
            }
            ApparatusKind::Gate(gate) => {
                let gate = *gate;
                if gate.classical {
                    let outcome = self.measure_at(pid, node);
                    if gate.is_open(outcome.port()) {
                        Routing::Output(outcome.port())
                    } else {
                        Routing::Block
                    }
                } else if gate.top_open && gate.bottom_open {
                    Routing::Pass
                } else if gate.top_open || gate.bottom_open {
                    let outcome = self.measure_at(pid, node);
                    if gate.is_open(outcome.port()) {
                        Routing::Output(outcome.port())
                    } else {
                        Routing::Block
                    }
                } else {
                    Routing::Block
                }
            }
            ApparatusKind::DetectorGate(gate) => {
                if gate.forces_collapse() {
                    let outcome = self.measure_at(pid, node);
                    self.notify(node, ApparatusEventKind::DetectParticle, pid, Some(outcome));
                    Routing::Output(outcome.port())
                } else {
                    Routing::Pass
                }
            }
            ApparatusKind::Eraser(eraser) => {
                let quantum = eraser.quantum;
                if quantum && self.particles.get(pid).path.is_some() {
                    self.particles.erase_spin(pid);
                }
                Routing::Output(DEFAULT_PORT)
            }
            ApparatusKind::Detector(_) => {
                // A definite spin is left alone so an entangled partner still
                // in flight keeps the correlation set upstream.
                let outcome = match self.particles.get(pid).spin() {
                    Some(_) => None,
                    None => Some(self.measure_at(pid, node)),
                };
                if let ApparatusKind::Detector(detector) = &mut self.graph[node].kind {
                    detector.count += 1;
                }
                self.notify(node, ApparatusEventKind::DetectParticle, pid, outcome);
                Routing::Absorb(ParticleOutcome::Detected(node))
            }
            ApparatusKind::Ignore(ignore) => {
                let silent = ignore.silent;
                self.notify(node, ApparatusEventKind::Ignored, pid, None);
                self.events.trigger(&ExperimentEvent::Ignored {
                    node,
                    particle: pid,
                    silent,
                });
                Routing::Absorb(ParticleOutcome::Ignored(node))
            }
        }
    }

    fn apply_routing(&mut self, pid: ParticleId, node: NodeId, routing: Routing) {
        match routing {
            Routing::Output(port) => {
                let next = self.graph[node].attachment(port);
                let particle = self.particles.get_mut(pid);
                particle.path = Some(port);
                self.advance_to(pid, node, next);
            }
            Routing::Pass => {
                let path = self.particles.get(pid).path;
                let spanning = self.graph[node].spanning_child();
                match (spanning, path) {
                    (Some(child), _) => self.advance_to(pid, node, Some(child)),
                    (None, Some(port)) if self.graph[node].output(port).is_some() => {
                        let next = self.graph[node].attachment(port);
                        self.advance_to(pid, node, next);
                    }
                    (None, _) if self.graph[node].outputs().len() == 1 => {
                        let (port, _) = self.graph[node].outputs()[0];
                        self.apply_routing(pid, node, Routing::Output(port));
                    }
                    (None, _) => {
                        // Both paths lead to separate apparatus: which one is
                        // revealed here.
                        let outcome = self.measure_at(pid, node);
                        self.apply_routing(pid, node, Routing::Output(outcome.port()));
                    }
                }
            }
            Routing::Absorb(outcome) => {
                self.history[pid.0].absorbed = Some(outcome);
            }
            Routing::Block => {
                log::debug!("{:?} blocked at {}", pid, self.graph[node].label());
                self.notify(node, ApparatusEventKind::Blocked, pid, None);
                self.events.trigger(&ExperimentEvent::Blocked {
                    node,
                    particle: pid,
                });
                self.finish(pid, ParticleOutcome::Blocked(node));
            }
        }
    }

    fn advance_to(&mut self, pid: ParticleId, node: NodeId, next: Option<NodeId>) {
        let particle = self.particles.get_mut(pid);
        particle.coming_from = Some(node);
        particle.going_to = next;
        if next.is_none() {
            self.history[pid.0].absorbed = Some(ParticleOutcome::Lost);
            // Without a destination the particle leaves through the far face
            // of the apparatus it came from.
            let particle = self.particles.get_mut(pid);
            particle.going_to = Some(node);
            particle.coming_from = None;
        }
    }

    fn move_inside(&mut self, pid: ParticleId, node: NodeId, span: Span, now: f64) {
        if let ApparatusKind::SternGerlach(_) = self.graph[node].kind {
            let half = (span.far - span.near) * 0.5;
            let proximity = if half > 0.0 {
                (1.0 - (now - span.center).abs() / half).clamp(0.0, 1.0)
            } else {
                0.0
            };
            self.particles.get_mut(pid).field_intensity = proximity;
        }
        self.notify(node, ApparatusEventKind::MoveInside, pid, None);
    }

    fn on_leave(&mut self, pid: ParticleId, node: NodeId) {
        let ApparatusKind::SternGerlach(sg) = &self.graph[node].kind else {
            return;
        };
        let (spread, radius, alpha) = (sg.spread, sg.dot_radius, sg.dot_alpha);

        let deflection = self.deflection(pid, node) * SCREEN_SPLIT;
        self.particles.get_mut(pid).field_intensity = 0.0;

        let (jx, jy) = gaussian_pair(&mut self.rng);
        let (x, y) = (jx * spread, deflection + jy * spread);

        if let ApparatusKind::SternGerlach(sg) = &mut self.graph[node].kind {
            sg.dots += 1;
            if let Some(screen) = &sg.screen {
                screen.borrow_mut().draw_dot(x, y, radius, alpha);
            }
        }
    }

    /// Signed deflection in [-1, 1] a magnet applies to a particle, towards
    /// the plus output when positive
    fn deflection(&self, pid: ParticleId, magnet: NodeId) -> f64 {
        let particle = self.particles.get(pid);
        let angle = self.graph[magnet].angle();

        if particle.kind == ParticleKind::CurrentLoop {
            let field = particle.field_angle.unwrap_or(angle);
            return particle.spin().map_or(0.0, |moment| (moment - field).cos());
        }
        if self.graph[magnet].spanning_child().is_some() {
            return 0.0;
        }
        if particle.coming_from == Some(magnet) {
            return match particle.path {
                Some(port) if port == Outcome::Plus.port() => 1.0,
                Some(port) if port == Outcome::Minus.port() => -1.0,
                _ => 0.0,
            };
        }
        // Not measured yet: the expected value of the outcome
        particle.spin().map_or(0.0, |spin| (spin - angle).cos())
    }

    /// Transverse offset from a magnet's axis after crossing `dist`. The push
    /// follows the field intensity, so the offset is the running integral of
    /// a profile that peaks at the centre and reaches full scale at the far face.
    fn magnet_offset(&self, pid: ParticleId, magnet: NodeId, span: Span, dist: f64) -> DVec3 {
        let field = self.particles.get(pid).field_intensity;
        let crossed = if dist <= span.center {
            0.5 * field * field
        } else {
            1.0 - 0.5 * field * field
        };
        let scale = self.deflection(pid, magnet) * OUTPUT_OFFSET * crossed;
        transverse_offset(scale, self.graph[magnet].angle())
    }

    // ----------------------------------------------------------------------
    // Rendering collaborator state
    // ----------------------------------------------------------------------

    fn update_render_state(&mut self, pid: ParticleId) {
        let particle = self.particles.get(pid);
        if !particle.active {
            return;
        }
        let dist = particle.distance;
        let x = particle.origin + dist * particle.direction.sign();

        let inside = [particle.going_to, particle.coming_from]
            .into_iter()
            .flatten()
            .map(|id| (id, self.span(pid, id)))
            .find(|(_, span)| span.contains(dist));

        let transverse = match (inside, particle.coming_from, particle.going_to) {
            (Some((id, span)), _, _) if self.graph[id].kind.suppresses_shrink() => {
                self.graph[id].position + self.magnet_offset(pid, id, span, dist)
            }
            (_, Some(from), Some(to)) => {
                let from_span = self.span(pid, from);
                // A magnet releases the particle at its deflected far face
                let (start, a) = if self.graph[from].kind.suppresses_shrink() {
                    let exit = self.magnet_offset(pid, from, from_span, from_span.far);
                    (self.graph[from].position + exit, from_span.far)
                } else {
                    (self.graph[from].position, from_span.center)
                };
                let b = self.span(pid, to).center;
                let t = if (b - a).abs() > f64::EPSILON {
                    ((dist - a) / (b - a)).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                start.lerp(self.graph[to].position, t)
            }
            (_, None, Some(to)) => self.graph[to].position,
            (_, Some(from), None) => self.graph[from].position,
            (_, None, None) => particle.position,
        };

        let visibility = match inside {
            Some((id, _)) if self.graph[id].kind.suppresses_shrink() => 1.0,
            Some((_, span)) if self.config.shrink_distance > 0.0 => {
                1.0 - (span.depth(dist) / self.config.shrink_distance).clamp(0.0, 1.0)
            }
            Some(_) => 0.0,
            None => 1.0,
        };

        let particle = self.particles.get_mut(pid);
        particle.position = DVec3::new(x, transverse.y, transverse.z);
        particle.visibility = visibility;
    }

    fn decay_glow(&mut self, delta: f64) {
        let fade = self.config.glow_decay * delta;
        let ids: Vec<NodeId> = self.graph.ids().collect();
        for id in ids {
            let node = &mut self.graph[id];
            node.glow = (node.glow - fade).max(0.0);
        }
    }
}

impl Animate for Experiment {
    fn animate(&mut self, t: f64, delta: f64) {
        self.time = t;
        self.decay_glow(delta);

        if self.wait_after_end {
            self.wait_after_end = false;
            if self.pending_run {
                self.pending_run = false;
                self.start_run();
            }
            return;
        }

        if !self.running {
            return;
        }
        if self.control.is_end_requested() {
            self.end();
            return;
        }
        if self.control.is_paused() {
            return;
        }

        let total = self.config.speed * delta;
        let ids: Vec<ParticleId> = self.particles.ids().collect();
        for pid in ids {
            if self.particles.get(pid).is_live() {
                self.step_particle(pid, total);
            }
        }

        if self.control.is_end_requested() || !self.particles.any_live() {
            self.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BOTTOM_PORT, TOP_PORT};
    use crate::particle::normalize_angle;
    use crate::presets::run_to_completion;
    use crate::screen::DotBuffer;
    use crate::TopologyError;
    use std::cell::RefCell;
    use std::f64::consts::{FRAC_PI_3, PI, TAU};

    const DT: f64 = 0.1;
    const MAX_FRAMES: usize = 10_000;

    fn config() -> ExperimentConfig {
        ExperimentConfig::default().with_seed(42)
    }

    /// Polarized source → analyzer → detector on top
    fn chain(source: SourceKind, angle: f64) -> (Experiment, NodeId, NodeId) {
        let mut exp = Experiment::new(source, config());
        let analyzer = exp
            .attach_new(exp.source(), RIGHT_PORT, Apparatus::analyzer(angle))
            .unwrap();
        let detector = exp
            .attach_new(analyzer, TOP_PORT, Apparatus::detector())
            .unwrap();
        (exp, analyzer, detector)
    }

    fn record(
        exp: &Experiment,
        nodes: &[NodeId],
        kinds: &[ApparatusEventKind],
    ) -> Rc<RefCell<Vec<(NodeId, ApparatusEventKind)>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for node in nodes {
            for kind in kinds {
                let log = log.clone();
                exp.apparatus(*node)
                    .unwrap()
                    .events
                    .on(*kind, move |e: &ApparatusEvent| log.borrow_mut().push((e.node, e.kind)));
            }
        }
        log
    }

    #[test]
    fn test_one_huge_frame_fires_every_boundary_once_in_order() {
        let (mut exp, analyzer, detector) = chain(SourceKind::Polarized(0.0), 0.0);
        let source = exp.source();
        exp.update_layout();
        let (min, max) = exp.graph().extent();
        let span = max - min;

        use ApparatusEventKind::*;
        let log = record(&exp, &[source, analyzer, detector], &[Enter, Interact, Leave]);

        exp.run();
        exp.animate(1.0, 10.0 * span / exp.config().speed);

        let expected = vec![
            (source, Enter),
            (source, Interact),
            (source, Leave),
            (analyzer, Enter),
            (analyzer, Interact),
            (analyzer, Leave),
            (detector, Enter),
            (detector, Interact),
            (detector, Leave),
        ];
        assert_eq!(*log.borrow(), expected);
        assert!(!exp.is_running(), "Run ends once every particle is out");
        assert_eq!(
            exp.last_outcomes(),
            &[(ParticleId::RIGHT_ATOM, ParticleOutcome::Detected(detector))]
        );
        assert_eq!(exp.detector_count(detector), Some(1));
    }

    #[test]
    fn test_small_steps_fire_the_same_sequence() {
        let (mut exp, analyzer, detector) = chain(SourceKind::Polarized(0.0), 0.0);
        use ApparatusEventKind::*;
        let log = record(&exp, &[analyzer, detector], &[Enter, Interact, Leave]);

        assert!(run_to_completion(&mut exp, 0.003, MAX_FRAMES));

        let kinds: Vec<ApparatusEventKind> = log.borrow().iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, vec![Enter, Interact, Leave, Enter, Interact, Leave]);
    }

    #[test]
    fn test_trigger_fires_once_in_direction_of_travel() {
        for dt in [0.002, 0.1, 5.0] {
            let mut exp = Experiment::new(SourceKind::Entangled, config());
            let ahead = exp.add_trigger_point(0.6);
            let crossed = Rc::new(RefCell::new(Vec::new()));
            {
                let crossed = crossed.clone();
                exp.events.on(ExperimentEventKind::Trigger, move |e: &ExperimentEvent| {
                    if let ExperimentEvent::Trigger {
                        trigger, particle, ..
                    } = e
                    {
                        crossed.borrow_mut().push((*trigger, *particle));
                    }
                });
            }

            assert!(run_to_completion(&mut exp, dt, MAX_FRAMES));
            assert_eq!(
                *crossed.borrow(),
                vec![(ahead, ParticleId::RIGHT_ATOM)],
                "dt = {}",
                dt
            );
        }
    }

    #[test]
    fn test_removed_trigger_never_fires() {
        let mut exp = Experiment::new(SourceKind::Polarized(0.0), config());
        let trigger = exp.add_trigger_point(1.0);
        let fired = Rc::new(Cell::new(0));
        {
            let fired = fired.clone();
            exp.events
                .on(ExperimentEventKind::Trigger, move |_: &ExperimentEvent| fired.set(fired.get() + 1));
        }

        assert!(exp.remove_trigger_point(trigger));
        assert!(!exp.remove_trigger_point(trigger));
        assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_unconnected_output_ends_in_ignore_sink() {
        let mut exp = Experiment::new(SourceKind::Polarized(0.0), config());
        let ignored = Rc::new(Cell::new(0));
        {
            let ignored = ignored.clone();
            exp.events
                .on(ExperimentEventKind::Ignored, move |_: &ExperimentEvent| ignored.set(ignored.get() + 1));
        }

        assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));

        assert_eq!(ignored.get(), 1);
        let (_, outcome) = exp.last_outcomes()[0];
        match outcome {
            ParticleOutcome::Ignored(node) => {
                assert!(exp.apparatus(node).unwrap().kind.is_ignore());
                assert_eq!(exp.apparatus(node).unwrap().attached_to(), Some(exp.source()));
            }
            other => panic!("Expected an Ignore sink, got {:?}", other),
        }
        assert!(exp.graph().free_outputs(exp.source()).is_empty());
    }

    #[test]
    fn test_gate_both_open_does_not_measure() {
        let mut exp = Experiment::new(SourceKind::Polarized(0.0), config());
        let splitter = exp
            .attach_new(exp.source(), RIGHT_PORT, Apparatus::analyzer(FRAC_PI_3))
            .unwrap();
        let gate = exp
            .attach_new(splitter, TOP_PORT, Apparatus::gate(true, true))
            .unwrap();
        let eraser = exp
            .attach_new(gate, TOP_PORT, Apparatus::eraser(false))
            .unwrap();
        let log = record(&exp, &[eraser], &[ApparatusEventKind::Interact]);

        for _ in 0..50 {
            assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
        }

        assert_eq!(exp.apparatus(gate).unwrap().measure_count(), 0);
        assert_eq!(exp.apparatus(splitter).unwrap().measure_count(), 0);
        assert_eq!(log.borrow().len(), 50, "Every particle reaches the merge");
    }

    #[test]
    fn test_gate_one_open_measures_once_and_blocks_by_cos_squared() {
        let mut exp = Experiment::new(SourceKind::Polarized(0.0), config());
        let splitter = exp
            .attach_new(exp.source(), RIGHT_PORT, Apparatus::analyzer(FRAC_PI_3))
            .unwrap();
        let gate = exp
            .attach_new(splitter, TOP_PORT, Apparatus::gate(true, false))
            .unwrap();
        let blocked = Rc::new(Cell::new(0u32));
        {
            let blocked = blocked.clone();
            exp.events
                .on(ExperimentEventKind::Blocked, move |_: &ExperimentEvent| blocked.set(blocked.get() + 1));
        }

        let runs = 4_000;
        for _ in 0..runs {
            assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
        }

        assert_eq!(exp.apparatus(gate).unwrap().measure_count(), runs as u64);
        // Minus at 60° from spin up
        let expected = 1.0 - (FRAC_PI_3 / 2.0).cos().powi(2);
        let rate = blocked.get() as f64 / runs as f64;
        assert!(
            (rate - expected).abs() < 0.03,
            "Block rate {} vs {}",
            rate,
            expected
        );
    }

    #[test]
    fn test_run_during_teardown_is_deferred() {
        let (mut exp, _, _) = chain(SourceKind::Polarized(0.0), 0.0);
        assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
        assert_eq!(exp.run_count(), 1);

        exp.run();
        assert!(exp.has_pending_run());
        assert!(!exp.is_running());

        exp.animate(exp.time() + DT, DT);
        assert!(!exp.has_pending_run());
        assert!(exp.is_running());
        assert_eq!(exp.run_count(), 2);
    }

    #[test]
    fn test_listener_can_pause_and_end() {
        let (mut exp, analyzer, _) = chain(SourceKind::Polarized(0.0), 0.0);
        let control = exp.control();
        exp.apparatus(analyzer)
            .unwrap()
            .events
            .on(ApparatusEventKind::Interact, move |_: &ApparatusEvent| control.pause());

        exp.run();
        exp.animate(1.0, 50.0);
        assert!(exp.is_running());
        assert!(exp.is_paused());

        exp.update_layout();
        let center = exp.apparatus(analyzer).unwrap().position.x;
        let stopped_at = exp.particle(ParticleId::RIGHT_ATOM).distance;
        assert!((stopped_at - center).abs() < 1e-9, "Stopped at {}", stopped_at);

        exp.animate(2.0, 50.0);
        assert_eq!(exp.particle(ParticleId::RIGHT_ATOM).distance, stopped_at);

        exp.resume();
        exp.control().end();
        exp.animate(3.0, DT);
        assert!(!exp.is_running());
        assert_eq!(
            exp.last_outcomes(),
            &[(ParticleId::RIGHT_ATOM, ParticleOutcome::Lost)]
        );
    }

    #[test]
    fn test_topology_locked_while_running() {
        let (mut exp, analyzer, detector) = chain(SourceKind::Polarized(0.0), 0.0);
        let spare = exp.add(Apparatus::analyzer(0.0));
        exp.run();

        let nodes = exp.graph().len();
        assert_eq!(
            exp.attach_new(spare, TOP_PORT, Apparatus::detector()).unwrap_err(),
            TopologyError::ExperimentRunning
        );
        assert_eq!(exp.graph().len(), nodes, "Rejected apparatus is discarded");
        assert_eq!(exp.detach(detector), Err(TopologyError::ExperimentRunning));
        assert!(exp.attach_new(spare, BOTTOM_PORT, Apparatus::ignore(true)).is_ok());
        assert_eq!(
            exp.set_source_kind(SourceKind::Unpolarized),
            Err(TopologyError::ExperimentRunning)
        );

        exp.end();
        assert!(exp.detach(analyzer).is_ok());
    }

    #[test]
    fn test_safety_distance_terminates_particle() {
        let mut exp = Experiment::new(
            SourceKind::Polarized(0.0),
            ExperimentConfig {
                max_distance: 1.0,
                ..config()
            },
        );
        exp.attach_new(exp.source(), RIGHT_PORT, Apparatus::analyzer(0.0))
            .unwrap();

        assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
        assert_eq!(
            exp.last_outcomes(),
            &[(ParticleId::RIGHT_ATOM, ParticleOutcome::Lost)]
        );
    }

    #[test]
    fn test_stern_gerlach_paints_deflected_dots() {
        let mut exp = Experiment::new(SourceKind::Polarized(0.0), config());
        let magnet = exp
            .attach_new(exp.source(), RIGHT_PORT, Apparatus::stern_gerlach(0.0))
            .unwrap();
        let screen = Rc::new(RefCell::new(DotBuffer::default()));
        if let ApparatusKind::SternGerlach(sg) = &mut exp.apparatus_mut(magnet).unwrap().kind {
            sg.screen = Some(screen.clone() as Rc<RefCell<dyn crate::screen::Screen>>);
        }

        for _ in 0..10 {
            assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
        }

        assert_eq!(screen.borrow().dots.len(), 10);
        assert!(screen.borrow().dots.iter().all(|d| d.y > 0.0));
        assert_eq!(exp.apparatus(magnet).unwrap().measure_count(), 10);

        exp.reset_counts();
        assert!(screen.borrow().dots.is_empty());
        assert_eq!(exp.apparatus(magnet).unwrap().measure_count(), 0);
    }

    #[test]
    fn test_glow_decays_after_interaction() {
        let (mut exp, analyzer, _) = chain(SourceKind::Polarized(0.0), 0.0);
        exp.run();
        exp.animate(1.0, 50.0);
        assert!(!exp.is_running());
        assert_eq!(exp.apparatus(analyzer).unwrap().glow, 1.0);

        // The teardown frame fades as well
        exp.animate(2.0, 0.125);
        let glow = exp.apparatus(analyzer).unwrap().glow;
        assert!((glow - 0.75).abs() < 1e-12, "glow {}", glow);

        exp.animate(2.125, 0.125);
        let glow = exp.apparatus(analyzer).unwrap().glow;
        assert!((glow - 0.5).abs() < 1e-12, "glow {}", glow);

        exp.animate(3.125, 1.0);
        assert_eq!(exp.apparatus(analyzer).unwrap().glow, 0.0);
    }

    #[test]
    fn test_particle_shrinks_inside_bodies() {
        let (mut exp, analyzer, _) = chain(SourceKind::Polarized(0.0), 0.0);
        let control = exp.control();
        exp.apparatus(analyzer)
            .unwrap()
            .events
            .on(ApparatusEventKind::Interact, move |_: &ApparatusEvent| control.pause());

        exp.run();
        exp.animate(1.0, 50.0);

        let particle = exp.particle(ParticleId::RIGHT_ATOM);
        assert_eq!(particle.visibility, 0.0, "Centre of a long body is hidden");
        assert!((particle.position.x - exp.apparatus(analyzer).unwrap().position.x).abs() < 1e-9);
    }

    #[test]
    fn test_exploded_analyzer_interacts_on_enter() {
        let mut exp = Experiment::new(SourceKind::Polarized(0.0), config().with_speed(2.0));
        let analyzer = exp
            .attach_new(exp.source(), RIGHT_PORT, Apparatus::exploded_analyzer(0.0))
            .unwrap();
        let at = Rc::new(Cell::new(f64::NAN));
        {
            let at = at.clone();
            exp.apparatus(analyzer)
                .unwrap()
                .events
                .on(ApparatusEventKind::Interact, move |e: &ApparatusEvent| at.set(e.distance));
        }

        assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));

        let node = exp.apparatus(analyzer).unwrap();
        let near = node.position.x - node.layout.half_length();
        assert!((at.get() - near).abs() < 1e-9, "Interacted at {}", at.get());
        assert_eq!(node.measure_count(), 1);
    }

    #[test]
    fn test_detector_gate_collapses_only_when_watched() {
        for (detectors, measured) in [([false, false], false), ([true, false], true)] {
            let mut exp = Experiment::new(SourceKind::Polarized(0.0), config());
            let splitter = exp
                .attach_new(exp.source(), RIGHT_PORT, Apparatus::analyzer(FRAC_PI_3))
                .unwrap();
            let gate = exp
                .attach_new(splitter, TOP_PORT, Apparatus::detector_gate(detectors, [true, true]))
                .unwrap();
            exp.attach_new(gate, TOP_PORT, Apparatus::eraser(false))
                .unwrap();
            let detected = Rc::new(Cell::new(0));
            {
                let detected = detected.clone();
                exp.apparatus(gate).unwrap().events.on(
                    ApparatusEventKind::DetectParticle,
                    move |_: &ApparatusEvent| detected.set(detected.get() + 1),
                );
            }

            for _ in 0..20 {
                assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
            }

            let expected = if measured { 20 } else { 0 };
            assert_eq!(exp.apparatus(gate).unwrap().measure_count(), expected);
            assert_eq!(detected.get(), expected);
        }
    }

    #[test]
    fn test_unpolarized_source_splits_evenly() {
        let (mut exp, analyzer, detector) = chain(SourceKind::Unpolarized, 0.0);
        let runs = 2_000;
        for _ in 0..runs {
            assert!(run_to_completion(&mut exp, DT, MAX_FRAMES));
        }

        let top = exp.detector_count(detector).unwrap() as f64 / runs as f64;
        assert!((top - 0.5).abs() < 0.04, "Top fraction {}", top);
        assert_eq!(exp.apparatus(analyzer).unwrap().measure_count(), runs as u64);
    }

    #[test]
    fn test_history_tracks_neighbour_faces() {
        let (mut exp, analyzer, _) = chain(SourceKind::Polarized(0.0), 0.0);
        exp.set_angle(analyzer, 0.0).unwrap();
        exp.run();
        exp.animate(0.1, 0.1);

        exp.update_layout();
        let node = exp.apparatus(analyzer).unwrap();
        let history = exp.history(ParticleId::RIGHT_ATOM);
        assert!((history.to_dist - (node.position.x - node.layout.half_length())).abs() < 1e-9);
        assert!((history.from_dist - 0.5).abs() < 1e-9, "Source far face");
        assert!((history.dist - 0.4).abs() < 1e-9);
        assert!(history.interacted.contains(&exp.source()));
    }

    #[test]
    fn test_trigger_on_a_face_fires_before_move_inside_and_enter() {
        for dt in [0.003, 0.1, 50.0] {
            let (mut exp, analyzer, _) = chain(SourceKind::Polarized(0.0), 0.0);
            exp.update_layout();
            let node = exp.apparatus(analyzer).unwrap();
            exp.add_trigger_point(node.position.x - node.layout.half_length());

            let log = Rc::new(RefCell::new(Vec::new()));
            {
                let log = log.clone();
                exp.events.on(ExperimentEventKind::Trigger, move |_: &ExperimentEvent| {
                    log.borrow_mut().push("trigger")
                });
            }
            for (kind, name) in [
                (ApparatusEventKind::MoveInside, "move"),
                (ApparatusEventKind::Enter, "enter"),
                (ApparatusEventKind::Interact, "interact"),
                (ApparatusEventKind::Leave, "leave"),
            ] {
                let log = log.clone();
                exp.apparatus(analyzer)
                    .unwrap()
                    .events
                    .on(kind, move |_: &ApparatusEvent| log.borrow_mut().push(name));
            }

            assert!(run_to_completion(&mut exp, dt, MAX_FRAMES));

            let log = log.borrow();
            assert_eq!(log[..3], ["trigger", "move", "enter"], "dt = {}", dt);
            assert_eq!(log.iter().filter(|e| **e == "trigger").count(), 1);
            assert_eq!(log.last(), Some(&"leave"));
            if dt == 50.0 {
                assert_eq!(
                    *log,
                    vec!["trigger", "move", "enter", "move", "interact", "move", "leave"]
                );
            } else {
                // Every sub-step inside the body reports its position
                assert!(log.iter().filter(|e| **e == "move").count() > 3, "dt = {}", dt);
            }
        }
    }

    #[test]
    fn test_trigger_added_mid_run_fires_only_ahead() {
        let mut exp = Experiment::new(SourceKind::Entangled, config());
        let crossed = Rc::new(RefCell::new(Vec::new()));
        {
            let crossed = crossed.clone();
            exp.events.on(ExperimentEventKind::Trigger, move |e: &ExperimentEvent| {
                if let ExperimentEvent::Trigger {
                    trigger,
                    particle,
                    distance,
                } = e
                {
                    crossed.borrow_mut().push((*trigger, *particle, *distance));
                }
            });
        }

        exp.run();
        exp.animate(0.1, 0.1);
        assert!((exp.particle(ParticleId::RIGHT_ATOM).distance - 0.4).abs() < 1e-9);

        let right_ahead = exp.add_trigger_point(0.6);
        let left_ahead = exp.add_trigger_point(-0.6);
        exp.add_trigger_point(0.2);
        exp.add_trigger_point(-0.2);

        let mut t = 0.1;
        for _ in 0..MAX_FRAMES {
            if !exp.is_running() {
                break;
            }
            t += DT;
            exp.animate(t, DT);
        }
        assert!(!exp.is_running());

        let crossed = crossed.borrow();
        assert_eq!(crossed.len(), 2, "{:?}", crossed);
        for (trigger, particle) in [
            (right_ahead, ParticleId::RIGHT_ATOM),
            (left_ahead, ParticleId::LEFT_ATOM),
        ] {
            let (_, _, distance) = crossed
                .iter()
                .find(|(t, p, _)| *t == trigger && *p == particle)
                .copied()
                .unwrap();
            assert!((distance - 0.6).abs() < 1e-9, "Crossed at {}", distance);
        }
    }

    #[test]
    fn test_stern_gerlach_deflects_while_inside() {
        let mut exp = Experiment::new(SourceKind::Polarized(0.0), config());
        let magnet = exp
            .attach_new(exp.source(), RIGHT_PORT, Apparatus::stern_gerlach(0.0))
            .unwrap();
        exp.update_layout();
        let node = exp.apparatus(magnet).unwrap();
        let (near, far) = (
            node.position.x - node.layout.half_length(),
            node.position.x + node.layout.half_length(),
        );
        let (center, axis) = (node.position.x, node.position.y);

        exp.run();
        let dt = 0.01;
        let mut t = 0.0;
        let mut inside = Vec::new();
        let mut after = Vec::new();
        for _ in 0..MAX_FRAMES {
            if !exp.is_running() {
                break;
            }
            t += dt;
            exp.animate(t, dt);
            let particle = exp.particle(ParticleId::RIGHT_ATOM);
            if !particle.is_live() {
                continue;
            }
            let sample = (particle.distance, particle.position.y - axis, particle.field_intensity);
            if near < particle.distance && particle.distance < far {
                inside.push(sample);
            } else if particle.distance >= far {
                after.push(sample);
            }
        }

        assert!(inside.len() > 10);
        let (_, first_y, _) = inside[0];
        let (_, last_y, _) = inside[inside.len() - 1];
        assert!(first_y.abs() < 0.05 * OUTPUT_OFFSET, "Entered at {}", first_y);
        assert!(last_y > 0.9 * OUTPUT_OFFSET, "Left at {}", last_y);
        assert!(
            inside.windows(2).all(|w| w[1].1 >= w[0].1 - 1e-12),
            "Plus outcome only moves the particle upwards"
        );

        // Field peaks at the centre and fades towards both faces
        let (peak_at, _, peak) = inside
            .iter()
            .copied()
            .fold((0.0, 0.0, 0.0), |best, s| if s.2 > best.2 { s } else { best });
        assert!(peak > 0.95, "Peak intensity {}", peak);
        assert!((peak_at - center).abs() < 0.1);
        assert!(inside[0].2 < 0.1);

        // Released at the upper output without a jump
        let (_, exit_y, exit_field) = after[0];
        assert!((exit_y - last_y).abs() < 0.05, "Jumped from {} to {}", last_y, exit_y);
        assert_eq!(exit_field, 0.0);
    }

    #[test]
    fn test_quantum_erase_keeps_entangled_pair_consistent() {
        let mut erased = 0;
        for seed in 0..40 {
            let mut exp =
                Experiment::new(SourceKind::Entangled, ExperimentConfig::default().with_seed(seed));
            let splitter = exp
                .attach_new(exp.source(), RIGHT_PORT, Apparatus::analyzer(0.5))
                .unwrap();
            let gate = exp
                .attach_new(splitter, TOP_PORT, Apparatus::gate(true, false))
                .unwrap();
            let eraser = exp
                .attach_new(gate, TOP_PORT, Apparatus::eraser(true))
                .unwrap();
            let control = exp.control();
            exp.apparatus(eraser)
                .unwrap()
                .events
                .on(ApparatusEventKind::Interact, move |_: &ApparatusEvent| control.pause());

            exp.run();
            let mut t = 0.0;
            for _ in 0..MAX_FRAMES {
                if !exp.is_running() || exp.is_paused() {
                    break;
                }
                t += DT;
                exp.animate(t, DT);
            }
            if !exp.is_paused() {
                // Blocked at the gate
                continue;
            }
            erased += 1;

            let right = exp.particle(ParticleId::RIGHT_ATOM).spin();
            let left = exp.particle(ParticleId::LEFT_ATOM).spin();
            match (right, left) {
                (None, None) => {}
                (Some(r), Some(l)) => {
                    let d = normalize_angle(l - r - PI);
                    assert!(d < 1e-9 || TAU - d < 1e-9, "seed {}: {} vs {}", seed, r, l);
                }
                other => panic!("seed {}: partner out of step {:?}", seed, other),
            }
        }
        assert!(erased > 0, "Some particles pass the gate");
    }
}

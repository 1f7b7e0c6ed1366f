//! Per-agent exploration and coordination.
//!
//! A [`SearchController`] drives one agent through [`Mode::Nav`] (waypoint exploration),
//! [`Mode::HotColdSearch`] (climbing a percept gradient), [`Mode::MovingTo`] (walking to a
//! coordinate learned from a peer) and finally [`Mode::MissionCompleted`]. Everything it knows
//! about the world comes from the percepts returned by its [`WorldLink`].

use std::collections::{HashSet, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::AgentConfig;
use crate::direction::Direction;
use crate::engine::ItemOwner;
use crate::link::{LinkError, OwnerReply, Sample, WorldLink};
use crate::navigator::{
    default_separation, generate_waypoints, order_farthest_first, step_plan, waypoint_count,
};
use crate::percept::Percept;
use crate::protocol::{Broadcast, BroadcastKind};
use crate::{AgentId, ItemKind, Position};

/// Replans allowed on one directed walk before the coordinate is dropped.
pub const MAX_DEFLECTIONS: usize = 8;
/// Length of the random move made after each discovery.
pub const SHIFT_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Mode {
    Nav,
    HotColdSearch(ItemKind),
    MovingTo(ItemKind),
    MissionCompleted,
}

/// What an agent knows and plans, as seen by its own control loop.
#[derive(Debug, Clone)]
pub struct NavState {
    pub mode: Mode,
    pub position: Position,
    /// Last direction that was requested while the agent actually moved.
    pub last_direction: Direction,
    pub last_sample: Sample,
    /// Own box, once found.
    pub box_position: Option<Position>,
    pub has_key: bool,
    pub box_unlocked: bool,
    /// Cells excluded from waypoint selection and gradient searches.
    pub forbidden: HashSet<Position>,
    pub visited: HashSet<Position>,
    waypoint: Option<Position>,
    route: VecDeque<Position>,
    steps: VecDeque<Direction>,
}

impl NavState {
    fn new(position: Position, cell_val: f64) -> Self {
        NavState {
            mode: Mode::Nav,
            position,
            last_direction: Direction::Stand,
            last_sample: Sample {
                position,
                value: Some(cell_val),
            },
            box_position: None,
            has_key: false,
            box_unlocked: false,
            forbidden: HashSet::new(),
            visited: HashSet::from([position]),
            waypoint: None,
            route: VecDeque::new(),
            steps: VecDeque::new(),
        }
    }

    fn clear_plan(&mut self) {
        self.waypoint = None;
        self.route.clear();
        self.steps.clear();
    }
}

/// Summary of an agent run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    pub agent_id: AgentId,
    pub steps: u64,
    pub distinct_cells: usize,
    /// Share of the grid visited at least once.
    pub coverage: f64,
    pub discoveries: u64,
    pub broadcasts_sent: u64,
    /// Time from the start of the search to completion, or to the end of the run.
    pub elapsed: Duration,
    pub completed: bool,
}

impl std::fmt::Display for AgentStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "agent {}: {} steps, {} cells ({:.1}%), {} discoveries, {} broadcasts, {:.2?}{}",
            self.agent_id,
            self.steps,
            self.distinct_cells,
            self.coverage * 100.0,
            self.discoveries,
            self.broadcasts_sent,
            self.elapsed,
            if self.completed { ", completed" } else { "" }
        )
    }
}

pub struct SearchController<L: WorldLink> {
    link: L,
    rng: StdRng,
    width: usize,
    height: usize,
    min_separation: f64,
    step_delay: Duration,
    max_steps: Option<u64>,
    stats_interval: u64,
    state: NavState,
    steps: u64,
    discoveries: u64,
    broadcasts_sent: u64,
    started: Instant,
    finished: Option<Duration>,
}

impl<L: WorldLink> SearchController<L> {
    /// Performs the handshake on `link` and prepares the search from the spawn cell.
    pub fn new(mut link: L, config: &AgentConfig) -> Result<Self, LinkError> {
        let initial = link.initial()?;
        link.knowledge().set_position(initial.position);
        let rng = config
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        info!(
            agent = initial.agent_id,
            position = %initial.position,
            width = initial.width,
            height = initial.height,
            "search ready"
        );
        Ok(SearchController {
            link,
            rng,
            width: initial.width,
            height: initial.height,
            min_separation: config
                .min_separation
                .unwrap_or_else(|| default_separation(initial.width, initial.height)),
            step_delay: config.step_delay,
            max_steps: config.max_steps,
            stats_interval: config.stats_interval.max(1),
            state: NavState::new(initial.position, initial.cell_val),
            steps: 0,
            discoveries: 0,
            broadcasts_sent: 0,
            started: Instant::now(),
            finished: None,
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.link.agent_id()
    }

    pub fn state(&self) -> &NavState {
        &self.state
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn is_completed(&self) -> bool {
        self.state.mode == Mode::MissionCompleted
    }

    fn budget_left(&self) -> bool {
        self.max_steps.is_none_or(|max| self.steps < max)
    }

    /// True while another transition may still happen.
    pub fn is_active(&self) -> bool {
        !self.is_completed() && self.budget_left() && self.link.knowledge().is_running()
    }

    pub fn stats(&self) -> AgentStats {
        let area = (self.width * self.height).max(1);
        AgentStats {
            agent_id: self.agent_id(),
            steps: self.steps,
            distinct_cells: self.state.visited.len(),
            coverage: self.state.visited.len() as f64 / area as f64,
            discoveries: self.discoveries,
            broadcasts_sent: self.broadcasts_sent,
            elapsed: self.finished.unwrap_or_else(|| self.started.elapsed()),
            completed: self.is_completed(),
        }
    }

    /// Runs until the mission completes, the step budget runs out or the link stops.
    #[instrument(skip_all, fields(agent = self.agent_id()))]
    pub fn run(mut self) -> Result<AgentStats, LinkError> {
        while self.is_active() {
            self.tick()?;
        }
        let stats = self.stats();
        info!(%stats, "search finished");
        Ok(stats)
    }

    /// Performs one transition of the state machine.
    pub fn tick(&mut self) -> Result<(), LinkError> {
        match self.state.mode {
            Mode::Nav => self.nav_step(),
            Mode::HotColdSearch(kind) => self.hot_cold_search(kind),
            Mode::MovingTo(kind) => self.move_to(kind),
            Mode::MissionCompleted => Ok(()),
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.state.mode != mode {
            debug!(from = ?self.state.mode, to = ?mode, position = %self.state.position, "mode change");
            self.state.mode = mode;
        }
    }

    /// Sends one move and records its outcome. Does nothing once the budget is spent.
    fn step(&mut self, direction: Direction) -> Result<Sample, LinkError> {
        if !self.budget_left() {
            return Ok(self.state.last_sample);
        }
        let sample = self.link.step(direction)?;
        self.steps += 1;
        if sample.position != self.state.position {
            self.state.last_direction = direction;
        }
        self.state.position = sample.position;
        self.state.last_sample = sample;
        self.state.visited.insert(sample.position);
        trace!(?direction, position = %sample.position, percept = ?sample.percept(), "step");

        if self.steps % self.stats_interval == 0 {
            let stats = self.stats();
            info!(%stats, "progress");
        }
        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        Ok(sample)
    }

    /// Coordinate worth walking to right now, learned from a peer or recorded earlier.
    fn pending_target(&self) -> Option<ItemKind> {
        let knowledge = self.link.knowledge();
        if !self.state.has_key && knowledge.remote_location(ItemKind::Key).is_some() {
            return Some(ItemKind::Key);
        }
        if self.state.has_key
            && !self.state.box_unlocked
            && self.target_of(ItemKind::Box).is_some()
        {
            return Some(ItemKind::Box);
        }
        None
    }

    fn target_of(&self, kind: ItemKind) -> Option<Position> {
        let remote = self.link.knowledge().remote_location(kind);
        match kind {
            ItemKind::Key => remote,
            ItemKind::Box => self.state.box_position.or(remote),
        }
    }

    fn nav_step(&mut self) -> Result<(), LinkError> {
        if let Some(kind) = self.pending_target() {
            self.set_mode(Mode::MovingTo(kind));
            return Ok(());
        }
        let direction = self.next_direction();
        let sample = self.step(direction)?;

        if let Some(kind) = self.pending_target() {
            self.set_mode(Mode::MovingTo(kind));
            return Ok(());
        }
        let here = sample.position;
        match sample.percept().effective() {
            Percept::Target if !self.state.forbidden.contains(&here) => self.discover(),
            Percept::ObstacleNeighbour => self.recover_from_obstacle(),
            Percept::KeyNeighbour if !self.state.has_key && !self.state.forbidden.contains(&here) => {
                self.set_mode(Mode::HotColdSearch(ItemKind::Key));
                Ok(())
            }
            Percept::BoxNeighbour
                if self.target_of(ItemKind::Box).is_none()
                    && !self.state.forbidden.contains(&here) =>
            {
                self.set_mode(Mode::HotColdSearch(ItemKind::Box));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Next move of the exploration route, refilling the route when it runs out.
    fn next_direction(&mut self) -> Direction {
        for _ in 0..2 {
            if let Some(direction) = self.state.steps.pop_front() {
                return direction;
            }
            while let Some(waypoint) = self.state.route.pop_front() {
                let (directions, _) = step_plan(self.state.position, waypoint);
                if !directions.is_empty() {
                    self.state.waypoint = Some(waypoint);
                    self.state.steps = directions.into();
                    break;
                }
            }
            if self.state.steps.is_empty() {
                self.refill_route();
            }
        }
        self.state
            .steps
            .pop_front()
            .unwrap_or_else(|| self.random_direction())
    }

    fn refill_route(&mut self) {
        let count = waypoint_count(self.width, self.height);
        let points = generate_waypoints(
            &mut self.rng,
            self.width,
            self.height,
            self.state.position,
            count,
            self.min_separation,
            &self.state.forbidden,
        );
        let route = order_farthest_first(points, self.state.position);
        debug!(?route, "new waypoints");
        self.state.route = route.into();
    }

    fn random_direction(&mut self) -> Direction {
        let (position, width, height) = (self.state.position, self.width, self.height);
        let moves: Vec<Direction> = Direction::MOVES
            .into_iter()
            .filter(|d| d.apply(position, width, height).is_some())
            .collect();
        moves.choose(&mut self.rng).copied().unwrap_or(Direction::Stand)
    }

    /// Backs off twice along the reverse of the last move, sidesteps once clockwise of that
    /// reverse, then drops the route so a fresh one is drawn.
    fn recover_from_obstacle(&mut self) -> Result<(), LinkError> {
        let back = self.state.last_direction.opposite();
        debug!(position = %self.state.position, ?back, "obstacle ahead, backing off");
        self.step(back)?;
        self.step(back)?;
        self.step(back.clockwise())?;
        self.state.clear_plan();
        Ok(())
    }

    /// Climbs the percept gradient around the current cell.
    ///
    /// Probes the eight neighbours in a fixed order, stepping back after each probe that
    /// does not improve the reading. A strictly better reading becomes the new origin and the
    /// scan restarts from there. Reaching a target hands over to discovery; a full scan
    /// without improvement ends the search.
    fn hot_cold_search(&mut self, kind: ItemKind) -> Result<(), LinkError> {
        let mut best = self.state.last_sample.signal();
        let max_restarts = self.width * self.height;
        let mut restarts = 0;
        debug!(%kind, origin = %self.state.position, best, "hot/cold search");

        'scan: while restarts <= max_restarts && self.budget_left() {
            for direction in Direction::MOVES {
                if direction
                    .apply(self.state.position, self.width, self.height)
                    .is_none()
                {
                    continue;
                }
                let origin = self.state.position;
                let sample = self.step(direction)?;
                if sample.position == origin {
                    continue;
                }
                if sample.percept().effective() == Percept::Target {
                    if self.state.forbidden.contains(&sample.position) {
                        self.step(direction.opposite())?;
                        continue;
                    }
                    self.discover()?;
                    if !self.is_completed() {
                        self.set_mode(Mode::Nav);
                    }
                    return Ok(());
                }
                if sample.signal() > best {
                    best = sample.signal();
                    restarts += 1;
                    continue 'scan;
                }
                self.step(direction.opposite())?;
            }
            break;
        }
        debug!(%kind, position = %self.state.position, "hot/cold search gave up");
        self.set_mode(Mode::Nav);
        Ok(())
    }

    /// Walks straight to the known coordinate of `kind` and handles what is found there.
    fn move_to(&mut self, kind: ItemKind) -> Result<(), LinkError> {
        let Some(target) = self.target_of(kind) else {
            self.set_mode(Mode::Nav);
            return Ok(());
        };
        debug!(%kind, %target, from = %self.state.position, "heading to known coordinate");

        let mut plan: VecDeque<Direction> = step_plan(self.state.position, target).0.into();
        let mut deflections = 0;
        while self.state.position != target {
            if !self.budget_left() {
                return Ok(());
            }
            let Some(direction) = plan.pop_front() else {
                plan = step_plan(self.state.position, target).0.into();
                if plan.is_empty() {
                    break;
                }
                continue;
            };
            let before = self.state.position.distance(&target);
            self.step(direction)?;
            let after = self.state.position.distance(&target);
            if after < before {
                continue;
            }
            if after > before {
                self.step(direction.opposite())?;
            }
            deflections += 1;
            if deflections > MAX_DEFLECTIONS {
                warn!(%kind, %target, "could not reach coordinate");
                break;
            }
            plan = step_plan(self.state.position, target).0.into();
        }

        let arrived = self.state.position == target;
        if arrived && self.state.last_sample.percept() == Percept::Unknown {
            self.step(Direction::Stand)?;
        }
        match self.state.last_sample.percept() {
            Percept::Target if arrived => self.discover()?,
            Percept::Unknown => {
                warn!(%kind, %target, arrived, "reading lost, keeping the coordinate");
            }
            _ => {
                info!(%kind, %target, arrived, "nothing at known coordinate, forgetting it");
                self.forget(kind);
            }
        }
        if !self.is_completed() {
            self.set_mode(Mode::Nav);
        }
        Ok(())
    }

    fn forget(&mut self, kind: ItemKind) {
        self.link.knowledge().forget_remote(kind);
        if kind == ItemKind::Box {
            self.state.box_position = None;
        }
    }

    /// Resolves the item under the agent.
    fn discover(&mut self) -> Result<(), LinkError> {
        let position = self.state.position;
        let owner = match self.link.item_owner()? {
            OwnerReply::Unknown => {
                warn!(%position, "ownership query timed out, will retry on next visit");
                return Ok(());
            }
            OwnerReply::NoOwner => None,
            OwnerReply::Owner(owner) => Some(owner),
        };
        self.forbid_around(position);

        match owner {
            None => debug!(%position, "target without an owner"),
            Some(ItemOwner { owner, kind }) if owner == self.agent_id() => {
                self.discoveries += 1;
                info!(%kind, %position, "found own item");
                match kind {
                    ItemKind::Key => {
                        self.state.has_key = true;
                        self.link.knowledge().forget_remote(ItemKind::Key);
                    }
                    ItemKind::Box => {
                        self.state.box_position = Some(position);
                        self.link.knowledge().forget_remote(ItemKind::Box);
                        if self.state.has_key {
                            self.state.box_unlocked = true;
                        }
                    }
                }
                if self.state.has_key && self.state.box_unlocked {
                    return self.complete();
                }
            }
            Some(ItemOwner { owner, kind }) => {
                self.discoveries += 1;
                info!(%kind, %position, owner, "found a peer's item, telling its owner");
                let notice = Broadcast {
                    kind: BroadcastKind::discovered(kind),
                    position,
                    owner,
                    sender: self.agent_id(),
                };
                self.link.broadcast(notice)?;
                self.broadcasts_sent += 1;
            }
        }
        self.random_shift()
    }

    fn forbid_around(&mut self, center: Position) {
        for y in center.y.saturating_sub(1)..=(center.y + 1).min(self.height - 1) {
            for x in center.x.saturating_sub(1)..=(center.x + 1).min(self.width - 1) {
                self.state.forbidden.insert(Position::new(x, y));
            }
        }
    }

    /// Moves [`SHIFT_LENGTH`] cells in a random direction that stays on the grid, then
    /// replans toward the current waypoint.
    fn random_shift(&mut self) -> Result<(), LinkError> {
        let (position, width, height) = (self.state.position, self.width, self.height);
        let fits = |direction: Direction| {
            (0..SHIFT_LENGTH)
                .try_fold(position, |p, _| direction.apply(p, width, height))
                .is_some()
        };
        let choices: Vec<Direction> = Direction::MOVES.into_iter().filter(|&d| fits(d)).collect();
        if let Some(&direction) = choices.choose(&mut self.rng) {
            for _ in 0..SHIFT_LENGTH {
                self.step(direction)?;
            }
        }
        self.state.steps.clear();
        if let Some(waypoint) = self.state.waypoint {
            self.state.steps = step_plan(self.state.position, waypoint).0.into();
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<(), LinkError> {
        debug_assert!(self.state.has_key && self.state.box_unlocked);
        let elapsed = self.started.elapsed();
        self.finished = Some(elapsed);
        self.set_mode(Mode::MissionCompleted);
        info!(?elapsed, steps = self.steps, "mission completed");
        let me = self.agent_id();
        self.link.broadcast(Broadcast {
            kind: BroadcastKind::Completed,
            position: self.state.position,
            owner: me,
            sender: me,
        })?;
        self.broadcasts_sent += 1;
        Ok(())
    }
}

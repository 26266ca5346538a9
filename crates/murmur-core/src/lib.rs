//! Core types for the Murmur flocking simulation.
//!
//! One tick is strictly two-phase: every agent's steering forces are computed
//! against the pre-tick snapshot of the whole flock, and only then is any
//! agent's velocity or position touched. The force phase has no cross-agent
//! write dependencies and runs in parallel.

use murmur_index::{BruteForceIndex, NeighborhoodIndex};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};
use thiserror::Error;
use tracing::debug;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Monotonic tick counter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// 2D vector used for positions, velocities, and steering forces.
///
/// Degenerate inputs are absorbed rather than surfaced: [`Vec2::normalized`]
/// and [`Vec2::with_length`] on a zero-length vector return the zero vector
/// instead of dividing by zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    /// The zero vector.
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Unit vector pointing along `angle` radians.
    #[must_use]
    pub fn from_angle(angle: f32) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    /// Dot product.
    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// Squared Euclidean length.
    #[must_use]
    pub fn length_squared(self) -> f32 {
        self.dot(self)
    }

    /// Euclidean length.
    #[must_use]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Angle of the vector in radians; `0.0` for the zero vector.
    #[must_use]
    pub fn heading(self) -> f32 {
        self.y.atan2(self.x)
    }

    /// Unit vector with the same direction, or zero for the zero vector.
    #[must_use]
    pub fn normalized(self) -> Self {
        self.with_length(1.0)
    }

    /// Rescale to `target` length, or zero for the zero vector.
    #[must_use]
    pub fn with_length(self, target: f32) -> Self {
        let len = self.length();
        if len > 0.0 { self * (target / len) } else { Self::ZERO }
    }

    /// Shorten to `max` length; a no-op when already at or under the limit.
    #[must_use]
    pub fn clamp_length(self, max: f32) -> Self {
        let len = self.length();
        if len > max { self * (max / len) } else { self }
    }
}

impl Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Vec2 {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for Vec2 {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

/// Multipliers applied to the four raw steering forces.
///
/// Any finite value is accepted; a negative weight inverts the force.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SteeringWeights {
    pub cohesion: f32,
    pub avoidance: f32,
    pub following: f32,
    pub obstacle: f32,
}

impl Default for SteeringWeights {
    fn default() -> Self {
        Self {
            cohesion: 1.0,
            avoidance: 1.0,
            following: 1.0,
            obstacle: 1.0,
        }
    }
}

/// Tunable perception and steering limits carried by each agent.
///
/// Every agent is seeded from [`FlockConfig`] at spawn, but the column is
/// mutable: a heterogeneous flock keeps the same invariants because the apply
/// phase clamps each agent against its own limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentParams {
    /// Upper bound on speed, enforced at the end of every tick.
    pub max_speed: f32,
    /// Upper bound on the length of each steering correction.
    pub max_force: f32,
    /// Perception radius for cohesion and following.
    pub follow_radius: f32,
    /// Perception radius for avoidance; conventionally smaller than
    /// `follow_radius`, though nothing enforces that.
    pub avoid_radius: f32,
    /// Force multipliers.
    pub weights: SteeringWeights,
}

impl AgentParams {
    /// Copy the shared limits out of a configuration.
    #[must_use]
    pub fn from_config(config: &FlockConfig) -> Self {
        Self {
            max_speed: config.max_speed,
            max_force: config.max_force,
            follow_radius: config.follow_radius,
            avoid_radius: config.avoid_radius,
            weights: config.weights,
        }
    }
}

impl Default for AgentParams {
    fn default() -> Self {
        Self::from_config(&FlockConfig::default())
    }
}

/// Scalar fields for a single agent used when inserting or snapshotting from
/// the SoA store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Vec2,
    pub velocity: Vec2,
    pub params: AgentParams,
}

impl AgentData {
    /// Creates a new agent payload.
    #[must_use]
    pub const fn new(position: Vec2, velocity: Vec2, params: AgentParams) -> Self {
        Self {
            position,
            velocity,
            params,
        }
    }
}

/// Render-facing view of one agent: where it is and which way it points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentPose {
    pub position: Vec2,
    /// Angle of the velocity vector; `0.0` when the agent is at rest.
    pub heading: f32,
}

/// Static point hazard that deflects passing agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Obstacle {
    pub position: Vec2,
    /// Perpendicular-distance threshold for deflection.
    pub affect_radius: f32,
}

impl Obstacle {
    /// Creates an obstacle at `position` with the given effect radius.
    #[must_use]
    pub const fn new(position: Vec2, affect_radius: f32) -> Self {
        Self {
            position,
            affect_radius,
        }
    }
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Vec2>,
    velocities: Vec<Vec2>,
    params: Vec<AgentParams>,
}

impl AgentColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            params: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve additional capacity in each backing vector.
    pub fn reserve(&mut self, additional: usize) {
        self.positions.reserve(additional);
        self.velocities.reserve(additional);
        self.params.reserve(additional);
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.params.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData) {
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.params.push(agent.params);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            velocity: self.velocities[index],
            params: self.params[index],
        }
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Vec2] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Vec2] {
        &mut self.positions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Vec2] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Vec2] {
        &mut self.velocities
    }

    /// Immutable access to per-agent parameters.
    #[must_use]
    pub fn params(&self) -> &[AgentParams] {
        &self.params
    }

    /// Mutable access to per-agent parameters.
    #[must_use]
    pub fn params_mut(&mut self) -> &mut [AgentParams] {
        &mut self.params
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.params.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
///
/// The flock only grows: agents are inserted at construction (or explicitly
/// by the caller) and live until the world is rebuilt, so the arena carries
/// no removal path.
#[derive(Debug)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl Default for AgentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: AgentColumns::new(),
        }
    }

    /// Create an arena with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: AgentColumns::with_capacity(capacity),
        }
    }

    /// Number of active agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no agents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Reserve space for additional agents.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
        self.handles.reserve(additional);
        self.columns.reserve(additional);
    }

    /// Iterate over active agent handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored agents.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Errors that can occur when constructing or reconfiguring a flock.
#[derive(Debug, Error)]
pub enum FlockError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a flock world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlockConfig {
    /// Number of agents spawned at construction. Zero is legal and yields a
    /// simulation whose ticks do nothing beyond advancing the counter.
    pub num_boids: usize,
    /// Width of the domain in world units.
    pub world_width: f32,
    /// Height of the domain in world units.
    pub world_height: f32,
    /// Shared speed cap; zero freezes the flock in place.
    pub max_speed: f32,
    /// Shared steering cap; zero disables all clamped steering.
    pub max_force: f32,
    /// Perception radius for cohesion and following.
    pub follow_radius: f32,
    /// Perception radius for avoidance.
    pub avoid_radius: f32,
    /// Effect radius given to newly placed obstacles.
    pub obstacle_affect_radius: f32,
    /// Force multipliers shared by the initial flock.
    pub weights: SteeringWeights,
    /// Speed given to freshly spawned agents along a random heading.
    pub spawn_speed: f32,
    /// Half-width of the square the per-tick noise vector is drawn from.
    pub noise_amplitude: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            num_boids: 120,
            world_width: 800.0,
            world_height: 600.0,
            max_speed: 4.0,
            max_force: 0.4,
            follow_radius: 60.0,
            avoid_radius: 24.0,
            obstacle_affect_radius: 32.0,
            weights: SteeringWeights::default(),
            spawn_speed: 2.0,
            noise_amplitude: 0.1,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl FlockConfig {
    /// Check every field once; construction refuses invalid values so the
    /// tick loop never has to.
    pub fn validate(&self) -> Result<(), FlockError> {
        if !(self.world_width.is_finite() && self.world_width > 0.0)
            || !(self.world_height.is_finite() && self.world_height > 0.0)
        {
            return Err(FlockError::InvalidConfig(
                "domain dimensions must be positive and finite",
            ));
        }
        if !self.max_speed.is_finite() || self.max_speed < 0.0 {
            return Err(FlockError::InvalidConfig(
                "max_speed must be finite and non-negative",
            ));
        }
        if !self.max_force.is_finite() || self.max_force < 0.0 {
            return Err(FlockError::InvalidConfig(
                "max_force must be finite and non-negative",
            ));
        }
        if !self.follow_radius.is_finite()
            || self.follow_radius < 0.0
            || !self.avoid_radius.is_finite()
            || self.avoid_radius < 0.0
        {
            return Err(FlockError::InvalidConfig(
                "perception radii must be finite and non-negative",
            ));
        }
        if !self.obstacle_affect_radius.is_finite() || self.obstacle_affect_radius < 0.0 {
            return Err(FlockError::InvalidConfig(
                "obstacle_affect_radius must be finite and non-negative",
            ));
        }
        if !self.spawn_speed.is_finite() || self.spawn_speed < 0.0 {
            return Err(FlockError::InvalidConfig(
                "spawn_speed must be finite and non-negative",
            ));
        }
        if !self.noise_amplitude.is_finite() || self.noise_amplitude < 0.0 {
            return Err(FlockError::InvalidConfig(
                "noise_amplitude must be finite and non-negative",
            ));
        }
        let weights = &self.weights;
        if !(weights.cohesion.is_finite()
            && weights.avoidance.is_finite()
            && weights.following.is_finite()
            && weights.obstacle.is_finite())
        {
            return Err(FlockError::InvalidConfig(
                "steering weights must be finite",
            ));
        }
        if self.history_capacity == 0 {
            return Err(FlockError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, generating a seed from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Aggregate measurements recorded at the end of each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub agent_count: usize,
    pub obstacle_count: usize,
    pub average_speed: f32,
    pub fastest_speed: f32,
}

/// Clamped seek primitive shared by cohesion, avoidance, and following:
/// scale `desired` to cruising speed, subtract the current velocity, clamp
/// the correction to `max_force`.
///
/// A zero desired vector returns exactly zero.
#[must_use]
pub fn steer(desired: Vec2, velocity: Vec2, max_speed: f32, max_force: f32) -> Vec2 {
    if desired == Vec2::ZERO {
        return Vec2::ZERO;
    }
    (desired.with_length(max_speed) - velocity).clamp_length(max_force)
}

/// Deflection away from the closest obstacle crossing the travel line.
///
/// Candidates are obstacles whose perpendicular offset from the velocity
/// direction is shorter than their effect radius; among those, only the one
/// at minimum displacement distance contributes. The result is a bare unit
/// vector: it is not run through [`steer`] and is therefore not clamped by
/// `max_force`. A zero velocity means no obstacle check applies.
#[must_use]
pub fn obstacle_deflection(position: Vec2, velocity: Vec2, obstacles: &[Obstacle]) -> Vec2 {
    let direction = velocity.normalized();
    if direction == Vec2::ZERO {
        return Vec2::ZERO;
    }
    let mut closest: Option<(f32, Vec2)> = None;
    for obstacle in obstacles {
        let displacement = obstacle.position - position;
        let perpendicular = displacement - direction * displacement.dot(direction);
        if perpendicular.length() < obstacle.affect_radius {
            let dist_sq = displacement.length_squared();
            let replace = match closest {
                Some((best, _)) => dist_sq < best,
                None => true,
            };
            if replace {
                closest = Some((dist_sq, perpendicular));
            }
        }
    }
    match closest {
        Some((_, perpendicular)) => -perpendicular.normalized(),
        None => Vec2::ZERO,
    }
}

/// The four raw steering forces computed for one agent against the pre-tick
/// snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawForces {
    pub cohesion: Vec2,
    pub avoidance: Vec2,
    pub following: Vec2,
    pub obstacle: Vec2,
}

impl RawForces {
    /// Combine the forces into a single velocity delta.
    #[must_use]
    pub fn weighted(&self, weights: &SteeringWeights) -> Vec2 {
        self.cohesion * weights.cohesion
            + self.avoidance * weights.avoidance
            + self.following * weights.following
            + self.obstacle * weights.obstacle
    }
}

/// Compute the raw steering forces for `agent_idx`.
///
/// `positions` and `velocities` are the pre-tick snapshot of the whole flock
/// and `index` must have been rebuilt from the same positions. The function
/// reads shared state only, so it is safe to evaluate for all agents in
/// parallel.
#[must_use]
pub fn compute_raw_forces(
    agent_idx: usize,
    positions: &[Vec2],
    velocities: &[Vec2],
    params: &AgentParams,
    obstacles: &[Obstacle],
    index: &BruteForceIndex,
) -> RawForces {
    let position = positions[agent_idx];
    let velocity = velocities[agent_idx];
    let follow_sq = params.follow_radius * params.follow_radius;
    let avoid_sq = params.avoid_radius * params.avoid_radius;

    // Cohesion: steer toward the mean position of the flock-mates in view.
    // The acting agent's own position passes the strict radius test at
    // distance zero and is counted in the mean; avoidance and following
    // below skip self. The asymmetry is intentional.
    let mut center = Vec2::ZERO;
    let mut cohesion_count = 0usize;
    index.neighbors_within(
        agent_idx,
        follow_sq,
        &mut |other_idx, _dist_sq: OrderedFloat<f32>| {
            center += positions[other_idx];
            cohesion_count += 1;
        },
    );
    if params.follow_radius > 0.0 {
        center += position;
        cohesion_count += 1;
    }
    let cohesion = if cohesion_count > 0 {
        let mean = center * (1.0 / cohesion_count as f32);
        steer(mean - position, velocity, params.max_speed, params.max_force)
    } else {
        Vec2::ZERO
    };

    // Avoidance: inverse-distance repulsion away from each crowding neighbor.
    let mut repulsion = Vec2::ZERO;
    index.neighbors_within(
        agent_idx,
        avoid_sq,
        &mut |other_idx, dist_sq: OrderedFloat<f32>| {
            let dist = dist_sq.into_inner().sqrt();
            if dist > 0.0 {
                let away = (positions[other_idx] - position).normalized();
                repulsion -= away * (1.0 / dist);
            }
        },
    );
    let avoidance = steer(repulsion, velocity, params.max_speed, params.max_force);

    // Following: match the mean velocity of the flock-mates in view.
    let mut mean_velocity = Vec2::ZERO;
    let mut following_count = 0usize;
    index.neighbors_within(
        agent_idx,
        follow_sq,
        &mut |other_idx, _dist_sq: OrderedFloat<f32>| {
            mean_velocity += velocities[other_idx];
            following_count += 1;
        },
    );
    let following = if following_count > 0 {
        let mean = mean_velocity * (1.0 / following_count as f32);
        steer(mean, velocity, params.max_speed, params.max_force)
    } else {
        Vec2::ZERO
    };

    let obstacle = obstacle_deflection(position, velocity, obstacles);

    RawForces {
        cohesion,
        avoidance,
        following,
        obstacle,
    }
}

/// Aggregate world state: the flock, the obstacle registry, and the tick loop.
pub struct FlockWorld {
    config: FlockConfig,
    tick: Tick,
    rng: SmallRng,
    agents: AgentArena,
    obstacles: Vec<Obstacle>,
    pending_obstacles: Vec<Obstacle>,
    index: BruteForceIndex,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for FlockWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlockWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("obstacle_count", &self.obstacles.len())
            .finish()
    }
}

impl FlockWorld {
    /// Instantiate a new world and spawn the initial flock.
    ///
    /// Resetting a simulation is reconstruction: build a fresh world with the
    /// same (or edited) configuration rather than mutating a live one.
    pub fn new(config: FlockConfig) -> Result<Self, FlockError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let num_boids = config.num_boids;
        let history_capacity = config.history_capacity;
        let mut world = Self {
            config,
            tick: Tick::zero(),
            rng,
            agents: AgentArena::with_capacity(num_boids),
            obstacles: Vec::new(),
            pending_obstacles: Vec::new(),
            index: BruteForceIndex::new(),
            history: VecDeque::with_capacity(history_capacity),
        };
        world.spawn_flock();
        debug!(
            agents = world.agents.len(),
            width = world.config.world_width,
            height = world.config.world_height,
            "flock world initialised"
        );
        Ok(world)
    }

    fn spawn_flock(&mut self) {
        for _ in 0..self.config.num_boids {
            let agent = self.random_agent();
            self.agents.insert(agent);
        }
    }

    /// Uniform random position, random heading, fixed spawn speed.
    fn random_agent(&mut self) -> AgentData {
        let x = self.rng.random_range(0.0..self.config.world_width);
        let y = self.rng.random_range(0.0..self.config.world_height);
        let heading = self.rng.random_range(0.0..std::f32::consts::TAU);
        AgentData {
            position: Vec2::new(x, y),
            velocity: Vec2::from_angle(heading) * self.config.spawn_speed,
            params: AgentParams::from_config(&self.config),
        }
    }

    /// Execute one simulation tick.
    ///
    /// Queued obstacles are committed first, then every agent's forces are
    /// computed against the pre-tick snapshot, and only afterwards are
    /// velocities and positions updated and wrapped.
    pub fn advance(&mut self) {
        let next_tick = self.tick.next();
        self.stage_obstacle_commit();
        let deltas = self.stage_forces();
        self.stage_apply(&deltas);
        self.stage_summary(next_tick);
        self.tick = next_tick;
    }

    fn stage_obstacle_commit(&mut self) {
        if self.pending_obstacles.is_empty() {
            return;
        }
        debug!(
            count = self.pending_obstacles.len(),
            "committing queued obstacles"
        );
        self.obstacles.append(&mut self.pending_obstacles);
    }

    /// Read-only force phase: one velocity delta per agent, order-independent.
    fn stage_forces(&mut self) -> Vec<Vec2> {
        let agent_count = self.agents.len();
        if agent_count == 0 {
            return Vec::new();
        }

        let position_pairs: Vec<(f32, f32)> = self
            .agents
            .columns()
            .positions()
            .iter()
            .map(|p| (p.x, p.y))
            .collect();
        self.index.rebuild(&position_pairs);

        // Noise is sampled serially from the world RNG so determinism never
        // depends on thread scheduling.
        let amplitude = self.config.noise_amplitude;
        let noise: Vec<Vec2> = (0..agent_count)
            .map(|_| self.sample_noise(amplitude))
            .collect();

        let columns = self.agents.columns();
        let positions = columns.positions();
        let velocities = columns.velocities();
        let params = columns.params();
        let obstacles = self.obstacles.as_slice();
        let index = &self.index;

        (0..agent_count)
            .into_par_iter()
            .map(|idx| {
                let agent_params = &params[idx];
                let forces = compute_raw_forces(
                    idx,
                    positions,
                    velocities,
                    agent_params,
                    obstacles,
                    index,
                );
                forces.weighted(&agent_params.weights) + noise[idx]
            })
            .collect()
    }

    fn sample_noise(&mut self, amplitude: f32) -> Vec2 {
        if amplitude > 0.0 {
            Vec2::new(
                self.rng.random_range(-amplitude..amplitude),
                self.rng.random_range(-amplitude..amplitude),
            )
        } else {
            Vec2::ZERO
        }
    }

    /// Apply phase: integrate each agent against its own limits, then wrap.
    fn stage_apply(&mut self, deltas: &[Vec2]) {
        if deltas.is_empty() {
            return;
        }
        let width = self.config.world_width;
        let height = self.config.world_height;

        let params: Vec<AgentParams> = self.agents.columns().params().to_vec();
        {
            let velocities = self.agents.columns_mut().velocities_mut();
            for (idx, delta) in deltas.iter().enumerate() {
                velocities[idx] = (velocities[idx] + *delta).clamp_length(params[idx].max_speed);
            }
        }
        {
            let velocities: Vec<Vec2> = self.agents.columns().velocities().to_vec();
            let positions = self.agents.columns_mut().positions_mut();
            for (idx, velocity) in velocities.iter().enumerate() {
                let next = positions[idx] + *velocity;
                positions[idx] = Vec2::new(
                    Self::wrap_coordinate(next.x, width),
                    Self::wrap_coordinate(next.y, height),
                );
            }
        }
    }

    /// Hard teleport wrap, applied to both axes independently every tick: a
    /// coordinate at or past the upper bound restarts at zero, a negative
    /// coordinate restarts at the upper bound itself. In-range coordinates
    /// pass through unchanged.
    fn wrap_coordinate(value: f32, extent: f32) -> f32 {
        if value >= extent {
            0.0
        } else if value < 0.0 {
            extent
        } else {
            value
        }
    }

    fn stage_summary(&mut self, next_tick: Tick) {
        let agent_count = self.agents.len();
        let mut total_speed = 0.0_f32;
        let mut fastest_speed = 0.0_f32;
        for velocity in self.agents.columns().velocities() {
            let speed = velocity.length();
            total_speed += speed;
            if speed > fastest_speed {
                fastest_speed = speed;
            }
        }
        let average_speed = if agent_count > 0 {
            total_speed / agent_count as f32
        } else {
            0.0
        };
        let summary = TickSummary {
            tick: next_tick,
            agent_count,
            obstacle_count: self.obstacles.len(),
            average_speed,
            fastest_speed,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Queue an obstacle at `position` with the configured effect radius.
    ///
    /// The obstacle joins the registry at the start of the next tick, so
    /// placement can never race a tick in progress.
    pub fn add_obstacle(&mut self, position: Vec2) {
        let obstacle = Obstacle::new(position, self.config.obstacle_affect_radius);
        debug!(x = position.x, y = position.y, "obstacle queued");
        self.pending_obstacles.push(obstacle);
    }

    /// Update the wrap bounds. Existing agents are not repositioned; an agent
    /// left outside the new domain is teleported by the next boundary pass.
    pub fn set_domain_size(&mut self, width: f32, height: f32) -> Result<(), FlockError> {
        if !(width.is_finite() && width > 0.0 && height.is_finite() && height > 0.0) {
            return Err(FlockError::InvalidConfig(
                "domain dimensions must be positive and finite",
            ));
        }
        self.config.world_width = width;
        self.config.world_height = height;
        debug!(width, height, "domain resized");
        Ok(())
    }

    /// Spawn a single agent, returning its handle.
    pub fn spawn_agent(&mut self, agent: AgentData) -> AgentId {
        self.agents.insert(agent)
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Mutable access to the agent arena (per-agent parameter edits).
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut AgentArena {
        &mut self.agents
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Committed obstacles, in placement order.
    #[must_use]
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    /// Number of committed obstacles.
    #[must_use]
    pub fn obstacle_count(&self) -> usize {
        self.obstacles.len()
    }

    /// Render-facing view of every agent as of the end of the last tick.
    pub fn poses(&self) -> impl Iterator<Item = AgentPose> + '_ {
        let columns = self.agents.columns();
        columns
            .positions()
            .iter()
            .zip(columns.velocities())
            .map(|(position, velocity)| AgentPose {
                position: *position,
                heading: velocity.heading(),
            })
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentData> {
        self.agents.snapshot(id)
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// The most recent tick summary, if any tick has run.
    #[must_use]
    pub fn last_summary(&self) -> Option<&TickSummary> {
        self.history.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> FlockConfig {
        FlockConfig {
            num_boids: 0,
            noise_amplitude: 0.0,
            rng_seed: Some(7),
            ..FlockConfig::default()
        }
    }

    fn still_agent(x: f32, y: f32, config: &FlockConfig) -> AgentData {
        AgentData::new(Vec2::new(x, y), Vec2::ZERO, AgentParams::from_config(config))
    }

    fn rebuilt_index(positions: &[Vec2]) -> BruteForceIndex {
        let pairs: Vec<(f32, f32)> = positions.iter().map(|p| (p.x, p.y)).collect();
        let mut index = BruteForceIndex::new();
        index.rebuild(&pairs);
        index
    }

    #[test]
    fn normalizing_the_zero_vector_yields_zero() {
        assert_eq!(Vec2::ZERO.normalized(), Vec2::ZERO);
        assert_eq!(Vec2::ZERO.with_length(5.0), Vec2::ZERO);
    }

    #[test]
    fn with_length_rescales_nonzero_vectors() {
        let scaled = Vec2::new(3.0, 4.0).with_length(10.0);
        assert!((scaled.length() - 10.0).abs() < 1e-5);
        assert!((scaled.x - 6.0).abs() < 1e-5);
        assert!((scaled.y - 8.0).abs() < 1e-5);
    }

    #[test]
    fn clamp_length_is_a_noop_within_the_limit() {
        let v = Vec2::new(1.0, 2.0);
        assert_eq!(v.clamp_length(5.0), v);
        assert_eq!(v.clamp_length(v.length()), v);
    }

    #[test]
    fn clamp_length_shortens_long_vectors() {
        let clamped = Vec2::new(30.0, 40.0).clamp_length(5.0);
        assert!((clamped.length() - 5.0).abs() < 1e-5);
        assert_eq!(Vec2::new(3.0, 4.0).clamp_length(0.0), Vec2::ZERO);
    }

    #[test]
    fn heading_matches_atan2_and_is_zero_at_rest() {
        assert_eq!(Vec2::ZERO.heading(), 0.0);
        let angle = Vec2::new(0.0, 2.0).heading();
        assert!((angle - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn steer_on_zero_desired_is_exactly_zero() {
        let steered = steer(Vec2::ZERO, Vec2::new(3.0, -1.0), 4.0, 0.4);
        assert_eq!(steered, Vec2::ZERO);
    }

    #[test]
    fn steer_clamps_to_max_force() {
        let steered = steer(Vec2::new(100.0, 0.0), Vec2::new(0.0, -4.0), 4.0, 0.4);
        assert!(steered.length() <= 0.4 + 1e-5);
        assert_eq!(
            steer(Vec2::new(1.0, 1.0), Vec2::ZERO, 4.0, 0.0),
            Vec2::ZERO
        );
    }

    #[test]
    fn wrap_leaves_in_range_coordinates_untouched() {
        assert_eq!(FlockWorld::wrap_coordinate(0.0, 800.0), 0.0);
        assert_eq!(FlockWorld::wrap_coordinate(123.5, 800.0), 123.5);
        assert_eq!(FlockWorld::wrap_coordinate(799.9, 800.0), 799.9);
    }

    #[test]
    fn wrap_teleports_out_of_range_coordinates() {
        assert_eq!(FlockWorld::wrap_coordinate(800.0, 800.0), 0.0);
        assert_eq!(FlockWorld::wrap_coordinate(805.0, 800.0), 0.0);
        assert_eq!(FlockWorld::wrap_coordinate(-5.0, 800.0), 800.0);
    }

    #[test]
    fn default_config_validates() {
        assert!(FlockConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let cases = [
            FlockConfig {
                world_width: 0.0,
                ..FlockConfig::default()
            },
            FlockConfig {
                world_height: f32::NAN,
                ..FlockConfig::default()
            },
            FlockConfig {
                max_speed: -1.0,
                ..FlockConfig::default()
            },
            FlockConfig {
                max_force: f32::INFINITY,
                ..FlockConfig::default()
            },
            FlockConfig {
                avoid_radius: -0.5,
                ..FlockConfig::default()
            },
            FlockConfig {
                obstacle_affect_radius: -2.0,
                ..FlockConfig::default()
            },
            FlockConfig {
                spawn_speed: f32::NAN,
                ..FlockConfig::default()
            },
            FlockConfig {
                noise_amplitude: -0.1,
                ..FlockConfig::default()
            },
            FlockConfig {
                weights: SteeringWeights {
                    cohesion: f32::NAN,
                    ..SteeringWeights::default()
                },
                ..FlockConfig::default()
            },
            FlockConfig {
                history_capacity: 0,
                ..FlockConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(FlockError::InvalidConfig(_))),
                "expected rejection for {config:?}"
            );
        }
    }

    #[test]
    fn arena_insert_allocates_unique_handles() {
        let mut arena = AgentArena::new();
        let config = FlockConfig::default();
        let a = arena.insert(still_agent(0.0, 1.0, &config));
        let b = arena.insert(still_agent(2.0, 3.0, &config));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert!(arena.contains(a));
        assert_eq!(arena.index_of(b), Some(1));

        let snapshot = arena.snapshot(b).expect("snapshot");
        assert_eq!(snapshot.position, Vec2::new(2.0, 3.0));

        arena.clear();
        assert!(arena.is_empty());
        assert!(!arena.contains(a));
    }

    #[test]
    fn world_spawns_flock_inside_the_domain() {
        let config = FlockConfig {
            num_boids: 40,
            rng_seed: Some(11),
            ..FlockConfig::default()
        };
        let world = FlockWorld::new(config.clone()).expect("world");
        assert_eq!(world.agent_count(), 40);
        assert_eq!(world.tick(), Tick(0));
        assert!(world.obstacles().is_empty());

        let columns = world.agents().columns();
        for position in columns.positions() {
            assert!(position.x >= 0.0 && position.x < config.world_width);
            assert!(position.y >= 0.0 && position.y < config.world_height);
        }
        for velocity in columns.velocities() {
            assert!((velocity.length() - config.spawn_speed).abs() < 1e-4);
        }
    }

    #[test]
    fn empty_flock_advances_without_agents() {
        let mut world = FlockWorld::new(quiet_config()).expect("world");
        world.advance();
        world.advance();
        assert_eq!(world.tick(), Tick(2));
        assert_eq!(world.agent_count(), 0);
        let summary = world.last_summary().expect("summary");
        assert_eq!(summary.agent_count, 0);
        assert_eq!(summary.average_speed, 0.0);
    }

    #[test]
    fn queued_obstacles_commit_at_the_next_tick() {
        let config = quiet_config();
        let mut world = FlockWorld::new(config.clone()).expect("world");
        world.add_obstacle(Vec2::new(10.0, 20.0));
        assert_eq!(world.obstacle_count(), 0);

        world.advance();
        assert_eq!(world.obstacle_count(), 1);
        let obstacle = world.obstacles()[0];
        assert_eq!(obstacle.position, Vec2::new(10.0, 20.0));
        assert_eq!(obstacle.affect_radius, config.obstacle_affect_radius);
    }

    #[test]
    fn isolated_agent_has_zero_raw_forces() {
        let positions = [Vec2::new(50.0, 50.0)];
        let velocities = [Vec2::new(1.0, 0.0)];
        let params = AgentParams::default();
        let index = rebuilt_index(&positions);

        let forces = compute_raw_forces(0, &positions, &velocities, &params, &[], &index);
        assert_eq!(forces, RawForces::default());
    }

    #[test]
    fn cohesion_steers_toward_a_neighbor() {
        let positions = [Vec2::new(0.0, 0.0), Vec2::new(20.0, 0.0)];
        let velocities = [Vec2::ZERO, Vec2::ZERO];
        let params = AgentParams::default();
        let index = rebuilt_index(&positions);

        let forces = compute_raw_forces(0, &positions, &velocities, &params, &[], &index);
        let toward = positions[1] - positions[0];
        assert!(forces.cohesion.dot(toward) > 0.0);
    }

    #[test]
    fn avoidance_pushes_away_from_a_crowding_neighbor() {
        let positions = [Vec2::new(0.0, 0.0), Vec2::new(5.0, 0.0)];
        let velocities = [Vec2::ZERO, Vec2::ZERO];
        let params = AgentParams::default();
        let index = rebuilt_index(&positions);

        let forces = compute_raw_forces(0, &positions, &velocities, &params, &[], &index);
        let toward = positions[1] - positions[0];
        assert!(forces.avoidance.dot(toward) < 0.0);
    }

    #[test]
    fn following_matches_neighbor_velocity() {
        let positions = [Vec2::new(0.0, 0.0), Vec2::new(10.0, 0.0)];
        let velocities = [Vec2::ZERO, Vec2::new(0.0, 3.0)];
        let params = AgentParams::default();
        let index = rebuilt_index(&positions);

        let forces = compute_raw_forces(0, &positions, &velocities, &params, &[], &index);
        assert!(forces.following.y > 0.0);
    }

    #[test]
    fn coincident_neighbors_contribute_no_avoidance() {
        let positions = [Vec2::new(5.0, 5.0), Vec2::new(5.0, 5.0)];
        let velocities = [Vec2::ZERO, Vec2::ZERO];
        let params = AgentParams::default();
        let index = rebuilt_index(&positions);

        let forces = compute_raw_forces(0, &positions, &velocities, &params, &[], &index);
        assert_eq!(forces.avoidance, Vec2::ZERO);
    }

    #[test]
    fn obstacle_deflection_is_a_unit_vector_away_from_the_path() {
        let obstacles = [Obstacle::new(Vec2::new(40.0, 2.0), 10.0)];
        let force = obstacle_deflection(Vec2::ZERO, Vec2::new(2.0, 0.0), &obstacles);
        assert!((force.length() - 1.0).abs() < 1e-5);
        assert!(force.y < 0.0);
        assert!(force.x.abs() < 1e-5);
    }

    #[test]
    fn obstacle_deflection_bypasses_the_force_clamp() {
        // The deflection stays a full unit vector even when max_force would
        // clamp a steered force to almost nothing.
        let positions = [Vec2::ZERO];
        let velocities = [Vec2::new(2.0, 0.0)];
        let params = AgentParams {
            max_force: 0.01,
            ..AgentParams::default()
        };
        let obstacles = [Obstacle::new(Vec2::new(40.0, 2.0), 10.0)];
        let index = rebuilt_index(&positions);

        let forces = compute_raw_forces(0, &positions, &velocities, &params, &obstacles, &index);
        assert!((forces.obstacle.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn obstacle_deflection_requires_a_moving_agent() {
        let obstacles = [Obstacle::new(Vec2::new(1.0, 0.0), 10.0)];
        let force = obstacle_deflection(Vec2::ZERO, Vec2::ZERO, &obstacles);
        assert_eq!(force, Vec2::ZERO);
    }

    #[test]
    fn obstacle_deflection_picks_the_closest_qualifying_obstacle() {
        let obstacles = [
            Obstacle::new(Vec2::new(80.0, -3.0), 10.0),
            Obstacle::new(Vec2::new(30.0, 3.0), 10.0),
            Obstacle::new(Vec2::new(20.0, 50.0), 10.0),
        ];
        let force = obstacle_deflection(Vec2::ZERO, Vec2::new(1.0, 0.0), &obstacles);
        // The nearer on-path obstacle sits above the line, so the deflection
        // points below it.
        assert!(force.y < 0.0);
    }

    #[test]
    fn obstacles_outside_their_effect_radius_are_ignored() {
        let obstacles = [Obstacle::new(Vec2::new(40.0, 50.0), 10.0)];
        let force = obstacle_deflection(Vec2::ZERO, Vec2::new(2.0, 0.0), &obstacles);
        assert_eq!(force, Vec2::ZERO);

        let zero_radius = [Obstacle::new(Vec2::new(40.0, 0.0), 0.0)];
        let force = obstacle_deflection(Vec2::ZERO, Vec2::new(2.0, 0.0), &zero_radius);
        assert_eq!(force, Vec2::ZERO);
    }

    #[test]
    fn speeds_stay_clamped_while_the_flock_runs() {
        let config = FlockConfig {
            num_boids: 24,
            rng_seed: Some(3),
            ..FlockConfig::default()
        };
        let mut world = FlockWorld::new(config.clone()).expect("world");
        for _ in 0..25 {
            world.advance();
            for velocity in world.agents().columns().velocities() {
                assert!(velocity.length() <= config.max_speed + 1e-4);
            }
        }
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let config = FlockConfig {
            history_capacity: 4,
            ..quiet_config()
        };
        let mut world = FlockWorld::new(config).expect("world");
        for _ in 0..10 {
            world.advance();
        }
        let history: Vec<_> = world.history().cloned().collect();
        assert_eq!(history.len(), 4);
        assert_eq!(history.first().expect("first").tick, Tick(7));
        assert_eq!(history.last().expect("last").tick, Tick(10));
    }

    #[test]
    fn summary_reports_speed_statistics() {
        let config = quiet_config();
        let mut world = FlockWorld::new(config.clone()).expect("world");
        let mut slow = still_agent(10.0, 10.0, &config);
        slow.velocity = Vec2::new(1.0, 0.0);
        let mut fast = still_agent(400.0, 300.0, &config);
        fast.velocity = Vec2::new(0.0, 3.0);
        world.spawn_agent(slow);
        world.spawn_agent(fast);

        world.advance();
        let summary = world.last_summary().expect("summary");
        assert_eq!(summary.agent_count, 2);
        assert!((summary.fastest_speed - 3.0).abs() < 1e-4);
        assert!((summary.average_speed - 2.0).abs() < 1e-4);
    }
}

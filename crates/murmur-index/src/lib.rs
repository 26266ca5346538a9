//! Spatial indexing abstractions for boid neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Common behaviour exposed by neighborhood indices.
///
/// An index is rebuilt once per tick from the pre-tick positions and then queried
/// read-only for every agent and every force, so implementations never observe a
/// half-updated flock.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]);

    /// Visit neighbors of `agent_idx` strictly within the provided squared radius.
    ///
    /// The visitor receives the neighbor's dense index and its squared distance.
    /// The acting agent is never visited, the comparison is strict (`dist_sq <
    /// radius_sq`), and a zero radius therefore visits nothing.
    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Exhaustive pairwise scan. O(n) per query, O(n²) per tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BruteForceIndex {
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl BruteForceIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions captured by the last rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when no positions are captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl NeighborhoodIndex for BruteForceIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) {
        self.positions.clear();
        self.positions.extend_from_slice(positions);
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(&(sx, sy)) = self.positions.get(agent_idx) else {
            return;
        };
        for (other_idx, &(ox, oy)) in self.positions.iter().enumerate() {
            if other_idx == agent_idx {
                continue;
            }
            let dx = ox - sx;
            let dy = oy - sy;
            let dist_sq = dx * dx + dy * dy;
            if dist_sq < radius_sq {
                visitor(other_idx, OrderedFloat(dist_sq));
            }
        }
    }
}

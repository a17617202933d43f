// Core (H-bot) kinematics: two motors drive a coupled axis pair through
// one belt, so motor displacement is the sum/difference of the head's.

use serde::{Deserialize, Serialize};

/// Which pair of head axes shares the coupled belt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorePair {
    Xy,
    Xz,
    Yz,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoreGeometry {
    pub pair: CorePair,
    /// Belt coupling ratio; negative for reversed-core builds.
    #[serde(default = "default_factor")]
    pub factor: i32,
}

fn default_factor() -> i32 {
    1
}

impl Default for CoreGeometry {
    fn default() -> Self {
        Self {
            pair: CorePair::Xy,
            factor: default_factor(),
        }
    }
}

impl CoreGeometry {
    /// Motor-axis step deltas from head-axis step deltas.
    pub fn motor_deltas(&self, head: [i64; 3]) -> [i64; 3] {
        let k = self.factor as i64;
        let [dx, dy, dz] = head;
        match self.pair {
            CorePair::Xy => [dx + k * dy, dx - k * dy, dz],
            CorePair::Xz => [dx + k * dz, dy, dx - k * dz],
            CorePair::Yz => [dx, dy + k * dz, dy - k * dz],
        }
    }

    /// Indices (into x/y/z) of the two head axes the belt couples.
    pub fn coupled_axes(&self) -> (usize, usize) {
        match self.pair {
            CorePair::Xy => (0, 1),
            CorePair::Xz => (0, 2),
            CorePair::Yz => (1, 2),
        }
    }

    /// Head-axis positions from motor-axis positions.
    pub fn head_positions(&self, motors: [f64; 3]) -> [f64; 3] {
        let k = self.factor as f64;
        let [m0, m1, m2] = motors;
        match self.pair {
            CorePair::Xy => [(m0 + m1) / 2.0, (m0 - m1) / (2.0 * k), m2],
            CorePair::Xz => [(m0 + m2) / 2.0, m1, (m0 - m2) / (2.0 * k)],
            CorePair::Yz => [m0, (m1 + m2) / 2.0, (m1 - m2) / (2.0 * k)],
        }
    }
}

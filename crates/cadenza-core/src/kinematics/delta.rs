// Linear delta kinematics: three vertical carriages move an effector
// through fixed-length diagonal rods.

use serde::{Deserialize, Serialize};

use super::{AxisPos, Coord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaGeometry {
    /// Diagonal rod length, mm.
    pub diagonal_rod: f64,
    /// Horizontal distance from the tower pivot to the effector pivot
    /// when centered, mm.
    pub radius: f64,
    /// Tower placement around the bed, degrees.
    #[serde(default = "default_tower_angles")]
    pub tower_angles_deg: [f64; 3],
}

fn default_tower_angles() -> [f64; 3] {
    [210.0, 330.0, 90.0]
}

impl Default for DeltaGeometry {
    fn default() -> Self {
        Self {
            diagonal_rod: 250.0,
            radius: 124.0,
            tower_angles_deg: default_tower_angles(),
        }
    }
}

impl DeltaGeometry {
    fn towers(&self) -> [[f64; 2]; 3] {
        let mut towers = [[0.0; 2]; 3];
        for (tower, angle) in towers.iter_mut().zip(self.tower_angles_deg) {
            let radians = angle.to_radians();
            *tower = [self.radius * radians.cos(), self.radius * radians.sin()];
        }
        towers
    }

    /// Carriage heights that place the effector at `cart`. The caller is
    /// responsible for keeping targets inside the printable volume.
    pub fn carriage_heights(&self, cart: Coord) -> AxisPos {
        let rod_sqr = self.diagonal_rod * self.diagonal_rod;
        let towers = self.towers();
        let mut heights = [0.0; 3];
        for (height, tower) in heights.iter_mut().zip(towers) {
            let dx = cart.x - tower[0];
            let dy = cart.y - tower[1];
            *height = cart.z + (rod_sqr - dx * dx - dy * dy).sqrt();
        }
        AxisPos::new(heights[0], heights[1], heights[2], cart.e)
    }

    /// Effector position from carriage heights, by trilateration of the
    /// three rod spheres.
    pub fn effector_position(&self, axes: AxisPos) -> Coord {
        let towers = self.towers();
        let p1 = [towers[0][0], towers[0][1], axes.a];
        let p2 = [towers[1][0], towers[1][1], axes.b];
        let p3 = [towers[2][0], towers[2][1], axes.c];

        let d12 = sub(p2, p1);
        let ex = scale(d12, 1.0 / norm(d12));
        let d13 = sub(p3, p1);
        let i = dot(ex, d13);
        let ey_dir = sub(d13, scale(ex, i));
        let ey = scale(ey_dir, 1.0 / norm(ey_dir));
        let ez = cross(ex, ey);

        let d = norm(d12);
        let j = dot(ey, d13);

        // Equal sphere radii collapse the usual trilateration terms.
        let rod_sqr = self.diagonal_rod * self.diagonal_rod;
        let x = d / 2.0;
        let y = (i * i + j * j) / (2.0 * j) - (i / j) * x;
        let z = -(rod_sqr - x * x - y * y).max(0.0).sqrt();

        let p = add(add(p1, scale(ex, x)), add(scale(ey, y), scale(ez, z)));
        Coord::new(p[0], p[1], p[2], axes.e)
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

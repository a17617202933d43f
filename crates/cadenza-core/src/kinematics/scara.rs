// SCARA kinematics: a two-link arm whose shoulder and elbow angles are
// the machine's A and B axes, in degrees.

use serde::{Deserialize, Serialize};

use super::{AxisPos, Coord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaraGeometry {
    /// Shoulder-to-elbow link length, mm.
    pub shoulder_arm: f64,
    /// Elbow-to-effector link length, mm.
    pub elbow_arm: f64,
    /// Shoulder pivot position in bed coordinates, mm.
    #[serde(default)]
    pub offset: [f64; 2],
}

impl Default for ScaraGeometry {
    fn default() -> Self {
        Self {
            shoulder_arm: 150.0,
            elbow_arm: 150.0,
            offset: [100.0, -56.0],
        }
    }
}

impl ScaraGeometry {
    /// Joint angles that place the effector at `cart`. A is the absolute
    /// shoulder angle, B the absolute angle of the elbow link.
    pub fn joint_angles(&self, cart: Coord) -> AxisPos {
        let sx = cart.x - self.offset[0];
        let sy = cart.y - self.offset[1];

        let l1 = self.shoulder_arm;
        let l2 = self.elbow_arm;
        let cos_psi = (sx * sx + sy * sy - l1 * l1 - l2 * l2) / (2.0 * l1 * l2);
        let sin_psi = (1.0 - cos_psi * cos_psi).max(0.0).sqrt();
        let psi = sin_psi.atan2(cos_psi);
        let theta = sy.atan2(sx) - (l2 * sin_psi).atan2(l1 + l2 * cos_psi);

        AxisPos::new(
            theta.to_degrees(),
            (theta + psi).to_degrees(),
            cart.z,
            cart.e,
        )
    }

    /// Effector position from joint angles.
    pub fn effector_position(&self, axes: AxisPos) -> Coord {
        let theta = axes.a.to_radians();
        let sum = axes.b.to_radians();
        Coord::new(
            self.shoulder_arm * theta.cos() + self.elbow_arm * sum.cos() + self.offset[0],
            self.shoulder_arm * theta.sin() + self.elbow_arm * sum.sin() + self.offset[1],
            axes.c,
            axes.e,
        )
    }
}

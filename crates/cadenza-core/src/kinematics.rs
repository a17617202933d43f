//! Machine geometries and the cartesian/machine-axis coordinate types.

use serde::{Deserialize, Serialize};

pub mod corexy;
pub mod delta;
pub mod scara;

pub use corexy::{CoreGeometry, CorePair};
pub use delta::DeltaGeometry;
pub use scara::ScaraGeometry;

/// A position in cartesian space, mm (the extruder axis is filament
/// length, also mm).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }
}

/// A position in machine-axis space, mm (degrees for angular axes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisPos {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub e: f64,
}

impl AxisPos {
    pub const fn new(a: f64, b: f64, c: f64, e: f64) -> Self {
        Self { a, b, c, e }
    }
}

/// The machine geometry, selecting how cartesian targets map to motor
/// axes. Core machines keep the mapping at the integer step level (the
/// planner derives motor steps from head steps); delta and SCARA are
/// transformed per segment in mm.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Kinematics {
    #[default]
    Cartesian,
    Core(CoreGeometry),
    Delta(DeltaGeometry),
    Scara(ScaraGeometry),
}

impl Kinematics {
    /// Whether each segment's cartesian target must be transformed into
    /// machine axes before admission.
    pub fn is_segmented(&self) -> bool {
        matches!(self, Kinematics::Delta(_) | Kinematics::Scara(_))
    }

    pub fn core(&self) -> Option<&CoreGeometry> {
        match self {
            Kinematics::Core(core) => Some(core),
            _ => None,
        }
    }

    /// Map a cartesian position onto the machine axes.
    pub fn to_axes(&self, cart: Coord) -> AxisPos {
        match self {
            // Core transforms happen on step deltas, not positions.
            Kinematics::Cartesian | Kinematics::Core(_) => {
                AxisPos::new(cart.x, cart.y, cart.z, cart.e)
            }
            Kinematics::Delta(geometry) => geometry.carriage_heights(cart),
            Kinematics::Scara(geometry) => geometry.joint_angles(cart),
        }
    }

    /// Map machine-axis positions back to cartesian, for reporting.
    pub fn to_cartesian(&self, axes: AxisPos) -> Coord {
        match self {
            Kinematics::Cartesian => Coord::new(axes.a, axes.b, axes.c, axes.e),
            Kinematics::Core(core) => {
                let head = core.head_positions([axes.a, axes.b, axes.c]);
                Coord::new(head[0], head[1], head[2], axes.e)
            }
            Kinematics::Delta(geometry) => geometry.effector_position(axes),
            Kinematics::Scara(geometry) => geometry.effector_position(axes),
        }
    }
}

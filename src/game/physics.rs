//! Platforming physics primitives
//!
//! Pure functions over [`Position`]; all state lives with the owning lobby.
//! Physics runs once per received input rather than on a fixed tick, so the
//! per-step constants below are the whole integration scheme.

use crate::ws::protocol::{Direction, Position};

/// Ground plane height; player Y never rests below this
pub const GROUND_Y: f64 = 2.0;
/// Downward pull applied per input step
pub const GRAVITY: f64 = 0.1;
/// Instant height gain of a grounded jump
pub const JUMP_IMPULSE: f64 = 4.0;
/// Horizontal units moved per unit of direction input
pub const MOVE_SPEED: f64 = 0.5;
/// Half-extent of the axis-aligned overlap box
pub const OVERLAP_RADIUS: f64 = 5.0;

/// Half-extent of the platform arena on X and Z
pub const ARENA_HALF_EXTENT: f64 = 140.0;
/// Max horizontal X drift between successive staircase platforms
pub const PLATFORM_STEP_X: f64 = 4.0;
/// Half-extent of the cube spawn area on X and Z
pub const CUBE_ARENA_HALF_EXTENT: f64 = 90.0;
/// Height cubes spawn at
pub const CUBE_SPAWN_Y: f64 = 50.0;

pub const PLATFORM_COUNT: usize = 10;
pub const CUBE_COUNT: usize = 5;

/// One gravity step, clamped to the ground plane
pub fn apply_gravity(pos: Position) -> Position {
    Position {
        y: (pos.y - GRAVITY).max(GROUND_Y),
        ..pos
    }
}

/// Jump impulse; a no-op unless the player is grounded
pub fn apply_jump(pos: Position) -> Position {
    if pos.y <= GROUND_Y {
        Position {
            y: pos.y + JUMP_IMPULSE,
            ..pos
        }
    } else {
        pos
    }
}

/// Horizontal move scaled by [`MOVE_SPEED`]; Y untouched
pub fn apply_move(pos: Position, dir: Direction) -> Position {
    Position {
        x: pos.x + dir.x * MOVE_SPEED,
        z: pos.z + dir.z * MOVE_SPEED,
        y: pos.y,
    }
}

/// Axis-aligned box test used for both landing and collection
pub fn overlaps(a: Position, b: Position) -> bool {
    (a.x - b.x).abs() <= OVERLAP_RADIUS
        && (a.z - b.z).abs() <= OVERLAP_RADIUS
        && a.y <= b.y + OVERLAP_RADIUS
}

/// Snap onto a platform surface. The caller is responsible for only invoking
/// this during a falling step with a passing overlap test.
pub fn land_on(pos: Position, platform: Position) -> Position {
    Position {
        y: platform.y + 1.0,
        ..pos
    }
}

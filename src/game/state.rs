//! Authoritative per-lobby game state and world generation

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::ws::protocol::{
    Direction, PlayerAction, PlayerSnapshot, PlayerSlot, Position, StateSnapshot,
};

use super::physics::{
    self, ARENA_HALF_EXTENT, CUBE_ARENA_HALF_EXTENT, CUBE_COUNT, CUBE_SPAWN_Y, GROUND_Y,
    PLATFORM_COUNT, PLATFORM_STEP_X,
};

/// One slot's authoritative state
#[derive(Debug, Clone, Copy)]
pub struct PlayerState {
    pub position: Position,
}

impl PlayerState {
    fn spawn() -> Self {
        Self {
            position: Position::new(0.0, GROUND_Y, 0.0),
        }
    }
}

/// The whole of one lobby's game state. Owned exclusively by the lobby task;
/// nothing outside the actor reads or writes it.
#[derive(Debug)]
pub struct LobbyState {
    pub player1: PlayerState,
    pub player2: PlayerState,
    pub platforms: Vec<Position>,
    pub cubes: Vec<Position>,
    cubes_spawned: bool,
    rng: ChaCha8Rng,
}

impl LobbyState {
    pub fn new(mut rng: ChaCha8Rng) -> Self {
        let platforms = generate_platforms(&mut rng, PLATFORM_COUNT);
        Self {
            player1: PlayerState::spawn(),
            player2: PlayerState::spawn(),
            platforms,
            // Cubes appear only once both players are present
            cubes: Vec::new(),
            cubes_spawned: false,
            rng,
        }
    }

    pub fn player(&self, slot: PlayerSlot) -> &PlayerState {
        match slot {
            PlayerSlot::First => &self.player1,
            PlayerSlot::Second => &self.player2,
        }
    }

    pub fn player_mut(&mut self, slot: PlayerSlot) -> &mut PlayerState {
        match slot {
            PlayerSlot::First => &mut self.player1,
            PlayerSlot::Second => &mut self.player2,
        }
    }

    /// One-time cube spawn, triggered when the lobby fills. Cubes are never
    /// recreated, even if the lobby empties and refills within its grace
    /// period.
    pub fn spawn_cubes(&mut self) {
        if self.cubes_spawned {
            return;
        }
        self.cubes = generate_cubes(&mut self.rng, CUBE_COUNT);
        self.cubes_spawned = true;
    }

    /// Apply one client input. Gravity and platform landing run for both
    /// slots first (the physics tick piggybacks on message arrival), then
    /// the action applies to the acting slot only.
    pub fn apply_input(&mut self, slot: PlayerSlot, action: PlayerAction, dir: Option<Direction>) {
        self.step_physics();

        match action {
            PlayerAction::Move => {
                if let Some(dir) = dir {
                    let p = self.player_mut(slot);
                    p.position = physics::apply_move(p.position, dir);
                }
            }
            PlayerAction::Jump => {
                let p = self.player_mut(slot);
                p.position = physics::apply_jump(p.position);
            }
            PlayerAction::Collect => {
                self.collect(slot);
            }
        }
    }

    /// Gravity plus falling-step platform landing for both slots
    fn step_physics(&mut self) {
        for slot in [PlayerSlot::First, PlayerSlot::Second] {
            let before = self.player(slot).position;
            let mut after = physics::apply_gravity(before);
            if after.y < before.y {
                if let Some(platform) = self
                    .platforms
                    .iter()
                    .find(|&&pl| physics::overlaps(after, pl))
                {
                    after = physics::land_on(after, *platform);
                }
            }
            self.player_mut(slot).position = after;
        }
    }

    /// Remove the first cube overlapping the slot's position. At most one
    /// cube per call; a no-op when nothing overlaps.
    pub fn collect(&mut self, slot: PlayerSlot) -> bool {
        let pos = self.player(slot).position;
        match self.cubes.iter().position(|&cube| physics::overlaps(pos, cube)) {
            Some(idx) => {
                self.cubes.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            player1: PlayerSnapshot {
                position: self.player1.position,
            },
            player2: PlayerSnapshot {
                position: self.player2.position,
            },
            platforms: self.platforms.clone(),
            cubes: self.cubes.clone(),
        }
    }
}

/// Climbable staircase: Y rises monotonically and each platform's X stays
/// within reach of the previous one.
fn generate_platforms(rng: &mut ChaCha8Rng, count: usize) -> Vec<Position> {
    let mut platforms: Vec<Position> = Vec::with_capacity(count);

    for i in 0..count {
        let y = if i == 0 {
            rng.gen_range(0.0..3.0)
        } else {
            (i + 2) as f64
        };

        let x = match platforms.last() {
            Some(prev) => rng.gen_range(prev.x - PLATFORM_STEP_X..=prev.x + PLATFORM_STEP_X),
            None => rng.gen_range(-ARENA_HALF_EXTENT..=ARENA_HALF_EXTENT),
        };
        let z = rng.gen_range(-ARENA_HALF_EXTENT..=ARENA_HALF_EXTENT);

        platforms.push(Position::new(x, y, z));
    }

    platforms
}

fn generate_cubes(rng: &mut ChaCha8Rng, count: usize) -> Vec<Position> {
    (0..count)
        .map(|_| {
            Position::new(
                rng.gen_range(-CUBE_ARENA_HALF_EXTENT..=CUBE_ARENA_HALF_EXTENT),
                CUBE_SPAWN_Y,
                rng.gen_range(-CUBE_ARENA_HALF_EXTENT..=CUBE_ARENA_HALF_EXTENT),
            )
        })
        .collect()
}

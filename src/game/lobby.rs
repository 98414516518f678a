//! Lobby actor, handle, and the process-wide lobby registry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ws::protocol::{Direction, PlayerAction, PlayerSlot, ServerMsg};

use super::state::LobbyState;
use super::{Connection, LobbyMsg, RegisterKind};

/// Hard occupancy cap per lobby
pub const MAX_PLAYERS: usize = 2;

/// Capacity of a lobby's inbox and of each connection's outbound sink
pub const CHANNEL_CAPACITY: usize = 256;

/// Lobby IDs are drawn from this space and retried on collision
const LOBBY_ID_SPACE: u32 = 100_000;

/// Join failures surfaced to clients; the Display strings are the wire
/// `lobby_error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Lobby does not exist.")]
    NotFound,
    #[error("Lobby is full.")]
    Full,
}

/// Cloneable handle to a running lobby
#[derive(Debug, Clone)]
pub struct LobbyHandle {
    pub id: String,
    pub inbox: mpsc::Sender<LobbyMsg>,
    occupancy: Arc<AtomicUsize>,
}

impl LobbyHandle {
    /// Observed occupancy. Optimistic: the actor is the authority, this can
    /// lag behind by in-flight registrations.
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Relaxed)
    }
}

struct RosterEntry {
    conn: Connection,
    slot: PlayerSlot,
}

/// The actor owning one lobby's state. All registration, input application,
/// and broadcast for the lobby is serialized through its inbox.
pub struct Lobby {
    id: String,
    state: LobbyState,
    inbox: mpsc::Receiver<LobbyMsg>,
    roster: Vec<RosterEntry>,
    occupancy: Arc<AtomicUsize>,
    grace: Duration,
}

impl Lobby {
    pub fn new(id: String, seed: u64, grace: Duration) -> (Self, LobbyHandle) {
        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let occupancy = Arc::new(AtomicUsize::new(0));

        let handle = LobbyHandle {
            id: id.clone(),
            inbox: inbox_tx,
            occupancy: occupancy.clone(),
        };

        let lobby = Self {
            id,
            state: LobbyState::new(ChaCha8Rng::seed_from_u64(seed)),
            inbox: inbox_rx,
            roster: Vec::with_capacity(MAX_PLAYERS),
            occupancy,
            grace,
        };

        (lobby, handle)
    }

    /// Process inbox messages in arrival order until the lobby has sat empty
    /// for the grace period
    pub async fn run(mut self) {
        info!(lobby_id = %self.id, "Lobby started");

        loop {
            let msg = if self.roster.is_empty() {
                match timeout(self.grace, self.inbox.recv()).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_) => {
                        info!(lobby_id = %self.id, "Lobby empty past grace period, stopping");
                        break;
                    }
                }
            } else {
                match self.inbox.recv().await {
                    Some(msg) => msg,
                    None => break,
                }
            };

            match msg {
                LobbyMsg::Register { conn, kind, ack } => self.handle_register(conn, kind, ack),
                LobbyMsg::Unregister { conn_id } => self.handle_unregister(conn_id),
                LobbyMsg::Input {
                    conn_id,
                    action,
                    direction,
                } => self.handle_input(conn_id, action, direction),
            }
        }

        info!(lobby_id = %self.id, "Lobby stopped");
    }

    fn handle_register(
        &mut self,
        conn: Connection,
        kind: RegisterKind,
        ack: oneshot::Sender<bool>,
    ) {
        if self.roster.iter().any(|e| e.conn.id == conn.id) {
            warn!(lobby_id = %self.id, conn_id = %conn.id, "Connection already registered");
            let _ = ack.send(true);
            return;
        }

        // Authoritative admission check; the registry's is only optimistic
        if self.roster.len() >= MAX_PLAYERS {
            self.send_to(
                &conn,
                ServerMsg::LobbyError {
                    message: JoinError::Full.to_string(),
                },
            );
            let _ = ack.send(false);
            return;
        }

        let slot = if self.roster.iter().any(|e| e.slot == PlayerSlot::First) {
            PlayerSlot::Second
        } else {
            PlayerSlot::First
        };

        let confirmation = match kind {
            RegisterKind::Creator => ServerMsg::LobbyCreated {
                lobby_id: self.id.clone(),
            },
            RegisterKind::Joiner => ServerMsg::LobbyJoined {
                lobby_id: self.id.clone(),
                player_id: slot,
            },
        };
        if !self.send_to(&conn, confirmation) {
            // Sink already dead; never admit
            let _ = ack.send(false);
            return;
        }

        // Private snapshot so the new client can render immediately
        self.send_to(
            &conn,
            ServerMsg::GameState {
                state: self.state.snapshot(),
            },
        );

        info!(
            lobby_id = %self.id,
            conn_id = %conn.id,
            slot = slot.label(),
            "Connection registered"
        );

        self.roster.push(RosterEntry { conn, slot });
        self.occupancy.store(self.roster.len(), Ordering::Relaxed);
        let _ = ack.send(true);

        if self.roster.len() == MAX_PLAYERS {
            info!(lobby_id = %self.id, "Lobby full, spawning cubes and starting game");
            self.state.spawn_cubes();
            self.broadcast(ServerMsg::GameStart);
        }
    }

    fn handle_unregister(&mut self, conn_id: Uuid) {
        let before = self.roster.len();
        // Dropping the entry releases the actor's sender to that sink
        self.roster.retain(|e| e.conn.id != conn_id);

        if self.roster.len() < before {
            self.occupancy.store(self.roster.len(), Ordering::Relaxed);
            info!(
                lobby_id = %self.id,
                conn_id = %conn_id,
                occupancy = self.roster.len(),
                "Connection unregistered"
            );
        }
    }

    fn handle_input(&mut self, conn_id: Uuid, action: PlayerAction, direction: Option<Direction>) {
        let Some(slot) = self
            .roster
            .iter()
            .find(|e| e.conn.id == conn_id)
            .map(|e| e.slot)
        else {
            warn!(lobby_id = %self.id, conn_id = %conn_id, "Input from unregistered connection, dropping");
            return;
        };

        self.state.apply_input(slot, action, direction);

        self.broadcast(ServerMsg::GameState {
            state: self.state.snapshot(),
        });
    }

    /// Best-effort fan-out. A saturated or closed sink marks its connection
    /// dead: it is evicted instead of stalling the lobby.
    fn broadcast(&mut self, msg: ServerMsg) {
        let mut evicted = false;
        let id = self.id.as_str();

        self.roster.retain(|entry| {
            match entry.conn.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        lobby_id = %id,
                        conn_id = %entry.conn.id,
                        error = %e,
                        "Outbound sink unavailable, evicting connection"
                    );
                    evicted = true;
                    false
                }
            }
        });

        if evicted {
            self.occupancy.store(self.roster.len(), Ordering::Relaxed);
        }
    }

    fn send_to(&self, conn: &Connection, msg: ServerMsg) -> bool {
        match conn.tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(lobby_id = %self.id, conn_id = %conn.id, error = %e, "Direct send failed");
                false
            }
        }
    }
}

/// Process-wide directory of active lobbies. Constructed once at startup and
/// passed by handle; map guards are held only across lookup/insert.
pub struct LobbyRegistry {
    lobbies: DashMap<String, LobbyHandle>,
    grace: Duration,
}

impl LobbyRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            lobbies: DashMap::new(),
            grace,
        }
    }

    /// Create a lobby under a fresh numeric ID and spawn its actor. The
    /// actor's registry entry is removed when it stops, so IDs can be reused
    /// after teardown.
    pub fn create(self: &Arc<Self>) -> LobbyHandle {
        loop {
            let id = rand::thread_rng().gen_range(0..LOBBY_ID_SPACE).to_string();

            match self.lobbies.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    let seed = rand::random::<u64>();
                    let (lobby, handle) = Lobby::new(id.clone(), seed, self.grace);
                    entry.insert(handle.clone());

                    let registry = Arc::clone(self);
                    tokio::spawn(async move {
                        lobby.run().await;
                        registry.lobbies.remove(&id);
                        info!(lobby_id = %id, "Lobby removed from registry");
                    });

                    info!(lobby_id = %handle.id, "Lobby created");
                    return handle;
                }
            }
        }
    }

    /// Look up a joinable lobby. The occupancy check is optimistic; the
    /// actor re-checks on register.
    pub fn join(&self, id: &str) -> Result<LobbyHandle, JoinError> {
        let handle = self
            .lobbies
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(JoinError::NotFound)?;

        if handle.occupancy() >= MAX_PLAYERS {
            return Err(JoinError::Full);
        }

        Ok(handle)
    }

    pub fn active_lobbies(&self) -> usize {
        self.lobbies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    const GRACE: Duration = Duration::from_secs(30);

    fn test_conn(capacity: usize) -> (Connection, Receiver<ServerMsg>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Connection {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    fn spawn_lobby(id: &str) -> LobbyHandle {
        let (lobby, handle) = Lobby::new(id.to_string(), 42, GRACE);
        tokio::spawn(lobby.run());
        handle
    }

    async fn register(
        handle: &LobbyHandle,
        kind: RegisterKind,
        capacity: usize,
    ) -> (Connection, Receiver<ServerMsg>, bool) {
        let (conn, rx) = test_conn(capacity);
        let (ack_tx, ack_rx) = oneshot::channel();
        handle
            .inbox
            .send(LobbyMsg::Register {
                conn: conn.clone(),
                kind,
                ack: ack_tx,
            })
            .await
            .expect("lobby inbox open");
        let admitted = ack_rx.await.unwrap_or(false);
        (conn, rx, admitted)
    }

    async fn wait_for_occupancy(handle: &LobbyHandle, expected: usize) {
        for _ in 0..100 {
            if handle.occupancy() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "occupancy never reached {} (is {})",
            expected,
            handle.occupancy()
        );
    }

    #[tokio::test]
    async fn slot_assignment_and_registration_replies() {
        let handle = spawn_lobby("42");

        let (_c1, mut rx1, admitted) = register(&handle, RegisterKind::Creator, 16).await;
        assert!(admitted);
        match rx1.recv().await.unwrap() {
            ServerMsg::LobbyCreated { lobby_id } => assert_eq!(lobby_id, "42"),
            other => panic!("expected lobby_created, got {:?}", other),
        }
        match rx1.recv().await.unwrap() {
            ServerMsg::GameState { state } => {
                assert!(state.cubes.is_empty(), "no cubes before the lobby fills")
            }
            other => panic!("expected private game_state, got {:?}", other),
        }

        let (_c2, mut rx2, admitted) = register(&handle, RegisterKind::Joiner, 16).await;
        assert!(admitted);
        match rx2.recv().await.unwrap() {
            ServerMsg::LobbyJoined {
                lobby_id,
                player_id,
            } => {
                assert_eq!(lobby_id, "42");
                assert_eq!(player_id, PlayerSlot::Second);
            }
            other => panic!("expected lobby_joined, got {:?}", other),
        }
        assert!(matches!(
            rx2.recv().await.unwrap(),
            ServerMsg::GameState { .. }
        ));

        // both participants see the match start
        assert!(matches!(rx2.recv().await.unwrap(), ServerMsg::GameStart));
        assert!(matches!(rx1.recv().await.unwrap(), ServerMsg::GameStart));
    }

    #[tokio::test]
    async fn third_registration_is_rejected() {
        let handle = spawn_lobby("7");
        let (_c1, _rx1, _) = register(&handle, RegisterKind::Creator, 16).await;
        let (_c2, _rx2, _) = register(&handle, RegisterKind::Joiner, 16).await;
        wait_for_occupancy(&handle, 2).await;

        let (_c3, mut rx3, admitted) = register(&handle, RegisterKind::Joiner, 16).await;
        assert!(!admitted, "a full lobby must refuse admission");
        match rx3.recv().await.unwrap() {
            ServerMsg::LobbyError { message } => assert_eq!(message, "Lobby is full."),
            other => panic!("expected lobby_error, got {:?}", other),
        }
        assert_eq!(handle.occupancy(), 2);
    }

    #[tokio::test]
    async fn input_broadcasts_one_snapshot_to_everyone() {
        let handle = spawn_lobby("9");
        let (c1, mut rx1, _) = register(&handle, RegisterKind::Creator, 16).await;
        let (_c2, mut rx2, _) = register(&handle, RegisterKind::Joiner, 16).await;

        // drain registration traffic
        for _ in 0..3 {
            rx1.recv().await.unwrap();
        }
        for _ in 0..3 {
            rx2.recv().await.unwrap();
        }

        handle
            .inbox
            .send(LobbyMsg::Input {
                conn_id: c1.id,
                action: PlayerAction::Move,
                direction: Some(Direction { x: 1.0, z: 0.0 }),
            })
            .await
            .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                ServerMsg::GameState { state } => {
                    assert_eq!(state.player1.position.x, 0.5);
                    assert_eq!(state.player1.position.z, 0.0);
                    assert!(state.player1.position.y >= 2.0);
                }
                other => panic!("expected game_state, got {:?}", other),
            }
        }
        // exactly one snapshot each
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn input_from_unregistered_connection_is_dropped() {
        let handle = spawn_lobby("11");
        let (_c1, mut rx1, _) = register(&handle, RegisterKind::Creator, 16).await;
        rx1.recv().await.unwrap(); // lobby_created
        rx1.recv().await.unwrap(); // game_state

        handle
            .inbox
            .send(LobbyMsg::Input {
                conn_id: Uuid::new_v4(),
                action: PlayerAction::Jump,
                direction: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx1.try_recv().is_err(), "foreign input must not broadcast");
    }

    #[tokio::test]
    async fn unregister_frees_the_slot() {
        let handle = spawn_lobby("13");
        let (c1, _rx1, _) = register(&handle, RegisterKind::Creator, 16).await;
        let (_c2, _rx2, _) = register(&handle, RegisterKind::Joiner, 16).await;
        wait_for_occupancy(&handle, 2).await;

        handle
            .inbox
            .send(LobbyMsg::Unregister { conn_id: c1.id })
            .await
            .unwrap();
        wait_for_occupancy(&handle, 1).await;

        // a fresh registration is admitted again
        let (_c3, mut rx3, admitted) = register(&handle, RegisterKind::Joiner, 16).await;
        assert!(admitted);
        assert!(matches!(
            rx3.recv().await.unwrap(),
            ServerMsg::LobbyJoined { .. }
        ));
    }

    #[tokio::test]
    async fn saturated_sink_gets_evicted() {
        let handle = spawn_lobby("17");
        let (c1, mut rx1, _) = register(&handle, RegisterKind::Creator, 16).await;
        // undrained sink sized to exactly the registration traffic
        // (lobby_joined, game_state, game_start): the next broadcast overflows
        let (slow, mut rx_slow, _) = register(&handle, RegisterKind::Joiner, 3).await;
        // the lobby's roster now holds the only sender to the slow sink,
        // as it does once a bridge hands its connection over
        drop(slow);
        wait_for_occupancy(&handle, 2).await;

        for _ in 0..3 {
            rx1.recv().await.unwrap();
        }

        // each input broadcasts a snapshot; the slow sink fills and overflows
        for _ in 0..3 {
            handle
                .inbox
                .send(LobbyMsg::Input {
                    conn_id: c1.id,
                    action: PlayerAction::Jump,
                    direction: None,
                })
                .await
                .unwrap();
        }

        wait_for_occupancy(&handle, 1).await;

        // the healthy connection kept receiving every snapshot
        for _ in 0..3 {
            assert!(matches!(
                rx1.recv().await.unwrap(),
                ServerMsg::GameState { .. }
            ));
        }

        // eviction dropped the last sender, so the evicted sink drains its
        // buffered registration traffic and then closes, which is what lets
        // the connection's writer finish with a close frame
        for _ in 0..3 {
            assert!(rx_slow.recv().await.is_some());
        }
        assert!(rx_slow.recv().await.is_none(), "evicted sink must close");
    }

    #[tokio::test]
    async fn unregister_closes_the_sink() {
        let handle = spawn_lobby("19");
        let (c1, mut rx1, _) = register(&handle, RegisterKind::Creator, 16).await;
        let conn_id = c1.id;
        drop(c1);

        rx1.recv().await.unwrap(); // lobby_created
        rx1.recv().await.unwrap(); // game_state

        handle
            .inbox
            .send(LobbyMsg::Unregister { conn_id })
            .await
            .unwrap();

        assert!(rx1.recv().await.is_none(), "dropping the roster entry must close the sink");
    }

    #[tokio::test]
    async fn lobbies_are_isolated() {
        let registry = Arc::new(LobbyRegistry::new(GRACE));
        let a = registry.create();
        let b = registry.create();
        assert_ne!(a.id, b.id);
        assert_eq!(registry.active_lobbies(), 2);

        let (ca, mut rx_a, _) = register(&a, RegisterKind::Creator, 16).await;
        let (_cb, mut rx_b, _) = register(&b, RegisterKind::Creator, 16).await;
        rx_a.recv().await.unwrap();
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        a.inbox
            .send(LobbyMsg::Input {
                conn_id: ca.id,
                action: PlayerAction::Move,
                direction: Some(Direction { x: 1.0, z: 1.0 }),
            })
            .await
            .unwrap();

        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ServerMsg::GameState { .. }
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_b.try_recv().is_err(), "input to A must not reach B");
    }

    #[tokio::test]
    async fn join_unknown_lobby_fails() {
        let registry = Arc::new(LobbyRegistry::new(GRACE));
        assert_eq!(registry.join("99999").unwrap_err(), JoinError::NotFound);
        assert_eq!(JoinError::NotFound.to_string(), "Lobby does not exist.");
    }

    #[tokio::test]
    async fn join_full_lobby_fails_optimistically() {
        let registry = Arc::new(LobbyRegistry::new(GRACE));
        let handle = registry.create();

        let (_c1, _rx1, _) = register(&handle, RegisterKind::Creator, 16).await;
        let (_c2, _rx2, _) = register(&handle, RegisterKind::Joiner, 16).await;
        wait_for_occupancy(&handle, 2).await;

        assert_eq!(registry.join(&handle.id).unwrap_err(), JoinError::Full);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_lobby_is_torn_down_after_grace() {
        let registry = Arc::new(LobbyRegistry::new(Duration::from_secs(30)));
        let handle = registry.create();
        assert_eq!(registry.active_lobbies(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(registry.active_lobbies(), 0);
        assert_eq!(registry.join(&handle.id).unwrap_err(), JoinError::NotFound);
    }
}

//! Game simulation modules

pub mod lobby;
pub mod physics;
pub mod state;

pub use lobby::{LobbyHandle, LobbyRegistry};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ws::protocol::{Direction, PlayerAction, ServerMsg};

/// Why a connection is registering; decides the confirmation message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Creator,
    Joiner,
}

/// One client connection as seen from a lobby: identity plus the bounded
/// outbound sink drained by that connection's writer pump
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub tx: mpsc::Sender<ServerMsg>,
}

/// Messages into a lobby's inbox. Arrival order at this single queue is the
/// total order for all mutation of the lobby's state.
#[derive(Debug)]
pub enum LobbyMsg {
    Register {
        conn: Connection,
        kind: RegisterKind,
        /// Admission verdict back to the bridge; `false` means the lobby
        /// refused the connection and it holds no slot here.
        ack: oneshot::Sender<bool>,
    },
    Unregister {
        conn_id: Uuid,
    },
    Input {
        conn_id: Uuid,
        action: PlayerAction,
        direction: Option<Direction>,
    },
}

//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};

/// A point in world space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Horizontal movement intent as sent by the client (not normalized)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Direction {
    pub x: f64,
    pub z: f64,
}

/// The two fixed player roles in a lobby
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerSlot {
    #[serde(rename = "player1")]
    First,
    #[serde(rename = "player2")]
    Second,
}

impl PlayerSlot {
    pub fn label(self) -> &'static str {
        match self {
            Self::First => "player1",
            Self::Second => "player2",
        }
    }
}

/// Gameplay actions a client can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerAction {
    Move,
    Jump,
    Collect,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Request a fresh lobby; the sender becomes player1
    CreateLobby,

    /// Join an existing lobby as player2
    JoinLobby {
        #[serde(rename = "lobbyID")]
        lobby_id: String,
    },

    /// Gameplay input for the sender's slot
    PlayerInput {
        action: PlayerAction,
        /// Movement intent, required for `move`
        #[serde(default)]
        direction: Option<Direction>,
        /// Sent by clients on `collect`; the server trusts the sender's
        /// assigned slot instead
        #[serde(rename = "playerID", default)]
        player_id: Option<String>,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Reply to the lobby creator
    LobbyCreated {
        #[serde(rename = "lobbyID")]
        lobby_id: String,
    },

    /// Reply to a successful joiner
    LobbyJoined {
        #[serde(rename = "lobbyID")]
        lobby_id: String,
        #[serde(rename = "playerID")]
        player_id: PlayerSlot,
    },

    /// Join/create failure
    LobbyError { message: String },

    /// Authoritative state, pushed privately on registration and broadcast
    /// after every accepted input
    GameState { state: StateSnapshot },

    /// Broadcast once when the second player registers
    GameStart,
}

/// Serialized lobby state as seen by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub player1: PlayerSnapshot,
    pub player2: PlayerSnapshot,
    pub platforms: Vec<Position>,
    pub cubes: Vec<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub position: Position,
}

//! # Shared Protocol Library
//!
//! Wire-level types shared between the game server and its clients.
//! Every WebSocket frame is a JSON envelope `{"type": <tag>, "payload": <object>}`;
//! the [`ClientMessage`] and [`ServerEvent`] enums are the complete inbound and
//! outbound protocol, serialized through serde's adjacent tagging so the envelope
//! shape falls out of the type definitions.
//!
//! ## Core Components
//!
//! - **Game constants**: round timing, scoring values and the selection weight
//!   used when a track appears in several players' listening histories.
//! - **Track / PlayerInfo / RoomSummary**: the data carried on the wire. Tracks
//!   are compared by `id` only; `rank` is the 1-based position in one player's
//!   top-tracks list and is meaningless outside that player.
//! - **Masking**: during a round the playing track is broadcast with its
//!   identifying fields blanked ([`Track::masked`]) so clients can play the
//!   preview without revealing the answer. The true fields are revealed in
//!   `round_complete`.
//!
//! The server never trusts client-supplied ids beyond routing; all game
//! decisions happen against server-held state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maximum number of players seated in one room.
pub const MAX_PLAYERS_PER_ROOM: usize = 6;

/// Rounds played when a client requests a non-positive round count.
pub const DEFAULT_TOTAL_ROUNDS: u32 = 10;

/// Seconds players have to submit a guess once a round starts.
pub const ROUND_DURATION_SECS: u64 = 30;

/// Pause between `game_started` and the first round.
pub const INTERMISSION_SECS: u64 = 5;

/// Pause between rounds, and before `game_over` after the final round.
pub const INTER_ROUND_SECS: u64 = 5;

/// Rank assigned to a player whose top tracks do not contain the round's track.
pub const DEFAULT_RANKING_FOR_ABSENT_TRACK: u32 = 999;

/// Points for correctly guessing the round winner.
pub const BASE_POINTS: u32 = 10;

/// Extra points for the fastest correct guess of a round.
pub const SPEED_BONUS: u32 = 5;

/// Per-occurrence weight multiplier for tracks shared by several players.
///
/// A track held by a single player enters the selection pool with weight 1;
/// a track held by `n > 1` players enters with weight `n * 5`, strongly
/// favoring tracks more than one player will recognize.
pub const SHARED_TRACK_WEIGHT_MULTIPLIER: u32 = 5;

/// Lifecycle phase of a room, visible in room listings and driving which
/// commands the room accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Waiting,
    Playing,
    RoundEnd,
    GameOver,
}

/// A single entry of a player's top-tracks list.
///
/// `rank` starts at 1 for the most-listened track and is specific to the
/// player the list came from. Two tracks are the same track iff their `id`s
/// are equal, regardless of any other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    pub rank: u32,
    pub uri: String,
    pub image_url: String,
    pub preview_url: String,
}

impl Track {
    /// Returns the `round_started` form of this track: name, artists and
    /// album art blanked, `id`, `uri` and `preview_url` preserved so clients
    /// can play audio without learning the answer.
    pub fn masked(&self) -> Track {
        Track {
            id: self.id.clone(),
            name: "???".to_string(),
            artists: vec!["???".to_string()],
            rank: self.rank,
            uri: self.uri.clone(),
            image_url: String::new(),
            preview_url: self.preview_url.clone(),
        }
    }
}

/// Public view of a seated player, included in most broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: String,
    pub name: String,
    pub score: u32,
    pub is_ready: bool,
    pub is_leader: bool,
}

/// One row of the `/rooms` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: String,
    pub player_count: usize,
    pub max_players: usize,
    pub state: RoomPhase,
}

/// Client → server envelope.
///
/// Frames with an unrecognized `type`, or a payload that does not match the
/// declared shape, fail to deserialize; the endpoint drops such frames
/// silently per the protocol contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        player_id: String,
        player_name: String,
        #[serde(default)]
        access_token: String,
        #[serde(default)]
        is_guest: bool,
    },
    Ready {
        is_ready: bool,
        #[serde(default)]
        player_id: Option<String>,
    },
    StartGame {
        #[serde(default)]
        room_id: String,
        total_rounds: i64,
    },
    SubmitGuess {
        #[serde(default)]
        room_id: String,
        #[serde(default)]
        player_id: Option<String>,
        guessed_player_id: String,
    },
    LeaveRoom {},
}

/// Server → client envelope, broadcast to every member of a room unless the
/// event is an [`ServerEvent::Error`] addressed to one requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    PlayerJoined {
        player: PlayerInfo,
        player_count: usize,
        players: Vec<PlayerInfo>,
    },
    PlayerLeft {
        player_id: String,
        player_count: usize,
        players: Vec<PlayerInfo>,
    },
    PlayerReady {
        player_id: String,
        is_ready: bool,
    },
    GameStarted {
        total_rounds: u32,
        players: Vec<PlayerInfo>,
    },
    RoundStarted {
        round: u32,
        total_rounds: u32,
        track: Track,
        players: Vec<PlayerInfo>,
    },
    GuessReceived {
        player_id: String,
        guesses_count: usize,
        total_players: usize,
    },
    RoundComplete {
        round: u32,
        track: Track,
        winner_id: String,
        winner_rank: u32,
        correct_guessers: Vec<String>,
        points_awarded: HashMap<String, u32>,
        all_rankings: HashMap<String, u32>,
        updated_scores: HashMap<String, u32>,
        guess_durations: HashMap<String, f64>,
    },
    GameOver {
        winner_id: String,
        final_scores: HashMap<String, u32>,
        players: Vec<PlayerInfo>,
    },
    GameReset {
        players: Vec<PlayerInfo>,
    },
    Error {
        message: String,
    },
}

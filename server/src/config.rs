//! Environment-driven server configuration
//!
//! Mirrors the deployment contract of the service: everything tunable comes
//! from environment variables with sensible defaults, read once at startup.
//! Rooms receive their own [`RoomConfig`] so tests can shrink the timers
//! without touching process environment.

use std::env;
use std::time::Duration;

use shared::{
    DEFAULT_TOTAL_ROUNDS, INTERMISSION_SECS, INTER_ROUND_SECS, MAX_PLAYERS_PER_ROOM,
    ROUND_DURATION_SECS,
};

/// Process-wide configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub frontend_url: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_redirect_uri: String,
    /// Explicit CORS allow-list; empty means "any origin".
    pub allowed_origins: Vec<String>,
    pub default_total_rounds: u32,
    pub max_players_per_room: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: parse_var("PORT", 8080),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            spotify_client_id: env::var("SPOTIFY_CLIENT_ID").unwrap_or_default(),
            spotify_client_secret: env::var("SPOTIFY_CLIENT_SECRET").unwrap_or_default(),
            spotify_redirect_uri: env::var("SPOTIFY_REDIRECT_URI").unwrap_or_default(),
            allowed_origins: parse_origins(&env::var("ALLOWED_ORIGINS").unwrap_or_default()),
            default_total_rounds: parse_var("DEFAULT_TOTAL_ROUNDS", DEFAULT_TOTAL_ROUNDS),
            max_players_per_room: parse_var("MAX_PLAYERS_PER_ROOM", MAX_PLAYERS_PER_ROOM),
        }
    }

    /// Room-level view of this configuration with the production timers.
    pub fn room(&self) -> RoomConfig {
        RoomConfig {
            max_players: self.max_players_per_room,
            default_total_rounds: self.default_total_rounds,
            ..RoomConfig::default()
        }
    }
}

/// Tunables threaded into every room.
///
/// The timer durations exist as fields (rather than reading the shared
/// constants directly) so the test suite can run complete games in
/// milliseconds.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_players: usize,
    pub default_total_rounds: u32,
    pub round_duration: Duration,
    pub intermission: Duration,
    pub inter_round: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS_PER_ROOM,
            default_total_rounds: DEFAULT_TOTAL_ROUNDS,
            round_duration: Duration::from_secs(ROUND_DURATION_SECS),
            intermission: Duration::from_secs(INTERMISSION_SECS),
            inter_round: Duration::from_secs(INTER_ROUND_SECS),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Splits a comma-separated origin list; `*`, empty entries and an empty
/// input all collapse to the permissive default.
fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty() && *origin != "*")
        .map(str::to_string)
        .collect()
}

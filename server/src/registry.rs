//! Room registry
//!
//! Owns the fixed set of rooms for the process lifetime. Rooms are created
//! eagerly at startup with their loops already running; nothing is created
//! or destroyed afterwards, so lookups never need a lock. Summaries and
//! metrics go through each room's read-locked snapshot so they cannot race
//! with that room's loop.

use std::collections::HashMap;

use log::info;
use serde::Serialize;
use thiserror::Error;

use shared::{RoomPhase, RoomSummary};

use crate::config::RoomConfig;
use crate::room::Room;

/// The persistent rooms every deployment starts with.
pub const DEFAULT_ROOM_IDS: [&str; 3] = ["Room 1", "Room 2", "Room 3"];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("room not found - valid rooms are: {valid}")]
    NotFound { valid: String },
}

/// Aggregate counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub total_rooms: usize,
    pub total_players: usize,
    pub active_players: usize,
}

pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    /// Declared order, used for listings and the not-found message.
    order: Vec<String>,
}

impl RoomRegistry {
    /// Creates the default persistent rooms.
    pub fn new(config: RoomConfig) -> Self {
        Self::with_rooms(&DEFAULT_ROOM_IDS, config)
    }

    /// Creates a registry over an explicit room id list (tests).
    pub fn with_rooms(room_ids: &[&str], config: RoomConfig) -> Self {
        let mut rooms = HashMap::new();
        let mut order = Vec::with_capacity(room_ids.len());

        for &room_id in room_ids {
            rooms.insert(room_id.to_string(), Room::spawn(room_id, config.clone()));
            order.push(room_id.to_string());
            info!("Initialized persistent room: {}", room_id);
        }

        Self { rooms, order }
    }

    pub fn get(&self, room_id: &str) -> Result<&Room, RegistryError> {
        self.rooms.get(room_id).ok_or_else(|| RegistryError::NotFound {
            valid: self.order.join(", "),
        })
    }

    /// Per-room summaries in declared order.
    pub async fn list(&self) -> Vec<RoomSummary> {
        let mut summaries = Vec::with_capacity(self.order.len());
        for room_id in &self.order {
            if let Some(room) = self.rooms.get(room_id) {
                summaries.push(room.summary().await);
            }
        }
        summaries
    }

    pub async fn metrics(&self) -> Metrics {
        let mut total_players = 0;
        let mut active_players = 0;

        for room in self.rooms.values() {
            let (players, phase) = room.occupancy().await;
            total_players += players;
            if phase == RoomPhase::Playing {
                active_players += players;
            }
        }

        Metrics {
            total_rooms: self.rooms.len(),
            total_players,
            active_players,
        }
    }
}

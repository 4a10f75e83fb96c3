//! Room actor: per-room game state machine and event fan-out
//!
//! Each room owns its state exclusively and serializes every mutation
//! through a single-consumer command loop, the same discipline the server
//! uses for client input elsewhere: producers (connection endpoint, timer
//! tasks) push [`RoomCommand`]s onto an unbounded channel and exactly one
//! loop applies them in arrival order. A `tokio::sync::RwLock` additionally
//! guards the state so the registry can take read-locked snapshots for
//! summaries and metrics without entering the loop; the loop takes the
//! write lock for mutations and only ever performs socket writes after
//! releasing it.
//!
//! Timers never touch state directly. The round deadline, the intermission
//! before round one and the inter-round pauses are all one-shot tasks that
//! post a command back into the loop; the handler validates the command
//! against the current phase and round index, so a stale timer from an
//! abandoned round is a no-op rather than a race.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use shared::{PlayerInfo, RoomPhase, RoomSummary, ServerEvent, Track};

use crate::config::RoomConfig;
use crate::provider::Profile;
use crate::scoring::{self, GuessRecord};

/// Frames pushed to a member's socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    /// A serialized server event, ready to go out as one text frame.
    Event(String),
    /// Close the connection with normal closure.
    Close,
}

/// Sending half of a member's connection. The room owns this handle from
/// `Join` until `Leave`; the receiving half lives in the connection
/// endpoint's writer task.
pub type ClientSocket = mpsc::UnboundedSender<SocketFrame>;

/// Commands consumed by the room loop. `Join` through `Guess` arrive from
/// the connection endpoint; the remaining variants are posted by the room's
/// own scheduled tasks.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        profile: Arc<Profile>,
        socket: ClientSocket,
    },
    Leave {
        player_id: String,
    },
    SetReady {
        player_id: String,
        is_ready: bool,
    },
    StartGame {
        total_rounds: u32,
    },
    Guess {
        player_id: String,
        guessed_player_id: String,
        received_at: Instant,
    },
    /// Posted after the intermission / inter-round delay.
    StartRound { round: u32 },
    /// Posted by the round-deadline task.
    RoundTimeout { round: u32 },
    /// Posted after the final round's inter-round delay.
    FinishGame,
}

/// Serializes an event and queues it on one socket. Used for errors that
/// must reach only the requester.
pub(crate) fn send_to(socket: &ClientSocket, event: &ServerEvent) {
    if let Ok(payload) = serde_json::to_string(event) {
        let _ = socket.send(SocketFrame::Event(payload));
    }
}

#[derive(Debug)]
struct Member {
    profile: Arc<Profile>,
    socket: ClientSocket,
    joined_at: Instant,
    score: u32,
    is_ready: bool,
    is_leader: bool,
}

#[derive(Debug)]
struct GuessEntry {
    player_id: String,
    guessed_player_id: String,
    received_at: Instant,
}

#[derive(Debug)]
struct RoundState {
    index: u32,
    track: Track,
    started_at: Instant,
    /// Receipt order; at most one entry per player.
    guesses: Vec<GuessEntry>,
}

#[derive(Debug)]
struct RoomState {
    members: HashMap<String, Member>,
    /// Join order; drives leader promotion and tie-breaks.
    member_order: Vec<String>,
    phase: RoomPhase,
    leader_id: String,
    total_rounds: u32,
    current_round: Option<RoundState>,
    /// Track ids played this game; reset on game start.
    played_track_ids: HashSet<String>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            member_order: Vec::new(),
            phase: RoomPhase::Waiting,
            leader_id: String::new(),
            total_rounds: 0,
            current_round: None,
            played_track_ids: HashSet::new(),
        }
    }

    fn player_info(&self, player_id: &str) -> Option<PlayerInfo> {
        self.members.get(player_id).map(|member| PlayerInfo {
            id: member.profile.id.clone(),
            name: member.profile.name.clone(),
            score: member.score,
            is_ready: member.is_ready,
            is_leader: member.is_leader,
        })
    }

    fn player_list(&self) -> Vec<PlayerInfo> {
        self.member_order
            .iter()
            .filter_map(|id| self.player_info(id))
            .collect()
    }

    fn score_table(&self) -> HashMap<String, u32> {
        self.members
            .iter()
            .map(|(id, member)| (id.clone(), member.score))
            .collect()
    }

    /// Post-game reset back to the lobby: scores and readiness cleared,
    /// round state dropped.
    fn reset_after_game(&mut self) {
        self.phase = RoomPhase::Waiting;
        self.current_round = None;
        for member in self.members.values_mut() {
            member.score = 0;
            member.is_ready = false;
        }
    }
}

/// Handle to a running room. Cheap to clone; every observable effect on
/// the room goes through [`Room::send`].
#[derive(Debug, Clone)]
pub struct Room {
    id: String,
    max_players: usize,
    tx: mpsc::UnboundedSender<RoomCommand>,
    state: Arc<RwLock<RoomState>>,
}

impl Room {
    /// Creates the room and spawns its command loop.
    pub fn spawn(id: impl Into<String>, config: RoomConfig) -> Room {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(RoomState::new()));

        let room = Room {
            id: id.clone(),
            max_players: config.max_players,
            tx: tx.clone(),
            state: Arc::clone(&state),
        };

        let mut room_loop = RoomLoop {
            id,
            config,
            state,
            tx,
            rx,
            round_timer: None,
            rng: StdRng::from_entropy(),
        };
        tokio::spawn(async move {
            room_loop.run().await;
        });

        room
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queues a command for the room loop.
    pub fn send(&self, command: RoomCommand) {
        if self.tx.send(command).is_err() {
            warn!("Room {}: command dropped, loop has stopped", self.id);
        }
    }

    /// Read-locked snapshot for the `/rooms` listing.
    pub async fn summary(&self) -> RoomSummary {
        let state = self.state.read().await;
        RoomSummary {
            id: self.id.clone(),
            player_count: state.members.len(),
            max_players: self.max_players,
            state: state.phase,
        }
    }

    /// Read-locked (player count, phase) pair for metrics aggregation.
    pub async fn occupancy(&self) -> (usize, RoomPhase) {
        let state = self.state.read().await;
        (state.members.len(), state.phase)
    }
}

struct RoomLoop {
    id: String,
    config: RoomConfig,
    state: Arc<RwLock<RoomState>>,
    tx: mpsc::UnboundedSender<RoomCommand>,
    rx: mpsc::UnboundedReceiver<RoomCommand>,
    round_timer: Option<JoinHandle<()>>,
    rng: StdRng,
}

impl RoomLoop {
    async fn run(&mut self) {
        info!("Room {}: loop started", self.id);

        while let Some(command) = self.rx.recv().await {
            match command {
                RoomCommand::Join { profile, socket } => self.handle_join(profile, socket).await,
                RoomCommand::Leave { player_id } => self.handle_leave(player_id).await,
                RoomCommand::SetReady {
                    player_id,
                    is_ready,
                } => self.handle_set_ready(player_id, is_ready).await,
                RoomCommand::StartGame { total_rounds } => {
                    self.handle_start_game(total_rounds).await
                }
                RoomCommand::Guess {
                    player_id,
                    guessed_player_id,
                    received_at,
                } => {
                    self.handle_guess(player_id, guessed_player_id, received_at)
                        .await
                }
                RoomCommand::StartRound { round } => self.handle_start_round(round).await,
                RoomCommand::RoundTimeout { round } => self.end_round(round).await,
                RoomCommand::FinishGame => self.handle_finish_game().await,
            }
        }

        self.cancel_round_timer();
        info!("Room {}: loop stopped", self.id);
    }

    async fn handle_join(&mut self, profile: Arc<Profile>, socket: ClientSocket) {
        let mut state = self.state.write().await;

        if state.members.len() >= self.config.max_players {
            warn!(
                "Room {} is full ({}/{} players)",
                self.id,
                state.members.len(),
                self.config.max_players
            );
            send_to(
                &socket,
                &ServerEvent::Error {
                    message: format!(
                        "Room is full (maximum {} players)",
                        self.config.max_players
                    ),
                },
            );
            return;
        }

        if state.members.contains_key(&profile.id) {
            send_to(
                &socket,
                &ServerEvent::Error {
                    message: "Player is already in this room".to_string(),
                },
            );
            return;
        }

        let is_leader = state.members.is_empty();
        if is_leader {
            state.leader_id = profile.id.clone();
            info!(
                "Player {} assigned as leader of room {}",
                profile.name, self.id
            );
        }

        let player = PlayerInfo {
            id: profile.id.clone(),
            name: profile.name.clone(),
            score: 0,
            is_ready: false,
            is_leader,
        };
        let player_id = profile.id.clone();
        info!("Player {} joined room {}", profile.name, self.id);

        state.members.insert(
            player_id.clone(),
            Member {
                profile,
                socket,
                joined_at: Instant::now(),
                score: 0,
                is_ready: false,
                is_leader,
            },
        );
        state.member_order.push(player_id);

        let event = ServerEvent::PlayerJoined {
            player,
            player_count: state.members.len(),
            players: state.player_list(),
        };
        drop(state);

        self.broadcast(&event).await;
    }

    async fn handle_leave(&mut self, player_id: String) {
        let mut state = self.state.write().await;

        let Some(member) = state.members.remove(&player_id) else {
            return;
        };
        let _ = member.socket.send(SocketFrame::Close);

        state.member_order.retain(|id| id != &player_id);
        if let Some(round) = state.current_round.as_mut() {
            round.guesses.retain(|guess| guess.player_id != player_id);
        }

        if state.leader_id == player_id {
            if let Some(new_leader_id) = state.member_order.first().cloned() {
                state.leader_id = new_leader_id.clone();
                if let Some(next) = state.members.get_mut(&new_leader_id) {
                    next.is_leader = true;
                    info!(
                        "Player {} is now the leader of room {}",
                        next.profile.name, self.id
                    );
                }
            } else {
                state.leader_id.clear();
            }
        }

        info!(
            "Player {} left room {} after {:?}",
            member.profile.name,
            self.id,
            member.joined_at.elapsed()
        );

        let event = ServerEvent::PlayerLeft {
            player_id,
            player_count: state.members.len(),
            players: state.player_list(),
        };

        let emptied_mid_game = state.members.is_empty() && state.phase != RoomPhase::Waiting;
        if emptied_mid_game {
            state.phase = RoomPhase::Waiting;
            state.current_round = None;
            info!("Room {}: empty mid-game, resetting to waiting", self.id);
        }
        drop(state);

        if emptied_mid_game {
            self.cancel_round_timer();
        }
        self.broadcast(&event).await;
    }

    async fn handle_set_ready(&mut self, player_id: String, is_ready: bool) {
        let mut state = self.state.write().await;

        if !state.members.contains_key(&player_id) {
            return;
        }

        // Readying up from the results screen brings the room back to the lobby
        let reset_event = if state.phase == RoomPhase::GameOver {
            state.reset_after_game();
            info!("Room {} reset to waiting state", self.id);
            Some(ServerEvent::GameReset {
                players: state.player_list(),
            })
        } else {
            None
        };

        if let Some(member) = state.members.get_mut(&player_id) {
            member.is_ready = is_ready;
            info!("Player {} is ready: {}", member.profile.name, is_ready);
        }

        let event = ServerEvent::PlayerReady {
            player_id,
            is_ready,
        };
        drop(state);

        if let Some(reset) = reset_event {
            self.broadcast(&reset).await;
        }
        self.broadcast(&event).await;
    }

    async fn handle_start_game(&mut self, requested_rounds: u32) {
        let mut state = self.state.write().await;

        let reset_event = if state.phase == RoomPhase::GameOver {
            state.reset_after_game();
            Some(ServerEvent::GameReset {
                players: state.player_list(),
            })
        } else {
            None
        };

        if state.phase != RoomPhase::Waiting {
            return;
        }

        if let Some(reset) = reset_event {
            drop(state);
            self.broadcast(&reset).await;
            state = self.state.write().await;
        }

        if state.members.len() < 2 {
            let event = ServerEvent::Error {
                message: "Need at least 2 players to start".to_string(),
            };
            drop(state);
            self.broadcast(&event).await;
            return;
        }

        if !state.members.values().all(|member| member.is_ready) {
            let event = ServerEvent::Error {
                message: "All players must be ready to start".to_string(),
            };
            drop(state);
            self.broadcast(&event).await;
            return;
        }

        let total_rounds = if requested_rounds == 0 {
            self.config.default_total_rounds
        } else {
            requested_rounds
        };

        state.total_rounds = total_rounds;
        state.current_round = None;
        state.played_track_ids.clear();
        for member in state.members.values_mut() {
            member.score = 0;
        }
        state.phase = RoomPhase::Playing;

        info!(
            "Game started in room {} with {} rounds",
            self.id, total_rounds
        );

        let event = ServerEvent::GameStarted {
            total_rounds,
            players: state.player_list(),
        };
        drop(state);

        self.broadcast(&event).await;
        self.schedule_start_round(1, self.config.intermission);
    }

    async fn handle_start_round(&mut self, round: u32) {
        let mut state = self.state.write().await;

        // Stale schedules (room emptied, game reset) are dropped here
        let expected = match (state.phase, &state.current_round) {
            (RoomPhase::Playing, None) => 1,
            (RoomPhase::RoundEnd, Some(current)) => current.index + 1,
            _ => return,
        };
        if round != expected {
            return;
        }

        let pool = {
            let member_tracks: Vec<&[Track]> = state
                .member_order
                .iter()
                .filter_map(|id| state.members.get(id))
                .map(|member| member.profile.top_tracks.as_slice())
                .collect();
            scoring::build_candidate_pool(&member_tracks, &state.played_track_ids)
        };

        let Some(track) = scoring::pick_weighted(&pool, &mut self.rng) else {
            // Nothing left to play: finish the game with the standings as
            // they are instead of leaving clients waiting on a round that
            // will never start.
            warn!("Room {}: no tracks available, ending game", self.id);
            state.phase = RoomPhase::GameOver;
            state.current_round = None;
            let final_scores = state.score_table();
            let winner_id = scoring::game_winner(&state.member_order, &final_scores);
            let game_over = ServerEvent::GameOver {
                winner_id,
                final_scores,
                players: state.player_list(),
            };
            drop(state);
            self.cancel_round_timer();
            self.broadcast(&ServerEvent::Error {
                message: "No tracks available".to_string(),
            })
            .await;
            self.broadcast(&game_over).await;
            return;
        };

        state.played_track_ids.insert(track.id.clone());
        state.phase = RoomPhase::Playing;
        state.current_round = Some(RoundState {
            index: round,
            track: track.clone(),
            started_at: Instant::now(),
            guesses: Vec::new(),
        });

        info!(
            "Round {}/{} started in room {} - Track: {}",
            round, state.total_rounds, self.id, track.name
        );

        let event = ServerEvent::RoundStarted {
            round,
            total_rounds: state.total_rounds,
            track: track.masked(),
            players: state.player_list(),
        };
        drop(state);

        self.broadcast(&event).await;
        self.arm_round_timer(round);
    }

    async fn handle_guess(
        &mut self,
        player_id: String,
        guessed_player_id: String,
        received_at: Instant,
    ) {
        let mut state = self.state.write().await;

        if state.phase != RoomPhase::Playing {
            return;
        }
        if !state.members.contains_key(&player_id) || !state.members.contains_key(&guessed_player_id)
        {
            return;
        }

        let total_players = state.members.len();
        let Some(round) = state.current_round.as_mut() else {
            return;
        };

        // First write wins: repeat guesses within a round are ignored
        if round.guesses.iter().any(|guess| guess.player_id == player_id) {
            return;
        }

        round.guesses.push(GuessEntry {
            player_id: player_id.clone(),
            guessed_player_id,
            received_at,
        });
        let guesses_count = round.guesses.len();
        let round_index = round.index;

        info!(
            "Player {} guessed in room {} ({}/{})",
            player_id, self.id, guesses_count, total_players
        );

        let event = ServerEvent::GuessReceived {
            player_id,
            guesses_count,
            total_players,
        };
        let all_guessed = guesses_count == total_players;
        drop(state);

        self.broadcast(&event).await;

        if all_guessed {
            self.cancel_round_timer();
            self.end_round(round_index).await;
        }
    }

    /// Ends the given round: deadline expiry and all-players-guessed both
    /// land here, and stale timer fires fall through the guards.
    async fn end_round(&mut self, round: u32) {
        let mut state = self.state.write().await;

        if state.phase != RoomPhase::Playing {
            return;
        }

        let (outcome, track) = {
            let Some(current) = state.current_round.as_ref() else {
                return;
            };
            if current.index != round {
                return;
            }

            let members: Vec<(String, &[Track])> = state
                .member_order
                .iter()
                .filter_map(|id| state.members.get(id))
                .map(|member| {
                    (
                        member.profile.id.clone(),
                        member.profile.top_tracks.as_slice(),
                    )
                })
                .collect();
            let guesses: Vec<GuessRecord> = current
                .guesses
                .iter()
                .map(|guess| GuessRecord {
                    player_id: guess.player_id.clone(),
                    guessed_player_id: guess.guessed_player_id.clone(),
                    elapsed: guess.received_at.duration_since(current.started_at),
                })
                .collect();

            (
                scoring::score_round(&members, &current.track.id, &guesses),
                current.track.clone(),
            )
        };

        for (player_id, points) in &outcome.points_awarded {
            if let Some(member) = state.members.get_mut(player_id) {
                member.score += points;
            }
        }
        state.phase = RoomPhase::RoundEnd;

        info!(
            "Round {} complete in room {} - Winner: {}",
            round, self.id, outcome.winner_id
        );

        let event = ServerEvent::RoundComplete {
            round,
            track,
            winner_id: outcome.winner_id,
            winner_rank: outcome.winner_rank,
            correct_guessers: outcome.correct_guessers,
            points_awarded: outcome.points_awarded,
            all_rankings: outcome.all_rankings,
            updated_scores: state.score_table(),
            guess_durations: outcome.guess_durations,
        };
        let is_last_round = round >= state.total_rounds;
        drop(state);

        self.cancel_round_timer();
        self.broadcast(&event).await;

        if is_last_round {
            self.schedule_finish(self.config.inter_round);
        } else {
            self.schedule_start_round(round + 1, self.config.inter_round);
        }
    }

    async fn handle_finish_game(&mut self) {
        let mut state = self.state.write().await;

        if state.phase != RoomPhase::RoundEnd {
            return;
        }

        state.phase = RoomPhase::GameOver;
        state.current_round = None;

        let final_scores = state.score_table();
        let winner_id = scoring::game_winner(&state.member_order, &final_scores);

        info!("Game over in room {} - Winner: {}", self.id, winner_id);

        let event = ServerEvent::GameOver {
            winner_id,
            final_scores,
            players: state.player_list(),
        };
        drop(state);

        self.broadcast(&event).await;
    }

    /// Serializes once and queues the frame on every member socket under
    /// the read lock. A failed send means the writer task is gone; the
    /// member is only ever removed through `Leave`.
    async fn broadcast(&self, event: &ServerEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Room {}: failed to serialize event: {}", self.id, err);
                return;
            }
        };

        let state = self.state.read().await;
        for member in state.members.values() {
            if member
                .socket
                .send(SocketFrame::Event(payload.clone()))
                .is_err()
            {
                warn!(
                    "Error broadcasting to player {} in room {}",
                    member.profile.id, self.id
                );
            }
        }
    }

    fn schedule_start_round(&self, round: u32, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RoomCommand::StartRound { round });
        });
    }

    fn schedule_finish(&self, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RoomCommand::FinishGame);
        });
    }

    fn arm_round_timer(&mut self, round: u32) {
        self.cancel_round_timer();
        let tx = self.tx.clone();
        let delay = self.config.round_duration;
        self.round_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RoomCommand::RoundTimeout { round });
        }));
    }

    fn cancel_round_timer(&mut self) {
        if let Some(timer) = self.round_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{BASE_POINTS, SPEED_BONUS};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn fast_config() -> RoomConfig {
        RoomConfig {
            max_players: 6,
            default_total_rounds: 10,
            round_duration: Duration::from_millis(150),
            intermission: Duration::from_millis(20),
            inter_round: Duration::from_millis(20),
        }
    }

    fn track(id: &str, rank: u32) -> Track {
        Track {
            id: id.to_string(),
            name: format!("Song {}", id),
            artists: vec!["Artist".to_string()],
            rank,
            uri: format!("spotify:track:{}", id),
            image_url: "https://img.example/cover.jpg".to_string(),
            preview_url: "https://cdn.example/preview.mp3".to_string(),
        }
    }

    fn profile(id: &str, tracks: Vec<Track>) -> Arc<Profile> {
        Arc::new(Profile {
            id: id.to_string(),
            name: format!("Player {}", id),
            top_tracks: tracks,
        })
    }

    fn connect() -> (ClientSocket, UnboundedReceiver<SocketFrame>) {
        mpsc::unbounded_channel()
    }

    async fn next_frame(rx: &mut UnboundedReceiver<SocketFrame>) -> SocketFrame {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("socket channel closed")
    }

    async fn next_event(rx: &mut UnboundedReceiver<SocketFrame>) -> ServerEvent {
        match next_frame(rx).await {
            SocketFrame::Event(text) => serde_json::from_str(&text).expect("valid server event"),
            SocketFrame::Close => panic!("socket closed while waiting for event"),
        }
    }

    async fn wait_for_event<F>(rx: &mut UnboundedReceiver<SocketFrame>, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_first_join_becomes_leader() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket, mut rx) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![]),
            socket,
        });

        match next_event(&mut rx).await {
            ServerEvent::PlayerJoined {
                player,
                player_count,
                players,
            } => {
                assert_eq!(player.id, "A");
                assert!(player.is_leader);
                assert_eq!(player.score, 0);
                assert_eq!(player_count, 1);
                assert_eq!(players.len(), 1);
            }
            other => panic!("expected player_joined, got {:?}", other),
        }

        let summary = room.summary().await;
        assert_eq!(summary.player_count, 1);
        assert_eq!(summary.state, RoomPhase::Waiting);
    }

    #[tokio::test]
    async fn test_join_when_full_rejects_requester_only() {
        let config = RoomConfig {
            max_players: 2,
            ..fast_config()
        };
        let room = Room::spawn("Test Room", config);

        let (socket_a, mut rx_a) = connect();
        let (socket_b, mut rx_b) = connect();
        let (socket_c, mut rx_c) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![]),
            socket: socket_b,
        });
        // A sees both joins, B sees its own
        wait_for_event(&mut rx_a, |e| {
            matches!(e, ServerEvent::PlayerJoined { player_count: 2, .. })
        })
        .await;
        next_event(&mut rx_b).await;

        room.send(RoomCommand::Join {
            profile: profile("C", vec![]),
            socket: socket_c,
        });

        match next_event(&mut rx_c).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "Room is full (maximum 2 players)");
            }
            other => panic!("expected error, got {:?}", other),
        }

        assert_eq!(room.summary().await.player_count, 2);

        // The seated players never hear about the rejected join
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_player_id_rejected() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket_a, mut rx_a) = connect();
        let (socket_dup, mut rx_dup) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![]),
            socket: socket_a,
        });
        next_event(&mut rx_a).await;

        room.send(RoomCommand::Join {
            profile: profile("A", vec![]),
            socket: socket_dup,
        });

        match next_event(&mut rx_dup).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "Player is already in this room");
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(room.summary().await.player_count, 1);
    }

    #[tokio::test]
    async fn test_leave_promotes_next_in_join_order() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket_a, mut rx_a) = connect();
        let (socket_b, mut rx_b) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![]),
            socket: socket_b,
        });
        wait_for_event(&mut rx_b, |e| matches!(e, ServerEvent::PlayerJoined { .. })).await;

        room.send(RoomCommand::Leave {
            player_id: "A".to_string(),
        });

        let event = wait_for_event(&mut rx_b, |e| matches!(e, ServerEvent::PlayerLeft { .. })).await;
        match event {
            ServerEvent::PlayerLeft {
                player_id,
                player_count,
                players,
            } => {
                assert_eq!(player_id, "A");
                assert_eq!(player_count, 1);
                assert_eq!(players.len(), 1);
                assert!(players[0].is_leader, "B must inherit leadership");
            }
            _ => unreachable!(),
        }

        // The leaver's socket is closed by the room
        loop {
            match next_frame(&mut rx_a).await {
                SocketFrame::Close => break,
                SocketFrame::Event(_) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_leave_of_non_member_is_noop() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket_a, mut rx_a) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![]),
            socket: socket_a,
        });
        next_event(&mut rx_a).await;

        room.send(RoomCommand::Leave {
            player_id: "ghost".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(room.summary().await.player_count, 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_game_guards() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket_a, mut rx_a) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![track("T1", 1)]),
            socket: socket_a,
        });
        next_event(&mut rx_a).await;

        room.send(RoomCommand::StartGame { total_rounds: 10 });
        match wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::Error { .. })).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "Need at least 2 players to start")
            }
            _ => unreachable!(),
        }

        let (socket_b, mut rx_b) = connect();
        room.send(RoomCommand::Join {
            profile: profile("B", vec![track("T1", 2)]),
            socket: socket_b,
        });
        next_event(&mut rx_b).await;
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });

        room.send(RoomCommand::StartGame { total_rounds: 10 });
        match wait_for_event(&mut rx_b, |e| matches!(e, ServerEvent::Error { .. })).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "All players must be ready to start")
            }
            _ => unreachable!(),
        }

        assert_eq!(room.summary().await.state, RoomPhase::Waiting);
    }

    /// Two players share one candidate track, play a single round, and the
    /// correct guesser takes the game.
    #[tokio::test]
    async fn test_full_game_single_round() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket_a, mut rx_a) = connect();
        let (socket_b, mut rx_b) = connect();

        // Only T2 is in the pool; B ranks it highest and wins the round
        room.send(RoomCommand::Join {
            profile: profile("A", vec![track("T2", 2)]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![track("T2", 1)]),
            socket: socket_b,
        });
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::SetReady {
            player_id: "B".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::StartGame { total_rounds: 1 });

        match wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::GameStarted { .. })).await {
            ServerEvent::GameStarted { total_rounds, .. } => assert_eq!(total_rounds, 1),
            _ => unreachable!(),
        }

        let started =
            wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::RoundStarted { .. })).await;
        match started {
            ServerEvent::RoundStarted {
                round,
                total_rounds,
                track,
                ..
            } => {
                assert_eq!(round, 1);
                assert_eq!(total_rounds, 1);
                assert_eq!(track.id, "T2");
                assert_eq!(track.name, "???");
                assert_eq!(track.artists, vec!["???".to_string()]);
                assert_eq!(track.image_url, "");
                assert_eq!(track.preview_url, "https://cdn.example/preview.mp3");
            }
            _ => unreachable!(),
        }

        room.send(RoomCommand::Guess {
            player_id: "A".to_string(),
            guessed_player_id: "B".to_string(),
            received_at: Instant::now(),
        });
        room.send(RoomCommand::Guess {
            player_id: "B".to_string(),
            guessed_player_id: "A".to_string(),
            received_at: Instant::now(),
        });

        let complete =
            wait_for_event(&mut rx_b, |e| matches!(e, ServerEvent::RoundComplete { .. })).await;
        match complete {
            ServerEvent::RoundComplete {
                round,
                track,
                winner_id,
                winner_rank,
                correct_guessers,
                points_awarded,
                all_rankings,
                updated_scores,
                guess_durations,
            } => {
                assert_eq!(round, 1);
                assert_eq!(track.name, "Song T2", "reveal must restore the track");
                assert_eq!(winner_id, "B");
                assert_eq!(winner_rank, 1);
                assert_eq!(correct_guessers, vec!["A".to_string()]);
                assert_eq!(points_awarded["A"], BASE_POINTS + SPEED_BONUS);
                assert_eq!(all_rankings["A"], 2);
                assert_eq!(all_rankings["B"], 1);
                assert_eq!(updated_scores["A"], 15);
                assert_eq!(updated_scores["B"], 0);
                assert!(guess_durations.contains_key("A"));
                assert!(!guess_durations.contains_key("B"));
            }
            _ => unreachable!(),
        }

        let over = wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::GameOver { .. })).await;
        match over {
            ServerEvent::GameOver {
                winner_id,
                final_scores,
                ..
            } => {
                assert_eq!(winner_id, "A");
                assert_eq!(final_scores["A"], 15);
                assert_eq!(final_scores["B"], 0);
            }
            _ => unreachable!(),
        }

        assert_eq!(room.summary().await.state, RoomPhase::GameOver);
    }

    #[tokio::test]
    async fn test_round_times_out_without_guesses() {
        let config = RoomConfig {
            round_duration: Duration::from_millis(60),
            ..fast_config()
        };
        let room = Room::spawn("Test Room", config);
        let (socket_a, mut rx_a) = connect();
        let (socket_b, _rx_b) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![track("T1", 1)]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![track("T1", 2)]),
            socket: socket_b,
        });
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::SetReady {
            player_id: "B".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::StartGame { total_rounds: 1 });

        let complete =
            wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::RoundComplete { .. })).await;
        match complete {
            ServerEvent::RoundComplete {
                winner_id,
                correct_guessers,
                points_awarded,
                updated_scores,
                ..
            } => {
                assert_eq!(winner_id, "A");
                assert!(correct_guessers.is_empty());
                assert!(points_awarded.is_empty());
                assert_eq!(updated_scores["A"], 0);
                assert_eq!(updated_scores["B"], 0);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_repeat_guess_is_ignored() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket_a, mut rx_a) = connect();
        let (socket_b, _rx_b) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![track("T1", 2)]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![track("T1", 1)]),
            socket: socket_b,
        });
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::SetReady {
            player_id: "B".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::StartGame { total_rounds: 1 });
        wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::RoundStarted { .. })).await;

        // A's first guess names the winner; the second tries to change it
        room.send(RoomCommand::Guess {
            player_id: "A".to_string(),
            guessed_player_id: "B".to_string(),
            received_at: Instant::now(),
        });
        room.send(RoomCommand::Guess {
            player_id: "A".to_string(),
            guessed_player_id: "A".to_string(),
            received_at: Instant::now(),
        });
        room.send(RoomCommand::Guess {
            player_id: "B".to_string(),
            guessed_player_id: "A".to_string(),
            received_at: Instant::now(),
        });

        let complete =
            wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::RoundComplete { .. })).await;
        match complete {
            ServerEvent::RoundComplete {
                winner_id,
                correct_guessers,
                ..
            } => {
                assert_eq!(winner_id, "B");
                assert_eq!(correct_guessers, vec!["A".to_string()]);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_room_emptying_mid_game_resets_to_waiting() {
        let config = RoomConfig {
            round_duration: Duration::from_millis(100),
            ..fast_config()
        };
        let room = Room::spawn("Test Room", config);
        let (socket_a, mut rx_a) = connect();
        let (socket_b, _rx_b) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![track("T1", 1), track("T2", 2), track("T3", 3)]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![track("T1", 2)]),
            socket: socket_b,
        });
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::SetReady {
            player_id: "B".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::StartGame { total_rounds: 3 });
        wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::RoundStarted { .. })).await;

        room.send(RoomCommand::Leave {
            player_id: "A".to_string(),
        });
        room.send(RoomCommand::Leave {
            player_id: "B".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = room.summary().await;
        assert_eq!(summary.player_count, 0);
        assert_eq!(summary.state, RoomPhase::Waiting);

        // Pending round schedules must not revive the game
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(room.summary().await.state, RoomPhase::Waiting);
    }

    #[tokio::test]
    async fn test_ready_after_game_over_resets_room() {
        let config = RoomConfig {
            round_duration: Duration::from_millis(40),
            ..fast_config()
        };
        let room = Room::spawn("Test Room", config);
        let (socket_a, mut rx_a) = connect();
        let (socket_b, _rx_b) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![track("T1", 1)]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![track("T1", 2)]),
            socket: socket_b,
        });
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::SetReady {
            player_id: "B".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::StartGame { total_rounds: 1 });
        wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::GameOver { .. })).await;

        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });

        let reset = wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::GameReset { .. })).await;
        match reset {
            ServerEvent::GameReset { players } => {
                assert!(players.iter().all(|p| p.score == 0));
            }
            _ => unreachable!(),
        }
        wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::PlayerReady { .. })).await;
        assert_eq!(room.summary().await.state, RoomPhase::Waiting);
    }

    #[tokio::test]
    async fn test_empty_track_pool_ends_game() {
        let room = Room::spawn("Test Room", fast_config());
        let (socket_a, mut rx_a) = connect();
        let (socket_b, _rx_b) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![]),
            socket: socket_b,
        });
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::SetReady {
            player_id: "B".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::StartGame { total_rounds: 2 });

        match wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::Error { .. })).await {
            ServerEvent::Error { message } => assert_eq!(message, "No tracks available"),
            _ => unreachable!(),
        }
        match wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::GameOver { .. })).await {
            ServerEvent::GameOver { final_scores, .. } => {
                assert_eq!(final_scores["A"], 0);
                assert_eq!(final_scores["B"], 0);
            }
            _ => unreachable!(),
        }
        assert_eq!(room.summary().await.state, RoomPhase::GameOver);
    }

    #[tokio::test]
    async fn test_tracks_never_repeat_within_game() {
        let config = RoomConfig {
            round_duration: Duration::from_millis(40),
            ..fast_config()
        };
        let room = Room::spawn("Test Room", config);
        let (socket_a, mut rx_a) = connect();
        let (socket_b, _rx_b) = connect();

        room.send(RoomCommand::Join {
            profile: profile("A", vec![track("T1", 1), track("T2", 2), track("T3", 3)]),
            socket: socket_a,
        });
        room.send(RoomCommand::Join {
            profile: profile("B", vec![track("T1", 3), track("T2", 1), track("T3", 2)]),
            socket: socket_b,
        });
        room.send(RoomCommand::SetReady {
            player_id: "A".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::SetReady {
            player_id: "B".to_string(),
            is_ready: true,
        });
        room.send(RoomCommand::StartGame { total_rounds: 3 });

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let started =
                wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::RoundStarted { .. })).await;
            if let ServerEvent::RoundStarted { track, .. } = started {
                assert!(seen.insert(track.id.clone()), "track {} repeated", track.id);
            }
        }
        wait_for_event(&mut rx_a, |e| matches!(e, ServerEvent::GameOver { .. })).await;
        assert_eq!(seen.len(), 3);
    }
}

//! Track selection and round scoring
//!
//! Pure functions over the room's member table, kept apart from the room
//! loop so the game math can be tested without sockets or timers.
//!
//! Selection builds a weighted candidate pool from every member's top
//! tracks, excluding anything already played this game. A track held by one
//! member enters with weight 1; a track held by `n` members enters with
//! weight `n * SHARED_TRACK_WEIGHT_MULTIPLIER`, biasing rounds toward songs
//! more than one player will have an opinion about. Sampling walks a prefix
//! sum instead of inflating a pool with repeated entries; the distribution
//! is identical.
//!
//! Scoring: the round winner is the member ranking the track highest
//! (lowest rank number, 999 when absent, earliest joiner on ties). Members
//! who guessed the winner earn [`BASE_POINTS`], and the earliest correct
//! guess earns [`SPEED_BONUS`] on top.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;

use shared::{
    Track, BASE_POINTS, DEFAULT_RANKING_FOR_ABSENT_TRACK, SHARED_TRACK_WEIGHT_MULTIPLIER,
    SPEED_BONUS,
};

/// One recorded guess, in the order the room loop accepted it.
#[derive(Debug, Clone)]
pub struct GuessRecord {
    pub player_id: String,
    pub guessed_player_id: String,
    /// Time between round start and guess receipt.
    pub elapsed: Duration,
}

/// Everything `round_complete` needs, minus the accumulated score table
/// (the room owns score accumulation).
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub winner_id: String,
    pub winner_rank: u32,
    pub correct_guessers: Vec<String>,
    pub points_awarded: HashMap<String, u32>,
    pub all_rankings: HashMap<String, u32>,
    pub guess_durations: HashMap<String, f64>,
}

/// Builds the weighted candidate pool for the next round.
///
/// `member_tracks` must be in join order: when a track is held by several
/// members, the first member's copy supplies the broadcast `preview_url`
/// and artwork.
pub fn build_candidate_pool(
    member_tracks: &[&[Track]],
    played: &HashSet<String>,
) -> Vec<(Track, u32)> {
    let mut first_copy: Vec<Track> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for tracks in member_tracks {
        for track in *tracks {
            if played.contains(&track.id) {
                continue;
            }
            match index_by_id.get(&track.id) {
                Some(&slot) => counts[slot] += 1,
                None => {
                    index_by_id.insert(track.id.clone(), first_copy.len());
                    first_copy.push(track.clone());
                    counts.push(1);
                }
            }
        }
    }

    first_copy
        .into_iter()
        .zip(counts)
        .map(|(track, count)| (track, candidate_weight(count)))
        .collect()
}

fn candidate_weight(count: u32) -> u32 {
    if count <= 1 {
        1
    } else {
        count * SHARED_TRACK_WEIGHT_MULTIPLIER
    }
}

/// Samples one track from the weighted pool, or `None` if the pool is empty.
pub fn pick_weighted<R: Rng>(pool: &[(Track, u32)], rng: &mut R) -> Option<Track> {
    let total: u32 = pool.iter().map(|(_, weight)| weight).sum();
    if total == 0 {
        return None;
    }

    let mut remaining = rng.gen_range(0..total);
    for (track, weight) in pool {
        if remaining < *weight {
            return Some(track.clone());
        }
        remaining -= weight;
    }

    // Unreachable: remaining < total by construction
    None
}

/// Rank of `track_id` in one member's top tracks, 999 if absent.
pub fn rank_of(tracks: &[Track], track_id: &str) -> u32 {
    tracks
        .iter()
        .find(|track| track.id == track_id)
        .map(|track| track.rank)
        .unwrap_or(DEFAULT_RANKING_FOR_ABSENT_TRACK)
}

/// Scores one finished round.
///
/// `members` must be in join order; ties on winner rank resolve to the
/// earliest joiner. `guesses` must be in receipt order; ties on elapsed
/// time resolve to the guess recorded first.
pub fn score_round(
    members: &[(String, &[Track])],
    track_id: &str,
    guesses: &[GuessRecord],
) -> RoundOutcome {
    let mut all_rankings = HashMap::new();
    let mut winner_id = String::new();
    let mut winner_rank = DEFAULT_RANKING_FOR_ABSENT_TRACK;

    for (player_id, tracks) in members {
        let rank = rank_of(tracks, track_id);
        all_rankings.insert(player_id.clone(), rank);
        if rank < winner_rank {
            winner_rank = rank;
            winner_id = player_id.clone();
        }
    }

    let mut correct: Vec<&GuessRecord> = guesses
        .iter()
        .filter(|guess| !winner_id.is_empty() && guess.guessed_player_id == winner_id)
        .collect();
    // Stable sort keeps receipt order for identical timestamps
    correct.sort_by_key(|guess| guess.elapsed);

    let mut correct_guessers = Vec::with_capacity(correct.len());
    let mut points_awarded = HashMap::new();
    let mut guess_durations = HashMap::new();

    for (position, guess) in correct.iter().enumerate() {
        let mut points = BASE_POINTS;
        if position == 0 {
            points += SPEED_BONUS;
        }
        correct_guessers.push(guess.player_id.clone());
        points_awarded.insert(guess.player_id.clone(), points);
        guess_durations.insert(guess.player_id.clone(), guess.elapsed.as_secs_f64());
    }

    RoundOutcome {
        winner_id,
        winner_rank,
        correct_guessers,
        points_awarded,
        all_rankings,
        guess_durations,
    }
}

/// Final-standings winner: highest score, earliest joiner on ties.
pub fn game_winner(member_order: &[String], scores: &HashMap<String, u32>) -> String {
    let mut winner_id = String::new();
    let mut best: Option<u32> = None;

    for player_id in member_order {
        let score = scores.get(player_id).copied().unwrap_or(0);
        if best.map_or(true, |current| score > current) {
            best = Some(score);
            winner_id = player_id.clone();
        }
    }

    winner_id
}

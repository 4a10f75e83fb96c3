//! Music-provider adapter
//!
//! The game core only needs one thing from the outside world: given an access
//! credential, a [`Profile`] with the player's display name and their ranked
//! top-tracks list. [`TrackProvider`] is that seam. The production
//! implementation talks to the Spotify Web API; guests get deterministic mock
//! data so a full lobby can be exercised without any provider account.

use async_trait::async_trait;
use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use thiserror::Error;

use shared::Track;

use crate::config::Config;

const SPOTIFY_API_BASE: &str = "https://api.spotify.com/v1";
const SPOTIFY_ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
const TOP_TRACKS_LIMIT: usize = 50;

/// A player identity plus their ranked listening history, immutable once
/// fetched.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub top_tracks: Vec<Track>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected the access token")]
    Unauthorized,
}

/// Fetches a profile and top tracks for an access token.
#[async_trait]
pub trait TrackProvider: Send + Sync {
    async fn fetch_profile(&self, access_token: &str) -> Result<Profile, ProviderError>;
}

/// Spotify Web API implementation of [`TrackProvider`].
pub struct SpotifyProvider {
    client: reqwest::Client,
    api_base: String,
}

impl SpotifyProvider {
    pub fn new() -> Self {
        Self::with_base(SPOTIFY_API_BASE.to_string())
    }

    /// Points the provider at an alternate API host (test servers).
    pub fn with_base(api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(access_token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Unauthorized);
        }

        Ok(response.error_for_status()?.json().await?)
    }
}

impl Default for SpotifyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct TopTracksResponse {
    items: Vec<TrackItem>,
}

#[derive(Deserialize)]
struct TrackItem {
    id: String,
    name: String,
    uri: String,
    preview_url: Option<String>,
    artists: Vec<ArtistItem>,
    album: AlbumItem,
}

#[derive(Deserialize)]
struct ArtistItem {
    name: String,
}

#[derive(Deserialize)]
struct AlbumItem {
    images: Vec<ImageItem>,
}

#[derive(Deserialize)]
struct ImageItem {
    url: String,
}

#[async_trait]
impl TrackProvider for SpotifyProvider {
    async fn fetch_profile(&self, access_token: &str) -> Result<Profile, ProviderError> {
        let user: UserResponse = self.get("/me", access_token).await?;
        let top: TopTracksResponse = self
            .get(
                "/me/top/tracks?limit=50&time_range=medium_term",
                access_token,
            )
            .await?;

        let mut name = user.display_name.unwrap_or_default();
        if name.is_empty() {
            // Some accounts have no display name set
            name = format!("Player {}", &user.id[..user.id.len().min(4)]);
        }

        let top_tracks = top
            .items
            .into_iter()
            .enumerate()
            .map(|(position, item)| Track {
                id: item.id,
                name: item.name,
                artists: item.artists.into_iter().map(|a| a.name).collect(),
                rank: position as u32 + 1,
                uri: item.uri,
                image_url: item
                    .album
                    .images
                    .first()
                    .map(|image| image.url.clone())
                    .unwrap_or_default(),
                preview_url: item.preview_url.unwrap_or_default(),
            })
            .collect();

        Ok(Profile {
            id: user.id,
            name,
            top_tracks,
        })
    }
}

/// OAuth half of the Spotify integration, kept apart from [`TrackProvider`]
/// because only the HTTP auth routes need it.
pub struct SpotifyOauth {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    accounts_base: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl SpotifyOauth {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: config.spotify_client_id.clone(),
            client_secret: config.spotify_client_secret.clone(),
            redirect_uri: config.spotify_redirect_uri.clone(),
            accounts_base: SPOTIFY_ACCOUNTS_BASE.to_string(),
        }
    }

    /// The authorize URL the browser is redirected to, carrying the CSRF
    /// `state` issued by the auth route.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/authorize?response_type=code&client_id={}&scope=user-top-read&redirect_uri={}&state={}",
            self.accounts_base,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(state),
        )
    }

    /// Exchanges an authorization code for a bearer access token.
    pub async fn exchange_code(&self, code: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/token", self.accounts_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("Spotify token exchange rejected client credentials");
            return Err(ProviderError::Unauthorized);
        }

        let token: TokenResponse = response.error_for_status()?.json().await?;
        Ok(token.access_token)
    }
}

/// Guest names cycled by guest index; indexes past the list get a numeric
/// suffix ("Alex", ..., "Drew", "Alex2", ...).
const GUEST_NAMES: [&str; 10] = [
    "Alex", "Jordan", "Taylor", "Morgan", "Casey", "Riley", "Avery", "Quinn", "Skylar", "Drew",
];

/// Pool of well-known songs used to fabricate guest listening histories.
const MOCK_TRACK_POOL: [(&str, &[&str]); 48] = [
    ("Blinding Lights", &["The Weeknd"]),
    ("Shape of You", &["Ed Sheeran"]),
    ("Someone Like You", &["Adele"]),
    ("Uptown Funk", &["Mark Ronson", "Bruno Mars"]),
    ("Thinking Out Loud", &["Ed Sheeran"]),
    ("Levitating", &["Dua Lipa"]),
    ("drivers license", &["Olivia Rodrigo"]),
    ("Shallow", &["Lady Gaga", "Bradley Cooper"]),
    ("Watermelon Sugar", &["Harry Styles"]),
    ("Bad Guy", &["Billie Eilish"]),
    ("Dance Monkey", &["Tones and I"]),
    ("Circles", &["Post Malone"]),
    ("Memories", &["Maroon 5"]),
    ("Señorita", &["Shawn Mendes", "Camila Cabello"]),
    ("Old Town Road", &["Lil Nas X", "Billy Ray Cyrus"]),
    ("Sunflower", &["Post Malone", "Swae Lee"]),
    ("Perfect", &["Ed Sheeran"]),
    ("Havana", &["Camila Cabello", "Young Thug"]),
    ("Closer", &["The Chainsmokers", "Halsey"]),
    ("Despacito", &["Luis Fonsi", "Daddy Yankee"]),
    ("Stay", &["The Kid LAROI", "Justin Bieber"]),
    ("Good 4 U", &["Olivia Rodrigo"]),
    ("Heat Waves", &["Glass Animals"]),
    ("Save Your Tears", &["The Weeknd"]),
    ("Peaches", &["Justin Bieber", "Daniel Caesar"]),
    ("Montero", &["Lil Nas X"]),
    ("Industry Baby", &["Lil Nas X", "Jack Harlow"]),
    ("Positions", &["Ariana Grande"]),
    ("Mood", &["24kGoldn", "iann dior"]),
    ("Therefore I Am", &["Billie Eilish"]),
    ("Dynamite", &["BTS"]),
    ("Butter", &["BTS"]),
    ("Permission to Dance", &["BTS"]),
    ("Easy On Me", &["Adele"]),
    ("Shivers", &["Ed Sheeran"]),
    ("Cold Heart", &["Elton John", "Dua Lipa"]),
    ("Essence", &["Wizkid", "Tems"]),
    ("Fancy Like", &["Walker Hayes"]),
    ("My Universe", &["Coldplay", "BTS"]),
    ("Beggin", &["Måneskin"]),
    ("Happier Than Ever", &["Billie Eilish"]),
    ("Kiss Me More", &["Doja Cat", "SZA"]),
    ("Woman", &["Doja Cat"]),
    ("Need to Know", &["Doja Cat"]),
    ("Take My Breath", &["The Weeknd"]),
    ("Bad Habits", &["Ed Sheeran"]),
    ("Stay With Me", &["Sam Smith"]),
    ("Love Yourself", &["Justin Bieber"]),
];

/// Extracts the numeric index from a `guest_<n>` player id.
pub fn guest_index(player_id: &str) -> Option<usize> {
    player_id.strip_prefix("guest_")?.parse().ok()
}

/// The access token handed to guest sessions; accepted only by the mock path.
pub fn mock_access_token(player_id: &str) -> String {
    format!("mock_token_{}", player_id)
}

/// Builds a deterministic mock profile for a guest slot.
///
/// Each index produces a stable shuffle of the track pool, so the same guest
/// rejoining gets the same listening history, while different guests overlap
/// on titles but disagree on ranks. That overlap is what makes guest-only
/// lobbies exercise the shared-track selection weighting.
pub fn mock_profile(index: usize) -> Profile {
    let mut name = GUEST_NAMES[index % GUEST_NAMES.len()].to_string();
    if index >= GUEST_NAMES.len() {
        name = format!("{}{}", name, index / GUEST_NAMES.len() + 1);
    }

    let mut shuffled: Vec<usize> = (0..MOCK_TRACK_POOL.len()).collect();
    let mut rng = StdRng::seed_from_u64(index as u64 * 12345);
    shuffled.shuffle(&mut rng);

    let top_tracks = (0..TOP_TRACKS_LIMIT)
        .map(|position| {
            let (title, artists) = MOCK_TRACK_POOL[shuffled[position % shuffled.len()]];
            Track {
                id: format!("mock_track_{}_{}", index, position),
                name: title.to_string(),
                artists: artists.iter().map(|a| a.to_string()).collect(),
                rank: position as u32 + 1,
                uri: format!("spotify:track:mock_{}_{}", index, position),
                image_url: "https://via.placeholder.com/300x300?text=Album+Art".to_string(),
                preview_url: String::new(),
            }
        })
        .collect();

    Profile {
        id: format!("guest_{}", index),
        name,
        top_tracks,
    }
}

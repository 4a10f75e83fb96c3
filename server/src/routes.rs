//! HTTP surface and WebSocket endpoint
//!
//! The endpoint holds no game state. A WebSocket session keeps only its
//! transient context (which room, which player id) and forwards every typed
//! command to the resolved room's channel; events flow back through a
//! per-connection queue drained by a writer task, so the room loop never
//! blocks on a slow socket.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use shared::{ClientMessage, ServerEvent};

use crate::config::Config;
use crate::provider::{self, SpotifyOauth, TrackProvider};
use crate::registry::RoomRegistry;
use crate::room::{send_to, ClientSocket, Room, RoomCommand, SocketFrame};

/// Shared handler context.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub provider: Arc<dyn TrackProvider>,
    pub oauth: Arc<SpotifyOauth>,
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(hello_world))
        .route("/health", get(health))
        .route("/rooms", get(list_rooms))
        .route("/auth/spotify", get(spotify_auth))
        .route("/auth/callback", get(spotify_callback))
        .route("/auth/guest", post(guest_auth))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Permissive CORS by default; switching to an explicit allow-list also
/// enables credentials, since a wildcard origin cannot carry them.
fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if config.allowed_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let origins = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok());
        layer
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
    }
}

async fn hello_world() -> Json<serde_json::Value> {
    Json(json!({ "message": "Hello World" }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let metrics = state.registry.metrics().await;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    Json(json!({
        "status": "healthy",
        "timestamp": timestamp,
        "metrics": metrics,
    }))
}

async fn list_rooms(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "rooms": state.registry.list().await }))
}

/// Begins the OAuth flow: issue a CSRF state, park it in a cookie and
/// redirect the browser to the provider's consent page.
async fn spotify_auth(State(state): State<AppState>) -> Response {
    let csrf_state: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();

    let authorize_url = state.oauth.authorize_url(&csrf_state);
    info!("Redirecting to Spotify auth");

    let mut response = Redirect::temporary(&authorize_url).into_response();
    append_cookie(
        &mut response,
        &format!("oauth_state={}; Max-Age=600; Path=/; HttpOnly", csrf_state),
    );
    response
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
}

async fn spotify_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(stored_state) = cookie_value(&headers, "oauth_state") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No state cookie found" })),
        )
            .into_response();
    };

    if stored_state != query.state {
        warn!("OAuth state mismatch");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "State mismatch" })),
        )
            .into_response();
    }

    let access_token = match state.oauth.exchange_code(&query.code).await {
        Ok(token) => token,
        Err(err) => {
            warn!("Token exchange failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to exchange code" })),
            )
                .into_response();
        }
    };

    let profile = match state.provider.fetch_profile(&access_token).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!("Failed to fetch player info: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch player info" })),
            )
                .into_response();
        }
    };

    info!(
        "Player info fetched: {} ({} top tracks)",
        profile.name,
        profile.top_tracks.len()
    );

    let session_json = json!({
        "id": profile.id,
        "name": profile.name,
        "spotify_id": profile.id,
        "access_token": access_token,
        "is_guest": false,
    })
    .to_string();

    let mut response =
        Redirect::temporary(&format!("{}/?auth=success", state.config.frontend_url))
            .into_response();
    append_cookie(&mut response, "oauth_state=; Max-Age=0; Path=/; HttpOnly");
    append_cookie(
        &mut response,
        &format!(
            "player_session={}; Max-Age=3600; Path=/",
            urlencoding::encode(&session_json)
        ),
    );
    response
}

#[derive(Deserialize)]
struct GuestRequest {
    guest_index: usize,
}

/// Creates a guest identity backed by mock listening data.
async fn guest_auth(Json(request): Json<GuestRequest>) -> Json<serde_json::Value> {
    let profile = provider::mock_profile(request.guest_index);
    info!("Guest player created: {} (ID: {})", profile.name, profile.id);

    let player_data = json!({
        "id": profile.id,
        "name": profile.name,
        "spotify_id": profile.id,
        "access_token": provider::mock_access_token(&profile.id),
        "is_guest": true,
    })
    .to_string();

    Json(json!({ "success": true, "player_data": player_data }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Transient per-connection context; the room owns everything else.
struct Session {
    room: Option<Room>,
    player_id: Option<String>,
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<SocketFrame>();

    // Writer task: drains the room-facing queue onto the socket, closing
    // cleanly when the room drops the member or the queue ends.
    tokio::spawn(async move {
        while let Some(frame) = socket_rx.recv().await {
            match frame {
                SocketFrame::Event(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                SocketFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session {
        room: None,
        player_id: None,
    };

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!("WebSocket read error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
                    // Unknown or malformed envelopes are dropped silently
                    debug!("Dropping unrecognized frame");
                    continue;
                };
                handle_client_message(&state, &socket_tx, &mut session, parsed).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Disconnect cleanup: at most one leave per connection
    if let (Some(room), Some(player_id)) = (session.room.take(), session.player_id.take()) {
        room.send(RoomCommand::Leave { player_id });
    }
}

async fn handle_client_message(
    state: &AppState,
    socket_tx: &ClientSocket,
    session: &mut Session,
    message: ClientMessage,
) {
    match message {
        ClientMessage::JoinRoom {
            room_id,
            player_id,
            player_name: _,
            access_token,
            is_guest,
        } => {
            let room = match state.registry.get(&room_id) {
                Ok(room) => room.clone(),
                Err(err) => {
                    send_to(
                        socket_tx,
                        &ServerEvent::Error {
                            message: err.to_string(),
                        },
                    );
                    return;
                }
            };

            let profile = if is_guest || provider::guest_index(&player_id).is_some() {
                provider::mock_profile(provider::guest_index(&player_id).unwrap_or(0))
            } else {
                match state.provider.fetch_profile(&access_token).await {
                    Ok(profile) => profile,
                    Err(err) => {
                        warn!("Failed to fetch player data: {}", err);
                        send_to(
                            socket_tx,
                            &ServerEvent::Error {
                                message: "Failed to fetch player data".to_string(),
                            },
                        );
                        return;
                    }
                }
            };

            session.player_id = Some(profile.id.clone());
            session.room = Some(room.clone());
            room.send(RoomCommand::Join {
                profile: Arc::new(profile),
                socket: socket_tx.clone(),
            });
        }
        ClientMessage::Ready {
            is_ready,
            player_id,
        } => {
            let Some(room) = &session.room else { return };
            let Some(player_id) = session.player_id.clone().or(player_id) else {
                return;
            };
            room.send(RoomCommand::SetReady {
                player_id,
                is_ready,
            });
        }
        ClientMessage::StartGame { total_rounds, .. } => {
            let Some(room) = &session.room else { return };
            room.send(RoomCommand::StartGame {
                total_rounds: clamp_rounds(total_rounds, state.config.default_total_rounds),
            });
        }
        ClientMessage::SubmitGuess {
            guessed_player_id, ..
        } => {
            let (Some(room), Some(player_id)) = (&session.room, &session.player_id) else {
                return;
            };
            room.send(RoomCommand::Guess {
                player_id: player_id.clone(),
                guessed_player_id,
                received_at: Instant::now(),
            });
        }
        ClientMessage::LeaveRoom {} => {
            if let (Some(room), Some(player_id)) = (session.room.take(), session.player_id.take())
            {
                room.send(RoomCommand::Leave { player_id });
            }
        }
    }
}

/// Non-positive requests fall back to the configured default round count.
fn clamp_rounds(total_rounds: i64, default: u32) -> u32 {
    if total_rounds <= 0 {
        default
    } else {
        u32::try_from(total_rounds).unwrap_or(default)
    }
}

fn append_cookie(response: &mut Response, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header_value in headers.get_all(header::COOKIE) {
        let Ok(raw) = header_value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

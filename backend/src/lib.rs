pub mod config;
pub mod identity;
pub mod service;
pub mod store;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use draw_core::{AssignmentPair, DrawError, Group, JoinError, Participant};
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::Config;
use crate::identity::{identify, require_admin, AuthError};
use crate::service::{Exchange, ExchangeError};
use crate::store::{GroupStore, InMemoryStore, StoreError, Versioned};

#[derive(Clone)]
pub struct AppState {
    exchange: Exchange,
    config: Arc<Config>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryStore::new()), Config::default())
    }
}

impl AppState {
    pub fn new(store: Arc<dyn GroupStore>, config: Config) -> Self {
        Self {
            exchange: Exchange::new(store, config.max_commit_retries),
            config: Arc::new(config),
        }
    }

    pub async fn from_config(config: Config) -> Result<Self, StoreError> {
        let store = match &config.persist_path {
            Some(path) => InMemoryStore::with_persistence(path.clone()).await?,
            None => InMemoryStore::new(),
        };
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/group", post(create_group))
        .route("/groups", get(list_groups))
        .route("/group/:id", get(get_group))
        .route("/join", post(join_group))
        .route("/group/:id/draw", post(run_draw))
        .route("/group/:id/participant/:participant_id", get(get_participant))
        .route(
            "/group/:id/participant/:participant_id/wishlist",
            put(update_wishlist),
        )
        .route("/ws/:id/:participant_id", get(ws_handler))
        .with_state(state)
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ExchangeError::GroupNotFound | ExchangeError::ParticipantNotFound => {
                StatusCode::NOT_FOUND
            }
            ExchangeError::InvalidName
            | ExchangeError::Join(JoinError::EmptyName)
            | ExchangeError::Draw(DrawError::InsufficientParticipants { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ExchangeError::GroupNameTaken
            | ExchangeError::Join(JoinError::DuplicateName(_))
            | ExchangeError::Join(JoinError::DrawCompleted)
            | ExchangeError::Draw(DrawError::AlreadyCompleted)
            | ExchangeError::Draw(DrawError::RosterChanged)
            | ExchangeError::CommitConflict => StatusCode::CONFLICT,
            ExchangeError::Draw(DrawError::InvalidAssignmentDetected(_))
            | ExchangeError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExchangeError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GroupView {
    id: String,
    name: String,
    version: u64,
    participants: Vec<Participant>,
    draw_completed: bool,
    created_at: u64,
    draw_completed_at: Option<u64>,
}

impl From<Versioned<Group>> for GroupView {
    fn from(record: Versioned<Group>) -> Self {
        let group = record.doc;
        Self {
            id: group.id,
            name: group.name,
            version: record.version,
            participants: group.participants,
            draw_completed: group.draw_completed,
            created_at: group.created_at,
            draw_completed_at: group.draw_completed_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RecipientView {
    id: String,
    name: String,
    wishlist: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ParticipantView {
    group_id: String,
    group_name: String,
    draw_completed: bool,
    me: Participant,
    roster: Vec<String>,
    recipient: Option<RecipientView>,
}

fn participant_view(group: &Group, participant_id: &str) -> Option<ParticipantView> {
    let me = group.participant(participant_id)?.clone();
    let recipient = group.recipient_of(participant_id).map(|r| RecipientView {
        id: r.id.clone(),
        name: r.name.clone(),
        wishlist: r.wishlist.clone(),
    });
    Some(ParticipantView {
        group_id: group.id.clone(),
        group_name: group.name.clone(),
        draw_completed: group.draw_completed,
        me,
        roster: group.participants.iter().map(|p| p.name.clone()).collect(),
        recipient,
    })
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
}

#[derive(Serialize)]
struct CreateGroupResponse {
    group_id: String,
}

#[derive(Deserialize)]
struct JoinRequest {
    group_name: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct JoinResponse {
    group_id: String,
    participant_id: String,
}

#[derive(Deserialize)]
struct WishlistRequest {
    wishlist: String,
}

#[derive(Deserialize)]
struct DrawParams {
    seed: Option<u64>,
}

#[derive(Serialize)]
struct DrawResponse {
    draw_completed: bool,
    assignments: Vec<AssignmentPair>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    State(ParticipantView),
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateGroupRequest>,
) -> Response {
    if let Err(err) = require_admin(&headers, &state.config) {
        return err.into_response();
    }

    match state.exchange.create_group(&payload.name).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(CreateGroupResponse {
                group_id: record.doc.id,
            }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn list_groups(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(err) = require_admin(&headers, &state.config) {
        return err.into_response();
    }

    match state.exchange.groups().await {
        Ok(groups) => {
            let views: Vec<GroupView> = groups.into_iter().map(GroupView::from).collect();
            (StatusCode::OK, Json(views)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = require_admin(&headers, &state.config) {
        return err.into_response();
    }

    match state.exchange.group(&group_id).await {
        Ok(record) => (StatusCode::OK, Json(GroupView::from(record))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn join_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<JoinRequest>,
) -> Response {
    let caller = identify(&headers, &state.config);
    let name = payload.name.unwrap_or(caller.name);

    match state.exchange.join_group(&payload.group_name, &name).await {
        Ok((record, participant)) => (
            StatusCode::OK,
            Json(JoinResponse {
                group_id: record.doc.id,
                participant_id: participant.id,
            }),
        )
            .into_response(),
        Err(err) => {
            debug!(group_name = %payload.group_name, name = %name, error = %err, "join refused");
            err.into_response()
        }
    }
}

async fn get_participant(
    State(state): State<AppState>,
    Path((group_id, participant_id)): Path<(String, String)>,
) -> Response {
    let record = match state.exchange.group(&group_id).await {
        Ok(record) => record,
        Err(err) => return err.into_response(),
    };

    match participant_view(&record.doc, &participant_id) {
        Some(view) => (StatusCode::OK, Json(view)).into_response(),
        None => ExchangeError::ParticipantNotFound.into_response(),
    }
}

async fn update_wishlist(
    State(state): State<AppState>,
    Path((group_id, participant_id)): Path<(String, String)>,
    Json(payload): Json<WishlistRequest>,
) -> Response {
    match state
        .exchange
        .update_wishlist(&group_id, &participant_id, &payload.wishlist)
        .await
    {
        Ok(participant) => (StatusCode::OK, Json(participant)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn run_draw(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<DrawParams>,
) -> Response {
    if let Err(err) = require_admin(&headers, &state.config) {
        return err.into_response();
    }

    if params.seed.is_some() && !state.config.allow_draw_seed {
        return (StatusCode::BAD_REQUEST, "seeded draws are disabled").into_response();
    }

    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy);

    match state.exchange.run_draw(&group_id, &mut rng).await {
        Ok((record, assignment)) => (
            StatusCode::OK,
            Json(DrawResponse {
                draw_completed: record.doc.draw_completed,
                assignments: assignment.into_pairs(),
            }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((group_id, participant_id)): Path<(String, String)>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, group_id, participant_id))
}

async fn handle_socket(
    stream: WebSocket,
    state: AppState,
    group_id: String,
    participant_id: String,
) {
    let (mut sender, mut receiver) = stream.split();

    // Subscribe before the snapshot read so no commit falls in between.
    let rx = match state.exchange.subscribe(&group_id).await {
        Ok(rx) => rx,
        Err(err) => {
            let _ = sender.send(Message::Text(err.to_string())).await;
            return;
        }
    };

    let snapshot = match state.exchange.group(&group_id).await {
        Ok(record) => participant_view(&record.doc, &participant_id),
        Err(err) => {
            let _ = sender.send(Message::Text(err.to_string())).await;
            return;
        }
    };
    let Some(snapshot) = snapshot else {
        let _ = sender.send(Message::Text("unknown participant".into())).await;
        return;
    };

    if send_state(&mut sender, snapshot).await.is_err() {
        return;
    }

    let mut send_task = tokio::spawn(forward_updates(rx, sender, participant_id));

    // Nothing is accepted from clients; read only to notice the close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn forward_updates(
    mut rx: broadcast::Receiver<Versioned<Group>>,
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    participant_id: String,
) {
    loop {
        let record = match rx.recv().await {
            Ok(record) => record,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "subscriber lagged, waiting for the next commit");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(view) = participant_view(&record.doc, &participant_id) else {
            break;
        };
        if send_state(&mut sender, view).await.is_err() {
            break;
        }
    }
}

async fn send_state(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    view: ParticipantView,
) -> Result<(), axum::Error> {
    match serde_json::to_string(&ServerMessage::State(view)) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(err) => {
            warn!(error = %err, "could not encode participant view");
            Ok(())
        }
    }
}

//! HTTP surface: mutation routes, the snapshot query and the `/ws` stream.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastHub, OutboundMessage, SendOutcome, SubscriptionState};
use crate::error::GameError;
use crate::game_service::{CollectOutcome, GameService};
use crate::types::{ActionResponse, CrateActionRequest, Snapshot, UpdatePositionRequest};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GameService>,
    pub hub: Arc<BroadcastHub>,
}

impl AppState {
    pub fn new(service: Arc<GameService>, hub: Arc<BroadcastHub>) -> Self {
        Self { service, hub }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/state", get(state_handler))
        .route("/update-position", post(update_position))
        .route("/update-position/", post(update_position))
        .route("/pick-up", post(pick_up))
        .route("/pick-up/", post(pick_up))
        .route("/pick_up", post(pick_up))
        .route("/pick_up/", post(pick_up))
        .route("/deliver", post(deliver))
        .route("/deliver/", post(deliver))
        .route("/collect-item", post(collect_item))
        .route("/collect-item/", post(collect_item))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        // Unknown crates and refused transitions look the same to clients.
        let message = match self {
            GameError::Validation(message) => message,
            GameError::Conflict(_) | GameError::NotFound(_) => {
                "Cannot collect/deliver item".to_string()
            }
        };
        (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
    }
}

fn reject_body(rejection: JsonRejection) -> GameError {
    GameError::Validation(rejection.body_text())
}

fn require_id<'a>(field: &str, value: &'a str) -> Result<&'a str, GameError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GameError::Validation(format!("{field} must not be blank")));
    }
    Ok(trimmed)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn state_handler(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.service.snapshot())
}

async fn update_position(
    State(state): State<AppState>,
    payload: Result<Json<UpdatePositionRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, GameError> {
    let Json(request) = payload.map_err(reject_body)?;
    let player = require_id("player", &request.player)?;
    state.service.update_position(player, request.x, request.y);
    Ok(Json(ActionResponse::message("Position updated")))
}

async fn pick_up(
    State(state): State<AppState>,
    payload: Result<Json<CrateActionRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, GameError> {
    let Json(request) = payload.map_err(reject_body)?;
    let player = require_id("player", &request.player)?;
    let crate_id = require_id("crateId", &request.crate_id)?;
    state.service.pick_up(player, crate_id).await?;
    Ok(Json(ActionResponse::message(format!(
        "{player} picked up {crate_id}"
    ))))
}

async fn deliver(
    State(state): State<AppState>,
    payload: Result<Json<CrateActionRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, GameError> {
    let Json(request) = payload.map_err(reject_body)?;
    let player = require_id("player", &request.player)?;
    let crate_id = require_id("crateId", &request.crate_id)?;
    let score = state.service.deliver(player, crate_id).await?;
    Ok(Json(ActionResponse::with_score(
        format!("{player} delivered {crate_id}"),
        score,
    )))
}

async fn collect_item(
    State(state): State<AppState>,
    payload: Result<Json<CrateActionRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, GameError> {
    let Json(request) = payload.map_err(reject_body)?;
    let player = require_id("player", &request.player)?;
    let crate_id = require_id("item", &request.crate_id)?;
    let response = match state.service.collect(player, crate_id).await? {
        CollectOutcome::PickedUp(_) => ActionResponse::message(format!("{player} collected {crate_id}")),
        CollectOutcome::Delivered { score } => {
            ActionResponse::with_score(format!("{player} delivered {crate_id}"), score)
        }
    };
    Ok(Json(response))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let mut subscription_state = SubscriptionState::Connecting;
    let Some(subscription) = state.hub.subscribe() else {
        debug!("rejecting subscriber during shutdown");
        return;
    };
    let subscriber_id = subscription.id;
    debug!(subscriber_id, ?subscription_state, "subscriber connecting");

    let (ws_sender, mut ws_receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_sender, subscription.receiver));

    subscription_state = match state
        .hub
        .send_snapshot_to(subscriber_id, &state.service.snapshot())
    {
        SendOutcome::Queued => {
            info!(subscriber_id, subscribers = state.hub.subscriber_count(), "subscriber open");
            SubscriptionState::Open
        }
        _ => SubscriptionState::Failed,
    };

    while !subscription_state.is_terminal() {
        subscription_state = tokio::select! {
            result = &mut writer => writer_end_state(result),
            received = ws_receiver.next() => match received {
                None | Some(Ok(Message::Close(_))) => SubscriptionState::Closed,
                Some(Err(error)) => {
                    debug!(subscriber_id, %error, "websocket receive failed");
                    SubscriptionState::Failed
                }
                // Clients only listen; anything they send is ignored.
                Some(Ok(_)) => subscription_state,
            },
        };
    }

    state.hub.unsubscribe(subscriber_id);
    writer.abort();
    match subscription_state {
        SubscriptionState::Failed => warn!(subscriber_id, "subscriber failed"),
        _ => info!(subscriber_id, "subscriber closed"),
    }
}

fn writer_end_state(result: Result<SubscriptionState, JoinError>) -> SubscriptionState {
    result.unwrap_or(SubscriptionState::Failed)
}

async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundMessage>,
) -> SubscriptionState {
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            OutboundMessage::Text(payload) => ws_sender.send(Message::Text(payload.into())).await,
            OutboundMessage::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return SubscriptionState::Closed;
            }
        };
        if result.is_err() {
            return SubscriptionState::Failed;
        }
    }
    SubscriptionState::Closed
}

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch;
use crate::relay::Channel;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentSocketMessage {
    Location { lat: f64, lng: f64 },
}

pub async fn agent_socket(
    ws: WebSocketUpgrade,
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_channel(socket, state, Channel::Agent(id), Some(id)))
}

pub async fn order_socket(
    ws: WebSocketUpgrade,
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_channel(socket, state, Channel::Order(id), None))
}

pub async fn shop_socket(
    ws: WebSocketUpgrade,
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_channel(socket, state, Channel::Shop(id), None))
}

async fn serve_channel(
    socket: WebSocket,
    state: Arc<AppState>,
    channel: Channel,
    inbound_agent: Option<Uuid>,
) {
    let connection_id = Uuid::new_v4();
    state.relay.register(channel, connection_id);
    state.metrics.connected_clients.inc();
    info!(channel = %channel, connection_id = %connection_id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.relay.subscribe(channel));

    let mut send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket consumer lagging, events dropped");
                    continue;
                }
            };
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize relay event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let inbound_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else { continue };
            let Some(agent_id) = inbound_agent else { continue };

            match serde_json::from_str::<AgentSocketMessage>(&text) {
                Ok(AgentSocketMessage::Location { lat, lng }) => {
                    if let Err(err) =
                        dispatch::record_location(&inbound_state, agent_id, lat, lng)
                    {
                        warn!(agent_id = %agent_id, error = %err, "inbound location rejected");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "unreadable agent socket message");
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let session = state.relay.unregister(channel, connection_id);
    state.metrics.connected_clients.dec();
    let connected_secs = session
        .map(|info| (Utc::now() - info.connected_at).num_seconds())
        .unwrap_or(0);
    info!(
        channel = %channel,
        connection_id = %connection_id,
        connected_secs,
        "websocket client disconnected"
    );
}

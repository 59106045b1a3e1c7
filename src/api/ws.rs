use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use serde::Deserialize;
use serde_json::json;
use tokio::select;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::routes::AppState;
use crate::messages::ToStageManagerMessage;
use crate::stage::model::AudioFrame;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    UpdateDeviceValue {
        device_id: String,
        channel_idx: usize,
        value: i64,
    },
    AudioData {
        #[serde(default)]
        data: AudioFrame,
    },
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before fetching the snapshot so a delta published in
    // between is queued rather than missed.
    let mut updates = state.bus.subscribe();

    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .to_stage
        .send(ToStageManagerMessage::GetSnapshot(reply_tx))
        .await
        .is_err()
    {
        return;
    }
    let snapshot = match reply_rx.await {
        Ok(snapshot) => snapshot,
        Err(_) => return,
    };

    let initial = json!({
        "type": "initial_data",
        "devices": snapshot.devices,
        "scenes": snapshot.scenes,
        "groups": snapshot.groups,
        "effects": snapshot.effects,
        "sequences": snapshot.sequences,
    });
    if socket
        .send(Message::Text(initial.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    info!("Push client connected");

    loop {
        select! {
            update = updates.recv() => match update {
                Ok(payload) => {
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Push client lagged, dropped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => handle_client_message(&state, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Push client error: {}", e);
                    break;
                }
            },
        }
    }

    info!("Push client disconnected");
}

async fn handle_client_message(state: &AppState, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid push channel message: {}", e);
            return;
        }
    };

    match message {
        ClientMessage::UpdateDeviceValue {
            device_id,
            channel_idx,
            value,
        } => {
            let _ = state
                .to_stage
                .send(ToStageManagerMessage::SetDeviceChannel {
                    device_id,
                    channel_idx,
                    value,
                })
                .await;
        }
        ClientMessage::AudioData { data } => {
            let _ = state
                .to_stage
                .send(ToStageManagerMessage::UpdateAudio(data))
                .await;
        }
    }
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::messages::ToStageManagerMessage;
use crate::push_bus::PushBusHandle;
use crate::stage::model::{
    CompanionTrigger, DeviceCreate, EffectCreate, GroupCreate, GroupUpdate, GroupValues,
    SceneCreate, SequenceCreate, SequenceUpdate,
};
use crate::stage::StageError;

#[derive(Clone)]
pub struct AppState {
    pub to_stage: mpsc::Sender<ToStageManagerMessage>,
    pub bus: PushBusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(get_devices).post(add_device))
        .route("/api/devices/{id}", delete(delete_device))
        .route("/api/devices/{id}/values", post(update_device_values))
        .route("/api/scenes", get(get_scenes).post(add_scene))
        .route("/api/scenes/{id}", delete(delete_scene))
        .route("/api/scenes/{id}/activate", post(activate_scene))
        .route("/api/groups", get(get_groups).post(add_group))
        .route("/api/groups/{id}", put(update_group).delete(delete_group))
        .route("/api/groups/{id}/values", post(update_group_values))
        .route("/api/effects", get(get_effects).post(create_effect))
        .route("/api/effects/{id}", delete(delete_effect))
        .route("/api/effects/{id}/start", post(start_effect))
        .route("/api/effects/{id}/stop", post(stop_effect))
        .route("/api/sequences", get(get_sequences).post(create_sequence))
        .route(
            "/api/sequences/{id}",
            put(update_sequence).delete(delete_sequence),
        )
        .route("/api/sequences/{id}/play", post(play_sequence))
        .route("/api/sequences/{id}/stop", post(stop_sequence))
        .route("/api/companion/actions", get(companion_actions))
        .route("/api/companion/trigger", post(companion_trigger))
        .route("/ws", get(super::ws::ws_handler))
        .with_state(state)
}

/// Round-trip one command to the stage manager.
async fn call<R>(
    state: &AppState,
    build: impl FnOnce(oneshot::Sender<R>) -> ToStageManagerMessage,
) -> Result<R, Response> {
    let (reply_tx, reply_rx) = oneshot::channel();

    if state.to_stage.send(build(reply_tx)).await.is_err() {
        return Err(service_unavailable());
    }
    reply_rx.await.map_err(|_| service_unavailable())
}

fn service_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"success": false, "error": "Controller is shutting down"})),
    )
        .into_response()
}

/// Validation and limit errors are client errors; a missing id answers
/// with the error in the envelope and no state change.
fn stage_error(e: StageError) -> Response {
    let body = Json(json!({"success": false, "error": e.to_string()}));

    if e.is_not_found() {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

fn reply<T: serde::Serialize>(
    result: Result<Result<T, StageError>, Response>,
    ok: impl FnOnce(T) -> Value,
) -> Response {
    match result {
        Ok(Ok(value)) => Json(ok(value)).into_response(),
        Ok(Err(e)) => stage_error(e),
        Err(response) => response,
    }
}

// --- devices ---

async fn get_devices(State(state): State<AppState>) -> Response {
    match call(&state, ToStageManagerMessage::GetSnapshot).await {
        Ok(snapshot) => Json(json!({"devices": snapshot.devices})).into_response(),
        Err(response) => response,
    }
}

async fn add_device(State(state): State<AppState>, Json(payload): Json<DeviceCreate>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::AddDevice(payload, tx)).await,
        |device| json!({"success": true, "device": device}),
    )
}

async fn delete_device(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::RemoveDevice(id, tx)).await,
        |_| json!({"success": true}),
    )
}

#[derive(Debug, Deserialize)]
struct ValuesPayload {
    values: Vec<i64>,
}

async fn update_device_values(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ValuesPayload>,
) -> Response {
    reply(
        call(&state, |tx| {
            ToStageManagerMessage::SetDeviceValues(id, payload.values, tx)
        })
        .await,
        |_| json!({"success": true}),
    )
}

// --- scenes ---

async fn get_scenes(State(state): State<AppState>) -> Response {
    match call(&state, ToStageManagerMessage::GetSnapshot).await {
        Ok(snapshot) => Json(json!({"scenes": snapshot.scenes})).into_response(),
        Err(response) => response,
    }
}

async fn add_scene(State(state): State<AppState>, Json(payload): Json<SceneCreate>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::AddScene(payload, tx)).await,
        |scene| json!({"success": true, "scene": scene}),
    )
}

async fn delete_scene(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::RemoveScene(id, tx)).await,
        |_| json!({"success": true}),
    )
}

async fn activate_scene(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::ActivateScene(id, tx)).await,
        |_| json!({"success": true, "fading": true}),
    )
}

// --- groups ---

async fn get_groups(State(state): State<AppState>) -> Response {
    match call(&state, ToStageManagerMessage::GetSnapshot).await {
        Ok(snapshot) => Json(json!({"groups": snapshot.groups})).into_response(),
        Err(response) => response,
    }
}

async fn add_group(State(state): State<AppState>, Json(payload): Json<GroupCreate>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::AddGroup(payload, tx)).await,
        |group| json!({"success": true, "group": group}),
    )
}

async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<GroupUpdate>,
) -> Response {
    reply(
        call(&state, |tx| {
            ToStageManagerMessage::UpdateGroup(id, payload, tx)
        })
        .await,
        |group| json!({"success": true, "group": group}),
    )
}

async fn delete_group(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::RemoveGroup(id, tx)).await,
        |_| json!({"success": true}),
    )
}

async fn update_group_values(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<GroupValues>,
) -> Response {
    reply(
        call(&state, |tx| {
            ToStageManagerMessage::SetGroupValues(id, payload, tx)
        })
        .await,
        |_| json!({"success": true}),
    )
}

// --- effects ---

async fn get_effects(State(state): State<AppState>) -> Response {
    match call(&state, ToStageManagerMessage::GetSnapshot).await {
        Ok(snapshot) => Json(json!({
            "effects": snapshot.effects,
            "available_types": available_effect_types(),
        }))
        .into_response(),
        Err(response) => response,
    }
}

fn available_effect_types() -> Value {
    json!([
        {"id": "strobe", "name": "Strobe", "params": ["speed"]},
        {"id": "rainbow", "name": "Rainbow", "params": ["speed"]},
        {"id": "chase", "name": "Chase", "params": ["speed"]},
        {"id": "pulse", "name": "Pulse", "params": ["speed"]},
        {"id": "color_fade", "name": "Color Fade", "params": ["speed", "colors"]},
        {"id": "sound_reactive", "name": "Sound Reactive", "params": ["mode", "frequency_band", "sensitivity"]},
        {"id": "fire", "name": "Fire", "params": ["speed", "intensity"]},
        {"id": "lightning", "name": "Lightning", "params": ["min_delay", "max_delay"]},
        {"id": "scanner", "name": "Scanner", "params": ["speed", "range"]},
        {"id": "matrix", "name": "Matrix", "params": ["speed", "pattern"]},
        {"id": "twinkle", "name": "Twinkle", "params": ["speed", "density"]},
        {"id": "custom", "name": "Custom", "params": ["keyframes", "duration", "mode"]},
    ])
}

async fn create_effect(
    State(state): State<AppState>,
    Json(payload): Json<EffectCreate>,
) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::AddEffect(payload, tx)).await,
        |effect| json!({"success": true, "effect": effect}),
    )
}

async fn delete_effect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::RemoveEffect(id, tx)).await,
        |_| json!({"success": true}),
    )
}

async fn start_effect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::StartEffect(id, tx)).await,
        |_| json!({"success": true}),
    )
}

async fn stop_effect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match call(&state, |tx| ToStageManagerMessage::StopEffect(id, tx)).await {
        Ok(stopped) => Json(json!({"success": stopped})).into_response(),
        Err(response) => response,
    }
}

// --- sequences ---

async fn get_sequences(State(state): State<AppState>) -> Response {
    match call(&state, ToStageManagerMessage::GetSnapshot).await {
        Ok(snapshot) => Json(json!({"sequences": snapshot.sequences})).into_response(),
        Err(response) => response,
    }
}

async fn create_sequence(
    State(state): State<AppState>,
    Json(payload): Json<SequenceCreate>,
) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::AddSequence(payload, tx)).await,
        |sequence| json!({"success": true, "sequence": sequence}),
    )
}

async fn update_sequence(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SequenceUpdate>,
) -> Response {
    reply(
        call(&state, |tx| {
            ToStageManagerMessage::UpdateSequence(id, payload, tx)
        })
        .await,
        |sequence| json!({"success": true, "sequence": sequence}),
    )
}

async fn delete_sequence(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::RemoveSequence(id, tx)).await,
        |_| json!({"success": true}),
    )
}

async fn play_sequence(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(
        call(&state, |tx| ToStageManagerMessage::PlaySequence(id, tx)).await,
        |_| json!({"success": true}),
    )
}

async fn stop_sequence(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match call(&state, |tx| ToStageManagerMessage::StopSequence(id, tx)).await {
        Ok(stopped) => Json(json!({"success": stopped})).into_response(),
        Err(response) => response,
    }
}

// --- companion ---

async fn companion_actions(State(state): State<AppState>) -> Response {
    match call(&state, ToStageManagerMessage::CompanionActions).await {
        Ok(actions) => Json(json!({"actions": actions})).into_response(),
        Err(response) => response,
    }
}

async fn companion_trigger(
    State(state): State<AppState>,
    Json(payload): Json<CompanionTrigger>,
) -> Response {
    reply(
        call(&state, |tx| {
            ToStageManagerMessage::CompanionTrigger(payload, tx)
        })
        .await,
        |_| json!({"success": true}),
    )
}

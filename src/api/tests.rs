#[cfg(test)]
mod test_rest {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::api::{router, AppState};
    use crate::artnet::Transmitter;
    use crate::messages::PushEvent;
    use crate::push_bus;
    use crate::stage::StageManager;
    use crate::store::Store;

    fn test_app(dir: &tempfile::TempDir) -> (Router, CancellationToken) {
        let cancel = CancellationToken::new();
        let (to_stage_tx, to_stage_rx) = tokio::sync::mpsc::channel(32);
        let (push_tx, push_rx) = async_channel::bounded::<PushEvent>(64);
        let store = Store::open(dir.path().join("state")).unwrap();
        let bus = push_bus::new_bus();

        let cancel_instance = cancel.clone();
        tokio::spawn(async move {
            let transmitter = Transmitter::new(true).unwrap();
            let mut manager = StageManager::new(transmitter, store, push_tx);
            manager.load();
            manager.run(cancel_instance, to_stage_rx).await;
        });

        let cancel_instance = cancel.clone();
        let bus_instance = bus.clone();
        tokio::spawn(async move {
            push_bus::run(cancel_instance, push_rx, bus_instance).await;
        });

        (
            router(AppState {
                to_stage: to_stage_tx,
                bus,
            }),
            cancel,
        )
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        (status, value)
    }

    fn device_payload() -> Value {
        json!({
            "name": "L1",
            "ip": "10.0.0.5",
            "universe": 0,
            "start_channel": 1,
            "channel_count": 3,
            "device_type": "rgb",
        })
    }

    #[tokio::test]
    async fn device_create_and_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (app, cancel) = test_app(&dir);

        let (status, body) = request(&app, "POST", "/api/devices", Some(device_payload())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["device"]["name"], json!("L1"));
        assert_eq!(body["device"]["values"], json!([0, 0, 0]));
        let id = body["device"]["id"].as_str().unwrap().to_string();

        let (status, body) = request(&app, "GET", "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"].as_array().unwrap().len(), 1);
        assert_eq!(body["devices"][0]["id"], json!(id));

        cancel.cancel();
    }

    #[tokio::test]
    async fn invalid_ip_is_a_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let (app, cancel) = test_app(&dir);

        let mut payload = device_payload();
        payload["ip"] = json!("not-an-ip");

        let (status, body) = request(&app, "POST", "/api/devices", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));

        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_device_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, cancel) = test_app(&dir);

        let (status, body) = request(
            &app,
            "POST",
            "/api/devices/device_404/values",
            Some(json!({"values": [1, 2, 3]})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("not found"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn scene_activation_reports_fading() {
        let dir = tempfile::tempdir().unwrap();
        let (app, cancel) = test_app(&dir);

        let (_, body) = request(&app, "POST", "/api/devices", Some(device_payload())).await;
        let device_name = body["device"]["name"].as_str().unwrap().to_string();

        let (status, body) = request(
            &app,
            "POST",
            "/api/scenes",
            Some(json!({
                "name": "warm",
                "device_values": {device_name: [255, 128, 0]},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let scene_id = body["scene"]["id"].as_str().unwrap().to_string();

        let (status, body) = request(
            &app,
            "POST",
            &format!("/api/scenes/{}/activate", scene_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["fading"], json!(true));

        cancel.cancel();
    }

    #[tokio::test]
    async fn effect_lifecycle_over_rest() {
        let dir = tempfile::tempdir().unwrap();
        let (app, cancel) = test_app(&dir);

        let (_, body) = request(&app, "POST", "/api/devices", Some(device_payload())).await;
        let device_id = body["device"]["id"].as_str().unwrap().to_string();

        let (status, body) = request(
            &app,
            "POST",
            "/api/effects",
            Some(json!({
                "name": "blinder",
                "type": "strobe",
                "target_ids": [device_id],
                "params": {"speed": 0.1},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let effect_id = body["effect"]["id"].as_str().unwrap().to_string();

        let (status, body) =
            request(&app, "POST", &format!("/api/effects/{}/start", effect_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));

        let (_, body) =
            request(&app, "POST", &format!("/api/effects/{}/stop", effect_id), None).await;
        assert_eq!(body["success"], json!(true));

        // A second stop has nothing left to stop.
        let (_, body) =
            request(&app, "POST", &format!("/api/effects/{}/stop", effect_id), None).await;
        assert_eq!(body["success"], json!(false));

        cancel.cancel();
    }

    #[tokio::test]
    async fn effects_listing_includes_the_type_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let (app, cancel) = test_app(&dir);

        let (status, body) = request(&app, "GET", "/api/effects", None).await;
        assert_eq!(status, StatusCode::OK);

        let types: Vec<&str> = body["available_types"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert!(types.contains(&"strobe"));
        assert!(types.contains(&"custom"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn companion_actions_list_created_entities() {
        let dir = tempfile::tempdir().unwrap();
        let (app, cancel) = test_app(&dir);

        let (_, body) = request(&app, "POST", "/api/devices", Some(device_payload())).await;
        let device_id = body["device"]["id"].as_str().unwrap().to_string();

        let (_, _) = request(
            &app,
            "POST",
            "/api/groups",
            Some(json!({"name": "front", "device_ids": [device_id]})),
        )
        .await;

        let (status, body) = request(&app, "GET", "/api/companion/actions", None).await;
        assert_eq!(status, StatusCode::OK);

        let actions = body["actions"].as_array().unwrap();
        assert!(actions
            .iter()
            .any(|a| a["type"] == json!("group") && a["name"] == json!("Group: front")));

        cancel.cancel();
    }
}

//! Integration tests for eht-detect API endpoints

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use eht_detect::api::USER_ID_HEADER;
use helpers::{create_test_app, label_png_base64, write_npy_stack, DatasetDir};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

/// Send a request as `user` (or anonymously) and decode the JSON reply
async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<i64>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user.to_string());
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_string(&value).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Load a three-layer stack with masks as user 1
async fn loaded_session(app: &Router, data: &DatasetDir) -> i64 {
    write_npy_stack(&data.path("stack.npy"), 3, 4, 4, None);
    write_npy_stack(&data.path("masks.npy"), 3, 4, 4, Some(0));

    let (status, json) = send(
        app,
        "POST",
        "/detection/load",
        Some(1),
        Some(json!({
            "dataset_path": data.arg("stack.npy"),
            "mask_path": data.arg("masks.npy"),
            "project_name": "Stack review"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json["session_id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _engine) = create_test_app().await;

    let (status, json) = send(&app, "GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "eht-detect");
    assert_eq!(json["cached_sessions"], 0);
}

#[tokio::test]
async fn test_requests_without_identity_are_unauthorized() {
    let (app, _engine) = create_test_app().await;

    let (status, json) = send(&app, "GET", "/detection/stats?session_id=1", None, None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_load_response_shape() {
    let (app, _engine) = create_test_app().await;
    let data = DatasetDir::new();
    write_npy_stack(&data.path("stack.npy"), 3, 4, 6, None);

    let (status, json) = send(
        &app,
        "POST",
        "/detection/load",
        Some(1),
        Some(json!({ "dataset_path": data.arg("stack.npy") })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["session_id"].is_i64());
    assert_eq!(json["total_layers"], 3);
    assert_eq!(json["project_name"], "Untitled Project");
    assert_eq!(json["is_3d"], true);
    assert_eq!(json["image_shape"], json!([4, 6]));
    assert_eq!(json["has_masks"], false);
}

#[tokio::test]
async fn test_layers_page_carries_data_uris() {
    let (app, _engine) = create_test_app().await;
    let data = DatasetDir::new();
    let session_id = loaded_session(&app, &data).await;

    let uri = format!(
        "/detection/layers?session_id={}&page=1&page_size=2&enhance=false",
        session_id
    );
    let (status, json) = send(&app, "GET", &uri, Some(1), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 3);
    assert_eq!(json["page"], 1);
    assert_eq!(json["page_size"], 2);
    assert_eq!(json["total_pages"], 2);

    let layers = json["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[0]["layer_index"], 0);
    assert_eq!(layers[0]["layer_name"], "Layer 1");
    assert_eq!(layers[0]["classification"], "error");
    for layer in layers {
        let image = layer["image_base64"].as_str().unwrap();
        let mask = layer["mask_base64"].as_str().unwrap();
        assert!(image.starts_with("data:image/png;base64,"));
        assert!(mask.starts_with("data:image/png;base64,"));
    }

    let uri = format!("/detection/layers?session_id={}&include_images=false", session_id);
    let (status, json) = send(&app, "GET", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["layers"][0]["image_base64"].is_null());
}

#[tokio::test]
async fn test_invalid_page_is_bad_request() {
    let (app, _engine) = create_test_app().await;
    let data = DatasetDir::new();
    let session_id = loaded_session(&app, &data).await;

    let uri = format!("/detection/layers?session_id={}&page=9", session_id);
    let (status, json) = send(&app, "GET", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "INVALID_INPUT");

    let (status, json) = send(&app, "GET", "/detection/layers?page=1", Some(1), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_classify_and_stats() {
    let (app, _engine) = create_test_app().await;
    let data = DatasetDir::new();
    let session_id = loaded_session(&app, &data).await;

    let uri = format!("/detection/layers?session_id={}&include_images=false", session_id);
    let (_, page) = send(&app, "GET", &uri, Some(1), None).await;
    let first_id = page["layers"][0]["id"].as_i64().unwrap();

    let (status, json) = send(
        &app,
        "POST",
        "/detection/classify",
        Some(1),
        Some(json!({
            "session_id": session_id,
            "layer_ids": [first_id, 9999],
            "classification": "incorrect"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["updated_count"], 1);

    let uri = format!("/detection/stats?session_id={}", session_id);
    let (status, json) = send(&app, "GET", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["incorrect"], 1);
    assert_eq!(json["error"], 2);
    assert_eq!(json["total"], 3);
    assert_eq!(json["reviewed"], 1);
    assert_eq!(json["progress_percent"], 33.33);

    // Another user sees nothing
    let (status, json) = send(&app, "GET", &uri, Some(2), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_save_mask_endpoint() {
    let (app, _engine) = create_test_app().await;
    let data = DatasetDir::new();
    let session_id = loaded_session(&app, &data).await;

    let (status, json) = send(
        &app,
        "POST",
        "/detection/mask",
        Some(1),
        Some(json!({
            "session_id": session_id,
            "layer_index": 2,
            "mask_base64": label_png_base64(4, 4, 3, 3)
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Mask saved for layer 2");

    let (status, json) = send(
        &app,
        "POST",
        "/detection/mask",
        Some(1),
        Some(json!({
            "session_id": session_id,
            "layer_index": 3,
            "mask_base64": label_png_base64(4, 4, 3, 3)
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (app, _engine) = create_test_app().await;

    let (status, json) = send(
        &app,
        "POST",
        "/detection/classify",
        Some(1),
        Some(json!({ "session_id": 1 })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_delete_session_endpoint() {
    let (app, engine) = create_test_app().await;
    let data = DatasetDir::new();
    let session_id = loaded_session(&app, &data).await;

    let uri = format!("/detection/session/{}", session_id);
    let (status, _) = send(&app, "DELETE", &uri, Some(2), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = send(&app, "DELETE", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json["message"],
        format!("Session {} deleted successfully", session_id)
    );
    assert_eq!(engine.cached_sessions().await, 0);

    let (status, _) = send(&app, "DELETE", &uri, Some(1), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::util::ServiceExt;

use common::{send_json, TestApp};

#[tokio::test]
async fn health_and_root() {
    let app = TestApp::new(&[]);

    let (status, payload) = send_json(&app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({"status": "ok"}));

    let (status, payload) = send_json(&app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(payload
        .as_str()
        .is_some_and(|text| text.starts_with("This is a Chat Relay server")));

    let (status, _) = send_json(&app.app, Method::GET, "/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn openapi_lists_session_routes() {
    let app = TestApp::new(&[]);
    let (status, doc) = send_json(&app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);

    let paths = doc["paths"].as_object().expect("paths");
    for path in [
        "/v1/health",
        "/v1/sessions/{session_id}/stream",
        "/v1/sessions/{session_id}/messages/stream",
        "/v1/sessions/{session_id}/messages/input",
        "/v1/sessions/{session_id}/config",
        "/v1/sessions/{session_id}/records",
        "/v1/sessions/{session_id}/timeout/stop",
        "/v1/sessions/{session_id}/timeout/restart",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
    assert_eq!(doc["servers"][0]["url"], "http://localhost:2480");
}

#[tokio::test]
async fn empty_message_is_a_problem() {
    let app = TestApp::new(&[]);
    let (status, problem) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/5/messages/stream",
        Some(json!({"userId": 1, "content": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:chat-relay:error:invalid_request");
    assert_eq!(problem["status"], 400);
}

#[tokio::test]
async fn message_stream_opens_sse_and_stores_user_message() {
    let app = TestApp::new(&["Hi"]);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/sessions/8/messages/stream")
        .header("content-type", "application/json")
        .body(Body::from(json!({"userId": 2, "content": "Hello"}).to_string()))
        .expect("request");
    let response = app
        .app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));

    let mut body = response.into_body();
    let first = body
        .frame()
        .await
        .expect("first frame")
        .expect("frame ok")
        .into_data()
        .expect("data frame");
    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: connection"), "{text}");
    drop(body);

    let (status, payload) =
        send_json(&app.app, Method::GET, "/v1/sessions/8/records", None).await;
    assert_eq!(status, StatusCode::OK);
    let first_record = &payload["records"][0];
    assert_eq!(first_record["content"], "Hello");
    assert_eq!(first_record["sequence"], 1);
    assert_eq!(first_record["messageType"], "user");
    assert_eq!(first_record["direction"], true);
}

#[tokio::test]
async fn config_is_recorded_without_a_connection() {
    let app = TestApp::new(&[]);
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/3/config",
        Some(json!({"userId": 1, "agentType": "writer", "model": "small-model"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["applied"], true);
    assert_eq!(payload["record"]["messageType"], "config");
    assert_eq!(
        payload["record"]["content"],
        "Configure LLM: small-model (Agent: writer)"
    );

    let submitted = app.agent.submitted();
    assert_eq!(submitted[0].input_type, "config");
    assert_eq!(submitted[0].metadata["agent_type"], "writer");
}

#[tokio::test]
async fn input_reports_acceptance() {
    let app = TestApp::new(&[]);
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/3/messages/input",
        Some(json!({"userId": 1, "content": "stop that", "inputType": "intervention"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({"accepted": true}));

    let (_, payload) = send_json(
        &app.app,
        Method::POST,
        "/v1/sessions/3/messages/input",
        Some(json!({"userId": 1, "content": "reject", "inputType": "delete"})),
    )
    .await;
    assert_eq!(payload, json!({"accepted": false}));
}

#[tokio::test]
async fn timeout_controls_without_connection() {
    let app = TestApp::new(&[]);
    for action in ["stop", "restart"] {
        let (status, payload) = send_json(
            &app.app,
            Method::POST,
            &format!("/v1/sessions/41/timeout/{action}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload, json!({"sessionId": 41, "ok": false}));
    }
}

#[tokio::test]
async fn non_numeric_session_is_rejected() {
    let app = TestApp::new(&[]);
    let (status, _) = send_json(&app.app, Method::GET, "/v1/sessions/abc/records", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

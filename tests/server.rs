mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use common::*;
use emotion_gradcam::emotion::{EmotionModel, LABELS};
use emotion_gradcam::handler::{EmotionService, ServiceOptions};
use emotion_gradcam::server::{self, router};

const BOUNDARY: &str = "emotion-gradcam-test-boundary";
const LIMIT: usize = 4 * 1024 * 1024;

fn multipart(field: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"face.png\"\r\n").as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), LIMIT).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn predict_returns_label() {
    let app = router(service_with(Arc::new(baseline_classifier()), Some(LAYER)), LIMIT);
    let response = app
        .oneshot(multipart("image", &png_bytes(&gray_image(100, 100))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert!(LABELS.contains(&json["emotion"].as_str().unwrap()));
}

#[tokio::test]
async fn predict_without_image_field_is_bad_request() {
    let app = router(service_with(Arc::new(baseline_classifier()), Some(LAYER)), LIMIT);
    let response = app
        .oneshot(multipart("photo", &png_bytes(&gray_image(10, 10))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].as_str().unwrap().contains("image"));
}

#[tokio::test]
async fn predict_with_garbage_is_bad_request() {
    let model = Arc::new(CountingModel::new());
    let app = router(service_with(model.clone(), Some(LAYER)), LIMIT);
    let response = app.oneshot(multipart("image", b"definitely not a png")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].as_str().unwrap().starts_with("failed to decode image"));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn health_reports_model() {
    let app = router(service_with(Arc::new(baseline_classifier()), Some(LAYER)), LIMIT);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["gradcam_layer"], LAYER);
    assert_eq!(json["labels"].as_array().unwrap().len(), LABELS.len());
}

#[tokio::test]
async fn plain_get_on_root_is_not_an_upgrade() {
    let app = router(service_with(Arc::new(baseline_classifier()), None), LIMIT);
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn predict_rejects_non_multipart_with_json() {
    let app = router(service_with(Arc::new(baseline_classifier()), Some(LAYER)), LIMIT);
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"image": "nope"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn predict_timeout_is_gateway_timeout() {
    let model: Arc<dyn EmotionModel> = Arc::new(CountingModel::slow(Duration::from_millis(300)));
    let options = ServiceOptions {
        inference_timeout: Duration::from_millis(20),
        ..ServiceOptions::default()
    };
    let app = router(Arc::new(EmotionService::new(model, options).unwrap()), LIMIT);
    let response = app
        .oneshot(multipart("image", &png_bytes(&gray_image(48, 48))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(json_body(response).await["error"].as_str().unwrap().contains("budget"));
}

#[tokio::test]
async fn predict_inference_failure_is_server_error() {
    let app = router(service_with(Arc::new(BrokenModel), None), LIMIT);
    let response = app
        .oneshot(multipart("image", &png_bytes(&gray_image(48, 48))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(response).await["error"].as_str().unwrap().contains("runtime exploded"));
}

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_json(socket: &mut Client) -> Value {
    loop {
        match socket.next().await.expect("socket closed").expect("websocket error") {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn websocket_answers_every_frame_on_one_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(service_with(Arc::new(baseline_classifier()), Some(LAYER)), LIMIT);
    tokio::spawn(server::serve(listener, app));

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await.unwrap();
    let message = envelope(&data_url(&png_bytes(&gray_image(64, 64))));

    socket.send(Message::text(message.clone())).await.unwrap();
    let first = next_json(&mut socket).await;
    assert!(LABELS.contains(&first["emotion"].as_str().unwrap()));
    decode_png_url(first["gradcam"]["heatmap"].as_str().unwrap());

    socket.send(Message::binary(vec![0x89, b'P', b'N', b'G'])).await.unwrap();
    let binary = next_json(&mut socket).await;
    assert!(binary["error"].is_string());

    socket.send(Message::text("{not json".to_string())).await.unwrap();
    assert!(next_json(&mut socket).await["error"].is_string());

    socket.send(Message::text(message)).await.unwrap();
    let again = next_json(&mut socket).await;
    assert_eq!(again["emotion"], first["emotion"]);

    socket.close(None).await.unwrap();
}

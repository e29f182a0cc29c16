use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::emotion::LABELS;
use crate::error::Error;
use crate::handler::{EmotionService, ErrorResponse};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EmotionService>,
    pub max_message_bytes: usize,
}

pub fn router(service: Arc<EmotionService>, max_message_bytes: usize) -> Router {
    let state = AppState {
        service,
        max_message_bytes,
    };
    Router::new()
        .route("/", get(websocket))
        .route("/predict", post(predict))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_message_bytes))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        Error::InferenceTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn predict(State(state): State<AppState>, multipart: Result<Multipart, MultipartRejection>) -> Response {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let mut image = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("image") => match field.bytes().await {
                Ok(bytes) => {
                    image = Some(bytes);
                    break;
                }
                Err(err) => return error_response(StatusCode::BAD_REQUEST, err.body_text()),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err.body_text()),
        }
    }
    let Some(bytes) = image else {
        return error_response(StatusCode::BAD_REQUEST, "missing multipart field 'image'");
    };

    match state.service.predict_bytes(&bytes).await {
        Ok(prediction) => Json(prediction).into_response(),
        Err(err) => {
            warn!("Upload prediction failed: {err}");
            error_response(status_for(&err), err.to_string())
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let model = state.service.model();
    Json(json!({
        "status": "ok",
        "model": model.name(),
        "labels": LABELS,
        "gradcam_layer": state.service.gradcam_layer(),
    }))
    .into_response()
}

async fn websocket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let limit = state.max_message_bytes;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| serve_socket(socket, state.service))
}

/// Answers every text frame with one JSON reply until the client goes away.
async fn serve_socket(mut socket: WebSocket, service: Arc<EmotionService>) {
    debug!("WebSocket connected");
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                let reply = json!({"error": "expected a JSON text message"}).to_string();
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!("WebSocket receive failed: {err}");
                break;
            }
        };

        let response = service.handle_message(text.as_str()).await;
        let reply = match serde_json::to_string(&response) {
            Ok(reply) => reply,
            Err(err) => json!({"error": format!("failed to serialize response: {err}")}).to_string(),
        };
        if let Err(err) = socket.send(Message::Text(reply.into())).await {
            debug!("Client left before the reply was sent: {err}");
            break;
        }
    }
    debug!("WebSocket closed");
}

pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

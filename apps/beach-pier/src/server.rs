use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        RawQuery, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use pier_proto::{Frame, WireMessage};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::{ClientId, Outbound, CLOSE_TRY_AGAIN_LATER};
use crate::pool::{ClientRequest, PoolHandle};

pub struct AppState {
    pool: PoolHandle,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(pool: PoolHandle, metrics: PrometheusHandle) -> Arc<Self> {
        Arc::new(Self { pool, metrics })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pool.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let cookies: Vec<&str> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let cookie = (!cookies.is_empty()).then(|| cookies.join("; "));
    ws.on_upgrade(move |socket| handle_socket(socket, state, cookie, query))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    cookie: Option<String>,
    query: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let request = ClientRequest {
        cookie,
        query,
        outbound: outbound_tx,
    };

    let client_id = match state.pool.add_client(request).await {
        Ok(client_id) => client_id,
        Err(err) => {
            let frame = Frame::error(None, err.error_type(), err.to_string());
            if let Ok(text) = frame.to_text() {
                let _ = ws_tx.send(Message::Text(text)).await;
            }
            let _ = ws_tx
                .send(close_message(CLOSE_TRY_AGAIN_LATER, err.to_string()))
                .await;
            return;
        }
    };
    info!(client_id = %client_id, "client connected");

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    if ws_tx.send(to_ws_message(message)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    debug!(client_id = %client_id, code, reason = %reason, "closing client");
                    let _ = ws_tx.send(close_message(code, reason)).await;
                    break;
                }
            }
        }
    });

    let reader = read_client(&state.pool, client_id, &mut ws_rx);
    tokio::select! {
        _ = &mut writer => {}
        _ = reader => writer.abort(),
    }

    if state.pool.client_closed(client_id).await.is_err() {
        debug!(client_id = %client_id, "pool already closed");
    }
    info!(client_id = %client_id, "client disconnected");
}

async fn read_client(
    pool: &PoolHandle,
    client_id: ClientId,
    ws_rx: &mut futures_util::stream::SplitStream<WebSocket>,
) {
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(Message::Text(text)) => WireMessage::Text(text),
            Ok(Message::Binary(data)) => WireMessage::Binary(Bytes::from(data)),
            Ok(Message::Close(frame)) => {
                info!(
                    client_id = %client_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "error receiving message");
                break;
            }
        };
        if pool.client_message(client_id, message).await.is_err() {
            break;
        }
    }
}

fn to_ws_message(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
    }
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Owned(reason),
    }))
}

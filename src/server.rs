//! HTTP and WebSocket transport for sessions.
//!
//! Each WebSocket connection is one session. Text frames are fed to the session as
//! utterances; session events are written back as JSON frames. Closing the socket
//! closes the session.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::session::{InboundEvent, Mediator, SessionHandle, SubmitOutcome};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

type AppState = Arc<Mediator>;

pub fn router(mediator: Arc<Mediator>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(mediator)
}

pub async fn serve(config: &ServerConfig, mediator: Arc<Mediator>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "SQL Genie listening; sessions at /ws");
    axum::serve(listener, router(mediator)).await?;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to the SQL Genie backend! Open a WebSocket at /ws to start a session."
    }))
}

async fn health(State(mediator): State<AppState>) -> Json<Value> {
    let pipeline = mediator.pipeline();
    Json(json!({
        "status": "ok",
        "active_sessions": mediator.registry().len(),
        "tables": pipeline.schema().tables().iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        "model": pipeline.model_name(),
        "model_configured": pipeline.model_configured(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(mediator): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, mediator))
}

async fn serve_socket(socket: WebSocket, mediator: AppState) {
    let SessionHandle {
        id,
        sender,
        mut events,
        task,
    } = mediator.connect();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sink.send(Message::Text(event.to_json())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let inbound = InboundEvent::from_frame(&text);
                if sender.submit(inbound.text()) == SubmitOutcome::Closed {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    debug!(session_id = %id, "Socket closed");
    sender.close();
    drop(sender);
    let _ = task.await;
    writer.abort();
}

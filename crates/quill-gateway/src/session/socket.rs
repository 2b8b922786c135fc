//! HTTP surface of the gateway: the `/completions` WebSocket endpoint and a
//! health check.

use super::{Inbound, Session, SessionConfig};
use crate::service::handler::CompletionGateway;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{
    SinkExt, StreamExt,
    future::{Ready, ready},
    stream::SplitSink,
};
use quill_core::{broker::BrokerConnection, frames::ServerFrame};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::Instrument;

pub struct AppState<C: BrokerConnection> {
    pub gateway: Arc<CompletionGateway<C>>,
    pub config: SessionConfig,
}

impl<C: BrokerConnection> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            config: self.config.clone(),
        }
    }
}

pub fn router<C: BrokerConnection>(state: AppState<C>) -> Router {
    Router::new()
        .route("/completions", get(completions::<C>))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn completions<C: BrokerConnection>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<C>>,
) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve<C: BrokerConnection>(socket: WebSocket, state: AppState<C>) {
    let (tx, rx) = mpsc::channel(state.config.outbound_buffer.max(2));
    let session = Session::new(state.gateway, state.config, tx);
    let span = tracing::info_span!("session", chat_id = %session.chat_id());

    async move {
        tracing::info!("Client connected");
        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_frames(sink, rx, session.closed_token()).in_current_span());

        session.run(Box::pin(stream.filter_map(inbound))).await;

        if let Err(e) = writer.await {
            tracing::error!("Writer task failed: {e}");
        }
        tracing::info!("Client disconnected");
    }
    .instrument(span)
    .await;
}

fn inbound(message: Result<Message, axum::Error>) -> Ready<Option<Result<Inbound, axum::Error>>> {
    let frame = match message {
        Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(bytes)) => Some(Ok(Inbound::Text(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))),
        Ok(Message::Close(_)) => Some(Ok(Inbound::Close)),
        // Protocol level ping/pong is answered by the WebSocket layer.
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(e) => Some(Err(e)),
    };
    ready(frame)
}

/// Sole owner of the socket's send half. Frames queued before the session
/// closed are still flushed.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<ServerFrame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            () = closed.cancelled() => break,
        };
        if !send_frame(&mut sink, &frame).await {
            break;
        }
    }

    while let Ok(frame) = frames.try_recv() {
        if !send_frame(&mut sink, &frame).await {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!("Failed to close socket: {e}");
    }
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    let json = match frame.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode frame: {e}");
            return true;
        }
    };
    match sink.send(Message::Text(json.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Failed to write frame: {e}");
            false
        }
    }
}

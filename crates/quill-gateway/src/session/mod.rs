//! # WebSocket Sessions
//!
//! One [`Session`] per client connection. It turns client frames into gateway
//! requests and relays each request's responses back as server frames.
//!
//! ## Responsibilities
//!
//! - Enforce a single stream in flight per connection. The stream slot is
//!   guarded by a lock; a frame of a stream is only emitted while that stream
//!   still owns the slot, so nothing from a cancelled stream can follow its
//!   `end` frame or leak into the next stream.
//! - End every stream with exactly one `end` frame. A stream that fails is
//!   reported with an `error` frame right before its `end`; rejected frames
//!   get a lone `error` and leave the stream in flight untouched.
//! - Keep the conversation. A stream that ends normally appends the user turn
//!   and the assembled answer; cancelled or failed streams append nothing.
//! - Apply back-pressure. Frames go through a bounded channel to the socket
//!   writer, so a slow client slows its relay instead of growing a buffer.
//! - Close the connection when no ping arrives within the keepalive period.
//! - Cancel the stream in flight when the connection goes away, which
//!   broadcasts the cancellation to the workers.
//!
//! ## Structure
//!
//! - [`Session`]: the transport independent state machine.
//! - [`socket`]: the axum router and the WebSocket plumbing.

use crate::service::handler::CompletionGateway;
use core::{fmt::Display, time::Duration};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use quill_core::{
    broker::BrokerConnection,
    frames::{ClientFrame, ServerFrame},
    protocol::{ChatMessage, CompletionRequest, ResponseType},
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{
    sync::{Notify, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub mod socket;

const PREVIOUS_STREAM_ACTIVE: &str = "previous stream is not finished";
const CONTENT_REQUIRED: &str = "content is required for completions";
const NO_ACTIVE_STREAM: &str = "no active completions";
const UNSUPPORTED_MESSAGE: &str = "unsupported message";
const STREAM_INTERRUPTED: &str = "completion stream interrupted";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time without a ping after which the connection is closed.
    pub keepalive: Duration,
    /// Messages of history retained; the oldest are dropped first.
    pub max_history: usize,
    /// Frames queued for the socket writer. At least two.
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(120),
            max_history: 50,
            outbound_buffer: 32,
        }
    }
}

/// A frame read from the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close,
}

enum SessionState {
    Idle,
    Streaming(ActiveStream),
}

struct ActiveStream {
    id: u64,
    cancel: CancellationToken,
}

/// How a stream leaves the slot.
enum Ending {
    /// The worker finished; the turn joins the history.
    Completed([ChatMessage; 2]),
    Failed(String),
}

pub struct Session<C: BrokerConnection> {
    gateway: Arc<CompletionGateway<C>>,
    config: SessionConfig,
    chat_id: String,
    outbound: mpsc::Sender<ServerFrame>,
    state: Mutex<SessionState>,
    history: Mutex<Vec<ChatMessage>>,
    keepalive: Notify,
    closed: CancellationToken,
    next_stream: AtomicU64,
}

impl<C: BrokerConnection> Session<C> {
    /// Creates a session whose server frames are written to `outbound`, a
    /// channel with room for at least two frames.
    pub fn new(
        gateway: Arc<CompletionGateway<C>>,
        config: SessionConfig,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            config,
            chat_id: Uuid::new_v4().to_string(),
            outbound,
            state: Mutex::new(SessionState::Idle),
            history: Mutex::new(Vec::new()),
            keepalive: Notify::new(),
            closed: CancellationToken::new(),
            next_stream: AtomicU64::new(0),
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Fires once the session has ended.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Streaming(_))
    }

    /// Snapshot of the retained conversation, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().clone()
    }

    /// Reads `inbound` until the peer goes away, the keepalive expires or
    /// the session is closed, then closes the session.
    ///
    /// Each text frame is handled on its own task so a long stream never
    /// blocks a ping or a cancel.
    pub async fn run<S, E>(self: Arc<Self>, mut inbound: S)
    where
        S: Stream<Item = Result<Inbound, E>> + Unpin + Send,
        E: Display + Send,
    {
        let keepalive = tokio::time::sleep(self.config.keepalive);
        tokio::pin!(keepalive);

        loop {
            tokio::select! {
                () = self.closed.cancelled() => break,
                () = &mut keepalive => {
                    tracing::info!("Keepalive expired, closing connection");
                    break;
                }
                () = self.keepalive.notified() => {
                    keepalive.as_mut().reset(Instant::now() + self.config.keepalive);
                }
                frame = inbound.next() => match frame {
                    Some(Ok(Inbound::Text(text))) => {
                        let session = Arc::clone(&self);
                        tokio::spawn(
                            async move { session.handle_text(text).await }.in_current_span(),
                        );
                    }
                    Some(Ok(Inbound::Close)) | None => {
                        tracing::debug!("Peer closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Failed to read frame: {e}");
                        break;
                    }
                },
            }
        }

        self.close();
    }

    /// Dispatches one client text frame.
    pub async fn handle_text(&self, text: String) {
        match ClientFrame::parse(&text) {
            Ok(ClientFrame::Ping) => {
                self.keepalive.notify_one();
                self.send(ServerFrame::Pong).await;
            }
            Ok(ClientFrame::Completion { content }) => self.start_completion(content).await,
            Ok(ClientFrame::Cancel) => self.cancel_stream().await,
            Err(e) => {
                tracing::debug!("Rejected client frame: {e}");
                self.send(ServerFrame::error(UNSUPPORTED_MESSAGE)).await;
            }
        }
    }

    /// Cancels the stream in flight and answers with `end`, or reports that
    /// there is nothing to cancel.
    pub async fn cancel_stream(&self) {
        let permit = self.outbound.reserve().await.ok();
        let mut state = self.state.lock();
        let reply = match core::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Streaming(stream) => {
                tracing::info!(stream = stream.id, "Stream cancelled by client");
                stream.cancel.cancel();
                ServerFrame::End
            }
            SessionState::Idle => ServerFrame::error(NO_ACTIVE_STREAM),
        };
        if let Some(permit) = permit {
            permit.send(reply);
        }
    }

    /// Ends the session. The stream in flight, if any, is cancelled.
    pub fn close(&self) {
        self.closed.cancel();
        *self.state.lock() = SessionState::Idle;
    }

    async fn start_completion(&self, content: String) {
        let admitted = {
            let mut state = self.state.lock();
            if self.closed.is_cancelled() {
                return;
            }
            if matches!(*state, SessionState::Streaming(_)) {
                Err(PREVIOUS_STREAM_ACTIVE)
            } else if content.is_empty() {
                Err(CONTENT_REQUIRED)
            } else {
                let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
                let cancel = self.closed.child_token();
                *state = SessionState::Streaming(ActiveStream {
                    id,
                    cancel: cancel.clone(),
                });
                Ok((id, cancel, self.history.lock().clone()))
            }
        };
        let (stream_id, cancel, history) = match admitted {
            Ok(admitted) => admitted,
            Err(reason) => {
                self.send(ServerFrame::error(reason)).await;
                return;
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let request_id = Uuid::new_v4().to_string();
        let mut request = CompletionRequest::new(request_id.as_str(), content.as_str());
        request.chat_id = Some(self.chat_id.clone());
        request.chat_history = history;
        let question = content;

        async {
            let mut responses = match self.gateway.request(request, cancel).await {
                Ok(responses) => responses,
                Err(e) => {
                    tracing::error!("Failed to submit completion: {e}");
                    self.finish(stream_id, Ending::Failed(e.to_string())).await;
                    return;
                }
            };
            if !self.forward(stream_id, ServerFrame::Queued).await {
                return;
            }

            let mut started = false;
            let mut answer = String::new();
            while let Some(response) = responses.recv().await {
                let content = response.content.unwrap_or_default();
                let frame = match response.response_type {
                    ResponseType::Start if started => {
                        // The worker requeued the request and starts over.
                        tracing::debug!("Stream restarted");
                        answer.clear();
                        continue;
                    }
                    ResponseType::Start => {
                        started = true;
                        ServerFrame::Start
                    }
                    ResponseType::Chunk => {
                        answer.push_str(&content);
                        ServerFrame::Chunk { content }
                    }
                    ResponseType::End => {
                        let turn = [ChatMessage::user(question), ChatMessage::assistant(answer)];
                        self.finish(stream_id, Ending::Completed(turn)).await;
                        return;
                    }
                    ResponseType::Error => {
                        self.finish(stream_id, Ending::Failed(content)).await;
                        return;
                    }
                };
                if !self.forward(stream_id, frame).await {
                    return;
                }
            }

            self.finish(stream_id, Ending::Failed(STREAM_INTERRUPTED.to_owned()))
                .await;
        }
        .instrument(tracing::info_span!("completion", request_id = %request_id))
        .await;
    }

    /// Emits `frame` if stream `id` still owns the slot.
    async fn forward(&self, id: u64, frame: ServerFrame) -> bool {
        let Ok(permit) = self.outbound.reserve().await else {
            return false;
        };
        let state = self.state.lock();
        match &*state {
            SessionState::Streaming(stream) if stream.id == id => {
                permit.send(frame);
                true
            }
            _ => false,
        }
    }

    /// Returns the session to idle if stream `id` still owns the slot, and
    /// emits the stream's closing frames.
    async fn finish(&self, id: u64, ending: Ending) {
        let permits = self.outbound.reserve_many(2).await.ok();
        let mut state = self.state.lock();
        if !matches!(&*state, SessionState::Streaming(stream) if stream.id == id) {
            return;
        }
        *state = SessionState::Idle;

        let frames = match ending {
            Ending::Completed(turn) => {
                let mut history = self.history.lock();
                history.extend(turn);
                let excess = history.len().saturating_sub(self.config.max_history);
                history.drain(..excess);
                [None, Some(ServerFrame::End)]
            }
            Ending::Failed(reason) => [Some(ServerFrame::error(reason)), Some(ServerFrame::End)],
        };
        let Some(permits) = permits else {
            tracing::debug!("Dropping closing frames for a closed connection");
            return;
        };
        for (permit, frame) in permits.zip(frames.into_iter().flatten()) {
            permit.send(frame);
        }
    }

    async fn send(&self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!("Dropping frame for a closed connection");
        }
    }
}

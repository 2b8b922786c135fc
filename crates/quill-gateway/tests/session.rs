use core::time::Duration;
use futures::{FutureExt, StreamExt};
use quill_core::{
    broker::{
        BrokerChannel, BrokerConnection, DEFAULT_EXCHANGE, Deliveries, Publishing, QueueKind,
        memory::{MemoryBroker, MemoryChannel},
    },
    config::Topology,
    frames::ServerFrame,
    protocol::{CancellationNotice, ChatMessage, CompletionRequest, CompletionResponse},
};
use quill_gateway::{CompletionGateway, Inbound, Session, SessionConfig};
use quill_worker::{CompletionWorker, EchoEngine, config::WorkerConfig};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

struct Client {
    broker: MemoryBroker,
    session: Arc<Session<MemoryBroker>>,
    inbound: mpsc::UnboundedSender<Result<Inbound, String>>,
    frames: mpsc::Receiver<ServerFrame>,
    reader: JoinHandle<()>,
    worker: Option<(CancellationToken, JoinHandle<quill_core::Result<()>>)>,
}

/// A client talking to an echo worker.
async fn connect(config: SessionConfig, token_delay: Duration) -> Client {
    let broker = MemoryBroker::new();

    let worker = CompletionWorker::new(
        Arc::new(broker.clone()),
        Arc::new(EchoEngine::new(token_delay, 64, 4)),
        Topology::default(),
        WorkerConfig::default(),
    );
    let worker_shutdown = CancellationToken::new();
    let worker = tokio::spawn({
        let shutdown = worker_shutdown.clone();
        async move { worker.run(shutdown).await }
    });
    while broker.consumer_count("llm_q") == 0 {
        tokio::task::yield_now().await;
    }

    let mut client = attach(broker, config).await;
    client.worker = Some((worker_shutdown, worker));
    client
}

/// A client with no worker behind the gateway.
async fn attach(broker: MemoryBroker, config: SessionConfig) -> Client {
    let gateway = CompletionGateway::new(Arc::new(broker.clone()), Topology::default(), 8)
        .await
        .unwrap();
    let (tx, frames) = mpsc::channel(config.outbound_buffer);
    let session = Session::new(Arc::new(gateway), config, tx);

    let (inbound, rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(Arc::clone(&session).run(UnboundedReceiverStream::new(rx)));

    Client {
        broker,
        session,
        inbound,
        frames,
        reader,
        worker: None,
    }
}

/// A client whose worker side is driven by the test.
async fn scripted(config: SessionConfig) -> (Client, ScriptedWorker) {
    let broker = MemoryBroker::new();
    let client = attach(broker.clone(), config).await;
    let channel = broker.open_channel().await.unwrap();
    let work = channel.consume("llm_q").await.unwrap();
    (client, ScriptedWorker { channel, work })
}

struct ScriptedWorker {
    channel: MemoryChannel,
    work: Deliveries,
}

impl ScriptedWorker {
    /// Takes the next request, returning its id and reply queue.
    async fn take(&mut self) -> (String, String) {
        let delivery = self.work.next().await.unwrap().unwrap();
        let request = CompletionRequest::decode(&delivery.body).unwrap();
        let reply_to = delivery.reply_to.clone().unwrap();
        delivery.ack().await.unwrap();
        (request.request_id, reply_to)
    }

    async fn reply(&self, reply_to: &str, response: CompletionResponse) {
        let message = Publishing::new(response.encode().unwrap())
            .with_correlation_id(response.request_id.as_str());
        self.channel
            .publish(DEFAULT_EXCHANGE, reply_to, message)
            .await
            .unwrap();
    }
}

fn slow() -> Duration {
    Duration::from_secs(1)
}

fn fast() -> Duration {
    Duration::from_millis(10)
}

impl Client {
    fn send(&self, text: &str) {
        self.inbound.send(Ok(Inbound::Text(text.to_owned()))).unwrap();
    }

    fn complete(&self, content: &str) {
        self.send(&format!(r#"{{"type":"completion","content":"{content}"}}"#));
    }

    async fn next(&mut self) -> ServerFrame {
        self.frames.recv().await.unwrap()
    }

    /// Frames up to and including the next `end`.
    async fn until_end(&mut self) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next().await;
            let end = frame == ServerFrame::End;
            frames.push(frame);
            if end {
                return frames;
            }
        }
    }

    async fn cancel_listener(&self) -> (MemoryChannel, Deliveries) {
        let channel = self.broker.open_channel().await.unwrap();
        let queue = channel.declare_queue("", QueueKind::Exclusive).await.unwrap();
        channel.bind_queue(&queue, "llm_cancel_ex").await.unwrap();
        let deliveries = channel.consume(&queue).await.unwrap();
        (channel, deliveries)
    }

    async fn stop(self) {
        self.session.close();
        self.reader.await.unwrap();
        if let Some((shutdown, worker)) = self.worker {
            shutdown.cancel();
            worker.await.unwrap().unwrap();
        }
    }
}

fn chunk(content: &str) -> ServerFrame {
    ServerFrame::Chunk {
        content: content.to_owned(),
    }
}

#[tokio::test(start_paused = true)]
async fn hi_streams_queued_start_chunks_end() {
    let mut client = connect(SessionConfig::default(), fast()).await;
    client.complete("hi");

    let frames = client.until_end().await;
    assert_eq!(
        frames,
        [ServerFrame::Queued, ServerFrame::Start, chunk("hi "), ServerFrame::End]
    );
    assert!(!client.session.is_streaming());
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn second_completion_while_streaming_is_rejected() {
    let mut client = connect(SessionConfig::default(), slow()).await;
    client.complete("one two three");
    assert_eq!(client.next().await, ServerFrame::Queued);
    assert_eq!(client.next().await, ServerFrame::Start);

    client.complete("again");
    let frames = client.until_end().await;

    let rejected: Vec<_> = frames
        .iter()
        .filter(|f| matches!(f, ServerFrame::Error { .. }))
        .collect();
    assert_eq!(rejected, [&ServerFrame::error("previous stream is not finished")]);

    let chunks: Vec<_> = frames
        .into_iter()
        .filter(|f| matches!(f, ServerFrame::Chunk { .. }))
        .collect();
    assert_eq!(chunks, [chunk("one "), chunk("two "), chunk("three ")]);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_ends_the_stream_and_frees_the_session() {
    let mut client = connect(SessionConfig::default(), slow()).await;
    client.complete("a b c d e f");
    assert_eq!(client.next().await, ServerFrame::Queued);
    assert_eq!(client.next().await, ServerFrame::Start);

    client.send(r#"{"type":"cancel"}"#);
    assert_eq!(client.next().await, ServerFrame::End);
    assert!(!client.session.is_streaming());

    client.complete("ok");
    let frames = client.until_end().await;
    assert_eq!(
        frames,
        [ServerFrame::Queued, ServerFrame::Start, chunk("ok "), ServerFrame::End]
    );
    assert_eq!(
        client.session.history(),
        [ChatMessage::user("ok"), ChatMessage::assistant("ok ")]
    );
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_are_answered_with_errors() {
    let mut client = connect(SessionConfig::default(), fast()).await;

    client.complete("");
    assert_eq!(
        client.next().await,
        ServerFrame::error("content is required for completions")
    );

    client.send(r#"{"type":"cancel"}"#);
    assert_eq!(client.next().await, ServerFrame::error("no active completions"));

    client.send("not json");
    assert_eq!(client.next().await, ServerFrame::error("unsupported message"));

    client.send(r#"{"type":"pong"}"#);
    assert_eq!(client.next().await, ServerFrame::error("unsupported message"));

    client.send(r#"{"type":"ping"}"#);
    assert_eq!(client.next().await, ServerFrame::Pong);

    assert!(!client.session.closed_token().is_cancelled());
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_expires_without_pings() {
    let config = SessionConfig {
        keepalive: Duration::from_secs(10),
        ..SessionConfig::default()
    };
    let mut client = connect(config, fast()).await;
    let started = Instant::now();

    tokio::time::sleep(Duration::from_secs(8)).await;
    client.send(r#"{"type":"ping"}"#);
    assert_eq!(client.next().await, ServerFrame::Pong);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(!client.session.closed_token().is_cancelled());

    client.session.closed_token().cancelled().await;
    assert!(started.elapsed() >= Duration::from_secs(18));
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn history_is_kept_and_trimmed() {
    let config = SessionConfig {
        max_history: 3,
        ..SessionConfig::default()
    };
    let mut client = connect(config, fast()).await;

    client.complete("first");
    client.until_end().await;
    assert_eq!(
        client.session.history(),
        [ChatMessage::user("first"), ChatMessage::assistant("first ")]
    );

    client.complete("second");
    let frames = client.until_end().await;
    assert!(frames.contains(&chunk("second ")));
    assert_eq!(
        client.session.history(),
        [
            ChatMessage::assistant("first "),
            ChatMessage::user("second"),
            ChatMessage::assistant("second "),
        ]
    );
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_submission_is_reported() {
    let mut client = connect(SessionConfig::default(), fast()).await;
    client.broker.set_publish_failure(true);

    client.complete("hi");
    assert!(matches!(client.next().await, ServerFrame::Error { .. }));
    assert_eq!(client.next().await, ServerFrame::End);
    assert!(!client.session.is_streaming());
    assert!(client.session.history().is_empty());

    client.broker.set_publish_failure(false);
    client.complete("hi");
    assert_eq!(client.until_end().await.last(), Some(&ServerFrame::End));
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn peer_close_cancels_the_stream() {
    let mut client = connect(SessionConfig::default(), slow()).await;
    let (_listener_channel, mut listener) = client.cancel_listener().await;

    client.complete("never gets to the end");
    assert_eq!(client.next().await, ServerFrame::Queued);
    assert_eq!(client.next().await, ServerFrame::Start);

    client.inbound.send(Ok(Inbound::Close)).unwrap();
    let delivery = listener.next().await.unwrap().unwrap();
    let notice = CancellationNotice::decode(&delivery.body).unwrap();
    assert_eq!(delivery.correlation_id.as_deref(), Some(notice.request_id.as_str()));
    delivery.ack().await.unwrap();

    assert!(client.session.closed_token().is_cancelled());
    assert!(client.session.history().is_empty());
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn worker_error_is_followed_by_end() {
    let (mut client, mut worker) = scripted(SessionConfig::default()).await;
    client.complete("hi");
    let (id, reply_to) = worker.take().await;

    worker.reply(&reply_to, CompletionResponse::start(&id)).await;
    worker.reply(&reply_to, CompletionResponse::chunk(&id, "x")).await;
    worker.reply(&reply_to, CompletionResponse::error(&id, "engine died")).await;

    assert_eq!(
        client.until_end().await,
        [
            ServerFrame::Queued,
            ServerFrame::Start,
            chunk("x"),
            ServerFrame::error("engine died"),
            ServerFrame::End,
        ]
    );
    assert!(!client.session.is_streaming());
    assert!(client.session.history().is_empty());
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lost_reply_queue_is_reported_then_ended() {
    let (mut client, mut worker) = scripted(SessionConfig::default()).await;
    client.complete("hi");
    let (id, reply_to) = worker.take().await;
    worker.reply(&reply_to, CompletionResponse::start(&id)).await;
    assert_eq!(client.next().await, ServerFrame::Queued);
    assert_eq!(client.next().await, ServerFrame::Start);

    client.broker.delete_queue(&reply_to);

    assert_eq!(
        client.until_end().await,
        [ServerFrame::error("completion stream interrupted"), ServerFrame::End]
    );
    assert!(!client.session.is_streaming());
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restarted_stream_keeps_only_the_final_answer() {
    let (mut client, mut worker) = scripted(SessionConfig::default()).await;
    client.complete("hi");
    let (id, reply_to) = worker.take().await;

    worker.reply(&reply_to, CompletionResponse::start(&id)).await;
    worker.reply(&reply_to, CompletionResponse::chunk(&id, "a ")).await;
    // Redelivered to another worker, which starts over.
    worker.reply(&reply_to, CompletionResponse::start(&id)).await;
    worker.reply(&reply_to, CompletionResponse::chunk(&id, "a ")).await;
    worker.reply(&reply_to, CompletionResponse::chunk(&id, "b ")).await;
    worker.reply(&reply_to, CompletionResponse::end(&id)).await;

    assert_eq!(
        client.until_end().await,
        [
            ServerFrame::Queued,
            ServerFrame::Start,
            chunk("a "),
            chunk("a "),
            chunk("b "),
            ServerFrame::End,
        ]
    );
    assert_eq!(
        client.session.history(),
        [ChatMessage::user("hi"), ChatMessage::assistant("a b ")]
    );
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn slow_client_gets_every_frame_in_order() {
    let config = SessionConfig {
        outbound_buffer: 2,
        ..SessionConfig::default()
    };
    let (mut client, mut worker) = scripted(config).await;
    client.complete("hi");
    let (id, reply_to) = worker.take().await;

    let words = ["one ", "two ", "three ", "four ", "five ", "six "];
    worker.reply(&reply_to, CompletionResponse::start(&id)).await;
    for word in words {
        worker.reply(&reply_to, CompletionResponse::chunk(&id, word)).await;
    }
    worker.reply(&reply_to, CompletionResponse::end(&id)).await;

    // Nobody reads while the relay runs into the full buffer.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(client.session.is_streaming());

    let mut expected = vec![ServerFrame::Queued, ServerFrame::Start];
    expected.extend(words.map(chunk));
    expected.push(ServerFrame::End);
    assert_eq!(client.until_end().await, expected);
    assert_eq!(
        client.session.history(),
        [
            ChatMessage::user("hi"),
            ChatMessage::assistant("one two three four five six ")
        ]
    );
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn completion_after_close_is_not_submitted() {
    let mut client = attach(MemoryBroker::new(), SessionConfig::default()).await;
    client.session.close();

    client
        .session
        .handle_text(r#"{"type":"completion","content":"hi"}"#.to_owned())
        .await;

    assert!(!client.session.is_streaming());
    assert_eq!(client.broker.queue_len("llm_q"), 0);
    assert!(client.frames.recv().now_or_never().is_none());
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn read_error_closes_the_session_and_cancels_the_stream() {
    let (mut client, mut worker) = scripted(SessionConfig::default()).await;
    let (_listener_channel, mut listener) = client.cancel_listener().await;
    client.complete("hi");
    let (id, reply_to) = worker.take().await;
    worker.reply(&reply_to, CompletionResponse::start(&id)).await;
    assert_eq!(client.next().await, ServerFrame::Queued);
    assert_eq!(client.next().await, ServerFrame::Start);

    client.inbound.send(Err("connection reset".to_owned())).unwrap();
    client.session.closed_token().cancelled().await;

    let delivery = listener.next().await.unwrap().unwrap();
    let notice = CancellationNotice::decode(&delivery.body).unwrap();
    assert_eq!(notice.request_id, id);
    delivery.ack().await.unwrap();
    assert!(!client.session.is_streaming());
    client.stop().await;
}

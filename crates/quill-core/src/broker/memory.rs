//! In-process broker.
//!
//! Routes messages between channels of the same process with the delivery
//! semantics the roles rely on from RabbitMQ: direct and fanout routing,
//! per-consumer prefetch, round-robin dispatch, ack/nack with requeue,
//! redelivery flags and auto-deleted exclusive queues.
//!
//! The whole broker is one [`parking_lot::Mutex`]; no lock is held across an
//! `.await`.

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, DEFAULT_EXCHANGE, Deliveries, Delivery,
    Publishing, QueueKind,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use core::{
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicU16, Ordering},
    task::{Context, Poll},
};
use futures::Stream;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::mpsc;

/// Handle to an in-process broker. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    fanouts: HashMap<String, Vec<String>>,
    next_id: u64,
    fail_publish: bool,
}

#[derive(Clone)]
struct Message {
    body: Bytes,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    cursor: usize,
    auto_delete: bool,
}

struct Consumer {
    id: u64,
    /// Zero means unlimited.
    prefetch: u16,
    unacked: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
    }
}

impl Queue {
    fn next_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.consumers[idx].has_capacity() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for bound in self.fanouts.values_mut() {
            bound.retain(|q| q != name);
        }
    }

    fn remove_consumer(&mut self, queue: &str, consumer: u64) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        q.consumers.retain(|c| c.id != consumer);
        if q.auto_delete && q.consumers.is_empty() {
            self.delete_queue(queue);
        }
    }
}

/// Hand ready messages to consumers with spare prefetch capacity.
fn dispatch(shared: &Arc<Shared>, state: &mut State, name: &str) {
    let Some(queue) = state.queues.get_mut(name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let Some(idx) = queue.next_consumer() else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };

        let consumer = &mut queue.consumers[idx];
        let settled = Arc::new(AtomicBool::new(false));
        let acker = MemoryAcker {
            shared: Arc::clone(shared),
            queue: name.to_owned(),
            consumer: consumer.id,
            message: message.clone(),
            settled: Arc::clone(&settled),
        };
        let delivery = Delivery::new(
            message.body.clone(),
            message.correlation_id.clone(),
            message.reply_to.clone(),
            message.redelivered,
            Box::new(acker),
        );

        match consumer.tx.send(delivery) {
            Ok(()) => consumer.unacked += 1,
            Err(mpsc::error::SendError(delivery)) => {
                // The lock is held here, so the acker must not requeue itself.
                settled.store(true, Ordering::Release);
                drop(delivery);
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
            }
        }
    }
}

fn enqueue(shared: &Arc<Shared>, state: &mut State, name: &str, message: Message) {
    let Some(queue) = state.queues.get_mut(name) else {
        tracing::trace!(queue = name, "Dropping message for missing queue");
        return;
    };
    queue.ready.push_back(message);
    dispatch(shared, state, name);
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    consumer: u64,
    message: Message,
    settled: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) {
        let mut state = self.shared.state.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == self.consumer) {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
            if requeue {
                let mut message = self.message.clone();
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        dispatch(&self.shared, &mut state, &self.queue);
    }

    fn claim(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(Error::broker("delivery already settled"));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.claim()?;
        self.settle(false);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.claim()?;
        self.settle(requeue);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.settle(true);
        }
    }
}

/// Removes its consumer when the delivery stream is dropped.
struct ConsumerGuard {
    shared: Arc<Shared>,
    queue: String,
    consumer: u64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.shared
            .state
            .lock()
            .remove_consumer(&self.queue, self.consumer);
    }
}

struct ConsumerStream {
    // Field order matters: the consumer is unregistered before buffered
    // deliveries are dropped and requeued.
    _guard: ConsumerGuard,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Stream for ConsumerStream {
    type Item = Result<Delivery>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|d| d.map(Ok))
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail until reset.
    pub fn set_publish_failure(&self, fail: bool) {
        self.shared.state.lock().fail_publish = fail;
    }

    /// Number of messages waiting in `queue` (excluding unacked ones).
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    /// Deletes `queue` as an operator would, ending its consumers' streams.
    pub fn delete_queue(&self, queue: &str) {
        self.shared.state.lock().delete_queue(queue);
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        Ok(MemoryChannel {
            shared: Arc::clone(&self.shared),
            prefetch: AtomicU16::new(0),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        })
    }
}

pub struct MemoryChannel {
    shared: Arc<Shared>,
    prefetch: AtomicU16,
    closed: AtomicBool,
    consumers: Mutex<Vec<(String, u64)>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::broker("channel is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::Release);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_owned()
        };
        state.queues.entry(name.clone()).or_insert_with(|| Queue {
            auto_delete: kind == QueueKind::Exclusive,
            ..Queue::default()
        });
        Ok(name)
    }

    async fn declare_fanout(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .state
            .lock()
            .fanouts
            .entry(exchange.to_owned())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(Error::broker(format!("no queue '{queue}'")));
        }
        let Some(bound) = state.fanouts.get_mut(exchange) else {
            return Err(Error::broker(format!("no exchange '{exchange}'")));
        };
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_owned());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();
        let id = state.next_id();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(Error::broker(format!("no queue '{queue}'")));
        };
        q.consumers.push(Consumer {
            id,
            prefetch: self.prefetch.load(Ordering::Acquire),
            unacked: 0,
            tx,
        });
        self.consumers.lock().push((queue.to_owned(), id));
        dispatch(&self.shared, &mut state, queue);

        Ok(Box::pin(ConsumerStream {
            _guard: ConsumerGuard {
                shared: Arc::clone(&self.shared),
                queue: queue.to_owned(),
                consumer: id,
            },
            rx,
        }))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Publishing) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if state.fail_publish {
            return Err(Error::broker("publish rejected"));
        }

        let message = Message {
            body: message.body,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            redelivered: false,
        };

        if exchange == DEFAULT_EXCHANGE {
            enqueue(&self.shared, &mut state, routing_key, message);
            return Ok(());
        }

        let Some(bound) = state.fanouts.get(exchange).cloned() else {
            return Err(Error::broker(format!("no exchange '{exchange}'")));
        };
        for queue in bound {
            enqueue(&self.shared, &mut state, &queue, message.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let consumers = core::mem::take(&mut *self.consumers.lock());
        let mut state = self.shared.state.lock();
        for (queue, id) in consumers {
            state.remove_consumer(&queue, id);
        }
        Ok(())
    }
}

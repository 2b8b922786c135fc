//! # Broker Seam
//!
//! The roles talk to the message broker only through the traits in this
//! module. Two implementations ship with the crate:
//!
//! - [`memory::MemoryBroker`]: an in-process broker with AMQP-like semantics,
//!   used by tests and local runs.
//! - [`amqp::AmqpConnection`] (feature `amqp`): a RabbitMQ client built on
//!   `lapin`.
//!
//! ## Semantics both implementations honor
//!
//! - Publishing to [`DEFAULT_EXCHANGE`] routes directly to the queue named by
//!   the routing key. A missing queue silently drops the message.
//! - Publishing to a fanout exchange copies the message into every bound
//!   queue.
//! - A consumer receives at most `prefetch` unacknowledged deliveries.
//! - A delivery that is neither acked nor nacked before it is dropped goes
//!   back to its queue and is marked as redelivered.
//! - [`QueueKind::Exclusive`] queues are private to their declarer and are
//!   deleted once their last consumer goes away.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use futures::Stream;
use std::{future::Future, pin::Pin};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

/// Exchange name that routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Stream of deliveries from one consumer.
pub type Deliveries = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Durable-named queue shared by competing consumers.
    Shared,
    /// Queue private to the declaring channel. An empty name asks the broker
    /// to generate one.
    Exclusive,
}

/// An open broker connection that hands out channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel>;
}

/// A lightweight session on a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Limit the number of unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Declare a queue and return its (possibly generated) name.
    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String>;

    async fn declare_fanout(&self, exchange: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()>;

    async fn consume(&self, queue: &str) -> Result<Deliveries>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: Publishing) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message received from a queue. Must be settled with [`Delivery::ack`] or
/// [`Delivery::nack`].
pub struct Delivery {
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// The broker has handed this message out before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Bytes,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            correlation_id,
            reply_to,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// An outgoing message.
#[derive(Clone, Debug, Default)]
pub struct Publishing {
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Publishing {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// Dial with a fixed delay between attempts. Gives up after `retries` failed
/// retries and returns the last error.
pub async fn connect_with_retry<C, F, Fut>(retries: usize, delay: Duration, mut dial: F) -> Result<C>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C>>,
{
    let mut attempt = 0;
    loop {
        match dial().await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, retries, "Broker not reachable yet: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(Error::broker(format!(
                    "giving up after {} attempts: {e}",
                    attempt + 1
                )));
            }
        }
    }
}

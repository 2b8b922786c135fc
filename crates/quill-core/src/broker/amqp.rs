//! RabbitMQ transport built on `lapin`.

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, Deliveries, Delivery, Publishing, QueueKind,
};
use crate::{Result, protocol::CONTENT_TYPE};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
};

pub struct AmqpConnection {
    inner: Connection,
}

impl AmqpConnection {
    pub async fn connect(uri: &str) -> Result<Self> {
        let inner = Connection::connect(uri, ConnectionProperties::default()).await?;
        Ok(Self { inner })
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close(200, "bye").await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel> {
        Ok(AmqpChannel {
            inner: self.inner.create_channel().await?,
        })
    }
}

pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String> {
        let options = match kind {
            QueueKind::Shared => QueueDeclareOptions::default(),
            QueueKind::Exclusive => QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
        };
        let queue = self
            .inner
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn declare_fanout(&self, exchange: &str) -> Result<()> {
        self.inner
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    auto_delete: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Box::pin(consumer.map(|delivery| -> Result<Delivery> {
            let delivery = delivery?;
            let props = &delivery.properties;
            Ok(Delivery::new(
                Bytes::from(delivery.data),
                props.correlation_id().as_ref().map(|s| s.as_str().to_owned()),
                props.reply_to().as_ref().map(|s| s.as_str().to_owned()),
                delivery.redelivered,
                Box::new(AmqpAcker(delivery.acker)),
            ))
        })))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Publishing) -> Result<()> {
        let mut props = BasicProperties::default().with_content_type(ShortString::from(CONTENT_TYPE));
        if let Some(id) = message.correlation_id {
            props = props.with_correlation_id(ShortString::from(id));
        }
        if let Some(reply_to) = message.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to));
        }

        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                props,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(200, "bye").await?;
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

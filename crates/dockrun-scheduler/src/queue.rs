//! AMQP adapters for the job and event queues.

use async_trait::async_trait;
use dockrun_core::{Error, Event, EventSink, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info};

use crate::worker::{Delivery, JobSource};

const CONSUMER_TAG: &str = "dockrun";

fn queue_error(e: lapin::Error) -> Error {
    Error::Queue(e.to_string())
}

/// Connect to the broker at `url`.
pub async fn connect(url: &str) -> Result<Connection> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(|e| Error::Connect(e.to_string()))
}

fn declare_options(durable: bool) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable,
        ..Default::default()
    }
}

async fn declare(channel: &Channel, queue: &str, durable: bool) -> Result<()> {
    channel
        .queue_declare(queue, declare_options(durable), FieldTable::default())
        .await
        .map_err(queue_error)?;
    info!(queue, durable, "Queue declared");
    Ok(())
}

/// Consumes build jobs from a queue with manual acknowledgement.
pub struct AmqpJobSource {
    consumer: Consumer,
}

impl AmqpJobSource {
    /// Open a channel, declare `queue` and start consuming it.
    ///
    /// Prefetch is 1: the broker holds back further jobs until the current
    /// one is acknowledged.
    pub async fn open(connection: &Connection, queue: &str, durable: bool) -> Result<Self> {
        let channel = connection.create_channel().await.map_err(queue_error)?;
        declare(&channel, queue, durable).await?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(queue_error)?;

        let consumer = channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(queue_error)?;

        Ok(Self { consumer })
    }
}

struct AmqpDelivery(lapin::message::Delivery);

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    async fn ack(&mut self) -> Result<()> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(queue_error)
    }
}

#[async_trait]
impl JobSource for AmqpJobSource {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>>> {
        let item = self.consumer.next().await?;
        Some(
            item.map(|delivery| Box::new(AmqpDelivery(delivery)) as Box<dyn Delivery>)
                .map_err(queue_error),
        )
    }
}

/// Publishes build events as JSON to a queue.
///
/// Holds its own channel; the handle is safe to share between stages.
pub struct AmqpEventPublisher {
    channel: Channel,
    queue: String,
}

impl AmqpEventPublisher {
    pub async fn open(connection: &Connection, queue: &str, durable: bool) -> Result<Self> {
        let channel = connection.create_channel().await.map_err(queue_error)?;
        declare(&channel, queue, durable).await?;
        Ok(Self {
            channel,
            queue: queue.to_string(),
        })
    }
}

fn encode(event: &Event) -> Result<Vec<u8>> {
    serde_json::to_vec(event).map_err(|e| Error::Queue(e.to_string()))
}

#[async_trait]
impl EventSink for AmqpEventPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        let body = encode(&event)?;
        debug!(queue = %self.queue, size = body.len(), "Publishing event");

        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(queue_error)?
            .await
            .map_err(queue_error)?;
        Ok(())
    }
}

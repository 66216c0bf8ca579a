//! # RabbitMQ Broker
//!
//! `lapin` (AMQP 0.9.1) implementation of [`MessageBroker`].
//!
//! - Durable direct exchanges and durable queues
//! - Dead-letter retry loop declared from a [`QueueTopology`]
//! - Publisher confirms on a dedicated channel
//! - One channel per consumer with `basic_qos(prefetch)` and manual ack

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::topology::{QueueArgument, QueueTopology};
use crate::messaging::traits::{
    Acknowledger, BrokerConnector, Delivery, DeliveryStream, MessageBroker, OutboundMessage,
};

/// Connection settings for [`RabbitMqBroker`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitMqSettings {
    pub url: String,
    pub connection_name: String,
}

impl RabbitMqSettings {
    pub fn new(url: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: connection_name.into(),
        }
    }

    /// Connection URL with credentials hidden
    pub fn url_redacted(&self) -> String {
        redact_url(&self.url)
    }
}

pub(crate) fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[derive(Debug)]
pub struct RabbitMqBroker {
    connection: Connection,
    /// Confirm-mode channel used for declarations and publishing
    channel: Channel,
}

impl RabbitMqBroker {
    pub async fn connect(settings: &RabbitMqSettings) -> MessagingResult<Self> {
        let connection = Connection::connect(
            &settings.url,
            ConnectionProperties::default()
                .with_connection_name(settings.connection_name.clone().into()),
        )
        .await
        .map_err(|e| MessagingError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                MessagingError::connection(format!("Enabling publisher confirms failed: {e}"))
            })?;

        debug!(url = %settings.url_redacted(), "RabbitMQ connection opened");

        Ok(Self {
            connection,
            channel,
        })
    }

    async fn declare_exchange(&self, name: &str) -> MessagingResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(name, format!("exchange declare failed: {e}")))
    }

    async fn declare_bound_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Vec<(&'static str, QueueArgument)>,
    ) -> MessagingResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                field_table(arguments),
            )
            .await
            .map_err(|e| MessagingError::topology(queue, format!("queue declare failed: {e}")))?;

        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(queue, format!("queue bind failed: {e}")))?;

        Ok(())
    }
}

fn field_table(arguments: Vec<(&'static str, QueueArgument)>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            QueueArgument::Text(text) => AMQPValue::LongString(text.into()),
            QueueArgument::Millis(ms) => AMQPValue::LongInt(i32::try_from(ms).unwrap_or(i32::MAX)),
        };
        table.insert(key.into(), value);
    }
    table
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    async fn declare_topology(&self, topology: &QueueTopology) -> MessagingResult<()> {
        let dead_letter_exchange = topology.dead_letter_exchange();

        self.declare_exchange(&topology.exchange).await?;
        self.declare_bound_queue(
            &topology.queue,
            &topology.exchange,
            &topology.routing_key,
            topology.main_queue_arguments(),
        )
        .await?;

        self.declare_exchange(&dead_letter_exchange).await?;
        self.declare_bound_queue(
            &topology.retry_queue(),
            &dead_letter_exchange,
            &topology.routing_key,
            topology.retry_queue_arguments(),
        )
        .await?;

        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            retry_queue = %topology.retry_queue(),
            retry_delay_ms = topology.retry_delay_ms(),
            "Declared dispatch topology"
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> MessagingResult<()> {
        let mut properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_message_id(message.message_id.into())
            .with_timestamp(message.timestamp);
        if message.persistent {
            properties = properties.with_delivery_mode(2);
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| MessagingError::publish(exchange, e.to_string()))?
            .await
            .map_err(|e| MessagingError::publish(exchange, e.to_string()))?;

        if confirmation.is_nack() {
            return Err(MessagingError::PublishNotConfirmed {
                exchange: exchange.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> MessagingResult<DeliveryStream> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::consume(queue, format!("channel creation failed: {e}")))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::consume(queue, format!("basic_qos failed: {e}")))?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::consume(queue, e.to_string()))?;

        let queue_name = queue.to_string();
        let stream = consumer.map(move |result| {
            // The consumer channel lives as long as the stream.
            let _channel = &channel;
            match result {
                Ok(delivery) => {
                    let message_id = delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string());
                    Ok(Delivery::new(
                        delivery.delivery_tag,
                        delivery.data,
                        message_id,
                        delivery.redelivered,
                        Box::new(LapinAcknowledger {
                            delivery_tag: delivery.delivery_tag,
                            acker: delivery.acker,
                        }),
                    ))
                }
                Err(e) => Err(MessagingError::consume(&queue_name, e.to_string())),
            }
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        Ok(self.connection.status().connected() && self.channel.status().connected())
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.connection.status().connected() {
            self.connection
                .close(200, "dispatch shutdown")
                .await
                .map_err(MessagingError::from)?;
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

struct LapinAcknowledger {
    delivery_tag: u64,
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self) -> MessagingResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::acknowledgement(self.delivery_tag, e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| MessagingError::acknowledgement(self.delivery_tag, e.to_string()))
    }
}

/// Opens a new [`RabbitMqBroker`] per connection attempt
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    settings: RabbitMqSettings,
}

impl RabbitMqConnector {
    pub fn new(settings: RabbitMqSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self) -> MessagingResult<Arc<dyn MessageBroker>> {
        let broker = RabbitMqBroker::connect(&self.settings).await?;
        Ok(Arc::new(broker))
    }

    fn describe(&self) -> String {
        self.settings.url_redacted()
    }
}

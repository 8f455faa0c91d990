// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Driver Contract
//!
//! This module defines what the facade needs from its AMQP driver: the `AmqpConnection`
//! and `AmqpChannel` traits. The facade only talks to these traits, so the broker logic
//! can be exercised against mocks while production code runs on `lapin`.
//!
//! `LapinChannel` is the `lapin` implementation of a channel. Every remote call is
//! bounded by the configured read/write timeout and driver errors are logged before
//! being mapped to the `AmqpError` variant of the failing operation.

use crate::{errors::AmqpError, exchange::ExchangeKind, message::ReturnedMessage};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error};

/// Stream of deliveries produced by a registered consumer.
///
/// The stream ends once the consumer is cancelled or its channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// A message delivered by the broker, before it is wrapped for the application.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl InboundDelivery {
    fn from_lapin(delivery: &Delivery, consumer_tag: &str) -> InboundDelivery {
        InboundDelivery {
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            body: delivery.data.clone(),
            properties: delivery.properties.clone(),
        }
    }
}

/// A connection to the broker, able to hand out channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Whether the connection can be used to open channels.
    fn is_connected(&self) -> bool;

    /// Re-establishes the connection with the parameters it was built with.
    async fn reconnect(&mut self) -> Result<(), AmqpError>;

    /// Opens a channel, with the given id or one assigned by the driver.
    async fn open_channel(
        &mut self,
        channel_id: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Closes the connection and every channel opened on it.
    async fn close(&mut self) -> Result<(), AmqpError>;
}

/// One channel of a broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, as assigned by the broker when empty.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
    ) -> Result<(), AmqpError>;

    /// Publishes a message.
    ///
    /// For mandatory or immediate publishes the broker may hand the message back;
    /// it is then returned to the caller.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<Option<ReturnedMessage>, AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// `lapin` implementation of `AmqpChannel`.
pub struct LapinChannel {
    channel: Channel,
    rpc_timeout: Option<Duration>,
    confirms: AtomicBool,
}

impl LapinChannel {
    /// Wraps a `lapin` channel.
    ///
    /// # Parameters
    /// * `channel` - An open channel
    /// * `rpc_timeout` - Upper bound for every call made on the channel, if any
    pub fn new(channel: Channel, rpc_timeout: Option<Duration>) -> LapinChannel {
        LapinChannel {
            channel,
            rpc_timeout,
            confirms: AtomicBool::new(false),
        }
    }

    async fn timed<T, F>(&self, call: F) -> Result<lapin::Result<T>, AmqpError>
    where
        F: Future<Output = lapin::Result<T>> + Send,
    {
        match self.rpc_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                error!(channel = self.channel.id(), "driver call timed out");
                AmqpError::Timeout
            }),
            None => Ok(call.await),
        }
    }

    /// Publisher confirms carry the messages returned by the broker, so they
    /// are enabled before the first mandatory or immediate publish.
    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        if self.confirms.load(Ordering::Acquire) {
            return Ok(());
        }

        match self
            .timed(
                self.channel
                    .confirm_select(ConfirmSelectOptions { nowait: false }),
            )
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(_) => {
                self.confirms.store(true, Ordering::Release);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .timed(
                self.channel
                    .exchange_declare(name, kind.into(), options, arguments),
            )
            .await?
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, AmqpError> {
        match self
            .timed(self.channel.queue_declare(name, options, arguments))
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => Ok(queue.name().to_string()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
    ) -> Result<(), AmqpError> {
        match self
            .timed(self.channel.queue_bind(
                queue,
                exchange,
                routing_key,
                options,
                FieldTable::default(),
            ))
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<Option<ReturnedMessage>, AmqpError> {
        let wants_return = options.mandatory || options.immediate;
        if wants_return {
            self.enable_confirms().await?;
        }

        let confirm = match self
            .timed(
                self.channel
                    .basic_publish(exchange, routing_key, options, body, properties),
            )
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError(err.to_string()));
            }
            Ok(confirm) => confirm,
        };

        if !wants_return {
            return Ok(None);
        }

        match self.timed(confirm).await? {
            Err(err) => {
                error!(error = err.to_string(), "error waiting publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirmation) => Ok(confirmation.take_message().map(|returned| {
                debug!(
                    reply_code = returned.reply_code,
                    "message returned by the broker"
                );
                ReturnedMessage {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.to_string(),
                    exchange: returned.delivery.exchange.to_string(),
                    routing_key: returned.delivery.routing_key.to_string(),
                    body: returned.delivery.data.clone(),
                    properties: returned.delivery.properties.clone(),
                }
            })),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .timed(self.channel.basic_consume(
                queue,
                consumer_tag,
                options,
                FieldTable::default(),
            ))
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                return Err(AmqpError::ConsumerDeclarationError(consumer_tag.to_owned()));
            }
            Ok(consumer) => consumer,
        };

        let tag = consumer.tag().to_string();

        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(InboundDelivery::from_lapin(&delivery, &tag)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        if prefetch_size != 0 {
            error!(prefetch_size, "prefetch size is not supported by the driver");
            return Err(AmqpError::QoSDeclarationError(format!(
                "prefetch size {} is not supported, use 0",
                prefetch_size
            )));
        }

        match self
            .timed(self.channel.basic_qos(prefetch_count, options))
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .timed(
                self.channel
                    .basic_ack(delivery_tag, BasicAckOptions { multiple: false }),
            )
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .timed(self.channel.basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            ))
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .timed(
                self.channel
                    .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false }),
            )
            .await?
        {
            Err(err) => {
                error!(error = err.to_string(), "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.timed(self.channel.close(200, "OK")).await? {
            Err(err) => {
                error!(error = err.to_string(), "error to close the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

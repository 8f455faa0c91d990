// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Facade
//!
//! `Channel` translates exchange/queue declarations, publishing, consuming,
//! acknowledgment and quality-of-service requests into calls on one driver channel.
//! It keeps no state of its own besides the driver handle: every operation is a
//! single forwarded call, without retry.
//!
//! The consume loop runs on the calling task. It hands every delivery to a
//! `MessageHandler`, one at a time and in delivery order, and only returns once the
//! consumer has been cancelled or the channel closed.

use crate::{
    driver::AmqpChannel,
    errors::AmqpError,
    exchange::Exchange,
    message::{IncomingMessage, OutgoingMessage},
    otel,
    queue::Queue,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, fmt, future::Future, sync::Arc};
use tracing::{debug, error};

/// Handles the messages delivered to a consumer.
///
/// Unless the consumer runs in auto-ack mode, the handler is expected to call exactly
/// one of `acknowledged` or `not_acknowledged` on every message. Errors returned by the
/// handler are logged and the loop keeps consuming.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> Result<(), AmqpError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn handle(&self, message: IncomingMessage) -> Result<(), AmqpError> {
        (self)(message).await
    }
}

/// Options of a consumer registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Consumer tag; empty lets the broker generate one
    pub name: String,
    pub no_local: bool,
    /// Deliveries are considered acknowledged as soon as they are sent
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

impl ConsumerOptions {
    pub fn new(name: &str) -> ConsumerOptions {
        ConsumerOptions {
            name: name.to_owned(),
            ..ConsumerOptions::default()
        }
    }
}

/// Facade over one driver channel.
///
/// Cloning is cheap and shares the same driver channel; delivered messages keep a
/// clone to acknowledge themselves.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<dyn AmqpChannel>,
}

impl Channel {
    pub fn new(inner: Arc<dyn AmqpChannel>) -> Channel {
        Channel { inner }
    }

    /// Channel number assigned on the connection.
    pub fn id(&self) -> u16 {
        self.inner.id()
    }

    /// Declares an exchange.
    ///
    /// If the exchange already exists its configuration must match; otherwise it is
    /// created.
    ///
    /// # Returns
    /// `MissingExchange` when no exchange is given, or the driver error
    pub async fn declare_exchange(&self, exchange: Option<&Exchange>) -> Result<(), AmqpError> {
        let Some(exch) = exchange else {
            return Err(AmqpError::MissingExchange);
        };

        debug!("creating exchange: {}", exch.name);

        self.inner
            .exchange_declare(
                &exch.name,
                exch.kind,
                ExchangeDeclareOptions {
                    passive: exch.passive,
                    durable: exch.durable,
                    auto_delete: exch.auto_delete,
                    internal: exch.internal,
                    nowait: exch.no_wait,
                },
                FieldTable::from(exch.arguments.clone()),
            )
            .await?;

        debug!("exchange: {} was declared", exch.name);
        Ok(())
    }

    /// Declares a queue and binds it to its exchange.
    ///
    /// An unnamed queue takes the name assigned by the broker. The queue is then bound
    /// once per routing key; a queue without keys is bound once with an empty key.
    ///
    /// # Returns
    /// `MissingQueue` when no queue is given, `MissingRoutingKey` when the queue
    /// yields no key, or the driver error
    pub async fn declare_queue(&self, queue: Option<&mut Queue>) -> Result<(), AmqpError> {
        let Some(queue) = queue else {
            return Err(AmqpError::MissingQueue);
        };

        debug!("creating queue: {}", queue.name);

        let name = self
            .inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: queue.passive,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.no_wait,
                },
                FieldTable::from(queue.arguments.clone()),
            )
            .await?;

        if !queue.has_name() && !name.is_empty() {
            debug!("broker assigned queue name: {}", name);
            queue.set_name(&name)?;
        }

        let routing_keys = queue.routing_keys();
        if routing_keys.is_empty() {
            return Err(AmqpError::MissingRoutingKey(queue.name.clone()));
        }

        for key in routing_keys {
            let key = key.unwrap_or_default();
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue.name, queue.exchange.name, key
            );

            self.inner
                .queue_bind(
                    &queue.name,
                    &queue.exchange.name,
                    key,
                    QueueBindOptions {
                        nowait: queue.no_wait,
                    },
                )
                .await?;
        }

        debug!("queue: {} was declared", queue.name);
        Ok(())
    }

    /// Publishes a message to an exchange.
    ///
    /// The current trace context is injected in the message headers. When the broker
    /// hands a mandatory or immediate message back, the return listener of the message
    /// receives it.
    ///
    /// # Returns
    /// `MissingReturnListener` for mandatory/immediate messages without a listener, or
    /// the driver error
    pub async fn send_message(
        &self,
        message: &OutgoingMessage,
        exchange: &Exchange,
    ) -> Result<(), AmqpError> {
        let mandatory = message.is_mandatory()?;
        let immediate = message.is_immediate()?;

        let mut properties = message.to_properties();
        if let Some(headers) = otel::inject_context(&Context::current(), message.headers()) {
            properties = properties.with_headers(headers);
        }

        let routing_key = message.get_routing_key().unwrap_or_default();
        debug!(
            exchange = exchange.name.as_str(),
            routing_key, "publishing message"
        );

        let returned = self
            .inner
            .basic_publish(
                &exchange.name,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                message.body(),
                properties,
            )
            .await?;

        if let Some(returned) = returned {
            debug!(
                reply_code = returned.reply_code,
                reply_text = returned.reply_text.as_str(),
                "message returned by the broker"
            );
            if let Some(listener) = message.get_return_listener() {
                listener(returned);
            }
        }

        Ok(())
    }

    /// Consumes a queue until the consumer is cancelled or the channel closes.
    ///
    /// Each delivery is wrapped in an `IncomingMessage` and handed to `handler` inside
    /// a consumer span carrying the publisher trace context.
    ///
    /// # Parameters
    /// * `queue` - A declared queue
    /// * `options` - Consumer tag and flags
    /// * `handler` - Called once per delivery
    pub async fn consume<H>(
        &self,
        queue: &Queue,
        options: &ConsumerOptions,
        handler: H,
    ) -> Result<(), AmqpError>
    where
        H: MessageHandler,
    {
        let mut deliveries = self
            .inner
            .basic_consume(
                &queue.name,
                &options.name,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
            )
            .await?;

        debug!(queue = queue.name.as_str(), "consumer registered");

        let tracer = global::tracer("amqp consumer");

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    let (ctx, mut span) =
                        otel::new_span(&delivery.properties, &tracer, &delivery.routing_key);

                    debug!(
                        "received: {} - exchange: {}",
                        delivery.delivery_tag, delivery.exchange
                    );

                    let msg = IncomingMessage::new(delivery, self.clone(), ctx);

                    match handler.handle(msg).await {
                        Ok(_) => span.set_status(Status::Ok),
                        Err(err) => {
                            error!(error = err.to_string(), "error consume msg");
                            span.record_error(&err);
                            span.set_status(Status::Error {
                                description: Cow::from(err.to_string()),
                            });
                        }
                    }
                }

                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!(queue = queue.name.as_str(), "consumer finished");
        Ok(())
    }

    /// Limits the messages the broker sends ahead of acknowledgments.
    ///
    /// Only relevant for acknowledged consumption.
    ///
    /// # Parameters
    /// * `prefetch_size` - Prefetch window in bytes, 0 for no limit
    /// * `prefetch_count` - Prefetch window in messages, 0 for no limit
    /// * `global` - Apply to the whole connection instead of this channel
    pub async fn set_quality_of_service(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_size, prefetch_count, BasicQosOptions { global })
            .await
    }

    /// Acknowledges a single delivery.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner.basic_ack(delivery_tag).await
    }

    /// Rejects a single delivery.
    ///
    /// With `requeue` the broker tries to deliver it again, possibly to another
    /// consumer; otherwise it is dropped or dead-lettered.
    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner.basic_nack(delivery_tag, requeue).await
    }

    /// Cancels a consumer. Messages already delivered are not affected.
    pub async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        debug!(consumer_tag, "cancelling consumer");
        self.inner.basic_cancel(consumer_tag).await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close().await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::{InboundDelivery, MockAmqpChannel},
        exchange::ExchangeKind,
        message::ReturnedMessage,
    };
    use futures_util::stream;
    use lapin::BasicProperties;
    use mockall::{predicate::eq, Sequence};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    fn channel(mock: MockAmqpChannel) -> Channel {
        Channel::new(Arc::new(mock))
    }

    fn delivery(tag: u64, body: &str, redelivered: bool) -> InboundDelivery {
        InboundDelivery {
            consumer_tag: "consumer-1".to_owned(),
            delivery_tag: tag,
            redelivered,
            exchange: "ex1".to_owned(),
            routing_key: "k1".to_owned(),
            body: body.as_bytes().to_vec(),
            properties: BasicProperties::default(),
        }
    }

    #[tokio::test]
    async fn declare_exchange_forwards_configuration() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_exchange_declare()
            .withf(|name, kind, opts, args| {
                name == "ex1"
                    && *kind == ExchangeKind::Topic
                    && opts.durable
                    && opts.auto_delete
                    && !opts.passive
                    && !opts.internal
                    && !opts.nowait
                    && args.inner().is_empty()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let exchange = Exchange::topic("ex1").unwrap().auto_delete(true);
        channel(mock).declare_exchange(Some(&exchange)).await.unwrap();
    }

    #[tokio::test]
    async fn declare_exchange_requires_exchange() {
        let ch = channel(MockAmqpChannel::new());

        assert_eq!(
            ch.declare_exchange(None).await,
            Err(AmqpError::MissingExchange)
        );
    }

    #[tokio::test]
    async fn declare_exchange_propagates_driver_errors() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_exchange_declare()
            .returning(|name, _, _, _| Err(AmqpError::DeclareExchangeError(name.to_owned())));

        let exchange = Exchange::direct("ex1").unwrap().passive(true);
        assert_eq!(
            channel(mock).declare_exchange(Some(&exchange)).await,
            Err(AmqpError::DeclareExchangeError("ex1".to_owned()))
        );
    }

    #[tokio::test]
    async fn declare_queue_binds_every_key_in_order() {
        let mut seq = Sequence::new();
        let mut mock = MockAmqpChannel::new();

        mock.expect_queue_declare()
            .withf(|name, opts, _| name == "q1" && opts.durable && !opts.exclusive)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _, _| Ok(name.to_owned()));
        for key in ["k1", "k2"] {
            mock.expect_queue_bind()
                .with(eq("q1"), eq("ex1"), eq(key), mockall::predicate::always())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _, _| Ok(()));
        }

        let mut queue = Queue::new("q1", Exchange::direct("ex1").unwrap())
            .unwrap()
            .durable(true)
            .routing_key("k1")
            .routing_key("k2");

        channel(mock).declare_queue(Some(&mut queue)).await.unwrap();
    }

    #[tokio::test]
    async fn declare_queue_without_keys_binds_once_with_empty_key() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_queue_declare()
            .returning(|name, _, _| Ok(name.to_owned()));
        mock.expect_queue_bind()
            .with(eq("q1"), eq("fan"), eq(""), mockall::predicate::always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut queue = Queue::new("q1", Exchange::fanout("fan").unwrap()).unwrap();
        channel(mock).declare_queue(Some(&mut queue)).await.unwrap();
    }

    #[tokio::test]
    async fn declare_queue_adopts_broker_name() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_queue_declare()
            .withf(|name, _, _| name.is_empty())
            .returning(|_, _, _| Ok("amq.gen-abc".to_owned()));
        mock.expect_queue_bind()
            .with(
                eq("amq.gen-abc"),
                eq("fan"),
                eq(""),
                mockall::predicate::always(),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut queue = Queue::anonymous(Exchange::fanout("fan").unwrap()).exclusive(true);
        channel(mock).declare_queue(Some(&mut queue)).await.unwrap();

        assert_eq!(queue.name(), "amq.gen-abc");
    }

    #[tokio::test]
    async fn declare_queue_requires_queue() {
        let ch = channel(MockAmqpChannel::new());

        assert_eq!(ch.declare_queue(None).await, Err(AmqpError::MissingQueue));
    }

    #[tokio::test]
    async fn declare_queue_stops_on_bind_failure() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_queue_declare()
            .returning(|name, _, _| Ok(name.to_owned()));
        mock.expect_queue_bind().times(1).returning(|q, e, _, _| {
            Err(AmqpError::BindingExchangeToQueueError(
                e.to_owned(),
                q.to_owned(),
            ))
        });

        let mut queue = Queue::new("q1", Exchange::direct("ex1").unwrap())
            .unwrap()
            .routing_keys_from(["a", "b"]);

        assert!(matches!(
            channel(mock).declare_queue(Some(&mut queue)).await,
            Err(AmqpError::BindingExchangeToQueueError(_, _))
        ));
    }

    #[tokio::test]
    async fn send_message_forwards_body_key_and_flags() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_publish()
            .withf(|exchange, key, opts, body, props| {
                exchange == "ex1"
                    && key == "k1"
                    && !opts.mandatory
                    && !opts.immediate
                    && body == br#"{"a":1,"b":2}"#
                    && props.content_type().as_ref().map(|v| v.as_str())
                        == Some("application/json")
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(None));

        let msg = OutgoingMessage::json(&serde_json::json!({"a": 1, "b": 2}))
            .unwrap()
            .routing_key("k1");

        channel(mock)
            .send_message(&msg, &Exchange::direct("ex1").unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_message_without_key_uses_empty_key() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_publish()
            .withf(|_, key, _, _, _| key.is_empty())
            .times(1)
            .returning(|_, _, _, _, _| Ok(None));

        channel(mock)
            .send_message(&OutgoingMessage::text("x"), &Exchange::fanout("f").unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mandatory_without_listener_is_not_published() {
        let ch = channel(MockAmqpChannel::new());
        let msg = OutgoingMessage::text("x").mandatory(true);

        assert_eq!(
            ch.send_message(&msg, &Exchange::direct("ex1").unwrap()).await,
            Err(AmqpError::MissingReturnListener("mandatory".to_owned()))
        );
    }

    #[tokio::test]
    async fn returned_messages_reach_the_listener() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_publish()
            .withf(|_, _, opts, _, _| opts.mandatory && !opts.immediate)
            .returning(|exchange, key, _, body, props| {
                Ok(Some(ReturnedMessage {
                    reply_code: 312,
                    reply_text: "NO_ROUTE".to_owned(),
                    exchange: exchange.to_owned(),
                    routing_key: key.to_owned(),
                    body: body.to_vec(),
                    properties: props,
                }))
            });

        let returned = Arc::new(Mutex::new(vec![]));
        let sink = returned.clone();
        let msg = OutgoingMessage::text("lost")
            .routing_key("nowhere")
            .mandatory(true)
            .return_listener(move |msg| sink.lock().unwrap().push(msg));

        channel(mock)
            .send_message(&msg, &Exchange::direct("ex1").unwrap())
            .await
            .unwrap();

        let returned = returned.lock().unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].reply_code, 312);
        assert_eq!(returned[0].routing_key, "nowhere");
        assert_eq!(returned[0].body, b"lost");
    }

    #[tokio::test]
    async fn consume_hands_every_delivery_to_the_handler() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_consume()
            .withf(|queue, tag, opts| {
                queue == "q1" && tag == "consumer-1" && !opts.no_ack && !opts.exclusive
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(stream::iter(vec![
                    Ok(delivery(1, r#"{"a":1,"b":2}"#, false)),
                    Err(AmqpError::ConsumerError("frame".to_owned())),
                    Ok(delivery(2, r#"{"a":3,"b":4}"#, true)),
                ])
                .boxed())
            });
        mock.expect_basic_ack()
            .with(eq(1))
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_basic_nack()
            .with(eq(2), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let queue = Queue::new("q1", Exchange::direct("ex1").unwrap()).unwrap();
        let bodies = Arc::new(Mutex::new(vec![]));
        let seen = bodies.clone();

        channel(mock)
            .consume(
                &queue,
                &ConsumerOptions::new("consumer-1"),
                move |msg: IncomingMessage| {
                    let seen = seen.clone();
                    async move {
                        let body: serde_json::Value = msg.json()?;
                        seen.lock().unwrap().push(body);
                        if msg.is_redelivered() {
                            msg.not_acknowledged(true).await
                        } else {
                            msg.acknowledged().await
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(
            *bodies.lock().unwrap(),
            vec![
                serde_json::json!({"a": 1, "b": 2}),
                serde_json::json!({"a": 3, "b": 4})
            ]
        );
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_the_loop() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_consume().returning(|_, _, _| {
            Ok(stream::iter(vec![
                Ok(delivery(1, "not json", false)),
                Ok(delivery(2, "{}", false)),
            ])
            .boxed())
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let queue = Queue::new("q1", Exchange::direct("ex1").unwrap()).unwrap();

        channel(mock)
            .consume(
                &queue,
                &ConsumerOptions::new("c"),
                move |msg: IncomingMessage| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { msg.json::<serde_json::Value>().map(|_| ()) }
                },
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn consume_fails_when_consumer_cannot_register() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_consume()
            .returning(|_, tag, _| Err(AmqpError::ConsumerDeclarationError(tag.to_owned())));

        let queue = Queue::new("q1", Exchange::direct("ex1").unwrap()).unwrap();
        let result = channel(mock)
            .consume(&queue, &ConsumerOptions::new("c"), |_msg: IncomingMessage| async {
                Ok::<(), AmqpError>(())
            })
            .await;

        assert_eq!(
            result,
            Err(AmqpError::ConsumerDeclarationError("c".to_owned()))
        );
    }

    #[tokio::test]
    async fn handler_can_cancel_its_consumer() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_consume()
            .returning(|_, _, _| Ok(stream::iter(vec![Ok(delivery(7, "x", false))]).boxed()));
        mock.expect_basic_ack()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_basic_cancel()
            .with(eq("consumer-1"))
            .times(1)
            .returning(|_| Ok(()));

        let queue = Queue::new("q1", Exchange::direct("ex1").unwrap()).unwrap();
        channel(mock)
            .consume(
                &queue,
                &ConsumerOptions::new("consumer-1"),
                |msg: IncomingMessage| async move {
                    msg.acknowledged().await?;
                    msg.cancel_consumer().await
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn qos_and_single_message_acknowledgments() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_basic_qos()
            .withf(|size, count, opts| *size == 0 && *count == 10 && opts.global)
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_basic_ack()
            .with(eq(3))
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError));
        mock.expect_basic_nack()
            .with(eq(4), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let ch = channel(mock);
        ch.set_quality_of_service(0, 10, true).await.unwrap();
        assert_eq!(ch.ack(3).await, Err(AmqpError::AckMessageError));
        ch.nack(4, false).await.unwrap();
    }
}

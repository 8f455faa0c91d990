// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! `Message` holds the envelope shared by every message: body and content properties.
//! `OutgoingMessage` adds what a publish needs (routing key, mandatory/immediate flags
//! and the listener for messages handed back by the broker). `IncomingMessage` adds the
//! delivery metadata and the channel handle used to acknowledge or reject it. Both
//! dereference to their `Message`.

use crate::{channel::Channel, driver::InboundDelivery, errors::AmqpError};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Default content type for text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Default content encoding of outgoing messages
pub const DEFAULT_CONTENT_ENCODING: &str = "UTF-8";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Envelope shared by outgoing and incoming messages.
#[derive(Debug, Clone, Default)]
pub struct Message {
    body: Vec<u8>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    persistent: bool,
    priority: Option<u8>,
    expiration: Option<u64>,
    message_id: Option<String>,
    timestamp: Option<u64>,
    user_id: Option<String>,
    app_id: Option<String>,
    headers: Option<FieldTable>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
}

impl Message {
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as text, when it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn set_content_encoding(&mut self, content_encoding: &str) -> &mut Self {
        self.content_encoding = Some(content_encoding.to_owned());
        self
    }

    /// Persistent messages are written to disk by the broker and survive restarts
    /// when their queue is durable.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) -> &mut Self {
        self.persistent = persistent;
        self
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    /// Sets the priority of the message.
    ///
    /// The value is forwarded as-is; brokers without priority queues ignore it and
    /// deliver in FIFO order.
    pub fn set_priority(&mut self, priority: u8) -> &mut Self {
        self.priority = Some(priority);
        self
    }

    /// Time-To-Live of the message in milliseconds.
    pub fn expiration(&self) -> Option<u64> {
        self.expiration
    }

    /// Sets or clears the message TTL.
    ///
    /// # Returns
    /// `InvalidArgument` when the TTL is zero
    pub fn set_expiration(&mut self, ttl: Option<u64>) -> Result<&mut Self, AmqpError> {
        if ttl == Some(0) {
            return Err(AmqpError::InvalidArgument(
                "invalid expiration time, should be at least 1 ms".to_owned(),
            ));
        }

        self.expiration = ttl;
        Ok(self)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn set_message_id(&mut self, message_id: &str) -> &mut Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    /// Assigns a random UUID as message id.
    pub fn generate_message_id(&mut self) -> &mut Self {
        self.message_id = Some(Uuid::new_v4().to_string());
        self
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Sets the creation time of the message, in seconds since the epoch.
    ///
    /// # Returns
    /// `InvalidArgument` when the timestamp is zero or does not fit a signed 64 bits value
    pub fn set_timestamp(&mut self, timestamp: u64) -> Result<&mut Self, AmqpError> {
        if timestamp < 1 || timestamp > i64::MAX as u64 {
            return Err(AmqpError::InvalidArgument(
                "invalid message timestamp".to_owned(),
            ));
        }

        self.timestamp = Some(timestamp);
        Ok(self)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The broker user sending the message; the broker checks it matches the
    /// connection user.
    pub fn set_user_id(&mut self, user_id: &str) -> &mut Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn set_app_id(&mut self, app_id: &str) -> &mut Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.headers.as_ref()
    }

    pub fn set_headers(&mut self, headers: FieldTable) -> &mut Self {
        self.headers = Some(headers);
        self
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Name of the queue expecting a reply once the message is processed.
    pub fn set_reply_to(&mut self, reply_to: &str) -> &mut Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Shared by a request and its reply to match them together.
    pub fn set_correlation_id(&mut self, correlation_id: &str) -> &mut Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub(crate) fn to_properties(&self) -> BasicProperties {
        let mut props = BasicProperties::default().with_delivery_mode(if self.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        });

        if let Some(value) = &self.content_type {
            props = props.with_content_type(ShortString::from(value.as_str()));
        }
        if let Some(value) = &self.content_encoding {
            props = props.with_content_encoding(ShortString::from(value.as_str()));
        }
        if let Some(value) = self.priority {
            props = props.with_priority(value);
        }
        if let Some(value) = self.expiration {
            props = props.with_expiration(ShortString::from(value.to_string()));
        }
        if let Some(value) = &self.message_id {
            props = props.with_message_id(ShortString::from(value.as_str()));
        }
        if let Some(value) = self.timestamp {
            props = props.with_timestamp(value);
        }
        if let Some(value) = &self.user_id {
            props = props.with_user_id(ShortString::from(value.as_str()));
        }
        if let Some(value) = &self.app_id {
            props = props.with_app_id(ShortString::from(value.as_str()));
        }
        if let Some(value) = &self.headers {
            props = props.with_headers(value.clone());
        }
        if let Some(value) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(value.as_str()));
        }
        if let Some(value) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(value.as_str()));
        }

        props
    }

    pub(crate) fn from_properties(body: Vec<u8>, props: &BasicProperties) -> Message {
        let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.to_string());

        Message {
            body,
            content_type: text(props.content_type()),
            content_encoding: text(props.content_encoding()),
            persistent: *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
            priority: *props.priority(),
            expiration: props
                .expiration()
                .as_ref()
                .and_then(|v| v.as_str().parse().ok()),
            message_id: text(props.message_id()),
            timestamp: *props.timestamp(),
            user_id: text(props.user_id()),
            app_id: text(props.app_id()),
            headers: props.headers().clone(),
            reply_to: text(props.reply_to()),
            correlation_id: text(props.correlation_id()),
        }
    }
}

/// A message handed back by the broker because it could not be routed or delivered.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

/// Callback receiving the messages returned by the broker.
pub type ReturnListener = Arc<dyn Fn(ReturnedMessage) + Send + Sync>;

/// A message to publish.
#[derive(Clone)]
pub struct OutgoingMessage {
    message: Message,
    routing_key: Option<String>,
    mandatory: bool,
    immediate: bool,
    return_listener: Option<ReturnListener>,
}

impl OutgoingMessage {
    /// Creates a message with the given body and the default content encoding.
    pub fn new(body: impl Into<Vec<u8>>) -> OutgoingMessage {
        let mut message = Message::default();
        message
            .set_body(body)
            .set_content_encoding(DEFAULT_CONTENT_ENCODING);

        OutgoingMessage {
            message,
            routing_key: None,
            mandatory: false,
            immediate: false,
            return_listener: None,
        }
    }

    /// Creates a JSON message from any serializable value.
    ///
    /// # Returns
    /// `ParsePayloadError` when the value cannot be encoded
    pub fn json<T: Serialize + ?Sized>(data: &T) -> Result<OutgoingMessage, AmqpError> {
        let body = serde_json::to_vec(data)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        let mut msg = OutgoingMessage::new(body);
        msg.set_content_type(JSON_CONTENT_TYPE);
        Ok(msg)
    }

    /// Creates a plain text message.
    pub fn text(data: impl Into<String>) -> OutgoingMessage {
        let mut msg = OutgoingMessage::new(data.into().into_bytes());
        msg.set_content_type(TEXT_CONTENT_TYPE);
        msg
    }

    /// Sets the routing key used by direct and topic exchanges.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn get_routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// Asks the broker to return the message when no queue can take it.
    ///
    /// Requires a return listener; the check happens when the flag is read.
    pub fn mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }

    /// Asks the broker to return the message when no consumer can take it right away.
    ///
    /// Requires a return listener; the check happens when the flag is read.
    pub fn immediate(mut self, value: bool) -> Self {
        self.immediate = value;
        self
    }

    /// Sets the function called with the messages returned by the broker.
    pub fn return_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(ReturnedMessage) + Send + Sync + 'static,
    {
        self.return_listener = Some(Arc::new(listener));
        self
    }

    pub fn has_return_listener(&self) -> bool {
        self.return_listener.is_some()
    }

    pub fn get_return_listener(&self) -> Option<&ReturnListener> {
        self.return_listener.as_ref()
    }

    /// # Returns
    /// The mandatory flag, or `MissingReturnListener` when it is set without a listener
    pub fn is_mandatory(&self) -> Result<bool, AmqpError> {
        if self.mandatory && !self.has_return_listener() {
            return Err(AmqpError::MissingReturnListener("mandatory".to_owned()));
        }

        Ok(self.mandatory)
    }

    /// # Returns
    /// The immediate flag, or `MissingReturnListener` when it is set without a listener
    pub fn is_immediate(&self) -> Result<bool, AmqpError> {
        if self.immediate && !self.has_return_listener() {
            return Err(AmqpError::MissingReturnListener("immediate".to_owned()));
        }

        Ok(self.immediate)
    }
}

impl Deref for OutgoingMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("message", &self.message)
            .field("routing_key", &self.routing_key)
            .field("mandatory", &self.mandatory)
            .field("immediate", &self.immediate)
            .field("return_listener", &self.return_listener.is_some())
            .finish()
    }
}

/// A message delivered to a consumer.
///
/// Keeps a handle to the channel that delivered it, so it can be acknowledged or
/// rejected from the handler. Once that channel is closed these calls fail.
#[derive(Clone)]
pub struct IncomingMessage {
    message: Message,
    channel: Channel,
    consumer_tag: String,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    cluster_id: Option<String>,
    kind: Option<String>,
    context: Context,
}

impl IncomingMessage {
    pub(crate) fn new(delivery: InboundDelivery, channel: Channel, context: Context) -> Self {
        let InboundDelivery {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
            body,
            properties,
        } = delivery;

        IncomingMessage {
            message: Message::from_properties(body, &properties),
            channel,
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
            cluster_id: properties.cluster_id().as_ref().map(|v| v.to_string()),
            kind: properties.kind().as_ref().map(|v| v.to_string()),
            context,
        }
    }

    /// Acknowledges the message as received and processed.
    ///
    /// The broker keeps the message until it is acknowledged.
    pub async fn acknowledged(&self) -> Result<(), AmqpError> {
        self.channel.ack(self.delivery_tag).await
    }

    /// Rejects the message.
    ///
    /// # Parameters
    /// * `requeue` - Return the message to its queue; otherwise it is dropped or
    ///   dead-lettered
    pub async fn not_acknowledged(&self, requeue: bool) -> Result<(), AmqpError> {
        self.channel.nack(self.delivery_tag, requeue).await
    }

    /// Stops the consumer that received this message.
    ///
    /// Messages already delivered are still handed to the handler; no new ones are sent.
    pub async fn cancel_consumer(&self) -> Result<(), AmqpError> {
        self.channel.cancel_consumer(&self.consumer_tag).await
    }

    /// Decodes a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(self.body())
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the message was delivered before, to this or another consumer.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref()
    }

    /// The message type property set by the publisher.
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Trace context propagated by the publisher.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Deref for IncomingMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("message", &self.message)
            .field("consumer_tag", &self.consumer_tag)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

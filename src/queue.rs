// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the declarative configuration of a queue and its binding to a
//! single exchange. A queue may be bound with several routing keys, each producing one
//! binding on declaration. A queue without explicit routing keys is bound once with no
//! routing discriminator, which is what fanout exchanges expect.

use crate::{errors::AmqpError, exchange::Exchange};
use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify the queue expiration
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue with its declaration parameters and exchange binding.
///
/// The queue is always bound to exactly one exchange. Routing keys behave as a set
/// that remembers insertion order: adding a key twice keeps a single binding.
#[derive(Debug, Clone)]
pub struct Queue {
    pub(crate) name: String,
    pub(crate) exchange: Exchange,
    pub(crate) passive: bool,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
    pub(crate) routing_keys: Vec<String>,
}

impl Queue {
    /// Creates a named queue bound to the given exchange.
    ///
    /// # Parameters
    /// * `name` - The name of the queue, must not be empty
    /// * `exchange` - The exchange the queue receives messages from
    ///
    /// # Returns
    /// The queue definition, or `InvalidArgument` for an empty name
    pub fn new(name: &str, exchange: Exchange) -> Result<Queue, AmqpError> {
        let mut queue = Queue::anonymous(exchange);
        queue.set_name(name)?;
        Ok(queue)
    }

    /// Creates a queue whose name will be assigned by the broker on declaration.
    pub fn anonymous(exchange: Exchange) -> Queue {
        Queue {
            name: String::new(),
            exchange,
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            no_wait: false,
            arguments: BTreeMap::default(),
            routing_keys: vec![],
        }
    }

    /// Renames the queue.
    ///
    /// # Returns
    /// `InvalidArgument` when the name is empty
    pub fn set_name(&mut self, name: &str) -> Result<&mut Self, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "invalid queue name, should be a non empty string".to_owned(),
            ));
        }

        self.name = name.to_owned();
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue has a name, either given or assigned by the broker.
    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    /// Binds the queue to another exchange, replacing the previous one.
    pub fn bind_to(mut self, exchange: Exchange) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Makes the queue passive: the broker only checks that it exists.
    pub fn passive(mut self, value: bool) -> Self {
        self.passive = value;
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// Durable queues do not necessarily hold persistent messages.
    pub fn durable(mut self, value: bool) -> Self {
        self.durable = value;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self, value: bool) -> Self {
        self.exclusive = value;
        self
    }

    /// Deletes the queue once its last consumer is gone.
    pub fn auto_delete(mut self, value: bool) -> Self {
        self.auto_delete = value;
        self
    }

    /// Declares and binds without waiting for the broker reply.
    pub fn no_wait(mut self, value: bool) -> Self {
        self.no_wait = value;
        self
    }

    /// Replaces the declaration arguments.
    pub fn arguments(mut self, arguments: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Sets the Time-To-Live of the messages in the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    pub fn message_ttl(self, ttl: i32) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, AMQPValue::LongInt(LongInt::from(ttl)))
    }

    /// Deletes the queue after being unused for the given milliseconds.
    pub fn expires(self, millis: i32) -> Self {
        self.argument(AMQP_HEADERS_EXPIRES, AMQPValue::LongInt(LongInt::from(millis)))
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// When this limit is reached, the oldest messages are discarded or
    /// dead-lettered.
    pub fn max_length(self, max: i32) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, AMQPValue::LongInt(LongInt::from(max)))
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.argument(
            AMQP_HEADERS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    /// Routes rejected, expired or overflowing messages to another exchange.
    ///
    /// # Parameters
    /// * `exchange` - Name of the dead letter exchange
    /// * `routing_key` - Routing key replacing the original one, if any
    pub fn dead_letter_exchange(self, exchange: &str, routing_key: Option<&str>) -> Self {
        let queue = self.argument(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        );

        match routing_key {
            Some(key) => queue.argument(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                AMQPValue::LongString(LongString::from(key)),
            ),
            None => queue,
        }
    }

    /// Replaces the routing keys used to bind the queue.
    pub fn routing_keys_from<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys.clear();
        for key in keys {
            self.push_routing_key(key.into());
        }
        self
    }

    /// Adds a routing key; keys already present are ignored.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.push_routing_key(key.to_owned());
        self
    }

    fn push_routing_key(&mut self, key: String) {
        if !self.routing_keys.contains(&key) {
            self.routing_keys.push(key);
        }
    }

    /// The keys the queue is bound with, in insertion order.
    ///
    /// Never empty: without explicit keys this yields a single `None`.
    pub fn routing_keys(&self) -> Vec<Option<&str>> {
        if self.routing_keys.is_empty() {
            return vec![None];
        }

        self.routing_keys.iter().map(|key| Some(key.as_str())).collect()
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn get_arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fanout() -> Exchange {
        Exchange::fanout("ex1").unwrap()
    }

    #[test]
    fn without_keys_yields_single_none() {
        let queue = Queue::new("q1", fanout()).unwrap();

        assert_eq!(queue.routing_keys(), vec![None]);
    }

    #[test]
    fn keys_keep_insertion_order_without_duplicates() {
        let queue = Queue::new("q1", fanout())
            .unwrap()
            .routing_key("b")
            .routing_key("a")
            .routing_key("b");

        assert_eq!(queue.routing_keys(), vec![Some("b"), Some("a")]);

        let queue = queue.routing_keys_from(["x", "y", "x"]);
        assert_eq!(queue.routing_keys(), vec![Some("x"), Some("y")]);

        let queue = queue.routing_keys_from(Vec::<String>::new());
        assert_eq!(queue.routing_keys(), vec![None]);
    }

    #[test]
    fn names() {
        assert!(matches!(
            Queue::new("", fanout()),
            Err(AmqpError::InvalidArgument(_))
        ));

        let mut queue = Queue::anonymous(fanout());
        assert!(!queue.has_name());

        queue.set_name("amq.gen-1").unwrap();
        assert!(queue.has_name());
        assert_eq!(queue.name(), "amq.gen-1");
        assert!(queue.set_name("").is_err());
    }

    #[test]
    fn rebinding_replaces_exchange() {
        let queue = Queue::new("q1", fanout())
            .unwrap()
            .bind_to(Exchange::direct("ex2").unwrap());

        assert_eq!(queue.exchange().name(), "ex2");
    }

    #[test]
    fn argument_helpers() {
        let queue = Queue::new("q1", fanout())
            .unwrap()
            .durable(true)
            .exclusive(true)
            .message_ttl(15000)
            .expires(16000)
            .max_length(10)
            .max_length_bytes(1024)
            .dead_letter_exchange("dlx", Some("dead"));

        let args = queue.get_arguments();
        assert!(queue.is_durable());
        assert!(queue.is_exclusive());
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(15000))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongInt(10))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("dead")))
        );
        assert_eq!(args.len(), 6);
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the declarative configuration of an AMQP exchange. Exchanges
//! are the routing entities of the broker: they receive published messages and forward
//! them to the bound queues following the rule of their kind. The kind is chosen by the
//! constructor and cannot be changed afterwards.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, fmt};

/// Represents the kinds of exchanges supported by the broker.
///
/// Each exchange kind has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    /// The AMQP type name sent on declaration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration parameters.
///
/// Exchanges are durable by default; every other flag starts unset. Flags are
/// configured with consuming builder methods.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) passive: bool,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl Exchange {
    /// Creates an exchange definition of the given kind.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange, must not be empty
    /// * `kind` - The routing kind of the exchange
    ///
    /// # Returns
    /// The exchange definition, or `InvalidArgument` for an empty name
    pub fn new(name: &str, kind: ExchangeKind) -> Result<Exchange, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "invalid exchange name, should be a non empty string".to_owned(),
            ));
        }

        Ok(Exchange {
            name: name.to_owned(),
            kind,
            passive: false,
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: BTreeMap::default(),
        })
    }

    /// Creates a direct exchange, routing on exact routing key matches.
    pub fn direct(name: &str) -> Result<Exchange, AmqpError> {
        Exchange::new(name, ExchangeKind::Direct)
    }

    /// Creates a fanout exchange, delivering to every bound queue.
    pub fn fanout(name: &str) -> Result<Exchange, AmqpError> {
        Exchange::new(name, ExchangeKind::Fanout)
    }

    /// Creates a topic exchange, routing on routing key patterns.
    pub fn topic(name: &str) -> Result<Exchange, AmqpError> {
        Exchange::new(name, ExchangeKind::Topic)
    }

    /// Creates a headers exchange, routing on message headers.
    pub fn headers(name: &str) -> Result<Exchange, AmqpError> {
        Exchange::new(name, ExchangeKind::Headers)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Makes the exchange passive: the broker only checks that it exists.
    ///
    /// When set, every other flag except no-wait is ignored by the broker and
    /// declaring a missing exchange fails.
    pub fn passive(mut self, value: bool) -> Self {
        self.passive = value;
        self
    }

    /// Makes the exchange survive broker restarts.
    pub fn durable(mut self, value: bool) -> Self {
        self.durable = value;
        self
    }

    /// Deletes the exchange once no queue is bound to it anymore.
    pub fn auto_delete(mut self, value: bool) -> Self {
        self.auto_delete = value;
        self
    }

    /// Internal exchanges only accept messages from other exchanges.
    pub fn internal(mut self, value: bool) -> Self {
        self.internal = value;
        self
    }

    /// Declares without waiting for the broker reply.
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

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn get_arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.arguments
    }
}

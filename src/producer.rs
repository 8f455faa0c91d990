// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer
//!
//! Publishes messages to an exchange. The exchange is declared before the first
//! publish and remembered as the default target of later ones.

use crate::{
    application::Application, broker::Broker, errors::AmqpError, exchange::Exchange,
    message::OutgoingMessage,
};
use tracing::debug;

#[derive(Debug, Default)]
pub struct Producer {
    broker: Broker,
    exchange: Option<Exchange>,
}

impl Producer {
    pub fn new(broker: Broker) -> Producer {
        Producer {
            broker,
            exchange: None,
        }
    }

    /// The exchange messages are published to by default.
    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }

    /// Declares the exchange and makes it the default target.
    pub async fn send_to(&mut self, exchange: Exchange) -> Result<&mut Self, AmqpError> {
        let channel = self.broker.channel().await?;
        channel.declare_exchange(Some(&exchange)).await?;

        debug!(exchange = exchange.name(), "default exchange changed");
        self.exchange = Some(exchange);
        Ok(self)
    }

    /// Publishes a message.
    ///
    /// # Parameters
    /// * `message` - The message to publish
    /// * `exchange` - Declared and used instead of the current default, which it
    ///   replaces
    ///
    /// # Returns
    /// `MissingExchange` when no exchange was ever given
    pub async fn publish(
        &mut self,
        message: &OutgoingMessage,
        exchange: Option<Exchange>,
    ) -> Result<(), AmqpError> {
        if let Some(exchange) = exchange {
            self.send_to(exchange).await?;
        }

        let Some(exchange) = &self.exchange else {
            return Err(AmqpError::MissingExchange);
        };

        let channel = self.broker.channel().await?;
        channel.send_message(message, exchange).await
    }
}

impl Application for Producer {
    fn broker(&self) -> &Broker {
        &self.broker
    }

    fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }
}

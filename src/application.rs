// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Behaviour shared by the producer and consumer applications.

use crate::{
    broker::{Broker, ChannelSelector},
    channel::Channel,
    connection::ConnectionType,
    driver::AmqpConnection,
    errors::AmqpError,
};
use async_trait::async_trait;

/// An application talking to a broker through its own `Broker`.
#[async_trait]
pub trait Application: Send {
    fn broker(&self) -> &Broker;

    fn broker_mut(&mut self) -> &mut Broker;

    /// Connects the broker.
    ///
    /// # Parameters
    /// * `kind` - Connection type to build, instead of the configured one. Only used
    ///   when no connection exists yet
    /// * `connection` - A pre-built connection to adopt
    async fn connect(
        &mut self,
        kind: Option<ConnectionType>,
        connection: Option<Box<dyn AmqpConnection>>,
    ) -> Result<(), AmqpError> {
        let broker = self.broker_mut();
        if let Some(kind) = kind {
            broker.options_mut().set_connection_type(kind);
        }

        broker.connect(connection).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AmqpError> {
        self.broker_mut().disconnect().await?;
        Ok(())
    }

    async fn open_channel(&mut self, selector: ChannelSelector) -> Result<Channel, AmqpError> {
        self.broker_mut().open_channel(selector).await
    }
}

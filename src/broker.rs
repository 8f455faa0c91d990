// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! A `Broker` owns the connection options, the driver connection and the current
//! channel. The connection is created on demand and reused by later channel requests
//! until `disconnect` drops it.

use crate::{
    channel::Channel,
    connection::ConnectionFactory,
    driver::AmqpConnection,
    errors::AmqpError,
    options::BrokerOptions,
};
use std::fmt;
use tracing::{debug, warn};

/// Channel id requested when opening a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelSelector {
    /// The id set in the broker options, or any id when none is set
    #[default]
    Configured,
    /// Any id, assigned by the driver
    Any,
    /// This exact id
    Id(u16),
}

pub struct Broker {
    options: BrokerOptions,
    connection: Option<Box<dyn AmqpConnection>>,
    channel: Option<Channel>,
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Broker {
        Broker {
            options,
            connection: None,
            channel: None,
        }
    }

    /// A broker with the RabbitMQ defaults.
    pub fn rabbitmq() -> Broker {
        Broker::new(BrokerOptions::rabbitmq())
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// The options used by the next connection. Changing them does not affect an
    /// established connection.
    pub fn options_mut(&mut self) -> &mut BrokerOptions {
        &mut self.options
    }

    /// Connects to the broker.
    ///
    /// A supplied connection replaces the current one. Without one, a connection of
    /// the configured type is built when there is none yet. A connection that is no
    /// longer active is reconnected; an active one is left untouched.
    ///
    /// # Parameters
    /// * `connection` - A pre-built connection to adopt
    pub async fn connect(
        &mut self,
        connection: Option<Box<dyn AmqpConnection>>,
    ) -> Result<&mut Self, AmqpError> {
        if let Some(conn) = connection {
            debug!("adopting the given connection");
            self.replace_connection(conn).await;
        }

        if self.connection.is_none() {
            let kind = self.options.connection_type();
            debug!(connection_type = kind.as_str(), "creating connection");
            self.connection = Some(ConnectionFactory::create(&self.options, kind).await?);
        }

        if let Some(conn) = self.connection.as_mut() {
            if !conn.is_connected() {
                debug!("connection is not active, reconnecting");
                self.channel = None;
                conn.reconnect().await?;
            }
        }

        Ok(self)
    }

    async fn replace_connection(&mut self, conn: Box<dyn AmqpConnection>) {
        self.channel = None;
        if let Some(mut previous) = self.connection.replace(conn) {
            if let Err(err) = previous.close().await {
                warn!(error = err.to_string(), "failure to close the replaced connection");
            }
        }
    }

    /// Closes and discards the connection and the current channel.
    pub async fn disconnect(&mut self) -> Result<&mut Self, AmqpError> {
        self.channel = None;

        if let Some(mut conn) = self.connection.take() {
            debug!("closing connection");
            conn.close().await?;
        }

        Ok(self)
    }

    /// Whether a connection exists and is active.
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    /// The active connection, connecting first when needed.
    pub async fn connection(&mut self) -> Result<&mut dyn AmqpConnection, AmqpError> {
        self.connect(None).await?;

        match self.connection.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(AmqpError::ConnectionError(
                "connection is not established".to_owned(),
            )),
        }
    }

    /// Opens a channel and makes it the current one.
    ///
    /// # Returns
    /// The new channel, or `ChannelError` when the requested id cannot be used
    pub async fn open_channel(&mut self, selector: ChannelSelector) -> Result<Channel, AmqpError> {
        let id = match selector {
            ChannelSelector::Configured => self.options.channel_id(),
            ChannelSelector::Any => None,
            ChannelSelector::Id(0) => {
                return Err(AmqpError::ChannelError(
                    "channel 0 is reserved for the connection".to_owned(),
                ))
            }
            ChannelSelector::Id(id) => Some(id),
        };

        let inner = self.connection().await?.open_channel(id).await?;
        let channel = Channel::new(inner);
        debug!(channel = channel.id(), "current channel changed");

        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// The current channel, opening one with the configured id when there is none.
    ///
    /// The connection is checked first; a channel of a dropped connection is replaced.
    pub async fn channel(&mut self) -> Result<Channel, AmqpError> {
        self.connect(None).await?;

        match &self.channel {
            Some(channel) => Ok(channel.clone()),
            None => self.open_channel(ChannelSelector::Configured).await,
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Broker::rabbitmq()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .field("channel", &self.channel)
            .finish()
    }
}

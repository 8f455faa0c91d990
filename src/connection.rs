// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module maps a `ConnectionType` to a `lapin` connection. The factory forwards
//! the broker options relevant to the selected type and connects; it does not retry
//! and does not pool: each call builds one connection.

use crate::{
    driver::{AmqpChannel, AmqpConnection, LapinChannel},
    errors::AmqpError,
    options::{BrokerOptions, SslOptions},
};
use async_trait::async_trait;
use lapin::{
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::LongString,
    uri::{AMQPScheme, AMQPUri},
    Connection, ConnectionProperties,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Kind of driver connection built by the `ConnectionFactory`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConnectionType {
    /// Plain TCP, connected right away
    #[default]
    Stream,
    /// TLS, connected right away
    SslStream,
    /// Plain TCP, connected when the first channel is opened
    LazyStream,
    /// Plain TCP, with the driver default heartbeat
    Socket,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Stream => "stream",
            ConnectionType::SslStream => "ssl_stream",
            ConnectionType::LazyStream => "lazy_stream",
            ConnectionType::Socket => "socket",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" | "StreamIO" => Ok(ConnectionType::Stream),
            "ssl_stream" | "ssl" | "StreamIO_SSL" => Ok(ConnectionType::SslStream),
            "lazy_stream" | "lazy" | "StreamIO_Lazy" => Ok(ConnectionType::LazyStream),
            "socket" | "SocketIO" => Ok(ConnectionType::Socket),
            _ => Err(AmqpError::UnknownConnectionType(s.to_owned())),
        }
    }
}

impl TryFrom<String> for ConnectionType {
    type Error = AmqpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectionType> for String {
    fn from(value: ConnectionType) -> Self {
        value.as_str().to_owned()
    }
}

/// Everything needed to (re)establish a connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) uri: AMQPUri,
    pub(crate) locale: String,
    pub(crate) ssl: Option<SslOptions>,
    pub(crate) connect_timeout: Duration,
    pub(crate) rpc_timeout: Option<Duration>,
}

impl ConnectionSettings {
    pub(crate) fn new(options: &BrokerOptions, kind: ConnectionType) -> ConnectionSettings {
        let mut uri = AMQPUri::default();

        if kind == ConnectionType::SslStream {
            uri.scheme = AMQPScheme::AMQPS;
        }
        uri.authority.userinfo.username = options.user().to_owned();
        uri.authority.userinfo.password = options.password().to_owned();
        uri.authority.host = options.host().to_owned();
        uri.authority.port = options.port();
        uri.vhost = options.vhost().to_owned();
        uri.query.auth_mechanism = Some(options.login_method().into());
        uri.query.connection_timeout = Some(options.timeout().as_millis() as u64);

        if kind != ConnectionType::Socket {
            uri.query.heartbeat = options.heartbeat();
        }

        ConnectionSettings {
            uri,
            locale: options.locale().to_owned(),
            ssl: match kind {
                ConnectionType::SslStream => Some(options.ssl().cloned().unwrap_or_default()),
                _ => None,
            },
            connect_timeout: options.timeout(),
            rpc_timeout: Some(options.read_write_timeout()),
        }
    }

    fn properties(&self) -> ConnectionProperties {
        let mut properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(env!("CARGO_PKG_NAME")));
        properties.locale = self.locale.clone();
        properties
    }

    fn tls_config(&self) -> Option<OwnedTLSConfig> {
        self.ssl.as_ref().map(|ssl| OwnedTLSConfig {
            identity: ssl.identity.as_ref().map(|identity| OwnedIdentity {
                der: identity.der.clone(),
                password: identity.password.clone(),
            }),
            cert_chain: ssl.cert_chain.clone(),
        })
    }

    async fn connect(&self) -> Result<Connection, AmqpError> {
        debug!(
            host = self.uri.authority.host.as_str(),
            port = self.uri.authority.port,
            "creating amqp connection..."
        );

        let uri = self.uri.clone();
        let properties = self.properties();
        let connecting = async move {
            match self.tls_config() {
                Some(tls) => Connection::connect_uri_with_config(uri, properties, tls).await,
                None => Connection::connect_uri(uri, properties).await,
            }
        };

        let conn = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Err(_) => {
                error!("connection attempt timed out");
                Err(AmqpError::Timeout)
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            Ok(Ok(conn)) => Ok(conn),
        }?;

        debug!("amqp connected");
        Ok(conn)
    }
}

/// `lapin` implementation of `AmqpConnection`.
pub struct LapinConnection {
    settings: ConnectionSettings,
    connection: Option<Connection>,
    lazy: bool,
}

impl LapinConnection {
    /// Connects right away.
    pub(crate) async fn connect(settings: ConnectionSettings) -> Result<Self, AmqpError> {
        let connection = settings.connect().await?;

        Ok(LapinConnection {
            settings,
            connection: Some(connection),
            lazy: false,
        })
    }

    /// Defers the connection until the first channel is requested.
    pub(crate) fn lazy(settings: ConnectionSettings) -> Self {
        LapinConnection {
            settings,
            connection: None,
            lazy: true,
        }
    }

    async fn established(&mut self) -> Result<&Connection, AmqpError> {
        if self.connection.is_none() {
            self.connection = Some(self.settings.connect().await?);
        }

        self.connection
            .as_ref()
            .ok_or_else(|| AmqpError::ConnectionError("connection is not established".to_owned()))
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        match &self.connection {
            Some(conn) => conn.status().connected(),
            None => self.lazy,
        }
    }

    async fn reconnect(&mut self) -> Result<(), AmqpError> {
        if let Some(conn) = self.connection.take() {
            if conn.status().connected() {
                if let Err(err) = conn.close(200, "reconnecting").await {
                    warn!(error = err.to_string(), "failure to close the dropped connection");
                }
            }
        }

        if !self.lazy {
            self.connection = Some(self.settings.connect().await?);
        }

        Ok(())
    }

    async fn open_channel(
        &mut self,
        channel_id: Option<u16>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let rpc_timeout = self.settings.rpc_timeout;
        let conn = self.established().await?;

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        };

        if let Some(id) = channel_id {
            if channel.id() != id {
                error!(
                    requested = id,
                    assigned = channel.id(),
                    "channel id not available"
                );
                if let Err(err) = channel.close(200, "OK").await {
                    warn!(error = err.to_string(), "failure to close the unwanted channel");
                }
                return Err(AmqpError::ChannelError(format!(
                    "channel {} is not available",
                    id
                )));
            }
        }

        debug!(channel = channel.id(), "channel created");
        Ok(Arc::new(LapinChannel::new(channel, rpc_timeout)))
    }

    async fn close(&mut self) -> Result<(), AmqpError> {
        let Some(conn) = self.connection.take() else {
            return Ok(());
        };

        match conn.close(200, "OK").await {
            Err(err) => {
                error!(error = err.to_string(), "error to close the connection");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Builds driver connections from broker options.
pub struct ConnectionFactory;

impl ConnectionFactory {
    /// Creates a connection of the given type.
    ///
    /// # Parameters
    /// * `options` - Broker parameters; only those relevant to `kind` are forwarded
    /// * `kind` - The kind of connection to build
    ///
    /// # Returns
    /// The connection, already established unless `kind` is `LazyStream`
    pub async fn create(
        options: &BrokerOptions,
        kind: ConnectionType,
    ) -> Result<Box<dyn AmqpConnection>, AmqpError> {
        let settings = ConnectionSettings::new(options, kind);

        Ok(match kind {
            ConnectionType::LazyStream => Box::new(LapinConnection::lazy(settings)),
            _ => Box::new(LapinConnection::connect(settings).await?),
        })
    }
}

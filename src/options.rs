// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Options
//!
//! Connection parameters of a broker, validated when they are set. Values out of range
//! fail immediately with `InvalidArgument`; nothing is clamped and no network activity
//! happens here.
//!
//! Options start from the RabbitMQ profile (`BrokerOptions::rabbitmq`) and can be
//! overridden from a `BrokerSettings` document (JSON) or from `AMQP_*` environment
//! variables. Overrides go through the same setters, so they are validated too.

use crate::{connection::ConnectionType, errors::AmqpError};
use lapin::auth::SASLMechanism;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_LOCALE: &str = "en_US";
/// Connection timeout, in seconds
pub const DEFAULT_TIMEOUT: u64 = 5;
/// Read/write timeout, in seconds
pub const DEFAULT_READ_WRITE_TIMEOUT: u64 = 3;

const MAX_TIMEOUT: u64 = 300;

/// SASL mechanism used to authenticate against the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LoginMethod {
    #[default]
    AmqPlain,
    Plain,
    External,
}

impl LoginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::AmqPlain => "AMQPLAIN",
            LoginMethod::Plain => "PLAIN",
            LoginMethod::External => "EXTERNAL",
        }
    }
}

impl fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoginMethod {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AMQPLAIN" => Ok(LoginMethod::AmqPlain),
            "PLAIN" => Ok(LoginMethod::Plain),
            "EXTERNAL" => Ok(LoginMethod::External),
            _ => Err(AmqpError::InvalidArgument(format!(
                "unknown login method: {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for LoginMethod {
    type Error = AmqpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LoginMethod> for String {
    fn from(value: LoginMethod) -> Self {
        value.as_str().to_owned()
    }
}

impl From<LoginMethod> for SASLMechanism {
    fn from(value: LoginMethod) -> Self {
        match value {
            LoginMethod::AmqPlain => SASLMechanism::AMQPlain,
            LoginMethod::Plain => SASLMechanism::Plain,
            LoginMethod::External => SASLMechanism::External,
        }
    }
}

/// Client identity presented during the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslIdentity {
    /// PKCS#12 archive
    pub der: Vec<u8>,
    pub password: String,
}

/// TLS options of `SslStream` connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslOptions {
    /// PEM chain of the certificate authorities to trust, on top of the system ones
    pub cert_chain: Option<String>,
    pub identity: Option<SslIdentity>,
}

/// Validated connection parameters of a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    host: String,
    port: u16,
    user: String,
    password: String,
    vhost: String,
    login_method: LoginMethod,
    locale: String,
    timeout: u64,
    read_write_timeout: u64,
    keepalive: bool,
    heartbeat: Option<u16>,
    ssl: Option<SslOptions>,
    connection_type: ConnectionType,
    channel_id: Option<u16>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions::rabbitmq()
    }
}

impl BrokerOptions {
    /// Defaults of a local RabbitMQ server.
    pub fn rabbitmq() -> BrokerOptions {
        BrokerOptions {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_owned(),
            password: DEFAULT_PASSWORD.to_owned(),
            vhost: DEFAULT_VHOST.to_owned(),
            login_method: LoginMethod::default(),
            locale: DEFAULT_LOCALE.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            read_write_timeout: DEFAULT_READ_WRITE_TIMEOUT,
            keepalive: false,
            heartbeat: None,
            ssl: None,
            connection_type: ConnectionType::default(),
            channel_id: None,
        }
    }

    /// Applies the given settings over the RabbitMQ profile.
    ///
    /// # Returns
    /// The options, or the `InvalidArgument` of the first invalid setting
    pub fn from_settings(settings: BrokerSettings) -> Result<BrokerOptions, AmqpError> {
        let mut options = BrokerOptions::rabbitmq();

        if let Some(host) = settings.host {
            options.set_host(&host)?;
        }
        if let Some(port) = settings.port {
            options.set_port(port)?;
        }
        if let Some(user) = settings.user {
            options.set_user(&user)?;
        }
        if let Some(password) = settings.password {
            options.set_password(&password);
        }
        if let Some(vhost) = settings.vhost {
            options.set_vhost(&vhost)?;
        }
        if let Some(method) = settings.login_method {
            options.set_login_method(method);
        }
        if let Some(locale) = settings.locale {
            options.set_locale(&locale)?;
        }
        if let Some(timeout) = settings.timeout {
            options.set_timeout(timeout)?;
        }
        if let Some(timeout) = settings.read_write_timeout {
            options.set_read_write_timeout(timeout)?;
        }
        if let Some(keepalive) = settings.keepalive {
            options.set_keepalive(keepalive);
        }
        if settings.heartbeat.is_some() {
            options.set_heartbeat(settings.heartbeat);
        }
        if settings.ssl.is_some() {
            options.set_ssl(settings.ssl);
        }
        if let Some(kind) = settings.connection_type {
            options.set_connection_type(kind);
        }
        if settings.channel_id.is_some() {
            options.set_channel_id(settings.channel_id)?;
        }

        Ok(options)
    }

    /// Reads the settings from a JSON document. Unknown keys are rejected.
    pub fn from_json(json: &str) -> Result<BrokerOptions, AmqpError> {
        let settings: BrokerSettings = serde_json::from_str(json).map_err(|err| {
            AmqpError::InvalidArgument(format!("invalid broker settings: {}", err))
        })?;

        BrokerOptions::from_settings(settings)
    }

    /// Reads the settings from the `AMQP_*` environment variables.
    pub fn from_env() -> Result<BrokerOptions, AmqpError> {
        BrokerOptions::from_settings(BrokerSettings::from_lookup(|key| std::env::var(key).ok())?)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: &str) -> Result<&mut Self, AmqpError> {
        self.host = non_empty("host", host)?;
        Ok(self)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// # Returns
    /// `InvalidArgument` when the port is outside `[1, 65535]`
    pub fn set_port(&mut self, port: u32) -> Result<&mut Self, AmqpError> {
        self.port = u16::try_from(port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| {
                AmqpError::InvalidArgument(format!(
                    "invalid port number {}, should be between 1 and 65535",
                    port
                ))
            })?;
        Ok(self)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn set_user(&mut self, user: &str) -> Result<&mut Self, AmqpError> {
        self.user = non_empty("user", user)?;
        Ok(self)
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_password(&mut self, password: &str) -> &mut Self {
        self.password = password.to_owned();
        self
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    pub fn set_vhost(&mut self, vhost: &str) -> Result<&mut Self, AmqpError> {
        self.vhost = non_empty("vhost", vhost)?;
        Ok(self)
    }

    pub fn login_method(&self) -> LoginMethod {
        self.login_method
    }

    pub fn set_login_method(&mut self, method: LoginMethod) -> &mut Self {
        self.login_method = method;
        self
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn set_locale(&mut self, locale: &str) -> Result<&mut Self, AmqpError> {
        self.locale = non_empty("locale", locale)?;
        Ok(self)
    }

    /// Connection timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// # Parameters
    /// * `seconds` - Between 1 and 300
    pub fn set_timeout(&mut self, seconds: u64) -> Result<&mut Self, AmqpError> {
        self.timeout = bounded_timeout("connection", seconds)?;
        Ok(self)
    }

    /// Upper bound of every call made on a channel.
    pub fn read_write_timeout(&self) -> Duration {
        Duration::from_secs(self.read_write_timeout)
    }

    /// # Parameters
    /// * `seconds` - Between 1 and 300
    pub fn set_read_write_timeout(&mut self, seconds: u64) -> Result<&mut Self, AmqpError> {
        self.read_write_timeout = bounded_timeout("read/write", seconds)?;
        Ok(self)
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    /// TCP keepalive. `lapin` manages its sockets itself and does not expose this
    /// option, so it is recorded without effect.
    pub fn set_keepalive(&mut self, keepalive: bool) -> &mut Self {
        self.keepalive = keepalive;
        self
    }

    /// Heartbeat interval in seconds; `None` keeps the value negotiated by the driver.
    pub fn heartbeat(&self) -> Option<u16> {
        self.heartbeat
    }

    pub fn set_heartbeat(&mut self, heartbeat: Option<u16>) -> &mut Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn ssl(&self) -> Option<&SslOptions> {
        self.ssl.as_ref()
    }

    pub fn set_ssl(&mut self, ssl: Option<SslOptions>) -> &mut Self {
        self.ssl = ssl;
        self
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn set_connection_type(&mut self, kind: ConnectionType) -> &mut Self {
        self.connection_type = kind;
        self
    }

    /// Channel id requested by `ChannelSelector::Configured`.
    pub fn channel_id(&self) -> Option<u16> {
        self.channel_id
    }

    /// # Returns
    /// `InvalidArgument` for id 0, reserved to the connection itself
    pub fn set_channel_id(&mut self, channel_id: Option<u16>) -> Result<&mut Self, AmqpError> {
        if channel_id == Some(0) {
            return Err(AmqpError::InvalidArgument(
                "invalid channel id, 0 is reserved for the connection".to_owned(),
            ));
        }

        self.channel_id = channel_id;
        Ok(self)
    }
}

fn non_empty(field: &str, value: &str) -> Result<String, AmqpError> {
    if value.is_empty() {
        return Err(AmqpError::InvalidArgument(format!(
            "invalid {}, should be a non empty string",
            field
        )));
    }

    Ok(value.to_owned())
}

fn bounded_timeout(kind: &str, seconds: u64) -> Result<u64, AmqpError> {
    if !(1..=MAX_TIMEOUT).contains(&seconds) {
        return Err(AmqpError::InvalidArgument(format!(
            "invalid {} timeout {}, should be between 1 and {} seconds",
            kind, seconds, MAX_TIMEOUT
        )));
    }

    Ok(seconds)
}

/// Partial broker configuration, as read from JSON or the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSettings {
    pub host: Option<String>,
    pub port: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    pub login_method: Option<LoginMethod>,
    pub locale: Option<String>,
    pub timeout: Option<u64>,
    pub read_write_timeout: Option<u64>,
    pub keepalive: Option<bool>,
    pub heartbeat: Option<u16>,
    pub ssl: Option<SslOptions>,
    pub connection_type: Option<ConnectionType>,
    pub channel_id: Option<u16>,
}

impl BrokerSettings {
    fn from_lookup<F>(lookup: F) -> Result<BrokerSettings, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(BrokerSettings {
            host: lookup("AMQP_HOST"),
            port: env_value(&lookup, "AMQP_PORT")?,
            user: lookup("AMQP_USER"),
            password: lookup("AMQP_PASSWORD"),
            vhost: lookup("AMQP_VHOST"),
            login_method: env_value(&lookup, "AMQP_LOGIN_METHOD")?,
            locale: lookup("AMQP_LOCALE"),
            timeout: env_value(&lookup, "AMQP_TIMEOUT")?,
            read_write_timeout: env_value(&lookup, "AMQP_READ_WRITE_TIMEOUT")?,
            keepalive: env_value(&lookup, "AMQP_KEEPALIVE")?,
            heartbeat: env_value(&lookup, "AMQP_HEARTBEAT")?,
            ssl: None,
            connection_type: env_value(&lookup, "AMQP_CONNECTION_TYPE")?,
            channel_id: env_value(&lookup, "AMQP_CHANNEL_ID")?,
        })
    }
}

fn env_value<F, T>(lookup: &F, key: &str) -> Result<Option<T>, AmqpError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AmqpError::InvalidArgument(format!("invalid value for {}: {}", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn rabbitmq_profile() {
        let options = BrokerOptions::rabbitmq();

        assert_eq!(options.host(), "localhost");
        assert_eq!(options.port(), 5672);
        assert_eq!(options.user(), "guest");
        assert_eq!(options.password(), "guest");
        assert_eq!(options.vhost(), "/");
        assert_eq!(options.login_method(), LoginMethod::AmqPlain);
        assert_eq!(options.locale(), "en_US");
        assert_eq!(options.timeout(), Duration::from_secs(5));
        assert_eq!(options.read_write_timeout(), Duration::from_secs(3));
        assert!(!options.keepalive());
        assert_eq!(options.heartbeat(), None);
        assert_eq!(options.connection_type(), ConnectionType::Stream);
        assert_eq!(options.channel_id(), None);
    }

    #[test]
    fn port_range() {
        let mut options = BrokerOptions::rabbitmq();

        assert!(matches!(
            options.set_port(0),
            Err(AmqpError::InvalidArgument(_))
        ));
        assert!(options.set_port(65536).is_err());
        assert_eq!(options.port(), 5672);

        options.set_port(1).unwrap();
        assert_eq!(options.port(), 1);
        options.set_port(65535).unwrap();
        assert_eq!(options.port(), 65535);
    }

    #[test]
    fn timeout_range() {
        let mut options = BrokerOptions::rabbitmq();

        assert!(options.set_timeout(0).is_err());
        assert!(options.set_timeout(301).is_err());
        assert!(options.set_read_write_timeout(0).is_err());
        assert!(options.set_read_write_timeout(301).is_err());

        options.set_timeout(300).unwrap().set_read_write_timeout(1).unwrap();
        assert_eq!(options.timeout(), Duration::from_secs(300));
        assert_eq!(options.read_write_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn empty_strings_are_rejected() {
        let mut options = BrokerOptions::rabbitmq();

        assert!(options.set_host("").is_err());
        assert!(options.set_user("").is_err());
        assert!(options.set_vhost("").is_err());
        assert!(options.set_locale("").is_err());
        assert_eq!(options, BrokerOptions::rabbitmq());

        options.set_password("");
        assert_eq!(options.password(), "");
    }

    #[test]
    fn channel_zero_is_reserved() {
        let mut options = BrokerOptions::rabbitmq();

        assert!(options.set_channel_id(Some(0)).is_err());
        options.set_channel_id(Some(3)).unwrap();
        assert_eq!(options.channel_id(), Some(3));
    }

    #[test]
    fn login_method_names() {
        assert_eq!("plain".parse::<LoginMethod>(), Ok(LoginMethod::Plain));
        assert_eq!("AMQPLAIN".parse::<LoginMethod>(), Ok(LoginMethod::AmqPlain));
        assert_eq!(LoginMethod::External.to_string(), "EXTERNAL");
        assert!("CRAM-MD5".parse::<LoginMethod>().is_err());
        assert!(matches!(
            SASLMechanism::from(LoginMethod::Plain),
            SASLMechanism::Plain
        ));
    }

    #[test]
    fn json_settings_override_the_profile() {
        let options = BrokerOptions::from_json(
            r#"{
                "host": "rabbit.local",
                "port": 5671,
                "login_method": "PLAIN",
                "heartbeat": 30,
                "connection_type": "ssl_stream",
                "ssl": { "cert_chain": "---" }
            }"#,
        )
        .unwrap();

        assert_eq!(options.host(), "rabbit.local");
        assert_eq!(options.port(), 5671);
        assert_eq!(options.user(), "guest");
        assert_eq!(options.login_method(), LoginMethod::Plain);
        assert_eq!(options.heartbeat(), Some(30));
        assert_eq!(options.connection_type(), ConnectionType::SslStream);
        assert_eq!(
            options.ssl().and_then(|ssl| ssl.cert_chain.as_deref()),
            Some("---")
        );
    }

    #[test]
    fn json_settings_are_validated() {
        assert!(BrokerOptions::from_json(r#"{"port": 70000}"#).is_err());
        assert!(BrokerOptions::from_json(r#"{"timeout": 0}"#).is_err());
        assert!(BrokerOptions::from_json(r#"{"hostname": "x"}"#).is_err());
        assert!(BrokerOptions::from_json(r#"{"connection_type": "carrier-pigeon"}"#).is_err());
    }

    #[test]
    fn environment_settings() {
        let vars = HashMap::from([
            ("AMQP_HOST", "broker"),
            ("AMQP_PORT", "5673"),
            ("AMQP_VHOST", "orders"),
            ("AMQP_READ_WRITE_TIMEOUT", "10"),
            ("AMQP_KEEPALIVE", "true"),
            ("AMQP_CONNECTION_TYPE", "lazy"),
            ("AMQP_CHANNEL_ID", "2"),
        ]);

        let settings =
            BrokerSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        let options = BrokerOptions::from_settings(settings).unwrap();

        assert_eq!(options.host(), "broker");
        assert_eq!(options.port(), 5673);
        assert_eq!(options.vhost(), "orders");
        assert_eq!(options.read_write_timeout(), Duration::from_secs(10));
        assert!(options.keepalive());
        assert_eq!(options.connection_type(), ConnectionType::LazyStream);
        assert_eq!(options.channel_id(), Some(2));
        assert_eq!(options.password(), "guest");
    }

    #[test]
    fn unparsable_environment_values() {
        let lookup = |key: &str| (key == "AMQP_PORT").then(|| "five".to_owned());

        assert_eq!(
            BrokerSettings::from_lookup(lookup),
            Err(AmqpError::InvalidArgument(
                "invalid value for AMQP_PORT: five".to_owned()
            ))
        );
    }
}

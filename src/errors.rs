// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Every fallible operation of the crate returns an `AmqpError`. The variants follow
//! three families: configuration errors raised by setters before any network activity,
//! usage errors raised where a declaration or publish is attempted with incomplete
//! input, and connection/driver errors raised when the broker or the driver fails.
//! Driver errors are logged at the call site and mapped to the variant of the
//! operation that failed.

use thiserror::Error;

/// Represents errors that can occur while configuring or using the broker facade.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// A configuration value was rejected by its setter
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Declare or publish was attempted without an exchange
    #[error("the exchange hasn't been defined")]
    MissingExchange,

    /// Declare was attempted without a queue
    #[error("the queue hasn't been defined")]
    MissingQueue,

    /// A queue yielded no routing key to bind with
    #[error("there must be at least one routing key to bind queue `{0}`")]
    MissingRoutingKey(String),

    /// Mandatory or immediate flag asserted without a return listener
    #[error("{0} flag cannot be used without declaring a return listener")]
    MissingReturnListener(String),

    /// A connection type name could not be recognised
    #[error("unknown connection type `{0}`")]
    UnknownConnectionType(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// A driver call did not complete within the read/write timeout
    #[error("operation timed out")]
    Timeout,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer
//!
//! Consumes a queue with a handler. `listen` declares the queue's exchange and the
//! queue, applies the configured quality of service and then runs the consume loop
//! until the consumer is cancelled. Deliveries always have to be acknowledged by the
//! handler.

use crate::{
    application::Application,
    broker::Broker,
    channel::{ConsumerOptions, MessageHandler},
    errors::AmqpError,
    queue::Queue,
};
use tracing::debug;

#[derive(Debug, Default)]
pub struct Consumer {
    name: String,
    broker: Broker,
    prefetch_size: Option<u32>,
    prefetch_count: Option<u16>,
    global: bool,
}

impl Consumer {
    /// Creates a consumer.
    ///
    /// # Parameters
    /// * `name` - Consumer tag; empty lets the broker generate one
    /// * `broker` - The broker to consume from
    pub fn new(name: &str, broker: Broker) -> Consumer {
        Consumer {
            name: name.to_owned(),
            broker,
            prefetch_size: None,
            prefetch_count: None,
            global: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Limits the unacknowledged bytes in flight. Unset means no limit.
    pub fn prefetch_size(mut self, size: u32) -> Self {
        self.prefetch_size = Some(size);
        self
    }

    /// Limits the unacknowledged messages in flight. Unset means no limit.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Applies the prefetch limits to the whole connection instead of the channel.
    pub fn global(mut self, value: bool) -> Self {
        self.global = value;
        self
    }

    /// Declares the queue and consumes it until the consumer is cancelled.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume; an unnamed queue takes the name given by the
    ///   broker
    /// * `handler` - Called once per delivery, in delivery order
    pub async fn listen<H>(&mut self, queue: &mut Queue, handler: H) -> Result<(), AmqpError>
    where
        H: MessageHandler,
    {
        let channel = self.broker.channel().await?;

        channel.declare_exchange(Some(queue.exchange())).await?;
        channel.declare_queue(Some(queue)).await?;
        channel
            .set_quality_of_service(
                self.prefetch_size.unwrap_or_default(),
                self.prefetch_count.unwrap_or_default(),
                self.global,
            )
            .await?;

        debug!(
            consumer = self.name.as_str(),
            queue = queue.name(),
            "listening"
        );

        channel
            .consume(queue, &ConsumerOptions::new(&self.name), handler)
            .await
    }
}

impl Application for Consumer {
    fn broker(&self) -> &Broker {
        &self.broker
    }

    fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }
}

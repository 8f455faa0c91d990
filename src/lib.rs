// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod application;
pub mod broker;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod driver;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod options;
pub mod producer;
pub mod queue;

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Activity Consumer
//!
//! RabbitMQ worker that records audit events. Messages are routed by their
//! `(action, type)` key to a handler; failed messages go through a tiered
//! delay-queue retry pipeline before being parked.

mod otel;

pub mod activity;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod observability;
pub mod orchestrator;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod worker;

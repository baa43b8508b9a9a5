// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod content;
pub mod delivery;
pub mod errors;
pub mod exchange;
pub mod queue;
pub mod readiness;
pub mod rpc;
pub mod schema;
pub mod topology;

pub use client::{Courier, Events};
pub use config::{CallbackQueueConfig, Config, SendOptions};
pub use consumer::{DeliveryHandler, ValidationFailure};
pub use content::Payload;
pub use delivery::{DeliveryContext, Disposition};
pub use errors::AmqpError;
pub use rpc::{RpcOptions, RpcReply};
pub use schema::{MessageSchema, SchemaViolation, StaticTopology, TopologySchema};

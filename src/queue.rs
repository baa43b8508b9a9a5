// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Specifications
//!
//! This module provides the builder type for declaring queues in a topology.
//! A queue spec carries the declare options handed to the broker plus an
//! optional message schema; destinations with a schema have every inbound and
//! outbound payload validated against it.

use crate::schema::MessageSchema;

/// Declaration of a queue with its configuration parameters.
///
/// Built with the builder pattern and handed to a topology. Supports message
/// TTL and length limits in addition to the standard declare flags.
#[derive(Debug, Clone, Default)]
pub struct QueueSpec {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) schema: Option<MessageSchema>,
}

impl QueueSpec {
    /// Creates a new queue spec with the given name and default settings.
    pub fn new(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            ..QueueSpec::default()
        }
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declare passive, checking existence without creating.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the no-wait flag, making the declare non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Attaches a message schema to the queue.
    ///
    /// Payloads sent to or received from this queue are validated against it
    /// unless the sender opts out with `skip_validate`.
    pub fn schema(mut self, schema: MessageSchema) -> Self {
        self.schema = Some(schema);
        self
    }
}

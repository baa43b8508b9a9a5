// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Specifications
//!
//! This module provides the builder types for declaring exchanges and the
//! bindings between exchanges and queues. Exchanges are the routing mechanism
//! that determines how published messages reach queues.

use crate::schema::MessageSchema;

/// Represents the types of exchanges available on the broker.
///
/// - Direct: routes on an exact match of routing keys
/// - Fanout: broadcasts to all bound queues regardless of routing keys
/// - Topic: routes on wildcard pattern matching of routing keys
/// - Headers: routes on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Declaration of an exchange with its configuration parameters.
#[derive(Debug, Clone, Default)]
pub struct ExchangeSpec {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) auto_delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) schema: Option<MessageSchema>,
}

impl ExchangeSpec {
    /// Creates a new direct exchange spec with the given name.
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            ..ExchangeSpec::default()
        }
    }

    /// Returns the exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the declare passive, checking existence without creating.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets the no-wait flag, making the declare non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Attaches a message schema to the exchange.
    ///
    /// Payloads published through this exchange are validated against it
    /// unless the sender opts out with `skip_validate`.
    pub fn schema(mut self, schema: MessageSchema) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Bindings define how messages flow from exchanges to queues based on
/// routing patterns.
#[derive(Debug, Clone, Default)]
pub struct BindingSpec {
    pub(crate) exchange: String,
    pub(crate) queue: String,
    pub(crate) routing_key: String,
}

impl BindingSpec {
    /// Creates a new binding for the given queue.
    pub fn new(queue: &str) -> BindingSpec {
        BindingSpec {
            queue: queue.to_owned(),
            ..BindingSpec::default()
        }
    }

    /// Sets the source exchange of the binding.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Sets the routing key or pattern for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

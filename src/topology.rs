// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Binder
//!
//! Materializes a declared topology on a fresh connection: every exchange and
//! queue is declared and every binding applied, in that order. The declared
//! specs come from the schema engine through the `TopologySchema` capability
//! interface.

use crate::{
    errors::AmqpError,
    exchange::ExchangeSpec,
    queue::QueueSpec,
    schema::TopologySchema,
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Header field for message TTL on a queue
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field for maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field for maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Names the broker reserves for itself; never declared by this layer.
pub(crate) fn is_reserved_name(name: &str) -> bool {
    name.starts_with("amq.")
}

/// Installs a declared topology onto the broker.
pub struct TopologyBinder {
    channel: Arc<Channel>,
}

impl TopologyBinder {
    pub fn new(channel: Arc<Channel>) -> TopologyBinder {
        TopologyBinder { channel }
    }

    /// Declares every exchange and queue and applies every binding.
    pub async fn install(&self, schema: &dyn TopologySchema) -> Result<(), AmqpError> {
        for spec in schema.exchanges() {
            self.declare_exchange(&spec).await?;
        }

        for spec in schema.queues() {
            declare_queue(&self.channel, &spec).await?;
        }

        for exchange in schema.exchanges() {
            for binding in schema.bindings(&exchange.name) {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    binding.queue, binding.exchange, binding.routing_key
                );

                match self
                    .channel
                    .queue_bind(
                        &binding.queue,
                        &binding.exchange,
                        &binding.routing_key,
                        QueueBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await
                {
                    Err(err) => {
                        error!(error = err.to_string(), "error to bind queue to exchange");
                        Err(AmqpError::BindingExchangeToQueueError(
                            binding.exchange.clone(),
                            binding.queue.clone(),
                        ))
                    }
                    _ => Ok(()),
                }?;
            }
        }

        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        if is_reserved_name(&spec.name) || spec.name.is_empty() {
            return Ok(());
        }

        debug!("creating exchange: {}", spec.name);

        match self
            .channel
            .exchange_declare(
                &spec.name,
                (&spec.kind).into(),
                ExchangeDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: spec.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = spec.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(spec.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", spec.name);
                Ok(())
            }
        }
    }
}

/// Declares a single queue with its arguments.
///
/// Shared with the consumer registrar, which auto-declares destinations that
/// are neither reserved nor part of the declared topology.
pub(crate) async fn declare_queue(channel: &Channel, spec: &QueueSpec) -> Result<(), AmqpError> {
    debug!("creating queue: {}", spec.name);

    let mut queue_args = BTreeMap::new();

    if let Some(ttl) = spec.ttl {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = spec.max_length {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max_bytes) = spec.max_length_bytes {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
    }

    match channel
        .queue_declare(
            &spec.name,
            QueueDeclareOptions {
                passive: spec.passive,
                durable: spec.durable,
                exclusive: spec.exclusive,
                auto_delete: spec.auto_delete,
                nowait: spec.no_wait,
            },
            FieldTable::from(queue_args),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to declare queue");
            Err(AmqpError::DeclareQueueError(spec.name.clone()))
        }
        _ => {
            debug!("queue: {} was created", spec.name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved_name("amq.gen-a1b2c3"));
        assert!(is_reserved_name("amq.rabbitmq.reply-to"));
        assert!(!is_reserved_name("orders"));
        assert!(!is_reserved_name("amqx"));
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registrar
//!
//! Attaches a handler to a queue on a channel of its own, builds a delivery
//! context per inbound message, applies schema validation, and dispatches to
//! the handler with error isolation: a failing handler forces a reject of the
//! still-pending delivery and the error is funneled to the error channel,
//! never to a caller. Every delivery therefore reaches a terminal disposition
//! even when handler logic fails.

use crate::{
    config::SendOptions,
    content::Payload,
    delivery::DeliveryContext,
    errors::AmqpError,
    otel,
    rpc::{error_envelope, RpcEnvelope},
    schema::{SchemaViolation, TopologySchema},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{message::Delivery, options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tokio::sync::{mpsc::UnboundedSender, Mutex};
use tracing::{debug, error, warn};

/// A consumer message handler.
///
/// The delivery context is passed as an explicit argument; the handler is
/// responsible for the terminal disposition of successful deliveries.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, ctx: &mut DeliveryContext) -> Result<(), AmqpError>;
}

/// A schema violation on an inbound delivery, routed to the registered
/// per-destination listener.
///
/// The listener takes over the terminal disposition of the wrapped context.
pub struct ValidationFailure {
    pub destination: String,
    pub violation: SchemaViolation,
    pub context: DeliveryContext,
}

/// Per-destination validation-error listeners, shared between the client and
/// every running consumer so a listener registered at any time is consulted.
pub(crate) type ValidationListeners =
    Arc<Mutex<HashMap<String, UnboundedSender<ValidationFailure>>>>;

/// Resolves the listener for a destination at delivery time.
pub(crate) async fn listener_for(
    listeners: &ValidationListeners,
    queue: &str,
) -> Option<UnboundedSender<ValidationFailure>> {
    listeners.lock().await.get(queue).cloned()
}

/// Everything one registered consumer needs to dispatch deliveries.
pub(crate) struct ConsumerBinding {
    pub(crate) queue: String,
    pub(crate) rpc_target: bool,
    pub(crate) handler: Arc<dyn DeliveryHandler>,
    pub(crate) schema: Arc<dyn TopologySchema>,
    pub(crate) channel: Arc<Channel>,
    pub(crate) publish_channel: Arc<Channel>,
    pub(crate) consumer_tag: String,
    pub(crate) errors: UnboundedSender<AmqpError>,
    pub(crate) listeners: ValidationListeners,
}

/// Starts the consume loop for a binding.
///
/// Returns the server-assigned consumer tag so callers may cancel later.
pub(crate) async fn start(binding: ConsumerBinding) -> Result<String, AmqpError> {
    let mut consumer = match binding
        .channel
        .basic_consume(
            &binding.queue,
            &binding.consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            return Err(AmqpError::BindingConsumerError(binding.queue.clone()));
        }
        Ok(c) => c,
    };

    let tag = consumer.tag().to_string();

    tokio::spawn(async move {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => dispatch(&binding, delivery).await,
                Err(err) => {
                    let err = stream_failure(&err);
                    error!(error = err.to_string(), "errors consume msg");
                    let _ = binding.errors.send(err);
                }
            }
        }
    });

    Ok(tag)
}

/// Maps a consume-stream failure into the error funneled out of band.
///
/// Stream failures happen inside the spawned loop with no caller to return
/// to, so they go to the error channel like handler failures do.
fn stream_failure(err: &lapin::Error) -> AmqpError {
    AmqpError::ConsumerError(err.to_string())
}

/// Processes one delivery end to end.
async fn dispatch(binding: &ConsumerBinding, delivery: Delivery) {
    let tracer = global::tracer("amqp consumer");
    let (_otel_ctx, mut span) =
        otel::consumer_span(&delivery.properties, &tracer, &binding.queue);

    debug!(
        queue = binding.queue.as_str(),
        exchange = delivery.exchange.to_string(),
        routing_key = delivery.routing_key.to_string(),
        "received delivery"
    );

    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|s| s.as_str().to_owned());
    let mut payload = Payload::decode(&delivery.data, content_type.as_deref());

    // RPC-target queues carry an envelope with the caller's reply address
    let mut reply_override = None;
    if binding.rpc_target {
        if let Some((reply_to, content)) = RpcEnvelope::unwrap(&payload) {
            reply_override = Some(reply_to);
            payload = content;
        }
    }

    let violation = binding
        .schema
        .validate(&binding.queue, None, &payload.to_validation_value())
        .err();

    let mut ctx = DeliveryContext::new(
        delivery,
        payload,
        binding.consumer_tag.clone(),
        binding.channel.clone(),
        binding.publish_channel.clone(),
        reply_override,
    );

    if let Some(violation) = violation {
        refuse(binding, ctx, violation).await;
        return;
    }

    if let Err(err) = binding.handler.handle(&mut ctx).await {
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("handler failure"),
        });
        isolate_handler_failure(binding, ctx, err).await;
        return;
    }

    span.set_status(Status::Ok);
}

/// Routes a schema violation per the dispatch rule.
///
/// The listener is looked up per delivery, so one registered at any point
/// before the violation arrives receives the context and owns its
/// disposition. Otherwise the refusal is replied back when a reply target
/// exists, and the message is acknowledged unconditionally so it is never
/// redelivered.
async fn refuse(binding: &ConsumerBinding, mut ctx: DeliveryContext, violation: SchemaViolation) {
    let err = AmqpError::ValidationError {
        destination: binding.queue.clone(),
        violation: violation.clone(),
    };
    warn!(error = err.to_string(), "refusing delivery");

    if let Some(tx) = listener_for(&binding.listeners, &binding.queue).await {
        match tx.send(ValidationFailure {
            destination: binding.queue.clone(),
            violation,
            context: ctx,
        }) {
            Ok(_) => return,
            // listener went away; fall back to the auto-reply path
            Err(failed) => ctx = failed.0.context,
        }
    }

    if let Err(reply_err) = ctx.reply(error_envelope(&err), SendOptions::default()).await {
        if !matches!(reply_err, AmqpError::EmptyReplyTarget) {
            error!(error = reply_err.to_string(), "error replying refusal");
        }
    }

    if let Err(ack_err) = ctx.ack(false).await {
        error!(error = ack_err.to_string(), "error whiling ack refused msg");
    }
}

/// Applies the error-isolation contract for a failed handler.
///
/// The delivery is forced to a terminal state if still pending, and the
/// error goes to the error channel since delivery dispatch has no caller.
async fn isolate_handler_failure(binding: &ConsumerBinding, mut ctx: DeliveryContext, err: AmqpError) {
    error!(
        error = err.to_string(),
        queue = binding.queue.as_str(),
        "handler failed"
    );

    if !ctx.disposition().is_terminal() {
        if let Err(reject_err) = ctx.reject(false).await {
            error!(error = reject_err.to_string(), "error whiling reject msg");
        }
    }

    let _ = binding.errors.send(AmqpError::HandlerError(err.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_lookup_sees_registrations_made_after_the_handle_was_shared() {
        let listeners: ValidationListeners = Arc::new(Mutex::new(HashMap::new()));
        let shared = listeners.clone();

        assert!(listener_for(&shared, "orders").await.is_none());

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        listeners.lock().await.insert("orders".to_owned(), tx);

        assert!(listener_for(&shared, "orders").await.is_some());
        assert!(listener_for(&shared, "payments").await.is_none());
    }

    #[test]
    fn stream_failure_maps_to_consumer_error() {
        let err = stream_failure(&lapin::Error::ChannelsLimitReached);
        assert!(matches!(err, AmqpError::ConsumerError(_)));
    }
}

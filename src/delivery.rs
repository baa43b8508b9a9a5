// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Context
//!
//! One context per inbound message, owning the acknowledgment lifecycle.
//! A delivery starts `Pending` and moves to exactly one terminal disposition:
//! acknowledged, negative-acknowledged, or rejected. A second terminal
//! operation always fails; it never silently succeeds. `cancel` and `reply`
//! are independent of the disposition.

use crate::{
    config::SendOptions,
    content::Payload,
    errors::AmqpError,
};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicNackOptions, BasicPublishOptions,
        BasicRejectOptions,
    },
    types::ShortString,
    BasicProperties, Channel,
};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// The lifecycle state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Pending,
    Acknowledged,
    NegativeAcknowledged,
    Rejected,
}

impl Disposition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Disposition::Pending)
    }
}

/// Pure transition guard for the disposition state machine.
///
/// Kept separate from the broker calls so the one-terminal-operation law is
/// enforced (and testable) independently of the wire.
#[derive(Debug)]
pub(crate) struct DispositionGuard {
    state: Disposition,
}

impl DispositionGuard {
    pub(crate) fn new() -> DispositionGuard {
        DispositionGuard {
            state: Disposition::Pending,
        }
    }

    pub(crate) fn state(&self) -> Disposition {
        self.state
    }

    /// Moves to a terminal state, failing if one was already applied.
    pub(crate) fn settle(&mut self, to: Disposition) -> Result<(), AmqpError> {
        if self.state.is_terminal() {
            return Err(AmqpError::AlreadyAcknowledged);
        }

        self.state = to;
        Ok(())
    }
}

/// Context for one inbound message delivery.
///
/// Handed to the registered handler as an explicit argument. Reply traffic
/// goes through the connection-level publish channel, not the consumer's own
/// channel, so replying never interferes with consumption flow control.
pub struct DeliveryContext {
    delivery: Delivery,
    payload: Payload,
    consumer_tag: String,
    channel: Arc<Channel>,
    publish_channel: Arc<Channel>,
    reply_override: Option<String>,
    guard: DispositionGuard,
}

impl DeliveryContext {
    pub(crate) fn new(
        delivery: Delivery,
        payload: Payload,
        consumer_tag: String,
        channel: Arc<Channel>,
        publish_channel: Arc<Channel>,
        reply_override: Option<String>,
    ) -> DeliveryContext {
        DeliveryContext {
            delivery,
            payload,
            consumer_tag,
            channel,
            publish_channel,
            reply_override,
            guard: DispositionGuard::new(),
        }
    }

    /// The decoded message content.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The exchange the message was published through.
    pub fn exchange(&self) -> &str {
        self.delivery.exchange.as_str()
    }

    /// The routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    /// True when the broker redelivered this message.
    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// The correlation identifier carried in the message properties.
    pub fn correlation_id(&self) -> Option<&str> {
        self.delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str())
    }

    /// The transport-level reply destination, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|s| s.as_str())
    }

    /// The current lifecycle state.
    pub fn disposition(&self) -> Disposition {
        self.guard.state()
    }

    /// Signals successful processing to the broker.
    ///
    /// With `all_up_to` set, covers all prior unacknowledged deliveries on
    /// the channel. Fails with `AlreadyAcknowledged` once a terminal
    /// operation was applied.
    pub async fn ack(&mut self, all_up_to: bool) -> Result<(), AmqpError> {
        self.guard.settle(Disposition::Acknowledged)?;

        match self
            .delivery
            .ack(BasicAckOptions {
                multiple: all_up_to,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Signals processing failure; the broker may requeue per the flag.
    pub async fn nack(&mut self, all_up_to: bool, requeue: bool) -> Result<(), AmqpError> {
        self.guard.settle(Disposition::NegativeAcknowledged)?;

        match self
            .delivery
            .nack(BasicNackOptions {
                multiple: all_up_to,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Single-message negative acknowledgment.
    pub async fn reject(&mut self, requeue: bool) -> Result<(), AmqpError> {
        self.guard.settle(Disposition::Rejected)?;

        match self.delivery.reject(BasicRejectOptions { requeue }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling reject msg");
                Err(AmqpError::RejectMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Stops further deliveries to the consumer that produced this context.
    ///
    /// Independent of the disposition, so one-shot consumers can cancel
    /// before or after acking.
    pub async fn cancel(&mut self) -> Result<(), AmqpError> {
        debug!(tag = self.consumer_tag.as_str(), "canceling consumer");

        match self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(self.consumer_tag.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Sends a response to whoever asked for one.
    ///
    /// The destination is the reply override when the context carries one
    /// (queue-style RPC deliveries embed the true reply target in the
    /// payload), otherwise the transport reply-to property. Fails with
    /// `EmptyReplyTarget` when neither is present.
    pub async fn reply(&self, payload: Payload, options: SendOptions) -> Result<(), AmqpError> {
        let target = match self.reply_override.as_deref().or_else(|| self.reply_to()) {
            Some(target) => target.to_owned(),
            None => return Err(AmqpError::EmptyReplyTarget),
        };

        let (data, content_type) = payload.encode()?;

        let correlation_id = options
            .correlation_id
            .or_else(|| self.correlation_id().map(|s| s.to_owned()));

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }

        debug!(reply_to = target.as_str(), "replying to delivery");

        match self
            .publish_channel
            .basic_publish(
                "",
                &target,
                BasicPublishOptions::default(),
                &data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing reply");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_not_terminal() {
        let guard = DispositionGuard::new();
        assert_eq!(guard.state(), Disposition::Pending);
        assert!(!guard.state().is_terminal());
    }

    #[test]
    fn first_terminal_operation_settles() {
        for to in [
            Disposition::Acknowledged,
            Disposition::NegativeAcknowledged,
            Disposition::Rejected,
        ] {
            let mut guard = DispositionGuard::new();
            guard.settle(to).unwrap();
            assert_eq!(guard.state(), to);
            assert!(guard.state().is_terminal());
        }
    }

    #[test]
    fn second_terminal_operation_fails() {
        let mut guard = DispositionGuard::new();
        guard.settle(Disposition::Acknowledged).unwrap();

        for to in [
            Disposition::Acknowledged,
            Disposition::NegativeAcknowledged,
            Disposition::Rejected,
        ] {
            let err = guard.settle(to).unwrap_err();
            assert!(matches!(err, AmqpError::AlreadyAcknowledged));
            // the original disposition is untouched
            assert_eq!(guard.state(), Disposition::Acknowledged);
        }
    }
}

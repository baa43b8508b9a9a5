// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Correlator
//!
//! Turns two independent one-way sends into a single awaitable call. The
//! request goes out stamped with a fresh correlation identifier and a reply
//! address; a single-shot consumer on the reply destination resolves the
//! pending call when the matching reply arrives. Replies for other callers
//! (possible when a shared callback queue is configured) are rejected back
//! with requeue so their own waiter can claim them.
//!
//! Every call owns a dedicated channel. It is closed on every outcome; a
//! reply that was received but never acknowledged by the caller is
//! acknowledged automatically when the reply handle drops.

use crate::{
    channel::new_channel,
    config::CallbackQueueConfig,
    content::Payload,
    errors::AmqpError,
    queue::QueueSpec,
    topology::declare_queue,
};
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicRejectOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::basic::AMQPProperties,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// AMQP reply code used when closing a call's dedicated channel.
const REPLY_SUCCESS: u16 = 200;

/// Per-call options for `rpc` and `rpc_exchange`.
#[derive(Debug, Clone, Default)]
pub struct RpcOptions {
    /// Overrides the configured deadline, in milliseconds
    pub timeout_ms: Option<u64>,
    /// Reply destination to use instead of a fresh per-call queue
    pub callback_queue: Option<String>,
}

/// Payload envelope for exchange-targeted calls.
///
/// Exchange delivery has no reply-to semantics guaranteed end-to-end across
/// bindings, so the reply address travels inside the payload instead of the
/// transport metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcEnvelope {
    pub reply_to: String,
    pub content: Value,
}

impl RpcEnvelope {
    /// Wraps request content and a reply address into an envelope payload.
    pub(crate) fn wrap(reply_to: &str, payload: &Payload) -> Payload {
        let envelope = RpcEnvelope {
            reply_to: reply_to.to_owned(),
            content: payload.to_validation_value(),
        };

        // struct-to-value serialization of plain fields cannot fail
        Payload::Json(serde_json::to_value(envelope).unwrap_or(Value::Null))
    }

    /// Unwraps an envelope payload into its reply address and content.
    ///
    /// Returns `None` when the payload is not an envelope, so ordinary
    /// messages on an RPC-target queue still reach the handler untouched.
    pub(crate) fn unwrap(payload: &Payload) -> Option<(String, Payload)> {
        let value = payload.as_json()?;
        let envelope: RpcEnvelope = serde_json::from_value(value.clone()).ok()?;
        Some((envelope.reply_to, Payload::Json(envelope.content)))
    }
}

/// Builds the `{"err": …}` payload sent back for refused requests.
pub(crate) fn error_envelope(err: &AmqpError) -> Payload {
    Payload::Json(serde_json::json!({ "err": err.to_string() }))
}

/// True when the delivery's correlation identifier matches the pending call.
pub(crate) fn correlation_matches(props: &AMQPProperties, correlation_id: &str) -> bool {
    props
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str() == correlation_id)
        .unwrap_or(false)
}

/// Take-once state behind a reply's single acknowledgment.
///
/// `ack` and the drop safety net both funnel through `claim`; whichever runs
/// first wins and the other becomes a no-op. Kept separate from the broker
/// calls so the idempotency law holds independently of the wire.
#[derive(Debug)]
pub(crate) struct ReplySettlement {
    pending: bool,
}

impl ReplySettlement {
    pub(crate) fn new() -> ReplySettlement {
        ReplySettlement { pending: true }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    /// Claims the acknowledgment; true exactly once.
    pub(crate) fn claim(&mut self) -> bool {
        std::mem::replace(&mut self.pending, false)
    }
}

/// A resolved RPC reply.
///
/// Exposes the decoded data and an idempotent `ack`. The handle owns the
/// call's dedicated channel; acking (or dropping the handle unacked, which
/// acks as a safety net) releases it.
pub struct RpcReply {
    payload: Payload,
    acker: Acker,
    channel: Arc<Channel>,
    settlement: ReplySettlement,
}

impl RpcReply {
    fn new(payload: Payload, acker: Acker, channel: Arc<Channel>) -> RpcReply {
        RpcReply {
            payload,
            acker,
            channel,
            settlement: ReplySettlement::new(),
        }
    }

    /// The decoded reply content.
    pub fn data(&self) -> &Payload {
        &self.payload
    }

    /// Acknowledges the reply and closes the call's channel.
    ///
    /// A no-op after the first call.
    pub async fn ack(&mut self) -> Result<(), AmqpError> {
        if !self.settlement.claim() {
            return Ok(());
        }

        let result = match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack rpc reply");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        };

        let _ = self.channel.close(REPLY_SUCCESS, "rpc call complete").await;

        result
    }
}

impl Drop for RpcReply {
    fn drop(&mut self) {
        // safety net against leaked unacknowledged deliveries
        if !self.settlement.claim() {
            return;
        }

        let acker = self.acker.clone();
        let channel = self.channel.clone();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = acker.ack(BasicAckOptions { multiple: false }).await;
                let _ = channel.close(REPLY_SUCCESS, "rpc call complete").await;
            });
        }
    }
}

/// Queue-targeted call: the reply address travels in the transport metadata.
pub(crate) async fn call_queue(
    conn: &Connection,
    queue: &str,
    payload: Payload,
    configured_callback: Option<&CallbackQueueConfig>,
    options: RpcOptions,
    default_timeout_ms: u64,
) -> Result<RpcReply, AmqpError> {
    let channel = new_channel(conn).await?;

    let reply_queue = match options.callback_queue.as_deref() {
        Some(name) => {
            declare_callback_queue(&channel, name, configured_callback).await?;
            name.to_owned()
        }
        None => match configured_callback {
            Some(callback) => {
                declare_callback_queue(&channel, &callback.name, configured_callback).await?;
                callback.name.clone()
            }
            None => declare_reply_queue(&channel).await?,
        },
    };

    let correlation_id = Uuid::new_v4().to_string();
    let rx = attach_reply_consumer(channel.clone(), &reply_queue, &correlation_id).await?;

    let (data, content_type) = payload.encode()?;
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_correlation_id(ShortString::from(correlation_id.clone()))
        .with_reply_to(ShortString::from(reply_queue.clone()));

    if let Err(err) = channel
        .basic_publish("", queue, BasicPublishOptions::default(), &data, properties)
        .await
    {
        error!(error = err.to_string(), "error publishing rpc request");
        let _ = channel.close(REPLY_SUCCESS, "rpc call failed").await;
        return Err(AmqpError::PublishingError);
    }

    let timeout_ms = options.timeout_ms.unwrap_or(default_timeout_ms);
    await_reply(channel, rx, timeout_ms, None).await
}

/// Exchange-targeted call: the reply address travels inside the payload
/// envelope and the reply queue is deleted on timeout.
pub(crate) async fn call_exchange(
    conn: &Connection,
    exchange: &str,
    routing_key: &str,
    payload: Payload,
    options: RpcOptions,
    default_timeout_ms: u64,
) -> Result<RpcReply, AmqpError> {
    let channel = new_channel(conn).await?;
    let reply_queue = declare_reply_queue(&channel).await?;

    let correlation_id = Uuid::new_v4().to_string();
    let rx = attach_reply_consumer(channel.clone(), &reply_queue, &correlation_id).await?;

    let envelope = RpcEnvelope::wrap(&reply_queue, &payload);
    let (data, content_type) = envelope.encode()?;
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_correlation_id(ShortString::from(correlation_id.clone()));

    if let Err(err) = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            &data,
            properties,
        )
        .await
    {
        error!(error = err.to_string(), "error publishing rpc request");
        let _ = channel.close(REPLY_SUCCESS, "rpc call failed").await;
        return Err(AmqpError::PublishingError);
    }

    let timeout_ms = options.timeout_ms.unwrap_or(default_timeout_ms);
    await_reply(channel, rx, timeout_ms, Some(reply_queue)).await
}

/// Declares the shared callback queue with its configured options.
async fn declare_callback_queue(
    channel: &Channel,
    name: &str,
    configured: Option<&CallbackQueueConfig>,
) -> Result<(), AmqpError> {
    let mut spec = QueueSpec::new(name);

    match configured {
        Some(cfg) if cfg.name == name => {
            if cfg.durable {
                spec = spec.durable();
            }
            if cfg.auto_delete {
                spec = spec.auto_delete();
            }
        }
        _ => spec = spec.auto_delete(),
    }

    declare_queue(channel, &spec).await
}

/// Declares a fresh server-named, auto-deleting, non-durable reply queue.
async fn declare_reply_queue(channel: &Channel) -> Result<String, AmqpError> {
    match channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: false,
                auto_delete: true,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(queue) => Ok(queue.name().as_str().to_owned()),
        Err(err) => {
            error!(error = err.to_string(), "failure to declare reply queue");
            Err(AmqpError::DeclareQueueError("reply queue".to_owned()))
        }
    }
}

/// Attaches the single-shot reply consumer.
///
/// Mismatched correlation identifiers are rejected back with requeue so
/// another waiter sharing the callback queue can claim them. On a match the
/// consumer is canceled before the pending call resolves, so at most one
/// delivery is ever claimed. A reply that loses the race against the timeout
/// is still acknowledged when its handle drops.
async fn attach_reply_consumer(
    channel: Arc<Channel>,
    reply_queue: &str,
    correlation_id: &str,
) -> Result<oneshot::Receiver<RpcReply>, AmqpError> {
    let tag = format!("rpc-{correlation_id}");

    let mut consumer = match channel
        .basic_consume(
            reply_queue,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
    {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "error to create the reply consumer");
            return Err(AmqpError::BindingConsumerError(reply_queue.to_owned()));
        }
    };

    let (tx, rx) = oneshot::channel();
    let correlation_id = correlation_id.to_owned();

    tokio::spawn(async move {
        let mut tx = Some(tx);

        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    if !correlation_matches(&delivery.properties, &correlation_id) {
                        debug!("reply for another caller, requeuing");
                        if let Err(err) =
                            delivery.reject(BasicRejectOptions { requeue: true }).await
                        {
                            error!(error = err.to_string(), "error whiling requeue reply");
                        }
                        continue;
                    }

                    if let Err(err) = channel
                        .basic_cancel(&tag, BasicCancelOptions { nowait: false })
                        .await
                    {
                        error!(error = err.to_string(), "error to cancel the reply consumer");
                    }

                    let content_type = delivery
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|s| s.as_str().to_owned());
                    let payload = Payload::decode(&delivery.data, content_type.as_deref());
                    let reply =
                        RpcReply::new(payload, delivery.acker.clone(), channel.clone());

                    if let Some(tx) = tx.take() {
                        if tx.send(reply).is_err() {
                            // caller timed out; the dropped reply acks itself
                            warn!("reply arrived after the rpc deadline");
                        }
                    }

                    break;
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume reply");
                    break;
                }
            }
        }
    });

    Ok(rx)
}

/// Outcome of racing a pending call against its deadline.
#[derive(Debug, PartialEq)]
enum ReplyRace<T> {
    Resolved(T),
    ListenerGone,
    Deadline,
}

/// Races the pending call against the deadline over the receiver alone.
async fn race_reply<T>(rx: oneshot::Receiver<T>, timeout_ms: u64) -> ReplyRace<T> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
        Ok(Ok(reply)) => ReplyRace::Resolved(reply),
        Ok(Err(_)) => ReplyRace::ListenerGone,
        Err(_) => ReplyRace::Deadline,
    }
}

/// Awaits the pending call and cleans up the losing side.
async fn await_reply(
    channel: Arc<Channel>,
    rx: oneshot::Receiver<RpcReply>,
    timeout_ms: u64,
    delete_on_timeout: Option<String>,
) -> Result<RpcReply, AmqpError> {
    match race_reply(rx, timeout_ms).await {
        ReplyRace::Resolved(reply) => Ok(reply),
        ReplyRace::ListenerGone => {
            // the listener died without resolving: connection went away
            let _ = channel.close(REPLY_SUCCESS, "rpc call aborted").await;
            Err(AmqpError::ConnectionClosedError)
        }
        ReplyRace::Deadline => {
            warn!(timeout_ms, "rpc timed out");

            if let Err(err) = delete_reply_queue(&channel, delete_on_timeout.as_deref()).await {
                error!(error = err.to_string(), "error deleting reply queue");
            }

            let _ = channel.close(REPLY_SUCCESS, "rpc call timed out").await;
            Err(AmqpError::RpcTimeout(timeout_ms))
        }
    }
}

/// Deletes the per-call reply queue after a timeout, when one was requested.
async fn delete_reply_queue(channel: &Channel, reply_queue: Option<&str>) -> Result<(), AmqpError> {
    let Some(reply_queue) = reply_queue else {
        return Ok(());
    };

    match channel
        .queue_delete(reply_queue, QueueDeleteOptions::default())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to delete queue");
            Err(AmqpError::DeleteQueueError(reply_queue.to_owned()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let payload = Payload::Json(json!({"time": 99}));
        let wrapped = RpcEnvelope::wrap("amq.gen-reply", &payload);

        let (reply_to, content) = RpcEnvelope::unwrap(&wrapped).unwrap();
        assert_eq!(reply_to, "amq.gen-reply");
        assert_eq!(content, payload);
    }

    #[test]
    fn envelope_uses_camel_case_keys() {
        let wrapped = RpcEnvelope::wrap("replies", &Payload::Json(json!({"a": 1})));

        let value = wrapped.as_json().unwrap();
        assert_eq!(value["replyTo"], json!("replies"));
        assert_eq!(value["content"], json!({"a": 1}));
    }

    #[test]
    fn non_envelope_payload_is_not_unwrapped() {
        assert!(RpcEnvelope::unwrap(&Payload::Json(json!({"time": 1}))).is_none());
        assert!(RpcEnvelope::unwrap(&Payload::Text("plain".to_owned())).is_none());
        assert!(RpcEnvelope::unwrap(&Payload::Binary(vec![1, 2, 3])).is_none());
    }

    #[test]
    fn correlation_matching() {
        let props =
            BasicProperties::default().with_correlation_id(ShortString::from("call-1"));

        assert!(correlation_matches(&props, "call-1"));
        assert!(!correlation_matches(&props, "call-2"));
        assert!(!correlation_matches(&BasicProperties::default(), "call-1"));
    }

    #[test]
    fn error_envelope_shape() {
        let payload = error_envelope(&AmqpError::EmptyReplyTarget);

        let value = payload.as_json().unwrap();
        assert_eq!(value["err"], json!("no reply target on delivery"));
    }

    #[test]
    fn reply_acknowledgment_is_claimed_exactly_once() {
        let mut settlement = ReplySettlement::new();
        assert!(settlement.is_pending());

        // first claim wins, every later one is a no-op
        assert!(settlement.claim());
        assert!(!settlement.is_pending());
        assert!(!settlement.claim());
        assert!(!settlement.claim());
    }

    #[test]
    fn unclaimed_settlement_stays_pending_for_the_drop_path() {
        let settlement = ReplySettlement::new();
        assert!(settlement.is_pending());
    }

    #[tokio::test]
    async fn reply_before_deadline_resolves() {
        let (tx, rx) = oneshot::channel();
        tx.send(7u8).unwrap();

        assert_eq!(race_reply(rx, 1_000).await, ReplyRace::Resolved(7));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_without_a_reply() {
        let (_tx, rx) = oneshot::channel::<u8>();

        assert_eq!(race_reply(rx, 25).await, ReplyRace::Deadline);
    }

    #[tokio::test]
    async fn dropped_listener_resolves_as_gone() {
        let (tx, rx) = oneshot::channel::<u8>();
        drop(tx);

        assert_eq!(race_reply(rx, 1_000).await, ReplyRace::ListenerGone);
    }
}

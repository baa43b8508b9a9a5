// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy for the crate. The `AmqpError` enum
//! covers connection and channel failures, topology declaration, publishing,
//! consuming, schema validation, acknowledgment discipline, and the RPC
//! request/reply lifecycle.

use crate::schema::SchemaViolation;
use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// Validation and timeout errors are always returned to the immediate caller.
/// Handler errors are never returned to a caller (delivery is push-based) and
/// are instead funneled to the error channel handed out at construction.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Malformed configuration detected before any network activity
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// The connection dropped or was reset while an operation was in flight
    #[error("connection closed")]
    ConnectionClosedError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error canceling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The value handed to the codec cannot be encoded
    #[error("unsupported content type")]
    UnsupportedContentType,

    /// A second terminal operation was attempted on the same delivery
    #[error("delivery already acknowledged")]
    AlreadyAcknowledged,

    /// `reply` was called with no transport reply-to and no embedded override
    #[error("no reply target on delivery")]
    EmptyReplyTarget,

    /// No matching reply arrived within the configured deadline
    #[error("rpc timed out after {0}ms")]
    RpcTimeout(u64),

    /// A payload failed the schema declared for a destination
    #[error("validation failed for `{destination}`: {violation}")]
    ValidationError {
        destination: String,
        violation: SchemaViolation,
    },

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// A consumer handler failed while processing a delivery
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// The consume stream itself reported a failure
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Facade
//!
//! The public surface of the crate: connect, declare the topology, register
//! consumers, publish with schema validation, and make RPC calls. All
//! operations await the readiness gate, so calls issued before `connect`
//! queue safely.
//!
//! Construction is synchronous and performs no I/O; configuration errors
//! surface immediately and the error channel is handed out before anything
//! can fail, so no pre-attachment error is ever lost.

use crate::{
    channel::{new_amqp_channel, new_channel},
    config::{Config, SendOptions},
    consumer::{self, ConsumerBinding, DeliveryHandler, ValidationFailure, ValidationListeners},
    content::Payload,
    errors::AmqpError,
    otel,
    queue::QueueSpec,
    readiness::ReadyGate,
    rpc::{self, RpcOptions, RpcReply},
    schema::TopologySchema,
    topology::{declare_queue, is_reserved_name, TopologyBinder},
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Mutex, RwLock,
};
use tracing::{debug, error};
use uuid::Uuid;

/// AMQP reply code used for orderly close.
const REPLY_SUCCESS: u16 = 200;

/// Receivers for out-of-band events.
///
/// Handler and connection-level failures are funneled here; they have no
/// caller to return to. Handed out at construction so nothing can fire
/// before the application holds the receiver.
pub struct Events {
    pub errors: UnboundedReceiver<AmqpError>,
}

/// AMQP client with schema-validated publish/consume and RPC correlation.
pub struct Courier {
    config: Config,
    schema: Arc<dyn TopologySchema>,
    gate: Arc<ReadyGate>,
    conn: RwLock<Option<Arc<Connection>>>,
    publish_channel: RwLock<Option<Arc<Channel>>>,
    errors: UnboundedSender<AmqpError>,
    validation_listeners: ValidationListeners,
}

impl Courier {
    /// Creates a client and its event receivers.
    ///
    /// Validates the configuration synchronously, before any network
    /// activity. No connection is made until `connect`.
    pub fn new(
        config: Config,
        schema: Arc<dyn TopologySchema>,
    ) -> Result<(Courier, Events), AmqpError> {
        if config.uri.is_empty() {
            return Err(AmqpError::ConfigurationError("empty broker uri".to_owned()));
        }

        if config.rpc_timeout_ms == 0 {
            return Err(AmqpError::ConfigurationError(
                "rpc timeout must be positive".to_owned(),
            ));
        }

        if let Some(callback) = &config.callback_queue {
            if callback.name.is_empty() {
                return Err(AmqpError::ConfigurationError(
                    "empty callback queue name".to_owned(),
                ));
            }
        }

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let client = Courier {
            config,
            schema,
            gate: Arc::new(ReadyGate::new()),
            conn: RwLock::new(None),
            publish_channel: RwLock::new(None),
            errors: errors_tx,
            validation_listeners: Arc::new(Mutex::new(HashMap::new())),
        };

        Ok((client, Events { errors: errors_rx }))
    }

    /// True when the current connection epoch is established.
    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    /// Waits for the current connection epoch to become ready.
    pub async fn wait_ready(&self) {
        self.gate.wait_ready().await
    }

    /// Connects to the broker, installs the declared topology, and opens the
    /// gate.
    ///
    /// Reconnection is caller-driven: after a drop, call `connect` again to
    /// start a new epoch.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.config).await?;

        let errors = self.errors.clone();
        let gate = self.gate.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            gate.reset();
            let _ = errors.send(AmqpError::ConnectionClosedError);
        });

        TopologyBinder::new(channel.clone())
            .install(self.schema.as_ref())
            .await?;

        *self.conn.write().await = Some(conn);
        *self.publish_channel.write().await = Some(channel);
        self.gate.set_ready();

        debug!("amqp client ready");
        Ok(())
    }

    /// Registers a per-destination listener for schema violations.
    ///
    /// When present, refused deliveries are routed to the listener instead of
    /// the handler; the listener owns their terminal disposition. Consumers
    /// consult the listener per delivery, so registration may happen before
    /// or after the consumer is attached.
    pub async fn on_validation_error(&self, queue: &str) -> UnboundedReceiver<ValidationFailure> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.validation_listeners
            .lock()
            .await
            .insert(queue.to_owned(), tx);
        rx
    }

    /// Attaches a handler to a queue on a dedicated channel.
    ///
    /// Declares the destination unless it carries a broker-reserved name or
    /// is already part of the declared topology; `options` controls the
    /// declare flags for auto-declared destinations. With `rpc_target` set,
    /// payload envelopes are unwrapped so `reply` reaches the true caller.
    ///
    /// Returns the server-assigned consumer tag and the channel, so the
    /// caller may later cancel or reuse it.
    pub async fn queue(
        &self,
        name: &str,
        handler: Arc<dyn DeliveryHandler>,
        rpc_target: bool,
        options: Option<QueueSpec>,
    ) -> Result<(String, Arc<Channel>), AmqpError> {
        self.gate.wait_ready().await;
        let conn = self.connection().await?;
        let publish_channel = self.current_publish_channel().await?;

        // channel-per-consumer: one consumer's flow control cannot stall another
        let channel = new_channel(&conn).await?;

        if !is_reserved_name(name) && self.schema.queue(name).is_none() {
            let spec = options.unwrap_or_else(|| QueueSpec::new(name));
            declare_queue(&channel, &spec).await?;
        }

        let binding = ConsumerBinding {
            queue: name.to_owned(),
            rpc_target,
            handler,
            schema: self.schema.clone(),
            channel: channel.clone(),
            publish_channel,
            consumer_tag: format!("{}-{}", name, Uuid::new_v4()),
            errors: self.errors.clone(),
            listeners: self.validation_listeners.clone(),
        };

        let tag = consumer::start(binding).await?;
        Ok((tag, channel))
    }

    /// Sends a message directly to a queue, validated against its schema.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: Payload,
        options: SendOptions,
    ) -> Result<(), AmqpError> {
        self.basic_send("", queue, queue, payload, options).await
    }

    /// Publishes a message through an exchange, validated against its schema.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Payload,
        options: SendOptions,
    ) -> Result<(), AmqpError> {
        self.basic_send(exchange, routing_key, exchange, payload, options)
            .await
    }

    /// Queue-targeted RPC call.
    ///
    /// The reply destination is the caller-supplied callback queue name, the
    /// configured shared callback queue, or a fresh auto-delete queue per
    /// call. Resolves with the correlated reply or fails with `RpcTimeout`.
    pub async fn rpc(
        &self,
        queue: &str,
        payload: Payload,
        callback_queue: Option<&str>,
    ) -> Result<RpcReply, AmqpError> {
        self.gate.wait_ready().await;
        let conn = self.connection().await?;

        rpc::call_queue(
            &conn,
            queue,
            payload,
            self.config.callback_queue.as_ref(),
            RpcOptions {
                timeout_ms: None,
                callback_queue: callback_queue.map(|s| s.to_owned()),
            },
            self.config.rpc_timeout_ms,
        )
        .await
    }

    /// Exchange-targeted RPC call.
    ///
    /// The reply address travels inside the payload envelope; the reply
    /// queue is always auto-deleting and is deleted on timeout.
    pub async fn rpc_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Payload,
        options: RpcOptions,
    ) -> Result<RpcReply, AmqpError> {
        self.gate.wait_ready().await;
        let conn = self.connection().await?;

        rpc::call_exchange(
            &conn,
            exchange,
            routing_key,
            payload,
            options,
            self.config.rpc_timeout_ms,
        )
        .await
    }

    /// Creates a fresh channel on the client's connection.
    pub async fn create_channel(&self) -> Result<Arc<Channel>, AmqpError> {
        self.gate.wait_ready().await;
        let conn = self.connection().await?;
        new_channel(&conn).await
    }

    /// Closes the connection and re-arms the gate for the next epoch.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.gate.reset();
        *self.publish_channel.write().await = None;

        let conn = self.conn.write().await.take();
        if let Some(conn) = conn {
            if let Err(err) = conn.close(REPLY_SUCCESS, "client closed").await {
                error!(error = err.to_string(), "error closing connection");
                return Err(AmqpError::ConnectionError);
            }
        }

        Ok(())
    }

    async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or(AmqpError::ConnectionClosedError)
    }

    async fn current_publish_channel(&self) -> Result<Arc<Channel>, AmqpError> {
        self.publish_channel
            .read()
            .await
            .clone()
            .ok_or(AmqpError::ConnectionClosedError)
    }

    async fn basic_send(
        &self,
        exchange: &str,
        routing_key: &str,
        destination: &str,
        payload: Payload,
        options: SendOptions,
    ) -> Result<(), AmqpError> {
        self.gate.wait_ready().await;

        if !options.skip_validate {
            let routing_key = if exchange.is_empty() {
                None
            } else {
                Some(routing_key)
            };
            if let Err(violation) =
                self.schema
                    .validate(destination, routing_key, &payload.to_validation_value())
            {
                return Err(AmqpError::ValidationError {
                    destination: destination.to_owned(),
                    violation,
                });
            }
        }

        let channel = self.current_publish_channel().await?;

        let (data, content_type) = payload.encode()?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(&Context::current(), &mut headers);

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(message_type) = options.message_type {
            properties = properties.with_type(ShortString::from(message_type));
        }
        if let Some(correlation_id) = options.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(reply_to) = options.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }

        match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallbackQueueConfig;
    use crate::schema::StaticTopology;

    fn topology() -> Arc<dyn TopologySchema> {
        Arc::new(StaticTopology::new())
    }

    #[test]
    fn construction_is_synchronous_and_validates_config() {
        let (client, _events) =
            Courier::new(Config::new("amqp://localhost:5672"), topology()).unwrap();
        assert!(!client.is_ready());
    }

    #[test]
    fn empty_uri_is_refused() {
        let err = Courier::new(Config::new(""), topology())
            .err()
            .expect("empty uri must be refused");
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn zero_timeout_is_refused() {
        let cfg = Config::new("amqp://localhost").rpc_timeout_ms(0);
        let err = Courier::new(cfg, topology())
            .err()
            .expect("zero timeout must be refused");
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn empty_callback_queue_name_is_refused() {
        let cfg = Config::new("amqp://localhost").callback_queue(CallbackQueueConfig::new(""));
        let err = Courier::new(cfg, topology())
            .err()
            .expect("empty callback queue name must be refused");
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn send_refuses_invalid_payload_before_any_network_effect() {
        use crate::queue::QueueSpec;
        use crate::schema::MessageSchema;
        use serde_json::json;

        let topology = Arc::new(
            crate::schema::StaticTopology::new()
                .with_queue(QueueSpec::new("events").schema(MessageSchema::object().require("time"))),
        );
        let (client, _events) =
            Courier::new(Config::new("amqp://localhost:5672"), topology).unwrap();
        client.gate.set_ready();

        let err = client
            .send_to_queue("events", Payload::Json(json!({})), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ValidationError { .. }));

        // skip_validate bypasses the schema; the send then fails only because
        // no connection exists
        let err = client
            .send_to_queue("events", Payload::Json(json!({})), SendOptions::skip_validate())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionClosedError));
    }

    #[tokio::test]
    async fn validation_listener_registration() {
        let (client, _events) =
            Courier::new(Config::new("amqp://localhost:5672"), topology()).unwrap();

        let _rx = client.on_validation_error("orders").await;
        assert!(client
            .validation_listeners
            .lock()
            .await
            .contains_key("orders"));
    }

    #[tokio::test]
    async fn listener_registered_after_consumer_start_is_consulted() {
        let (client, _events) =
            Courier::new(Config::new("amqp://localhost:5672"), topology()).unwrap();

        // the handle a consumer binding captures when it is registered
        let listeners = client.validation_listeners.clone();
        assert!(consumer::listener_for(&listeners, "orders").await.is_none());

        // registration happens only afterwards, yet the running consumer's
        // per-delivery lookup must still find the listener
        let _rx = client.on_validation_error("orders").await;
        assert!(consumer::listener_for(&listeners, "orders").await.is_some());
    }
}

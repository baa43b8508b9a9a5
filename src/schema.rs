// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Schema Surface
//!
//! This module defines the capability interface the crate consumes from a
//! schema engine: enumerate the declared topology, look destinations up by
//! name, and validate a payload against a destination's message schema.
//!
//! `StaticTopology` is the reference implementation, holding specs built with
//! the builder types from `queue` and `exchange` and a required-property
//! message schema. Any external schema engine can stand in by implementing
//! `TopologySchema`.

use crate::exchange::{BindingSpec, ExchangeSpec};
use crate::queue::QueueSpec;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use thiserror::Error;

/// Structured detail of a schema violation.
///
/// Carries the JSON path of the offending field and the reason the payload
/// was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{path}` {reason}")]
pub struct SchemaViolation {
    pub path: String,
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(path: &str, reason: &str) -> SchemaViolation {
        SchemaViolation {
            path: path.to_owned(),
            reason: reason.to_owned(),
        }
    }
}

/// A message schema for a destination.
///
/// Validates that a payload is a JSON object carrying every required
/// property. Kept deliberately small; richer engines plug in through
/// `TopologySchema`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSchema {
    pub(crate) required: Vec<String>,
}

impl MessageSchema {
    /// Creates a schema accepting any JSON object.
    pub fn object() -> MessageSchema {
        MessageSchema::default()
    }

    /// Marks a property as required.
    pub fn require(mut self, property: &str) -> Self {
        self.required.push(property.to_owned());
        self
    }

    /// Validates a payload against the schema.
    pub fn validate(&self, payload: &Value) -> Result<(), SchemaViolation> {
        let Some(object) = payload.as_object() else {
            return Err(SchemaViolation::new("$", "is not an object"));
        };

        for property in &self.required {
            if !object.contains_key(property) {
                return Err(SchemaViolation::new(
                    &format!("$.{property}"),
                    "is required",
                ));
            }
        }

        Ok(())
    }
}

/// Capability interface over a declared topology.
///
/// The crate queries it to decide whether to auto-declare a destination and
/// whether to validate payloads flowing through it.
#[cfg_attr(test, automock)]
pub trait TopologySchema: Send + Sync {
    /// All declared exchanges.
    fn exchanges(&self) -> Vec<ExchangeSpec>;

    /// All declared queues.
    fn queues(&self) -> Vec<QueueSpec>;

    /// All declared bindings with the given exchange as source.
    fn bindings(&self, exchange: &str) -> Vec<BindingSpec>;

    /// Looks up a queue by name.
    fn queue(&self, name: &str) -> Option<QueueSpec>;

    /// Looks up an exchange by name.
    fn exchange(&self, name: &str) -> Option<ExchangeSpec>;

    /// Validates a payload against the schema declared for a destination.
    ///
    /// Destinations without a schema accept everything. The routing key lets
    /// engines with per-route schemas narrow the lookup; `StaticTopology`
    /// ignores it.
    fn validate<'a>(
        &self,
        destination: &str,
        routing_key: Option<&'a str>,
        payload: &Value,
    ) -> Result<(), SchemaViolation>;
}

/// Reference `TopologySchema` built from static specs.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    queues: Vec<QueueSpec>,
    exchanges: Vec<ExchangeSpec>,
    bindings: Vec<BindingSpec>,
}

impl StaticTopology {
    pub fn new() -> StaticTopology {
        StaticTopology::default()
    }

    /// Adds a queue declaration.
    pub fn with_queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    /// Adds an exchange declaration.
    pub fn with_exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    /// Adds a binding.
    pub fn with_binding(mut self, spec: BindingSpec) -> Self {
        self.bindings.push(spec);
        self
    }
}

impl TopologySchema for StaticTopology {
    fn exchanges(&self) -> Vec<ExchangeSpec> {
        self.exchanges.clone()
    }

    fn queues(&self) -> Vec<QueueSpec> {
        self.queues.clone()
    }

    fn bindings(&self, exchange: &str) -> Vec<BindingSpec> {
        self.bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .cloned()
            .collect()
    }

    fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.queues.iter().find(|q| q.name == name).cloned()
    }

    fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.exchanges.iter().find(|e| e.name == name).cloned()
    }

    fn validate<'a>(
        &self,
        destination: &str,
        _routing_key: Option<&'a str>,
        payload: &Value,
    ) -> Result<(), SchemaViolation> {
        let schema = self
            .queue(destination)
            .and_then(|q| q.schema)
            .or_else(|| self.exchange(destination).and_then(|e| e.schema));

        match schema {
            Some(schema) => schema.validate(payload),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_schema_accepts_complete_object() {
        let schema = MessageSchema::object().require("time").require("source");

        assert!(schema
            .validate(&json!({"time": 1, "source": "a", "extra": true}))
            .is_ok());
    }

    #[test]
    fn message_schema_refuses_missing_property() {
        let schema = MessageSchema::object().require("time");

        let violation = schema.validate(&json!({"other": 1})).unwrap_err();
        assert_eq!(violation.path, "$.time");
    }

    #[test]
    fn message_schema_refuses_non_object() {
        let schema = MessageSchema::object().require("time");

        let violation = schema.validate(&json!("just a string")).unwrap_err();
        assert_eq!(violation.path, "$");
    }

    #[test]
    fn static_topology_validates_by_destination() {
        let topology = StaticTopology::new()
            .with_queue(QueueSpec::new("events").schema(MessageSchema::object().require("time")))
            .with_queue(QueueSpec::new("raw"));

        assert!(topology
            .validate("events", None, &json!({"time": 1}))
            .is_ok());
        assert!(topology.validate("events", None, &json!({})).is_err());
        // queues without a schema accept everything
        assert!(topology.validate("raw", None, &json!("anything")).is_ok());
        // unknown destinations accept everything
        assert!(topology.validate("ghost", None, &json!(42)).is_ok());
    }

    #[test]
    fn external_engines_plug_in_through_the_trait() {
        let mut mock = MockTopologySchema::new();
        mock.expect_queue().returning(|_| None);
        mock.expect_validate()
            .returning(|_, _, _| Err(SchemaViolation::new("$.id", "is required")));

        let engine: &dyn TopologySchema = &mock;
        assert!(engine.queue("orders").is_none());

        let violation = engine.validate("orders", None, &json!({})).unwrap_err();
        assert_eq!(violation.path, "$.id");
    }

    #[test]
    fn static_topology_lookup_and_bindings() {
        let topology = StaticTopology::new()
            .with_exchange(crate::exchange::ExchangeSpec::new("events").topic())
            .with_queue(QueueSpec::new("audit"))
            .with_binding(
                BindingSpec::new("audit")
                    .exchange("events")
                    .routing_key("audit.*"),
            );

        assert!(topology.exchange("events").is_some());
        assert!(topology.queue("audit").is_some());
        assert!(topology.queue("nope").is_none());
        assert_eq!(topology.bindings("events").len(), 1);
        assert!(topology.bindings("other").is_empty());
    }
}

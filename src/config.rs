//! Host and client configuration.
//!
//! Both configurations deserialize with `serde` (every field has a default)
//! and can be overlaid with `COURIER_*` environment variables. Durations are
//! plain millisecond counts so they read naturally in YAML, JSON or env.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    dispatcher::DispatchSettings,
    properties::{
        ExchangeKind, Expiration, MapperDefaults, MessagingProperties, PropertyLayers,
        ValidationError,
    },
};

const DEFAULT_PREFETCH: u16 = 16;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PUBLISH_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_RECONNECT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_RECONNECT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 30_000;

/// Settings of a hosted pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Queue the host consumes requests from.
    pub queue: String,
    /// Broker prefetch, which is also the worker count.
    pub prefetch: u16,
    pub drain_timeout_ms: u64,
    /// Consecutive reply publish failures before health turns degraded.
    pub publish_failure_threshold: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// Client-level property layer applied to every reply.
    pub client: MessagingProperties,
    pub mapper: MapperDefaults,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            prefetch: DEFAULT_PREFETCH,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            publish_failure_threshold: DEFAULT_PUBLISH_FAILURE_THRESHOLD,
            reconnect_initial_backoff_ms: DEFAULT_RECONNECT_INITIAL_BACKOFF_MS,
            reconnect_max_backoff_ms: DEFAULT_RECONNECT_MAX_BACKOFF_MS,
            client: MessagingProperties::default(),
            mapper: MapperDefaults::default(),
        }
    }
}

impl HostConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = millis(timeout);
        self
    }

    pub fn with_publish_failure_threshold(mut self, threshold: u32) -> Self {
        self.publish_failure_threshold = threshold;
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_backoff_ms = millis(initial);
        self.reconnect_max_backoff_ms = millis(max);
        self
    }

    pub fn with_client_properties(mut self, client: MessagingProperties) -> Self {
        self.client = client;
        self
    }

    pub fn with_mapper(mut self, mapper: MapperDefaults) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }

    /// Reject configurations the host cannot run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue.is_empty() {
            return Err(ValidationError::invalid_setting("queue", "must not be empty"));
        }
        if self.prefetch == 0 {
            return Err(ValidationError::invalid_setting(
                "prefetch",
                "must be at least 1",
            ));
        }
        if self.publish_failure_threshold == 0 {
            return Err(ValidationError::invalid_setting(
                "publish_failure_threshold",
                "must be at least 1",
            ));
        }
        if self.reconnect_initial_backoff_ms == 0 {
            return Err(ValidationError::invalid_setting(
                "reconnect_initial_backoff_ms",
                "must be positive",
            ));
        }
        if self.reconnect_max_backoff_ms < self.reconnect_initial_backoff_ms {
            return Err(ValidationError::invalid_setting(
                "reconnect_max_backoff_ms",
                "must not be below reconnect_initial_backoff_ms",
            ));
        }
        self.property_layers().validate()
    }

    pub fn property_layers(&self) -> PropertyLayers {
        PropertyLayers::new(self.client.clone(), self.mapper.clone())
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            queue: self.queue.clone(),
            prefetch: self.prefetch,
            drain_timeout: self.drain_timeout(),
            publish_failure_threshold: self.publish_failure_threshold,
        }
    }

    /// Overlay `COURIER_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlay variables from `lookup` on the defaults.
    ///
    /// Recognised names:
    /// - `COURIER_QUEUE`, `COURIER_PREFETCH`, `COURIER_DRAIN_TIMEOUT_MS`
    /// - `COURIER_PUBLISH_FAILURE_THRESHOLD`
    /// - `COURIER_RECONNECT_INITIAL_BACKOFF_MS`, `COURIER_RECONNECT_MAX_BACKOFF_MS`
    /// - the property variables listed on [`ClientConfig::from_lookup`]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ValidationError> {
        let mut config = Self::default();
        if let Some(queue) = lookup("COURIER_QUEUE") {
            config.queue = queue;
        }
        if let Some(value) = parse(&lookup, "COURIER_PREFETCH")? {
            config.prefetch = value;
        }
        if let Some(value) = parse(&lookup, "COURIER_DRAIN_TIMEOUT_MS")? {
            config.drain_timeout_ms = value;
        }
        if let Some(value) = parse(&lookup, "COURIER_PUBLISH_FAILURE_THRESHOLD")? {
            config.publish_failure_threshold = value;
        }
        if let Some(value) = parse(&lookup, "COURIER_RECONNECT_INITIAL_BACKOFF_MS")? {
            config.reconnect_initial_backoff_ms = value;
        }
        if let Some(value) = parse(&lookup, "COURIER_RECONNECT_MAX_BACKOFF_MS")? {
            config.reconnect_max_backoff_ms = value;
        }
        config.client = properties_from_lookup(&lookup)?;
        Ok(config)
    }
}

/// Settings of an [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Queue replies are consumed from; must be private to this client.
    pub reply_queue: String,
    /// Default response-wait timeout. `None` waits forever.
    pub timeout_ms: Option<u64>,
    /// Client-level property layer applied to every request.
    pub defaults: MessagingProperties,
    pub mapper: MapperDefaults,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_queue: String::new(),
            timeout_ms: Some(DEFAULT_CLIENT_TIMEOUT_MS),
            defaults: MessagingProperties::default(),
            mapper: MapperDefaults::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(reply_queue: impl Into<String>) -> Self {
        Self {
            reply_queue: reply_queue.into(),
            ..Default::default()
        }
    }

    /// Set the default response-wait timeout; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(millis);
        self
    }

    pub fn with_defaults(mut self, defaults: MessagingProperties) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_mapper(mut self, mapper: MapperDefaults) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.reply_queue.is_empty() {
            return Err(ValidationError::invalid_setting(
                "reply_queue",
                "must not be empty",
            ));
        }
        self.property_layers().validate()
    }

    pub fn property_layers(&self) -> PropertyLayers {
        PropertyLayers::new(self.defaults.clone(), self.mapper.clone())
    }

    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlay variables from `lookup` on the defaults.
    ///
    /// `COURIER_REPLY_QUEUE` and `COURIER_TIMEOUT_MS` (`0` or `infinite` to
    /// wait forever) configure the client itself. The client-level property
    /// layer reads `COURIER_PERSISTENT`, `COURIER_EXPIRATION_MS` (or
    /// `infinite`), `COURIER_EXCHANGE_KIND` and `COURIER_ROUTING_KEY`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ValidationError> {
        let mut config = Self::default();
        if let Some(queue) = lookup("COURIER_REPLY_QUEUE") {
            config.reply_queue = queue;
        }
        if let Some(value) = lookup("COURIER_TIMEOUT_MS") {
            config.timeout_ms = match value.trim() {
                "0" | "infinite" => None,
                other => Some(parse_value("COURIER_TIMEOUT_MS", other)?),
            };
        }
        config.defaults = properties_from_lookup(&lookup)?;
        Ok(config)
    }
}

fn properties_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<MessagingProperties, ValidationError> {
    let mut properties = MessagingProperties::default();
    if let Some(value) = lookup("COURIER_PERSISTENT") {
        properties.persistent = Some(parse_flag("COURIER_PERSISTENT", &value)?);
    }
    if let Some(value) = lookup("COURIER_EXPIRATION_MS") {
        properties.expiration = Some(match value.trim() {
            "infinite" => Expiration::Infinite,
            other => Expiration::After(Duration::from_millis(parse_value(
                "COURIER_EXPIRATION_MS",
                other,
            )?)),
        });
    }
    if let Some(value) = lookup("COURIER_EXCHANGE_KIND") {
        properties.exchange_kind = Some(value.trim().parse::<ExchangeKind>()?);
    }
    if let Some(value) = lookup("COURIER_ROUTING_KEY") {
        properties.routing_key = Some(value);
    }
    Ok(properties)
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ValidationError> {
    lookup(name)
        .map(|value| parse_value(name, value.trim()))
        .transpose()
}

fn parse_value<T: std::str::FromStr>(
    name: &'static str,
    value: &str,
) -> Result<T, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::invalid_setting(name, format!("cannot parse `{value}`")))
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ValidationError> {
    match value.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ValidationError::invalid_setting(
            name,
            format!("expected a boolean, found `{other}`"),
        )),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

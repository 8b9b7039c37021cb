//! Layered messaging-property resolution.
//!
//! Every outgoing message is shaped by three layers of configuration, from
//! most to least specific:
//!
//! - **request**: overrides attached to one message ([`MessagingProperties`])
//! - **client**: per-host or per-client defaults ([`MessagingProperties`])
//! - **mapper**: global policy, always total ([`MapperDefaults`])
//!
//! [`PropertyLayers::resolve`] collapses them into a [`ResolvedProperties`]
//! that never contains an unset field. Exchange-kind support is validated at
//! resolve time so misconfiguration surfaces before anything is published.

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

/// Custom message headers, as carried on the broker delivery.
pub type Headers = BTreeMap<String, FieldValue>;

/// Scalar or byte value of a custom message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Routing strategy of the exchange a message is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Headers,
    Fanout,
}

impl ExchangeKind {
    /// Every exchange kind known to the crate.
    pub const ALL: [ExchangeKind; 4] = [
        ExchangeKind::Direct,
        ExchangeKind::Topic,
        ExchangeKind::Headers,
        ExchangeKind::Fanout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExchangeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::unknown_exchange_kind(s))
    }
}

/// Broker-side lifetime of a message.
///
/// `Infinite` is not the same as leaving the field unset: an unset expiration
/// defers to the next layer, while `Infinite` resolves to "no TTL emitted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ExpirationRepr", into = "ExpirationRepr")]
pub enum Expiration {
    Infinite,
    After(Duration),
}

impl Expiration {
    /// TTL to put on the envelope, if any.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Expiration::Infinite => None,
            Expiration::After(ttl) => Some(*ttl),
        }
    }
}

/// Config representation: either milliseconds or the keyword `"infinite"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ExpirationRepr {
    Millis(u64),
    Keyword(String),
}

impl TryFrom<ExpirationRepr> for Expiration {
    type Error = String;

    fn try_from(value: ExpirationRepr) -> Result<Self, Self::Error> {
        match value {
            ExpirationRepr::Millis(ms) => Ok(Expiration::After(Duration::from_millis(ms))),
            ExpirationRepr::Keyword(word) if word.eq_ignore_ascii_case("infinite") => {
                Ok(Expiration::Infinite)
            }
            ExpirationRepr::Keyword(word) => Err(format!(
                "invalid expiration `{word}`, expected milliseconds or \"infinite\""
            )),
        }
    }
}

impl From<Expiration> for ExpirationRepr {
    fn from(value: Expiration) -> Self {
        match value {
            Expiration::Infinite => ExpirationRepr::Keyword("infinite".to_owned()),
            Expiration::After(ttl) => {
                ExpirationRepr::Millis(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
            }
        }
    }
}

/// Optional property overrides, used for both the request and client layers.
///
/// `None` in any field defers to the next, less specific layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingProperties {
    pub persistent: Option<bool>,
    pub expiration: Option<Expiration>,
    pub exchange_kind: Option<ExchangeKind>,
    pub routing_key: Option<String>,
    pub headers: Option<Headers>,
}

impl MessagingProperties {
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Add one header, creating the header set if it was unset.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(name.into(), value.into());
        self
    }
}

/// Exchange name used for each [`ExchangeKind`].
///
/// Defaults are RabbitMQ's pre-declared exchanges; the direct kind maps to
/// the default exchange, which routes by queue name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeNames {
    pub direct: String,
    pub topic: String,
    pub headers: String,
    pub fanout: String,
}

impl ExchangeNames {
    pub fn name(&self, kind: ExchangeKind) -> &str {
        match kind {
            ExchangeKind::Direct => &self.direct,
            ExchangeKind::Topic => &self.topic,
            ExchangeKind::Headers => &self.headers,
            ExchangeKind::Fanout => &self.fanout,
        }
    }
}

impl Default for ExchangeNames {
    fn default() -> Self {
        Self {
            direct: String::new(),
            topic: "amq.topic".to_owned(),
            headers: "amq.headers".to_owned(),
            fanout: "amq.fanout".to_owned(),
        }
    }
}

/// Mapper-level policy: the last resolution layer, so every field is concrete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperDefaults {
    pub persistent: bool,
    pub expiration: Expiration,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    pub headers: Headers,
    pub supported_exchange_kinds: Vec<ExchangeKind>,
    pub exchanges: ExchangeNames,
}

impl Default for MapperDefaults {
    fn default() -> Self {
        Self {
            persistent: true,
            expiration: Expiration::Infinite,
            exchange_kind: ExchangeKind::Direct,
            routing_key: String::new(),
            headers: Headers::new(),
            supported_exchange_kinds: ExchangeKind::ALL.to_vec(),
            exchanges: ExchangeNames::default(),
        }
    }
}

impl MapperDefaults {
    pub fn supports(&self, kind: ExchangeKind) -> bool {
        self.supported_exchange_kinds.contains(&kind)
    }

    /// Check that the mapper layer can terminate every resolution.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.supported_exchange_kinds.is_empty() {
            return Err(ValidationError::new(ValidationErrorKind::EmptySupportedSet));
        }
        if !self.supports(self.exchange_kind) {
            return Err(ValidationError::unsupported_exchange_kind(self.exchange_kind));
        }
        for kind in &self.supported_exchange_kinds {
            // The direct kind may target the default exchange, whose name is empty.
            if *kind != ExchangeKind::Direct && self.exchanges.name(*kind).is_empty() {
                return Err(ValidationError::new(
                    ValidationErrorKind::MissingExchangeName(*kind),
                ));
            }
        }
        Ok(())
    }
}

/// Fully resolved properties for one outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProperties {
    pub persistent: bool,
    /// `None` means the message never expires.
    pub ttl: Option<Duration>,
    pub exchange_kind: ExchangeKind,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
}

/// Client and mapper layers, ready to resolve request-level overrides.
#[derive(Debug, Clone, Default)]
pub struct PropertyLayers {
    pub client: MessagingProperties,
    pub mapper: MapperDefaults,
}

impl PropertyLayers {
    pub fn new(client: MessagingProperties, mapper: MapperDefaults) -> Self {
        Self { client, mapper }
    }

    /// Validate the static layers. Run once at startup.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.mapper.validate()?;
        if let Some(kind) = self.client.exchange_kind {
            if !self.mapper.supports(kind) {
                return Err(ValidationError::unsupported_exchange_kind(kind));
            }
        }
        Ok(())
    }

    /// Resolve every field, request first, then client, then mapper.
    pub fn resolve(
        &self,
        request: &MessagingProperties,
    ) -> Result<ResolvedProperties, ValidationError> {
        let exchange_kind = resolve_field(
            request.exchange_kind,
            self.client.exchange_kind,
            self.mapper.exchange_kind,
        );
        if !self.mapper.supports(exchange_kind) {
            return Err(ValidationError::unsupported_exchange_kind(exchange_kind));
        }

        let expiration = resolve_field(
            request.expiration,
            self.client.expiration,
            self.mapper.expiration,
        );

        Ok(ResolvedProperties {
            persistent: resolve_field(
                request.persistent,
                self.client.persistent,
                self.mapper.persistent,
            ),
            ttl: expiration.ttl(),
            exchange_kind,
            exchange: self.mapper.exchanges.name(exchange_kind).to_owned(),
            routing_key: resolve_field(
                request.routing_key.as_deref(),
                self.client.routing_key.as_deref(),
                self.mapper.routing_key.as_str(),
            )
            .to_owned(),
            headers: resolve_field(
                request.headers.as_ref(),
                self.client.headers.as_ref(),
                &self.mapper.headers,
            )
            .clone(),
        })
    }
}

/// First set value in order request, client, mapper.
pub fn resolve_field<T>(request: Option<T>, client: Option<T>, mapper: T) -> T {
    request.or(client).unwrap_or(mapper)
}

/// Static misconfiguration, detected before any network interaction.
#[derive(Debug)]
pub struct ValidationError {
    context: SpanTrace,
    kind: ValidationErrorKind,
}

/// Validation error kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationErrorKind {
    /// The name does not denote any exchange kind.
    UnknownExchangeKind(String),
    /// The exchange kind is outside the mapper's supported set.
    UnsupportedExchangeKind(ExchangeKind),
    /// The mapper supports no exchange kind at all.
    EmptySupportedSet,
    /// A supported exchange kind has no exchange name.
    MissingExchangeName(ExchangeKind),
    /// A scalar setting is out of range.
    InvalidSetting { name: &'static str, reason: String },
}

impl ValidationError {
    fn new(kind: ValidationErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub(crate) fn unknown_exchange_kind(name: &str) -> Self {
        Self::new(ValidationErrorKind::UnknownExchangeKind(name.to_owned()))
    }

    pub(crate) fn unsupported_exchange_kind(kind: ExchangeKind) -> Self {
        Self::new(ValidationErrorKind::UnsupportedExchangeKind(kind))
    }

    pub(crate) fn invalid_setting(name: &'static str, reason: impl Into<String>) -> Self {
        Self::new(ValidationErrorKind::InvalidSetting {
            name,
            reason: reason.into(),
        })
    }

    pub fn kind(&self) -> &ValidationErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ValidationErrorKind::UnknownExchangeKind(name) => {
                writeln!(f, "Unknown exchange kind `{name}`")
            }
            ValidationErrorKind::UnsupportedExchangeKind(kind) => {
                writeln!(f, "Unsupported exchange kind `{kind}`")
            }
            ValidationErrorKind::EmptySupportedSet => {
                writeln!(f, "No supported exchange kinds configured")
            }
            ValidationErrorKind::MissingExchangeName(kind) => {
                writeln!(f, "No exchange name configured for kind `{kind}`")
            }
            ValidationErrorKind::InvalidSetting { name, reason } => {
                writeln!(f, "Invalid setting `{name}`: {reason}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ValidationError {}

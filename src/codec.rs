//! Translation between HTTP messages and broker deliveries.
//!
//! The body of every message is a JSON packet carrying the HTTP head plus a
//! base64 body, tagged with [`CONTENT_TYPE`]. Everything else rides on the
//! broker's own message properties:
//!
//! - correlation id and reply destination, copied verbatim
//! - durability, TTL and custom headers, from [`ResolvedProperties`]
//! - exchange and routing key, as publish targeting ([`PublishMeta`])
//!
//! A request delivery also carries the caller's unresolved request-level
//! overrides, which the host honours when it publishes the reply. They travel
//! in reserved headers, apart from the request's own resolved properties:
//! durability under [`PERSISTENT_HEADER`], expiration under
//! [`EXPIRATION_HEADER`] (milliseconds or `"infinite"`), exchange kind under
//! [`EXCHANGE_KIND_HEADER`]. When [`HEADERS_HEADER`] is set, the headers
//! named with [`REPLY_HEADER_PREFIX`] form the caller's header override.
//! Absent reserved headers leave the field to the host's own defaults.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Request, Response, Version};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    properties::{
        ExchangeKind, Expiration, FieldValue, MessagingProperties, ResolvedProperties,
        ValidationError,
    },
    transport::{Delivery, DeliveryProperties, OutboundMessage, PublishMeta},
};

/// Content type of every message produced by this crate.
pub const CONTENT_TYPE: &str = "application/vnd.courier.http+json";

/// Reserved header carrying the exchange kind requested for the reply.
pub const EXCHANGE_KIND_HEADER: &str = "x-courier-exchange-kind";

/// Reserved header carrying the durability requested for the reply.
pub const PERSISTENT_HEADER: &str = "x-courier-persistent";

/// Reserved header carrying the expiration requested for the reply.
pub const EXPIRATION_HEADER: &str = "x-courier-expiration";

/// Reserved header marking that the reply's headers are overridden.
pub const HEADERS_HEADER: &str = "x-courier-headers";

/// Prefix of the reserved headers carrying the reply's header override.
pub const REPLY_HEADER_PREFIX: &str = "x-courier-reply-header.";

const INFINITE: &str = "infinite";

const RESERVED_HEADERS: [&str; 4] = [
    EXCHANGE_KIND_HEADER,
    PERSISTENT_HEADER,
    EXPIRATION_HEADER,
    HEADERS_HEADER,
];

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.contains(&name) || name.starts_with(REPLY_HEADER_PREFIX)
}

/// Metadata of a decoded request delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    pub correlation_id: String,
    /// Queue (routing key) the reply must be published to.
    pub reply_to: String,
    pub content_type: String,
    /// Request-level overrides found on the delivery.
    pub overrides: MessagingProperties,
    pub received_at: DateTime<Utc>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl RequestMeta {
    /// Request-level layer for the reply: the delivery's overrides, routed to
    /// the reply destination.
    pub fn reply_properties(&self) -> MessagingProperties {
        MessagingProperties {
            routing_key: Some(self.reply_to.clone()),
            ..self.overrides.clone()
        }
    }
}

/// A request taken off the broker, ready for the pipeline.
pub type DecodedRequest = Envelope<RequestMeta, Request<Bytes>>;

/// A reply taken off the broker, keyed by its correlation id.
pub type DecodedResponse = Envelope<String, Response<Bytes>>;

#[derive(Debug, Serialize, Deserialize)]
struct RequestPacket {
    method: String,
    uri: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default, with = "base64_body")]
    body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponsePacket {
    status: u16,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default, with = "base64_body")]
    body: Vec<u8>,
}

mod base64_body {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: impl AsRef<[u8]>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Decode a request delivery.
///
/// Fails when the correlation id or reply destination is missing, the
/// content type is foreign, the body is not a request packet, or an override
/// header is invalid.
pub fn decode_request(delivery: &Delivery) -> Result<DecodedRequest, CodecError> {
    let props = &delivery.properties;
    let correlation_id = required(&props.correlation_id, "correlation id")?;
    let reply_to = required(&props.reply_to, "reply destination")?;
    let content_type = check_content_type(props)?;

    let packet: RequestPacket =
        serde_json::from_slice(&delivery.body).map_err(CodecError::malformed_body)?;

    let mut builder = Request::builder()
        .method(packet.method.as_str())
        .uri(packet.uri.as_str())
        .version(parse_version(packet.version.as_deref())?);
    for (name, value) in &packet.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let request = builder
        .body(Bytes::from(packet.body))
        .map_err(CodecError::invalid_http)?;

    Ok(Envelope {
        headers: RequestMeta {
            correlation_id,
            reply_to,
            content_type,
            overrides: request_overrides(props)?,
            received_at: Utc::now(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        },
        message: request,
    })
}

/// Encode a request for publishing.
///
/// `resolved` shapes the request delivery itself. `reply` holds the caller's
/// unresolved overrides for the reply; only the fields it sets are sent, and
/// its routing key is ignored since replies go to `reply_to`.
pub fn encode_request(
    request: Request<Bytes>,
    correlation_id: &str,
    reply_to: &str,
    resolved: &ResolvedProperties,
    reply: &MessagingProperties,
) -> Result<OutboundMessage, CodecError> {
    let (parts, body) = request.into_parts();
    let packet = RequestPacket {
        method: parts.method.as_str().to_owned(),
        uri: parts.uri.to_string(),
        version: Some(format_version(parts.version).to_owned()),
        headers: header_pairs(&parts.headers)?,
        body: body.to_vec(),
    };
    let body = serde_json::to_vec(&packet).map_err(CodecError::serialize)?;

    let mut message = outbound(
        resolved,
        DeliveryProperties {
            correlation_id: Some(correlation_id.to_owned()),
            reply_to: Some(reply_to.to_owned()),
            ..Default::default()
        },
        body,
    );
    write_reply_overrides(&mut message.headers.properties, reply);
    Ok(message)
}

/// Encode the reply to a decoded request, tagged with its correlation id.
pub fn encode_response(
    response: Response<Bytes>,
    meta: &RequestMeta,
    resolved: &ResolvedProperties,
) -> Result<OutboundMessage, CodecError> {
    let (parts, body) = response.into_parts();
    let packet = ResponsePacket {
        status: parts.status.as_u16(),
        version: Some(format_version(parts.version).to_owned()),
        headers: header_pairs(&parts.headers)?,
        body: body.to_vec(),
    };
    let body = serde_json::to_vec(&packet).map_err(CodecError::serialize)?;

    Ok(outbound(
        resolved,
        DeliveryProperties {
            correlation_id: Some(meta.correlation_id.clone()),
            ..Default::default()
        },
        body,
    ))
}

/// Decode a reply delivery.
pub fn decode_response(delivery: &Delivery) -> Result<DecodedResponse, CodecError> {
    let correlation_id = required(&delivery.properties.correlation_id, "correlation id")?;
    check_content_type(&delivery.properties)?;

    let packet: ResponsePacket =
        serde_json::from_slice(&delivery.body).map_err(CodecError::malformed_body)?;

    let mut builder = Response::builder()
        .status(packet.status)
        .version(parse_version(packet.version.as_deref())?);
    for (name, value) in &packet.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let response = builder
        .body(Bytes::from(packet.body))
        .map_err(CodecError::invalid_http)?;

    Ok(Envelope {
        headers: correlation_id,
        message: response,
    })
}

fn outbound(
    resolved: &ResolvedProperties,
    base: DeliveryProperties,
    body: Vec<u8>,
) -> OutboundMessage {
    Envelope {
        headers: PublishMeta {
            exchange: resolved.exchange.clone(),
            exchange_kind: resolved.exchange_kind,
            routing_key: resolved.routing_key.clone(),
            properties: DeliveryProperties {
                content_type: Some(CONTENT_TYPE.to_owned()),
                persistent: Some(resolved.persistent),
                expiration: resolved.ttl,
                headers: resolved.headers.clone(),
                timestamp: Some(Utc::now()),
                ..base
            },
        },
        message: Bytes::from(body),
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, CodecError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(CodecError::new(CodecErrorKind::MissingField(field))),
    }
}

fn check_content_type(props: &DeliveryProperties) -> Result<String, CodecError> {
    match props.content_type.as_deref() {
        None => Ok(CONTENT_TYPE.to_owned()),
        Some(ct) if ct.eq_ignore_ascii_case(CONTENT_TYPE) => Ok(ct.to_owned()),
        Some(ct) => Err(CodecError::new(CodecErrorKind::UnsupportedContentType(
            ct.to_owned(),
        ))),
    }
}

fn write_reply_overrides(props: &mut DeliveryProperties, reply: &MessagingProperties) {
    let headers = &mut props.headers;
    headers.retain(|name, _| !is_reserved(name));
    if let Some(custom) = &reply.headers {
        headers.insert(HEADERS_HEADER.to_owned(), FieldValue::Bool(true));
        for (name, value) in custom {
            headers.insert(format!("{REPLY_HEADER_PREFIX}{name}"), value.clone());
        }
    }
    if let Some(persistent) = reply.persistent {
        headers.insert(PERSISTENT_HEADER.to_owned(), FieldValue::Bool(persistent));
    }
    match reply.expiration {
        None => {}
        Some(Expiration::Infinite) => {
            headers.insert(EXPIRATION_HEADER.to_owned(), FieldValue::from(INFINITE));
        }
        Some(Expiration::After(ttl)) => {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            headers.insert(EXPIRATION_HEADER.to_owned(), FieldValue::Int(millis));
        }
    }
    if let Some(kind) = reply.exchange_kind {
        headers.insert(
            EXCHANGE_KIND_HEADER.to_owned(),
            FieldValue::from(kind.as_str()),
        );
    }
}

fn request_overrides(props: &DeliveryProperties) -> Result<MessagingProperties, CodecError> {
    let mut headers = props.headers.clone();

    let exchange_kind = match headers.remove(EXCHANGE_KIND_HEADER) {
        None => None,
        Some(FieldValue::String(name)) => Some(
            name.parse::<ExchangeKind>()
                .map_err(CodecError::invalid_override)?,
        ),
        Some(other) => return Err(unexpected_override(EXCHANGE_KIND_HEADER, "a string", &other)),
    };

    let persistent = match headers.remove(PERSISTENT_HEADER) {
        None => None,
        Some(FieldValue::Bool(persistent)) => Some(persistent),
        Some(other) => return Err(unexpected_override(PERSISTENT_HEADER, "a boolean", &other)),
    };

    let expiration = match headers.remove(EXPIRATION_HEADER) {
        None => None,
        Some(FieldValue::String(word)) if word.eq_ignore_ascii_case(INFINITE) => {
            Some(Expiration::Infinite)
        }
        Some(FieldValue::Int(millis)) if millis >= 0 => Some(Expiration::After(
            Duration::from_millis(millis.unsigned_abs()),
        )),
        Some(other) => {
            return Err(unexpected_override(
                EXPIRATION_HEADER,
                "milliseconds or `infinite`",
                &other,
            ));
        }
    };

    let custom_headers = match headers.remove(HEADERS_HEADER) {
        None | Some(FieldValue::Bool(false)) => None,
        Some(FieldValue::Bool(true)) => Some(
            headers
                .into_iter()
                .filter_map(|(name, value)| {
                    name.strip_prefix(REPLY_HEADER_PREFIX)
                        .map(|name| (name.to_owned(), value))
                })
                .collect(),
        ),
        Some(other) => return Err(unexpected_override(HEADERS_HEADER, "a boolean", &other)),
    };

    Ok(MessagingProperties {
        persistent,
        expiration,
        exchange_kind,
        routing_key: None,
        headers: custom_headers,
    })
}

fn unexpected_override(name: &'static str, expected: &str, found: &FieldValue) -> CodecError {
    CodecError::invalid_override(ValidationError::invalid_setting(
        name,
        format!("expected {expected}, found {found:?}"),
    ))
}

fn header_pairs(headers: &HeaderMap) -> Result<Vec<(String, String)>, CodecError> {
    headers
        .iter()
        .map(|(name, value)| {
            value
                .to_str()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
                .map_err(|_| CodecError::new(CodecErrorKind::NonUtf8Header(name.to_string())))
        })
        .collect()
}

fn format_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(version: Option<&str>) -> Result<Version, CodecError> {
    match version {
        None | Some("HTTP/1.1") => Ok(Version::HTTP_11),
        Some("HTTP/0.9") => Ok(Version::HTTP_09),
        Some("HTTP/1.0") => Ok(Version::HTTP_10),
        Some("HTTP/2.0") => Ok(Version::HTTP_2),
        Some("HTTP/3.0") => Ok(Version::HTTP_3),
        Some(other) => Err(CodecError::new(CodecErrorKind::UnsupportedVersion(
            other.to_owned(),
        ))),
    }
}

/// Error raised while encoding or decoding a message.
///
/// A decode error concerns a single delivery; the host rejects that delivery
/// and carries on.
#[derive(Debug)]
pub struct CodecError {
    context: SpanTrace,
    kind: CodecErrorKind,
}

/// Codec error kinds.
#[derive(Debug)]
pub enum CodecErrorKind {
    /// A required delivery property is absent or empty.
    MissingField(&'static str),
    UnsupportedContentType(String),
    UnsupportedVersion(String),
    /// The body is not a valid packet.
    MalformedBody(serde_json::Error),
    /// The packet does not describe a valid HTTP message.
    InvalidHttp(http::Error),
    /// A request-level override carried on the delivery is invalid.
    InvalidOverride(ValidationError),
    /// An HTTP header value is not representable as text.
    NonUtf8Header(String),
    Serialize(serde_json::Error),
}

impl CodecError {
    fn new(kind: CodecErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn malformed_body(err: serde_json::Error) -> Self {
        Self::new(CodecErrorKind::MalformedBody(err))
    }

    fn invalid_http(err: http::Error) -> Self {
        Self::new(CodecErrorKind::InvalidHttp(err))
    }

    fn invalid_override(err: ValidationError) -> Self {
        Self::new(CodecErrorKind::InvalidOverride(err))
    }

    fn serialize(err: serde_json::Error) -> Self {
        Self::new(CodecErrorKind::Serialize(err))
    }

    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CodecErrorKind::MissingField(field) => writeln!(f, "Missing {field}"),
            CodecErrorKind::UnsupportedContentType(ct) => {
                writeln!(f, "Unsupported content type `{ct}`")
            }
            CodecErrorKind::UnsupportedVersion(v) => writeln!(f, "Unsupported HTTP version `{v}`"),
            CodecErrorKind::MalformedBody(err) => writeln!(f, "Malformed body: {err}"),
            CodecErrorKind::InvalidHttp(err) => writeln!(f, "Invalid HTTP message: {err}"),
            CodecErrorKind::InvalidOverride(err) => write!(f, "Invalid override: {err}"),
            CodecErrorKind::NonUtf8Header(name) => {
                writeln!(f, "Header `{name}` is not valid UTF-8")
            }
            CodecErrorKind::Serialize(err) => writeln!(f, "Serialization error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::MalformedBody(err) | CodecErrorKind::Serialize(err) => Some(err),
            CodecErrorKind::InvalidHttp(err) => Some(err),
            CodecErrorKind::InvalidOverride(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{Method, StatusCode};

    use super::*;
    use crate::properties::{Headers, MapperDefaults, PropertyLayers};

    fn no_overrides() -> MessagingProperties {
        MessagingProperties::default()
    }

    fn resolved(routing_key: &str) -> ResolvedProperties {
        PropertyLayers::default()
            .resolve(&MessagingProperties::default().with_routing_key(routing_key))
            .unwrap()
    }

    fn as_delivery(message: OutboundMessage, tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            redelivered: false,
            properties: message.headers.properties,
            body: message.message,
        }
    }

    fn sample_request() -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri("/orders?expedite=1")
            .header("content-type", "application/json")
            .header("x-tenant", "acme")
            .body(Bytes::from_static(br#"{"sku":"A-1"}"#))
            .unwrap()
    }

    #[test]
    fn request_survives_the_wire() {
        let message = encode_request(
            sample_request(),
            "corr-42",
            "replies.client-1",
            &resolved("orders"),
            &no_overrides(),
        )
        .unwrap();
        assert_eq!(message.headers.routing_key, "orders");
        assert_eq!(message.headers.properties.content_type.as_deref(), Some(CONTENT_TYPE));

        let decoded = decode_request(&as_delivery(message, 7)).unwrap();
        let (meta, request) = decoded.into_parts();
        assert_eq!(meta.correlation_id, "corr-42");
        assert_eq!(meta.reply_to, "replies.client-1");
        assert_eq!(meta.delivery_tag, 7);
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "/orders?expedite=1");
        assert_eq!(request.headers()["x-tenant"], "acme");
        assert_eq!(request.body().as_ref(), br#"{"sku":"A-1"}"#);
    }

    #[test]
    fn reply_keeps_correlation_and_destination() {
        let message = encode_request(
            sample_request(),
            "opaque/token==",
            "amq.gen-Xyz",
            &resolved("orders"),
            &no_overrides(),
        )
        .unwrap();
        let (meta, _) = decode_request(&as_delivery(message, 1)).unwrap().into_parts();

        let reply_props = PropertyLayers::default()
            .resolve(&meta.reply_properties())
            .unwrap();
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .body(Bytes::from_static(&[0, 159, 146, 150]))
            .unwrap();
        let reply = encode_response(response, &meta, &reply_props).unwrap();

        assert_eq!(reply.headers.routing_key, "amq.gen-Xyz");
        assert_eq!(
            reply.headers.properties.correlation_id.as_deref(),
            Some("opaque/token==")
        );

        let decoded = decode_response(&as_delivery(reply, 2)).unwrap();
        assert_eq!(decoded.headers, "opaque/token==");
        assert_eq!(decoded.message.status(), StatusCode::CREATED);
        assert_eq!(decoded.message.body().as_ref(), &[0, 159, 146, 150]);
    }

    #[test]
    fn infinite_expiration_emits_no_ttl() {
        let layers = PropertyLayers::new(
            MessagingProperties::default()
                .with_expiration(Expiration::After(Duration::from_secs(10))),
            MapperDefaults {
                expiration: Expiration::After(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        let resolved = layers
            .resolve(&MessagingProperties::default().with_expiration(Expiration::Infinite))
            .unwrap();

        let message =
            encode_request(sample_request(), "c", "r", &resolved, &no_overrides()).unwrap();
        assert_eq!(message.headers.properties.expiration, None);
    }

    #[test]
    fn durability_and_targeting_are_independent() {
        let layers = PropertyLayers::default();
        let resolved = layers
            .resolve(
                &MessagingProperties::default()
                    .with_persistent(false)
                    .with_expiration(Expiration::After(Duration::from_millis(250)))
                    .with_exchange_kind(ExchangeKind::Topic)
                    .with_routing_key("orders.eu")
                    .with_header("priority", 3_i64),
            )
            .unwrap();
        let message =
            encode_request(sample_request(), "c", "r", &resolved, &no_overrides()).unwrap();

        assert_eq!(message.headers.exchange, "amq.topic");
        assert_eq!(message.headers.exchange_kind, ExchangeKind::Topic);
        assert_eq!(message.headers.routing_key, "orders.eu");
        let props = &message.headers.properties;
        assert_eq!(props.persistent, Some(false));
        assert_eq!(props.expiration, Some(Duration::from_millis(250)));
        assert_eq!(props.headers.get("priority"), Some(&FieldValue::Int(3)));
    }

    #[test]
    fn reply_overrides_travel_apart_from_resolved_properties() {
        let mut resolved = resolved("orders");
        resolved.persistent = true;
        resolved.ttl = Some(Duration::from_secs(60));
        resolved.headers.insert("client".to_owned(), FieldValue::from("svc-a"));

        let reply = MessagingProperties::default()
            .with_persistent(false)
            .with_expiration(Expiration::After(Duration::from_secs(3)))
            .with_exchange_kind(ExchangeKind::Fanout)
            .with_header("tenant", "acme");
        let message = encode_request(sample_request(), "c", "r", &resolved, &reply).unwrap();

        let props = &message.headers.properties;
        assert_eq!(props.persistent, Some(true));
        assert_eq!(props.expiration, Some(Duration::from_secs(60)));
        assert_eq!(props.headers.get("client"), Some(&FieldValue::from("svc-a")));

        let (meta, _) = decode_request(&as_delivery(message, 1)).unwrap().into_parts();
        assert_eq!(meta.overrides.persistent, Some(false));
        assert_eq!(
            meta.overrides.expiration,
            Some(Expiration::After(Duration::from_secs(3)))
        );
        assert_eq!(meta.overrides.exchange_kind, Some(ExchangeKind::Fanout));
        assert_eq!(
            meta.overrides.headers,
            Some(Headers::from([("tenant".to_owned(), FieldValue::from("acme"))]))
        );
        assert_eq!(meta.reply_properties().routing_key.as_deref(), Some("r"));
    }

    #[test]
    fn resolved_values_are_not_read_back_as_overrides() {
        let mut resolved = resolved("orders");
        resolved.persistent = true;
        resolved.ttl = Some(Duration::from_secs(60));
        resolved.headers.insert("client".to_owned(), FieldValue::from("svc-a"));

        let message =
            encode_request(sample_request(), "c", "r", &resolved, &no_overrides()).unwrap();
        let (meta, _) = decode_request(&as_delivery(message, 1)).unwrap().into_parts();

        assert_eq!(meta.overrides, MessagingProperties::default());
    }

    #[test]
    fn infinite_reply_expiration_survives_the_wire() {
        let reply = MessagingProperties::default().with_expiration(Expiration::Infinite);
        let message =
            encode_request(sample_request(), "c", "r", &resolved("orders"), &reply).unwrap();
        let (meta, _) = decode_request(&as_delivery(message, 1)).unwrap().into_parts();
        assert_eq!(meta.overrides.expiration, Some(Expiration::Infinite));

        let host = PropertyLayers::new(
            MessagingProperties::default()
                .with_expiration(Expiration::After(Duration::from_secs(60))),
            MapperDefaults::default(),
        );
        let reply_props = host.resolve(&meta.reply_properties()).unwrap();
        assert_eq!(reply_props.ttl, None);
    }

    #[test]
    fn empty_header_override_is_kept() {
        let reply = MessagingProperties::default().with_headers(Headers::new());
        let message =
            encode_request(sample_request(), "c", "r", &resolved("orders"), &reply).unwrap();
        let (meta, _) = decode_request(&as_delivery(message, 1)).unwrap().into_parts();
        assert_eq!(meta.overrides.headers, Some(Headers::new()));
    }

    fn raw_delivery(properties: DeliveryProperties, body: &'static [u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            redelivered: false,
            properties,
            body: Bytes::from_static(body),
        }
    }

    fn valid_properties() -> DeliveryProperties {
        DeliveryProperties {
            correlation_id: Some("c".to_owned()),
            reply_to: Some("r".to_owned()),
            content_type: Some(CONTENT_TYPE.to_owned()),
            ..Default::default()
        }
    }

    const GET: &[u8] = br#"{"method":"GET","uri":"/ping"}"#;

    #[test]
    fn minimal_packet_decodes() {
        let (_, request) = decode_request(&raw_delivery(valid_properties(), GET))
            .unwrap()
            .into_parts();
        assert_eq!(request.method(), Method::GET);
        assert!(request.body().is_empty());
    }

    #[test]
    fn missing_correlation_or_reply_is_fatal() {
        let mut props = valid_properties();
        props.correlation_id = None;
        let err = decode_request(&raw_delivery(props, GET)).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::MissingField("correlation id")));

        let mut props = valid_properties();
        props.reply_to = Some(String::new());
        let err = decode_request(&raw_delivery(props, GET)).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::MissingField("reply destination")));
    }

    #[test]
    fn malformed_deliveries_are_rejected() {
        let err = decode_request(&raw_delivery(valid_properties(), b"not json")).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::MalformedBody(_)));

        let mut props = valid_properties();
        props.content_type = Some("text/plain".to_owned());
        let err = decode_request(&raw_delivery(props, GET)).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::UnsupportedContentType(_)));

        let err = decode_request(&raw_delivery(
            valid_properties(),
            br#"{"method":"GET","uri":"/","version":"HTTP/7"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::UnsupportedVersion(_)));

        let err = decode_request(&raw_delivery(
            valid_properties(),
            br#"{"method":"G ET","uri":"/"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::InvalidHttp(_)));
    }

    #[test]
    fn unknown_exchange_kind_override_is_rejected() {
        let mut props = valid_properties();
        props
            .headers
            .insert(EXCHANGE_KIND_HEADER.to_owned(), FieldValue::from("x-delayed"));
        let err = decode_request(&raw_delivery(props, GET)).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::InvalidOverride(_)));
    }

    #[test]
    fn mistyped_reserved_headers_are_rejected() {
        let mut props = valid_properties();
        props
            .headers
            .insert(PERSISTENT_HEADER.to_owned(), FieldValue::from("yes"));
        let err = decode_request(&raw_delivery(props, GET)).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::InvalidOverride(_)));

        let mut props = valid_properties();
        props
            .headers
            .insert(EXPIRATION_HEADER.to_owned(), FieldValue::Int(-5));
        let err = decode_request(&raw_delivery(props, GET)).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::InvalidOverride(_)));
    }
}

#![doc = include_str!("../README.md")]

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod host;
pub mod pipeline;
pub mod properties;
pub mod transport;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use properties::{
    ExchangeKind, Expiration, FieldValue, Headers, MapperDefaults, MessagingProperties,
    PropertyLayers, ResolvedProperties, ValidationError, ValidationErrorKind,
};

#[doc(inline)]
pub use codec::{CodecError, CodecErrorKind, RequestMeta};

#[doc(inline)]
pub use pipeline::{ApplicationFault, HttpRequest, HttpResponse, Pipeline};

#[doc(inline)]
pub use transport::{
    BrokerChannel, Connector, Delivery, InMemoryBroker, TransportError, TransportErrorKind,
};

#[doc(inline)]
pub use dispatcher::{
    DefaultDispatcherHook, DispatchError, DispatchErrorKind, Dispatcher, DispatcherHook,
    DrainReport, Health,
};

#[doc(inline)]
pub use host::{Host, HostError, HostErrorKind, HostState};

#[doc(inline)]
pub use client::{ClientError, ClientErrorKind, RequestOptions, RpcClient};

#[doc(inline)]
pub use config::{ClientConfig, HostConfig};

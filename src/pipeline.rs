//! The in-process request-handling pipeline.
//!
//! Any `tower::Service` from `http::Request<Bytes>` to `http::Response<Bytes>`
//! can be hosted. [`Pipeline`] wraps it so that:
//!
//! - every failure is normalized into an [`ApplicationFault`]
//! - Tower middleware can be stacked via [`Pipeline::layer`]
//! - concurrent workers each call their own clone of the service

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{StatusCode, header};
use tower::{Service, ServiceExt as _};

pub type HttpRequest = http::Request<Bytes>;
pub type HttpResponse = http::Response<Bytes>;

/// Header marking a reply as a fault produced on the host side.
pub const FAULT_HEADER: &str = "x-courier-fault";

/// Hosted request pipeline.
#[derive(Clone)]
pub struct Pipeline<S> {
    service: S,
}

impl<S> Pipeline<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Apply a Tower layer to the pipeline.
    ///
    /// This enables composition with middleware such as timeouts,
    /// concurrency limits, or tracing.
    pub fn layer<L>(self, layer: L) -> Pipeline<L::Service>
    where
        L: tower::Layer<S>,
    {
        Pipeline {
            service: layer.layer(self.service),
        }
    }
}

impl<S> Pipeline<S>
where
    S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    /// Run one request through the pipeline.
    ///
    /// The returned future owns its own clone of the service, so it can be
    /// spawned without borrowing the pipeline.
    pub fn invoke(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, ApplicationFault>> + Send + 'static {
        let call = self.service.clone().oneshot(request);
        async move {
            call.await
                .map_err(|e| ApplicationFault::from_error(e.into()))
        }
    }
}

/// `Service` implementation so a `Pipeline` can itself be layered or nested.
impl<S> Service<HttpRequest> for Pipeline<S>
where
    S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    type Response = HttpResponse;
    type Error = ApplicationFault;
    type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, ApplicationFault>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| ApplicationFault::from_error(e.into()))
    }

    fn call(&mut self, req: HttpRequest) -> Self::Future {
        Box::pin(self.invoke(req))
    }
}

/// Whether a reply was produced by [`ApplicationFault::into_response`].
pub fn is_fault(response: &HttpResponse) -> bool {
    response.headers().contains_key(FAULT_HEADER)
}

/// The pipeline failed to produce a response.
///
/// Faults travel back to the caller as a reply carrying the status and
/// message, instead of leaving the caller waiting for a timeout. Pipelines
/// may return an `ApplicationFault` directly to pick the status; any other
/// error becomes `500 Internal Server Error`.
#[derive(Debug)]
pub struct ApplicationFault {
    status: StatusCode,
    message: String,
    source: Option<tower::BoxError>,
}

impl ApplicationFault {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error(err: tower::BoxError) -> Self {
        match err.downcast::<ApplicationFault>() {
            Ok(fault) => *fault,
            Err(err) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: err.to_string(),
                source: Some(err),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Representation-agnostic fault reply: status plus a plain-text message.
    pub fn into_response(self) -> HttpResponse {
        let mut response = http::Response::new(Bytes::from(self.message));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.headers_mut().insert(
            FAULT_HEADER,
            header::HeaderValue::from_static("application"),
        );
        response
    }
}

impl std::fmt::Display for ApplicationFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Application fault ({}): {}", self.status, self.message)
    }
}

impl std::error::Error for ApplicationFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}

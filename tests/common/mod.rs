#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use courier::{
    ApplicationFault, HostConfig, HttpRequest, HttpResponse, InMemoryBroker, MessagingProperties,
    Pipeline, PropertyLayers, codec,
};
use http::{HeaderValue, StatusCode};
use tower::{service_fn, util::BoxCloneService};

pub const QUEUE: &str = "svc";
pub const REPLIES: &str = "replies";

pub type ProbeService = BoxCloneService<HttpRequest, HttpResponse, ApplicationFault>;
pub type ProbePipeline = Pipeline<ProbeService>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Handler driven by request headers:
/// - `x-delay-ms`: sleep before answering
/// - `x-fail`: answer with an application fault
///
/// Otherwise echoes the URI as the body and the method as `x-echo-method`.
pub async fn scripted(req: HttpRequest) -> Result<HttpResponse, ApplicationFault> {
    let delay = req
        .headers()
        .get("x-delay-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(ms) = delay {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    if req.headers().contains_key("x-fail") {
        return Err(ApplicationFault::new(
            StatusCode::BAD_GATEWAY,
            "upstream failed",
        ));
    }

    let mut response = http::Response::new(Bytes::from(req.uri().to_string()));
    response.headers_mut().insert(
        "x-echo-method",
        HeaderValue::from_str(req.method().as_str()).unwrap(),
    );
    Ok(response)
}

/// Counts pipeline invocations around [`scripted`].
#[derive(Clone, Default)]
pub struct Probe {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Probe {
    pub fn pipeline(&self) -> ProbePipeline {
        let probe = self.clone();
        Pipeline::new(BoxCloneService::new(service_fn(move |req: HttpRequest| {
            let probe = probe.clone();
            async move {
                probe.started.fetch_add(1, Ordering::SeqCst);
                let result = scripted(req).await;
                probe.finished.fetch_add(1, Ordering::SeqCst);
                result
            }
        })))
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

pub fn host_config() -> HostConfig {
    HostConfig::new(QUEUE)
        .with_prefetch(4)
        .with_drain_timeout(Duration::from_secs(2))
        .with_reconnect_backoff(Duration::from_millis(20), Duration::from_millis(200))
}

pub fn request(path: &str) -> HttpRequest {
    http::Request::builder()
        .uri(path)
        .body(Bytes::new())
        .unwrap()
}

pub fn delayed(path: &str, delay: Duration) -> HttpRequest {
    http::Request::builder()
        .uri(path)
        .header("x-delay-ms", delay.as_millis().to_string())
        .body(Bytes::new())
        .unwrap()
}

/// Put an encoded request on `QUEUE`, replying to `REPLIES`.
pub async fn inject_request(broker: &InMemoryBroker, correlation_id: &str, request: HttpRequest) {
    let resolved = PropertyLayers::default()
        .resolve(&MessagingProperties::default().with_routing_key(QUEUE))
        .unwrap();
    let message = codec::encode_request(
        request,
        correlation_id,
        REPLIES,
        &resolved,
        &MessagingProperties::default(),
    )
    .unwrap();
    broker
        .inject(QUEUE, message.headers.properties, message.message)
        .await;
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

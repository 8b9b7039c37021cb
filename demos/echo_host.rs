use std::time::Duration;

use bytes::Bytes;
use courier::{
    ApplicationFault, ClientConfig, Expiration, Host, HostConfig, HttpRequest, InMemoryBroker,
    MessagingProperties, Pipeline, RequestOptions, RpcClient, pipeline::is_fault,
};
use http::StatusCode;
use tower::service_fn;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

async fn echo(req: HttpRequest) -> Result<http::Response<Bytes>, ApplicationFault> {
    if req.uri().path() == "/teapot" {
        return Err(ApplicationFault::new(
            StatusCode::IM_A_TEAPOT,
            "short and stout",
        ));
    }
    let body = format!("{} {}", req.method(), req.uri());
    Ok(http::Response::new(Bytes::from(body)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let broker = InMemoryBroker::default();

    let host = Host::new(
        broker.clone(),
        Pipeline::new(service_fn(echo)),
        HostConfig::new("echo")
            .with_prefetch(4)
            .with_drain_timeout(Duration::from_secs(5)),
    );
    host.start().await?;

    let client = RpcClient::connect(
        &broker,
        ClientConfig::new("echo.replies")
            .with_timeout(Some(Duration::from_secs(2)))
            .with_defaults(MessagingProperties::default().with_routing_key("echo")),
    )
    .await?;

    for path in ["/hello", "/teapot"] {
        let request = http::Request::builder()
            .method("POST")
            .uri(path)
            .body(Bytes::new())?;
        let options = RequestOptions::default().with_properties(
            MessagingProperties::default()
                .with_expiration(Expiration::After(Duration::from_secs(30))),
        );
        let response = client.send(request, options).await?;
        tracing::info!(
            path,
            status = %response.status(),
            fault = is_fault(&response),
            body = %String::from_utf8_lossy(response.body()),
            "Reply received"
        );
    }

    client.close().await?;
    let report = host.stop().await?;
    tracing::info!(processed = report.processed, "Done");
    Ok(())
}

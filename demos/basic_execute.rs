use std::sync::Arc;
use std::time::Duration;

use reqcore::prelude::{
    ContentDigestAlgorithm, Credentials, ServiceClient, ServiceRequest, SigV4Signer,
};
use reqcore::{RetryConfig, RetryMode};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Serialize)]
struct CreateItem<'a> {
    name: &'a str,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct EchoResponse {
    headers: serde_json::Value,
    json: Option<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reqcore=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // REQCORE_RETRY_MODE / REQCORE_MAX_ATTEMPTS override the defaults.
    let retry = RetryConfig::from_env(RetryConfig::new(RetryMode::Standard))?;
    let signer = SigV4Signer::new(
        Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"),
        "us-east-1",
        "echo",
    );
    let client = ServiceClient::builder()
        .client_name("reqcore-example-basic")
        .endpoint("https://httpbin.org")
        .signer(Arc::new(signer))
        .retry_config(retry)
        .request_timeout(Duration::from_secs(3))
        .total_timeout(Duration::from_secs(10))
        .metrics_enabled(true)
        .try_build()?;

    let request = ServiceRequest::post("/anything")
        .operation("CreateItem")
        .query_pair("from", "reqcore")
        .json(&CreateItem {
            name: "demo",
            enabled: true,
        })?
        .compute_content_hash(ContentDigestAlgorithm::Md5);

    let echoed: EchoResponse = client.execute_json(&request).await?;
    println!(
        "POST /anything => authorization={} json={:?}",
        echoed.headers["Authorization"], echoed.json
    );

    let snapshot = client.metrics_snapshot();
    println!(
        "attempts={} retries={} clock_skew_offset_ms={}",
        snapshot.attempts,
        snapshot.retries,
        client.clock_skew_state().offset().as_millis()
    );
    Ok(())
}

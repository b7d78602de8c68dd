use std::sync::Arc;
use std::time::Duration;

use reqcore::prelude::{RetryMode, RetryQuota, ServiceClient, ServiceRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reqcore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A small bucket so the denial shows up after a few failing requests.
    let quota = Arc::new(RetryQuota::new(20));
    let build_client = |name: &str| {
        ServiceClient::builder()
            .client_name(name)
            .endpoint("https://httpbin.org")
            .retry_mode(RetryMode::Standard)
            .retry_quota(Arc::clone(&quota))
            .request_timeout(Duration::from_secs(3))
            .metrics_enabled(true)
            .try_build()
    };
    let orders = build_client("orders")?;
    let billing = build_client("billing")?;

    let failing = ServiceRequest::get("/status/503").operation("AlwaysUnavailable");
    for round in 1..=4 {
        for client in [&orders, &billing] {
            match client.execute(&failing).await {
                Ok(response) => println!(
                    "{} round {round}: {}",
                    client.client_name(),
                    response.status()
                ),
                Err(error) => println!(
                    "{} round {round}: kind={} attempts={} denied={:?} quota_left={}",
                    client.client_name(),
                    error.kind().as_str(),
                    error.attempts(),
                    error.retry_denial().map(|reason| reason.as_str()),
                    quota.available()
                ),
            }
        }
    }

    // Each success returns a token to the shared bucket.
    let healthy = ServiceRequest::get("/status/200").operation("Healthy");
    for _ in 0..3 {
        orders.execute(&healthy).await?;
    }
    println!(
        "after successes quota_left={} orders_denials={} billing_denials={}",
        quota.available(),
        orders.metrics_snapshot().quota_denials,
        billing.metrics_snapshot().quota_denials
    );
    Ok(())
}

//! Retry and pacing behaviour of the shared HTTP client, exercised through
//! a real provider against a mock server.

use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::join_all;
use walletwatch::market_data::providers::BinancePriceSource;
use walletwatch::market_data::{BackoffPolicy, PriceSource, SourceError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn policy(base_delay_ms: u64) -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(base_delay_ms),
        min_interval: Duration::ZERO,
        timeout: Duration::from_secs(2),
    }
}

fn ticker() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        r#"{"symbol":"BTCUSDT","price":"51000.00"}"#,
        "application/json",
    )
}

#[tokio::test]
async fn retries_after_rate_limit_then_succeeds() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ticker())
        .mount(&server)
        .await;

    let source = BinancePriceSource::new()
        .with_base_url(server.uri())
        .with_policy(policy(20));

    let started = Instant::now();
    let price = source.fetch_price("BTCUSDT").await?;

    assert_eq!(price.to_string(), "51000.00");
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);
    // 20ms then 40ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(60));
    Ok(())
}

#[tokio::test]
async fn gives_up_after_max_attempts() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let source = BinancePriceSource::new()
        .with_base_url(server.uri())
        .with_policy(policy(5));

    let err = source.fetch_price("BTCUSDT").await.unwrap_err();

    assert_eq!(err, SourceError::RateLimited { attempts: 3 });
    assert!(err.is_rate_limit());
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);
    Ok(())
}

#[tokio::test]
async fn server_errors_are_not_retried() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let source = BinancePriceSource::new()
        .with_base_url(server.uri())
        .with_policy(policy(5));

    let err = source.fetch_price("BTCUSDT").await.unwrap_err();

    assert_eq!(
        err,
        SourceError::Status {
            status: 502,
            body: "bad gateway".to_string()
        }
    );
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 1);
    Ok(())
}

#[tokio::test]
async fn slow_response_times_out() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ticker().set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let source = BinancePriceSource::new()
        .with_base_url(server.uri())
        .with_policy(BackoffPolicy {
            timeout: Duration::from_millis(50),
            ..policy(5)
        });

    assert_eq!(
        source.fetch_price("BTCUSDT").await.unwrap_err(),
        SourceError::Timeout
    );
    Ok(())
}

#[tokio::test]
async fn undecodable_body_is_malformed() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html>maintenance</html>", "text/html"))
        .mount(&server)
        .await;

    let source = BinancePriceSource::new()
        .with_base_url(server.uri())
        .with_policy(policy(5));

    assert!(matches!(
        source.fetch_price("BTCUSDT").await,
        Err(SourceError::Malformed(_))
    ));
    Ok(())
}

#[tokio::test]
async fn consecutive_requests_respect_min_interval() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ticker())
        .mount(&server)
        .await;

    let source = BinancePriceSource::new()
        .with_base_url(server.uri())
        .with_policy(BackoffPolicy {
            min_interval: Duration::from_millis(100),
            ..policy(5)
        });

    let started = Instant::now();
    for _ in 0..3 {
        source.fetch_price("BTCUSDT").await?;
    }

    assert!(started.elapsed() >= Duration::from_millis(200));
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_queue_behind_min_interval() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ticker())
        .mount(&server)
        .await;

    let source = BinancePriceSource::new()
        .with_base_url(server.uri())
        .with_policy(BackoffPolicy {
            min_interval: Duration::from_millis(100),
            ..policy(5)
        });

    let started = Instant::now();
    let results = join_all((0..3).map(|_| source.fetch_price("BTCUSDT"))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);
    Ok(())
}

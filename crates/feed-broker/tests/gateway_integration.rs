//! 요청 게이트웨이 통합 테스트.
//!
//! 가짜 브로커 전송을 사용하며 tokio 일시정지 시계로 간격과 백오프를 검증합니다.

use async_trait::async_trait;
use feed_broker::{
    endpoint, BrokerClient, BrokerConfig, CredentialManager, GatewayConfig, HttpMethod,
    HttpRequest, HttpResponse, HttpTransport, RequestGateway, RetryPolicy,
};
use feed_core::{FeedError, FeedResult};
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// 호출 기록.
#[derive(Debug, Clone)]
struct Call {
    at: Instant,
    path: String,
    authorization: Option<String>,
}

/// 스크립트된 응답을 돌려주는 가짜 브로커.
#[derive(Default)]
struct FakeBroker {
    calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<(u16, String)>>,
    token_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    latency: Duration,
    token_latency: Duration,
}

impl FakeBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    fn with_token_latency(token_latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            token_latency,
            ..Default::default()
        })
    }

    fn push(&self, status: u16, body: &str) {
        self.script.lock().unwrap().push_back((status, body.to_string()));
    }

    fn market_calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path != endpoint::TOKEN)
            .cloned()
            .collect()
    }

    fn paths(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.path.clone()).collect()
    }
}

#[async_trait]
impl HttpTransport for FakeBroker {
    async fn send(&self, request: HttpRequest) -> FeedResult<HttpResponse> {
        let path = request
            .url
            .strip_prefix("http://broker.test")
            .unwrap_or(&request.url)
            .to_string();
        self.calls.lock().unwrap().push(Call {
            at: Instant::now(),
            path: path.clone(),
            authorization: request
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        });

        if path == endpoint::TOKEN {
            if !self.token_latency.is_zero() {
                tokio::time::sleep(self.token_latency).await;
            }
            let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(HttpResponse::new(
                200,
                format!(
                    r#"{{"access_token":"t{}","token_type":"Bearer","expires_in":86400}}"#,
                    n
                ),
            ));
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let (status, body) = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((200, r#"{"status":"success","data":{}}"#.to_string()));
        Ok(HttpResponse::new(status, body))
    }
}

fn gateway(broker: Arc<FakeBroker>, config: GatewayConfig) -> (Arc<RequestGateway>, Arc<CredentialManager>) {
    let credentials = Arc::new(CredentialManager::new(
        BrokerConfig::new("client", "key", "secret").with_base_url("http://broker.test"),
        broker.clone(),
    ));
    let gateway = Arc::new(RequestGateway::new(
        config,
        "http://broker.test",
        broker,
        credentials.clone(),
    ));
    (gateway, credentials)
}

fn config(max_concurrent: usize, min_interval_ms: u64, retry: RetryPolicy) -> GatewayConfig {
    GatewayConfig {
        max_concurrent,
        min_interval: Duration::from_millis(min_interval_ms),
        retry,
        queue_capacity: 256,
    }
}

#[tokio::test(start_paused = true)]
async fn test_dispatches_respect_minimum_spacing() {
    let broker = FakeBroker::new();
    let (gateway, _) = gateway(
        broker.clone(),
        config(usize::MAX, 500, RetryPolicy::new(0, Duration::from_millis(100))),
    );

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .get(endpoint::QUOTE, vec![("symbol".into(), format!("S{}", i))])
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut times: Vec<Instant> = broker.market_calls().iter().map(|c| c.at).collect();
    assert_eq!(times.len(), 100);
    times.sort();
    for pair in times.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_millis(500),
            "dispatches {:?} apart",
            pair[1] - pair[0]
        );
    }
    assert_eq!(gateway.stats().dispatched(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_spacing_holds_while_token_is_issued() {
    let broker = FakeBroker::with_token_latency(Duration::from_secs(1));
    let (gateway, _) = gateway(
        broker.clone(),
        config(usize::MAX, 500, RetryPolicy::new(0, Duration::from_millis(100))),
    );

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.get(endpoint::QUOTE, Vec::new()).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(broker.token_calls.load(Ordering::SeqCst), 1);
    let mut times: Vec<Instant> = broker.market_calls().iter().map(|c| c.at).collect();
    assert_eq!(times.len(), 3);
    times.sort();
    for pair in times.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_millis(500),
            "dispatches {:?} apart",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let broker = FakeBroker::with_latency(Duration::from_secs(1));
    let (gateway, _) = gateway(
        broker.clone(),
        config(2, 0, RetryPolicy::new(0, Duration::from_millis(100))),
    );

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.get(endpoint::INDICES, Vec::new()).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(broker.peak_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_invalidates_and_reauthenticates() {
    let broker = FakeBroker::new();
    let (gateway, credentials) = gateway(
        broker.clone(),
        config(1, 0, RetryPolicy::new(3, Duration::from_millis(100))),
    );

    broker.push(401, r#"{"status":"error","message":"token expired"}"#);
    let err = gateway.get(endpoint::QUOTE, Vec::new()).await.unwrap_err();
    assert!(matches!(err, FeedError::AuthExpired(_)));
    assert!(credentials.cached().await.is_none());

    gateway.get(endpoint::QUOTE, Vec::new()).await.unwrap();

    assert_eq!(
        broker.paths(),
        vec![endpoint::TOKEN, endpoint::QUOTE, endpoint::TOKEN, endpoint::QUOTE]
    );
    let market = broker.market_calls();
    assert_eq!(market[0].authorization.as_deref(), Some("Bearer t1"));
    assert_eq!(market[1].authorization.as_deref(), Some("Bearer t2"));
}

#[tokio::test(start_paused = true)]
async fn test_retries_with_exponential_backoff_then_fails() {
    let broker = FakeBroker::new();
    let (gateway, _) = gateway(
        broker.clone(),
        config(1, 0, RetryPolicy::new(3, Duration::from_millis(100))),
    );
    for _ in 0..4 {
        broker.push(429, "slow down");
    }

    let err = gateway.get(endpoint::QUOTE, Vec::new()).await.unwrap_err();
    assert_eq!(
        err,
        FeedError::TransientUpstream {
            status: Some(429),
            message: "slow down".into()
        }
    );

    let times: Vec<Instant> = broker.market_calls().iter().map(|c| c.at).collect();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    assert_eq!(gateway.stats().retried(), 3);
    assert_eq!(gateway.stats().failed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_then_success() {
    let broker = FakeBroker::new();
    let (gateway, _) = gateway(
        broker.clone(),
        config(1, 0, RetryPolicy::new(3, Duration::from_millis(100))),
    );
    broker.push(503, "");
    broker.push(504, "");
    broker.push(200, r#"{"status":"success","data":[1,2]}"#);

    let value = gateway.get(endpoint::SECTORS, Vec::new()).await.unwrap();
    assert_eq!(value["data"][1], 2);
    assert_eq!(broker.market_calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let broker = FakeBroker::new();
    let (gateway, _) = gateway(
        broker.clone(),
        config(1, 0, RetryPolicy::new(3, Duration::from_millis(100))),
    );
    broker.push(400, "bad symbol");

    let err = gateway
        .execute(HttpMethod::Post, endpoint::QUOTE, Some(serde_json::json!({})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Upstream { status: 400, .. }));
    assert_eq!(broker.market_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_broker_client_parses_quote() {
    let broker = FakeBroker::new();
    let (gateway, _) = gateway(
        broker.clone(),
        config(1, 0, RetryPolicy::new(0, Duration::from_millis(100))),
    );
    broker.push(
        200,
        r#"{"status":"success","data":{
            "last_price": 2456.5,
            "ohlc": {"open": 2440, "high": 2460, "low": 2430, "close": 2450},
            "volume": 1200
        }}"#,
    );

    let client = BrokerClient::new(gateway);
    let quote = client.quote("RELIANCE").await.unwrap();
    assert_eq!(quote.change, dec!(6.5));
    assert_eq!(quote.percent_change, dec!(0.27));
    assert_eq!(quote.volume, 1200);
}

#[tokio::test(start_paused = true)]
async fn test_broker_client_malformed_payload() {
    let broker = FakeBroker::new();
    let (gateway, _) = gateway(
        broker.clone(),
        config(1, 0, RetryPolicy::new(3, Duration::from_millis(100))),
    );
    broker.push(200, "<html>maintenance</html>");

    let client = BrokerClient::new(gateway);
    let err = client.market_summary().await.unwrap_err();
    assert!(matches!(err, FeedError::MalformedResponse { .. }));
    // 형식 오류는 재시도하지 않음
    assert_eq!(broker.market_calls().len(), 1);
}

//! 속도 제한 요청 게이트웨이.
//!
//! 모든 브로커 호출은 하나의 큐를 거칩니다. 디스패처는 다음을 보장합니다:
//! - 동시에 진행 중인 호출 수 ≤ `max_concurrent`
//! - 연속된 디스패치 사이 간격 ≥ `min_interval` (재시도 포함)
//!
//! 인증 헤더는 큐에 넣을 때가 아니라 시도마다 새로 받으며, 헤더를 받은 뒤에
//! 디스패치 슬롯을 배정받습니다.

use crate::auth::CredentialManager;
use crate::retry::{classify, AttemptOutcome, RetryPolicy};
use crate::transport::{HttpMethod, HttpRequest, HttpTransport};
use feed_core::{FeedError, FeedResult, GatewaySettings};
use metrics::counter;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, warn};

/// 게이트웨이 설정.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 동시에 진행 가능한 최대 호출 수
    pub max_concurrent: usize,
    /// 연속된 디스패치 간 최소 간격
    pub min_interval: Duration,
    /// 재시도 정책
    pub retry: RetryPolicy,
    /// 큐 용량
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_settings(&GatewaySettings::default())
    }
}

impl GatewayConfig {
    /// 게이트웨이 설정 섹션에서 생성합니다.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent.max(1),
            min_interval: settings.min_interval(),
            retry: RetryPolicy::from_settings(settings),
            queue_capacity: 1024,
        }
    }
}

/// 게이트웨이 통계.
#[derive(Debug, Default)]
pub struct GatewayStats {
    dispatched: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

impl GatewayStats {
    /// 실제로 전송된 요청 수 (재시도 포함).
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// 재시도 횟수.
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// 최종 실패한 호출 수.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// 큐에 대기 중인 호출.
struct QueuedCall {
    method: HttpMethod,
    endpoint: String,
    body: Option<Value>,
    params: Vec<(String, String)>,
    retry_count: u32,
    reply: oneshot::Sender<FeedResult<Value>>,
}

/// 디스패치 슬롯 배분기.
///
/// 각 호출자는 직전 슬롯 + `min_interval` 이후의 슬롯을 받습니다.
struct Pacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        sleep_until(slot).await;
    }
}

/// 워커가 공유하는 상태.
struct Dispatcher {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<CredentialManager>,
    semaphore: Arc<Semaphore>,
    pacer: Pacer,
    retry: RetryPolicy,
    stats: Arc<GatewayStats>,
}

/// 속도 제한 요청 게이트웨이.
pub struct RequestGateway {
    tx: mpsc::Sender<QueuedCall>,
    stats: Arc<GatewayStats>,
}

impl RequestGateway {
    /// 게이트웨이를 생성하고 디스패처 태스크를 시작합니다.
    ///
    /// tokio 런타임 안에서 호출해야 합니다.
    pub fn new(
        config: GatewayConfig,
        base_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<CredentialManager>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(GatewayStats::default());

        let dispatcher = Arc::new(Dispatcher {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
            credentials,
            semaphore: Arc::new(Semaphore::new(
                config.max_concurrent.clamp(1, Semaphore::MAX_PERMITS),
            )),
            pacer: Pacer::new(config.min_interval),
            retry: config.retry,
            stats: stats.clone(),
        });

        tokio::spawn(run_dispatcher(dispatcher, rx));

        Self { tx, stats }
    }

    /// 호출을 큐에 넣고 최종 결과를 기다립니다.
    pub async fn execute(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<Value>,
        params: Option<Vec<(String, String)>>,
    ) -> FeedResult<Value> {
        let (reply, rx) = oneshot::channel();
        let call = QueuedCall {
            method,
            endpoint: endpoint.to_string(),
            body,
            params: params.unwrap_or_default(),
            retry_count: 0,
            reply,
        };

        self.tx.send(call).await.map_err(|_| FeedError::Shutdown)?;
        rx.await.map_err(|_| FeedError::Shutdown)?
    }

    /// GET 호출.
    pub async fn get(&self, endpoint: &str, params: Vec<(String, String)>) -> FeedResult<Value> {
        self.execute(HttpMethod::Get, endpoint, None, Some(params))
            .await
    }

    /// 통계.
    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }
}

async fn run_dispatcher(dispatcher: Arc<Dispatcher>, mut rx: mpsc::Receiver<QueuedCall>) {
    while let Some(call) = rx.recv().await {
        let permit = match dispatcher.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        tokio::spawn(process(dispatcher.clone(), call, permit));
    }
    debug!("게이트웨이 디스패처 종료");
}

async fn process(dispatcher: Arc<Dispatcher>, mut call: QueuedCall, permit: OwnedSemaphorePermit) {
    let mut permit = Some(permit);

    let result = loop {
        if permit.is_none() {
            match dispatcher.semaphore.clone().acquire_owned().await {
                Ok(p) => permit = Some(p),
                Err(_) => break Err(FeedError::Shutdown),
            }
        }

        // 토큰 발급이 끝난 뒤에 슬롯을 받아야 간격이 유지됨
        let outcome = match dispatcher.credentials.ensure_valid().await {
            Ok(headers) => {
                dispatcher.pacer.wait_turn().await;
                attempt(&dispatcher, &call, headers).await
            }
            Err(e) => AttemptOutcome::from_error(e),
        };

        match outcome {
            AttemptOutcome::Success(value) => break Ok(value),
            AttemptOutcome::Terminal(err) => {
                if err.is_auth_error() {
                    dispatcher.credentials.invalidate().await;
                }
                break Err(err);
            }
            AttemptOutcome::Retryable(err) if dispatcher.retry.can_retry(call.retry_count) => {
                let delay = dispatcher.retry.backoff(call.retry_count);
                call.retry_count += 1;
                dispatcher.stats.retried.fetch_add(1, Ordering::Relaxed);
                counter!("feed_gateway_retries_total").increment(1);
                warn!(
                    endpoint = %call.endpoint,
                    error = %err,
                    retry = call.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "일시적 오류, 재시도 예정"
                );
                // 대기하는 동안 슬롯을 다른 호출에 양보
                permit = None;
                sleep(delay).await;
            }
            AttemptOutcome::Retryable(err) => {
                error!(endpoint = %call.endpoint, retries = call.retry_count, "재시도 한도 초과");
                break Err(err);
            }
        }
    };

    if let Err(e) = &result {
        dispatcher.stats.failed.fetch_add(1, Ordering::Relaxed);
        counter!("feed_gateway_failures_total", "kind" => e.kind()).increment(1);
    }

    drop(permit);
    let _ = call.reply.send(result);
}

async fn attempt(
    dispatcher: &Dispatcher,
    call: &QueuedCall,
    headers: HeaderMap,
) -> AttemptOutcome<Value> {
    let request = HttpRequest::new(call.method, format!("{}{}", dispatcher.base_url, call.endpoint))
        .with_headers(headers)
        .with_query(call.params.clone())
        .with_body(call.body.clone());

    dispatcher.stats.dispatched.fetch_add(1, Ordering::Relaxed);
    counter!("feed_gateway_dispatch_total").increment(1);
    debug!(endpoint = %call.endpoint, retry = call.retry_count, "요청 디스패치");

    match dispatcher.transport.send(request).await {
        Ok(response) => classify(&call.endpoint, &response),
        Err(e) => AttemptOutcome::from_error(e),
    }
}

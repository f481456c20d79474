//! 재시도 정책과 응답 분류.
//!
//! 429/503/504와 타임아웃만 재시도하며, 대기 시간은
//! `initial_backoff * 2^retry_count` (상한 `max_backoff`)입니다.

use crate::transport::HttpResponse;
use feed_core::{FeedError, GatewaySettings};
use serde_json::Value;
use std::time::Duration;

/// 재시도 대상 HTTP 상태 코드.
pub const RETRYABLE_STATUS: [u16; 3] = [429, 503, 504];

/// 재시도 정책.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 최대 재시도 횟수 (첫 시도 제외)
    pub max_retries: u32,
    /// 첫 재시도 대기 시간
    pub initial_backoff: Duration,
    /// 대기 시간 상한
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&GatewaySettings::default())
    }
}

impl RetryPolicy {
    /// 새 정책 생성.
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: Duration::from_secs(60),
        }
    }

    /// 대기 시간 상한 설정.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// 게이트웨이 설정에서 생성합니다.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// `retry_count`번째 재시도 전 대기 시간.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// 재시도 여유가 남았는지 확인합니다.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// 한 번의 시도 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T> {
    /// 성공
    Success(T),
    /// 재시도 가능한 실패
    Retryable(FeedError),
    /// 재시도하지 않는 실패
    Terminal(FeedError),
}

impl<T> AttemptOutcome<T> {
    /// 전송 계층 에러를 분류합니다.
    pub fn from_error(err: FeedError) -> Self {
        if err.is_retryable() {
            AttemptOutcome::Retryable(err)
        } else {
            AttemptOutcome::Terminal(err)
        }
    }
}

/// HTTP 응답을 분류합니다.
///
/// - 2xx: JSON 본문 파싱 (실패 시 `MalformedResponse`, 재시도 없음)
/// - 401: `AuthExpired`
/// - 429/503/504: `TransientUpstream` (재시도)
/// - 그 외: `Upstream`
pub fn classify(context: &str, response: &HttpResponse) -> AttemptOutcome<Value> {
    match response.status {
        status if (200..300).contains(&status) => {
            match serde_json::from_str::<Value>(&response.body) {
                Ok(value) => AttemptOutcome::Success(value),
                Err(_) => AttemptOutcome::Terminal(FeedError::malformed(context, &response.body)),
            }
        }
        401 => AttemptOutcome::Terminal(FeedError::AuthExpired(format!(
            "{} 요청이 거부됨 (401)",
            context
        ))),
        status if RETRYABLE_STATUS.contains(&status) => {
            AttemptOutcome::Retryable(FeedError::TransientUpstream {
                status: Some(status),
                message: truncate(&response.body),
            })
        }
        status => AttemptOutcome::Terminal(FeedError::Upstream {
            status,
            message: truncate(&response.body),
        }),
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

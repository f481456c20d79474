//! 시장 데이터 계층의 에러 타입.
//!
//! 하나의 업스트림 결과가 대기 중인 모든 호출자에게 공유되므로
//! `FeedError`는 `Clone`을 구현합니다.

use thiserror::Error;

/// 시장 데이터 계층 에러.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// 일시적인 업스트림 장애 (429/503/504, 타임아웃)
    #[error("일시적 업스트림 오류 (status={status:?}): {message}")]
    TransientUpstream {
        status: Option<u16>,
        message: String,
    },

    /// 자격증명이 만료되었거나 거부됨 (401)
    #[error("인증 만료: {0}")]
    AuthExpired(String),

    /// 모든 폴백 단계가 실패함
    #[error("데이터를 사용할 수 없음: {key} [{}]", .causes.join("; "))]
    DataUnavailable { key: String, causes: Vec<String> },

    /// 업스트림 응답을 해석할 수 없음
    #[error("잘못된 응답 ({context}): {shape}")]
    MalformedResponse { context: String, shape: String },

    /// 재시도 대상이 아닌 업스트림 오류
    #[error("업스트림 오류 (HTTP {status}): {message}")]
    Upstream { status: u16, message: String },

    /// 종목 디렉터리에 없는 심볼
    #[error("알 수 없는 심볼: {0}")]
    UnknownSymbol(String),

    /// 네트워크 연결 에러
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 영속 저장소 에러
    #[error("저장소 에러: {0}")]
    Store(String),

    /// 스트리밍 연결 에러
    #[error("스트림 에러: {0}")]
    Stream(String),

    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 요청 게이트웨이가 종료됨
    #[error("게이트웨이가 종료됨")]
    Shutdown,
}

/// 시장 데이터 작업을 위한 Result 타입.
pub type FeedResult<T> = Result<T, FeedError>;

impl FeedError {
    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::TransientUpstream { .. })
    }

    /// 인증 관련 에러인지 확인합니다.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, FeedError::AuthExpired(_))
    }

    /// 메트릭 레이블에 사용할 에러 종류.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::TransientUpstream { .. } => "transient_upstream",
            FeedError::AuthExpired(_) => "auth_expired",
            FeedError::DataUnavailable { .. } => "data_unavailable",
            FeedError::MalformedResponse { .. } => "malformed_response",
            FeedError::Upstream { .. } => "upstream",
            FeedError::UnknownSymbol(_) => "unknown_symbol",
            FeedError::Network(_) => "network",
            FeedError::Store(_) => "store",
            FeedError::Stream(_) => "stream",
            FeedError::Config(_) => "config",
            FeedError::Shutdown => "shutdown",
        }
    }

    /// 해석에 실패한 페이로드로부터 `MalformedResponse`를 생성합니다.
    ///
    /// 페이로드 내용이 아닌 구조만 기록합니다.
    pub fn malformed(context: impl Into<String>, body: &str) -> Self {
        FeedError::MalformedResponse {
            context: context.into(),
            shape: describe_shape(body),
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::MalformedResponse {
            context: "json".to_string(),
            shape: err.to_string(),
        }
    }
}

/// 페이로드의 구조를 요약합니다 (`object{a,b}`, `array[3]`, `non-json(12 bytes)`).
pub fn describe_shape(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).take(8).collect();
            format!("object{{{}}}", keys.join(","))
        }
        Ok(serde_json::Value::Array(items)) => format!("array[{}]", items.len()),
        Ok(serde_json::Value::String(_)) => "string".to_string(),
        Ok(serde_json::Value::Number(_)) => "number".to_string(),
        Ok(serde_json::Value::Bool(_)) => "bool".to_string(),
        Ok(serde_json::Value::Null) => "null".to_string(),
        Err(_) => format!("non-json({} bytes)", body.len()),
    }
}

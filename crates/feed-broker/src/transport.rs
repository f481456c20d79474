//! HTTP 전송 계층.
//!
//! 게이트웨이, 인증 관리자, 공개 데이터 클라이언트는 `reqwest`를 직접 쓰지 않고
//! `HttpTransport`를 통해 요청합니다.

use async_trait::async_trait;
use feed_core::{FeedError, FeedResult};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// HTTP 메서드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// 전송할 HTTP 요청.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    /// GET 요청 생성.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// 새 요청 생성.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    /// 헤더 추가.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// 쿼리 파라미터 설정.
    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    /// JSON 본문 설정.
    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    /// 쿼리 파라미터 값 조회.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP 응답 (상태 코드와 본문 원문).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// 새 응답 생성.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx 응답인지 확인합니다.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP 전송 트레이트.
///
/// 상태 코드와 관계없이 응답을 받으면 `Ok`를 반환하고, 연결 자체가 실패했을 때만
/// `Err`를 반환합니다.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> FeedResult<HttpResponse>;
}

/// `reqwest` 기반 전송.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 타임아웃이 지정된 전송 생성.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성에 실패하면 `FeedError::Network`를 반환합니다.
    pub fn new(timeout: Duration) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Network(format!("HTTP client 생성 실패: {}", e)))?;
        Ok(Self { client })
    }

    /// 기존 클라이언트로 생성.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> FeedResult<HttpResponse> {
        debug!(method = ?request.method, url = %request.url, "HTTP 요청");

        let mut builder = self
            .client
            .request(request.method.as_reqwest(), &request.url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse { status, body })
    }
}

/// `reqwest` 에러를 분류합니다. 타임아웃은 일시적 장애로 취급합니다.
pub fn map_reqwest_error(err: reqwest::Error) -> FeedError {
    if err.is_timeout() {
        FeedError::TransientUpstream {
            status: None,
            message: format!("timeout: {}", err),
        }
    } else {
        FeedError::Network(err.to_string())
    }
}

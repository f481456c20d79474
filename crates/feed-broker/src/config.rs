//! 브로커 API 설정.
//!
//! 브로커 API는 client_id와 client_secret을 사용한 OAuth 2.0 client credentials
//! 인증이 필요합니다. client_id가 없으면 브로커가 연결되지 않은 것으로 보고
//! 폴백 체인에서 브로커 단계를 건너뜁니다.

use chrono::Duration;
use feed_core::BrokerSettings;
use secrecy::{ExposeSecret, SecretString};

/// 브로커 API 설정.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// REST API 기본 URL
    pub base_url: String,
    /// 스트리밍 엔드포인트 URL
    pub stream_url: String,
    /// 클라이언트 ID
    pub client_id: String,
    /// API 키 (`x-api-key` 헤더)
    pub api_key: String,
    /// 클라이언트 시크릿
    pub client_secret: SecretString,
    /// 요청 타임아웃 (초)
    pub timeout_secs: u64,
    /// 만료 전 선제 갱신 임계값
    pub refresh_threshold: Duration,
}

impl BrokerConfig {
    /// 새로운 브로커 설정 생성.
    pub fn new(client_id: impl Into<String>, api_key: impl Into<String>, client_secret: impl Into<String>) -> Self {
        let defaults = BrokerSettings::default();
        Self {
            base_url: defaults.base_url,
            stream_url: defaults.stream_url,
            client_id: client_id.into(),
            api_key: api_key.into(),
            client_secret: SecretString::from(client_secret.into()),
            timeout_secs: defaults.timeout_secs,
            refresh_threshold: Duration::seconds(defaults.refresh_threshold_secs),
        }
    }

    /// REST 기본 URL 설정.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// 스트리밍 URL 설정.
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = url.into();
        self
    }

    /// 요청 타임아웃 설정.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// 선제 갱신 임계값 설정.
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    /// 애플리케이션 설정에서 생성합니다.
    ///
    /// `client_id`가 없으면 `None`(브로커 미연결)을 반환합니다.
    pub fn from_settings(settings: &BrokerSettings) -> Option<Self> {
        let client_id = settings.client_id.clone().filter(|id| !id.is_empty())?;
        let client_secret = settings
            .client_secret
            .clone()
            .unwrap_or_else(|| SecretString::from(String::new()));

        Some(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            stream_url: settings.stream_url.clone(),
            client_id,
            api_key: settings.api_key.clone().unwrap_or_default(),
            client_secret,
            timeout_secs: settings.timeout_secs,
            refresh_threshold: Duration::seconds(settings.refresh_threshold_secs),
        })
    }

    /// 환경 변수에서 설정 생성.
    ///
    /// # 환경 변수
    /// - 필수: `BROKER_CLIENT_ID`, `BROKER_CLIENT_SECRET`
    /// - 선택: `BROKER_API_KEY`, `BROKER_BASE_URL`, `BROKER_STREAM_URL`
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("BROKER_CLIENT_ID").ok()?;
        let client_secret = std::env::var("BROKER_CLIENT_SECRET").ok()?;
        let api_key = std::env::var("BROKER_API_KEY").unwrap_or_default();

        let mut config = Self::new(client_id, api_key, client_secret);
        if let Ok(url) = std::env::var("BROKER_BASE_URL") {
            config = config.with_base_url(url);
        }
        if let Ok(url) = std::env::var("BROKER_STREAM_URL") {
            config = config.with_stream_url(url);
        }
        Some(config)
    }

    /// 설정이 인증에 충분한지 확인합니다.
    pub fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.expose_secret().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = BrokerConfig::new("client", "key", "secret")
            .with_base_url("http://localhost:8080/")
            .with_timeout(3);

        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.timeout_secs, 3);
        assert!(config.has_credentials());
    }

    #[test]
    fn test_from_settings_without_client_id() {
        let settings = BrokerSettings::default();
        assert!(BrokerConfig::from_settings(&settings).is_none());

        let settings = BrokerSettings {
            client_id: Some("abc".to_string()),
            client_secret: Some(SecretString::from("s3cret".to_string())),
            ..Default::default()
        };
        let config = BrokerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.client_id, "abc");
        assert_eq!(config.refresh_threshold, Duration::seconds(300));
    }
}

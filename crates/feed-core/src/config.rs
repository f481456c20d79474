//! 설정 관리.
//!
//! 설정 파일(선택)과 `FEED__` 접두사 환경 변수에서 애플리케이션 설정을 로드합니다.
//! 예: `FEED__GATEWAY__MIN_INTERVAL_MS=500`

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 애플리케이션 설정.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// 브로커 설정
    #[serde(default)]
    pub broker: BrokerSettings,
    /// 요청 게이트웨이 설정
    #[serde(default)]
    pub gateway: GatewaySettings,
    /// 실시간 스트림 설정
    #[serde(default)]
    pub stream: StreamSettings,
    /// 보조 공개 데이터 제공자 설정
    #[serde(default)]
    pub secondary: SecondarySettings,
    /// 종목 디렉터리 설정
    #[serde(default)]
    pub directory: DirectorySettings,
    /// 영속 저장소 설정
    #[serde(default)]
    pub store: StoreSettings,
    /// 로깅 설정
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 브로커 REST/스트리밍 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// REST API 기본 URL
    pub base_url: String,
    /// 스트리밍 엔드포인트 URL
    pub stream_url: String,
    /// 클라이언트 ID (없으면 브로커 미연결로 간주)
    pub client_id: Option<String>,
    /// API 키
    pub api_key: Option<String>,
    /// 클라이언트 시크릿
    pub client_secret: Option<SecretString>,
    /// HTTP 요청 타임아웃 (초)
    pub timeout_secs: u64,
    /// 만료 전 선제 갱신 임계값 (초)
    pub refresh_threshold_secs: i64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.broker.example.com".to_string(),
            stream_url: "wss://stream.broker.example.com/ws".to_string(),
            client_id: None,
            api_key: None,
            client_secret: None,
            timeout_secs: 10,
            refresh_threshold_secs: 300,
        }
    }
}

/// 요청 게이트웨이 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// 동시에 진행 가능한 최대 요청 수
    pub max_concurrent: usize,
    /// 연속된 요청 간 최소 간격 (밀리초)
    pub min_interval_ms: u64,
    /// 최대 재시도 횟수
    pub max_retries: u32,
    /// 첫 재시도 대기 시간 (밀리초)
    pub initial_backoff_ms: u64,
    /// 재시도 대기 시간 상한 (밀리초)
    pub max_backoff_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            min_interval_ms: 350,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl GatewaySettings {
    /// 최소 요청 간격.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// 실시간 스트림 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    /// 최대 재연결 시도 횟수
    pub max_reconnect_attempts: u32,
    /// 재연결 시도 간 대기 시간 (초)
    pub reconnect_delay_secs: u64,
    /// 핑 전송 주기 (초)
    pub ping_interval_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_delay_secs: 5,
            ping_interval_secs: 30,
        }
    }
}

/// 보조 공개 데이터 제공자 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecondarySettings {
    /// 공개 API 기본 URL
    pub base_url: String,
    /// HTTP 요청 타임아웃 (초)
    pub timeout_secs: u64,
}

impl Default for SecondarySettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.nseindia.com/api".to_string(),
            timeout_secs: 10,
        }
    }
}

/// 종목 디렉터리 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// 종목 목록 CSV URL
    pub source_url: String,
    /// 캐시된 목록을 재사용하는 기간 (시간)
    pub refresh_hours: i64,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            source_url: "https://api.kite.trade/instruments".to_string(),
            refresh_hours: 24,
        }
    }
}

/// 영속 저장소 백엔드.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// 프로세스 메모리 (테스트/CLI 기본값)
    #[default]
    Memory,
    /// Redis 해시
    Redis,
}

/// 영속 저장소 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreSettings {
    /// 백엔드 종류
    #[serde(default)]
    pub backend: StoreBackend,
    /// Redis 연결 URL
    pub redis_url: Option<String>,
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 파일이 없으면 기본값과 환경 변수만 사용합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            // 환경 변수로 오버라이드
            .add_source(
                config::Environment::with_prefix("FEED")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> Result<Self, config::ConfigError> {
        Self::load("config/feed.toml")
    }
}

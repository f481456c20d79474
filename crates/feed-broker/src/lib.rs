//! 브로커 연동 및 업스트림 접근.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - `CredentialManager`: 브로커 접근 토큰 수명 주기 관리
//! - `RequestGateway`: 동시성 제한, 최소 간격, 지수 백오프 재시도를 적용한 요청 큐
//! - `BrokerClient`: 게이트웨이를 통한 브로커 시장 데이터 조회
//! - `PublicDataClient`: 거래소 공개 API (보조 제공자)
//! - `Multiplexer`: 실시간 시세 구독 다중화 및 재연결 시 재구독
//!
//! 모든 HTTP 호출은 `HttpTransport` 트레이트를 거치므로 테스트에서 교체할 수 있습니다.

pub mod auth;
pub mod client;
pub mod config;
pub mod gateway;
pub mod public;
pub mod retry;
pub mod stream;
pub mod transport;

pub use auth::{Credential, CredentialManager, CredentialState};
pub use client::BrokerClient;
pub use config::BrokerConfig;
pub use gateway::{GatewayConfig, GatewayStats, RequestGateway};
pub use public::PublicDataClient;
pub use retry::{AttemptOutcome, RetryPolicy};
pub use stream::{
    ConnectionState, ListenerId, Multiplexer, StreamConfig, StreamConnection, StreamConnector,
    TickCallback, WsConnector,
};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// 브로커 REST 엔드포인트.
pub mod endpoint {
    /// 접근 토큰 발급 (client credentials)
    pub const TOKEN: &str = "/oauth/token";
    /// 종목 시세
    pub const QUOTE: &str = "/market/quote";
    /// 옵션 체인
    pub const OPTION_CHAIN: &str = "/market/option-chain";
    /// 외국인/기관 매매 동향
    pub const FII_DII: &str = "/market/fii-dii";
    /// 섹터 지수
    pub const SECTORS: &str = "/market/sectors";
    /// 주요 지수
    pub const INDICES: &str = "/market/indices";
}

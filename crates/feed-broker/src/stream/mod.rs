//! 실시간 시세 스트림.
//!
//! - `Multiplexer`: 심볼별 리스너 관리, 재연결 시 재구독
//! - `WsConnector`: tokio-tungstenite 기반 WebSocket 연결
//!
//! 연결 자체는 `StreamConnector` 트레이트 뒤에 있으므로 테스트에서는 채널 기반
//! 가짜 연결을 사용할 수 있습니다.

mod multiplexer;
mod websocket;

pub use multiplexer::{ListenerId, Multiplexer, TickCallback};
pub use websocket::WsConnector;

use async_trait::async_trait;
use feed_core::{FeedResult, StreamSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 스트림 설정.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// 연속 실패 허용 횟수
    pub max_reconnect_attempts: u32,
    /// 재연결 시도 간 대기 시간
    pub reconnect_delay: Duration,
    /// 핑 전송 주기
    pub ping_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from_settings(&StreamSettings::default())
    }
}

impl StreamConfig {
    /// 스트림 설정 섹션에서 생성합니다.
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            max_reconnect_attempts: settings.max_reconnect_attempts.max(1),
            reconnect_delay: Duration::from_secs(settings.reconnect_delay_secs),
            ping_interval: Duration::from_secs(settings.ping_interval_secs.max(1)),
        }
    }
}

/// 수립된 연결의 양방향 채널.
///
/// `inbound`가 닫히면 연결이 끊긴 것으로 봅니다.
pub struct StreamConnection {
    /// 서버로 보낼 텍스트 메시지
    pub outbound: mpsc::UnboundedSender<String>,
    /// 서버에서 받은 텍스트 메시지
    pub inbound: mpsc::Receiver<String>,
}

/// 스트리밍 연결 생성기.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> FeedResult<StreamConnection>;
}

/// 구독 제어 메시지 (`{"action":"subscribe","symbols":[...]}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub symbols: Vec<String>,
}

/// 제어 동작.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

impl ControlMessage {
    /// 구독 메시지.
    pub fn subscribe(symbols: Vec<String>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            symbols,
        }
    }

    /// 구독 해지 메시지.
    pub fn unsubscribe(symbols: Vec<String>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            symbols,
        }
    }

    /// JSON 문자열로 직렬화.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "action": self.action,
            "symbols": self.symbols,
        })
        .to_string()
    }
}

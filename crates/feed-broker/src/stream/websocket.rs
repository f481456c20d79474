//! tokio-tungstenite 기반 WebSocket 연결기.

use super::{StreamConnection, StreamConnector};
use crate::auth::CredentialManager;
use async_trait::async_trait;
use feed_core::{FeedError, FeedResult};
use futures::{SinkExt, StreamExt};
use reqwest::header::AUTHORIZATION;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

/// 수신 버퍼 크기.
const INBOUND_BUFFER: usize = 1024;

/// WebSocket 연결기.
///
/// 자격증명 관리자가 있으면 연결 요청에 bearer 토큰을 붙입니다.
pub struct WsConnector {
    url: String,
    credentials: Option<Arc<CredentialManager>>,
    ping_interval: Duration,
}

impl WsConnector {
    /// 새 연결기 생성.
    pub fn new(url: impl Into<String>, ping_interval: Duration) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            ping_interval,
        }
    }

    /// 연결 시 브로커 토큰을 사용합니다.
    pub fn with_credentials(mut self, credentials: Arc<CredentialManager>) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> FeedResult<StreamConnection> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| FeedError::Config(format!("잘못된 스트림 URL {}: {}", self.url, e)))?;

        if let Some(credentials) = &self.credentials {
            let headers = credentials.ensure_valid().await?;
            if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                let value = HeaderValue::from_str(auth)
                    .map_err(|_| FeedError::Config("유효하지 않은 인증 헤더".to_string()))?;
                request.headers_mut().insert("authorization", value);
            }
        }

        info!(url = %self.url, "WebSocket 연결 중");
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| FeedError::Stream(format!("WebSocket 연결 실패: {}", e)))?;
        info!("WebSocket 연결 성공");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let (mut write, mut read) = ws_stream.split();
        let mut ping = interval(self.ping_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text).await.is_err() {
                                debug!("수신자가 종료됨");
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("서버에서 연결 종료 요청");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket 수신 에러");
                            break;
                        }
                        None => {
                            warn!("WebSocket 스트림 종료");
                            break;
                        }
                        _ => {}
                    },
                    out = outbound_rx.recv() => match out {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                error!(error = %e, "WebSocket 송신 실패");
                                break;
                            }
                        }
                        // 다중화기가 연결을 버림
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            error!(error = %e, "Ping 전송 실패");
                            break;
                        }
                    }
                }
            }
        });

        Ok(StreamConnection { outbound, inbound })
    }
}

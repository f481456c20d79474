//! 브로커 OAuth 자격증명 수명 주기.
//!
//! 처리 기능:
//! - 접근 토큰 발급 (POST /oauth/token, client credentials)
//! - 만료 임박 시 선제 갱신
//! - 401 수신 시 무효화 및 영속 사본 삭제
//! - 재시작 시 영속 저장소에서 토큰 복원
//!
//! 상태 전이: `Unauthenticated → Authenticating → Valid → (만료/401) → Unauthenticated`

use crate::config::BrokerConfig;
use crate::endpoint;
use crate::transport::{HttpMethod, HttpRequest, HttpTransport};
use chrono::{DateTime, Duration, Utc};
use feed_core::{FeedError, FeedResult, RecordStore};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// 자격증명을 저장하는 컬렉션.
pub const CREDENTIAL_COLLECTION: &str = "broker_credentials";

/// 토큰 응답.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// 만료 추적이 포함된 자격증명.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// 접근 토큰
    pub access_token: String,
    /// 토큰 타입
    pub token_type: String,
    /// 만료 시각
    pub expires_at: DateTime<Utc>,
    /// 발급 대상 클라이언트 ID
    pub client_id: String,
}

impl Credential {
    /// 토큰이 아직 유효한지 확인.
    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }

    /// 만료까지 남은 시간이 `threshold` 이하인지 확인.
    pub fn needs_refresh(&self, threshold: Duration) -> bool {
        self.expires_at <= Utc::now() + threshold
    }

    /// 인증 헤더 값 반환.
    pub fn auth_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// 자격증명 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// 토큰 없음 또는 만료
    Unauthenticated,
    /// 토큰 발급 중
    Authenticating,
    /// 유효한 토큰 보유
    Valid,
}

/// 브로커 자격증명 관리자.
///
/// `ensure_valid()`는 모든 요청 직전에 호출해도 안전하며, 동시에 호출되어도
/// 토큰 발급 요청은 한 번만 나갑니다.
pub struct CredentialManager {
    config: BrokerConfig,
    transport: Arc<dyn HttpTransport>,
    store: Option<Arc<dyn RecordStore>>,
    token: RwLock<Option<Credential>>,
    auth_lock: Mutex<()>,
    authenticating: AtomicBool,
    auth_count: AtomicU64,
}

impl CredentialManager {
    /// 새로운 자격증명 관리자 생성.
    pub fn new(config: BrokerConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config,
            transport,
            store: None,
            token: RwLock::new(None),
            auth_lock: Mutex::new(()),
            authenticating: AtomicBool::new(false),
            auth_count: AtomicU64::new(0),
        }
    }

    /// 토큰을 영속 저장소에 보관합니다.
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 설정 반환.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// 현재 상태.
    pub async fn state(&self) -> CredentialState {
        if self.authenticating.load(Ordering::SeqCst) {
            return CredentialState::Authenticating;
        }
        match &*self.token.read().await {
            Some(token) if token.is_valid() => CredentialState::Valid,
            _ => CredentialState::Unauthenticated,
        }
    }

    /// 지금까지 수행한 토큰 발급 횟수.
    pub fn authentication_count(&self) -> u64 {
        self.auth_count.load(Ordering::SeqCst)
    }

    /// 현재 캐시된 토큰 반환 (API 호출 없이).
    pub async fn cached(&self) -> Option<Credential> {
        self.token.read().await.clone()
    }

    /// 유효한 자격증명으로 인증 헤더를 생성합니다. 필요하면 토큰을 발급합니다.
    pub async fn ensure_valid(&self) -> FeedResult<HeaderMap> {
        if let Some(token) = self.fresh_token().await {
            return self.build_headers(&token);
        }

        let _guard = self.auth_lock.lock().await;

        // 대기하는 동안 다른 호출자가 발급을 마쳤을 수 있음
        if let Some(token) = self.fresh_token().await {
            return self.build_headers(&token);
        }

        let token = match self.authenticate().await {
            Ok(token) => token,
            Err(e) => {
                // 선제 갱신이 실패해도 기존 토큰이 아직 유효하면 계속 사용
                match self.cached().await.filter(Credential::is_valid) {
                    Some(old) if !e.is_auth_error() => {
                        warn!(error = %e, expires_at = %old.expires_at, "토큰 갱신 실패, 기존 토큰 사용");
                        old
                    }
                    _ => return Err(e),
                }
            }
        };
        self.build_headers(&token)
    }

    /// 현재 토큰을 즉시 무효화하고 영속 사본을 삭제합니다.
    pub async fn invalidate(&self) {
        let had_token = self.token.write().await.take().is_some();
        if had_token {
            warn!(client_id = %self.config.client_id, "브로커 토큰 무효화");
        }

        let Some(store) = &self.store else {
            return;
        };
        let client_id = json!(self.config.client_id);
        match store
            .get_by_field(CREDENTIAL_COLLECTION, "client_id", &client_id)
            .await
        {
            Ok(records) => {
                for record in records {
                    if let Err(e) = store.delete(CREDENTIAL_COLLECTION, &record.id).await {
                        warn!(error = %e, "영속 토큰 삭제 실패");
                    }
                }
            }
            Err(e) => warn!(error = %e, "영속 토큰 조회 실패"),
        }
    }

    /// 영속 저장소에서 유효한 토큰을 복원합니다.
    ///
    /// 복원했으면 `true`를 반환합니다.
    pub async fn restore(&self) -> FeedResult<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let records = store
            .get_by_field(CREDENTIAL_COLLECTION, "client_id", &json!(self.config.client_id))
            .await?;

        for record in records {
            match serde_json::from_value::<Credential>(record.data) {
                Ok(credential) if credential.is_valid() => {
                    info!(expires_at = %credential.expires_at, "저장된 브로커 토큰 복원");
                    *self.token.write().await = Some(credential);
                    return Ok(true);
                }
                Ok(credential) => {
                    debug!(expires_at = %credential.expires_at, "만료된 저장 토큰 무시");
                }
                Err(e) => warn!(error = %e, "저장된 토큰 형식 오류"),
            }
        }
        Ok(false)
    }

    async fn fresh_token(&self) -> Option<Credential> {
        self.token
            .read()
            .await
            .as_ref()
            .filter(|token| !token.needs_refresh(self.config.refresh_threshold))
            .cloned()
    }

    async fn authenticate(&self) -> FeedResult<Credential> {
        self.authenticating.store(true, Ordering::SeqCst);
        let result = self.request_token().await;
        self.authenticating.store(false, Ordering::SeqCst);

        let credential = result?;
        self.auth_count.fetch_add(1, Ordering::SeqCst);
        *self.token.write().await = Some(credential.clone());
        info!(
            client_id = %credential.client_id,
            expires_at = %credential.expires_at,
            "브로커 접근 토큰 발급"
        );

        self.persist(&credential).await;
        Ok(credential)
    }

    async fn request_token(&self) -> FeedResult<Credential> {
        if !self.config.has_credentials() {
            return Err(FeedError::Config(
                "브로커 client_id/client_secret이 설정되지 않았습니다".to_string(),
            ));
        }

        info!(client_id = %self.config.client_id, "브로커 접근 토큰 요청");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let request = HttpRequest::new(
            HttpMethod::Post,
            format!("{}{}", self.config.base_url, endpoint::TOKEN),
        )
        .with_headers(headers)
        .with_body(Some(json!({
            "grant_type": "client_credentials",
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret.expose_secret(),
        })));

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            error!(status = response.status, "토큰 요청 실패");
            return Err(match response.status {
                401 | 403 => FeedError::AuthExpired(format!(
                    "토큰 발급 거부 (HTTP {})",
                    response.status
                )),
                429 | 503 | 504 => FeedError::TransientUpstream {
                    status: Some(response.status),
                    message: "토큰 발급 일시 실패".to_string(),
                },
                status => FeedError::Upstream {
                    status,
                    message: response.body,
                },
            });
        }

        let token: TokenResponse = serde_json::from_str(&response.body)
            .map_err(|_| FeedError::malformed("token", &response.body))?;

        Ok(Credential {
            access_token: token.access_token,
            token_type: token.token_type,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
            client_id: self.config.client_id.clone(),
        })
    }

    async fn persist(&self, credential: &Credential) {
        let Some(store) = &self.store else {
            return;
        };
        let record = match serde_json::to_value(credential) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "토큰 직렬화 실패");
                return;
            }
        };
        if let Err(e) = store
            .upsert(
                CREDENTIAL_COLLECTION,
                "client_id",
                &json!(credential.client_id),
                record,
            )
            .await
        {
            warn!(error = %e, "토큰 저장 실패");
        }
    }

    /// 인증된 요청을 위한 공통 헤더 생성.
    fn build_headers(&self, token: &Credential) -> FeedResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&token.auth_header()).map_err(|_| {
                FeedError::Config("authorization 헤더에 유효하지 않은 문자 포함".to_string())
            })?,
        );
        if !self.config.api_key.is_empty() {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(&self.config.api_key).map_err(|_| {
                    FeedError::Config("api_key에 유효하지 않은 문자 포함".to_string())
                })?,
            );
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use async_trait::async_trait;
    use feed_core::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct TokenServer {
        calls: AtomicUsize,
        status: u16,
        expires_in: i64,
    }

    impl TokenServer {
        fn new(status: u16, expires_in: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status,
                expires_in,
            })
        }
    }

    #[async_trait]
    impl HttpTransport for TokenServer {
        async fn send(&self, request: HttpRequest) -> FeedResult<HttpResponse> {
            assert!(request.url.ends_with(endpoint::TOKEN));
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;
            Ok(HttpResponse::new(
                self.status,
                format!(
                    r#"{{"access_token":"token-{}","token_type":"Bearer","expires_in":{}}}"#,
                    n, self.expires_in
                ),
            ))
        }
    }

    fn config() -> BrokerConfig {
        BrokerConfig::new("client-1", "api-key", "secret").with_base_url("http://broker.test")
    }

    #[test]
    fn test_credential_expiry() {
        let credential = Credential {
            access_token: "abc".into(),
            token_type: "Bearer".into(),
            expires_at: Utc::now() + Duration::minutes(3),
            client_id: "c".into(),
        };
        assert!(credential.is_valid());
        assert!(credential.needs_refresh(Duration::minutes(5)));
        assert!(!credential.needs_refresh(Duration::minutes(1)));
        assert_eq!(credential.auth_header(), "Bearer abc");
    }

    #[tokio::test]
    async fn test_ensure_valid_authenticates_once() {
        let server = TokenServer::new(200, 3600);
        let manager = Arc::new(CredentialManager::new(config(), server.clone()));
        assert_eq!(manager.state().await, CredentialState::Unauthenticated);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_valid().await })
            })
            .collect();
        for handle in handles {
            let headers = handle.await.unwrap().unwrap();
            assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer token-1");
            assert_eq!(headers.get("x-api-key").unwrap(), "api-key");
        }

        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.authentication_count(), 1);
        assert_eq!(manager.state().await, CredentialState::Valid);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reauthentication() {
        let server = TokenServer::new(200, 3600);
        let manager = CredentialManager::new(config(), server.clone());

        manager.ensure_valid().await.unwrap();
        manager.invalidate().await;
        assert_eq!(manager.state().await, CredentialState::Unauthenticated);

        let headers = manager.ensure_valid().await.unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer token-2");
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed() {
        // 만료 60초 전, 임계값 300초 → 매번 갱신
        let server = TokenServer::new(200, 60);
        let manager = CredentialManager::new(config(), server.clone());

        manager.ensure_valid().await.unwrap();
        manager.ensure_valid().await.unwrap();
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = TokenServer::new(401, 3600);
        let manager = CredentialManager::new(config(), server);

        let err = manager.ensure_valid().await.unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(manager.state().await, CredentialState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_missing_secret_is_config_error() {
        let server = TokenServer::new(200, 3600);
        let manager = CredentialManager::new(BrokerConfig::new("client-1", "", ""), server.clone());

        let err = manager.ensure_valid().await.unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persist_restore_and_invalidate() {
        let store = Arc::new(MemoryStore::new());
        let server = TokenServer::new(200, 3600);

        let manager =
            CredentialManager::new(config(), server.clone()).with_store(store.clone());
        manager.ensure_valid().await.unwrap();
        manager.ensure_valid().await.unwrap();
        assert_eq!(store.count(CREDENTIAL_COLLECTION).await, 1);

        // 새 프로세스: 저장된 토큰 재사용
        let restored =
            CredentialManager::new(config(), server.clone()).with_store(store.clone());
        assert!(restored.restore().await.unwrap());
        let headers = restored.ensure_valid().await.unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer token-1");
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);

        restored.invalidate().await;
        assert_eq!(store.count(CREDENTIAL_COLLECTION).await, 0);

        let fresh = CredentialManager::new(config(), server).with_store(store);
        assert!(!fresh.restore().await.unwrap());
    }
}

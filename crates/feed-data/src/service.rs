//! UI용 시장 데이터 파사드.
//!
//! 화면은 이 서비스만 사용합니다. 조회는 데이터 종류별 코디네이터를 거치고,
//! 실시간 시세는 다중화기를 거칩니다.

use crate::cache::{CacheStats, Coordinator};
use crate::provider::{DirectoryService, MarketSource, SourceResolver};
use crate::storage::{RedisStore, SnapshotStore};
use feed_broker::{
    BrokerClient, BrokerConfig, ConnectionState, CredentialManager, GatewayConfig, HttpTransport,
    ListenerId, Multiplexer, PublicDataClient, ReqwestTransport, RequestGateway, StreamConfig,
    TickCallback, WsConnector,
};
use feed_core::{
    bare_symbol, AppConfig, CachePolicyTable, DataClass, DataKey, DirectoryRecord, FeedError,
    FeedResult, FiiDiiRow, MarketSummary, MemoryStore, OptionChain, Quote, RecordStore,
    SectorRow, StoreBackend,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// 검색 결과 기본 개수.
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// 시장 데이터 파사드.
pub struct MarketDataService {
    quotes: Coordinator<Quote>,
    chains: Coordinator<OptionChain>,
    flows: Coordinator<Vec<FiiDiiRow>>,
    sectors: Coordinator<Vec<SectorRow>>,
    market: Coordinator<MarketSummary>,
    directory: Arc<DirectoryService>,
    stream: Option<Arc<Multiplexer>>,
    search_limit: usize,
}

/// 파사드 빌더.
pub struct MarketDataServiceBuilder {
    policies: CachePolicyTable,
    store: Option<Arc<dyn RecordStore>>,
    primary: Option<Arc<dyn MarketSource>>,
    secondary: Option<Arc<dyn MarketSource>>,
    directory: Option<Arc<DirectoryService>>,
    stream: Option<Arc<Multiplexer>>,
    search_limit: usize,
}

impl Default for MarketDataServiceBuilder {
    fn default() -> Self {
        Self {
            policies: CachePolicyTable::default(),
            store: None,
            primary: None,
            secondary: None,
            directory: None,
            stream: None,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl MarketDataServiceBuilder {
    /// 캐시 정책 테이블.
    pub fn policies(mut self, policies: CachePolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// 스냅샷을 기록할 저장소.
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 1차 업스트림 (브로커). 연결 정보가 없으면 지정하지 않습니다.
    pub fn primary(mut self, source: Arc<dyn MarketSource>) -> Self {
        self.primary = Some(source);
        self
    }

    /// 2차 업스트림 (공개 API).
    pub fn secondary(mut self, source: Arc<dyn MarketSource>) -> Self {
        self.secondary = Some(source);
        self
    }

    pub fn directory(mut self, directory: Arc<DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// 실시간 시세 다중화기.
    pub fn stream(mut self, stream: Arc<Multiplexer>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit;
        self
    }

    fn coordinator<T>(&self) -> Coordinator<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        SourceResolver<dyn MarketSource>: crate::cache::Resolver<T>,
    {
        let mut builder = Coordinator::builder(self.policies.clone());
        if let Some(store) = &self.store {
            builder = builder.snapshots(SnapshotStore::new(store.clone()));
        }
        for source in [&self.primary, &self.secondary].into_iter().flatten() {
            builder = builder.resolver(SourceResolver::new(source.clone()));
        }
        builder.build()
    }

    pub fn build(self) -> FeedResult<MarketDataService> {
        let directory = self
            .directory
            .clone()
            .ok_or_else(|| FeedError::Config("종목 디렉터리가 지정되지 않음".to_string()))?;
        if self.primary.is_none() && self.secondary.is_none() {
            warn!("업스트림이 없음: 저장소 스냅샷으로만 조회합니다");
        }

        Ok(MarketDataService {
            quotes: self.coordinator(),
            chains: self.coordinator(),
            flows: self.coordinator(),
            sectors: self.coordinator(),
            market: self.coordinator(),
            directory,
            stream: self.stream,
            search_limit: self.search_limit,
        })
    }
}

impl MarketDataService {
    pub fn builder() -> MarketDataServiceBuilder {
        MarketDataServiceBuilder::default()
    }

    /// 설정으로 전체 구성 요소를 조립합니다.
    ///
    /// 브로커 클라이언트 ID가 없으면 브로커 단계와 실시간 스트림 없이 공개
    /// API만 사용합니다.
    pub async fn from_config(config: &AppConfig) -> FeedResult<Self> {
        let store: Arc<dyn RecordStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redis => {
                let url = config.store.redis_url.as_deref().ok_or_else(|| {
                    FeedError::Config("store.redis_url이 필요합니다".to_string())
                })?;
                Arc::new(RedisStore::connect(url).await?)
            }
        };

        let broker_transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
            Duration::from_secs(config.broker.timeout_secs),
        )?);
        let public_transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
            Duration::from_secs(config.secondary.timeout_secs),
        )?);

        let directory = Arc::new(DirectoryService::from_settings(
            &config.directory,
            public_transport.clone(),
            store.clone(),
        ));
        let public = Arc::new(PublicDataClient::new(
            config.secondary.base_url.clone(),
            public_transport,
        ));

        let mut builder = Self::builder()
            .store(store.clone())
            .directory(directory)
            .secondary(public);

        match BrokerConfig::from_settings(&config.broker) {
            Some(broker) => {
                let credentials = Arc::new(
                    CredentialManager::new(broker.clone(), broker_transport.clone())
                        .with_store(store),
                );
                if let Err(e) = credentials.restore().await {
                    warn!(error = %e, "저장된 브로커 토큰 복원 실패");
                }

                let gateway = Arc::new(RequestGateway::new(
                    GatewayConfig::from_settings(&config.gateway),
                    broker.base_url.clone(),
                    broker_transport,
                    credentials.clone(),
                ));
                let stream_config = StreamConfig::from_settings(&config.stream);
                let connector = WsConnector::new(broker.stream_url.clone(), stream_config.ping_interval)
                    .with_credentials(credentials);

                info!(client_id = %broker.client_id, "브로커 연결 구성");
                builder = builder
                    .primary(Arc::new(BrokerClient::new(gateway)))
                    .stream(Arc::new(Multiplexer::new(Arc::new(connector), stream_config)));
            }
            None => info!("브로커 클라이언트 ID 없음: 공개 API만 사용"),
        }

        builder.build()
    }

    /// 주요 지수 요약.
    #[instrument(skip(self))]
    pub async fn get_market_data(&self) -> FeedResult<Arc<MarketSummary>> {
        self.market.get(&DataKey::market_summary()).await
    }

    /// 섹터 지수.
    #[instrument(skip(self))]
    pub async fn get_sector_data(&self) -> FeedResult<Arc<Vec<SectorRow>>> {
        self.sectors.get(&DataKey::sectors()).await
    }

    /// 최근 `days`일 외국인/기관 매매 동향.
    #[instrument(skip(self))]
    pub async fn get_fii_dii_data(&self, days: u32) -> FeedResult<Arc<Vec<FiiDiiRow>>> {
        if days == 0 {
            return Err(FeedError::Config("days는 1 이상이어야 합니다".to_string()));
        }
        self.flows.get(&DataKey::fii_dii(days)).await
    }

    /// 종목 시세. `NSE:RELIANCE` 형식도 받습니다.
    #[instrument(skip(self))]
    pub async fn get_stock_data(&self, symbol: &str) -> FeedResult<Arc<Quote>> {
        let symbol = self.canonical_symbol(symbol, false).await?;
        self.quotes.get(&DataKey::quote(&symbol)).await
    }

    /// 옵션 체인. 만기를 생략하면 근월물입니다.
    #[instrument(skip(self))]
    pub async fn get_option_chain_data(
        &self,
        symbol: &str,
        expiry: Option<&str>,
    ) -> FeedResult<Arc<OptionChain>> {
        let symbol = self.canonical_symbol(symbol, true).await?;
        let expiry = expiry.map(str::trim).filter(|e| !e.is_empty());
        self.chains.get(&DataKey::option_chain(&symbol, expiry)).await
    }

    /// 종목 검색. 결과는 캐시하지 않습니다.
    #[instrument(skip(self))]
    pub async fn search_stocks(&self, query: &str) -> FeedResult<Vec<DirectoryRecord>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let index = self.directory.ensure_loaded().await?;
        Ok(index.search(query, self.search_limit))
    }

    /// 실시간 시세 구독.
    #[instrument(skip(self, callback))]
    pub async fn subscribe(&self, symbol: &str, callback: TickCallback) -> FeedResult<ListenerId> {
        let symbol = require_symbol(symbol)?;
        Ok(self.stream()?.subscribe(symbol, callback).await)
    }

    /// 구독 해지. `listener`가 없으면 심볼의 모든 리스너를 해지합니다.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, symbol: &str, listener: Option<ListenerId>) -> FeedResult<()> {
        self.stream()?.unsubscribe(symbol, listener).await;
        Ok(())
    }

    /// 실시간 스트림 연결을 시작합니다.
    pub async fn connect_stream(&self) -> FeedResult<()> {
        self.stream()?.connect().await;
        Ok(())
    }

    /// 실시간 스트림 연결을 종료합니다.
    pub async fn disconnect_stream(&self) -> FeedResult<()> {
        self.stream()?.disconnect().await;
        Ok(())
    }

    /// 실시간 스트림 상태. 스트림이 없으면 `Disconnected`입니다.
    pub fn stream_state(&self) -> ConnectionState {
        self.stream
            .as_ref()
            .map_or(ConnectionState::Disconnected, |s| s.state())
    }

    /// 디렉터리로 입력 심볼을 정식 심볼로 바꿉니다.
    ///
    /// 디렉터리가 아직 로드되지 않았으면 입력을 그대로 씁니다. 옵션 체인은
    /// 파생상품 기초자산 이름(NIFTY 등)도 허용합니다.
    async fn canonical_symbol(&self, symbol: &str, underlying: bool) -> FeedResult<String> {
        let symbol = require_symbol(symbol)?;
        let index = self.directory.index().await;
        if index.is_empty() {
            return Ok(bare_symbol(symbol));
        }
        if let Some(record) = index.resolve(symbol) {
            return Ok(record.symbol.clone());
        }
        let bare = bare_symbol(symbol);
        if underlying && index.is_underlying(&bare) {
            return Ok(bare);
        }
        Err(FeedError::UnknownSymbol(symbol.to_string()))
    }

    fn stream(&self) -> FeedResult<&Arc<Multiplexer>> {
        self.stream
            .as_ref()
            .ok_or_else(|| FeedError::Config("실시간 스트림이 구성되지 않음".to_string()))
    }

    /// 종목 디렉터리.
    pub fn directory(&self) -> &Arc<DirectoryService> {
        &self.directory
    }

    /// 캐시 항목 하나를 제거합니다.
    pub async fn invalidate(&self, key: &DataKey) -> bool {
        match key.class {
            DataClass::Quote => self.quotes.invalidate(key).await,
            DataClass::OptionChain => self.chains.invalidate(key).await,
            DataClass::FiiDii => self.flows.invalidate(key).await,
            DataClass::Sectors => self.sectors.invalidate(key).await,
            DataClass::MarketSummary => self.market.invalidate(key).await,
            DataClass::Search => false,
        }
    }

    /// 모든 메모리 캐시를 비웁니다. 저장소 스냅샷은 유지됩니다.
    pub async fn clear_cache(&self) {
        self.quotes.clear().await;
        self.chains.clear().await;
        self.flows.clear().await;
        self.sectors.clear().await;
        self.market.clear().await;
    }

    /// 데이터 종류별 캐시 통계.
    pub fn cache_stats(&self) -> Vec<(DataClass, CacheStats)> {
        vec![
            (DataClass::Quote, self.quotes.stats()),
            (DataClass::OptionChain, self.chains.stats()),
            (DataClass::FiiDii, self.flows.stats()),
            (DataClass::Sectors, self.sectors.stats()),
            (DataClass::MarketSummary, self.market.stats()),
        ]
    }
}

fn require_symbol(symbol: &str) -> FeedResult<&str> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(FeedError::Config("심볼이 비어 있습니다".to_string()));
    }
    Ok(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_broker::{HttpRequest, HttpResponse};

    struct Offline;

    #[async_trait::async_trait]
    impl HttpTransport for Offline {
        async fn send(&self, _request: HttpRequest) -> FeedResult<HttpResponse> {
            Err(FeedError::Network("offline".into()))
        }
    }

    fn service() -> MarketDataService {
        let directory = Arc::new(DirectoryService::new(
            "u",
            Arc::new(Offline),
            Arc::new(MemoryStore::new()),
        ));
        MarketDataService::builder()
            .directory(directory)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_directory() {
        let err = MarketDataService::builder().build().err().unwrap();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[tokio::test]
    async fn test_input_validation() {
        let service = service();
        assert!(matches!(
            service.get_stock_data("  ").await,
            Err(FeedError::Config(_))
        ));
        assert!(matches!(
            service.get_fii_dii_data(0).await,
            Err(FeedError::Config(_))
        ));
        assert!(service.search_stocks(" ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_operations_require_stream() {
        let service = service();
        let err = service
            .subscribe("NIFTY", Arc::new(|_: &feed_core::Tick| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
        assert_eq!(service.stream_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_no_upstream_is_data_unavailable() {
        let err = service().get_market_data().await.unwrap_err();
        assert!(matches!(err, FeedError::DataUnavailable { .. }));
    }
}

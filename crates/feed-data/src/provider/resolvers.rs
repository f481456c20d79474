//! 업스트림 클라이언트를 코디네이터 체인 단계로 연결합니다.
//!
//! `MarketSource`를 구현한 클라이언트는 `SourceResolver`로 감싸면 모든 시장
//! 데이터 종류의 `Resolver`가 됩니다.

use crate::cache::Resolver;
use async_trait::async_trait;
use feed_broker::{BrokerClient, PublicDataClient};
use feed_core::{
    DataKey, FeedError, FeedResult, FiiDiiRow, MarketSummary, OptionChain, Quote, SectorRow,
};
use std::sync::Arc;

/// 시장 데이터 업스트림.
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// 단계 이름.
    fn name(&self) -> &str;

    async fn quote(&self, symbol: &str) -> FeedResult<Quote>;

    async fn option_chain(&self, symbol: &str, expiry: Option<&str>) -> FeedResult<OptionChain>;

    async fn fii_dii(&self, days: u32) -> FeedResult<Vec<FiiDiiRow>>;

    async fn sectors(&self) -> FeedResult<Vec<SectorRow>>;

    async fn market_summary(&self) -> FeedResult<MarketSummary>;
}

#[async_trait]
impl MarketSource for BrokerClient {
    fn name(&self) -> &str {
        "broker"
    }

    async fn quote(&self, symbol: &str) -> FeedResult<Quote> {
        BrokerClient::quote(self, symbol).await
    }

    async fn option_chain(&self, symbol: &str, expiry: Option<&str>) -> FeedResult<OptionChain> {
        BrokerClient::option_chain(self, symbol, expiry).await
    }

    async fn fii_dii(&self, days: u32) -> FeedResult<Vec<FiiDiiRow>> {
        BrokerClient::fii_dii(self, days).await
    }

    async fn sectors(&self) -> FeedResult<Vec<SectorRow>> {
        BrokerClient::sectors(self).await
    }

    async fn market_summary(&self) -> FeedResult<MarketSummary> {
        BrokerClient::market_summary(self).await
    }
}

#[async_trait]
impl MarketSource for PublicDataClient {
    fn name(&self) -> &str {
        "public"
    }

    async fn quote(&self, symbol: &str) -> FeedResult<Quote> {
        PublicDataClient::quote(self, symbol).await
    }

    async fn option_chain(&self, symbol: &str, expiry: Option<&str>) -> FeedResult<OptionChain> {
        PublicDataClient::option_chain(self, symbol, expiry).await
    }

    async fn fii_dii(&self, days: u32) -> FeedResult<Vec<FiiDiiRow>> {
        PublicDataClient::fii_dii(self, days).await
    }

    async fn sectors(&self) -> FeedResult<Vec<SectorRow>> {
        PublicDataClient::sectors(self).await
    }

    async fn market_summary(&self) -> FeedResult<MarketSummary> {
        PublicDataClient::market_summary(self).await
    }
}

/// `MarketSource`를 체인 단계로 감쌉니다.
pub struct SourceResolver<S: ?Sized> {
    source: Arc<S>,
}

impl<S: MarketSource + ?Sized> SourceResolver<S> {
    pub fn new(source: Arc<S>) -> Arc<Self> {
        Arc::new(Self { source })
    }
}

fn invalid_key(key: &DataKey) -> FeedError {
    FeedError::Config(format!("키에 필요한 값이 없음: {}", key))
}

#[async_trait]
impl<S: MarketSource + ?Sized> Resolver<Quote> for SourceResolver<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn resolve(&self, key: &DataKey) -> FeedResult<Quote> {
        let symbol = key.symbol().ok_or_else(|| invalid_key(key))?;
        self.source.quote(symbol).await
    }
}

#[async_trait]
impl<S: MarketSource + ?Sized> Resolver<OptionChain> for SourceResolver<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn resolve(&self, key: &DataKey) -> FeedResult<OptionChain> {
        let symbol = key.symbol().ok_or_else(|| invalid_key(key))?;
        self.source.option_chain(symbol, key.expiry()).await
    }
}

#[async_trait]
impl<S: MarketSource + ?Sized> Resolver<Vec<FiiDiiRow>> for SourceResolver<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn resolve(&self, key: &DataKey) -> FeedResult<Vec<FiiDiiRow>> {
        let days = key.days().ok_or_else(|| invalid_key(key))?;
        self.source.fii_dii(days).await
    }
}

#[async_trait]
impl<S: MarketSource + ?Sized> Resolver<Vec<SectorRow>> for SourceResolver<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn resolve(&self, _key: &DataKey) -> FeedResult<Vec<SectorRow>> {
        self.source.sectors().await
    }
}

#[async_trait]
impl<S: MarketSource + ?Sized> Resolver<MarketSummary> for SourceResolver<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn resolve(&self, _key: &DataKey) -> FeedResult<MarketSummary> {
        self.source.market_summary().await
    }
}

//! 브로커 시장 데이터 클라이언트.
//!
//! 모든 요청은 `RequestGateway`를 통해 나가며, 응답은 다음 봉투 형식입니다:
//! `{"status": "success", "data": ...}` 또는 `{"status": "error", "message": ...}`

use crate::endpoint;
use crate::gateway::RequestGateway;
use chrono::{DateTime, NaiveDate, Utc};
use feed_core::{
    FeedError, FeedResult, FiiDiiRow, IndexSummary, MarketSummary, OptionChain, OptionLeg,
    OptionRow, Quote, SectorRow,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// 브로커 응답 봉투.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Ohlc {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
}

#[derive(Debug, Deserialize)]
struct BrokerQuote {
    last_price: Decimal,
    ohlc: Ohlc,
    net_change: Option<Decimal>,
    #[serde(default)]
    volume: u64,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct BrokerOptionLeg {
    last_price: Decimal,
    #[serde(default)]
    change: Decimal,
    #[serde(default)]
    oi: u64,
    #[serde(default)]
    oi_change: i64,
    #[serde(default)]
    volume: u64,
    iv: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct BrokerStrike {
    strike: Decimal,
    expiry: String,
    call: Option<BrokerOptionLeg>,
    put: Option<BrokerOptionLeg>,
}

#[derive(Debug, Deserialize)]
struct BrokerOptionChain {
    underlying_value: Decimal,
    strikes: Vec<BrokerStrike>,
}

#[derive(Debug, Deserialize)]
struct BrokerFlow {
    date: NaiveDate,
    category: String,
    buy_value: Decimal,
    sell_value: Decimal,
    net_value: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct BrokerIndex {
    name: String,
    last: Decimal,
    change: Decimal,
    percent_change: Decimal,
    #[serde(default)]
    open: Decimal,
    #[serde(default)]
    high: Decimal,
    #[serde(default)]
    low: Decimal,
    #[serde(default)]
    previous_close: Decimal,
    #[serde(default)]
    advances: u32,
    #[serde(default)]
    declines: u32,
}

impl From<BrokerOptionLeg> for OptionLeg {
    fn from(leg: BrokerOptionLeg) -> Self {
        OptionLeg {
            last_price: leg.last_price,
            change: leg.change,
            open_interest: leg.oi,
            change_in_oi: leg.oi_change,
            volume: leg.volume,
            implied_volatility: leg.iv,
        }
    }
}

/// 브로커 시장 데이터 클라이언트.
#[derive(Clone)]
pub struct BrokerClient {
    gateway: Arc<RequestGateway>,
}

impl BrokerClient {
    /// 새 클라이언트 생성.
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }

    /// 게이트웨이 참조.
    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    /// 종목 시세 조회.
    pub async fn quote(&self, symbol: &str) -> FeedResult<Quote> {
        let raw: BrokerQuote = self
            .fetch(endpoint::QUOTE, vec![("symbol".into(), symbol.to_string())])
            .await?;

        let change = raw
            .net_change
            .unwrap_or(raw.last_price - raw.ohlc.close);
        Ok(Quote {
            symbol: symbol.to_string(),
            last_price: raw.last_price,
            open: raw.ohlc.open,
            high: raw.ohlc.high,
            low: raw.ohlc.low,
            previous_close: raw.ohlc.close,
            change,
            percent_change: percent(change, raw.ohlc.close),
            volume: raw.volume,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
        })
    }

    /// 옵션 체인 조회.
    pub async fn option_chain(&self, symbol: &str, expiry: Option<&str>) -> FeedResult<OptionChain> {
        let mut params = vec![("symbol".to_string(), symbol.to_string())];
        if let Some(expiry) = expiry {
            params.push(("expiry".to_string(), expiry.to_string()));
        }
        let raw: BrokerOptionChain = self.fetch(endpoint::OPTION_CHAIN, params).await?;

        let mut rows: Vec<OptionRow> = raw
            .strikes
            .into_iter()
            .map(|s| OptionRow {
                strike: s.strike,
                expiry: s.expiry,
                call: s.call.map(Into::into),
                put: s.put.map(Into::into),
            })
            .collect();
        rows.sort_by(|a, b| a.strike.cmp(&b.strike));

        Ok(OptionChain {
            symbol: symbol.to_string(),
            expiry: expiry.map(str::to_string),
            underlying_value: raw.underlying_value,
            rows,
            timestamp: Utc::now(),
        })
    }

    /// 최근 `days`일의 FII/DII 매매 동향 조회.
    pub async fn fii_dii(&self, days: u32) -> FeedResult<Vec<FiiDiiRow>> {
        let raw: Vec<BrokerFlow> = self
            .fetch(endpoint::FII_DII, vec![("days".into(), days.to_string())])
            .await?;

        let mut rows: Vec<FiiDiiRow> = raw
            .into_iter()
            .map(|f| FiiDiiRow {
                date: f.date,
                net_value: f.net_value.unwrap_or(f.buy_value - f.sell_value),
                category: f.category,
                buy_value: f.buy_value,
                sell_value: f.sell_value,
            })
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.category.cmp(&b.category)));
        Ok(rows)
    }

    /// 섹터 지수 조회.
    pub async fn sectors(&self) -> FeedResult<Vec<SectorRow>> {
        let raw: Vec<BrokerIndex> = self.fetch(endpoint::SECTORS, Vec::new()).await?;
        Ok(raw
            .into_iter()
            .map(|i| SectorRow {
                name: i.name,
                last: i.last,
                change: i.change,
                percent_change: i.percent_change,
                advances: i.advances,
                declines: i.declines,
            })
            .collect())
    }

    /// 주요 지수 요약 조회.
    pub async fn market_summary(&self) -> FeedResult<MarketSummary> {
        let raw: Vec<BrokerIndex> = self.fetch(endpoint::INDICES, Vec::new()).await?;
        Ok(MarketSummary {
            indices: raw
                .into_iter()
                .map(|i| IndexSummary {
                    name: i.name,
                    last: i.last,
                    change: i.change,
                    percent_change: i.percent_change,
                    open: i.open,
                    high: i.high,
                    low: i.low,
                    previous_close: i.previous_close,
                })
                .collect(),
            as_of: Utc::now(),
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: Vec<(String, String)>,
    ) -> FeedResult<T> {
        let value = self.gateway.get(endpoint, params).await?;
        unwrap_envelope(endpoint, value)
    }
}

/// 봉투를 벗기고 `data`를 역직렬화합니다.
fn unwrap_envelope<T: DeserializeOwned>(context: &str, value: Value) -> FeedResult<T> {
    let shape = feed_core::describe_shape(&value.to_string());
    let envelope: Envelope<Value> = serde_json::from_value(value).map_err(|_| {
        FeedError::MalformedResponse {
            context: context.to_string(),
            shape: shape.clone(),
        }
    })?;

    if envelope.status != "success" {
        let message = envelope.message.unwrap_or_else(|| envelope.status.clone());
        error!(endpoint = context, message = %message, "브로커 오류 응답");
        return Err(FeedError::Upstream {
            status: 200,
            message,
        });
    }

    let data = envelope.data.ok_or_else(|| FeedError::MalformedResponse {
        context: context.to_string(),
        shape: shape.clone(),
    })?;

    serde_json::from_value(data).map_err(|e| {
        debug!(endpoint = context, error = %e, "응답 역직렬화 실패");
        FeedError::MalformedResponse {
            context: context.to_string(),
            shape,
        }
    })
}

fn percent(change: Decimal, base: Decimal) -> Decimal {
    if base.is_zero() {
        return Decimal::ZERO;
    }
    (change / base * Decimal::ONE_HUNDRED).round_dp(2)
}

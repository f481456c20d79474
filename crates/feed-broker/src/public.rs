//! 거래소 공개 데이터 API 클라이언트 (보조 제공자).
//!
//! 인증이 필요 없는 공개 엔드포인트를 사용하며 게이트웨이를 거치지 않습니다.
//! 숫자 필드가 문자열(`"1,234.50"`)이나 `"-"`로 오는 경우가 있어 값을 느슨하게 해석합니다.

use crate::transport::{HttpRequest, HttpTransport};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use feed_core::{
    FeedError, FeedResult, FiiDiiRow, IndexSummary, MarketSummary, OptionChain, OptionLeg,
    OptionRow, Quote, SectorRow,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// 지수 옵션으로 조회해야 하는 심볼.
const INDEX_SYMBOLS: [&str; 4] = ["NIFTY", "BANKNIFTY", "FINNIFTY", "MIDCPNIFTY"];

/// 공개 API 경로.
mod path {
    pub const QUOTE_EQUITY: &str = "/quote-equity";
    pub const OPTION_CHAIN_INDICES: &str = "/option-chain-indices";
    pub const OPTION_CHAIN_EQUITIES: &str = "/option-chain-equities";
    pub const FII_DII: &str = "/fiidiiTradeReact";
    pub const ALL_INDICES: &str = "/allIndices";
}

/// 공개 데이터 클라이언트.
#[derive(Clone)]
pub struct PublicDataClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
}

impl PublicDataClient {
    /// 새 클라이언트 생성.
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
        }
    }

    /// 종목 시세 조회.
    pub async fn quote(&self, symbol: &str) -> FeedResult<Quote> {
        let body = self
            .fetch(path::QUOTE_EQUITY, vec![("symbol", symbol.to_string())])
            .await?;
        parse_quote(symbol, &body).ok_or_else(|| FeedError::malformed("quote-equity", &body.to_string()))
    }

    /// 옵션 체인 조회. 지수는 지수 옵션 엔드포인트를 사용합니다.
    pub async fn option_chain(&self, symbol: &str, expiry: Option<&str>) -> FeedResult<OptionChain> {
        let path = if INDEX_SYMBOLS.contains(&symbol) {
            path::OPTION_CHAIN_INDICES
        } else {
            path::OPTION_CHAIN_EQUITIES
        };
        let body = self.fetch(path, vec![("symbol", symbol.to_string())]).await?;
        parse_option_chain(symbol, expiry, &body)
            .ok_or_else(|| FeedError::malformed("option-chain", &body.to_string()))
    }

    /// FII/DII 매매 동향 조회.
    ///
    /// 공개 API는 최근 거래일만 제공하므로 `days` 이내의 행만 반환합니다.
    pub async fn fii_dii(&self, days: u32) -> FeedResult<Vec<FiiDiiRow>> {
        let body = self.fetch(path::FII_DII, Vec::new()).await?;
        let mut rows =
            parse_fii_dii(&body).ok_or_else(|| FeedError::malformed("fii-dii", &body.to_string()))?;

        let mut dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
        dates.sort_unstable_by(|a, b| b.cmp(a));
        dates.dedup();
        if let Some(oldest) = dates.get(days.max(1) as usize - 1).or(dates.last()).copied() {
            rows.retain(|r| r.date >= oldest);
        }
        rows.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.category.cmp(&b.category)));
        Ok(rows)
    }

    /// 섹터 지수 조회.
    pub async fn sectors(&self) -> FeedResult<Vec<SectorRow>> {
        let body = self.fetch(path::ALL_INDICES, Vec::new()).await?;
        let indices =
            index_rows(&body).ok_or_else(|| FeedError::malformed("allIndices", &body.to_string()))?;
        Ok(indices
            .iter()
            .filter(|row| str_field(row, "key") == Some("SECTORAL INDICES"))
            .filter_map(parse_sector)
            .collect())
    }

    /// 주요 지수 요약 조회.
    pub async fn market_summary(&self) -> FeedResult<MarketSummary> {
        let body = self.fetch(path::ALL_INDICES, Vec::new()).await?;
        let indices =
            index_rows(&body).ok_or_else(|| FeedError::malformed("allIndices", &body.to_string()))?;
        Ok(MarketSummary {
            indices: indices
                .iter()
                .filter(|row| str_field(row, "key") == Some("BROAD MARKET INDICES"))
                .filter_map(parse_index)
                .collect(),
            as_of: Utc::now(),
        })
    }

    async fn fetch(&self, path: &str, params: Vec<(&str, String)>) -> FeedResult<Value> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (market-feed)"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let request = HttpRequest::get(format!("{}{}", self.base_url, path))
            .with_headers(headers)
            .with_query(params.into_iter().map(|(k, v)| (k.to_string(), v)).collect());

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            warn!(path, status = response.status, "공개 API 오류 응답");
            return Err(match response.status {
                429 | 503 | 504 => FeedError::TransientUpstream {
                    status: Some(response.status),
                    message: path.to_string(),
                },
                status => FeedError::Upstream {
                    status,
                    message: path.to_string(),
                },
            });
        }

        serde_json::from_str(&response.body).map_err(|_| {
            debug!(path, "공개 API 응답이 JSON이 아님");
            FeedError::malformed(path, &response.body)
        })
    }
}

/// 숫자 또는 숫자 문자열을 Decimal로 변환합니다.
fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        Value::String(s) => Decimal::from_str(&s.replace(',', "")).ok(),
        _ => None,
    }
}

fn dec_field(obj: &Value, field: &str) -> Option<Decimal> {
    obj.get(field).and_then(decimal)
}

fn dec_or_zero(obj: &Value, field: &str) -> Decimal {
    dec_field(obj, field).unwrap_or_default()
}

fn u64_or_zero(obj: &Value, field: &str) -> u64 {
    dec_field(obj, field)
        .and_then(|d| u64::try_from(d.trunc()).ok())
        .unwrap_or(0)
}

/// 범위를 넘는 값은 `u32::MAX`로 포화시킵니다.
fn u32_or_zero(obj: &Value, field: &str) -> u32 {
    u32::try_from(u64_or_zero(obj, field)).unwrap_or(u32::MAX)
}

fn str_field<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get(field).and_then(Value::as_str)
}

/// `16-Oct-2026` 형식 날짜.
fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d-%b-%Y").ok()
}

fn parse_quote(symbol: &str, body: &Value) -> Option<Quote> {
    let price = body.get("priceInfo")?;
    let last_price = dec_field(price, "lastPrice")?;
    let previous_close = dec_or_zero(price, "previousClose");
    let range = price.get("intraDayHighLow");

    let timestamp = body
        .get("metadata")
        .and_then(|m| str_field(m, "lastUpdateTime"))
        .and_then(|s| NaiveDateTime::parse_from_str(s, "%d-%b-%Y %H:%M:%S").ok())
        .and_then(|naive| Kolkata.from_local_datetime(&naive).single())
        .map(|ist| ist.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(Quote {
        symbol: symbol.to_string(),
        last_price,
        open: dec_or_zero(price, "open"),
        high: range.map(|r| dec_or_zero(r, "max")).unwrap_or_default(),
        low: range.map(|r| dec_or_zero(r, "min")).unwrap_or_default(),
        previous_close,
        change: dec_field(price, "change").unwrap_or(last_price - previous_close),
        percent_change: dec_or_zero(price, "pChange").round_dp(2),
        volume: body
            .get("securityWiseDP")
            .map(|dp| u64_or_zero(dp, "quantityTraded"))
            .unwrap_or(0),
        timestamp,
    })
}

fn parse_leg(leg: &Value) -> Option<OptionLeg> {
    Some(OptionLeg {
        last_price: dec_field(leg, "lastPrice")?,
        change: dec_or_zero(leg, "change"),
        open_interest: u64_or_zero(leg, "openInterest"),
        change_in_oi: dec_field(leg, "changeinOpenInterest")
            .and_then(|d| i64::try_from(d.trunc()).ok())
            .unwrap_or(0),
        volume: u64_or_zero(leg, "totalTradedVolume"),
        implied_volatility: dec_field(leg, "impliedVolatility"),
    })
}

fn parse_option_chain(symbol: &str, expiry: Option<&str>, body: &Value) -> Option<OptionChain> {
    let records = body.get("records")?;
    let data = records.get("data")?.as_array()?;

    let wanted = expiry.and_then(|e| {
        NaiveDate::parse_from_str(e, "%Y-%m-%d")
            .ok()
            .map(|d| d.format("%d-%b-%Y").to_string())
            .or_else(|| Some(e.to_string()))
    });

    let mut rows: Vec<OptionRow> = data
        .iter()
        .filter(|row| match &wanted {
            Some(w) => str_field(row, "expiryDate").is_some_and(|e| e.eq_ignore_ascii_case(w)),
            None => true,
        })
        .filter_map(|row| {
            Some(OptionRow {
                strike: dec_field(row, "strikePrice")?,
                expiry: str_field(row, "expiryDate")?.to_string(),
                call: row.get("CE").and_then(parse_leg),
                put: row.get("PE").and_then(parse_leg),
            })
        })
        .collect();
    rows.sort_by(|a, b| a.strike.cmp(&b.strike).then_with(|| a.expiry.cmp(&b.expiry)));

    Some(OptionChain {
        symbol: symbol.to_string(),
        expiry: expiry.map(str::to_string),
        underlying_value: dec_or_zero(records, "underlyingValue"),
        rows,
        timestamp: Utc::now(),
    })
}

fn parse_fii_dii(body: &Value) -> Option<Vec<FiiDiiRow>> {
    let rows = body.as_array()?;
    Some(
        rows.iter()
            .filter_map(|row| {
                let buy_value = dec_field(row, "buyValue")?;
                let sell_value = dec_field(row, "sellValue")?;
                Some(FiiDiiRow {
                    date: parse_date(str_field(row, "date")?)?,
                    category: str_field(row, "category")?
                        .trim_end_matches(|c: char| c == '*' || c.is_whitespace())
                        .to_string(),
                    buy_value,
                    sell_value,
                    net_value: dec_field(row, "netValue").unwrap_or(buy_value - sell_value),
                })
            })
            .collect(),
    )
}

fn index_rows(body: &Value) -> Option<&Vec<Value>> {
    body.get("data")?.as_array()
}

fn parse_sector(row: &Value) -> Option<SectorRow> {
    Some(SectorRow {
        name: str_field(row, "index")?.to_string(),
        last: dec_field(row, "last")?,
        change: dec_or_zero(row, "variation"),
        percent_change: dec_or_zero(row, "percentChange"),
        advances: u32_or_zero(row, "advances"),
        declines: u32_or_zero(row, "declines"),
    })
}

fn parse_index(row: &Value) -> Option<IndexSummary> {
    Some(IndexSummary {
        name: str_field(row, "index")?.to_string(),
        last: dec_field(row, "last")?,
        change: dec_or_zero(row, "variation"),
        percent_change: dec_or_zero(row, "percentChange"),
        open: dec_or_zero(row, "open"),
        high: dec_or_zero(row, "high"),
        low: dec_or_zero(row, "low"),
        previous_close: dec_or_zero(row, "previousClose"),
    })
}

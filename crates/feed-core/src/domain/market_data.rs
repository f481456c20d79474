//! 시장 데이터 타입 및 구조체.
//!
//! 이 모듈은 UI 계층에 전달되는 시장 데이터 타입을 정의합니다:
//! - `Quote` - 개별 종목 시세
//! - `OptionChain` - 행사가별 콜/풋 옵션 체인
//! - `FiiDiiRow` - 외국인/기관 투자자 순매수 동향
//! - `SectorRow` - 섹터 요약
//! - `MarketSummary` - 주요 지수 요약
//! - `Tick` - 스트리밍 체결 틱

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 개별 종목 시세.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// 종목 심볼
    pub symbol: String,
    /// 최근 체결가
    pub last_price: Decimal,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 전일 종가
    pub previous_close: Decimal,
    /// 전일 대비
    pub change: Decimal,
    /// 전일 대비 등락률 (%)
    pub percent_change: Decimal,
    /// 거래량
    pub volume: u64,
    /// 시세 시각
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// 상승 종목인지 확인합니다.
    pub fn is_up(&self) -> bool {
        self.change > Decimal::ZERO
    }
}

/// 옵션 한쪽(콜 또는 풋)의 시세.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionLeg {
    /// 최근 체결가
    pub last_price: Decimal,
    /// 전일 대비
    pub change: Decimal,
    /// 미결제약정
    pub open_interest: u64,
    /// 미결제약정 변화
    pub change_in_oi: i64,
    /// 거래량
    pub volume: u64,
    /// 내재 변동성
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_volatility: Option<Decimal>,
}

/// 옵션 체인의 한 행사가.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionRow {
    /// 행사가
    pub strike: Decimal,
    /// 만기일
    pub expiry: String,
    /// 콜 옵션
    pub call: Option<OptionLeg>,
    /// 풋 옵션
    pub put: Option<OptionLeg>,
}

/// 옵션 체인.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionChain {
    /// 기초자산 심볼
    pub symbol: String,
    /// 조회한 만기 (없으면 전체)
    pub expiry: Option<String>,
    /// 기초자산 가격
    pub underlying_value: Decimal,
    /// 행사가 오름차순 행
    pub rows: Vec<OptionRow>,
    /// 조회 시각
    pub timestamp: DateTime<Utc>,
}

impl OptionChain {
    /// 풋/콜 미결제약정 비율 (PCR).
    pub fn put_call_ratio(&self) -> Option<Decimal> {
        let (calls, puts) = self.rows.iter().fold((0u64, 0u64), |(c, p), row| {
            (
                c + row.call.as_ref().map_or(0, |leg| leg.open_interest),
                p + row.put.as_ref().map_or(0, |leg| leg.open_interest),
            )
        });
        if calls == 0 {
            return None;
        }
        Some(Decimal::from(puts) / Decimal::from(calls))
    }
}

/// 외국인/기관 투자자 매매 동향 한 행.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiiDiiRow {
    /// 거래일
    pub date: NaiveDate,
    /// 투자자 구분 (예: "FII/FPI", "DII")
    pub category: String,
    /// 매수 금액 (크로어 루피)
    pub buy_value: Decimal,
    /// 매도 금액
    pub sell_value: Decimal,
    /// 순매수 금액
    pub net_value: Decimal,
}

/// 섹터 요약.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectorRow {
    /// 섹터 지수 이름
    pub name: String,
    /// 현재 지수
    pub last: Decimal,
    /// 전일 대비
    pub change: Decimal,
    /// 등락률 (%)
    pub percent_change: Decimal,
    /// 상승 종목 수
    pub advances: u32,
    /// 하락 종목 수
    pub declines: u32,
}

/// 지수 요약.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    /// 지수 이름
    pub name: String,
    /// 현재 지수
    pub last: Decimal,
    /// 전일 대비
    pub change: Decimal,
    /// 등락률 (%)
    pub percent_change: Decimal,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 전일 종가
    pub previous_close: Decimal,
}

/// 주요 지수 요약.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSummary {
    /// 지수 목록
    pub indices: Vec<IndexSummary>,
    /// 기준 시각
    pub as_of: DateTime<Utc>,
}

impl MarketSummary {
    /// 이름으로 지수를 찾습니다.
    pub fn index(&self, name: &str) -> Option<&IndexSummary> {
        self.indices
            .iter()
            .find(|index| index.name.eq_ignore_ascii_case(name))
    }
}

/// 스트리밍 체결 틱.
///
/// 와이어 형식: `{symbol, lastPrice, open, high, low, close, volume, timestamp}`
/// (`timestamp`는 epoch 밀리초).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    /// 종목 심볼
    pub symbol: String,
    /// 최근 체결가
    pub last_price: Decimal,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 종가
    pub close: Decimal,
    /// 누적 거래량
    pub volume: u64,
    /// 체결 시각
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

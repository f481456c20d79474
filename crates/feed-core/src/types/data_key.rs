//! 캐시, 단일 비행(single-flight), 영속 저장소가 공유하는 데이터 키.
//!
//! 키는 `"<class>:<id>"` 형태로 표시됩니다 (예: `quote:RELIANCE`, `fii-dii:10d`).

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Asia::Kolkata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 데이터 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataClass {
    /// 개별 종목 시세
    Quote,
    /// 옵션 체인
    OptionChain,
    /// 외국인/기관 투자자 매매 동향
    FiiDii,
    /// 섹터 요약
    Sectors,
    /// 주요 지수 요약
    MarketSummary,
    /// 종목 검색
    Search,
}

impl DataClass {
    /// 모든 분류.
    pub const ALL: [DataClass; 6] = [
        DataClass::Quote,
        DataClass::OptionChain,
        DataClass::FiiDii,
        DataClass::Sectors,
        DataClass::MarketSummary,
        DataClass::Search,
    ];

    /// 키 접두사.
    pub fn prefix(&self) -> &'static str {
        match self {
            DataClass::Quote => "quote",
            DataClass::OptionChain => "option-chain",
            DataClass::FiiDii => "fii-dii",
            DataClass::Sectors => "sectors",
            DataClass::MarketSummary => "market",
            DataClass::Search => "search",
        }
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for DataClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataClass::ALL
            .into_iter()
            .find(|class| class.prefix() == s)
            .ok_or_else(|| format!("Unknown data class: {}", s))
    }
}

/// 데이터 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataKey {
    /// 데이터 분류
    pub class: DataClass,
    /// 분류 내 식별자
    pub id: String,
}

impl DataKey {
    /// 새 데이터 키 생성.
    pub fn new(class: DataClass, id: impl Into<String>) -> Self {
        Self {
            class,
            id: id.into(),
        }
    }

    /// 종목 시세 키. `NSE:RELIANCE`처럼 거래소가 붙은 입력은 심볼만 남깁니다.
    pub fn quote(symbol: &str) -> Self {
        Self::new(DataClass::Quote, bare_symbol(symbol))
    }

    /// 옵션 체인 키. 만기를 지정하지 않으면 근월물입니다.
    pub fn option_chain(symbol: &str, expiry: Option<&str>) -> Self {
        let symbol = bare_symbol(symbol);
        match expiry {
            Some(expiry) => Self::new(DataClass::OptionChain, format!("{}:{}", symbol, expiry)),
            None => Self::new(DataClass::OptionChain, symbol),
        }
    }

    /// 최근 `days`일 FII/DII 키.
    pub fn fii_dii(days: u32) -> Self {
        Self::new(DataClass::FiiDii, format!("{}d", days))
    }

    /// 섹터 요약 키.
    pub fn sectors() -> Self {
        Self::new(DataClass::Sectors, "all")
    }

    /// 지수 요약 키.
    pub fn market_summary() -> Self {
        Self::new(DataClass::MarketSummary, "all")
    }

    /// 검색 키.
    pub fn search(query: &str) -> Self {
        Self::new(DataClass::Search, query.trim().to_lowercase())
    }

    /// 키가 가리키는 종목 심볼 (시세/옵션 체인만 해당).
    pub fn symbol(&self) -> Option<&str> {
        match self.class {
            DataClass::Quote | DataClass::OptionChain => self.id.split(':').next(),
            _ => None,
        }
    }

    /// 옵션 체인 키의 만기.
    pub fn expiry(&self) -> Option<&str> {
        match self.class {
            DataClass::OptionChain => self.id.split_once(':').map(|(_, expiry)| expiry),
            _ => None,
        }
    }

    /// FII/DII 키의 조회 일수.
    pub fn days(&self) -> Option<u32> {
        match self.class {
            DataClass::FiiDii => self.id.strip_suffix('d').and_then(|d| d.parse().ok()),
            _ => None,
        }
    }

    /// 영속 저장소의 자연 키 (`<key>:<거래일>`).
    pub fn natural_key(&self, date: NaiveDate) -> String {
        format!("{}:{}", self, date)
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

impl FromStr for DataKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid data key: {}", s))?;
        if id.is_empty() {
            return Err(format!("Invalid data key: {}", s));
        }
        Ok(DataKey::new(prefix.parse()?, id))
    }
}

/// 거래소 접두사를 떼고 대문자로 바꾼 심볼 (`nse:reliance` → `RELIANCE`).
pub fn bare_symbol(symbol: &str) -> String {
    let symbol = symbol.trim();
    symbol
        .rsplit_once(':')
        .map_or(symbol, |(_, bare)| bare)
        .trim()
        .to_uppercase()
}

/// 주어진 시각의 거래일 (Asia/Kolkata 기준).
pub fn trading_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Kolkata).date_naive()
}

//! 종목 디렉터리 레코드.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 상장 종목 한 건.
///
/// 로드 후에는 변경되지 않으며 디렉터리는 갱신 시 통째로 재구성됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// 거래 심볼 (대문자)
    pub symbol: String,
    /// 종목명
    pub name: String,
    /// 거래소 (NSE, BSE, NFO ...)
    pub exchange: String,
    /// 브로커 상품 토큰
    pub instrument_token: u64,
    /// 거래 단위
    pub lot_size: u32,
    /// 호가 단위
    pub tick_size: Decimal,
    /// 상품 유형 (EQ, FUT, CE, PE ...)
    pub instrument_type: String,
    /// 파생상품 만기
    pub expiry: Option<NaiveDate>,
    /// 옵션 행사가
    pub strike: Option<Decimal>,
}

impl DirectoryRecord {
    /// 현물 주식인지 확인합니다.
    pub fn is_equity(&self) -> bool {
        self.instrument_type == "EQ"
    }
}

//! 시장 데이터 CLI 도구.
//!
//! 이 crate는 다음 기능을 제공합니다:
//! - 시세, 옵션 체인, FII/DII, 섹터, 지수 조회
//! - 종목 검색
//! - 실시간 시세 구독

pub mod commands;

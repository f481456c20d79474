//! 데이터 Provider 모듈.
//!
//! ## 종목 디렉터리
//! - `DirectoryService`: 종목 목록 CSV 다운로드, 저장소 캐시, 오래된 사본 폴백
//! - `DirectoryIndex`: 심볼 조회 (O(1)) 및 접두사 검색
//!
//! ## 업스트림 단계
//! - `MarketSource`: 브로커/공개 API 클라이언트 공통 인터페이스
//! - `SourceResolver`: `MarketSource`를 코디네이터 체인 단계로 연결

pub mod directory;
pub mod resolvers;

pub use directory::{parse_instruments, DirectoryIndex, DirectoryService, ParseOutcome};
pub use resolvers::{MarketSource, SourceResolver};

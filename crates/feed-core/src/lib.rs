//! # Feed Core
//!
//! 시장 데이터 접근 계층의 핵심 타입을 제공합니다.
//!
//! 이 크레이트는 다른 모든 feed 크레이트가 공유하는 기본 요소를 담고 있습니다:
//! - 시세, 옵션 체인, 섹터, FII/DII 등 시장 데이터 구조체
//! - 데이터 키와 캐시 정책 테이블
//! - 에러 분류 (`FeedError`)
//! - 영속 저장소 포트 (`RecordStore`)와 인메모리 구현
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod store;
pub mod types;

pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use store::{MemoryStore, RecordStore, StoredRecord};
pub use types::*;

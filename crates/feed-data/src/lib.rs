//! 시장 데이터 접근 계층.
//!
//! 이 crate는 다음을 제공합니다:
//! - TTL 캐시와 단일 비행(single-flight)을 갖춘 코디네이터
//! - 저장소 → 브로커 → 공개 API 폴백 체인
//! - 거래일 단위 스냅샷 저장 및 Redis 레코드 저장소
//! - 종목 디렉터리 인덱스
//! - UI용 `MarketDataService` 파사드

pub mod cache;
pub mod provider;
pub mod service;
pub mod storage;

pub use cache::{CacheStats, Coordinator, CoordinatorBuilder, Resolver};
pub use provider::{DirectoryIndex, DirectoryService, MarketSource, SourceResolver};
pub use service::{MarketDataService, MarketDataServiceBuilder};
pub use storage::{RedisStore, SnapshotStore};

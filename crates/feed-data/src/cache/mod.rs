//! 캐시/중복 제거 계층.
//!
//! - `Coordinator`: TTL 캐시, 단일 비행(single-flight), 폴백 체인
//! - `Resolver`: 체인의 한 단계 (브로커, 공개 데이터 제공자 ...)

mod coordinator;

pub use coordinator::{CacheStats, Coordinator, CoordinatorBuilder, Resolver};

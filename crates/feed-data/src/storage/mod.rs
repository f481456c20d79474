//! 영속 저장소.
//!
//! - `SnapshotStore`: 거래일 단위 시장 데이터 스냅샷
//! - `RedisStore`: Redis 해시 기반 `RecordStore` 구현

pub mod redis;
pub mod snapshot;

pub use self::redis::RedisStore;
pub use snapshot::SnapshotStore;

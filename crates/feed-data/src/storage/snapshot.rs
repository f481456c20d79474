//! 거래일 단위 시장 데이터 스냅샷.
//!
//! 스냅샷은 `<데이터 키>:<거래일>` 자연 키로 저장됩니다. 같은 날 같은 키를
//! 다시 저장하면 기존 레코드를 갱신하므로 레코드는 하나만 남습니다.

use chrono::{NaiveDate, Utc};
use feed_core::{DataKey, FeedError, FeedResult, RecordStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// 자연 키 필드명.
pub const NATURAL_KEY_FIELD: &str = "natural_key";

/// 스냅샷 저장소.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn RecordStore>,
}

impl SnapshotStore {
    /// 레코드 저장소 위에 스냅샷 저장소를 만듭니다.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// 데이터 분류별 컬렉션 이름.
    pub fn collection(key: &DataKey) -> String {
        format!("snapshot_{}", key.class.prefix().replace('-', "_"))
    }

    /// 해당 거래일의 스냅샷을 조회합니다.
    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &DataKey,
        date: NaiveDate,
    ) -> FeedResult<Option<T>> {
        let natural_key = key.natural_key(date);
        let records = self
            .store
            .get_by_field(&Self::collection(key), NATURAL_KEY_FIELD, &json!(natural_key))
            .await?;

        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let payload = record
            .data
            .get("payload")
            .cloned()
            .ok_or_else(|| FeedError::Store(format!("스냅샷에 payload 없음: {}", natural_key)))?;

        let value = serde_json::from_value(payload).map_err(|e| {
            FeedError::Store(format!("스냅샷 역직렬화 실패 {}: {}", natural_key, e))
        })?;
        debug!(key = %natural_key, "스냅샷 적중");
        Ok(Some(value))
    }

    /// 스냅샷을 저장합니다. 같은 자연 키가 있으면 갱신합니다.
    pub async fn save<T: Serialize>(
        &self,
        key: &DataKey,
        date: NaiveDate,
        value: &T,
    ) -> FeedResult<String> {
        let natural_key = key.natural_key(date);
        let payload = serde_json::to_value(value)
            .map_err(|e| FeedError::Store(format!("스냅샷 직렬화 실패: {}", e)))?;

        let record = json!({
            "natural_key": natural_key,
            "key": key.to_string(),
            "trading_date": date,
            "stored_at": Utc::now(),
            "payload": payload,
        });

        self.store
            .upsert(
                &Self::collection(key),
                NATURAL_KEY_FIELD,
                &Value::String(natural_key),
                record,
            )
            .await
    }
}

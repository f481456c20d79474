//! 영속 저장소 포트.
//!
//! 컬렉션 + 필드 기반의 범용 JSON 레코드 저장소입니다. 캐시 스냅샷,
//! 브로커 자격증명, 종목 디렉터리 캐시가 이 인터페이스를 통해 저장됩니다.

use crate::error::{FeedError, FeedResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// 저장된 레코드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// 저장소가 부여한 ID
    pub id: String,
    /// 레코드 본문 (JSON 객체)
    pub data: Value,
}

/// 범용 레코드 저장소.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 레코드를 생성하고 ID를 반환합니다.
    async fn create(&self, collection: &str, record: Value) -> FeedResult<String>;

    /// 레코드에 패치를 얕게 병합합니다.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> FeedResult<()>;

    /// 필드 값이 일치하는 레코드를 조회합니다.
    async fn get_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> FeedResult<Vec<StoredRecord>>;

    /// 레코드를 삭제합니다. 없는 ID는 무시합니다.
    async fn delete(&self, collection: &str, id: &str) -> FeedResult<()>;

    /// `field == value`인 레코드가 있으면 갱신하고 없으면 생성합니다.
    ///
    /// 같은 자연 키로 여러 번 기록해도 레코드는 하나만 남습니다.
    async fn upsert(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        record: Value,
    ) -> FeedResult<String> {
        let existing = self.get_by_field(collection, field, value).await?;
        match existing.into_iter().next() {
            Some(found) => {
                self.update(collection, &found.id, record).await?;
                Ok(found.id)
            }
            None => self.create(collection, record).await,
        }
    }
}

/// 얕은 병합: `patch`의 최상위 필드로 `target`을 덮어씁니다.
pub fn merge_patch(target: &mut Value, patch: Value) -> FeedResult<()> {
    let Value::Object(fields) = patch else {
        return Err(FeedError::Store("patch must be a JSON object".to_string()));
    };
    match target {
        Value::Object(existing) => {
            existing.extend(fields);
            Ok(())
        }
        other => {
            *other = Value::Object(fields);
            Ok(())
        }
    }
}

/// 프로세스 메모리 저장소.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Map<String, Value>>>>,
}

impl MemoryStore {
    /// 빈 저장소 생성.
    pub fn new() -> Self {
        Self::default()
    }

    /// 컬렉션의 레코드 수.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, collection: &str, record: Value) -> FeedResult<String> {
        let Value::Object(fields) = record else {
            return Err(FeedError::Store("record must be a JSON object".to_string()));
        };
        let id = uuid::Uuid::new_v4().to_string();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> FeedResult<()> {
        let Value::Object(fields) = patch else {
            return Err(FeedError::Store("patch must be a JSON object".to_string()));
        };
        let mut collections = self.collections.write().await;
        let record = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| FeedError::Store(format!("{}/{} not found", collection, id)))?;
        record.extend(fields);
        Ok(())
    }

    async fn get_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> FeedResult<Vec<StoredRecord>> {
        let collections = self.collections.read().await;
        let Some(records) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter(|(_, data)| data.get(field) == Some(value))
            .map(|(id, data)| StoredRecord {
                id: id.clone(),
                data: Value::Object(data.clone()),
            })
            .collect())
    }

    async fn delete(&self, collection: &str, id: &str) -> FeedResult<()> {
        if let Some(records) = self.collections.write().await.get_mut(collection) {
            records.remove(id);
        }
        Ok(())
    }
}

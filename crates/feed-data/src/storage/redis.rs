//! Redis 레코드 저장소.
//!
//! 컬렉션마다 하나의 해시(`<prefix>:<collection>`)를 두고, 해시 필드는 레코드 ID,
//! 값은 JSON 문서입니다. 필드 조회는 컬렉션 전체를 읽어 필터링합니다.

use async_trait::async_trait;
use feed_core::store::merge_patch;
use feed_core::{FeedError, FeedResult, RecordStore, StoredRecord};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, RedisError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// 기본 키 접두사.
const DEFAULT_PREFIX: &str = "feed";

fn store_error(err: RedisError) -> FeedError {
    FeedError::Store(err.to_string())
}

/// Redis 해시 기반 레코드 저장소.
#[derive(Clone)]
pub struct RedisStore {
    connection: Arc<RwLock<MultiplexedConnection>>,
    prefix: String,
}

impl RedisStore {
    /// Redis에 연결합니다.
    pub async fn connect(url: &str) -> FeedResult<Self> {
        info!("Connecting to Redis...");

        let client = Client::open(url).map_err(store_error)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)?;

        info!("Redis connection established");

        Ok(Self {
            connection: Arc::new(RwLock::new(connection)),
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// 키 접두사를 변경합니다.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Redis 상태를 확인합니다.
    pub async fn health_check(&self) -> FeedResult<bool> {
        let mut conn = self.connection.write().await;
        let result: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(store_error)?;

        Ok(result == "PONG")
    }

    fn collection_key(&self, collection: &str) -> String {
        format!("{}:{}", self.prefix, collection)
    }

    async fn read(&self, collection: &str, id: &str) -> FeedResult<Option<Value>> {
        let mut conn = self.connection.write().await;
        let raw: Option<String> = conn
            .hget(self.collection_key(collection), id)
            .await
            .map_err(store_error)?;

        raw.map(|json| parse_document(&json)).transpose()
    }

    async fn write(&self, collection: &str, id: &str, document: &Value) -> FeedResult<()> {
        let json = serde_json::to_string(document)
            .map_err(|e| FeedError::Store(format!("직렬화 실패: {}", e)))?;
        let mut conn = self.connection.write().await;
        let _: () = conn
            .hset(self.collection_key(collection), id, json)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

fn parse_document(json: &str) -> FeedResult<Value> {
    serde_json::from_str(json).map_err(|e| FeedError::Store(format!("손상된 레코드: {}", e)))
}

/// 문서의 `field` 값이 `value`와 같은지 확인합니다.
fn matches_field(document: &Value, field: &str, value: &Value) -> bool {
    document.get(field) == Some(value)
}

#[async_trait]
impl RecordStore for RedisStore {
    #[instrument(skip(self, record))]
    async fn create(&self, collection: &str, record: Value) -> FeedResult<String> {
        if !record.is_object() {
            return Err(FeedError::Store("record must be a JSON object".to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.write(collection, &id, &record).await?;
        debug!(collection, id = %id, "레코드 생성");
        Ok(id)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, collection: &str, id: &str, patch: Value) -> FeedResult<()> {
        let mut document = self
            .read(collection, id)
            .await?
            .ok_or_else(|| FeedError::Store(format!("{}에 레코드 {} 없음", collection, id)))?;
        merge_patch(&mut document, patch)?;
        self.write(collection, id, &document).await
    }

    async fn get_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> FeedResult<Vec<StoredRecord>> {
        let all: HashMap<String, String> = {
            let mut conn = self.connection.write().await;
            conn.hgetall(self.collection_key(collection))
                .await
                .map_err(store_error)?
        };

        let mut records = Vec::new();
        for (id, json) in all {
            let data = parse_document(&json)?;
            if matches_field(&data, field, value) {
                records.push(StoredRecord { id, data });
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn delete(&self, collection: &str, id: &str) -> FeedResult<()> {
        let mut conn = self.connection.write().await;
        let _: i64 = conn
            .hdel(self.collection_key(collection), id)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

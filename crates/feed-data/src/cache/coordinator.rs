//! 캐시/중복 제거 코디네이터.
//!
//! # 동작 흐름
//!
//! ```text
//! get(key)
//!     │
//!     ▼
//! ┌────────────────────┐
//! │ 1. 신선한 캐시?     │── YES ──▶ 즉시 반환 (I/O 없음)
//! └─────────┬──────────┘
//!           │ NO
//! ┌─────────▼──────────┐
//! │ 2. 진행 중인 요청?  │── YES ──▶ 같은 future 대기
//! └─────────┬──────────┘
//!           │ NO
//! ┌─────────▼──────────┐
//! │ 3. 해결 태스크 생성 │  저장소 → 브로커 → 보조 제공자
//! └─────────┬──────────┘
//!           │
//! ┌─────────▼──────────┐
//! │ 4. 캐시/저장 후     │  진행 중 항목 제거, 모든 대기자에게 전달
//! │    결과 공유        │
//! └────────────────────┘
//! ```
//!
//! 해결은 별도 태스크에서 실행되므로 호출자가 대기를 중단해도 취소되지 않고
//! 결과는 다음 호출자를 위해 캐시됩니다.

use crate::storage::SnapshotStore;
use async_trait::async_trait;
use chrono::Utc;
use feed_core::{trading_date, CachePolicy, CachePolicyTable, DataKey, FeedError, FeedResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// 폴백 체인의 한 단계.
#[async_trait]
pub trait Resolver<T>: Send + Sync {
    /// 로그와 실패 원인에 쓰이는 단계 이름.
    fn name(&self) -> &str;

    /// 키에 해당하는 값을 가져옵니다.
    async fn resolve(&self, key: &DataKey) -> FeedResult<T>;
}

/// 호출자가 넘긴 일회성 로더.
type Loader<T> = BoxFuture<'static, FeedResult<T>>;

/// 모든 대기자가 공유하는 해결 결과.
type SharedResolution<T> = Shared<BoxFuture<'static, Result<Arc<T>, FeedError>>>;

struct CacheEntry<T> {
    value: Arc<T>,
    stored_at: Instant,
}

struct CacheState<T> {
    entries: HashMap<DataKey, CacheEntry<T>>,
    in_flight: HashMap<DataKey, SharedResolution<T>>,
}

/// 캐시 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// 진행 중인 요청에 합류한 호출 수
    pub coalesced: u64,
    /// 실제로 실행된 해결 수
    pub resolutions: u64,
    /// 저장소 스냅샷으로 해결된 수
    pub store_hits: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    resolutions: AtomicU64,
    store_hits: AtomicU64,
}

struct Inner<T> {
    policies: CachePolicyTable,
    snapshots: Option<SnapshotStore>,
    chain: Vec<Arc<dyn Resolver<T>>>,
    state: Mutex<CacheState<T>>,
    counters: Counters,
}

/// 데이터 종류 하나에 대한 캐시/중복 제거 코디네이터.
pub struct Coordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// 코디네이터 빌더.
pub struct CoordinatorBuilder<T> {
    policies: CachePolicyTable,
    snapshots: Option<SnapshotStore>,
    chain: Vec<Arc<dyn Resolver<T>>>,
}

impl<T> CoordinatorBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// 스냅샷 저장소를 체인 맨 앞에 둡니다. 영속 분류에만 사용됩니다.
    pub fn snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// 체인 끝에 단계를 추가합니다.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver<T>>) -> Self {
        self.chain.push(resolver);
        self
    }

    pub fn build(self) -> Coordinator<T> {
        Coordinator {
            inner: Arc::new(Inner {
                policies: self.policies,
                snapshots: self.snapshots,
                chain: self.chain,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                }),
                counters: Counters::default(),
            }),
        }
    }
}

impl<T> Coordinator<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// 빌더를 시작합니다.
    pub fn builder(policies: CachePolicyTable) -> CoordinatorBuilder<T> {
        CoordinatorBuilder {
            policies,
            snapshots: None,
            chain: Vec::new(),
        }
    }

    /// 빈 체인의 코디네이터. 값은 `get_with` 로더로만 해결됩니다.
    pub fn new(policies: CachePolicyTable) -> Self {
        Self::builder(policies).build()
    }

    /// 구성된 단계 이름 (저장소 제외).
    pub fn stages(&self) -> Vec<String> {
        self.inner.chain.iter().map(|r| r.name().to_string()).collect()
    }

    /// 구성된 체인으로 값을 가져옵니다.
    pub async fn get(&self, key: &DataKey) -> FeedResult<Arc<T>> {
        self.get_inner(key, || None).await
    }

    /// 체인 뒤에 호출자 로더를 붙여 값을 가져옵니다.
    ///
    /// 로더는 이 호출이 해결을 시작할 때만 실행됩니다. 이미 진행 중인
    /// 요청이 있으면 그 결과를 공유합니다.
    pub async fn get_with<F, Fut>(&self, key: &DataKey, loader: F) -> FeedResult<Arc<T>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = FeedResult<T>> + Send + 'static,
    {
        self.get_inner(key, move || Some(loader().boxed())).await
    }

    async fn get_inner<L>(&self, key: &DataKey, make_loader: L) -> FeedResult<Arc<T>>
    where
        L: FnOnce() -> Option<Loader<T>> + Send,
    {
        let policy = self.inner.policies.policy(key.class);
        let resolution = {
            let mut state = self.inner.state.lock().await;

            if let Some(ttl) = policy.ttl {
                if let Some(entry) = state.entries.get(key) {
                    if entry.stored_at.elapsed() < ttl {
                        self.record(key, "hit", &self.inner.counters.hits);
                        return Ok(entry.value.clone());
                    }
                    debug!(key = %key, "만료된 캐시 항목 제거");
                    state.entries.remove(key);
                }
            }

            if let Some(pending) = state.in_flight.get(key) {
                self.record(key, "coalesced", &self.inner.counters.coalesced);
                pending.clone()
            } else {
                self.record(key, "miss", &self.inner.counters.misses);
                let loader = make_loader();
                let resolution = spawn_resolution(self.inner.clone(), key.clone(), policy, loader);
                state.in_flight.insert(key.clone(), resolution.clone());
                resolution
            }
        };

        resolution.await
    }

    fn record(&self, key: &DataKey, outcome: &'static str, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "feed_cache_requests_total",
            "class" => key.class.prefix(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// 캐시 항목 하나를 제거합니다. 진행 중인 요청에는 영향이 없습니다.
    pub async fn invalidate(&self, key: &DataKey) -> bool {
        self.inner.state.lock().await.entries.remove(key).is_some()
    }

    /// 모든 캐시 항목을 제거합니다.
    pub async fn clear(&self) {
        self.inner.state.lock().await.entries.clear();
    }

    /// 캐시 항목 수 (만료 항목 포함).
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// 캐시가 비었는지 확인합니다.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 캐시 통계를 반환합니다.
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let coalesced = c.coalesced.load(Ordering::Relaxed);
        let total = hits + misses + coalesced;
        let hit_rate = if total > 0 {
            (hits + coalesced) as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            coalesced,
            resolutions: c.resolutions.load(Ordering::Relaxed),
            store_hits: c.store_hits.load(Ordering::Relaxed),
            hit_rate,
        }
    }
}

/// 해결 태스크를 띄우고 공유 가능한 핸들을 돌려줍니다.
fn spawn_resolution<T>(
    inner: Arc<Inner<T>>,
    key: DataKey,
    policy: CachePolicy,
    loader: Option<Loader<T>>,
) -> SharedResolution<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    inner.counters.resolutions.fetch_add(1, Ordering::Relaxed);
    let task_inner = inner.clone();
    let task_key = key.clone();
    let span = feed_core::feed_span!("resolve", key);
    let handle = tokio::spawn(
        async move {
            let result = run_chain(&task_inner, &task_key, policy, loader).await;

            // 진행 중 항목 제거와 캐시 기록은 같은 락 아래에서
            let mut state = task_inner.state.lock().await;
            state.in_flight.remove(&task_key);
            if let (Ok(value), Some(_)) = (&result, policy.ttl) {
                state.entries.insert(
                    task_key,
                    CacheEntry {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
            result
        }
        .instrument(span),
    );

    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                inner.state.lock().await.in_flight.remove(&key);
                Err(FeedError::DataUnavailable {
                    key: key.to_string(),
                    causes: vec![format!("resolution task failed: {}", e)],
                })
            }
        }
    }
    .boxed()
    .shared()
}

/// 저장소 → 구성된 단계들 → 호출자 로더 순서로 시도합니다.
async fn run_chain<T>(
    inner: &Inner<T>,
    key: &DataKey,
    policy: CachePolicy,
    loader: Option<Loader<T>>,
) -> Result<Arc<T>, FeedError>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut causes = Vec::new();
    let date = trading_date(Utc::now());
    let snapshots = inner.snapshots.as_ref().filter(|_| policy.persist);

    if let Some(snapshots) = snapshots {
        match snapshots.load::<T>(key, date).await {
            Ok(Some(value)) => {
                inner.counters.store_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "저장소 스냅샷으로 해결");
                return Ok(Arc::new(value));
            }
            Ok(None) => causes.push("store: miss".to_string()),
            Err(e) => {
                warn!(key = %key, error = %e, "스냅샷 조회 실패");
                causes.push(format!("store: {}", e));
            }
        }
    }

    let mut resolved = None;
    for stage in &inner.chain {
        match stage.resolve(key).await {
            Ok(value) => {
                info!(key = %key, stage = stage.name(), "데이터 해결");
                resolved = Some(value);
                break;
            }
            Err(e) => {
                warn!(key = %key, stage = stage.name(), error = %e, "단계 실패, 다음 단계 시도");
                causes.push(format!("{}: {}", stage.name(), e));
            }
        }
    }

    if resolved.is_none() {
        if let Some(loader) = loader {
            match loader.await {
                Ok(value) => resolved = Some(value),
                Err(e) => {
                    warn!(key = %key, error = %e, "로더 실패");
                    causes.push(format!("loader: {}", e));
                }
            }
        }
    }

    let Some(value) = resolved else {
        return Err(FeedError::DataUnavailable {
            key: key.to_string(),
            causes,
        });
    };

    if let Some(snapshots) = snapshots {
        if let Err(e) = snapshots.save(key, date, &value).await {
            warn!(key = %key, error = %e, "스냅샷 저장 실패");
        }
    }
    Ok(Arc::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_core::{DataClass, MemoryStore, RecordStore, StoredRecord};
    use serde_json::Value;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Price(u32);

    /// 호출 횟수를 세는 단계.
    struct Counting {
        name: &'static str,
        calls: AtomicUsize,
        result: FeedResult<Price>,
        delay: Duration,
    }

    impl Counting {
        fn ok(name: &'static str, value: u32) -> Arc<Self> {
            Self::build(name, Ok(Price(value)), Duration::ZERO)
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Self::build(
                name,
                Err(FeedError::Upstream {
                    status: 500,
                    message: "boom".into(),
                }),
                Duration::ZERO,
            )
        }

        fn build(name: &'static str, result: FeedResult<Price>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                result,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolver<Price> for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn resolve(&self, _key: &DataKey) -> FeedResult<Price> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result.clone()
        }
    }

    fn quote_key() -> DataKey {
        DataKey::quote("X")
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_collapses_concurrent_callers() {
        let stage = Counting::build("broker", Ok(Price(42)), Duration::from_millis(200));
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .resolver(stage.clone())
            .build();

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.get(&quote_key()).await })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(stage.calls(), 1);
        assert!(values.iter().all(|v| **v == Price(42)));
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        let stats = coordinator.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 49);
        assert_eq!(stats.resolutions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_with_loader() {
        let coordinator: Coordinator<Price> = Coordinator::new(CachePolicyTable::default());
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let coordinator = coordinator.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    coordinator
                        .get_with(&quote_key(), move || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Price(7))
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(*handle.await.unwrap().unwrap(), Price(7));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let ttl = Duration::from_secs(60);
        let stage = Counting::ok("broker", 1);
        let policies =
            CachePolicyTable::empty().with(DataClass::Quote, CachePolicy::ephemeral(ttl));
        let coordinator = Coordinator::<Price>::builder(policies).resolver(stage.clone()).build();

        coordinator.get(&quote_key()).await.unwrap();
        assert_eq!(stage.calls(), 1);

        tokio::time::advance(ttl - Duration::from_millis(1)).await;
        coordinator.get(&quote_key()).await.unwrap();
        assert_eq!(stage.calls(), 1);
        assert_eq!(coordinator.stats().hits, 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        coordinator.get(&quote_key()).await.unwrap();
        assert_eq!(stage.calls(), 2);
    }

    #[tokio::test]
    async fn test_store_hit_skips_upstream() {
        let memory = Arc::new(MemoryStore::new());
        let snapshots = SnapshotStore::new(memory.clone());
        snapshots
            .save(&quote_key(), trading_date(Utc::now()), &Price(99))
            .await
            .unwrap();

        let broker = Counting::ok("broker", 1);
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .snapshots(snapshots)
            .resolver(broker.clone())
            .build();

        assert_eq!(*coordinator.get(&quote_key()).await.unwrap(), Price(99));
        assert_eq!(broker.calls(), 0);
        assert_eq!(coordinator.stats().store_hits, 1);

        // 캐시에서 바로 반환
        assert_eq!(*coordinator.get(&quote_key()).await.unwrap(), Price(99));
        assert_eq!(coordinator.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back_to_secondary_once() {
        let memory = Arc::new(MemoryStore::new());
        let broker = Counting::failing("broker");
        let public = Counting::ok("public", 5);
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .snapshots(SnapshotStore::new(memory.clone()))
            .resolver(broker.clone())
            .resolver(public.clone())
            .build();

        assert_eq!(*coordinator.get(&quote_key()).await.unwrap(), Price(5));
        assert_eq!(broker.calls(), 1);
        assert_eq!(public.calls(), 1);
        assert_eq!(coordinator.stages(), vec!["broker", "public"]);

        // 영속 분류이므로 스냅샷이 저장됨
        assert_eq!(memory.count("snapshot_quote").await, 1);
    }

    #[tokio::test]
    async fn test_all_stages_failing_is_data_unavailable() {
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .resolver(Counting::failing("broker"))
            .resolver(Counting::failing("public"))
            .build();

        let err = coordinator.get(&quote_key()).await.unwrap_err();
        match err {
            FeedError::DataUnavailable { key, causes } => {
                assert_eq!(key, "quote:X");
                assert_eq!(causes.len(), 2);
                assert!(causes[0].starts_with("broker:"));
                assert!(causes[1].starts_with("public:"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // 실패는 캐시되지 않고 진행 중 항목도 남지 않음
        assert!(coordinator.is_empty().await);
        assert!(coordinator.get(&quote_key()).await.is_err());
        assert_eq!(coordinator.stats().resolutions, 2);
    }

    #[tokio::test]
    async fn test_ephemeral_class_is_not_persisted() {
        let memory = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .snapshots(SnapshotStore::new(memory.clone()))
            .resolver(Counting::ok("broker", 3))
            .build();

        coordinator.get(&DataKey::market_summary()).await.unwrap();
        assert_eq!(memory.count("snapshot_market").await, 0);
    }

    /// 읽기는 비어 있고 쓰기는 항상 실패하는 저장소.
    struct ReadOnlyStore {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for ReadOnlyStore {
        async fn create(&self, _collection: &str, _record: Value) -> FeedResult<String> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::Store("read-only".into()))
        }

        async fn update(&self, _collection: &str, _id: &str, _patch: Value) -> FeedResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::Store("read-only".into()))
        }

        async fn get_by_field(
            &self,
            _collection: &str,
            _field: &str,
            _value: &Value,
        ) -> FeedResult<Vec<StoredRecord>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _collection: &str, _id: &str) -> FeedResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_write_failure_does_not_fail_read() {
        let store = Arc::new(ReadOnlyStore {
            writes: AtomicUsize::new(0),
        });
        let stage = Counting::ok("broker", 11);
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .snapshots(SnapshotStore::new(store.clone()))
            .resolver(stage.clone())
            .build();

        let value = coordinator.get(&quote_key()).await.unwrap();
        assert_eq!(*value, Price(11));
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);

        // 저장 실패와 무관하게 메모리 캐시에는 들어감
        let again = coordinator.get(&quote_key()).await.unwrap();
        assert!(Arc::ptr_eq(&value, &again));
        assert_eq!(stage.calls(), 1);
        assert_eq!(coordinator.len().await, 1);
    }

    #[tokio::test]
    async fn test_uncached_class_resolves_every_time() {
        let stage = Counting::ok("directory", 1);
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .resolver(stage.clone())
            .build();

        coordinator.get(&DataKey::search("rel")).await.unwrap();
        coordinator.get(&DataKey::search("rel")).await.unwrap();
        assert_eq!(stage.calls(), 2);
        assert!(coordinator.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_forces_resolution() {
        let stage = Counting::ok("broker", 1);
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .resolver(stage.clone())
            .build();

        coordinator.get(&quote_key()).await.unwrap();
        assert!(coordinator.invalidate(&quote_key()).await);
        coordinator.get(&quote_key()).await.unwrap();
        assert_eq!(stage.calls(), 2);

        coordinator.clear().await;
        assert!(coordinator.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_cancel_resolution() {
        let stage = Counting::build("broker", Ok(Price(8)), Duration::from_millis(100));
        let coordinator = Coordinator::<Price>::builder(CachePolicyTable::default())
            .resolver(stage.clone())
            .build();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.get(&quote_key()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*coordinator.get(&quote_key()).await.unwrap(), Price(8));
        assert_eq!(stage.calls(), 1);
    }
}

//! 종목 디렉터리.
//!
//! 브로커가 배포하는 종목 목록 CSV로 심볼 조회/검색 인덱스를 만듭니다.
//!
//! ## CSV 형식
//! ```csv
//! instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
//! 738561,2885,RELIANCE,"RELIANCE INDUSTRIES",0,,0,0.05,1,EQ,NSE,NSE
//! ```
//!
//! 다운로드에 성공한 목록은 저장소(`directory_cache`)에 보관되며, 24시간 이내의
//! 사본이 있으면 다운로드하지 않습니다. 다운로드가 실패하면 오래된 사본이라도
//! 사용합니다.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use feed_broker::{HttpRequest, HttpTransport};
use feed_core::{DirectoryRecord, DirectorySettings, FeedError, FeedResult, RecordStore};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// 디렉터리 캐시 컬렉션.
pub const DIRECTORY_COLLECTION: &str = "directory_cache";

/// 현물 거래소 우선순위 (같은 심볼이 여러 거래소에 있을 때).
const PREFERRED_EXCHANGE: &str = "NSE";

/// CSV 파싱 결과.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<DirectoryRecord>,
    /// 짧거나 형식이 잘못되어 건너뛴 행 수
    pub skipped: usize,
}

/// CSV 라인을 필드로 분리합니다. 따옴표 안의 쉼표와 `""` 이스케이프를 처리합니다.
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// 헤더 이름 → 열 위치.
struct Columns {
    token: usize,
    symbol: usize,
    name: Option<usize>,
    expiry: Option<usize>,
    strike: Option<usize>,
    tick_size: Option<usize>,
    lot_size: Option<usize>,
    instrument_type: Option<usize>,
    exchange: usize,
    width: usize,
}

impl Columns {
    fn from_header(header: &[String]) -> Option<Self> {
        let find = |name: &str| header.iter().position(|h| h.trim() == name);
        Some(Self {
            token: find("instrument_token")?,
            symbol: find("tradingsymbol")?,
            name: find("name"),
            expiry: find("expiry"),
            strike: find("strike"),
            tick_size: find("tick_size"),
            lot_size: find("lot_size"),
            instrument_type: find("instrument_type"),
            exchange: find("exchange")?,
            width: header.len(),
        })
    }

    fn record(&self, fields: &[String]) -> Option<DirectoryRecord> {
        if fields.len() < self.width {
            return None;
        }
        let get = |idx: Option<usize>| idx.map(|i| fields[i].trim()).unwrap_or("");

        let symbol = fields[self.symbol].trim().to_uppercase();
        let exchange = fields[self.exchange].trim().to_uppercase();
        if symbol.is_empty() || exchange.is_empty() {
            return None;
        }
        let instrument_token = fields[self.token].trim().parse().ok()?;

        let lot_size = match get(self.lot_size) {
            "" => 1,
            raw => raw.parse().ok()?,
        };
        let tick_size = match get(self.tick_size) {
            "" => Decimal::ZERO,
            raw => Decimal::from_str(raw).ok()?,
        };
        let expiry = match get(self.expiry) {
            "" => None,
            raw => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?),
        };
        let strike = match get(self.strike) {
            "" => None,
            raw => Some(Decimal::from_str(raw).ok()?).filter(|s| !s.is_zero()),
        };

        Some(DirectoryRecord {
            symbol,
            name: get(self.name).to_string(),
            exchange,
            instrument_token,
            lot_size,
            tick_size,
            instrument_type: get(self.instrument_type).to_uppercase(),
            expiry,
            strike,
        })
    }
}

/// 종목 목록 CSV를 파싱합니다. 첫 줄은 헤더입니다.
pub fn parse_instruments(content: &str) -> FeedResult<ParseOutcome> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .map(parse_csv_line)
        .ok_or_else(|| FeedError::malformed("instruments csv", content))?;
    let columns = Columns::from_header(&header)
        .ok_or_else(|| FeedError::malformed("instruments csv header", &header.join(",")))?;

    let mut outcome = ParseOutcome::default();
    for line in lines {
        match columns.record(&parse_csv_line(line)) {
            Some(record) => outcome.records.push(record),
            None => outcome.skipped += 1,
        }
    }
    Ok(outcome)
}

/// 불변 종목 인덱스. 갱신 시 통째로 다시 만듭니다.
#[derive(Debug, Default)]
pub struct DirectoryIndex {
    records: Vec<DirectoryRecord>,
    /// 심볼 → 대표 레코드 (NSE 우선)
    by_symbol: HashMap<String, usize>,
    /// `거래소:심볼` → 레코드
    by_qualified: HashMap<String, usize>,
    /// 파생상품 기초자산 이름 (NIFTY, BANKNIFTY ...)
    underlyings: HashSet<String>,
}

impl DirectoryIndex {
    /// 레코드 목록으로 인덱스를 만듭니다.
    pub fn new(records: Vec<DirectoryRecord>) -> Self {
        let mut by_symbol: HashMap<String, usize> = HashMap::with_capacity(records.len());
        let mut by_qualified = HashMap::with_capacity(records.len());
        let mut underlyings = HashSet::new();

        for (idx, record) in records.iter().enumerate() {
            if !record.is_equity() && !record.name.is_empty() {
                underlyings.insert(record.name.to_uppercase());
            }
            by_qualified
                .entry(format!("{}:{}", record.exchange, record.symbol))
                .or_insert(idx);
            by_symbol
                .entry(record.symbol.clone())
                .and_modify(|existing| {
                    if records[*existing].exchange != PREFERRED_EXCHANGE
                        && record.exchange == PREFERRED_EXCHANGE
                    {
                        *existing = idx;
                    }
                })
                .or_insert(idx);
        }

        Self {
            records,
            by_symbol,
            by_qualified,
            underlyings,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 심볼을 조회합니다. 대소문자를 구분하지 않으며 `NSE:RELIANCE` 형식도 받습니다.
    pub fn resolve(&self, symbol: &str) -> Option<&DirectoryRecord> {
        let symbol = symbol.trim().to_uppercase();
        let idx = if symbol.contains(':') {
            self.by_qualified.get(&symbol)
        } else {
            self.by_symbol.get(&symbol)
        }?;
        self.records.get(*idx)
    }

    /// 파생상품이 상장된 기초자산인지 확인합니다 (대소문자 무시).
    pub fn is_underlying(&self, name: &str) -> bool {
        self.underlyings.contains(&name.trim().to_uppercase())
    }

    /// 접두사 검색.
    ///
    /// 정확히 일치하는 심볼, 심볼 접두사, 종목명 접두사 순으로 정렬하며 같은
    /// 순위에서는 현물 주식이 먼저 옵니다.
    pub fn search(&self, query: &str, limit: usize) -> Vec<DirectoryRecord> {
        let query = query.trim().to_uppercase();
        if query.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut matches: Vec<(u8, bool, &DirectoryRecord)> = self
            .records
            .iter()
            .filter_map(|record| {
                let rank = if record.symbol == query {
                    0
                } else if record.symbol.starts_with(&query) {
                    1
                } else if record.name.to_uppercase().starts_with(&query) {
                    2
                } else {
                    return None;
                };
                Some((rank, !record.is_equity(), record))
            })
            .collect();

        matches.sort_by_key(|(rank, derivative, _)| (*rank, *derivative));
        matches
            .into_iter()
            .take(limit)
            .map(|(_, _, record)| record.clone())
            .collect()
    }
}

/// 저장소에 보관된 종목 목록.
struct CachedCopy {
    loaded_at: DateTime<Utc>,
    csv: String,
}

/// 종목 디렉터리 서비스.
///
/// 인덱스는 `RwLock<Arc<_>>`로 보관되어 갱신 중에도 읽기가 막히지 않습니다.
pub struct DirectoryService {
    source_url: String,
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn RecordStore>,
    max_age: Duration,
    index: RwLock<Arc<DirectoryIndex>>,
    /// 마지막 로드 시도 시각
    checked_at: RwLock<Option<DateTime<Utc>>>,
    load_lock: Mutex<()>,
}

impl DirectoryService {
    /// 새 서비스 생성. `load()` 전에는 인덱스가 비어 있습니다.
    pub fn new(
        source_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            transport,
            store,
            max_age: Duration::hours(24),
            index: RwLock::new(Arc::new(DirectoryIndex::default())),
            checked_at: RwLock::new(None),
            load_lock: Mutex::new(()),
        }
    }

    /// 설정 섹션에서 생성합니다.
    pub fn from_settings(
        settings: &DirectorySettings,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self::new(settings.source_url.clone(), transport, store)
            .with_max_age(Duration::hours(settings.refresh_hours))
    }

    /// 캐시 사본 재사용 기간을 설정합니다.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// 현재 인덱스.
    pub async fn index(&self) -> Arc<DirectoryIndex> {
        self.index.read().await.clone()
    }

    /// 심볼을 조회합니다.
    pub async fn resolve(&self, symbol: &str) -> Option<DirectoryRecord> {
        self.index().await.resolve(symbol).cloned()
    }

    /// 접두사 검색.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<DirectoryRecord> {
        self.index().await.search(query, limit)
    }

    /// 시작 시 로드. 신선한 캐시 사본이 있으면 다운로드하지 않습니다.
    #[instrument(skip(self), fields(source = %self.source_url))]
    pub async fn load(&self) -> FeedResult<Arc<DirectoryIndex>> {
        let cached = self.cached_copy().await;
        if let Some(copy) = &cached {
            let age = Utc::now() - copy.loaded_at;
            if age < self.max_age {
                info!(age_minutes = age.num_minutes(), "캐시된 종목 목록 사용");
                return self.install(&copy.csv).await;
            }
        }
        self.download_or_fallback(cached).await
    }

    /// 인덱스가 비어 있거나 재사용 기간이 지났으면 로드합니다.
    ///
    /// 동시 호출은 한 번만 로드합니다. 기존 인덱스가 있으면 다시 로드하다 실패해도
    /// 기존 인덱스를 돌려주고 다음 기간까지 재시도하지 않습니다.
    pub async fn ensure_loaded(&self) -> FeedResult<Arc<DirectoryIndex>> {
        if let Some(current) = self.fresh_index().await {
            return Ok(current);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(current) = self.fresh_index().await {
            return Ok(current);
        }

        let current = self.index().await;
        if current.is_empty() {
            return self.load().await;
        }

        info!("종목 인덱스 재사용 기간 경과, 다시 로드");
        match self.load().await {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(error = %e, "종목 인덱스 재로드 실패, 기존 인덱스 유지");
                *self.checked_at.write().await = Some(Utc::now());
                Ok(current)
            }
        }
    }

    async fn fresh_index(&self) -> Option<Arc<DirectoryIndex>> {
        let checked_at = (*self.checked_at.read().await)?;
        let current = self.index().await;
        (!current.is_empty() && Utc::now() - checked_at < self.max_age).then_some(current)
    }

    /// 캐시 사본의 나이와 관계없이 다시 다운로드합니다.
    #[instrument(skip(self), fields(source = %self.source_url))]
    pub async fn refresh(&self) -> FeedResult<Arc<DirectoryIndex>> {
        let cached = self.cached_copy().await;
        self.download_or_fallback(cached).await
    }

    async fn download_or_fallback(
        &self,
        cached: Option<CachedCopy>,
    ) -> FeedResult<Arc<DirectoryIndex>> {
        let download = match self.download().await {
            Ok(csv) => match self.install(&csv).await {
                Ok(index) => {
                    self.save_copy(csv).await;
                    return Ok(index);
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        match cached {
            Some(copy) => {
                warn!(
                    error = %download,
                    loaded_at = %copy.loaded_at,
                    "종목 목록 다운로드 실패, 오래된 사본 사용"
                );
                self.install(&copy.csv).await
            }
            None => Err(FeedError::DataUnavailable {
                key: "directory".to_string(),
                causes: vec![format!("download: {}", download), "store: miss".to_string()],
            }),
        }
    }

    async fn download(&self) -> FeedResult<String> {
        debug!(url = %self.source_url, "종목 목록 다운로드");
        let response = self
            .transport
            .send(HttpRequest::get(self.source_url.clone()))
            .await?;
        if !response.is_success() {
            return Err(FeedError::Upstream {
                status: response.status,
                message: format!("instrument list download from {}", self.source_url),
            });
        }
        Ok(response.body)
    }

    /// CSV로 인덱스를 만듭니다. 레코드가 하나도 없으면 실패입니다.
    fn build_index(&self, csv: &str) -> FeedResult<DirectoryIndex> {
        let outcome = parse_instruments(csv)?;
        if outcome.records.is_empty() {
            return Err(FeedError::malformed("instruments csv", csv));
        }
        if outcome.skipped > 0 {
            warn!(skipped = outcome.skipped, "형식이 잘못된 종목 행 건너뜀");
        }
        info!(count = outcome.records.len(), "종목 인덱스 구성");
        Ok(DirectoryIndex::new(outcome.records))
    }

    async fn install(&self, csv: &str) -> FeedResult<Arc<DirectoryIndex>> {
        let index = Arc::new(self.build_index(csv)?);
        *self.index.write().await = index.clone();
        *self.checked_at.write().await = Some(Utc::now());
        Ok(index)
    }

    async fn cached_copy(&self) -> Option<CachedCopy> {
        let records = match self
            .store
            .get_by_field(DIRECTORY_COLLECTION, "source_url", &json!(self.source_url))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "디렉터리 캐시 조회 실패");
                return None;
            }
        };

        let data = records.into_iter().next()?.data;
        let loaded_at = data
            .get("loaded_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
            .with_timezone(&Utc);
        let csv = data.get("csv").and_then(Value::as_str)?.to_string();
        Some(CachedCopy { loaded_at, csv })
    }

    async fn save_copy(&self, csv: String) {
        let record = json!({
            "source_url": self.source_url,
            "loaded_at": Utc::now().to_rfc3339(),
            "csv": csv,
        });
        if let Err(e) = self
            .store
            .upsert(
                DIRECTORY_COLLECTION,
                "source_url",
                &json!(self.source_url),
                record,
            )
            .await
        {
            warn!(error = %e, "디렉터리 캐시 저장 실패");
        }
    }
}

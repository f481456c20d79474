//! 데이터 분류별 캐시 정책 테이블.

use super::DataClass;
use std::collections::HashMap;
use std::time::Duration;

/// 단일 분류의 캐시 정책.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// 캐시 유효 기간 (`None`이면 캐시하지 않음)
    pub ttl: Option<Duration>,
    /// 영속 저장소 기록 여부
    pub persist: bool,
}

impl CachePolicy {
    /// 캐시하지 않는 정책.
    pub const UNCACHED: CachePolicy = CachePolicy {
        ttl: None,
        persist: false,
    };

    /// 메모리에만 캐시하는 정책.
    pub const fn ephemeral(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            persist: false,
        }
    }

    /// 메모리 캐시 + 영속 저장소 기록 정책.
    pub const fn persisted(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            persist: true,
        }
    }

    /// 캐시 대상인지 확인합니다.
    pub fn is_cacheable(&self) -> bool {
        self.ttl.is_some()
    }
}

/// 분류별 정책 테이블.
///
/// 등록되지 않은 분류는 캐시하지 않습니다.
#[derive(Debug, Clone)]
pub struct CachePolicyTable {
    policies: HashMap<DataClass, CachePolicy>,
}

impl Default for CachePolicyTable {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let five_minutes = Duration::from_secs(300);

        Self::empty()
            .with(DataClass::Quote, CachePolicy::persisted(minute))
            .with(DataClass::OptionChain, CachePolicy::persisted(minute))
            .with(DataClass::FiiDii, CachePolicy::persisted(five_minutes))
            .with(DataClass::Sectors, CachePolicy::persisted(five_minutes))
            .with(DataClass::MarketSummary, CachePolicy::ephemeral(minute))
            .with(DataClass::Search, CachePolicy::UNCACHED)
    }
}

impl CachePolicyTable {
    /// 빈 테이블 생성.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    /// 분류의 정책을 설정합니다.
    pub fn with(mut self, class: DataClass, policy: CachePolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    /// 분류의 정책을 조회합니다.
    pub fn policy(&self, class: DataClass) -> CachePolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or(CachePolicy::UNCACHED)
    }
}

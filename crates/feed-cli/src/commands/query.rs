//! 조회 명령어.

use super::print_json;
use feed_data::MarketDataService;
use tracing::info;

/// 조회 대상.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Quote { symbol: String },
    Chain { symbol: String, expiry: Option<String> },
    FiiDii { days: u32 },
    Sectors,
    Market,
    Search { query: String },
}

/// 조회를 실행하고 결과를 출력합니다.
pub async fn run_query(service: &MarketDataService, query: Query, compact: bool) -> anyhow::Result<()> {
    info!(?query, "조회 실행");
    match query {
        Query::Quote { symbol } => {
            let quote = service.get_stock_data(&symbol).await?;
            print_json(&*quote, compact)
        }
        Query::Chain { symbol, expiry } => {
            let chain = service
                .get_option_chain_data(&symbol, expiry.as_deref())
                .await?;
            print_json(&*chain, compact)
        }
        Query::FiiDii { days } => {
            let rows = service.get_fii_dii_data(days).await?;
            print_json(&*rows, compact)
        }
        Query::Sectors => {
            let rows = service.get_sector_data().await?;
            print_json(&*rows, compact)
        }
        Query::Market => {
            let summary = service.get_market_data().await?;
            print_json(&*summary, compact)
        }
        Query::Search { query } => {
            let records = service.search_stocks(&query).await?;
            print_json(&records, compact)
        }
    }
}

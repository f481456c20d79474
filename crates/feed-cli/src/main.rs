//! 시장 데이터 CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 종목 시세
//! feed quote RELIANCE
//!
//! # NIFTY 옵션 체인 (만기 지정)
//! feed chain NIFTY --expiry 2026-10-29
//!
//! # 최근 10일 FII/DII 매매 동향
//! feed fii-dii --days 10
//!
//! # 종목 검색
//! feed search tata
//!
//! # 실시간 시세 60초 구독
//! feed stream NIFTY RELIANCE --seconds 60
//! ```

use clap::{Parser, Subcommand};
use feed_cli::commands::query::{run_query, Query};
use feed_cli::commands::stream::run_stream;
use feed_core::{init_logging, AppConfig, LogConfig};
use feed_data::MarketDataService;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "feed")]
#[command(about = "Market data CLI - 시세, 옵션 체인, 수급, 실시간 스트림", long_about = None)]
#[command(version)]
struct Cli {
    /// 설정 파일 경로
    #[arg(short, long, global = true, default_value = "config/feed.toml")]
    config: String,

    /// 한 줄 JSON 출력
    #[arg(long, global = true)]
    compact: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// 종목 시세 조회
    Quote {
        /// 종목 심볼 (예: RELIANCE)
        symbol: String,
    },

    /// 옵션 체인 조회
    Chain {
        /// 기초자산 심볼 (예: NIFTY)
        symbol: String,

        /// 만기 (YYYY-MM-DD, 생략 시 근월물)
        #[arg(short, long)]
        expiry: Option<String>,
    },

    /// 외국인/기관 매매 동향
    FiiDii {
        /// 조회 일수
        #[arg(short, long, default_value = "10")]
        days: u32,
    },

    /// 섹터 지수
    Sectors,

    /// 주요 지수 요약
    Market,

    /// 종목 검색 (심볼 또는 종목명 접두사)
    Search {
        query: String,
    },

    /// 실시간 시세 구독
    Stream {
        /// 구독할 심볼
        #[arg(required = true)]
        symbols: Vec<String>,

        /// 구독 시간 (초, 생략 시 Ctrl-C까지)
        #[arg(short, long)]
        seconds: Option<u64>,
    },
}

impl Commands {
    /// 조회 명령이면 `Query`로 변환합니다.
    fn into_query(self) -> Result<Query, Self> {
        match self {
            Commands::Quote { symbol } => Ok(Query::Quote { symbol }),
            Commands::Chain { symbol, expiry } => Ok(Query::Chain { symbol, expiry }),
            Commands::FiiDii { days } => Ok(Query::FiiDii { days }),
            Commands::Sectors => Ok(Query::Sectors),
            Commands::Market => Ok(Query::Market),
            Commands::Search { query } => Ok(Query::Search { query }),
            other => Err(other),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 파일 로드 (없어도 무시)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    if let Err(e) = init_logging(LogConfig::from_settings(&config.logging)) {
        eprintln!("로깅 초기화 실패: {}", e);
    }
    info!(config = %cli.config, "설정 로드 완료");

    let service = MarketDataService::from_config(&config).await?;

    let result = match cli.command.into_query() {
        Ok(query) => run_query(&service, query, cli.compact).await,
        Err(Commands::Stream { symbols, seconds }) => {
            run_stream(&service, &symbols, seconds.map(Duration::from_secs)).await
        }
        Err(other) => Err(anyhow::anyhow!("처리할 수 없는 명령: {:?}", other)),
    };

    if let Err(e) = &result {
        error!(error = %e, "명령 실패");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain_with_expiry() {
        let cli = Cli::try_parse_from(["feed", "chain", "NIFTY", "--expiry", "2026-10-29"]).unwrap();
        assert_eq!(
            cli.command.into_query().unwrap(),
            Query::Chain {
                symbol: "NIFTY".into(),
                expiry: Some("2026-10-29".into())
            }
        );
        assert_eq!(cli.config, "config/feed.toml");
    }

    #[test]
    fn test_parse_fii_dii_default_days() {
        let cli = Cli::try_parse_from(["feed", "fii-dii", "--compact"]).unwrap();
        assert!(cli.compact);
        assert_eq!(cli.command, Commands::FiiDii { days: 10 });
    }

    #[test]
    fn test_stream_requires_symbols() {
        assert!(Cli::try_parse_from(["feed", "stream"]).is_err());

        let cli = Cli::try_parse_from(["feed", "stream", "NIFTY", "TCS", "-s", "5"]).unwrap();
        assert!(cli.command.into_query().is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["feed", "market", "--config", "custom.toml"]).unwrap();
        assert_eq!(cli.config, "custom.toml");
        assert_eq!(cli.command, Commands::Market);
    }
}

//! 실시간 시세 구독 명령어.

use feed_core::Tick;
use feed_data::MarketDataService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 심볼을 구독하고 틱을 한 줄에 하나씩 JSON으로 출력합니다.
///
/// `duration`이 없으면 Ctrl-C까지 실행합니다.
pub async fn run_stream(
    service: &MarketDataService,
    symbols: &[String],
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    if symbols.is_empty() {
        anyhow::bail!("구독할 심볼을 하나 이상 지정하세요");
    }

    let printer = Arc::new(|tick: &Tick| match serde_json::to_string(tick) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "틱 출력 실패"),
    });

    let mut listeners = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let id = service.subscribe(symbol, printer.clone()).await?;
        listeners.push((symbol.clone(), id));
    }
    service.connect_stream().await?;
    info!(count = listeners.len(), "실시간 구독 시작");

    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => tokio::signal::ctrl_c().await?,
    }

    for (symbol, id) in listeners {
        service.unsubscribe(&symbol, Some(id)).await?;
    }
    service.disconnect_stream().await?;
    info!("실시간 구독 종료");
    Ok(())
}

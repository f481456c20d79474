//! 실시간 구독 다중화기.
//!
//! 여러 위젯이 같은 심볼을 구독해도 업스트림 구독은 하나입니다. 연결이 새로
//! 수립될 때마다 등록된 심볼 전체를 한 번의 subscribe 메시지로 재구독합니다.

use super::{ConnectionState, ControlMessage, StreamConfig, StreamConnection, StreamConnector};
use feed_core::{FeedResult, Tick};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 틱 콜백.
pub type TickCallback = Arc<dyn Fn(&Tick) + Send + Sync>;

/// 리스너 식별자.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// 구독 레지스트리와 현재 연결의 송신 채널.
///
/// 하나의 락 아래에 두어 재구독과 신규 구독이 서로 끼어들지 않게 합니다.
#[derive(Default)]
struct Registry {
    subscriptions: BTreeMap<String, Vec<(ListenerId, TickCallback)>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl Registry {
    fn send(&self, message: ControlMessage) {
        if let Some(outbound) = &self.outbound {
            if outbound.send(message.to_json()).is_err() {
                debug!("연결이 닫혀 제어 메시지를 보내지 못함");
            }
        }
    }
}

/// 실행 중인 연결 관리 태스크.
struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    next_id: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "스트림 상태 변경");
            *current = state;
            true
        });
    }
}

/// 실시간 구독 다중화기.
pub struct Multiplexer {
    shared: Arc<Shared>,
    connector: Arc<dyn StreamConnector>,
    config: StreamConfig,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Multiplexer {
    /// 새 다중화기 생성. `connect()`를 호출하기 전까지 연결하지 않습니다.
    pub fn new(connector: Arc<dyn StreamConnector>, config: StreamConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                state,
                next_id: AtomicU64::new(1),
            }),
            connector,
            config,
            supervisor: Mutex::new(None),
        }
    }

    /// 현재 연결 상태.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// 상태 변경 구독.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// 심볼에 콜백을 등록합니다.
    ///
    /// 심볼의 첫 리스너이고 연결되어 있으면 즉시 업스트림 구독을 보냅니다.
    pub async fn subscribe(&self, symbol: &str, callback: TickCallback) -> ListenerId {
        let symbol = symbol.trim().to_uppercase();
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));

        let mut registry = self.shared.registry.lock().await;
        let listeners = registry.subscriptions.entry(symbol.clone()).or_default();
        let first = listeners.is_empty();
        listeners.push((id, callback));

        if first {
            info!(symbol = %symbol, "심볼 구독");
            registry.send(ControlMessage::subscribe(vec![symbol]));
        } else {
            debug!(symbol = %symbol, listener = %id, "기존 구독에 리스너 추가");
        }
        id
    }

    /// 리스너를 제거합니다. `listener`가 `None`이면 심볼의 모든 리스너를 제거합니다.
    ///
    /// 마지막 리스너가 제거되면 업스트림 구독을 해지합니다.
    pub async fn unsubscribe(&self, symbol: &str, listener: Option<ListenerId>) {
        let symbol = symbol.trim().to_uppercase();
        let mut registry = self.shared.registry.lock().await;

        let Some(listeners) = registry.subscriptions.get_mut(&symbol) else {
            return;
        };
        match listener {
            Some(id) => listeners.retain(|(existing, _)| *existing != id),
            None => listeners.clear(),
        }

        if listeners.is_empty() {
            registry.subscriptions.remove(&symbol);
            info!(symbol = %symbol, "심볼 구독 해지");
            registry.send(ControlMessage::unsubscribe(vec![symbol]));
        }
    }

    /// 현재 구독 중인 심볼 (정렬됨).
    pub async fn symbols(&self) -> Vec<String> {
        self.shared
            .registry
            .lock()
            .await
            .subscriptions
            .keys()
            .cloned()
            .collect()
    }

    /// 심볼의 리스너 수.
    pub async fn listener_count(&self, symbol: &str) -> usize {
        self.shared
            .registry
            .lock()
            .await
            .subscriptions
            .get(&symbol.trim().to_uppercase())
            .map_or(0, Vec::len)
    }

    /// 연결을 시작합니다. 이미 실행 중이면 아무것도 하지 않습니다.
    ///
    /// 재연결 한도를 모두 소진해 멈춘 경우 다시 호출하면 새로 시작합니다.
    pub async fn connect(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(running) = supervisor.as_ref() {
            if !running.handle.is_finished() {
                return;
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(
            self.shared.clone(),
            self.connector.clone(),
            self.config.clone(),
            shutdown_rx,
        ));
        *supervisor = Some(Supervisor { shutdown, handle });
    }

    /// 연결을 종료합니다. 구독 레지스트리는 유지됩니다.
    pub async fn disconnect(&self) {
        let running = self.supervisor.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.handle.await {
                warn!(error = %e, "스트림 태스크 종료 실패");
            }
        }
        self.shared.registry.lock().await.outbound = None;
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

/// 연결, 수신, 재연결을 담당하는 태스크.
async fn supervise(
    shared: Arc<Shared>,
    connector: Arc<dyn StreamConnector>,
    config: StreamConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;

    loop {
        shared.set_state(ConnectionState::Connecting);

        match connector.connect().await {
            Ok(connection) => {
                failures = 0;
                let closed_by_user = run_connection(&shared, connection, &mut shutdown).await;
                shared.registry.lock().await.outbound = None;
                if closed_by_user {
                    shared.set_state(ConnectionState::Disconnected);
                    return;
                }
                warn!("스트림 연결 끊김");
            }
            Err(e) => {
                failures += 1;
                error!(
                    error = %e,
                    attempt = failures,
                    max = config.max_reconnect_attempts,
                    "스트림 연결 실패"
                );
                if failures >= config.max_reconnect_attempts {
                    error!("최대 재연결 시도 횟수 초과 ({}회)", config.max_reconnect_attempts);
                    shared.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        info!(delay_secs = config.reconnect_delay.as_secs_f64(), "재연결 대기");
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// 연결 하나를 처리합니다. 사용자가 종료했으면 `true`를 반환합니다.
async fn run_connection(
    shared: &Shared,
    connection: StreamConnection,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let StreamConnection {
        outbound,
        mut inbound,
    } = connection;

    {
        let mut registry = shared.registry.lock().await;
        registry.outbound = Some(outbound);
        shared.set_state(ConnectionState::Connected);

        let symbols: Vec<String> = registry.subscriptions.keys().cloned().collect();
        if !symbols.is_empty() {
            info!(count = symbols.len(), "기존 구독 복원");
            registry.send(ControlMessage::subscribe(symbols));
        }
    }

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(text) => dispatch(shared, &text).await,
                None => return false,
            },
            _ = shutdown.changed() => return true,
        }
    }
}

/// 틱을 심볼의 모든 리스너에게 등록 순서대로 전달합니다.
async fn dispatch(shared: &Shared, text: &str) {
    let tick: Tick = match serde_json::from_str(text) {
        Ok(tick) => tick,
        Err(e) => {
            debug!(error = %e, shape = %feed_core::describe_shape(text), "틱이 아닌 메시지 무시");
            return;
        }
    };

    let callbacks: Vec<TickCallback> = {
        let registry = shared.registry.lock().await;
        match registry.subscriptions.get(&tick.symbol) {
            Some(listeners) => listeners.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return,
        }
    };

    for callback in callbacks {
        callback(&tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use feed_core::FeedError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// 테스트 측에서 본 서버 끝.
    struct ServerEnd {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::Sender<String>,
    }

    /// 채널 기반 가짜 연결기. `fail_after`번째 연결부터 실패합니다.
    struct FakeConnector {
        servers: mpsc::UnboundedSender<ServerEnd>,
        attempts: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait]
    impl StreamConnector for FakeConnector {
        async fn connect(&self) -> FeedResult<StreamConnection> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= self.fail_after {
                return Err(FeedError::Stream("connection refused".into()));
            }
            let (outbound, from_client) = mpsc::unbounded_channel();
            let (to_client, inbound) = mpsc::channel(16);
            let _ = self.servers.send(ServerEnd {
                from_client,
                to_client,
            });
            Ok(StreamConnection { outbound, inbound })
        }
    }

    fn fake(fail_after: usize) -> (Arc<FakeConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(FakeConnector {
                servers,
                attempts: AtomicUsize::new(0),
                fail_after,
            }),
            rx,
        )
    }

    fn config() -> StreamConfig {
        StreamConfig {
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
        }
    }

    fn noop() -> TickCallback {
        Arc::new(|_: &Tick| {})
    }

    fn tick_json(symbol: &str, price: &str) -> String {
        format!(
            r#"{{"symbol":"{}","lastPrice":{},"open":1,"high":1,"low":1,"close":1,"volume":10,"timestamp":1760000000000}}"#,
            symbol, price
        )
    }

    async fn wait_for(mux: &Multiplexer, state: ConnectionState) {
        let mut changes = mux.state_changes();
        changes.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_on_reconnect() {
        let (connector, mut servers) = fake(usize::MAX);
        let mux = Multiplexer::new(connector.clone(), config());

        mux.subscribe("NIFTY", noop()).await;
        mux.subscribe("RELIANCE", noop()).await;
        mux.connect().await;

        let mut first = servers.recv().await.unwrap();
        assert_eq!(
            first.from_client.recv().await.unwrap(),
            r#"{"action":"subscribe","symbols":["NIFTY","RELIANCE"]}"#
        );

        // 서버 측 강제 종료
        drop(first.to_client);
        let mut second = servers.recv().await.unwrap();
        wait_for(&mux, ConnectionState::Connected).await;

        assert_eq!(
            second.from_client.recv().await.unwrap(),
            r#"{"action":"subscribe","symbols":["NIFTY","RELIANCE"]}"#
        );
        assert!(second.from_client.try_recv().is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        mux.disconnect().await;
        assert_eq!(mux.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_routed_in_registration_order() {
        let (connector, mut servers) = fake(usize::MAX);
        let mux = Multiplexer::new(connector, config());

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let seen = seen.clone();
            mux.subscribe(
                "NIFTY",
                Arc::new(move |tick: &Tick| {
                    seen.lock().unwrap().push(format!("{}:{}", name, tick.last_price))
                }),
            )
            .await;
        }
        let other = seen.clone();
        mux.subscribe(
            "TCS",
            Arc::new(move |_: &Tick| other.lock().unwrap().push("tcs".into())),
        )
        .await;

        mux.connect().await;
        let server = servers.recv().await.unwrap();
        wait_for(&mux, ConnectionState::Connected).await;

        server.to_client.send(tick_json("NIFTY", "24510.5")).await.unwrap();
        server.to_client.send("not a tick".to_string()).await.unwrap();
        server.to_client.send(tick_json("INFY", "1500")).await.unwrap();
        server.to_client.send(tick_json("NIFTY", "24511")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:24510.5", "b:24510.5", "a:24511", "b:24511"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_listener_removal_unsubscribes() {
        let (connector, mut servers) = fake(usize::MAX);
        let mux = Multiplexer::new(connector, config());
        mux.connect().await;
        let mut server = servers.recv().await.unwrap();
        wait_for(&mux, ConnectionState::Connected).await;

        let first = mux.subscribe("tcs", noop()).await;
        let second = mux.subscribe("TCS", noop()).await;
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            r#"{"action":"subscribe","symbols":["TCS"]}"#
        );
        assert_eq!(mux.listener_count("TCS").await, 2);

        mux.unsubscribe("TCS", Some(first)).await;
        assert!(server.from_client.try_recv().is_err());

        mux.unsubscribe("TCS", Some(second)).await;
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            r#"{"action":"unsubscribe","symbols":["TCS"]}"#
        );
        assert!(mux.symbols().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_without_listener_removes_all() {
        let (connector, mut servers) = fake(usize::MAX);
        let mux = Multiplexer::new(connector, config());
        mux.connect().await;
        let mut server = servers.recv().await.unwrap();
        wait_for(&mux, ConnectionState::Connected).await;

        for _ in 0..3 {
            mux.subscribe("INFY", noop()).await;
        }
        mux.subscribe("TCS", noop()).await;
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            r#"{"action":"subscribe","symbols":["INFY"]}"#
        );
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            r#"{"action":"subscribe","symbols":["TCS"]}"#
        );

        mux.unsubscribe("infy", None).await;
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            r#"{"action":"unsubscribe","symbols":["INFY"]}"#
        );
        assert!(server.from_client.try_recv().is_err());
        assert_eq!(mux.listener_count("INFY").await, 0);
        assert_eq!(mux.symbols().await, vec!["TCS".to_string()]);

        // 이미 해지된 심볼은 아무것도 보내지 않음
        mux.unsubscribe("INFY", None).await;
        assert!(server.from_client.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_max_reconnect_attempts() {
        let (connector, mut servers) = fake(1);
        let mux = Multiplexer::new(connector.clone(), config());
        mux.subscribe("NIFTY", noop()).await;

        mux.connect().await;
        let first = servers.recv().await.unwrap();
        wait_for(&mux, ConnectionState::Connected).await;
        drop(first);

        // 이후 연결은 모두 실패: 3회 시도 후 중단
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mux.state(), ConnectionState::Disconnected);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);

        // 명시적 connect()로 다시 시작
        mux.connect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 7);
        assert_eq!(mux.symbols().await, vec!["NIFTY".to_string()]);
    }
}

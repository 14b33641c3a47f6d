//! Live event stream with bounded reconnect
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (drop) -> Connecting ...
//!                                   \-> Closed (close())
//! ```
//!
//! A successful connect resets the retry budget. Once `max_attempts`
//! consecutive connects fail the loop stops in `Disconnected` and the
//! failure callback fires once.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::messages::{parse_inbound, InboundFrame, OutboundFrame};
use super::transport::{Channel, Connector};
use crate::config::StreamConfig;
use crate::crypto::AddressHex;
use crate::error::{Error, Result};
use crate::wallet::types::{Balance, HistoryEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Disconnected => write!(f, "disconnected"),
            StreamState::Connecting => write!(f, "connecting"),
            StreamState::Connected => write!(f, "connected"),
            StreamState::Closed => write!(f, "closed"),
        }
    }
}

/// Receives dispatched frames. Implementations must route into the same
/// mutation entry points that polling uses.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Addresses to subscribe on every (re)connect
    async fn subscribed_addresses(&self) -> Vec<AddressHex>;

    async fn on_balance(&self, address: AddressHex, balance: Balance);

    async fn on_transaction(&self, entry: HistoryEntry);
}

/// Capped exponential backoff with a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            max_attempts: config.max_reconnect_attempts.max(1),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

enum SessionEnd {
    Cancelled,
    Dropped(Option<Error>),
}

struct Inner {
    url: String,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn StreamHandler>,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    state: watch::Sender<StreamState>,
    subscriptions: Mutex<BTreeSet<AddressHex>>,
    commands: Mutex<Option<mpsc::UnboundedSender<AddressHex>>>,
    cancel: CancellationToken,
}

impl Inner {
    /// Returns false if the stream is closed or already in `next`
    fn set_state(&self, next: StreamState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == StreamState::Closed || *current == next {
                return false;
            }
            debug!("Stream state {} -> {}", current, next);
            *current = next;
            true
        })
    }

    fn close(&self) {
        self.cancel.cancel();
        let previous = self.state.send_replace(StreamState::Closed);
        if previous != StreamState::Closed {
            info!("Event stream closed");
        }
    }

    fn replay_set(&self, from_handler: Vec<AddressHex>) -> BTreeSet<AddressHex> {
        let mut all: BTreeSet<AddressHex> = from_handler.into_iter().collect();
        all.extend(
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        all
    }

    async fn run<S, F>(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<AddressHex>,
        on_connected: S,
        on_failure: F,
    ) where
        S: Fn() + Send + Sync + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        let mut backoff = self.policy.backoff();
        let mut failures = 0u32;

        loop {
            self.set_state(StreamState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.connector.connect(&self.url) => result,
            };

            match attempt {
                Ok(channel) => {
                    if self.cancel.is_cancelled() || !self.set_state(StreamState::Connected) {
                        return;
                    }
                    failures = 0;
                    backoff.reset();
                    // close() may have landed while the state was published
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    on_connected();

                    match self.session(channel, &mut commands).await {
                        SessionEnd::Cancelled => return,
                        SessionEnd::Dropped(reason) => {
                            match reason {
                                Some(e) => warn!("Stream dropped: {}", e),
                                None => warn!("Stream closed by peer"),
                            }
                            self.set_state(StreamState::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.set_state(StreamState::Disconnected);
                    if failures >= self.policy.max_attempts {
                        error!(
                            "Giving up on {} after {} failed attempts: {}",
                            self.url, failures, e
                        );
                        if !self.cancel.is_cancelled() {
                            on_failure(e);
                        }
                        return;
                    }
                    warn!(
                        "Connect attempt {}/{} failed: {}",
                        failures, self.policy.max_attempts, e
                    );
                }
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        mut channel: Box<dyn Channel>,
        commands: &mut mpsc::UnboundedReceiver<AddressHex>,
    ) -> SessionEnd {
        // Queued subscriptions are already in the replay set
        while commands.try_recv().is_ok() {}

        let replay = self.replay_set(self.handler.subscribed_addresses().await);
        for address in &replay {
            if let Err(e) = send_subscribe(channel.as_mut(), address).await {
                return SessionEnd::Dropped(Some(e));
            }
        }
        info!("Subscribed {} addresses", replay.len());

        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                Some(address) = commands.recv() => {
                    if let Err(e) = send_subscribe(channel.as_mut(), &address).await {
                        return SessionEnd::Dropped(Some(e));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = channel.ping().await {
                        return SessionEnd::Dropped(Some(e));
                    }
                }
                frame = channel.recv() => match frame {
                    None => return SessionEnd::Dropped(None),
                    Some(Err(e)) => return SessionEnd::Dropped(Some(e)),
                    Some(Ok(text)) => {
                        if self.cancel.is_cancelled() {
                            return SessionEnd::Cancelled;
                        }
                        self.dispatch(&text).await;
                    }
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        match parse_inbound(text) {
            Ok(InboundFrame::BalanceChanged(payload)) => {
                let balances = payload.balances();
                self.handler.on_balance(payload.address, balances).await;
            }
            Ok(InboundFrame::TransactionChanged(payload)) => {
                self.handler.on_transaction(payload.into()).await;
            }
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }
}

async fn send_subscribe(channel: &mut dyn Channel, address: &AddressHex) -> Result<()> {
    let text = OutboundFrame::subscribe(address).to_text()?;
    channel.send(text).await?;
    debug!("Subscribed {}", address);
    Ok(())
}

/// Background connection to the node's event feed
pub struct EventStream {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventStream {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn StreamHandler>,
        policy: ReconnectPolicy,
        ping_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                connector,
                handler,
                policy,
                ping_interval,
                state,
                subscriptions: Mutex::new(BTreeSet::new()),
                commands: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(
        url: impl Into<String>,
        config: &StreamConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        Self::new(
            url,
            connector,
            handler,
            ReconnectPolicy::from_config(config),
            Duration::from_secs(config.ping_interval_secs),
        )
    }

    /// Start the connect loop in the background.
    ///
    /// `on_connected` fires on every entry into `Connected`; `on_failure`
    /// fires once if the retry budget runs out. Neither fires after
    /// [`close`](Self::close).
    pub fn connect<S, F>(&self, on_connected: S, on_failure: F) -> Result<()>
    where
        S: Fn() + Send + Sync + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        if self.state() == StreamState::Closed {
            return Err(Error::InvalidState("stream is closed".to_string()));
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return Err(Error::InvalidState("stream is already running".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.commands.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        info!("Starting event stream to {}", self.inner.url);
        self.inner.set_state(StreamState::Connecting);
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(inner.run(rx, on_connected, on_failure)));
        Ok(())
    }

    /// Subscribe an address now and on every reconnect.
    /// Valid only while connecting or connected.
    pub fn connect_to_address(&self, address: &AddressHex) -> Result<()> {
        let state = self.state();
        match state {
            StreamState::Connecting | StreamState::Connected => {}
            StreamState::Disconnected | StreamState::Closed => {
                return Err(Error::StreamNotConnected(state.to_string()))
            }
        }

        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone());

        if let Some(tx) = self
            .inner
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            // A closed receiver means the loop is between sessions; replay covers it
            let _ = tx.send(address.clone());
        }
        Ok(())
    }

    /// Stop immediately. No callbacks or dispatches happen afterwards.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    /// Wait for the background loop to finish
    pub async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_address_key_pair, Seed};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    struct MockChannel {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn send(&mut self, text: String) -> Result<()> {
            self.outbound
                .send(text)
                .map_err(|e| Error::StreamConnection(e.to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Server side of one scripted connection
    struct Server {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    #[derive(Default)]
    struct MockConnector {
        script: Mutex<VecDeque<Option<MockChannel>>>,
        attempts: AtomicU32,
        /// Runs inside the next connect, right before it resolves
        during_connect: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl MockConnector {
        fn fail(&self) {
            self.script.lock().unwrap().push_back(None);
        }

        fn accept(&self) -> Server {
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            self.script
                .lock()
                .unwrap()
                .push_back(Some(MockChannel { inbound, outbound }));
            Server {
                to_client,
                from_client,
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Channel>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let hook = self.during_connect.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            match self.script.lock().unwrap().pop_front() {
                Some(Some(channel)) => Ok(Box::new(channel)),
                _ => Err(Error::StreamConnection("connection refused".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        addresses: Vec<AddressHex>,
        balances: Mutex<Vec<(AddressHex, Balance)>>,
        transactions: Mutex<Vec<HistoryEntry>>,
    }

    #[async_trait]
    impl StreamHandler for RecordingHandler {
        async fn subscribed_addresses(&self) -> Vec<AddressHex> {
            self.addresses.clone()
        }

        async fn on_balance(&self, address: AddressHex, balance: Balance) {
            self.balances.lock().unwrap().push((address, balance));
        }

        async fn on_transaction(&self, entry: HistoryEntry) {
            self.transactions.lock().unwrap().push(entry);
        }
    }

    fn hex(index: u32) -> AddressHex {
        let seed = Seed::from_bytes(&[41u8; 32]).unwrap();
        derive_address_key_pair(&seed, index).unwrap().to_address()
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    fn stream(
        connector: Arc<MockConnector>,
        handler: Arc<RecordingHandler>,
        max_attempts: u32,
    ) -> EventStream {
        EventStream::new(
            "ws://node",
            connector,
            handler,
            policy(max_attempts),
            Duration::from_secs(60),
        )
    }

    struct Callbacks {
        connected: Arc<AtomicU32>,
        failed: Arc<AtomicU32>,
        connected_rx: mpsc::UnboundedReceiver<()>,
        failed_rx: mpsc::UnboundedReceiver<()>,
    }

    fn start(stream: &EventStream) -> Callbacks {
        let connected = Arc::new(AtomicU32::new(0));
        let failed = Arc::new(AtomicU32::new(0));
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        {
            let connected = connected.clone();
            let failed = failed.clone();
            stream
                .connect(
                    move || {
                        connected.fetch_add(1, Ordering::SeqCst);
                        let _ = connected_tx.send(());
                    },
                    move |_| {
                        failed.fetch_add(1, Ordering::SeqCst);
                        let _ = failed_tx.send(());
                    },
                )
                .unwrap();
        }
        Callbacks {
            connected,
            failed,
            connected_rx,
            failed_rx,
        }
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        timeout(Duration::from_secs(5), fut).await.expect("timed out")
    }

    #[tokio::test]
    async fn test_disconnect_then_failed_retries_fire_failure_once() {
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        for _ in 0..3 {
            connector.fail();
        }
        let handler = Arc::new(RecordingHandler::default());
        let stream = stream(connector.clone(), handler, 3);
        let mut cb = start(&stream);

        within(cb.connected_rx.recv()).await;
        assert_eq!(stream.state(), StreamState::Connected);

        // Peer goes away
        drop(server);

        within(cb.failed_rx.recv()).await;
        within(stream.join()).await;

        assert_eq!(cb.failed.load(Ordering::SeqCst), 1);
        assert_eq!(cb.connected.load(Ordering::SeqCst), 1);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(stream.state(), StreamState::Disconnected);
    }

    #[tokio::test]
    async fn test_success_callback_per_connection() {
        let connector = Arc::new(MockConnector::default());
        let first = connector.accept();
        connector.fail();
        let _second = connector.accept();
        let handler = Arc::new(RecordingHandler::default());
        let stream = stream(connector.clone(), handler, 2);
        let mut cb = start(&stream);

        within(cb.connected_rx.recv()).await;
        drop(first);
        within(cb.connected_rx.recv()).await;

        assert_eq!(cb.connected.load(Ordering::SeqCst), 2);
        assert_eq!(cb.failed.load(Ordering::SeqCst), 0);
        stream.close();
    }

    #[tokio::test]
    async fn test_frames_dispatched_and_malformed_dropped() {
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let handler = Arc::new(RecordingHandler::default());
        let stream = stream(connector.clone(), handler.clone(), 1);
        let mut cb = start(&stream);
        within(cb.connected_rx.recv()).await;

        server.to_client.send("{garbage".to_string()).unwrap();
        server
            .to_client
            .send(format!(
                r#"{{"type":"BalanceChanged","payload":{{"address":"{}","balance":2,"preBalance":1}}}}"#,
                hex(0)
            ))
            .unwrap();
        server
            .to_client
            .send(r#"{"type":"TransactionChanged","payload":{"hash":"ab","createTime":1.0}}"#.to_string())
            .unwrap();

        within(async {
            while handler.transactions.lock().unwrap().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        let balances = handler.balances.lock().unwrap().clone();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].0, hex(0));
        assert_eq!(stream.state(), StreamState::Connected);
        stream.close();
    }

    #[tokio::test]
    async fn test_subscriptions_replayed_on_reconnect() {
        let connector = Arc::new(MockConnector::default());
        let mut first = connector.accept();
        let mut second = connector.accept();
        let handler = Arc::new(RecordingHandler {
            addresses: vec![hex(0)],
            ..Default::default()
        });
        let stream = stream(connector.clone(), handler, 2);
        let mut cb = start(&stream);
        within(cb.connected_rx.recv()).await;

        let initial = within(first.from_client.recv()).await.unwrap();
        assert!(initial.contains(hex(0).as_str()));

        stream.connect_to_address(&hex(1)).unwrap();
        let added = within(first.from_client.recv()).await.unwrap();
        assert!(added.contains(hex(1).as_str()));

        drop(first.to_client);
        within(cb.connected_rx.recv()).await;

        let mut replayed = vec![
            within(second.from_client.recv()).await.unwrap(),
            within(second.from_client.recv()).await.unwrap(),
        ];
        replayed.sort();
        assert!(replayed.iter().any(|f| f.contains(hex(0).as_str())));
        assert!(replayed.iter().any(|f| f.contains(hex(1).as_str())));
        stream.close();
    }

    #[tokio::test]
    async fn test_connect_to_address_requires_connection() {
        let connector = Arc::new(MockConnector::default());
        let handler = Arc::new(RecordingHandler::default());
        let stream = stream(connector, handler, 1);

        assert!(matches!(
            stream.connect_to_address(&hex(0)),
            Err(Error::StreamNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_close_during_connect_suppresses_callback() {
        let connector = Arc::new(MockConnector::default());
        let _server = connector.accept();
        let handler = Arc::new(RecordingHandler::default());
        let stream = stream(connector.clone(), handler, 3);

        // The connect succeeds, but close() lands before it resolves
        let inner = stream.inner.clone();
        *connector.during_connect.lock().unwrap() = Some(Box::new(move || inner.close()));

        let cb = start(&stream);
        within(stream.join()).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(cb.connected.load(Ordering::SeqCst), 0);
        assert_eq!(cb.failed.load(Ordering::SeqCst), 0);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let connector = Arc::new(MockConnector::default());
        let server = connector.accept();
        let handler = Arc::new(RecordingHandler::default());
        let stream = stream(connector.clone(), handler.clone(), 3);
        let mut cb = start(&stream);
        within(cb.connected_rx.recv()).await;

        stream.close();
        within(stream.join()).await;
        assert_eq!(stream.state(), StreamState::Closed);

        // Nothing is delivered once closed
        let _ = server.to_client.send(format!(
            r#"{{"type":"BalanceChanged","payload":{{"address":"{}","balance":2,"preBalance":1}}}}"#,
            hex(0)
        ));
        sleep(Duration::from_millis(20)).await;
        assert!(handler.balances.lock().unwrap().is_empty());
        assert_eq!(cb.failed.load(Ordering::SeqCst), 0);

        assert!(stream.connect(|| {}, |_| {}).is_err());
        assert!(matches!(
            stream.connect_to_address(&hex(0)),
            Err(Error::StreamNotConnected(_))
        ));
    }
}

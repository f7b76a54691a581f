//! WiFi WebSocket Connection
//!
//! The WiFi firmware serves a WebSocket at `ws://{host}:{port}/ws`. The
//! socket runs on its own task; `connect()` starts it and then polls the
//! observed state until the open settles or the wait budget runs out.

use super::{DataCallback, DataListener, DeviceConnection, StateCell};
use crate::domain::models::{ConnectionState, ConnectionType, DeviceInfo};
use crate::domain::settings::Settings;
use crate::infrastructure::protocol::{DEFAULT_WIFI_PORT, WS_PATH};
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Handshake budget for the socket task itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `disconnect()` lets the close frame flush.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WifiConfig {
    /// How long `connect()` waits for the open to settle
    pub connect_wait: Duration,
    /// State polling interval during `connect()`
    pub poll_interval: Duration,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            connect_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WifiConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect_wait: Duration::from_millis(settings.wifi_connect_timeout_ms),
            poll_interval: Duration::from_millis(settings.wifi_poll_interval_ms.max(1)),
        }
    }
}

/// Outgoing half of a running socket task.
struct SocketHandle {
    outgoing: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

pub struct WifiConnection {
    info: DeviceInfo,
    url: String,
    config: WifiConfig,
    state: StateCell,
    listener: DataListener,
    socket: Mutex<Option<SocketHandle>>,
    retired: Arc<AtomicBool>,
}

impl WifiConnection {
    pub fn new(host: &str, port: u16, config: WifiConfig) -> Self {
        let id = format!("{}:{}", host, port);
        Self {
            state: StateCell::new(&id),
            info: DeviceInfo::new(
                id,
                format!("WiFi Device ({})", host),
                ConnectionType::Wifi,
            ),
            url: format!("ws://{}:{}{}", host, port, WS_PATH),
            config,
            listener: DataListener::default(),
            socket: Mutex::new(None),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connection on the firmware's default port.
    pub fn with_default_port(host: &str) -> Self {
        Self::new(host, DEFAULT_WIFI_PORT, WifiConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Drop a stale or half-open socket without a close handshake.
    fn close_socket(&self) {
        if let Some(socket) = self.socket.lock().take() {
            socket.task.abort();
        }
    }

    async fn shutdown_socket(&self) {
        let socket = self.socket.lock().take();
        if let Some(SocketHandle { outgoing, mut task }) = socket {
            let _ = outgoing.send(Message::Close(None));
            drop(outgoing);
            if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    /// Poll the state until it leaves `Connecting` or the wait budget ends.
    async fn wait_for_open(&self) -> ConnectionState {
        let interval_ms = self.config.poll_interval.as_millis().max(1);
        let polls = (self.config.connect_wait.as_millis() / interval_ms).max(1);
        for _ in 0..polls {
            let state = self.state.get();
            if state != ConnectionState::Connecting {
                return state;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        self.state.get()
    }
}

/// State writer for the socket task. Silent once the connection is retired
/// so `disconnect()` has the last word.
struct SocketState {
    state: StateCell,
    retired: Arc<AtomicBool>,
}

impl SocketState {
    fn set(&self, state: ConnectionState) {
        if !self.retired.load(Ordering::SeqCst) {
            self.state.set(state);
        }
    }
}

/// Drive one WebSocket session: open, then pump outgoing and incoming
/// messages until either side closes.
async fn run_socket(
    url: String,
    state: SocketState,
    listener: DataListener,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    let handshake = tokio_tungstenite::connect_async(url.as_str());
    let socket = match timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok((socket, _))) => socket,
        Ok(Err(e)) => {
            warn!(url = %url, "WebSocket open failed: {}", e);
            state.set(ConnectionState::Error);
            return;
        }
        Err(_) => {
            warn!(url = %url, "WebSocket open timed out");
            state.set(ConnectionState::Error);
            return;
        }
    };
    state.set(ConnectionState::Connected);

    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!(url = %url, "WebSocket write failed: {}", e);
                    state.set(ConnectionState::Error);
                    return;
                }
                if closing {
                    break;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => listener.dispatch(text.as_bytes().to_vec()),
                    Some(Ok(Message::Binary(bytes))) => listener.dispatch(bytes.to_vec()),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(url = %url, "WebSocket closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(url = %url, "WebSocket read failed: {}", e);
                        state.set(ConnectionState::Error);
                        return;
                    }
                }
            }
        }
    }
    state.set(ConnectionState::Disconnected);
}

#[async_trait]
impl DeviceConnection for WifiConnection {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> bool {
        if self.retired.load(Ordering::SeqCst) {
            warn!(device = %self.info.id, "Connection already closed, create a new one to reconnect");
            return false;
        }

        self.close_socket();
        self.state.set(ConnectionState::Connecting);
        info!(device = %self.info.id, url = %self.url, "Opening WebSocket");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(
            self.url.clone(),
            SocketState {
                state: self.state.clone(),
                retired: self.retired.clone(),
            },
            self.listener.clone(),
            outgoing_rx,
        ));
        *self.socket.lock() = Some(SocketHandle { outgoing, task });

        let settled = self.wait_for_open().await;
        if self.retired.load(Ordering::SeqCst) {
            info!(device = %self.info.id, "Disconnected while connecting, dropping socket");
            self.close_socket();
            self.state.set(ConnectionState::Disconnected);
            return false;
        }

        match settled {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => {
                warn!(
                    device = %self.info.id,
                    "WebSocket did not open within {:?}",
                    self.config.connect_wait
                );
                self.close_socket();
                self.state.set(ConnectionState::Error);
                false
            }
            _ => {
                self.close_socket();
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.shutdown_socket().await;
        self.state.set(ConnectionState::Disconnected);
        info!(device = %self.info.id, "Disconnected");
    }

    async fn send_command(&self, command: &str) -> bool {
        if self.state.get() != ConnectionState::Connected {
            return false;
        }
        match self.socket.lock().as_ref() {
            Some(socket) => socket.outgoing.send(Message::text(command.to_string())).is_ok(),
            None => false,
        }
    }

    fn set_on_data_received(&self, callback: DataCallback) {
        self.listener.set(callback);
    }
}

/// Probe `{base_ip}.{subnet}.1` through `.254` for hosts accepting TCP on
/// `port`. All 254 probes run concurrently, each bounded by `probe_timeout`.
pub async fn scan_local_network(
    base_ip: &str,
    subnet: u8,
    port: u16,
    probe_timeout: Duration,
) -> Vec<String> {
    let probes = (1..=254u8).map(|host| {
        let ip = format!("{}.{}.{}", base_ip, subnet, host);
        async move {
            let addr: SocketAddr = format!("{}:{}", ip, port).parse().ok()?;
            match timeout(probe_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => Some(ip),
                _ => None,
            }
        }
    });

    let found: Vec<String> = join_all(probes).await.into_iter().flatten().collect();
    info!(
        subnet = %format!("{}.{}.0/24", base_ip, subnet),
        hosts_found = found.len(),
        "Network scan complete"
    );
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Minimal WebSocket server that echoes text back and records what it
    /// received.
    async fn echo_server() -> (u16, Arc<SyncMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(SyncMutex::new(Vec::new()));
        let log = received.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            log.lock().push(text.as_str().to_string());
                            let reply = format!("ack:{}", text.as_str());
                            let _ = ws.send(Message::text(reply)).await;
                        }
                    }
                });
            }
        });

        (port, received)
    }

    /// Accepts TCP connections and never answers the WebSocket handshake.
    async fn silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    /// Completes the handshake, then closes the socket after `delay`.
    async fn closing_server(delay: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            tokio::time::sleep(delay).await;
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
        });
        port
    }

    #[test]
    fn test_device_info_and_url() {
        let conn = WifiConnection::with_default_port("192.168.4.1");
        assert_eq!(conn.device_info().id, "192.168.4.1:81");
        assert_eq!(conn.device_info().connection_type, ConnectionType::Wifi);
        assert_eq!(conn.url(), "ws://192.168.4.1:81/ws");
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let (port, received) = echo_server().await;
        let conn = WifiConnection::new("127.0.0.1", port, WifiConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_on_data_received(Arc::new(move |data| {
            let _ = tx.send(data);
        }));

        assert!(conn.connect().await);
        assert_eq!(conn.state(), ConnectionState::Connected);

        assert!(conn.send_command("#1P1500T50!").await);
        let reply = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply, b"ack:#1P1500T50!".to_vec());
        assert_eq!(received.lock().as_slice(), &["#1P1500T50!".to_string()]);

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.send_command("ARM\n").await);
    }

    #[tokio::test]
    async fn test_connect_refused_moves_to_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = WifiConnection::new("127.0.0.1", port, WifiConfig::default());
        assert!(!conn.connect().await);
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_connect_after_disconnect_is_rejected() {
        let (port, _) = echo_server().await;
        let conn = WifiConnection::new("127.0.0.1", port, WifiConfig::default());
        assert!(conn.connect().await);
        conn.disconnect().await;
        assert!(!conn.connect().await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stalled_handshake_gives_up_at_deadline() {
        let port = silent_server().await;
        let config = WifiConfig {
            connect_wait: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
        };
        let conn = WifiConnection::new("127.0.0.1", port, config);

        let started = std::time::Instant::now();
        assert!(!conn.connect().await);
        let elapsed = started.elapsed();

        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(
            elapsed >= Duration::from_millis(300) && elapsed < Duration::from_secs(3),
            "gave up after {:?}",
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_wait_is_five_seconds() {
        let port = silent_server().await;
        let conn = WifiConnection::new("127.0.0.1", port, WifiConfig::default());

        let started = tokio::time::Instant::now();
        assert!(!conn.connect().await);
        let elapsed = started.elapsed();

        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(
            elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5500),
            "gave up after {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_wins() {
        let port = silent_server().await;
        let conn = Arc::new(WifiConnection::new("127.0.0.1", port, WifiConfig::default()));

        let connecting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        let mut state = conn.connection_state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        conn.disconnect().await;
        assert!(!connecting.await.unwrap());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.send_command("ARM\n").await);
    }

    #[tokio::test]
    async fn test_peer_close_moves_to_disconnected() {
        let port = closing_server(Duration::from_millis(300)).await;
        let conn = WifiConnection::new("127.0.0.1", port, WifiConfig::default());
        assert!(conn.connect().await);

        let mut state = conn.connection_state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!conn.send_command("ARM\n").await);
    }

    #[tokio::test]
    async fn test_scan_finds_listening_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let found = scan_local_network("127.0", 0, port, Duration::from_millis(200)).await;
        assert!(found.contains(&"127.0.0.1".to_string()));
        drop(listener);
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::PortError;
use crate::port::{PortActor, PortConfig, PortHandle, PortOutput, PortState};
use crate::transport::SerialTransport;

/// Unique identifier for an open serial connection
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PortId(pub u64);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

/// Why a connection went away
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    EndOfStream,
    ReadFailed(String),
    RateMismatch,
}

/// Events emitted by the managed ports
#[derive(Clone, Debug)]
pub enum PortEvent {
    Opened {
        id: PortId,
        path: String,
        baud_rate: u32,
    },
    /// One framed, trimmed, non-empty line from a device
    Line {
        id: PortId,
        text: String,
        timestamp: i64,
    },
    Closed {
        id: PortId,
        reason: CloseReason,
    },
    /// Every port was closed because baud rates stopped agreeing
    RateMismatch { reason: String },
}

/// Snapshot of one open port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub id: PortId,
    pub path: String,
    pub baud_rate: u32,
    pub state: PortState,
}

#[derive(Default)]
struct SessionState {
    ports: BTreeMap<PortId, PortHandle>,
    baud_rate: Option<u32>,
}

impl SessionState {
    fn has_active(&self) -> bool {
        self.ports.values().any(PortHandle::is_active)
    }

    fn check_rate(&self, config: &PortConfig) -> Result<(), PortError> {
        match self.baud_rate {
            Some(current) if current != config.baud_rate && self.has_active() => {
                Err(PortError::RateMismatch(format!(
                    "{} is configured for {} baud but open ports use {}",
                    config.path, config.baud_rate, current
                )))
            }
            _ => Ok(()),
        }
    }

    fn distinct_rates(&self) -> BTreeSet<u32> {
        self.ports
            .values()
            .filter(|p| p.is_active())
            .map(PortHandle::baud_rate)
            .collect()
    }
}

/// State shared with the per-port forwarding tasks
struct Shared {
    session: RwLock<SessionState>,
    event_tx: broadcast::Sender<PortEvent>,
}

impl Shared {
    async fn close_port(&self, id: PortId, reason: CloseReason) -> bool {
        let handle = {
            let mut session = self.session.write().await;
            let handle = session.ports.remove(&id);
            if session.ports.is_empty() {
                session.baud_rate = None;
            }
            handle
        };
        let Some(handle) = handle else {
            return false;
        };
        handle.close().await;
        info!(%id, ?reason, "Port closed");
        let _ = self.event_tx.send(PortEvent::Closed { id, reason });
        true
    }

    async fn close_all(&self, reason: CloseReason) -> usize {
        let handles = {
            let mut session = self.session.write().await;
            session.baud_rate = None;
            std::mem::take(&mut session.ports)
        };
        let count = handles.len();
        for (id, handle) in handles {
            handle.close().await;
            let _ = self.event_tx.send(PortEvent::Closed {
                id,
                reason: reason.clone(),
            });
        }
        count
    }

    async fn verify_rates(&self) -> Result<(), PortError> {
        let rates = self.session.read().await.distinct_rates();
        if rates.len() <= 1 {
            return Ok(());
        }
        let reason = format!("Active ports disagree on baud rate: {:?}", rates);
        self.reset(reason.clone()).await;
        Err(PortError::RateMismatch(reason))
    }

    async fn reset(&self, reason: String) {
        warn!("{}. Disconnecting all ports.", reason);
        self.close_all(CloseReason::RateMismatch).await;
        let _ = self.event_tx.send(PortEvent::RateMismatch { reason });
    }

    async fn is_active(&self, id: PortId) -> bool {
        self.session
            .read()
            .await
            .ports
            .get(&id)
            .is_some_and(PortHandle::is_active)
    }
}

/// Manager for every serial connection in one terminal session
pub struct PortManager {
    transport: Arc<dyn SerialTransport>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl PortManager {
    /// Create a new port manager over the given transport
    pub fn new(transport: Arc<dyn SerialTransport>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            transport,
            shared: Arc::new(Shared {
                session: RwLock::new(SessionState::default()),
                event_tx,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a device. Fails with `RateMismatch` if other active ports use a
    /// different baud rate.
    pub async fn open(&self, config: PortConfig) -> Result<PortId, PortError> {
        self.shared.session.read().await.check_rate(&config)?;

        // Device opens block, so run them off the async workers with no lock held
        let transport = self.transport.clone();
        let open_config = config.clone();
        let streams = tokio::task::spawn_blocking(move || transport.open(&open_config))
            .await
            .map_err(|e| PortError::ChannelError(format!("Open task failed: {e}")))?
            .inspect_err(|e| {
                error!("{}", e);
            })?;

        let mut session = self.shared.session.write().await;
        // Another open may have fixed a different rate meanwhile; dropping the
        // streams closes the device again
        session.check_rate(&config)?;

        let id = PortId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let handle = PortActor::spawn(id, config.clone(), streams, output_tx)?;

        session.ports.insert(id, handle);
        session.baud_rate = Some(config.baud_rate);
        drop(session);

        tokio::spawn(forward_output(self.shared.clone(), id, output_rx));

        let _ = self.shared.event_tx.send(PortEvent::Opened {
            id,
            path: config.path,
            baud_rate: config.baud_rate,
        });
        Ok(id)
    }

    /// Close one port. Unknown or already-closed ports are a no-op.
    pub async fn close(&self, id: PortId) -> bool {
        self.shared.close_port(id, CloseReason::Requested).await
    }

    /// Close every port and forget the session baud rate
    pub async fn close_all(&self) -> usize {
        self.shared.close_all(CloseReason::Requested).await
    }

    /// Re-check that every active port shares one baud rate. On mismatch all
    /// ports are closed and a `RateMismatch` event is emitted.
    pub async fn verify_rates(&self) -> Result<(), PortError> {
        self.shared.verify_rates().await
    }

    /// Close everything because a peer reported an inconsistent rate
    pub async fn disconnect_all(&self, reason: &str) {
        self.shared.reset(reason.to_string()).await;
    }

    /// Write raw bytes to one port
    pub async fn write(&self, id: PortId, data: &[u8]) -> Result<usize, PortError> {
        self.verify_rates().await?;
        let handle = self
            .shared
            .session
            .read()
            .await
            .ports
            .get(&id)
            .cloned()
            .ok_or(PortError::NotFound(id.0))?;
        handle.write(data).await
    }

    /// Send `text` plus a newline to every active port.
    ///
    /// Every port is attempted; the first failure is returned.
    pub async fn write_line(&self, text: &str) -> Result<usize, PortError> {
        self.verify_rates().await?;

        let handles: Vec<PortHandle> = {
            let session = self.shared.session.read().await;
            session
                .ports
                .values()
                .filter(|p| p.is_active())
                .cloned()
                .collect()
        };
        if handles.is_empty() {
            return Err(PortError::NoActivePorts);
        }

        let data = format!("{}\n", text).into_bytes();
        let mut written = 0;
        let mut first_error = None;
        for handle in handles {
            match handle.write(&data).await {
                Ok(n) => written += n,
                Err(e) => {
                    warn!(id = %handle.id(), "Send failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(bytes = written, "Message sent: {}", text);
                Ok(written)
            }
        }
    }

    /// Effective baud rate of the session, if any port has been opened
    pub async fn baud_rate(&self) -> Option<u32> {
        self.shared.session.read().await.baud_rate
    }

    /// Whether any port is currently active
    pub async fn is_connected(&self) -> bool {
        self.shared.session.read().await.has_active()
    }

    /// List open ports in the order they were opened
    pub async fn list(&self) -> Vec<PortInfo> {
        self.shared
            .session
            .read()
            .await
            .ports
            .values()
            .map(|p| PortInfo {
                id: p.id(),
                path: p.path().to_string(),
                baud_rate: p.baud_rate(),
                state: p.state(),
            })
            .collect()
    }

    /// Subscribe to events from all ports
    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.shared.event_tx.subscribe()
    }
}

async fn forward_output(
    shared: Arc<Shared>,
    id: PortId,
    mut output_rx: mpsc::UnboundedReceiver<PortOutput>,
) {
    while let Some(output) = output_rx.recv().await {
        match output {
            PortOutput::Line { text, timestamp } => {
                if shared.verify_rates().await.is_err() || !shared.is_active(id).await {
                    break;
                }
                debug!(%id, "Data received: {}", text);
                let _ = shared
                    .event_tx
                    .send(PortEvent::Line { id, text, timestamp });
            }
            PortOutput::Eof => {
                shared.close_port(id, CloseReason::EndOfStream).await;
                break;
            }
            PortOutput::ReadFailed(e) => {
                error!(%id, "Serial read failed: {}", e);
                shared.close_port(id, CloseReason::ReadFailed(e)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackDevice, LoopbackTransport};
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup(paths: &[&str]) -> (PortManager, Vec<LoopbackDevice>) {
        let transport = LoopbackTransport::new();
        let devices = paths.iter().map(|p| transport.device(p)).collect();
        (PortManager::new(Arc::new(transport)), devices)
    }

    fn config(path: &str, baud_rate: u32) -> PortConfig {
        PortConfig {
            path: path.to_string(),
            baud_rate,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<PortEvent>) -> PortEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("event channel closed")
    }

    async fn next_line(rx: &mut broadcast::Receiver<PortEvent>) -> (PortId, String) {
        loop {
            if let PortEvent::Line { id, text, .. } = next_event(rx).await {
                return (id, text);
            }
        }
    }

    #[tokio::test]
    async fn open_assigns_stable_ids_and_rate() {
        let (manager, _devices) = setup(&["/dev/a", "/dev/b"]);
        let a = manager.open(config("/dev/a", 9600)).await.unwrap();
        let b = manager.open(config("/dev/b", 9600)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "port-1");
        assert_eq!(manager.baud_rate().await, Some(9600));
        assert!(manager.is_connected().await);

        let ids: Vec<PortId> = manager.list().await.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn open_with_different_rate_is_rejected() {
        let (manager, _devices) = setup(&["/dev/a", "/dev/b"]);
        manager.open(config("/dev/a", 9600)).await.unwrap();
        let err = manager.open(config("/dev/b", 115200)).await.unwrap_err();
        assert!(matches!(err, PortError::RateMismatch(_)));
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn open_failure_is_surfaced() {
        let (manager, _devices) = setup(&[]);
        let err = manager.open(config("/dev/nope", 9600)).await.unwrap_err();
        assert!(matches!(err, PortError::TransportOpenFailure { .. }));
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn rate_can_change_after_close_all() {
        let (manager, _devices) = setup(&["/dev/a"]);
        manager.open(config("/dev/a", 9600)).await.unwrap();
        assert_eq!(manager.close_all().await, 1);
        assert_eq!(manager.baud_rate().await, None);
        manager.open(config("/dev/a", 115200)).await.unwrap();
        assert_eq!(manager.baud_rate().await, Some(115200));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (manager, _devices) = setup(&["/dev/a"]);
        let id = manager.open(config("/dev/a", 9600)).await.unwrap();
        assert!(manager.close(id).await);
        assert!(!manager.close(id).await);
        assert!(!manager.close(PortId(99)).await);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn lines_from_each_port_are_tagged() {
        let (manager, devices) = setup(&["/dev/a", "/dev/b"]);
        let mut rx = manager.subscribe();
        let a = manager.open(config("/dev/a", 9600)).await.unwrap();
        let b = manager.open(config("/dev/b", 9600)).await.unwrap();

        devices[0].push("AB");
        devices[0].push("C\n");
        assert_eq!(next_line(&mut rx).await, (a, "ABC".to_string()));

        devices[1].push("DEF\n");
        assert_eq!(next_line(&mut rx).await, (b, "DEF".to_string()));
    }

    #[tokio::test]
    async fn end_of_stream_closes_only_that_port() {
        let (manager, devices) = setup(&["/dev/a", "/dev/b"]);
        let mut rx = manager.subscribe();
        let a = manager.open(config("/dev/a", 9600)).await.unwrap();
        let b = manager.open(config("/dev/b", 9600)).await.unwrap();

        devices[0].end();
        loop {
            if let PortEvent::Closed { id, reason } = next_event(&mut rx).await {
                assert_eq!(id, a);
                assert_eq!(reason, CloseReason::EndOfStream);
                break;
            }
        }
        let remaining: Vec<PortId> = manager.list().await.iter().map(|p| p.id).collect();
        assert_eq!(remaining, vec![b]);
    }

    #[tokio::test]
    async fn read_failure_is_contained() {
        let (manager, devices) = setup(&["/dev/a", "/dev/b"]);
        let mut rx = manager.subscribe();
        let a = manager.open(config("/dev/a", 9600)).await.unwrap();
        let b = manager.open(config("/dev/b", 9600)).await.unwrap();

        devices[0].fail_read("parity error");
        loop {
            if let PortEvent::Closed { id, reason } = next_event(&mut rx).await {
                assert_eq!(id, a);
                assert_eq!(reason, CloseReason::ReadFailed("parity error".into()));
                break;
            }
        }
        devices[1].push("still here\n");
        assert_eq!(next_line(&mut rx).await, (b, "still here".to_string()));
    }

    #[tokio::test]
    async fn write_line_reaches_every_port() {
        let (manager, devices) = setup(&["/dev/a", "/dev/b"]);
        manager.open(config("/dev/a", 9600)).await.unwrap();
        manager.open(config("/dev/b", 9600)).await.unwrap();

        assert_eq!(manager.write_line("hello").await.unwrap(), 12);
        assert_eq!(devices[0].written(), b"hello\n");
        assert_eq!(devices[1].written(), b"hello\n");
    }

    #[tokio::test]
    async fn write_failure_reports_but_keeps_ports() {
        let (manager, devices) = setup(&["/dev/a", "/dev/b"]);
        manager.open(config("/dev/a", 9600)).await.unwrap();
        manager.open(config("/dev/b", 9600)).await.unwrap();

        devices[0].fail_writes(Some("stalled"));
        let err = manager.write_line("x").await.unwrap_err();
        assert!(matches!(err, PortError::TransportWriteFailure(_)));
        assert_eq!(devices[1].written(), b"x\n");
        assert_eq!(manager.list().await.len(), 2);
    }

    #[tokio::test]
    async fn write_without_ports_fails() {
        let (manager, _devices) = setup(&[]);
        assert_eq!(
            manager.write_line("x").await,
            Err(PortError::NoActivePorts)
        );
    }

    #[tokio::test]
    async fn disconnect_all_resets_session() {
        let (manager, _devices) = setup(&["/dev/a", "/dev/b"]);
        let mut rx = manager.subscribe();
        manager.open(config("/dev/a", 9600)).await.unwrap();
        manager.open(config("/dev/b", 9600)).await.unwrap();

        manager.disconnect_all("relay says no").await;
        assert!(!manager.is_connected().await);
        assert_eq!(manager.baud_rate().await, None);

        let mut closed = 0;
        loop {
            match next_event(&mut rx).await {
                PortEvent::Closed { reason, .. } => {
                    assert_eq!(reason, CloseReason::RateMismatch);
                    closed += 1;
                }
                PortEvent::RateMismatch { reason } => {
                    assert_eq!(reason, "relay says no");
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(closed, 2);
    }

    #[tokio::test]
    async fn closing_the_last_port_forgets_the_rate() {
        let (manager, devices) = setup(&["/dev/a", "/dev/b"]);
        let mut rx = manager.subscribe();
        let a = manager.open(config("/dev/a", 9600)).await.unwrap();
        let b = manager.open(config("/dev/b", 9600)).await.unwrap();

        assert!(manager.close(a).await);
        assert_eq!(manager.baud_rate().await, Some(9600));

        devices[1].end();
        loop {
            if let PortEvent::Closed { id, .. } = next_event(&mut rx).await {
                assert_eq!(id, b);
                break;
            }
        }
        assert!(!manager.is_connected().await);
        assert_eq!(manager.baud_rate().await, None);
        manager.open(config("/dev/a", 115200)).await.unwrap();
        assert_eq!(manager.baud_rate().await, Some(115200));
    }

    /// Loopback device that takes a while to open, like a real serial port
    struct SlowTransport {
        inner: LoopbackTransport,
        delay: Duration,
    }

    impl SerialTransport for SlowTransport {
        fn open(&self, config: &PortConfig) -> Result<crate::SerialStreams, PortError> {
            std::thread::sleep(self.delay);
            self.inner.open(config)
        }
    }

    #[tokio::test]
    async fn slow_open_does_not_stall_the_session() {
        let inner = LoopbackTransport::new();
        let _device = inner.device("/dev/slow");
        let manager = Arc::new(PortManager::new(Arc::new(SlowTransport {
            inner,
            delay: Duration::from_millis(500),
        })));

        let opening = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.open(config("/dev/slow", 9600)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert!(!manager.is_connected().await);
        assert!(manager.write_line("x").await.is_err());
        assert!(started.elapsed() < Duration::from_millis(250));

        opening.await.unwrap().unwrap();
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn racing_opens_at_different_rates_keep_one() {
        let (manager, _devices) = setup(&["/dev/a", "/dev/b"]);
        let manager = Arc::new(manager);
        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.open(config("/dev/a", 9600)).await })
        };
        let second = manager.open(config("/dev/b", 115200)).await;
        let first = first.await.unwrap();

        assert!(first.is_ok() != second.is_ok());
        assert_eq!(manager.list().await.len(), 1);
        assert_eq!(manager.verify_rates().await, Ok(()));
    }

    #[tokio::test]
    async fn verify_rates_passes_for_consistent_session() {
        let (manager, _devices) = setup(&["/dev/a", "/dev/b"]);
        assert!(manager.verify_rates().await.is_ok());
        manager.open(config("/dev/a", 57600)).await.unwrap();
        manager.open(config("/dev/b", 57600)).await.unwrap();
        assert!(manager.verify_rates().await.is_ok());
    }
}

//! Two terminal sessions kept in sync through a real relay.

use std::sync::Arc;
use std::time::Duration;

use port_manager::{LoopbackDevice, LoopbackTransport, PortManager};
use relay_protocol::{DedupCache, RATE_MISMATCH_REASON, RelayMessage};
use relay_server::{HubConfig, ParticipantId, ParticipantState, RelayState, create_router};
use serial_terminal::{
    LoggedMessage, MessageKind, MessageSource, RelayClient, RelayEvent, SessionEvent,
    TerminalSession,
};
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_relay() -> (RelayState, String) {
    let state = RelayState::new(HubConfig {
        random_interval: Duration::from_millis(20),
        ..HubConfig::default()
    });
    let app = create_router(state.clone(), None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("ws://{}/ws", addr))
}

struct Terminal {
    session: Arc<TerminalSession>,
    device: LoopbackDevice,
    events: broadcast::Receiver<SessionEvent>,
    _cancel: tokio_util::sync::DropGuard,
}

async fn terminal(url: &str, path: &str) -> Terminal {
    let transport = LoopbackTransport::new();
    let device = transport.device(path);
    let ports = Arc::new(PortManager::new(Arc::new(transport)));
    let dedup = Arc::new(Mutex::new(DedupCache::unbounded()));
    let relay = RelayClient::connect(url, dedup).await.unwrap();
    let session = Arc::new(TerminalSession::new(ports, Some(relay)));
    let events = session.subscribe();

    let cancel = CancellationToken::new();
    let pump = session.clone();
    let token = cancel.clone();
    tokio::spawn(async move { pump.run(token).await });

    Terminal {
        session,
        device,
        events,
        _cancel: cancel.drop_guard(),
    }
}

async fn next_message(rx: &mut broadcast::Receiver<SessionEvent>) -> LoggedMessage {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(SessionEvent::Message(message)) = rx.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

async fn next_notice(rx: &mut broadcast::Receiver<SessionEvent>, needle: &str) -> String {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(SessionEvent::Notice(text)) = rx.recv().await {
                if text.contains(needle) {
                    return text;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for a notice")
}

async fn wait_for_participants(state: &RelayState, count: usize) {
    timeout(TEST_TIMEOUT, async {
        while state.hub.participant_count().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("participants never connected");
}

#[tokio::test]
async fn device_line_reaches_the_other_terminal() {
    let (state, url) = start_relay().await;
    let mut a = terminal(&url, "/dev/a").await;
    let mut b = terminal(&url, "/dev/b").await;
    wait_for_participants(&state, 2).await;

    a.session.connect("/dev/a").await.unwrap();
    b.session.connect("/dev/b").await.unwrap();

    a.device.push("temp=21.5\n");

    let local = next_message(&mut a.events).await;
    assert_eq!(local.body, "temp=21.5");
    assert!(matches!(local.source, MessageSource::Port(_)));

    let remote = next_message(&mut b.events).await;
    assert_eq!(remote.body, "temp=21.5");
    assert_eq!(remote.source, MessageSource::Relay);
    assert_eq!(remote.kind, MessageKind::Received);
}

#[tokio::test]
async fn shared_device_output_is_shown_once_per_terminal() {
    let (state, url) = start_relay().await;
    let mut a = terminal(&url, "/dev/a").await;
    let mut b = terminal(&url, "/dev/b").await;
    wait_for_participants(&state, 2).await;
    a.session.connect("/dev/a").await.unwrap();
    b.session.connect("/dev/b").await.unwrap();

    // Both terminals read the same line from their own device
    a.device.push("same\n");
    assert_eq!(next_message(&mut a.events).await.body, "same");
    let relayed = next_message(&mut b.events).await;
    assert_eq!(relayed.body, "same");
    assert_eq!(relayed.source, MessageSource::Relay);

    // b already showed "same" from the relay, so its own copy is neither
    // displayed nor republished
    b.device.push("same\nnext\n");
    let local = next_message(&mut b.events).await;
    assert_eq!(local.body, "next");
    assert!(matches!(local.source, MessageSource::Port(_)));

    let from_b = next_message(&mut a.events).await;
    assert_eq!(from_b.body, "next");
    assert_eq!(state.metrics.snapshot().messages.forwarded, 2);

    let shown = b.session.messages().await;
    assert_eq!(shown.iter().filter(|m| m.body == "same").count(), 1);
}

#[tokio::test]
async fn lines_stamped_with_the_open_port_rate() {
    let (state, url) = start_relay().await;
    let a = terminal(&url, "/dev/a").await;
    // A viewer that never declares a rate
    let viewer = RelayClient::connect(&url, Arc::new(Mutex::new(DedupCache::unbounded())))
        .await
        .unwrap();
    wait_for_participants(&state, 2).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    viewer.on_broadcast(move |message| {
        let _ = tx.send(message);
    });

    a.session.connect("/dev/a").await.unwrap();
    // Only affects the next connect; the open port stays at 9600
    a.session.set_baud_rate(115200);
    a.device.push("reading\n");

    let got = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got.message, "reading");
    assert_eq!(got.baud_rate, Some(9600));
    assert_eq!(got.port.as_deref(), Some("port-1"));
}

#[tokio::test]
async fn closed_relay_does_not_fail_local_actions() {
    let (_state, url) = start_relay().await;
    let mut a = terminal(&url, "/dev/a").await;
    let relay = a.session.relay().unwrap();
    relay.close();
    assert!(relay.is_closed());

    a.session.set_baud_rate(19200);
    assert_eq!(a.session.baud_rate(), 19200);
    next_notice(&mut a.events, "baud rate 19200").await;

    let id = a.session.connect("/dev/a").await.unwrap();
    assert!(a.session.ports().is_connected().await);
    assert_eq!(a.device.opened_at(), Some(19200));
    next_notice(&mut a.events, "baud rate 19200").await;

    assert!(a.session.close(id).await);
    assert!(!a.session.ports().is_connected().await);
}

#[tokio::test]
async fn rate_mismatch_disconnects_every_terminal() {
    let (state, url) = start_relay().await;
    let mut a = terminal(&url, "/dev/a").await;
    let mut b = terminal(&url, "/dev/b").await;
    wait_for_participants(&state, 2).await;

    a.session.connect("/dev/a").await.unwrap();
    b.session.connect("/dev/b").await.unwrap();
    timeout(TEST_TIMEOUT, async {
        let declared = Some(ParticipantState::RateDeclared(9600));
        while state.hub.participant_state(ParticipantId(1)).await != declared
            || state.hub.participant_state(ParticipantId(2)).await != declared
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rates never declared");

    // b's new rate disagrees with a's open port
    b.session.set_baud_rate(115200);

    next_notice(&mut a.events, RATE_MISMATCH_REASON).await;
    next_notice(&mut b.events, RATE_MISMATCH_REASON).await;

    timeout(TEST_TIMEOUT, async {
        while a.session.ports().is_connected().await || b.session.ports().is_connected().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ports stayed open");
    assert!(a.session.send("hello").await.is_err());
}

#[tokio::test]
async fn sent_messages_are_not_relayed() {
    let (state, url) = start_relay().await;
    let mut a = terminal(&url, "/dev/a").await;
    let b = terminal(&url, "/dev/b").await;
    wait_for_participants(&state, 2).await;
    a.session.connect("/dev/a").await.unwrap();

    let sent = a.session.send("reset").await.unwrap();
    assert_eq!(sent.kind, MessageKind::Sent);
    assert_eq!(a.device.written(), b"reset\n");
    assert_eq!(next_message(&mut a.events).await.body, "reset");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.session.messages().await.is_empty());
    assert_eq!(state.metrics.snapshot().messages.received, 0);
}

#[tokio::test]
async fn relay_client_publish_skips_seen_bodies() {
    let (state, url) = start_relay().await;
    let dedup = Arc::new(Mutex::new(DedupCache::unbounded()));
    let sender = RelayClient::connect(&url, dedup.clone()).await.unwrap();
    let receiver = RelayClient::connect(&url, Arc::new(Mutex::new(DedupCache::unbounded())))
        .await
        .unwrap();
    wait_for_participants(&state, 2).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    receiver.on_broadcast(move |message| {
        let _ = tx.send(message);
    });

    assert!(sender.publish(RelayMessage::new("once")).await.unwrap());
    assert!(!sender.publish(RelayMessage::new("once")).await.unwrap());
    assert!(dedup.lock().await.seen("once"));

    let got = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, RelayMessage::new("once"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn random_numbers_arrive_through_the_client() {
    let (_state, url) = start_relay().await;
    let client = RelayClient::connect(&url, Arc::new(Mutex::new(DedupCache::unbounded())))
        .await
        .unwrap();
    let mut events = client.subscribe();

    client.start_random_numbers().unwrap();
    let event = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
    match event {
        RelayEvent::RandomNumber(sample) => assert!(sample.starts_with("1,")),
        other => panic!("expected a random number, got {:?}", other),
    }
    client.stop_random_numbers().unwrap();

    client.close();
    assert!(client.is_closed());
    assert!(client.publish_baud_rate(9600).is_err());
}

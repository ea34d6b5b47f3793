//! Room-wide relay state: participants, declared baud rates, and broadcast history.
//!
//! Every event is applied under one lock, so a participant handler never sees
//! a half-finished reset.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_protocol::{DedupCache, RATE_MISMATCH_REASON, RelayMessage, ServerEvent};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::generator;
use crate::metrics::RelayMetrics;

/// Unique identifier for a connected participant
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ParticipantId(pub u64);

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "participant-{}", self.0)
    }
}

/// Where a participant is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantState {
    /// Connected, no baud rate declared yet
    Connected,
    RateDeclared(u32),
    /// Forced off by a rate mismatch; must declare a rate again
    Disconnected,
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Cap on remembered broadcast bodies; `None` keeps every body
    pub history_capacity: Option<usize>,
    pub random_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_capacity: None,
            random_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateOutcome {
    Accepted,
    /// Rates disagreed; everyone was sent `disconnectAll`
    Mismatch,
    UnknownParticipant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent to this many other participants
    Forwarded(usize),
    /// Body already broadcast; dropped
    Duplicate,
    /// Rates disagreed; everyone was sent `disconnectAll`
    RateMismatch,
    /// A reset is still waiting for participants to redeclare their rate
    Suspended,
}

struct Participant {
    state: ParticipantState,
    tx: mpsc::UnboundedSender<ServerEvent>,
    generator: Option<CancellationToken>,
}

impl Participant {
    fn stop_generator(&mut self) {
        if let Some(token) = self.generator.take() {
            token.cancel();
        }
    }
}

struct HubState {
    participants: HashMap<ParticipantId, Participant>,
    history: DedupCache,
}

impl HubState {
    fn distinct_rates(&self) -> BTreeSet<u32> {
        self.participants
            .values()
            .filter_map(|p| match p.state {
                ParticipantState::RateDeclared(rate) => Some(rate),
                _ => None,
            })
            .collect()
    }

    fn awaiting_redeclare(&self) -> bool {
        self.participants
            .values()
            .any(|p| p.state == ParticipantState::Disconnected)
    }
}

/// Central broadcast hub shared by every participant handler
pub struct RelayHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    config: HubConfig,
    metrics: Arc<RelayMetrics>,
}

impl RelayHub {
    pub fn new(config: HubConfig, metrics: Arc<RelayMetrics>) -> Self {
        let history = match config.history_capacity {
            Some(capacity) => DedupCache::bounded(capacity),
            None => DedupCache::unbounded(),
        };
        Self {
            state: Mutex::new(HubState {
                participants: HashMap::new(),
                history,
            }),
            next_id: AtomicU64::new(1),
            config,
            metrics,
        }
    }

    /// Register a new participant with no declared rate.
    ///
    /// Events addressed to it arrive on the returned receiver.
    pub async fn connect(&self) -> (ParticipantId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = ParticipantId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.participants.insert(
            id,
            Participant {
                state: ParticipantState::Connected,
                tx,
                generator: None,
            },
        );
        self.metrics.participant_connected();
        info!(%id, "A user connected");
        (id, rx)
    }

    pub async fn declare_rate(&self, id: ParticipantId, baud_rate: u32) -> RateOutcome {
        let mut state = self.state.lock().await;
        let Some(participant) = state.participants.get_mut(&id) else {
            return RateOutcome::UnknownParticipant;
        };
        participant.state = ParticipantState::RateDeclared(baud_rate);
        debug!(%id, baud_rate, "Baud rate declared");

        if state.distinct_rates().len() > 1 {
            self.reset(&mut state);
            return RateOutcome::Mismatch;
        }
        RateOutcome::Accepted
    }

    /// Forward a message to every participant except the sender
    pub async fn publish(&self, sender: ParticipantId, message: RelayMessage) -> PublishOutcome {
        let mut state = self.state.lock().await;
        self.metrics.message_received();

        if state.distinct_rates().len() > 1 {
            self.reset(&mut state);
            return PublishOutcome::RateMismatch;
        }

        if state.awaiting_redeclare() {
            debug!(%sender, "Relay suspended after rate mismatch, dropping message");
            self.metrics.message_suspended();
            return PublishOutcome::Suspended;
        }

        if !state.history.check_and_remember(&message.message) {
            debug!(
                %sender,
                "Message '{}' already received, not processing again.", message.message
            );
            self.metrics.duplicate_dropped();
            return PublishOutcome::Duplicate;
        }

        let mut forwarded = 0;
        for (id, participant) in &state.participants {
            if *id == sender {
                continue;
            }
            if participant
                .tx
                .send(ServerEvent::Message(message.clone()))
                .is_ok()
            {
                forwarded += 1;
            }
        }
        self.metrics.messages_forwarded(forwarded as u64);
        debug!(%sender, forwarded, "Message broadcast");
        PublishOutcome::Forwarded(forwarded)
    }

    /// Drop a participant and its rate entry
    pub async fn disconnect(&self, id: ParticipantId) {
        let mut state = self.state.lock().await;
        if let Some(mut participant) = state.participants.remove(&id) {
            participant.stop_generator();
            self.metrics.participant_disconnected();
            info!(%id, "A user disconnected");
        }
        let rates = state.distinct_rates();
        if rates.len() > 1 {
            debug!(?rates, "Rates still disagree after disconnect");
        }
    }

    /// Start the synthetic number stream for one participant. Already running is a no-op.
    pub async fn start_random_numbers(&self, id: ParticipantId) {
        let mut state = self.state.lock().await;
        let Some(participant) = state.participants.get_mut(&id) else {
            return;
        };
        if participant.generator.is_some() {
            return;
        }
        let token = CancellationToken::new();
        generator::spawn(
            participant.tx.clone(),
            self.config.random_interval,
            token.clone(),
        );
        participant.generator = Some(token);
        debug!(%id, "Random numbers started");
    }

    pub async fn stop_random_numbers(&self, id: ParticipantId) {
        if let Some(participant) = self.state.lock().await.participants.get_mut(&id) {
            participant.stop_generator();
            debug!(%id, "Random numbers stopped");
        }
    }

    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.participants.len()
    }

    pub async fn participant_state(&self, id: ParticipantId) -> Option<ParticipantState> {
        self.state
            .lock()
            .await
            .participants
            .get(&id)
            .map(|p| p.state)
    }

    pub async fn distinct_rates(&self) -> BTreeSet<u32> {
        self.state.lock().await.distinct_rates()
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    /// Tell everyone to disconnect, then forget every rate and broadcast body.
    ///
    /// One participant with a bad rate disrupts the whole room. Only participants
    /// that had declared a rate must redeclare; undeclared ones stay compatible.
    fn reset(&self, state: &mut HubState) {
        warn!("Baud rates do not match across all connected ports. Disconnecting all clients.");
        for participant in state.participants.values_mut() {
            let _ = participant
                .tx
                .send(ServerEvent::DisconnectAll(RATE_MISMATCH_REASON.to_string()));
            if let ParticipantState::RateDeclared(_) = participant.state {
                participant.state = ParticipantState::Disconnected;
            }
        }
        state.history.clear();
        self.metrics.rate_mismatch();
    }
}

//! Playback-state convergence.
//!
//! Every peer runs one engine over the same message vocabulary. Remote
//! updates are applied inside a suppression window so the player's own
//! acknowledgment callbacks are not rebroadcast; without that window a
//! single seek would ricochet between peers forever. Real divergence is
//! caught by a periodic position poll and corrected with a single `seek`
//! broadcast once it exceeds the drift threshold.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::error::{PlayerError, SessionError};
use crate::player::{Player, PlayerEvent};
use crate::protocol::{Message, PeerId, PlaybackState};
use crate::session::{EndpointEvent, EventKind, SessionEndpoint};

/// Engine lifecycle phase for the local player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No media loaded.
    Idle,
    /// Media id known, player not yet ready.
    Loading,
    /// Player ready, actively converging.
    Synced,
}

/// Remote state waiting for the player to come up.
#[derive(Debug, Clone, Copy)]
struct PendingApply {
    position_seconds: f64,
    rate: f64,
    paused: bool,
}

struct EngineState {
    phase: SyncPhase,
    media_id: Option<String>,
    /// Deadline of the open suppression window, if any.
    suppress_until: Option<Instant>,
    pending: Option<PendingApply>,
    /// Last position agreed with the room, plus everything needed to
    /// extrapolate it forward.
    reference_position: f64,
    reference_at: Instant,
    reference_rate: f64,
    reference_paused: bool,
    player_ready: bool,
    requested_bootstrap: bool,
    last_player_error: Option<String>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            media_id: None,
            suppress_until: None,
            pending: None,
            reference_position: 0.0,
            reference_at: Instant::now(),
            reference_rate: 1.0,
            reference_paused: true,
            player_ready: false,
            requested_bootstrap: false,
            last_player_error: None,
        }
    }

    fn suppressed(&self) -> bool {
        self.suppress_until
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Where the room believes the playhead is right now.
    fn expected_position(&self) -> f64 {
        if self.reference_paused {
            self.reference_position
        } else {
            self.reference_position
                + self.reference_at.elapsed().as_secs_f64() * self.reference_rate
        }
    }
}

struct EngineShared {
    endpoint: SessionEndpoint,
    player: Arc<dyn Player>,
    config: SyncConfig,
    state: Mutex<EngineState>,
}

/// The convergence state machine for one local player.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Wire the engine to an endpoint and start its event loop.
    pub fn start(
        endpoint: SessionEndpoint,
        player: Arc<dyn Player>,
        config: SyncConfig,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            endpoint,
            player,
            config,
            state: Mutex::new(EngineState::new()),
        });
        let task = tokio::spawn(run_loop(Arc::clone(&shared)));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Load media on behalf of the local user and announce it to the room.
    pub fn load_media(&self, media_id: &str) -> Result<(), SessionError> {
        self.shared.player.load(media_id)?;
        let announce = {
            let mut state = self.shared.state.lock();
            state.media_id = Some(media_id.to_string());
            state.phase = SyncPhase::Loading;
            state.pending = None;
            self.shared.reanchor(&mut state);
            Message::VideoInfo {
                media_id: media_id.to_string(),
                position_seconds: state.reference_position,
                rate: state.reference_rate,
                paused: state.reference_paused,
            }
        };
        tracing::info!(media_id, "local media loaded");
        self.shared.endpoint.send(announce)
    }

    pub fn phase(&self) -> SyncPhase {
        self.shared.state.lock().phase
    }

    pub fn media_id(&self) -> Option<String> {
        self.shared.state.lock().media_id.clone()
    }

    /// Message shown to the user after the most recent player fault.
    pub fn last_player_error(&self) -> Option<String> {
        self.shared.state.lock().last_player_error.clone()
    }

    /// Live snapshot of the converged state.
    pub fn playback_state(&self) -> PlaybackState {
        let state = self.shared.state.lock();
        let player = &self.shared.player;
        PlaybackState {
            media_id: state.media_id.clone(),
            position_seconds: player.position().unwrap_or(state.reference_position),
            rate: player.rate().unwrap_or(state.reference_rate),
            paused: !player.is_playing().unwrap_or(!state.reference_paused),
        }
    }

    /// Stop the event loop and all timers it owns. Idempotent.
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_loop(shared: Arc<EngineShared>) {
    let mut data = shared.endpoint.subscribe(EventKind::Data);
    let mut connects = shared.endpoint.subscribe(EventKind::Connect);
    let mut player_events = shared.player.subscribe();
    let mut poll = tokio::time::interval(shared.config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = data.recv() => match event {
                Some(EndpointEvent::Data { from, message }) => shared.handle_remote(&from, message),
                Some(_) => {}
                None => break,
            },
            event = connects.recv() => match event {
                Some(EndpointEvent::Connect { peer }) => shared.handle_peer_connected(&peer),
                Some(_) => {}
                None => break,
            },
            event = player_events.recv() => match event {
                Some(event) => shared.handle_player_event(event),
                None => break,
            },
            _ = poll.tick() => shared.poll_drift(),
        }
    }
    tracing::debug!(room_id = %shared.endpoint.room_id(), "sync engine loop ended");
}

impl EngineShared {
    /// Open (or extend) the suppression window.
    fn begin_suppression(&self, state: &mut EngineState) {
        let deadline = Instant::now() + self.config.settle_delay;
        state.suppress_until = Some(match state.suppress_until {
            Some(existing) => existing.max(deadline),
            None => deadline,
        });
    }

    /// Re-anchor the room-agreed reference on the player's live state.
    fn reanchor(&self, state: &mut EngineState) {
        if let Ok(position) = self.player.position() {
            state.reference_position = position;
        }
        if let Ok(rate) = self.player.rate() {
            state.reference_rate = rate;
        }
        if let Ok(playing) = self.player.is_playing() {
            state.reference_paused = !playing;
        }
        state.reference_at = Instant::now();
    }

    fn handle_remote(&self, from: &PeerId, message: Message) {
        match message {
            Message::VideoInfo {
                media_id,
                position_seconds,
                rate,
                paused,
            } => self.apply_video_info(media_id, position_seconds, rate, paused),
            Message::RequestVideoInfo => self.answer_video_info(from),
            command @ (Message::Play
            | Message::Pause
            | Message::Seek { .. }
            | Message::SpeedChange { .. }) => self.apply_command(command),
            // The chat replicator owns these.
            Message::Chat { .. } | Message::ChatHistory { .. } => {}
        }
    }

    fn apply_video_info(&self, media_id: String, position_seconds: f64, rate: f64, paused: bool) {
        let mut state = self.state.lock();
        let same_media = state.media_id.as_deref() == Some(media_id.as_str());
        let pending = PendingApply {
            position_seconds,
            rate,
            paused,
        };

        if same_media {
            match state.phase {
                // Either already converged, or degraded after a mutation
                // failure with the surface still up: apply right away.
                SyncPhase::Synced | SyncPhase::Loading if state.player_ready => {
                    self.begin_suppression(&mut state);
                    if self.apply_snapshot_or_idle(&mut state, &pending) {
                        state.phase = SyncPhase::Synced;
                        self.reanchor(&mut state);
                    }
                }
                _ => state.pending = Some(pending),
            }
            return;
        }

        // New media id: (re-)load and stash the state for the ready event.
        self.begin_suppression(&mut state);
        if let Err(err) = self.player.load(&media_id) {
            tracing::warn!(media_id, error = %err, "remote media rejected by player");
            state.phase = SyncPhase::Idle;
            state.media_id = None;
            state.pending = None;
            state.last_player_error = Some(err.to_string());
            return;
        }
        state.media_id = Some(media_id);
        state.phase = SyncPhase::Loading;
        state.pending = Some(pending);
    }

    /// Rate before seek before paused: a rate change applied after a seek
    /// causes a second visible jump.
    fn apply_snapshot(&self, snapshot: &PendingApply) -> Result<(), PlayerError> {
        self.player.set_rate(snapshot.rate)?;
        self.player.seek(snapshot.position_seconds)?;
        if snapshot.paused {
            self.player.pause()?;
        } else {
            self.player.play()?;
        }
        Ok(())
    }

    /// Apply a full snapshot; a rejection means the local player cannot
    /// follow the room at all, so drop to `Idle` rather than request the
    /// same snapshot again forever.
    fn apply_snapshot_or_idle(&self, state: &mut EngineState, snapshot: &PendingApply) -> bool {
        match self.apply_snapshot(snapshot) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot apply failed");
                state.last_player_error = Some(err.to_string());
                state.phase = SyncPhase::Idle;
                state.media_id = None;
                state.pending = None;
                false
            }
        }
    }

    fn apply_command(&self, command: Message) {
        let mut state = self.state.lock();
        match state.phase {
            SyncPhase::Synced => {
                self.begin_suppression(&mut state);
                let result = match &command {
                    Message::Play => self.player.play(),
                    Message::Pause => self.player.pause(),
                    Message::Seek { position_seconds } => self.player.seek(*position_seconds),
                    Message::SpeedChange { rate } => self.player.set_rate(*rate),
                    _ => Ok(()),
                };
                if let Err(err) = result {
                    tracing::warn!(error = %err, "remote mutation failed");
                    state.last_player_error = Some(err.to_string());
                    self.degrade_to_loading(&mut state);
                    return;
                }
                self.reanchor(&mut state);
            }
            SyncPhase::Loading => {
                // Not ready yet; fold into the pending snapshot so the
                // ready event applies the latest word from the room.
                let mut pending = state.pending.unwrap_or(PendingApply {
                    position_seconds: state.reference_position,
                    rate: state.reference_rate,
                    paused: state.reference_paused,
                });
                match command {
                    Message::Play => pending.paused = false,
                    Message::Pause => pending.paused = true,
                    Message::Seek { position_seconds } => {
                        pending.position_seconds = position_seconds;
                    }
                    Message::SpeedChange { rate } => pending.rate = rate,
                    _ => {}
                }
                state.pending = Some(pending);
            }
            SyncPhase::Idle => {}
        }
    }

    /// Mutation failed while converged: drop to `Loading` and ask the room
    /// for a fresh snapshot, since the drift poll only runs while synced.
    fn degrade_to_loading(&self, state: &mut EngineState) {
        state.phase = SyncPhase::Loading;
        state.pending = None;
        if let Err(err) = self.endpoint.send(Message::RequestVideoInfo) {
            tracing::debug!(error = %err, "re-bootstrap request not sent");
        }
    }

    fn answer_video_info(&self, from: &PeerId) {
        let snapshot = {
            let state = self.state.lock();
            if state.phase != SyncPhase::Synced {
                return;
            }
            self.fresh_snapshot(&state)
        };
        let Some(snapshot) = snapshot else { return };
        if let Err(err) = self.endpoint.send_to(from, snapshot) {
            tracing::debug!(peer = %from, error = %err, "state answer not delivered");
        }
    }

    fn handle_peer_connected(&self, peer: &PeerId) {
        let message = {
            let state = self.state.lock();
            match state.phase {
                SyncPhase::Synced => self.fresh_snapshot(&state),
                // No media here; ask the newcomer what the room is watching.
                SyncPhase::Idle if state.player_ready => Some(Message::RequestVideoInfo),
                _ => None,
            }
        };
        let Some(message) = message else { return };
        if let Err(err) = self.endpoint.send_to(peer, message) {
            tracing::debug!(peer = %peer, error = %err, "onboarding message not delivered");
        }
    }

    /// A `video_info` reflecting the player as it is *now*, not as it was
    /// at load time.
    fn fresh_snapshot(&self, state: &EngineState) -> Option<Message> {
        let media_id = state.media_id.clone()?;
        Some(Message::VideoInfo {
            media_id,
            position_seconds: self
                .player
                .position()
                .unwrap_or(state.reference_position),
            rate: self.player.rate().unwrap_or(state.reference_rate),
            paused: !self.player.is_playing().unwrap_or(!state.reference_paused),
        })
    }

    fn handle_player_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::Ready => self.handle_player_ready(),
            PlayerEvent::StateChanged { paused } => {
                let mut state = self.state.lock();
                if state.phase != SyncPhase::Synced {
                    return;
                }
                if state.suppressed() {
                    // Echo of a remote apply; swallow it.
                    return;
                }
                let message = if paused { Message::Pause } else { Message::Play };
                self.broadcast(&mut state, message);
            }
            PlayerEvent::RateChanged { rate } => {
                let mut state = self.state.lock();
                if state.phase != SyncPhase::Synced || state.suppressed() {
                    return;
                }
                self.broadcast(&mut state, Message::SpeedChange { rate });
            }
            PlayerEvent::Error { message } => {
                let mut state = self.state.lock();
                tracing::warn!(error = %message, "player fault");
                state.last_player_error = Some(message);
                state.phase = SyncPhase::Idle;
                state.media_id = None;
                state.pending = None;
            }
        }
    }

    fn handle_player_ready(&self) {
        let mut state = self.state.lock();
        state.player_ready = true;
        match state.phase {
            SyncPhase::Loading => {
                if let Some(pending) = state.pending.take() {
                    self.begin_suppression(&mut state);
                    if !self.apply_snapshot_or_idle(&mut state, &pending) {
                        return;
                    }
                }
                state.phase = SyncPhase::Synced;
                self.reanchor(&mut state);
                tracing::info!(media_id = ?state.media_id, "synced");
            }
            SyncPhase::Idle => {
                // Late-join bootstrap: ask the room what it is watching.
                if !state.requested_bootstrap {
                    state.requested_bootstrap = true;
                    if let Err(err) = self.endpoint.send(Message::RequestVideoInfo) {
                        tracing::debug!(error = %err, "bootstrap request not sent");
                    }
                }
            }
            SyncPhase::Synced => {}
        }
    }

    fn poll_drift(&self) {
        let mut state = self.state.lock();
        if state.phase != SyncPhase::Synced {
            return;
        }
        let position = match self.player.position() {
            Ok(position) => position,
            Err(err) => {
                tracing::debug!(error = %err, "position unavailable");
                return;
            }
        };
        let expected = state.expected_position();
        let drift = (position - expected).abs();
        if !state.suppressed() && drift > self.config.drift_threshold_secs {
            tracing::debug!(position, expected, drift, "drift past threshold, correcting");
            self.broadcast(
                &mut state,
                Message::Seek {
                    position_seconds: position,
                },
            );
        }
        self.reanchor(&mut state);
    }

    fn broadcast(&self, state: &mut EngineState, message: Message) {
        // Delivery failures are not retried; the next poll rebroadcasts a
        // corrected snapshot anyway.
        if let Err(err) = self.endpoint.send(message) {
            tracing::debug!(error = %err, "broadcast not delivered");
        }
        self.reanchor(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::headless::HeadlessPlayer;
    use crate::protocol::Role;
    use crate::transport::memory::MemoryHub;
    use std::time::Duration;

    struct TestPeer {
        endpoint: SessionEndpoint,
        player: Arc<HeadlessPlayer>,
        engine: SyncEngine,
    }

    async fn spawn_peer(hub: &Arc<MemoryHub>, room: &str, role: Role) -> TestPeer {
        let endpoint = SessionEndpoint::connect(hub.clone(), room.to_string(), role);
        let player = Arc::new(HeadlessPlayer::new());
        let engine = SyncEngine::start(
            endpoint.clone(),
            player.clone(),
            SyncConfig::default(),
        );
        endpoint.ready().await.unwrap();
        TestPeer {
            endpoint,
            player,
            engine,
        }
    }

    async fn settle(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<EndpointEvent>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EndpointEvent::Data { message, .. } = event {
                messages.push(message);
            }
        }
        messages
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_converges_on_the_room_state() {
        let hub = Arc::new(MemoryHub::new());
        let host = spawn_peer(&hub, "room", Role::Host).await;
        host.engine.load_media("abc123XYZ90").unwrap();
        settle(Duration::from_millis(50)).await;
        assert_eq!(host.engine.phase(), SyncPhase::Synced);

        host.player.play().unwrap();
        settle(Duration::from_secs(120)).await;

        let guest = spawn_peer(&hub, "room", Role::Guest).await;
        guest.player.mark_ready();
        settle(Duration::from_secs(2)).await;

        assert_eq!(guest.engine.phase(), SyncPhase::Synced);
        assert_eq!(guest.player.media_id().as_deref(), Some("abc123XYZ90"));
        let host_position = host.player.position().unwrap();
        let guest_position = guest.player.position().unwrap();
        assert!(
            (host_position - guest_position).abs() <= 1.0,
            "guest at {guest_position}, host at {host_position}"
        );
        assert!(guest_position > 119.0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_applies_are_not_rebroadcast() {
        let hub = Arc::new(MemoryHub::new());
        let host = spawn_peer(&hub, "room", Role::Host).await;
        host.engine.load_media("abc123XYZ90").unwrap();
        let guest = spawn_peer(&hub, "room", Role::Guest).await;
        guest.player.mark_ready();
        settle(Duration::from_secs(2)).await;
        assert_eq!(guest.engine.phase(), SyncPhase::Synced);

        let mut host_inbox = host.endpoint.subscribe(EventKind::Data);

        // A burst of remote mutations lands on the guest.
        host.player.play().unwrap();
        host.player.set_rate(1.5).unwrap();
        host.player.pause().unwrap();
        settle(Duration::from_millis(400)).await;

        // The guest's suppression window is still open: its player's
        // acknowledgment events must not come back as messages.
        assert!(drain(&mut host_inbox).is_empty());

        // After the window closes, genuine local intent still propagates.
        settle(Duration::from_secs(2)).await;
        drain(&mut host_inbox);
        guest.player.play().unwrap();
        settle(Duration::from_millis(100)).await;
        let replies = drain(&mut host_inbox);
        assert!(
            replies.iter().any(|m| matches!(m, Message::Play)),
            "expected a play broadcast, got {replies:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drift_is_corrected_only_past_the_threshold() {
        let hub = Arc::new(MemoryHub::new());
        let host = spawn_peer(&hub, "room", Role::Host).await;
        host.engine.load_media("abc123XYZ90").unwrap();
        let guest = spawn_peer(&hub, "room", Role::Guest).await;
        guest.player.mark_ready();
        settle(Duration::from_secs(2)).await;
        assert_eq!(guest.engine.phase(), SyncPhase::Synced);

        let mut host_inbox = host.endpoint.subscribe(EventKind::Data);

        // Exactly the threshold: tolerated, and the reference re-anchors.
        guest.player.set_position(1.0);
        settle(Duration::from_millis(700)).await;
        assert!(drain(&mut host_inbox).is_empty());

        // Just past it: exactly one corrective seek.
        guest.player.set_position(2.1);
        settle(Duration::from_millis(700)).await;
        let messages = drain(&mut host_inbox);
        let seeks: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                Message::Seek { position_seconds } => Some(*position_seconds),
                _ => None,
            })
            .collect();
        assert_eq!(seeks.len(), 1, "got {messages:?}");
        assert!((seeks[0] - 2.1).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_mutations_propagate_like_host_mutations() {
        let hub = Arc::new(MemoryHub::new());
        let host = spawn_peer(&hub, "room", Role::Host).await;
        host.engine.load_media("abc123XYZ90").unwrap();
        let guest = spawn_peer(&hub, "room", Role::Guest).await;
        guest.player.mark_ready();
        settle(Duration::from_secs(2)).await;

        // The guest scrubs; the host follows. No role gate anywhere.
        guest.player.set_position(50.0);
        settle(Duration::from_secs(1)).await;
        let host_position = host.player.position().unwrap();
        assert!(
            (host_position - 50.0).abs() < 1e-6,
            "host at {host_position}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_video_info_swaps_the_loaded_media() {
        let hub = Arc::new(MemoryHub::new());
        let host = spawn_peer(&hub, "room", Role::Host).await;
        host.engine.load_media("first-id").unwrap();
        let guest = spawn_peer(&hub, "room", Role::Guest).await;
        guest.player.mark_ready();
        settle(Duration::from_secs(2)).await;
        assert_eq!(guest.player.media_id().as_deref(), Some("first-id"));

        host.engine.load_media("second-id").unwrap();
        settle(Duration::from_secs(2)).await;
        assert_eq!(guest.player.media_id().as_deref(), Some("second-id"));
        assert_eq!(guest.engine.phase(), SyncPhase::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_mutation_recovers_via_fresh_snapshot() {
        let hub = Arc::new(MemoryHub::new());
        let host = spawn_peer(&hub, "room", Role::Host).await;
        host.engine.load_media("abc123XYZ90").unwrap();
        let guest = spawn_peer(&hub, "room", Role::Guest).await;
        guest.player.mark_ready();
        settle(Duration::from_secs(2)).await;

        // A malformed seek from the wire: the guest's player rejects it,
        // the engine degrades and asks the room for a fresh snapshot.
        host.endpoint
            .send(Message::Seek {
                position_seconds: -5.0,
            })
            .unwrap();
        settle(Duration::from_secs(2)).await;

        assert_eq!(guest.engine.phase(), SyncPhase::Synced);
        assert!(guest.engine.last_player_error().is_some());
        assert_eq!(host.engine.phase(), SyncPhase::Synced);
    }
}

//! Session endpoint: one room, one link, a connection table, and typed
//! event subscriptions feeding the engines.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::SessionError;
use crate::protocol::{Message, PeerId, Role};
use crate::transport::{LinkEvent, SessionLink, Transport};

/// Event kinds a caller may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Connect,
    Close,
}

impl FromStr for EventKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Self::Data),
            "connect" => Ok(Self::Connect),
            "close" => Ok(Self::Close),
            other => Err(SessionError::UnsupportedEvent(other.to_string())),
        }
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Data { from: PeerId, message: Message },
    Connect { peer: PeerId },
    Close { peer: PeerId },
}

#[derive(Debug, Clone)]
enum ConnState {
    Connecting,
    Ready,
    Failed(SessionError),
    Closed,
}

type SubscriberMap = HashMap<EventKind, Vec<mpsc::UnboundedSender<EndpointEvent>>>;

struct EndpointInner {
    room_id: String,
    role: Role,
    state: watch::Sender<ConnState>,
    link: Mutex<Option<Box<dyn SessionLink>>>,
    local_peer: Mutex<Option<PeerId>>,
    peers: DashMap<PeerId, Instant>,
    subscribers: Mutex<SubscriberMap>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointInner {
    /// Transition to `Closed` unless establishment already failed.
    /// Returns whether this call performed the transition.
    fn set_closed(&self) -> bool {
        let mut changed = false;
        self.state.send_modify(|state| {
            if !matches!(state, ConnState::Failed(_) | ConnState::Closed) {
                *state = ConnState::Closed;
                changed = true;
            }
        });
        changed
    }

    fn dispatch_link_event(&self, event: LinkEvent) {
        // The subscriber lock serializes table updates with `subscribe`'s
        // connect replay, so a late subscriber sees each peer exactly once.
        let mut subscribers = self.subscribers.lock();
        match event {
            LinkEvent::PeerConnected(peer) => {
                self.peers.insert(peer.clone(), Instant::now());
                tracing::debug!(room_id = %self.room_id, %peer, "peer connected");
                Self::fanout(&mut subscribers, EventKind::Connect, EndpointEvent::Connect { peer });
            }
            LinkEvent::PeerDisconnected(peer) => {
                self.peers.remove(&peer);
                tracing::debug!(room_id = %self.room_id, %peer, "peer disconnected");
                Self::fanout(&mut subscribers, EventKind::Close, EndpointEvent::Close { peer });
            }
            LinkEvent::Message { from, message } => {
                Self::fanout(
                    &mut subscribers,
                    EventKind::Data,
                    EndpointEvent::Data { from, message },
                );
            }
        }
    }

    fn fanout(subscribers: &mut SubscriberMap, kind: EventKind, event: EndpointEvent) {
        if let Some(list) = subscribers.get_mut(&kind) {
            list.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        if let Some(link) = self.link.lock().take() {
            link.close();
        }
    }
}

/// One endpoint per active room. Cheap to clone; clones share the link,
/// the connection table, and the subscriber lists.
#[derive(Clone)]
pub struct SessionEndpoint {
    inner: Arc<EndpointInner>,
}

impl SessionEndpoint {
    /// Start establishing a link in the background. Await [`ready`] before
    /// sending; establishment failures surface there.
    ///
    /// [`ready`]: SessionEndpoint::ready
    pub fn connect(transport: Arc<dyn Transport>, room_id: String, role: Role) -> Self {
        let (state_tx, _) = watch::channel(ConnState::Connecting);
        let inner = Arc::new(EndpointInner {
            room_id,
            role,
            state: state_tx,
            link: Mutex::new(None),
            local_peer: Mutex::new(None),
            peers: DashMap::new(),
            subscribers: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        });

        let task_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            match transport.establish(&task_inner.room_id, task_inner.role).await {
                Ok((link, mut events)) => {
                    *task_inner.local_peer.lock() = Some(link.local_peer_id());
                    *task_inner.link.lock() = Some(link);
                    task_inner.state.send_replace(ConnState::Ready);
                    tracing::info!(room_id = %task_inner.room_id, role = ?task_inner.role, "session ready");
                    while let Some(event) = events.recv().await {
                        task_inner.dispatch_link_event(event);
                    }
                    // The transport dried up underneath us.
                    task_inner.set_closed();
                }
                Err(err) => {
                    tracing::warn!(room_id = %task_inner.room_id, error = %err, "link establishment failed");
                    task_inner.state.send_replace(ConnState::Failed(err));
                }
            }
        });
        *inner.pump.lock() = Some(handle);

        Self { inner }
    }

    /// The single readiness future. Resolves `Ok` exactly when the link
    /// handshake completes, or with the establishment failure.
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut rx = self.inner.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    ConnState::Ready => return Ok(()),
                    ConnState::Failed(err) => return Err(err.clone()),
                    ConnState::Closed => return Err(SessionError::Closed),
                    ConnState::Connecting => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    /// Broadcast to all currently connected peers.
    pub fn send(&self, message: Message) -> Result<(), SessionError> {
        self.dispatch(None, message)
    }

    pub fn send_to(&self, peer: &PeerId, message: Message) -> Result<(), SessionError> {
        self.dispatch(Some(peer), message)
    }

    fn dispatch(&self, to: Option<&PeerId>, message: Message) -> Result<(), SessionError> {
        {
            let state = self.inner.state.borrow();
            match &*state {
                ConnState::Ready => {}
                ConnState::Connecting => return Err(SessionError::NotConnected),
                ConnState::Failed(err) => return Err(err.clone()),
                ConnState::Closed => return Err(SessionError::Closed),
            }
        }
        let link = self.inner.link.lock();
        match link.as_ref() {
            Some(link) => link.send(to, message),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Open an event channel for one kind. Subscribing to `Connect` replays
    /// peers already in the table, so an engine wired up after
    /// establishment misses nobody.
    pub fn subscribe(&self, kind: EventKind) -> mpsc::UnboundedReceiver<EndpointEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.subscribers.lock();
        if kind == EventKind::Connect {
            for entry in self.inner.peers.iter() {
                let _ = tx.send(EndpointEvent::Connect {
                    peer: entry.key().clone(),
                });
            }
        }
        subscribers.entry(kind).or_default().push(tx);
        rx
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.inner.local_peer.lock().clone()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Release all peer links. Idempotent; no event is delivered after this
    /// returns.
    pub fn close(&self) {
        if self.inner.set_closed() {
            tracing::info!(room_id = %self.inner.room_id, "session closed");
        }
        if let Some(link) = self.inner.link.lock().take() {
            link.close();
        }
        if let Some(handle) = self.inner.pump.lock().take() {
            handle.abort();
        }
        self.inner.subscribers.lock().clear();
        self.inner.peers.clear();
    }
}

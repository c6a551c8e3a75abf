//! Transport boundary: session establishment and peer message delivery.
//!
//! Real deployments back this with WebRTC or WebSocket links; the in-memory
//! hub below serves tests and same-process peers.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::protocol::{Message, PeerId, Role};

/// Events surfaced by an established session link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Message { from: PeerId, message: Message },
}

/// An established link into a room.
pub trait SessionLink: Send + Sync {
    /// Deliver to one peer, or to every connected peer when `to` is `None`.
    fn send(&self, to: Option<&PeerId>, message: Message) -> Result<(), SessionError>;

    fn local_peer_id(&self) -> PeerId;

    /// Release the link. Idempotent.
    fn close(&self);
}

/// Establishes links. Implementations own rendezvous and signaling.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn establish(
        &self,
        room_id: &str,
        role: Role,
    ) -> Result<(Box<dyn SessionLink>, mpsc::UnboundedReceiver<LinkEvent>), SessionError>;
}

pub mod memory {
    //! In-process rendezvous hub. Every link shares one address space, so
    //! "signaling" reduces to a room table lookup.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use dashmap::DashMap;
    use parking_lot::Mutex;

    use super::*;

    /// Direct-link policy: two active participants per room.
    pub const DIRECT_LINK_CAPACITY: usize = 2;

    struct Member {
        peer_id: PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    }

    struct HubInner {
        rooms: DashMap<String, Arc<Mutex<Vec<Member>>>>,
        capacity: usize,
    }

    /// Shared rendezvous state. Cheap to clone; clones address the same
    /// rooms.
    #[derive(Clone)]
    pub struct MemoryHub {
        inner: Arc<HubInner>,
    }

    impl MemoryHub {
        pub fn new() -> Self {
            Self::with_capacity(DIRECT_LINK_CAPACITY)
        }

        /// A hub with a mesh-style capacity instead of the direct-link
        /// default.
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                inner: Arc::new(HubInner {
                    rooms: DashMap::new(),
                    capacity,
                }),
            }
        }

        fn room(&self, room_id: &str) -> Option<Arc<Mutex<Vec<Member>>>> {
            self.inner.rooms.get(room_id).map(|entry| entry.value().clone())
        }

        fn deliver(
            &self,
            room_id: &str,
            from: &PeerId,
            to: Option<&PeerId>,
            message: Message,
        ) -> Result<(), SessionError> {
            let members = self.room(room_id).ok_or(SessionError::NotConnected)?;
            let members = members.lock();
            match to {
                Some(target) => {
                    let member = members
                        .iter()
                        .find(|m| &m.peer_id == target)
                        .ok_or_else(|| {
                            SessionError::Transport(format!("peer {target} not in room {room_id}"))
                        })?;
                    let _ = member.events.send(LinkEvent::Message {
                        from: from.clone(),
                        message,
                    });
                }
                None => {
                    for member in members.iter().filter(|m| &m.peer_id != from) {
                        let _ = member.events.send(LinkEvent::Message {
                            from: from.clone(),
                            message: message.clone(),
                        });
                    }
                }
            }
            Ok(())
        }

        fn leave(&self, room_id: &str, peer: &PeerId) {
            let Some(members) = self.room(room_id) else {
                return;
            };
            let mut members = members.lock();
            members.retain(|m| &m.peer_id != peer);
            for member in members.iter() {
                let _ = member
                    .events
                    .send(LinkEvent::PeerDisconnected(peer.clone()));
            }
            let empty = members.is_empty();
            drop(members);
            if empty {
                self.inner.rooms.remove(room_id);
                tracing::info!(room_id, "room deleted (empty)");
            }
        }
    }

    impl Default for MemoryHub {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Transport for MemoryHub {
        async fn establish(
            &self,
            room_id: &str,
            role: Role,
        ) -> Result<(Box<dyn SessionLink>, mpsc::UnboundedReceiver<LinkEvent>), SessionError>
        {
            let members = match role {
                Role::Host => self
                    .inner
                    .rooms
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                    .clone(),
                // Joining an identifier nobody opened is a signaling
                // failure, not an empty room.
                Role::Guest => self.room(room_id).ok_or_else(|| {
                    SessionError::Transport(format!("no such room: {room_id}"))
                })?,
            };

            let peer_id = PeerId::random();
            let (tx, rx) = mpsc::unbounded_channel();

            let mut members = members.lock();
            if members.len() >= self.inner.capacity {
                return Err(SessionError::RoomFull {
                    room_id: room_id.to_string(),
                    capacity: self.inner.capacity,
                });
            }
            for member in members.iter() {
                let _ = member.events.send(LinkEvent::PeerConnected(peer_id.clone()));
                let _ = tx.send(LinkEvent::PeerConnected(member.peer_id.clone()));
            }
            members.push(Member {
                peer_id: peer_id.clone(),
                events: tx,
            });
            drop(members);

            tracing::info!(room_id, peer = %peer_id, ?role, "peer joined room");
            let link = MemoryLink {
                hub: self.clone(),
                room_id: room_id.to_string(),
                peer_id,
                closed: AtomicBool::new(false),
            };
            Ok((Box::new(link), rx))
        }
    }

    pub struct MemoryLink {
        hub: MemoryHub,
        room_id: String,
        peer_id: PeerId,
        closed: AtomicBool,
    }

    impl SessionLink for MemoryLink {
        fn send(&self, to: Option<&PeerId>, message: Message) -> Result<(), SessionError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(SessionError::Closed);
            }
            self.hub.deliver(&self.room_id, &self.peer_id, to, message)
        }

        fn local_peer_id(&self) -> PeerId {
            self.peer_id.clone()
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.hub.leave(&self.room_id, &self.peer_id);
            }
        }
    }

    impl Drop for MemoryLink {
        fn drop(&mut self) {
            self.close();
        }
    }
}

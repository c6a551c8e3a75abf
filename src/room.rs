//! Room lifecycle: create or join, decide the role, and wire the sync
//! engine and chat replicator onto the endpoint.

use std::sync::Arc;

use uuid::Uuid;

use crate::chat::ChatReplicator;
use crate::config::SyncConfig;
use crate::error::SessionError;
use crate::invite;
use crate::player::Player;
use crate::profile::{default_display_name, NameStore};
use crate::protocol::Role;
use crate::session::SessionEndpoint;
use crate::sync::SyncEngine;
use crate::transport::Transport;

/// Knobs for opening rooms.
pub struct RoomOptions {
    pub sync: SyncConfig,
    /// Overrides the persisted display name for this session.
    pub display_name: Option<String>,
    /// Where the display name persists; defaults to the platform data dir.
    pub profile: Option<NameStore>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            display_name: None,
            profile: None,
        }
    }
}

/// Opens rooms against one transport and one local player.
pub struct RoomController {
    transport: Arc<dyn Transport>,
    player: Arc<dyn Player>,
    options: RoomOptions,
}

impl RoomController {
    pub fn new(transport: Arc<dyn Transport>, player: Arc<dyn Player>) -> Self {
        Self::with_options(transport, player, RoomOptions::default())
    }

    pub fn with_options(
        transport: Arc<dyn Transport>,
        player: Arc<dyn Player>,
        options: RoomOptions,
    ) -> Self {
        Self {
            transport,
            player,
            options,
        }
    }

    /// Open a fresh room and take the host role.
    pub async fn create_room(&self) -> Result<Room, SessionError> {
        // Full UUIDs: short friendly codes need a central registry to stay
        // unique, and a peer-to-peer rendezvous has none.
        let room_id = Uuid::new_v4().to_string();
        tracing::info!(%room_id, "creating room");
        self.open(room_id, Role::Host).await
    }

    /// Rendezvous against an existing room as a guest. Fails fast on a full
    /// room or a signaling failure; callers may fall back to
    /// [`create_room`](Self::create_room).
    pub async fn join_room(&self, room_id: &str) -> Result<Room, SessionError> {
        tracing::info!(room_id, "joining room");
        self.open(room_id.to_string(), Role::Guest).await
    }

    /// The hosting-surface contract: no room named means create one, a
    /// named room means join it, and a failed join falls back to creating.
    pub async fn join_or_create(&self, invite: Option<&str>) -> Result<Room, SessionError> {
        if let Some(link) = invite.and_then(invite::parse_invite_url) {
            match self.join_room(&link.room_id).await {
                Ok(room) => return Ok(room),
                Err(err @ (SessionError::RoomFull { .. } | SessionError::Transport(_))) => {
                    tracing::warn!(room_id = %link.room_id, error = %err, "join failed, creating a room instead");
                }
                Err(err) => return Err(err),
            }
        }
        self.create_room().await
    }

    async fn open(&self, room_id: String, role: Role) -> Result<Room, SessionError> {
        let endpoint =
            SessionEndpoint::connect(Arc::clone(&self.transport), room_id.clone(), role);

        let profile = self
            .options
            .profile
            .clone()
            .unwrap_or_else(NameStore::open_default);
        let display_name = self
            .options
            .display_name
            .clone()
            .or_else(|| profile.load())
            .unwrap_or_else(default_display_name);

        // Wire the engines up before awaiting readiness: their
        // subscriptions must be in place before the first peer can say
        // anything, or a zero-latency transport loses the onboarding
        // messages.
        let sync = SyncEngine::start(
            endpoint.clone(),
            Arc::clone(&self.player),
            self.options.sync.clone(),
        );
        let chat = ChatReplicator::start(endpoint.clone(), display_name);
        endpoint.ready().await?;

        Ok(Room {
            id: room_id,
            role,
            endpoint,
            sync,
            chat,
            profile,
        })
    }
}

/// One active room. Dropping it closes everything.
pub struct Room {
    id: String,
    role: Role,
    endpoint: SessionEndpoint,
    sync: SyncEngine,
    chat: ChatReplicator,
    profile: NameStore,
}

impl Room {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn invite_url(&self) -> String {
        invite::build_invite_url(&self.id)
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn chat(&self) -> &ChatReplicator {
        &self.chat
    }

    pub fn endpoint(&self) -> &SessionEndpoint {
        &self.endpoint
    }

    /// Rename the local user for future posts and persist the choice.
    pub fn set_display_name(&self, name: &str) -> std::io::Result<()> {
        self.profile.save(name)?;
        self.chat.set_display_name(name);
        Ok(())
    }

    /// Tear down engines, their timers, then the endpoint. Idempotent; no
    /// timer fires after this returns.
    pub fn close(&self) {
        self.sync.close();
        self.chat.close();
        self.endpoint.close();
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.close();
    }
}

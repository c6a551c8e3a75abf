//! Huddle: peer session and playback-state synchronization for shared
//! watch rooms.
//!
//! Peers rendezvous on a room id over a pluggable [`Transport`], then
//! converge a single [`PlaybackState`] across everyone's [`Player`] while
//! replicating an append-only chat log. There is no central authority and
//! no strict consistency: convergence is eventual, last message wins.
//!
//! [`Transport`]: transport::Transport
//! [`Player`]: player::Player
//! [`PlaybackState`]: protocol::PlaybackState

pub mod chat;
pub mod config;
pub mod error;
pub mod invite;
pub mod player;
pub mod profile;
pub mod protocol;
pub mod room;
pub mod session;
pub mod sync;
pub mod transport;

pub use chat::ChatReplicator;
pub use config::SyncConfig;
pub use error::{PlayerError, SessionError};
pub use player::{Player, PlayerEvent};
pub use protocol::{ChatMessage, Message, PeerId, PlaybackState, Role};
pub use room::{Room, RoomController, RoomOptions};
pub use session::{EndpointEvent, EventKind, SessionEndpoint};
pub use sync::{SyncEngine, SyncPhase};
pub use transport::{LinkEvent, SessionLink, Transport};

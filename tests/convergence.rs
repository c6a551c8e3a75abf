//! End-to-end convergence scenarios over the in-memory hub, driven through
//! the public room API the way an embedding UI would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use huddle::player::headless::HeadlessPlayer;
use huddle::profile::NameStore;
use huddle::transport::memory::MemoryHub;
use huddle::{Player, Room, RoomController, RoomOptions, SyncConfig, SyncPhase};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

struct Participant {
    player: Arc<HeadlessPlayer>,
    room: Room,
    _tempdir: tempfile::TempDir,
}

async fn open(
    hub: &Arc<MemoryHub>,
    name: &str,
    invite: Option<&str>,
) -> Result<Participant> {
    let player = Arc::new(HeadlessPlayer::new());
    let tempdir = tempfile::tempdir()?;
    let controller = RoomController::with_options(
        hub.clone(),
        player.clone(),
        RoomOptions {
            sync: SyncConfig::default(),
            display_name: Some(name.to_string()),
            profile: Some(NameStore::at_path(tempdir.path().join("profile.json"))),
        },
    );
    let room = controller.join_or_create(invite).await?;
    Ok(Participant {
        player,
        room,
        _tempdir: tempdir,
    })
}

#[tokio::test(start_paused = true)]
async fn host_creates_guest_joins_and_adopts_paused_state() -> Result<()> {
    init_tracing();
    let hub = Arc::new(MemoryHub::new());

    // Host creates a room and loads media at t=0, paused.
    let host = open(&hub, "host", None).await?;
    assert_eq!(host.room.role(), huddle::Role::Host);
    host.room.sync().load_media("abc123XYZ90")?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.room.sync().phase(), SyncPhase::Synced);

    // Guest follows the invite; its player comes up and requests state.
    let invite = host.room.invite_url();
    let guest = open(&hub, "guest", Some(&invite)).await?;
    assert_eq!(guest.room.role(), huddle::Role::Guest);
    assert_eq!(guest.room.id(), host.room.id());
    guest.player.mark_ready();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(guest.room.sync().phase(), SyncPhase::Synced);
    let state = guest.room.sync().playback_state();
    assert_eq!(state.media_id.as_deref(), Some("abc123XYZ90"));
    assert!(state.paused);
    assert!(state.position_seconds.abs() < 1.0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn playback_controls_converge_in_both_directions() -> Result<()> {
    init_tracing();
    let hub = Arc::new(MemoryHub::new());
    let host = open(&hub, "host", None).await?;
    host.room.sync().load_media("abc123XYZ90")?;
    let invite = host.room.invite_url();
    let guest = open(&hub, "guest", Some(&invite)).await?;
    guest.player.mark_ready();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Host presses play; the guest's player follows.
    host.player.play()?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(guest.player.is_playing()?);

    // Guest pauses after the settle window; the host follows. Role never
    // gated the mutation.
    tokio::time::sleep(Duration::from_secs(2)).await;
    guest.player.pause()?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!host.player.is_playing()?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn chat_history_onboards_late_joiners() -> Result<()> {
    init_tracing();
    let hub = Arc::new(MemoryHub::with_capacity(3));
    let host = open(&hub, "ana", None).await?;
    let invite = host.room.invite_url();
    let first = open(&hub, "ben", Some(&invite)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    host.room.chat().post("welcome")?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.room.chat().post("hi there")?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let late = open(&hub, "cai", Some(&invite)).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let log = late.room.chat().messages();
    assert_eq!(log.len(), 2, "{log:?}");
    assert_eq!(log[0].sender, "ana");
    assert_eq!(log[0].content, "welcome");

    // The late joiner's own post replicates everywhere.
    late.room.chat().post("sorry I'm late")?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.room.chat().messages().len(), 3);
    assert_eq!(first.room.chat().messages().len(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closing_a_room_stops_all_activity() -> Result<()> {
    init_tracing();
    let hub = Arc::new(MemoryHub::new());
    let host = open(&hub, "host", None).await?;
    host.room.sync().load_media("abc123XYZ90")?;
    let invite = host.room.invite_url();
    let guest = open(&hub, "guest", Some(&invite)).await?;
    guest.player.mark_ready();
    tokio::time::sleep(Duration::from_secs(2)).await;

    guest.room.close();
    assert!(guest.room.chat().post("gone").is_err());

    // The survivor keeps working; the dead peer's player no longer moves.
    host.player.play()?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(host.player.is_playing()?);
    assert!(!guest.player.is_playing()?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn one_peers_player_fault_stays_local() -> Result<()> {
    init_tracing();
    let hub = Arc::new(MemoryHub::new());
    let host = open(&hub, "host", None).await?;
    host.room.sync().load_media("abc123XYZ90")?;
    let invite = host.room.invite_url();
    let guest = open(&hub, "guest", Some(&invite)).await?;
    guest.player.mark_ready();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // A hostile message the guest's player refuses.
    host.room.endpoint().send(huddle::Message::Seek {
        position_seconds: -10.0,
    })?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The guest surfaced the fault, recovered from a fresh snapshot, and
    // the host never noticed a thing.
    assert!(guest.room.sync().last_player_error().is_some());
    assert_eq!(guest.room.sync().phase(), SyncPhase::Synced);
    assert_eq!(host.room.sync().phase(), SyncPhase::Synced);
    assert!(host.room.sync().last_player_error().is_none());
    Ok(())
}

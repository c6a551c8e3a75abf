//! Player boundary: the sync engine reads and mutates playback through
//! this trait and never touches a rendering surface directly.

use tokio::sync::mpsc;

use crate::error::PlayerError;

/// Callbacks emitted by a player surface.
///
/// `StateChanged`/`RateChanged` fire both for user actions and for the
/// player's own acknowledgment of a command; the engine's settle window
/// exists to tell those apart.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// The surface is ready to accept commands.
    Ready,
    StateChanged { paused: bool },
    RateChanged { rate: f64 },
    Error { message: String },
}

pub trait Player: Send + Sync {
    fn load(&self, media_id: &str) -> Result<(), PlayerError>;

    /// Current playback position in seconds.
    fn position(&self) -> Result<f64, PlayerError>;

    fn seek(&self, seconds: f64) -> Result<(), PlayerError>;

    fn rate(&self) -> Result<f64, PlayerError>;

    fn set_rate(&self, rate: f64) -> Result<(), PlayerError>;

    fn play(&self) -> Result<(), PlayerError>;

    fn pause(&self) -> Result<(), PlayerError>;

    fn is_playing(&self) -> Result<bool, PlayerError>;

    /// Subscribe to player callbacks. Every subscriber sees every event.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PlayerEvent>;
}

pub mod headless {
    //! A player with no rendering surface, for tests and headless peers.
    //! Position advances with the tokio clock while playing.

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    pub struct HeadlessPlayer {
        state: Mutex<HeadlessState>,
        subscribers: Mutex<Vec<mpsc::UnboundedSender<PlayerEvent>>>,
    }

    struct HeadlessState {
        media_id: Option<String>,
        base_position: f64,
        /// Set while playing; position extrapolates from here.
        resumed_at: Option<Instant>,
        rate: f64,
    }

    impl HeadlessPlayer {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(HeadlessState {
                    media_id: None,
                    base_position: 0.0,
                    resumed_at: None,
                    rate: 1.0,
                }),
                subscribers: Mutex::new(Vec::new()),
            }
        }

        /// Signal readiness without loading media, as a freshly embedded
        /// surface does.
        pub fn mark_ready(&self) {
            self.emit(PlayerEvent::Ready);
        }

        /// Move the playhead without emitting anything, like an external
        /// scrub the surface never reports. Only the position poll can
        /// notice it.
        pub fn set_position(&self, seconds: f64) {
            let mut state = self.state.lock();
            state.base_position = seconds.max(0.0);
            if state.resumed_at.is_some() {
                state.resumed_at = Some(Instant::now());
            }
        }

        pub fn media_id(&self) -> Option<String> {
            self.state.lock().media_id.clone()
        }

        fn emit(&self, event: PlayerEvent) {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    impl Default for HeadlessPlayer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HeadlessState {
        fn current_position(&self) -> f64 {
            match self.resumed_at {
                Some(resumed_at) => {
                    self.base_position + resumed_at.elapsed().as_secs_f64() * self.rate
                }
                None => self.base_position,
            }
        }

        /// Fold elapsed play time into the base before changing rate or
        /// pausing.
        fn settle(&mut self) {
            self.base_position = self.current_position();
            if self.resumed_at.is_some() {
                self.resumed_at = Some(Instant::now());
            }
        }
    }

    impl Player for HeadlessPlayer {
        fn load(&self, media_id: &str) -> Result<(), PlayerError> {
            if media_id.trim().is_empty() {
                return Err(PlayerError::MediaRejected(media_id.to_string()));
            }
            {
                let mut state = self.state.lock();
                state.media_id = Some(media_id.to_string());
                state.base_position = 0.0;
                state.resumed_at = None;
                state.rate = 1.0;
            }
            self.emit(PlayerEvent::Ready);
            Ok(())
        }

        fn position(&self) -> Result<f64, PlayerError> {
            Ok(self.state.lock().current_position())
        }

        fn seek(&self, seconds: f64) -> Result<(), PlayerError> {
            if seconds < 0.0 || !seconds.is_finite() {
                return Err(PlayerError::SeekOutOfRange(seconds));
            }
            let mut state = self.state.lock();
            state.base_position = seconds;
            if state.resumed_at.is_some() {
                state.resumed_at = Some(Instant::now());
            }
            Ok(())
        }

        fn rate(&self) -> Result<f64, PlayerError> {
            Ok(self.state.lock().rate)
        }

        fn set_rate(&self, rate: f64) -> Result<(), PlayerError> {
            if rate <= 0.0 || !rate.is_finite() {
                return Err(PlayerError::InvalidRate(rate));
            }
            {
                let mut state = self.state.lock();
                state.settle();
                state.rate = rate;
            }
            self.emit(PlayerEvent::RateChanged { rate });
            Ok(())
        }

        fn play(&self) -> Result<(), PlayerError> {
            {
                let mut state = self.state.lock();
                if state.media_id.is_none() {
                    return Err(PlayerError::Backend("no media loaded".into()));
                }
                if state.resumed_at.is_none() {
                    state.resumed_at = Some(Instant::now());
                }
            }
            self.emit(PlayerEvent::StateChanged { paused: false });
            Ok(())
        }

        fn pause(&self) -> Result<(), PlayerError> {
            {
                let mut state = self.state.lock();
                state.settle();
                state.resumed_at = None;
            }
            self.emit(PlayerEvent::StateChanged { paused: true });
            Ok(())
        }

        fn is_playing(&self) -> Result<bool, PlayerError> {
            Ok(self.state.lock().resumed_at.is_some())
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<PlayerEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribers.lock().push(tx);
            rx
        }
    }
}

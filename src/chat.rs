//! Append-only chat log replication over the same messaging substrate as
//! playback sync. Far simpler convergence: arrival order per peer, one
//! history snapshot for late joiners, first snapshot wins.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::protocol::{ChatMessage, Message};
use crate::session::{EndpointEvent, EventKind, SessionEndpoint};

struct ChatShared {
    endpoint: SessionEndpoint,
    log: Mutex<Vec<ChatMessage>>,
    display_name: Mutex<String>,
}

/// Replicates the room's chat log onto this peer.
pub struct ChatReplicator {
    shared: Arc<ChatShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatReplicator {
    pub fn start(endpoint: SessionEndpoint, display_name: String) -> Self {
        let shared = Arc::new(ChatShared {
            endpoint,
            log: Mutex::new(Vec::new()),
            display_name: Mutex::new(display_name),
        });
        let task = tokio::spawn(run_loop(Arc::clone(&shared)));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Broadcast a message and append it to the local log. A failed send
    /// appends nothing, so a pre-readiness post cannot leave a phantom
    /// entry that would block snapshot adoption.
    pub fn post(&self, content: &str) -> Result<(), SessionError> {
        let message = ChatMessage {
            sender: self.shared.display_name.lock().clone(),
            content: content.to_string(),
            timestamp: unix_millis(),
        };
        self.shared.endpoint.send(Message::Chat {
            sender: message.sender.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        })?;
        self.shared.log.lock().push(message);
        Ok(())
    }

    /// The locally replicated log, in arrival order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.log.lock().clone()
    }

    pub fn display_name(&self) -> String {
        self.shared.display_name.lock().clone()
    }

    pub fn set_display_name(&self, name: &str) {
        *self.shared.display_name.lock() = name.to_string();
    }

    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ChatReplicator {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_loop(shared: Arc<ChatShared>) {
    let mut data = shared.endpoint.subscribe(EventKind::Data);
    let mut connects = shared.endpoint.subscribe(EventKind::Connect);

    loop {
        tokio::select! {
            event = data.recv() => match event {
                Some(EndpointEvent::Data { message, .. }) => shared.handle_remote(message),
                Some(_) => {}
                None => break,
            },
            event = connects.recv() => match event {
                Some(EndpointEvent::Connect { peer }) => {
                    // Onboard the newcomer with everything said so far.
                    let snapshot = {
                        let log = shared.log.lock();
                        if log.is_empty() {
                            None
                        } else {
                            Some(Message::ChatHistory {
                                messages: log.clone(),
                            })
                        }
                    };
                    if let Some(snapshot) = snapshot {
                        if let Err(err) = shared.endpoint.send_to(&peer, snapshot) {
                            tracing::debug!(peer = %peer, error = %err, "history snapshot not delivered");
                        }
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}

impl ChatShared {
    fn handle_remote(&self, message: Message) {
        match message {
            Message::Chat {
                sender,
                content,
                timestamp,
            } => {
                self.log.lock().push(ChatMessage {
                    sender,
                    content,
                    timestamp,
                });
            }
            Message::ChatHistory { messages } => {
                if messages.is_empty() {
                    return;
                }
                let mut log = self.log.lock();
                // First snapshot wins; a log with any content (local posts
                // included) is never clobbered.
                if log.is_empty() {
                    tracing::debug!(count = messages.len(), "adopted chat history snapshot");
                    *log = messages;
                }
            }
            _ => {}
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

//! Local profile persistence. One value: the user's display name, read at
//! chat-join time and written when the user submits a new name. Entirely
//! optional to the protocol's correctness.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};

use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct ProfileData {
    display_name: String,
}

struct StoreInner {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

/// Persisted display name, cached in memory after the first read.
#[derive(Clone)]
pub struct NameStore {
    inner: Arc<StoreInner>,
}

impl NameStore {
    /// The platform data directory, falling back to a temp path when no
    /// home directory exists.
    pub fn open_default() -> Self {
        let path = ProjectDirs::from("com", "huddle", "Huddle")
            .map(|dirs| dirs.data_dir().join("profile.json"))
            .unwrap_or_else(|| env::temp_dir().join("huddle-profile.json"));
        Self::at_path(path)
    }

    pub fn at_path(path: PathBuf) -> Self {
        let cached = read_from_disk(&path);
        Self {
            inner: Arc::new(StoreInner {
                path,
                cached: Mutex::new(cached),
            }),
        }
    }

    pub fn load(&self) -> Option<String> {
        self.inner.cached.lock().clone()
    }

    pub fn save(&self, name: &str) -> io::Result<()> {
        let Some(name) = sanitize_display_name(name) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "display name is empty after sanitization",
            ));
        };
        if let Some(parent) = self.inner.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(&ProfileData {
            display_name: name.clone(),
        })?;
        fs::write(&self.inner.path, payload)?;
        *self.inner.cached.lock() = Some(name);
        Ok(())
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.inner.path);
        *self.inner.cached.lock() = None;
    }
}

fn read_from_disk(path: &PathBuf) -> Option<String> {
    let data = fs::read(path).ok()?;
    let profile: ProfileData = serde_json::from_slice(&data).ok()?;
    sanitize_display_name(&profile.display_name)
}

/// Trim, strip control characters, cap the length. `None` when nothing
/// usable remains.
pub fn sanitize_display_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut cleaned = String::with_capacity(trimmed.len().min(MAX_NAME_LEN));
    for ch in trimmed.chars() {
        if ch.is_control() {
            continue;
        }
        if cleaned.len() >= MAX_NAME_LEN {
            break;
        }
        cleaned.push(ch);
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn default_display_name() -> String {
    let id = Uuid::new_v4().to_string();
    format!("Guest {}", &id[..8])
}

//! Mission persistence across page navigations.
//!
//! A multi-step goal must survive a full-page transition: the session
//! snapshots it just before unload, and the next page load reads it back
//! and resumes. Storage goes through the [`StateStore`] trait so the
//! mechanism is swappable - a JSON file under the XDG state directory in
//! production, an in-memory map in tests, browser storage behind a host
//! bridge.
//!
//! The same store carries the rest of the client's small persisted state:
//! the last session id and interaction mode (for auto-resume) and
//! cacheable visual assets delivered over the channel.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use pilot_protocol::{COPILOT_MODE, InteractionMode, MissionState};

/// Mission snapshots older than this are discarded on load.
pub const MISSION_FRESHNESS_MS: i64 = 5 * 60 * 1000;

const KEY_MISSION: &str = "mission";
const KEY_SESSION_ID: &str = "session_id";
const KEY_INTERACTION_MODE: &str = "interaction_mode";
const KEY_WIDGET_MODE: &str = "widget_mode";
const ASSET_PREFIX: &str = "asset:";

/// Current unix time in milliseconds.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Namespaced key-value persistence.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStateStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map.lock().remove(key);
    }
}

/// JSON-file store under the XDG state directory.
///
/// Write failures are logged and swallowed; losing a snapshot degrades
/// resume, it never breaks a session.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStateStore { path: path.into() }
    }

    /// `$XDG_STATE_HOME/pilot/state.json`, falling back to
    /// `~/.local/state/pilot/state.json`.
    pub fn at_default_path() -> Self {
        let state_home = std::env::var_os("XDG_STATE_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/state"))
            })
            .unwrap_or_else(|| PathBuf::from("."));
        FileStateStore {
            path: state_home.join("pilot/state.json"),
        }
    }

    fn load_map(&self) -> HashMap<String, String> {
        load_json(&self.path).unwrap_or_default()
    }

    fn save_map(&self, map: &HashMap<String, String>) {
        if let Err(e) = save_json(&self.path, map) {
            tracing::warn!("Failed to persist state to {}: {}", self.path.display(), e);
        }
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Option<String> {
        self.load_map().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.load_map();
        map.insert(key.to_string(), value.to_string());
        self.save_map(&map);
    }

    fn remove(&self, key: &str) {
        let mut map = self.load_map();
        if map.remove(key).is_some() {
            self.save_map(&map);
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
}

fn save_json<T: serde::Serialize>(path: &Path, data: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(data)?)
}

/// Session identity persisted for auto-resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub session_id: String,
    pub mode: InteractionMode,
}

/// Typed facade over a [`StateStore`].
#[derive(Clone)]
pub struct MissionStore {
    store: Arc<dyn StateStore>,
}

impl MissionStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        MissionStore { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStateStore::new()))
    }

    pub fn at_default_path() -> Self {
        Self::new(Arc::new(FileStateStore::at_default_path()))
    }

    // --- mission snapshot ---

    /// Persists the in-flight mission; called just before a page unload.
    pub fn save(&self, state: &MissionState) {
        match serde_json::to_string(state) {
            Ok(json) => self.store.set(KEY_MISSION, &json),
            Err(e) => tracing::warn!("Failed to serialize mission snapshot: {}", e),
        }
    }

    /// Reads and consumes the mission snapshot.
    ///
    /// Returns `None` (and discards the record) when it is older than the
    /// freshness window.
    pub fn load(&self) -> Option<MissionState> {
        self.load_at(unix_millis())
    }

    fn load_at(&self, now_ms: i64) -> Option<MissionState> {
        let raw = self.store.get(KEY_MISSION)?;
        self.store.remove(KEY_MISSION);
        let state: MissionState = serde_json::from_str(&raw).ok()?;
        if now_ms.saturating_sub(state.saved_at) > MISSION_FRESHNESS_MS {
            tracing::debug!("Discarding stale mission snapshot");
            return None;
        }
        Some(state)
    }

    pub fn clear(&self) {
        self.store.remove(KEY_MISSION);
    }

    // --- auto-resume identity ---

    pub fn save_resume(&self, session_id: &str, mode: InteractionMode) {
        self.store.set(KEY_SESSION_ID, session_id);
        self.store.set(KEY_INTERACTION_MODE, mode.as_str());
        self.store.set(KEY_WIDGET_MODE, COPILOT_MODE);
    }

    /// Returns the persisted identity when the co-pilot marker is set.
    pub fn load_resume(&self) -> Option<ResumeInfo> {
        if self.store.get(KEY_WIDGET_MODE).as_deref() != Some(COPILOT_MODE) {
            return None;
        }
        let session_id = self.store.get(KEY_SESSION_ID)?;
        let mode = match self.store.get(KEY_INTERACTION_MODE).as_deref() {
            Some("turbo") => InteractionMode::Turbo,
            _ => InteractionMode::Interactive,
        };
        Some(ResumeInfo { session_id, mode })
    }

    pub fn clear_resume(&self) {
        self.store.remove(KEY_SESSION_ID);
        self.store.remove(KEY_INTERACTION_MODE);
        self.store.remove(KEY_WIDGET_MODE);
    }

    // --- asset cache ---

    pub fn cache_asset(&self, name: &str, data: &str) {
        self.store.set(&format!("{ASSET_PREFIX}{name}"), data);
    }

    pub fn cached_asset(&self, name: &str) -> Option<String> {
        self.store.get(&format!("{ASSET_PREFIX}{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mission_at(saved_at: i64) -> MissionState {
        MissionState {
            session_id: "sess-1".into(),
            goal: "apply to the plumber job".into(),
            url: "https://app.example.com/jobs".into(),
            mode: InteractionMode::Interactive,
            saved_at,
        }
    }

    #[test]
    fn fresh_mission_loads_once() {
        let store = MissionStore::in_memory();
        store.save(&mission_at(0));

        // Four minutes later: still fresh.
        let loaded = store.load_at(4 * 60 * 1000).expect("fresh snapshot");
        assert_eq!(loaded.goal, "apply to the plumber job");

        // Consumed on read.
        assert!(store.load_at(4 * 60 * 1000).is_none());
    }

    #[test]
    fn stale_mission_is_discarded() {
        let store = MissionStore::in_memory();
        store.save(&mission_at(0));
        assert!(store.load_at(6 * 60 * 1000).is_none());
        // Discarded, not retried.
        assert!(store.load_at(0).is_none());
    }

    #[test]
    fn clear_removes_the_snapshot() {
        let store = MissionStore::in_memory();
        store.save(&mission_at(0));
        store.clear();
        assert!(store.load_at(1).is_none());
    }

    #[test]
    fn resume_requires_copilot_marker() {
        let store = MissionStore::in_memory();
        assert!(store.load_resume().is_none());

        store.save_resume("sess-9", InteractionMode::Turbo);
        let resume = store.load_resume().unwrap();
        assert_eq!(resume.session_id, "sess-9");
        assert_eq!(resume.mode, InteractionMode::Turbo);

        store.clear_resume();
        assert!(store.load_resume().is_none());
    }

    #[test]
    fn asset_cache_round_trip() {
        let store = MissionStore::in_memory();
        assert!(store.cached_asset("orb.svg").is_none());
        store.cache_asset("orb.svg", "<svg/>");
        assert_eq!(store.cached_asset("orb.svg").as_deref(), Some("<svg/>"));
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = MissionStore::new(Arc::new(FileStateStore::new(&path)));
        store.save(&mission_at(unix_millis()));
        store.save_resume("sess-2", InteractionMode::Interactive);

        // A second store over the same file sees everything.
        let reopened = MissionStore::new(Arc::new(FileStateStore::new(&path)));
        assert_eq!(
            reopened.load_resume().unwrap().session_id,
            "sess-2"
        );
        let mission = reopened.load().expect("fresh mission");
        assert_eq!(mission.session_id, "sess-1");
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("nope.json"));
        assert!(store.get("anything").is_none());
        store.remove("anything");
    }
}

//! Persisted per-window state: parameter and routing snapshots.
//!
//! Two JSON records per window under the session home directory, written at
//! every save point (before teardown and before each migration), read on
//! recall. Missing files are not errors - a fresh window simply has nothing
//! to recall.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Saved control values, keyed by control id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub values: BTreeMap<String, f32>,
}

impl ParamSnapshot {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One audio connection of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConnection {
    pub source: String,
    pub dest: String,
}

/// Saved audio routing: device plus channel connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub device: Option<String>,
    pub connections: Vec<RouteConnection>,
}

/// Per-window snapshot files under one home directory.
pub struct SnapshotStore {
    home: PathBuf,
}

impl SnapshotStore {
    pub fn open(home: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let home = home.into();
        std::fs::create_dir_all(&home)?;
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn params_path(&self, window: &str) -> PathBuf {
        self.home.join(format!("{}.params.json", window))
    }

    fn routing_path(&self, window: &str) -> PathBuf {
        self.home.join(format!("{}.routing.json", window))
    }

    pub fn save_params(&self, window: &str, snapshot: &ParamSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(self.params_path(window), json)?;
        Ok(())
    }

    pub fn load_params(&self, window: &str) -> Result<Option<ParamSnapshot>, StoreError> {
        read_optional(&self.params_path(window))
    }

    pub fn save_routing(&self, window: &str, snapshot: &RoutingSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(self.routing_path(window), json)?;
        Ok(())
    }

    pub fn load_routing(&self, window: &str) -> Result<Option<RoutingSnapshot>, StoreError> {
        read_optional(&self.routing_path(window))
    }

    /// Remove both records for a window. Used when a window is discarded
    /// rather than closed.
    pub fn forget(&self, window: &str) {
        let _ = std::fs::remove_file(self.params_path(window));
        let _ = std::fs::remove_file(self.routing_path(window));
    }
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.load_params("win1").unwrap().is_none());
        assert!(store.load_routing("win1").unwrap().is_none());
    }

    #[test]
    fn test_params_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut snapshot = ParamSnapshot::default();
        snapshot.values.insert("osc/freq".into(), 660.0);
        snapshot.values.insert("osc/level".into(), 0.25);
        store.save_params("win1", &snapshot).unwrap();

        let loaded = store.load_params("win1").unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_routing_roundtrip_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let snapshot = RoutingSnapshot {
            device: Some("default".into()),
            connections: vec![RouteConnection {
                source: "out:0".into(),
                dest: "system:playback_1".into(),
            }],
        };
        store.save_routing("win1", &snapshot).unwrap();
        assert_eq!(store.load_routing("win1").unwrap().unwrap(), snapshot);

        store.forget("win1");
        assert!(store.load_routing("win1").unwrap().is_none());
    }

    #[test]
    fn test_windows_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut a = ParamSnapshot::default();
        a.values.insert("gain".into(), 0.1);
        let mut b = ParamSnapshot::default();
        b.values.insert("gain".into(), 0.9);

        store.save_params("a", &a).unwrap();
        store.save_params("b", &b).unwrap();
        assert_eq!(store.load_params("a").unwrap().unwrap(), a);
        assert_eq!(store.load_params("b").unwrap().unwrap(), b);
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{GridError, Result};
use crate::layout::{Pane, TrackRatios};
use crate::session::SessionSnapshot;

pub const SCHEMA_VERSION: u32 = 1;

/// On-disk layout document. Sessions are sanitized snapshots: no handles,
/// no env values, no tokens.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedLayout {
    pub schema_version: u32,
    pub preset_id: String,
    pub panes: Vec<Pane>,
    #[serde(default)]
    pub sessions: Vec<SessionSnapshot>,
    #[serde(default)]
    pub track_ratios: Option<TrackRatios>,
}

impl PersistedLayout {
    pub fn session(&self, id: &str) -> Option<&SessionSnapshot> {
        self.sessions.iter().find(|s| s.id == id)
    }
}

/// `Ok(None)` when there is no file or it was written by another schema version.
pub fn load_layout(path: &Path) -> Result<Option<PersistedLayout>> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GridError::Persist(format!("read failed: {e}"))),
    };

    let doc: PersistedLayout = serde_json::from_str(&raw)?;
    if doc.schema_version != SCHEMA_VERSION {
        tracing::warn!(found = doc.schema_version, "ignoring layout with unknown schema version");
        return Ok(None);
    }
    Ok(Some(doc))
}

pub fn save_layout(path: &Path, doc: &PersistedLayout) -> Result<()> {
    if doc.schema_version != SCHEMA_VERSION {
        return Err(GridError::Persist("unsupported schema version".to_string()));
    }

    let dir = path
        .parent()
        .ok_or_else(|| GridError::Persist("invalid state path".to_string()))?;
    fs::create_dir_all(dir).map_err(|e| GridError::Persist(format!("create dir failed: {e}")))?;

    let json = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| GridError::Persist(format!("write temp failed: {e}")))?;
    file.write_all(json.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|e| GridError::Persist(format!("write temp failed: {e}")))?;
    file.sync_all().ok();
    drop(file);

    fs::rename(&tmp, path).map_err(|e| GridError::Persist(format!("rename failed: {e}")))?;

    // Best-effort: make the rename itself durable.
    let _ = fs::File::open(dir).and_then(|handle| handle.sync_all());
    tracing::debug!(path = %path.display(), panes = doc.panes.len(), "layout saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PaneState;
    use pretty_assertions::assert_eq;

    fn sample() -> PersistedLayout {
        PersistedLayout {
            schema_version: SCHEMA_VERSION,
            preset_id: "1x2".to_string(),
            panes: vec![Pane {
                id: "pane-0".to_string(),
                slot_index: 0,
                position_index: Some(0),
                group_id: Some("row-0".to_string()),
                state: PaneState::Visible,
                session_id: Some("s0".to_string()),
            }],
            sessions: Vec::new(),
            track_ratios: Some(TrackRatios {
                rows: vec![1.0],
                columns: vec![0.4, 0.6],
            }),
        }
    }

    #[test]
    fn save_then_load_in_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("layout-v1.json");
        save_layout(&path, &sample()).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_layout(&path).unwrap(), Some(sample()));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_layout(&dir.path().join("none.json")).unwrap(), None);
    }

    #[test]
    fn other_schema_versions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        let mut doc = sample();
        doc.schema_version = 2;
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        assert_eq!(load_layout(&path).unwrap(), None);
        assert!(save_layout(&path, &doc).is_err());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_layout(&path), Err(GridError::Persist(_))));
    }
}

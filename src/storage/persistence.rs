//! Snapshot persistence for the store.
//!
//! The whole state is written as one JSON document. Writes go to a temp file in
//! the target directory which is then renamed over the snapshot, so a reader
//! never sees a torn file.

use super::state::StoreState;
use crate::core::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format_version: u16,
    written_at: DateTime<Utc>,
    state: &'a StoreState,
}

#[derive(Deserialize)]
struct SnapshotFile {
    format_version: u16,
    #[allow(dead_code)]
    written_at: DateTime<Utc>,
    state: StoreState,
}

/// Encode `state` for [`write_snapshot_bytes`].
pub fn encode_snapshot(state: &StoreState) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(&SnapshotRef {
        format_version: SNAPSHOT_FORMAT_VERSION,
        written_at: Utc::now(),
        state,
    })
    .map_err(|err| StoreError::Io(format!("Failed to serialize snapshot: {err}")))
}

/// Atomically replace the snapshot at `path` with `bytes`.
pub async fn write_snapshot_bytes(path: &Path, bytes: Vec<u8>) -> StoreResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
        .await
        .map_err(|err| StoreError::Io(format!("snapshot writer join: {err}")))?
}

fn write_atomically(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let dir = snapshot_dir(path);
    std::fs::create_dir_all(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| StoreError::Io(err.error.to_string()))?;
    Ok(())
}

fn snapshot_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Load the snapshot at `path`. A missing file is an empty store.
pub async fn load_snapshot(path: &Path) -> StoreResult<Option<StoreState>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let file: SnapshotFile = serde_json::from_slice(&raw)
        .map_err(|err| StoreError::Corrupt(format!("{}: {err}", path.display())))?;

    if file.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(StoreError::Corrupt(format!(
            "{}: unsupported snapshot format version {}",
            path.display(),
            file.format_version
        )));
    }

    Ok(Some(file.state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Project;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_round_trip_preserves_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("plansync.json");

        let mut state = StoreState::default();
        let project = Project::new("Apollo", Utc::now());
        let project_id = project.id;
        state.projects.insert(project_id, project);

        write_snapshot_bytes(&path, encode_snapshot(&state).unwrap())
            .await
            .unwrap();

        let loaded = load_snapshot(&path).await.unwrap().unwrap();
        assert_eq!(loaded.project(project_id).unwrap().name, "Apollo");
    }

    #[tokio::test]
    async fn missing_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        assert!(load_snapshot(&dir.path().join("absent.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{\"format_version\": 1").unwrap();
        assert!(matches!(
            load_snapshot(&path).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}

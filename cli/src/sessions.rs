use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use athena_feed::store::STORE_FILENAME;
use ignore::WalkBuilder;
use serde::Deserialize;
use serde::Serialize;

use crate::atomic_write::write_atomic_json;

pub const SESSIONS_RELATIVE_DIR: &str = ".athena/sessions";
pub const META_FILENAME: &str = "meta.json";

/// Index entry for one recorded Athena session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Unix millis.
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub adapter_session_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_count: Option<u64>,
}

/// Resolved locations for one session's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub session_id: String,
    pub dir: PathBuf,
    pub store_path: PathBuf,
    pub meta_path: PathBuf,
}

/// `{projectDir}/.athena/sessions/{athena_session_id}/`
pub fn session_paths(project_dir: &Path, session_id: &str) -> SessionPaths {
    let dir = project_dir.join(SESSIONS_RELATIVE_DIR).join(session_id);
    SessionPaths {
        session_id: session_id.to_string(),
        store_path: dir.join(STORE_FILENAME),
        meta_path: dir.join(META_FILENAME),
        dir,
    }
}

pub fn write_meta(paths: &SessionPaths, meta: &SessionMeta) -> anyhow::Result<()> {
    write_atomic_json(&paths.meta_path, meta)
        .with_context(|| format!("write {}", paths.meta_path.display()))
}

pub fn read_meta(path: &Path) -> anyhow::Result<SessionMeta> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Discover recorded sessions, newest first.
///
/// Sessions without a parseable `meta.json` or without a store file are
/// skipped rather than failing the listing.
pub fn discover_sessions(project_dir: &Path) -> anyhow::Result<Vec<SessionMeta>> {
    let sessions_root = project_dir.join(SESSIONS_RELATIVE_DIR);
    if !sessions_root.is_dir() {
        return Ok(Vec::new());
    }

    let walker = WalkBuilder::new(&sessions_root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_exclude(false)
        .git_global(false)
        .parents(false)
        .follow_links(false)
        .max_depth(Some(2))
        .build();

    let mut rows = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        if entry.path().file_name() != Some(OsStr::new(META_FILENAME)) {
            continue;
        }

        let Ok(meta) = read_meta(entry.path()) else {
            continue;
        };
        let store_path = entry
            .path()
            .parent()
            .map(|dir| dir.join(STORE_FILENAME));
        if !store_path.is_some_and(|path| path.is_file()) {
            continue;
        }
        rows.push(meta);
    }

    sort_rows(&mut rows);
    Ok(rows)
}

fn sort_rows(rows: &mut [SessionMeta]) {
    rows.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta(id: &str, updated_at: i64) -> SessionMeta {
        SessionMeta {
            id: id.to_string(),
            label: None,
            created_at: 1,
            updated_at,
            adapter_session_ids: vec!["adapter-1".to_string()],
            event_count: Some(4),
        }
    }

    fn write_session(project_dir: &Path, id: &str, updated_at: i64, with_store: bool) {
        let paths = session_paths(project_dir, id);
        std::fs::create_dir_all(&paths.dir).expect("mkdir");
        if with_store {
            std::fs::write(&paths.store_path, "").expect("write store");
        }
        write_meta(&paths, &meta(id, updated_at)).expect("write meta");
    }

    #[test]
    fn meta_serializes_spec_keys() {
        let value = serde_json::to_value(meta("s1", 9)).expect("serialize");
        assert_eq!(value["id"], "s1");
        assert_eq!(value["createdAt"], 1);
        assert_eq!(value["updatedAt"], 9);
        assert_eq!(value["adapterSessionIds"][0], "adapter-1");
        assert_eq!(value["eventCount"], 4);
        assert!(value.get("label").is_none());
    }

    #[test]
    fn discover_sorts_by_recency_then_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_session(dir.path(), "a", 10, true);
        write_session(dir.path(), "b", 20, true);
        write_session(dir.path(), "c", 20, true);

        let rows = discover_sessions(dir.path()).expect("discover");
        let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn discover_skips_incomplete_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_session(dir.path(), "ok", 10, true);
        // Missing store file.
        write_session(dir.path(), "no-store", 20, false);
        // Unparseable meta.
        let broken = session_paths(dir.path(), "broken");
        std::fs::create_dir_all(&broken.dir).expect("mkdir");
        std::fs::write(&broken.store_path, "").expect("write store");
        std::fs::write(&broken.meta_path, "{not json").expect("write meta");

        let rows = discover_sessions(dir.path()).expect("discover");
        let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
    }

    #[test]
    fn discover_on_fresh_project_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(discover_sessions(dir.path()).expect("discover"), Vec::new());
    }
}

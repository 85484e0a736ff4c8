//! Local recent-conversations cache.
//!
//! A durable hint only: it pre-populates the recent list before the
//! authoritative conversations query resolves, and is rewritten from that
//! query's results whenever they arrive.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use client_core::types::Conversation;

/// Persisted cache contents, scoped to the identity they were observed for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentCache {
    /// Identity the cached listing belongs to.
    pub identity_id: String,
    /// Conversations, most recently updated first.
    pub conversations: Vec<Conversation>,
}

/// Load cache JSON from disk when available.
pub fn load_recent_cache(path: &Path) -> Result<Option<RecentCache>, String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(format!(
                "failed reading recent cache {}: {err}",
                path.display()
            ));
        }
    };

    let cache = serde_json::from_str::<RecentCache>(&raw)
        .map_err(|err| format!("failed parsing recent cache {}: {err}", path.display()))?;
    Ok(Some(cache))
}

/// Persist cache JSON to disk, creating parent directories when needed.
pub fn save_recent_cache(path: &Path, cache: &RecentCache) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            format!(
                "failed creating recent cache directory {}: {err}",
                parent.display()
            )
        })?;
    }

    let encoded = serde_json::to_vec(cache).map_err(|err| err.to_string())?;
    let temp_path = recent_cache_temp_path(path);
    fs::write(&temp_path, encoded).map_err(|err| {
        format!(
            "failed writing temp recent cache {}: {err}",
            temp_path.display()
        )
    })?;

    if let Err(rename_err) = fs::rename(&temp_path, path) {
        // Windows does not allow replacing existing files via rename.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(format!(
                    "failed replacing recent cache {} after rename error ({rename_err}): {err}",
                    path.display()
                ));
            }
        }
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            format!(
                "failed writing recent cache {} after temp write: {err}",
                path.display()
            )
        })?;
    }

    Ok(())
}

/// Remove cache JSON from disk.
pub fn clear_recent_cache(path: &Path) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!(
            "failed deleting recent cache {}: {err}",
            path.display()
        )),
    }
}

fn recent_cache_temp_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("recent-cache.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, path::PathBuf};

    fn unique_temp_path(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        env::temp_dir().join(format!("driftchat-{label}-{now_nanos}.json"))
    }

    #[test]
    fn cache_round_trip() {
        let path = unique_temp_path("recent-cache");
        let cache = RecentCache {
            identity_id: "u-alice".to_owned(),
            conversations: vec![Conversation {
                id: "u-alice#u-bob".to_owned(),
                participant_ids: ["u-alice".to_owned(), "u-bob".to_owned()],
                last_updated_ms: 1_700_000_000_000,
            }],
        };

        save_recent_cache(&path, &cache).expect("save should work");
        let loaded = load_recent_cache(&path)
            .expect("load should work")
            .expect("cache should be present");
        assert_eq!(loaded, cache);

        // Overwrite replaces the previous contents wholesale.
        let emptied = RecentCache {
            identity_id: "u-alice".to_owned(),
            conversations: Vec::new(),
        };
        save_recent_cache(&path, &emptied).expect("overwrite should work");
        let reloaded = load_recent_cache(&path)
            .expect("load should work")
            .expect("cache should be present");
        assert!(reloaded.conversations.is_empty());

        clear_recent_cache(&path).expect("clear should work");
        let after_clear = load_recent_cache(&path).expect("load after clear should work");
        assert_eq!(after_clear, None);
    }
}

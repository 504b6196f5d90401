//! JSON persistence helpers shared by the history stores.
//!
//! Reads degrade to the default value on a missing or corrupt file; writes go
//! through a temp file and a rename so a crash never leaves a truncated file.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Load a JSON document, falling back to `T::default()` when the file is
/// missing or cannot be parsed.
pub fn load_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring corrupt history file");
                T::default()
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => T::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read history file");
            T::default()
        }
    }
}

/// Write a value as pretty JSON, atomically replacing `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "history.json".to_string());
    let temp_path = path.with_file_name(format!("{}.tmp", file_name));

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_returns_default() {
        let temp_dir = TempDir::new().expect("temp dir");
        let value: BTreeMap<String, u32> = load_json_or_default(&temp_dir.path().join("none.json"));
        assert!(value.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_returns_default() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("corrupt.json");
        fs::write(&path, "{ not json").expect("write");

        let value: BTreeMap<String, u32> = load_json_or_default(&path);
        assert!(value.is_empty());
    }

    #[test]
    fn test_write_then_load() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("nested").join("history.json");
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 3u32);

        write_json_atomic(&path, &value).expect("write");
        let loaded: BTreeMap<String, u32> = load_json_or_default(&path);

        assert_eq!(loaded, value);
        assert!(!path.with_file_name("history.json.tmp").exists());
    }
}

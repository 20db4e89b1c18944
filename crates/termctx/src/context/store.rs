//! Flat-file persistence shared by the memory and topic stores.
//!
//! Two rules hold for every store file:
//!
//! - **Decode or default.** A file is either decoded whole into its typed
//!   shape or replaced by that shape's default. There is no partial
//!   recovery: a half-valid file could violate store invariants.
//! - **Whole-value writes.** Each save serializes the complete state to a
//!   temp file and renames it into place, so readers never see a torn write.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Load `path` as `T`, falling back to `T::default()` when the file is
/// missing, unreadable, or does not decode.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No store file at {}, starting empty", path.display());
            return T::default();
        }
        Err(e) => {
            warn!("Unreadable store file {}: {e}; starting empty", path.display());
            return T::default();
        }
    };

    match serde_json::from_str(&json) {
        Ok(value) => value,
        Err(e) => {
            warn!("Corrupt store file {}: {e}; resetting", path.display());
            T::default()
        }
    }
}

/// Atomic write: serialize to a temp file, then rename into place.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&tmp_path, json).map_err(|source| StoreError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
    struct Sample {
        items: Vec<String>,
        count: u32,
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Sample = load_or_default(&dir.path().join("absent.json"));
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn corrupt_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, "{\"items\": [1, 2").unwrap();
        let loaded: Sample = load_or_default(&path);
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn wrong_shape_loads_default_not_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, r#"{"items": ["a"], "count": "three"}"#).unwrap();
        let loaded: Sample = load_or_default(&path);
        assert!(loaded.items.is_empty());
    }

    #[test]
    fn write_then_load_round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");
        let value = Sample {
            items: vec!["x".into()],
            count: 3,
        };
        write_atomic(&path, &value).unwrap();

        let loaded: Sample = load_or_default(&path);
        assert_eq!(loaded, value);
        assert!(!path.with_file_name(".sample.json.tmp").exists());
        // Pretty-printed.
        assert!(std::fs::read_to_string(&path).unwrap().contains('\n'));
    }
}

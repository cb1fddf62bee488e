//! Whole-file JSON load/save helpers.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{StoreError, StoreResult};

/// Load `path`, or `T::default()` if it does not exist yet.
pub(super) fn load_or_default<T>(path: &Path) -> StoreResult<T>
where
    T: DeserializeOwned + Default,
{
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Write `value` to `path` via a sibling temp file and rename.
pub(super) fn save_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let write_err = |e| StoreError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
    }

    let encoded = serde_json::to_vec_pretty(value)?;
    let mut temp = path.as_os_str().to_os_string();
    temp.push(".tmp");
    let temp = std::path::PathBuf::from(temp);

    fs::write(&temp, encoded).map_err(write_err)?;
    fs::rename(&temp, path).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_default() {
        let temp = TempDir::new().unwrap();
        let value: Vec<u32> = load_or_default(&temp.path().join("absent.json")).unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/dir/values.json");

        save_atomic(&path, &vec![1u32, 2, 3]).unwrap();
        let value: Vec<u32> = load_or_default(&path).unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();

        let result: StoreResult<Vec<u32>> = load_or_default(&path);
        assert!(matches!(result, Err(StoreError::Parse { .. })));
    }
}

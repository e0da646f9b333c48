//! File persistence that never leaves a half-written file behind.
//!
//! Every write goes to a sibling `.tmp` file which is flushed to disk and
//! then renamed over the destination. A set of files can be staged together
//! so that none is replaced unless all were written.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Unix permission bits for files holding private key material.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, io::Error> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, io::Error> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    mode: Option<u32>,
) -> Result<(), io::Error> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &json, mode)
}

/// Atomically replace `path` with `contents`.
///
/// `mode` is applied to the temporary file before the rename so the final
/// file never exists with looser permissions. Ignored on non-Unix targets.
pub fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<(), io::Error> {
    write_all_atomic(&[(path, contents, mode)])
}

/// Replace a set of files together.
///
/// Every temporary file is written and flushed before the first rename, so
/// a failed write leaves all destinations untouched. Only a failing rename
/// can leave the set partially replaced.
pub fn write_all_atomic(files: &[(&Path, &[u8], Option<u32>)]) -> Result<(), io::Error> {
    let mut staged: Vec<PathBuf> = Vec::with_capacity(files.len());
    for (path, contents, mode) in files {
        match stage(path, contents, *mode) {
            Ok(tmp) => staged.push(tmp),
            Err(e) => {
                for tmp in &staged {
                    let _ = std::fs::remove_file(tmp);
                }
                return Err(e);
            }
        }
    }

    for (i, (tmp, (path, _, _))) in staged.iter().zip(files).enumerate() {
        if let Err(e) = std::fs::rename(tmp, path) {
            for tmp in &staged[i..] {
                let _ = std::fs::remove_file(tmp);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Write `contents` to the temporary sibling of `path` and flush it.
fn stage(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<PathBuf, io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp = tmp_path(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        #[cfg(unix)]
        {
            if let Some(mode) = mode {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(std::fs::Permissions::from_mode(mode))?;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
        }
        file.write_all(contents)?;
        file.sync_all()
    })();

    match result {
        Ok(()) => Ok(tmp),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("keyturn-persist-{name}-{nanos}"))
    }

    #[test]
    fn read_json_invalid_returns_invalid_data() {
        let dir = temp_path("invalid");
        let path = dir.join("bad.json");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, "{broken json").unwrap();

        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_json_if_exists_missing_returns_none() {
        let path = temp_path("missing").join("missing.json");
        let value: Option<Vec<String>> = read_json_if_exists(&path).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn write_json_atomic_creates_parent_and_leaves_no_tmp() {
        let path = temp_path("write").join("nested").join("value.json");
        write_json_atomic(&path, &vec!["a", "b"], None).unwrap();

        let back: Vec<String> = read_json(&path).unwrap();
        assert_eq!(back, vec!["a", "b"]);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn write_atomic_replaces_existing_contents() {
        let path = temp_path("replace").join("cert.pem");
        write_atomic(&path, b"first", None).unwrap();
        write_atomic(&path, b"second", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn write_atomic_fails_on_directory_path() {
        let dir = temp_path("dir");
        std::fs::create_dir_all(&dir).unwrap();

        assert!(write_atomic(&dir, b"x", None).is_err());
        assert!(!tmp_path(&dir).exists());
    }

    #[test]
    fn write_all_atomic_leaves_every_file_untouched_when_one_fails() {
        let dir = temp_path("set");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        let pair = |c: &'static str, k: &'static str| {
            write_all_atomic(&[
                (cert.as_path(), c.as_bytes(), None),
                (key.as_path(), k.as_bytes(), None),
            ])
        };
        pair("cert-1", "key-1").unwrap();

        // A directory squatting on the key's temp path makes staging fail.
        std::fs::create_dir_all(tmp_path(&key)).unwrap();
        assert!(pair("cert-2", "key-2").is_err());

        assert_eq!(std::fs::read(&cert).unwrap(), b"cert-1");
        assert_eq!(std::fs::read(&key).unwrap(), b"key-1");
        assert!(!tmp_path(&cert).exists());
    }

    #[cfg(unix)]
    #[test]
    fn write_atomic_applies_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path("mode").join("key.pem");
        write_atomic(&path, b"secret", Some(PRIVATE_FILE_MODE)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

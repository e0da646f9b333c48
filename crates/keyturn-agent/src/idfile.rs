//! On-disk identity bundle.
//!
//! Layout under the identity directory:
//! - `identity.json` — the full [`Identity`], including the private key (0600)
//! - `cert.pem` — identity certificate
//! - `key.pem` — private key (0600)
//! - `ca.pem` — trusted CA certificates
//!
//! The files are staged together and only renamed into place once all of
//! them are on disk. `identity.json` is renamed last and is the only file
//! read back, so a crash mid-write leaves the previous identity loadable.

use std::path::{Path, PathBuf};

use keyturn_common::persist::{self, PRIVATE_FILE_MODE};
use keyturn_rotation::trust::concat_pem;

use crate::error::AgentError;
use crate::identity::Identity;

pub const IDENTITY_FILENAME: &str = "identity.json";
pub const CERT_FILENAME: &str = "cert.pem";
pub const KEY_FILENAME: &str = "key.pem";
pub const CA_FILENAME: &str = "ca.pem";

const PUBLIC_FILE_MODE: u32 = 0o644;

pub fn identity_path(dir: &Path) -> PathBuf {
    dir.join(IDENTITY_FILENAME)
}

/// Write every file of the bundle as one set. A failed write leaves the
/// previous bundle in place, so `cert.pem` and `key.pem` always belong
/// together.
pub fn write_identity(dir: &Path, identity: &Identity) -> Result<(), AgentError> {
    let json = serde_json::to_vec_pretty(identity)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let ca_bundle = concat_pem(&identity.trusted_cas);
    let cert = dir.join(CERT_FILENAME);
    let key = dir.join(KEY_FILENAME);
    let ca = dir.join(CA_FILENAME);
    let bundle = identity_path(dir);

    persist::write_all_atomic(&[
        (cert.as_path(), identity.certificate_pem.as_bytes(), Some(PUBLIC_FILE_MODE)),
        (key.as_path(), identity.private_key_pem.as_bytes(), Some(PRIVATE_FILE_MODE)),
        (ca.as_path(), ca_bundle.as_bytes(), Some(PUBLIC_FILE_MODE)),
        (bundle.as_path(), json.as_slice(), Some(PRIVATE_FILE_MODE)),
    ])?;

    tracing::debug!(
        path = %dir.display(),
        generation = identity.generation,
        "Identity bundle written"
    );
    Ok(())
}

/// Load the bundle, or `None` if no identity has been written yet.
pub fn load_identity(dir: &Path) -> Result<Option<Identity>, AgentError> {
    let identity: Option<Identity> = persist::read_json_if_exists(&identity_path(dir))?;
    if let Some(id) = &identity {
        if id.certificate_pem.is_empty() || id.private_key_pem.is_empty() {
            return Err(AgentError::InvalidIdentity(format!(
                "{} is missing key material",
                identity_path(dir).display()
            )));
        }
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::identity;

    #[test]
    fn bundle_round_trips() {
        let dir = keyturn_common::test::scratch_dir("agent-idfile");
        let id = identity(4);
        write_identity(&dir, &id).unwrap();

        let loaded = load_identity(&dir).unwrap().unwrap();
        assert_eq!(loaded.generation, 4);
        assert_eq!(loaded.private_key_pem, id.private_key_pem);
        assert_eq!(loaded.trusted_anchor_count(), 1);

        assert_eq!(
            std::fs::read_to_string(dir.join(CERT_FILENAME)).unwrap(),
            id.certificate_pem
        );
        assert_eq!(
            std::fs::read_to_string(dir.join(CA_FILENAME)).unwrap(),
            "ca\n"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_bundle_is_none() {
        let dir = keyturn_common::test::scratch_dir("agent-idfile-missing");
        assert!(load_identity(&dir).unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rewrite_replaces_the_previous_bundle() {
        let dir = keyturn_common::test::scratch_dir("agent-idfile-rewrite");
        write_identity(&dir, &identity(1)).unwrap();
        write_identity(&dir, &identity(2)).unwrap();
        assert_eq!(load_identity(&dir).unwrap().unwrap().generation, 2);
        assert_eq!(
            std::fs::read_to_string(dir.join(KEY_FILENAME)).unwrap(),
            "key-2"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_write_keeps_the_previous_pair() {
        let dir = keyturn_common::test::scratch_dir("agent-idfile-partial");
        write_identity(&dir, &identity(1)).unwrap();

        std::fs::create_dir_all(dir.join("key.pem.tmp")).unwrap();
        assert!(write_identity(&dir, &identity(2)).is_err());

        let read = |name| std::fs::read_to_string(dir.join(name)).unwrap();
        assert_eq!(read(CERT_FILENAME), "cert-1");
        assert_eq!(read(KEY_FILENAME), "key-1");
        assert_eq!(load_identity(&dir).unwrap().unwrap().generation, 1);
        assert!(!dir.join("cert.pem.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn key_material_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = keyturn_common::test::scratch_dir("agent-idfile-mode");
        write_identity(&dir, &identity(1)).unwrap();
        for name in [KEY_FILENAME, IDENTITY_FILENAME] {
            let mode = std::fs::metadata(dir.join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{name}");
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}

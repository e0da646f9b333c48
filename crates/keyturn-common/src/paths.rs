use std::path::PathBuf;

/// Root data directory for keyturn.
///
/// `KEYTURN_DATA_DIR` overrides the platform default.
///
/// - Linux: `~/.keyturn/`
/// - macOS: `~/Library/Application Support/keyturn/`
/// - Windows: `%LOCALAPPDATA%\keyturn\`
pub fn keyturn_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("KEYTURN_DATA_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("keyturn");
        }
    }

    #[cfg(windows)]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("keyturn");
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".keyturn");
        }
    }

    PathBuf::from(".keyturn")
}

/// Log directory (audit log lives here).
pub fn keyturn_log_dir() -> PathBuf {
    keyturn_data_dir().join("logs")
}

/// Default directory for an agent's identity bundle.
pub fn keyturn_identity_dir(subject: &str) -> PathBuf {
    keyturn_data_dir().join("identity").join(subject)
}

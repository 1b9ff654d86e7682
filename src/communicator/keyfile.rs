//! Private key material written to disk for the `ssh` client.

use std::fs;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use super::PrivateKey;

/// A private key file that is removed when dropped.
///
/// The file is created exclusively with mode `0600`, since `ssh` refuses
/// keys readable by others.
#[derive(Debug)]
pub(super) struct KeyFile {
    path: Utf8PathBuf,
}

impl KeyFile {
    pub(super) fn write(dir: &Utf8Path, key: &PrivateKey) -> Result<Self> {
        let path = dir.join(format!("qcbake-key-{}", uuid::Uuid::new_v4()));

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&path)
            .with_context(|| format!("failed to create key file {}", path))?;
        let guard = Self { path };
        file.write_all(key.pem().as_bytes())
            .with_context(|| format!("failed to write key file {}", guard.path))?;
        tracing::debug!("wrote private key to {}", guard.path);
        Ok(guard)
    }

    pub(super) fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("removed key file: {}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("key file already removed: {}", self.path);
            }
            Err(e) => {
                tracing::error!(
                    path = %self.path,
                    error_kind = ?e.kind(),
                    "failed to remove key file: {}",
                    e,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::communicator::test_keys::ED25519 as KEY;

    #[test]
    fn key_file_is_private_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let key = PrivateKey::parse(KEY).unwrap();

        let file = KeyFile::write(dir, &key).unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(fs::read_to_string(&path).unwrap(), KEY);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(file);
        assert!(!path.exists());
    }
}

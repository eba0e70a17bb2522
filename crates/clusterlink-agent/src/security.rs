//! Shared-secret credential store.
//!
//! The secret lives hex-encoded at `<root>/var/lib/clusterlink/secret`. Every
//! read and write holds an exclusive advisory lock on a sidecar `.lock` file
//! for exactly the duration of the I/O, so concurrent readers and writers in
//! any process serialize and never observe a partial value.

use clusterlink_types::AgentConfig;
use rand::RngCore;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Length of a freshly generated secret, in bytes.
pub const SECRET_LEN: usize = 16;

/// Permission bits applied to the secret after every write.
#[cfg(unix)]
const SECRET_MODE: u32 = 0o640;

/// Errors from the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Underlying filesystem error, passed through unchanged.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The stored text is not valid hex of even length.
    #[error("Malformed shared secret: {0}")]
    Decode(#[from] hex::FromHexError),
}

/// The pre-provisioned secret both sides derive their certificates from.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl SharedSecret {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// A fresh random secret of [`SECRET_LEN`] bytes.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    /// Decode hex text, ignoring surrounding whitespace.
    pub fn from_hex(text: &str) -> Result<Self, CredentialError> {
        Ok(Self::from_bytes(to_bin(text)?))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes>)", self.0.len())
    }
}

/// Hex-encode bytes.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode hex text, ignoring surrounding whitespace.
pub fn to_bin(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(text.trim())
}

/// Exclusive advisory lock held until drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is owned by `file` and valid for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: as above; closing the file would release it anyway.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Reads and writes the shared secret under a file lock.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured location under `root`.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.secret_path())
    }

    /// Path of the secret file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Read the secret. Returns `Ok(None)` when none has been provisioned.
    pub fn read(&self) -> Result<Option<SharedSecret>, CredentialError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => return Ok(None),
            _ => {}
        }

        let _lock = FileLock::acquire(&self.lock_path())?;
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No shared secret on disk");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(SharedSecret::from_hex(&text)?))
    }

    /// Write the secret, creating parent directories as needed.
    pub fn write(&self, secret: &SharedSecret) -> Result<(), CredentialError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let _lock = FileLock::acquire(&self.lock_path())?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(SECRET_MODE);
        }
        let mut file = options.open(&self.path)?;
        // `mode` only applies to new files; tighten an existing one before
        // the secret lands in it.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(SECRET_MODE))?;
        }
        file.write_all(secret.to_hex().as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Replace the secret with a freshly generated one and return it.
    ///
    /// Peers holding the old secret can no longer complete a handshake with
    /// this node until they are given the new one.
    pub fn rotate(&self) -> Result<SharedSecret, CredentialError> {
        let secret = SharedSecret::generate();
        self.write(&secret)?;
        info!(path = %self.path.display(), "Shared secret rotated");
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        let config = AgentConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        CredentialStore::from_config(&config)
    }

    #[test]
    fn test_returns_none_when_no_secret_exists() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store_in(&dir).read().unwrap().is_none());
    }

    #[test]
    fn test_write_then_read_with_leading_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let secret = SharedSecret::from_bytes(vec![0u8, 0, 1, 0xfe, 0xff]);
        store.write(&secret).unwrap();
        assert_eq!(store.read().unwrap(), Some(secret));
    }

    #[test]
    fn test_same_secret_on_subsequent_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&SharedSecret::generate()).unwrap();
        assert_eq!(store.read().unwrap(), store.read().unwrap());
    }

    #[test]
    fn test_tolerates_surrounding_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let secret = SharedSecret::generate();
        store.write(&secret).unwrap();
        fs::write(store.path(), format!(" {}\n", secret.to_hex())).unwrap();
        assert_eq!(store.read().unwrap(), Some(secret));
    }

    #[test]
    fn test_malformed_value_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&SharedSecret::generate()).unwrap();

        fs::write(store.path(), "_").unwrap();
        assert!(matches!(store.read(), Err(CredentialError::Decode(_))));

        fs::write(store.path(), "abc").unwrap();
        assert!(matches!(store.read(), Err(CredentialError::Decode(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_writes_with_secure_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&SharedSecret::generate()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640, "Expected 0640, got {mode:04o}");
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_secret_is_tightened_on_write() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "00").unwrap();
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o666)).unwrap();

        let secret = SharedSecret::generate();
        store.write(&secret).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640, "Expected 0640, got {mode:04o}");
        assert_eq!(store.read().unwrap().unwrap(), secret);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_errors_are_raised() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.write(&SharedSecret::generate()).unwrap();
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o000)).unwrap();

        let result = store.read();
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o600)).unwrap();
        // Root ignores permission bits; only assert when the read was denied.
        if let Err(e) = result {
            match e {
                CredentialError::Io(err) => {
                    assert_eq!(err.kind(), io::ErrorKind::PermissionDenied)
                }
                other => panic!("Expected Io error, got {other:?}"),
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_write_waits_for_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let first = SharedSecret::from_bytes(b"first".to_vec());
        store.write(&first).unwrap();

        let held = FileLock::acquire(&store.lock_path()).unwrap();
        let (tx, rx) = mpsc::channel();
        let writer_store = store.clone();
        let handle = std::thread::spawn(move || {
            writer_store
                .write(&SharedSecret::from_bytes(b"second".to_vec()))
                .unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), first.to_hex());

        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(
            store.read().unwrap().unwrap().as_bytes(),
            b"second".as_slice()
        );
    }

    #[test]
    fn test_concurrent_reads_and_writes_never_mix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let a = SharedSecret::from_bytes(vec![0xaa; 64]);
        let b = SharedSecret::from_bytes(vec![0x0b; 32]);
        store.write(&a).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let secret = if i % 2 == 0 { a.clone() } else { b.clone() };
            let (a, b) = (a.clone(), b.clone());
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    store.write(&secret).unwrap();
                    let seen = store.read().unwrap().unwrap();
                    assert!(seen == a || seen == b, "observed a mixed secret");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let last = store.read().unwrap().unwrap();
        assert!(last == a || last == b);
    }

    #[test]
    fn test_rotate_replaces_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let original = SharedSecret::generate();
        store.write(&original).unwrap();
        let rotated = store.rotate().unwrap();
        assert_ne!(rotated, original);
        assert_eq!(store.read().unwrap(), Some(rotated));
    }

    #[test]
    fn test_debug_hides_bytes() {
        let secret = SharedSecret::from_bytes(vec![1, 2, 3]);
        assert_eq!(format!("{secret:?}"), "SharedSecret(<3 bytes>)");
    }
}

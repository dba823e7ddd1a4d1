use crate::key::{Key, KeyPair};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

const LOCK_ATTEMPTS: u32 = 100;
const LOCK_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key store i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored key material for {name:?} does not decode")]
    BadKey { name: String },

    #[error("timed out waiting for key store lock {path}")]
    LockTimeout { path: PathBuf },
}

/// The key-material boundary of the config pipeline.
///
/// Both operations are idempotent: asking twice for the same node (or the
/// same unordered pair) must return the same material.
pub trait KeyProvider {
    fn get_or_create(&mut self, node: &str) -> Result<KeyPair, StoreError>;
    fn get_or_create_psk(&mut self, a: &str, b: &str) -> Result<Key, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    private_key: String,
    public_key: String,
    created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PskRecord {
    psk: String,
    created_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Contents {
    #[serde(default)]
    keys: BTreeMap<String, KeyRecord>,
    #[serde(default)]
    psks: BTreeMap<String, PskRecord>,
}

/// PSKs are stored under the lexicographically sorted pair so that both
/// directions of a peering land on the same record.
fn pair_name(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}+{b}")
    } else {
        format!("{b}+{a}")
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Held while the store file is being mutated. The lock is an adjacent
/// `.lock` file created with `O_EXCL`; dropping the guard removes it.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                },
                Err(e) if e.kind() == ErrorKind::AlreadyExists => thread::sleep(LOCK_RETRY),
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
        Err(StoreError::LockTimeout { path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A JSON-backed key store, safe against concurrent generator runs.
///
/// Reads are served from memory; every create re-reads the file under the
/// lock first, so two processes racing on the same node converge on
/// whichever key was persisted first.
#[derive(Debug)]
pub struct FileKeyStore {
    path: PathBuf,
    contents: Contents,
}

impl FileKeyStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let contents = Self::read_contents(&path)?;
        Ok(Self { path, contents })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_contents(path: &Path) -> Result<Contents, StoreError> {
        match fs::read_to_string(path) {
            Ok(json) => serde_json::from_str(&json).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Contents::default()),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.contents).expect("contents are plain maps");
        fs::write(&self.path, json).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Re-read, mutate, write back, all under the lock file.
    fn update<F>(&mut self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Contents),
    {
        let _lock = FileLock::acquire(self.lock_path())?;
        self.contents = Self::read_contents(&self.path)?;
        mutate(&mut self.contents);
        self.persist()
    }

    fn decode_pair(name: &str, record: &KeyRecord) -> Result<KeyPair, StoreError> {
        let private = Key::from_base64(&record.private_key).map_err(|_| StoreError::BadKey {
            name: name.to_string(),
        })?;
        let pair = KeyPair::from_private(private);
        if pair.public.to_base64() != record.public_key {
            return Err(StoreError::BadKey {
                name: name.to_string(),
            });
        }
        Ok(pair)
    }
}

impl KeyProvider for FileKeyStore {
    fn get_or_create(&mut self, node: &str) -> Result<KeyPair, StoreError> {
        if let Some(record) = self.contents.keys.get(node) {
            return Self::decode_pair(node, record);
        }

        self.update(|contents| {
            contents.keys.entry(node.to_string()).or_insert_with(|| {
                let pair = KeyPair::generate();
                log::debug!("created keypair {} for {}", pair.public.fingerprint(), node);
                KeyRecord {
                    private_key: pair.private.to_base64(),
                    public_key: pair.public.to_base64(),
                    created_at: unix_now(),
                }
            });
        })?;

        let record = &self.contents.keys[node];
        Self::decode_pair(node, record)
    }

    fn get_or_create_psk(&mut self, a: &str, b: &str) -> Result<Key, StoreError> {
        let name = pair_name(a, b);
        if let Some(record) = self.contents.psks.get(&name) {
            return Key::from_base64(&record.psk).map_err(|_| StoreError::BadKey { name });
        }

        self.update(|contents| {
            contents.psks.entry(name.clone()).or_insert_with(|| {
                let psk = Key::generate_preshared();
                log::debug!("created preshared key for pair {}", name);
                PskRecord {
                    psk: psk.to_base64(),
                    created_at: unix_now(),
                }
            });
        })?;

        let record = &self.contents.psks[&name];
        Key::from_base64(&record.psk).map_err(|_| StoreError::BadKey { name })
    }
}

/// In-memory store for tests and `--ephemeral` builds. Same idempotence
/// contract as [`FileKeyStore`], nothing touches disk.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: BTreeMap<String, KeyPair>,
    psks: BTreeMap<String, Key>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyProvider for MemoryKeyStore {
    fn get_or_create(&mut self, node: &str) -> Result<KeyPair, StoreError> {
        Ok(self
            .keys
            .entry(node.to_string())
            .or_insert_with(KeyPair::generate)
            .clone())
    }

    fn get_or_create_psk(&mut self, a: &str, b: &str) -> Result<Key, StoreError> {
        Ok(self
            .psks
            .entry(pair_name(a, b))
            .or_insert_with(Key::generate_preshared)
            .clone())
    }
}

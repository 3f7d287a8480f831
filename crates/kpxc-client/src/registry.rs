//! Client identities per KeePassXC database.
//!
//! Associating with a database yields a name chosen by KeePassXC and an
//! identity key chosen by us. Both are needed on every later connection, so
//! they are stored keyed by the database hash.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::secure_memory::{MemoryError, MemoryState, SecureBuffer};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registry file is malformed: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Invalid registry entry for database {0}: {1}")]
    InvalidEntry(String, String),

    #[error("Secure memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Name and identity key registered with one database.
#[derive(Debug)]
pub struct ClientId {
    pub name: String,
    pub key: SecureBuffer,
}

impl ClientId {
    pub fn new(name: impl Into<String>, key: SecureBuffer) -> Self {
        Self { name: name.into(), key }
    }

    pub fn try_clone(&self) -> Result<Self, MemoryError> {
        Ok(Self {
            name: self.name.clone(),
            key: self.key.try_clone()?,
        })
    }
}

/// Storage backend for [`ClientId`]s. Keys are stored at NoAccess.
pub trait DatabaseRegistry: Send {
    fn has_client_id(&self, database_hash: &[u8]) -> bool {
        self.client_id(database_hash).is_some()
    }

    fn client_id(&self, database_hash: &[u8]) -> Option<&ClientId>;

    /// Every stored identity; KeePassXC may hold several databases open.
    fn all_client_ids(&self) -> Vec<&ClientId>;

    fn add_client_id(&mut self, database_hash: &[u8], client_id: ClientId) -> Result<(), RegistryError>;

    fn remove_client_id(&mut self, database_hash: &[u8]) -> Result<(), RegistryError>;
}

fn seal_key(mut client_id: ClientId) -> Result<ClientId, RegistryError> {
    client_id.key.make_no_access()?;
    Ok(client_id)
}

/// Process-lifetime registry, nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    ids: BTreeMap<Vec<u8>, ClientId>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl DatabaseRegistry for MemoryRegistry {
    fn client_id(&self, database_hash: &[u8]) -> Option<&ClientId> {
        self.ids.get(database_hash)
    }

    fn all_client_ids(&self) -> Vec<&ClientId> {
        self.ids.values().collect()
    }

    fn add_client_id(&mut self, database_hash: &[u8], client_id: ClientId) -> Result<(), RegistryError> {
        self.ids.insert(database_hash.to_vec(), seal_key(client_id)?);
        Ok(())
    }

    fn remove_client_id(&mut self, database_hash: &[u8]) -> Result<(), RegistryError> {
        self.ids.remove(database_hash);
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    databases: BTreeMap<String, StoredClientId>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredClientId {
    name: String,
    key: String,
}

/// JSON file registry: `{"databases": {"<hex hash>": {"name": .., "key": <base64>}}}`.
///
/// Every change is written through to disk. A failed write leaves the
/// in-memory state updated and reports the error.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    inner: MemoryRegistry,
}

impl FileRegistry {
    /// Loads `path` if it exists, otherwise starts empty without touching disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let mut registry = Self {
            path: path.as_ref().to_path_buf(),
            inner: MemoryRegistry::new(),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// `<data dir>/registry.json`, see [`crate::paths::registry_path`].
    pub fn default_path() -> Option<PathBuf> {
        crate::paths::registry_path()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reload(&mut self) -> Result<(), RegistryError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => Zeroizing::new(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.inner = MemoryRegistry::new();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let file: RegistryFile = serde_json::from_slice(&raw)?;

        let mut inner = MemoryRegistry::new();
        for (hash_hex, stored) in &file.databases {
            let hash = hex::decode(hash_hex)
                .map_err(|e| RegistryError::InvalidEntry(hash_hex.clone(), e.to_string()))?;
            let key = SecureBuffer::from_base64(&stored.key, MemoryState::NoAccess)
                .map_err(|e| RegistryError::InvalidEntry(hash_hex.clone(), e.to_string()))?;
            inner.add_client_id(&hash, ClientId::new(stored.name.clone(), key))?;
        }
        debug!(path = %self.path.display(), databases = inner.len(), "loaded client registry");
        self.inner = inner;
        Ok(())
    }

    fn persist(&self) -> Result<(), RegistryError> {
        let mut file = RegistryFile::default();
        for (hash, id) in &self.inner.ids {
            file.databases.insert(
                hex::encode(hash),
                StoredClientId {
                    name: id.name.clone(),
                    key: id.key.to_base64()?,
                },
            );
        }
        let json = Zeroizing::new(serde_json::to_vec_pretty(&file)?);
        write_atomic(&self.path, &json)?;
        Ok(())
    }
}

fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = parent.join(format!(".{}.staging", Uuid::new_v4()));
    {
        let mut file = File::create(&staging)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
                warn!("cannot restrict permissions on {}: {}", staging.display(), e);
            }
        }
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&staging, dest) {
        let _ = fs::remove_file(&staging);
        return Err(err.into());
    }
    Ok(())
}

impl DatabaseRegistry for FileRegistry {
    fn client_id(&self, database_hash: &[u8]) -> Option<&ClientId> {
        self.inner.client_id(database_hash)
    }

    fn all_client_ids(&self) -> Vec<&ClientId> {
        self.inner.all_client_ids()
    }

    fn add_client_id(&mut self, database_hash: &[u8], client_id: ClientId) -> Result<(), RegistryError> {
        self.inner.add_client_id(database_hash, client_id)?;
        self.persist()
    }

    fn remove_client_id(&mut self, database_hash: &[u8]) -> Result<(), RegistryError> {
        self.inner.remove_client_id(database_hash)?;
        self.persist()
    }
}

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::decode::is_reference_image;
use crate::errors::{AppError, AppResult};
use crate::faces::enrollment::validate_identity_key;

pub const DEFAULT_STORE_DIR: &str = "/var/lib/facegate/faces";
pub const STORE_DIR_ENV: &str = "FACEGATE_STORAGE_DIR";
/// File name every enrollment writes (and overwrites) inside an identity directory.
pub const CANONICAL_REFERENCE: &str = "face.png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReference {
    pub identity: String,
    pub image_id: String,
    pub bytes: Vec<u8>,
}

pub type ReferenceIter<'a> = Box<dyn Iterator<Item = AppResult<StoredReference>> + 'a>;

/// Durable identity → reference image mapping.
pub trait IdentityStore: Send + Sync {
    /// Writes the canonical reference for `identity`, returning its image id.
    fn put_reference(&self, identity: &str, image: &[u8]) -> AppResult<String>;

    /// Every stored reference across all identities, read lazily.
    fn list_references(&self) -> AppResult<ReferenceIter<'_>>;

    /// Directory the store lives in, when it has one.
    fn root(&self) -> Option<&Path> {
        None
    }
}

impl<S: IdentityStore + ?Sized> IdentityStore for std::sync::Arc<S> {
    fn put_reference(&self, identity: &str, image: &[u8]) -> AppResult<String> {
        (**self).put_reference(identity, image)
    }

    fn list_references(&self) -> AppResult<ReferenceIter<'_>> {
        (**self).list_references()
    }

    fn root(&self) -> Option<&Path> {
        (**self).root()
    }
}

/// Directory per identity, one canonical image per directory.
#[derive(Debug, Clone)]
pub struct FilesystemIdentityStore {
    root: PathBuf,
}

impl FilesystemIdentityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn identity_dir(&self, identity: &str) -> PathBuf {
        self.root.join(identity)
    }
}

impl IdentityStore for FilesystemIdentityStore {
    fn put_reference(&self, identity: &str, image: &[u8]) -> AppResult<String> {
        validate_identity_key(identity)?;
        let dir = self.identity_dir(identity);
        fs::create_dir_all(&dir).map_err(|source| AppError::storage(&dir, source))?;

        let path = dir.join(CANONICAL_REFERENCE);
        write_atomically(&dir, &path, image)?;
        Ok(CANONICAL_REFERENCE.to_string())
    }

    fn list_references(&self) -> AppResult<ReferenceIter<'_>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()))
            }
            Err(source) => return Err(AppError::storage(&self.root, source)),
        };

        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AppError::storage(&self.root, source))?;
            let file_type = entry
                .file_type()
                .map_err(|source| AppError::storage(entry.path(), source))?;
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            identities.push((name, entry.path()));
        }
        identities.sort();

        let references = identities
            .into_iter()
            .flat_map(|(identity, dir)| reference_files(identity, &dir))
            .map(|item| item.and_then(|(identity, path)| read_reference(identity, &path)));
        Ok(Box::new(references))
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

fn reference_files(identity: String, dir: &Path) -> Vec<AppResult<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(source) => return vec![Err(AppError::storage(dir, source))],
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) => return vec![Err(AppError::storage(dir, source))],
        };
        let path = entry.path();
        if path.is_file() && is_reference_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    paths
        .into_iter()
        .map(|path| Ok((identity.clone(), path)))
        .collect()
}

fn read_reference(identity: String, path: &Path) -> AppResult<StoredReference> {
    let bytes = fs::read(path).map_err(|source| AppError::storage(path, source))?;
    let image_id = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(StoredReference {
        identity,
        image_id,
        bytes,
    })
}

/// Temp file in the target directory, synced, then renamed over `path`.
pub(crate) fn write_atomically(dir: &Path, path: &Path, contents: &[u8]) -> AppResult<()> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| AppError::storage(path, source))?;
    {
        let file = tmp.as_file_mut();
        file.write_all(contents)
            .map_err(|source| AppError::storage(path, source))?;
        file.sync_all()
            .map_err(|source| AppError::storage(path, source))?;
    }

    // Set before the rename; a failure here leaves the store untouched.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|source| AppError::storage(path, source))?;
    }

    tmp.persist(path)
        .map_err(|err| AppError::storage(path, err.error))?;
    Ok(())
}

/// Keeps references in memory; nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    references: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extra, non-canonical reference for an identity.
    pub fn insert_reference(&self, identity: &str, image_id: &str, image: &[u8]) {
        self.references
            .write()
            .entry(identity.to_string())
            .or_default()
            .insert(image_id.to_string(), image.to_vec());
    }

    pub fn identity_count(&self) -> usize {
        self.references.read().len()
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn put_reference(&self, identity: &str, image: &[u8]) -> AppResult<String> {
        validate_identity_key(identity)?;
        self.insert_reference(identity, CANONICAL_REFERENCE, image);
        Ok(CANONICAL_REFERENCE.to_string())
    }

    fn list_references(&self) -> AppResult<ReferenceIter<'_>> {
        let snapshot: Vec<StoredReference> = self
            .references
            .read()
            .iter()
            .flat_map(|(identity, images)| {
                images.iter().map(move |(image_id, bytes)| StoredReference {
                    identity: identity.clone(),
                    image_id: image_id.clone(),
                    bytes: bytes.clone(),
                })
            })
            .collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

pub trait StoreDirResolver {
    fn resolve(&self, override_dir: Option<&Path>) -> PathBuf;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvStoreDirResolver;

impl StoreDirResolver for EnvStoreDirResolver {
    fn resolve(&self, override_dir: Option<&Path>) -> PathBuf {
        if let Some(dir) = override_dir {
            dir.to_path_buf()
        } else if let Ok(env_value) = env::var(STORE_DIR_ENV) {
            PathBuf::from(env_value)
        } else {
            PathBuf::from(DEFAULT_STORE_DIR)
        }
    }
}

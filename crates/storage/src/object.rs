#![forbid(unsafe_code)]

use crate::error::StoreError;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Blob storage for code snapshots, run artifacts and job aggregates.
///
/// Blob paths are `/`-separated and relative to their container.
pub trait ObjectStore: Send + Sync {
    fn create_container(&self, container: &str) -> Result<(), StoreError>;
    fn list_containers(&self) -> Result<Vec<String>, StoreError>;
    fn delete_container(&self, container: &str) -> Result<(), StoreError>;

    fn create_blob(&self, container: &str, path: &str, data: &[u8]) -> Result<(), StoreError>;
    fn append_blob(&self, container: &str, path: &str, data: &[u8]) -> Result<(), StoreError>;
    fn blob_exists(&self, container: &str, path: &str) -> Result<bool, StoreError>;
    fn read_blob(&self, container: &str, path: &str) -> Result<Vec<u8>, StoreError>;
    fn download(&self, container: &str, path: &str, dest: &Path) -> Result<(), StoreError>;
    fn upload(&self, container: &str, path: &str, src: &Path) -> Result<(), StoreError>;
    fn delete_blob(&self, container: &str, path: &str) -> Result<(), StoreError>;
    fn copy_blob(&self, container: &str, src: &str, dest: &str) -> Result<(), StoreError>;
    /// Freeze the current contents; returns the snapshot's blob path.
    fn snapshot_blob(&self, container: &str, path: &str) -> Result<String, StoreError>;
    /// Blobs under `prefix`. With a delimiter, deeper entries collapse into
    /// one `<prefix><dir><delimiter>` item each.
    fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<String>, StoreError>;
    /// Hex SHA-256 of the blob contents.
    fn blob_digest(&self, container: &str, path: &str) -> Result<String, StoreError>;
}

pub fn blob_sha256(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Directory-backed object store; containers are top-level directories.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf, StoreError> {
        if container.is_empty()
            || container.starts_with('.')
            || container.contains(['/', '\\'])
        {
            return Err(StoreError::InvalidInput(format!(
                "invalid container name: {container:?}"
            )));
        }
        Ok(self.root.join(container))
    }

    fn blob_path(&self, container: &str, path: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(path.trim_start_matches('/'));
        let safe = !path.trim().is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(StoreError::InvalidInput(format!("invalid blob path: {path:?}")));
        }
        Ok(self.container_dir(container)?.join(rel))
    }

    fn existing_blob(&self, container: &str, path: &str) -> Result<PathBuf, StoreError> {
        let full = self.blob_path(container, path)?;
        if !full.is_file() {
            return Err(StoreError::BlobNotFound {
                container: container.to_string(),
                path: path.to_string(),
            });
        }
        Ok(full)
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write through a sibling temp file so readers never see partial blobs.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".{}.partial", uuid::Uuid::new_v4().simple()));
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn collect_files(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_rel = if rel.is_empty() {
            name
        } else {
            format!("{rel}/{name}")
        };
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), &child_rel, out)?;
        } else if !child_rel.ends_with(".partial") {
            out.push(child_rel);
        }
    }
    Ok(())
}

impl ObjectStore for FsObjectStore {
    fn create_container(&self, container: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.container_dir(container)?)?;
        Ok(())
    }

    fn list_containers(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete_container(&self, container: &str) -> Result<(), StoreError> {
        match std::fs::remove_dir_all(self.container_dir(container)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn create_blob(&self, container: &str, path: &str, data: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.blob_path(container, path)?, data)
    }

    fn append_blob(&self, container: &str, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let full = self.blob_path(container, path)?;
        ensure_parent(&full)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(full)?;
        file.write_all(data)?;
        Ok(())
    }

    fn blob_exists(&self, container: &str, path: &str) -> Result<bool, StoreError> {
        Ok(self.blob_path(container, path)?.is_file())
    }

    fn read_blob(&self, container: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(self.existing_blob(container, path)?)?)
    }

    fn download(&self, container: &str, path: &str, dest: &Path) -> Result<(), StoreError> {
        let src = self.existing_blob(container, path)?;
        ensure_parent(dest)?;
        std::fs::copy(src, dest)?;
        Ok(())
    }

    fn upload(&self, container: &str, path: &str, src: &Path) -> Result<(), StoreError> {
        let data = std::fs::read(src)?;
        self.create_blob(container, path, &data)
    }

    fn delete_blob(&self, container: &str, path: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.blob_path(container, path)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn copy_blob(&self, container: &str, src: &str, dest: &str) -> Result<(), StoreError> {
        let data = self.read_blob(container, src)?;
        self.create_blob(container, dest, &data)
    }

    fn snapshot_blob(&self, container: &str, path: &str) -> Result<String, StoreError> {
        let data = self.read_blob(container, path)?;
        let snap = format!(
            "{}.snapshots/{}",
            path.trim_start_matches('/'),
            xt_core::time::now_ms()
        );
        self.create_blob(container, &snap, &data)?;
        Ok(snap)
    }

    fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<String>, StoreError> {
        let mut all = Vec::new();
        collect_files(&self.container_dir(container)?, "", &mut all)?;
        let prefix = prefix.trim_start_matches('/');

        let mut out = BTreeSet::new();
        for path in all.into_iter().filter(|p| p.starts_with(prefix)) {
            let collapsed = delimiter.and_then(|d| {
                path[prefix.len()..]
                    .find(d)
                    .map(|i| path[..prefix.len() + i + d.len_utf8()].to_string())
            });
            out.insert(collapsed.unwrap_or(path));
        }
        Ok(out.into_iter().collect())
    }

    fn blob_digest(&self, container: &str, path: &str) -> Result<String, StoreError> {
        Ok(blob_sha256(&self.read_blob(container, path)?))
    }
}

#![forbid(unsafe_code)]

//! The per-box packet queue. Everything is mediated by the filesystem:
//! writers land a `.tmp` file and rename it, readers only look at `.zip`.

use crate::error::PsmError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use xt_core::packet::{PACKET_EXT, PACKET_TMP_EXT, PacketName};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueEntry {
    pub file_name: String,
    #[serde(skip)]
    pub name: PacketName,
    #[serde(skip)]
    pub path: PathBuf,
    pub ticks: i64,
}

#[derive(Clone, Debug)]
pub struct PsmQueue {
    dir: PathBuf,
}

impl PsmQueue {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PsmError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `src` into the queue under `name`.
    pub fn enqueue(&self, src: &Path, name: &PacketName) -> Result<PathBuf, PsmError> {
        let tmp = self.tmp_path(name);
        std::fs::copy(src, &tmp)?;
        self.publish(&tmp, name)
    }

    pub fn enqueue_bytes(&self, data: &[u8], name: &PacketName) -> Result<PathBuf, PsmError> {
        let tmp = self.tmp_path(name);
        std::fs::write(&tmp, data)?;
        self.publish(&tmp, name)
    }

    fn tmp_path(&self, name: &PacketName) -> PathBuf {
        self.dir.join(format!("{}.{PACKET_TMP_EXT}", name.stem()))
    }

    fn publish(&self, tmp: &Path, name: &PacketName) -> Result<PathBuf, PsmError> {
        let dest = self.dir.join(name.file_name());
        if let Err(err) = std::fs::rename(tmp, &dest) {
            let _ = std::fs::remove_file(tmp);
            return Err(err.into());
        }
        tracing::debug!(packet = %name.file_name(), queue = %self.dir.display(), "packet queued");
        Ok(dest)
    }

    /// Well-formed packets, oldest ticks first.
    pub fn list(&self) -> Result<Vec<QueueEntry>, PsmError> {
        let mut entries = self
            .zip_files()?
            .into_iter()
            .filter_map(|(file_name, path)| {
                let name = PacketName::parse(&file_name).ok()?;
                Some(QueueEntry {
                    ticks: name.ticks,
                    file_name,
                    name,
                    path,
                })
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.ticks.cmp(&b.ticks).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok(entries)
    }

    /// `.zip` files whose names do not parse as packet names.
    pub fn invalid_entries(&self) -> Result<Vec<PathBuf>, PsmError> {
        Ok(self
            .zip_files()?
            .into_iter()
            .filter(|(file_name, _)| PacketName::parse(file_name).is_err())
            .map(|(_, path)| path)
            .collect())
    }

    pub fn next_entry(&self) -> Result<Option<QueueEntry>, PsmError> {
        Ok(self.list()?.into_iter().next())
    }

    /// Remove a queued packet. Returns false when it was not queued.
    pub fn cancel_queued(&self, file_name: &str) -> Result<bool, PsmError> {
        if file_name.contains(['/', '\\']) {
            return Err(PsmError::Config(format!("not a packet name: {file_name:?}")));
        }
        match std::fs::remove_file(self.dir.join(file_name)) {
            Ok(()) => {
                tracing::info!(packet = %file_name, "queued packet cancelled");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn zip_files(&self) -> Result<Vec<(String, PathBuf)>, PsmError> {
        let suffix = format!(".{PACKET_EXT}");
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(&suffix) {
                out.push((file_name, entry.path()));
            }
        }
        Ok(out)
    }
}

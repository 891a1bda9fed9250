//! Durable records of acknowledged offsets
//!
//! The sync client reports every acknowledged offset to its stores before it
//! advances the cursor, so a restarted producer can resume (and prove full
//! replication to retention) from the last offset the service confirmed.

use crate::Result;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Receiver of acknowledged offsets
pub trait OffsetStore: Send + Sync {
    /// The service holds every byte of `topic` below `offset`
    fn store(&self, topic: &str, offset: u64) -> Result<()>;
}

impl<F> OffsetStore for F
where
    F: Fn(&str, u64) -> Result<()> + Send + Sync,
{
    fn store(&self, topic: &str, offset: u64) -> Result<()> {
        self(topic, offset)
    }
}

/// Stores each topic's offset in `<dir>/<topic>.offset`
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
    dir: PathBuf,
}

impl FileOffsetStore {
    /// Store files under `dir` (created on first store)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the offset files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{}.offset", topic))
    }

    /// Last stored offset of `topic`, if any
    pub fn load(&self, topic: &str) -> Result<Option<u64>> {
        let text = match fs::read_to_string(self.path(topic)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        text.trim().parse().map(Some).map_err(|e| {
            crate::Error::corruption(format!("{}: offset file holds {:?}: {}", topic, text, e))
        })
    }
}

impl OffsetStore for FileOffsetStore {
    fn store(&self, topic: &str, offset: u64) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(topic);
        let tmp = path.with_extension("offset.tmp");
        {
            let mut file = File::create(&tmp)?;
            write!(file, "{}", offset)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

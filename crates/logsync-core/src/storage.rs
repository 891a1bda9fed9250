//! Log segment store: maps topics to directories under one root

use crate::{Error, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Root directory holding one subdirectory per topic
#[derive(Debug, Clone)]
pub struct LogStorage {
    root: PathBuf,
}

impl LogStorage {
    /// Create a store rooted at `root` (not created until first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `topic`
    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    /// Check that `topic` names a single directory below the root
    pub fn validate_topic(topic: &str) -> Result<()> {
        let bad = topic.is_empty()
            || topic == "."
            || topic == ".."
            || topic.contains(['/', '\\', '\0']);
        if bad {
            return Err(Error::config(format!("invalid topic name {:?}", topic)));
        }
        Ok(())
    }

    /// Topics that currently have a directory; an absent root has none
    pub fn topic_ids(&self) -> Result<BTreeSet<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut topics = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    topics.insert(name.to_string());
                } else {
                    tracing::warn!(path = ?entry.path(), "skipping topic directory with non UTF-8 name");
                }
            }
        }
        Ok(topics)
    }
}

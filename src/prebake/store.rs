use crate::error::PrebakeError;
use crate::prebake::entry::ConversationEntry;
use crate::prebake::paths::PrebakePaths;
use crate::prebake::reader::{LogReader, ReadSummary, ReaderOptions};
use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const LOCK_FILE: &str = ".prebake.lock";

/// Directory of session artifacts, one `<session-id>.jsonl` per artifact.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactInfo {
    pub session_id: String,
    pub path: PathBuf,
    pub entries: usize,
    pub sha256: String,
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_paths(paths: &PrebakePaths) -> Self {
        Self::new(paths.sessions_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.artifact_path(session_id).is_file()
    }

    /// Starts a new artifact under a fresh session id.
    pub fn writer(&self) -> Result<ArtifactWriter> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let session_id = new_session_id();
        let temp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to create temp artifact in {}", self.dir.display()))?;
        Ok(ArtifactWriter {
            target: self.artifact_path(&session_id),
            session_id,
            out: BufWriter::new(temp),
            hasher: Sha256::new(),
            entries: 0,
        })
    }

    pub fn open_reader(&self, session_id: &str, options: ReaderOptions) -> Result<LogReader> {
        let path = self.artifact_path(session_id);
        if !path.is_file() {
            return Err(PrebakeError::ArtifactNotFound(session_id.to_string()).into());
        }
        LogReader::open(&path, options)
    }

    /// Loads a whole artifact. Only used where a stage needs random access.
    pub fn read_all(&self, session_id: &str) -> Result<(Vec<ConversationEntry>, ReadSummary)> {
        let mut reader = self.open_reader(session_id, ReaderOptions::artifact())?;
        let entries: Vec<ConversationEntry> = reader.by_ref().collect();
        let summary = reader.summary().clone();
        if let Some(err) = &summary.io_error {
            return Err(anyhow!("failed reading session {session_id}: {err}"));
        }
        Ok((entries, summary))
    }

    pub fn digest(&self, session_id: &str) -> Result<String> {
        file_sha256(&self.artifact_path(session_id))
    }

    /// Deletes an artifact nobody will hand on. Missing files are fine.
    pub fn discard(&self, session_id: &str) -> Result<()> {
        let path = self.artifact_path(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// Takes the store-wide run lock; released when the guard drops.
    pub fn lock(&self) -> Result<StoreLock> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            return Err(PrebakeError::PipelineBusy(path.display().to_string()).into());
        }
        Ok(StoreLock { file, path })
    }
}

pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), "store unlock failed: {err}");
        }
    }
}

/// Streams entries into a temp file and publishes it atomically on commit.
/// Dropping an uncommitted writer discards the temp file.
pub struct ArtifactWriter {
    session_id: String,
    target: PathBuf,
    out: BufWriter<NamedTempFile>,
    hasher: Sha256,
    entries: usize,
}

impl ArtifactWriter {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Appends an entry, re-stamped with this artifact's session id.
    pub fn push(&mut self, mut entry: ConversationEntry) -> Result<()> {
        entry.session_id = self.session_id.clone();
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.out
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write {}", self.target.display()))?;
        self.hasher.update(line.as_bytes());
        self.entries += 1;
        Ok(())
    }

    pub fn commit(self) -> Result<ArtifactInfo> {
        let temp = self
            .out
            .into_inner()
            .map_err(|err| anyhow!("failed to flush artifact: {}", err.error()))?;
        temp.persist(&self.target)
            .with_context(|| format!("failed to publish {}", self.target.display()))?;
        debug!(session = %self.session_id, entries = self.entries, "artifact committed");
        Ok(ArtifactInfo {
            session_id: self.session_id,
            path: self.target,
            entries: self.entries,
            sha256: format!("{:x}", self.hasher.finalize()),
        })
    }
}

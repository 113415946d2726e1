use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// One recording artifact (raw log, ttyrec log, or request log) in its two
/// possible states, modeled as a sum type in place of a nullable file handle
/// plus buffer pair.
pub enum Artifact {
    /// Accumulating in memory because `sync_to_file` hasn't run yet.
    Pending(Vec<u8>),
    /// Writing straight through to the open file descriptor.
    Live(File),
}

impl Artifact {
    pub fn pending() -> Self {
        Artifact::Pending(Vec::new())
    }

    /// Appends `data`, buffering it or writing it straight to disk depending
    /// on the current state.
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Artifact::Pending(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Artifact::Live(file) => file.write_all(data).await,
        }
    }

    /// Opens the backing file and flushes any buffered bytes into it,
    /// transitioning `Pending -> Live`. A no-op if already `Live`.
    ///
    /// Deliberately does not truncate: opens the file write-only,
    /// create-if-absent (`O_CREAT|O_WRONLY` without `O_TRUNC`), so an
    /// existing file at this path is overwritten from offset 0 onward rather
    /// than replaced outright. See DESIGN.md for why this was kept over
    /// adding `O_TRUNC`.
    pub async fn sync_to_file(&mut self, path: &Path) -> std::io::Result<()> {
        if matches!(self, Artifact::Live(_)) {
            return Ok(());
        }

        let mut file = OpenOptions::new().create(true).write(true).open(path).await?;

        if let Artifact::Pending(buf) = self {
            file.write_all(buf).await?;
        }

        *self = Artifact::Live(file);
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        if let Artifact::Live(file) = self {
            file.flush().await?;
        }
        Ok(())
    }
}

//! `backup_content.control`: one JSON object per line (§4.1, §6), written
//! through a bounded buffer and flushed in chunks, with the same
//! crash-safe tmp+rename discipline as the control file.

use std::io::{BufWriter, Write};

use camino::Utf8Path;

use crate::error::{EngineError, Result};
use crate::model::FileEntry;

/// Flush threshold mentioned in §4.1 ("≈ 500 pages"): writer calls
/// `flush()` after this many buffered entries, not every line, to amortize
/// syscall cost on a large file list.
const FLUSH_EVERY: usize = 500;

pub struct FileListWriter {
    buf: BufWriter<std::fs::File>,
    tmp_path: camino::Utf8PathBuf,
    final_path: camino::Utf8PathBuf,
    pending: usize,
}

impl FileListWriter {
    pub fn create(path: &Utf8Path) -> Result<Self> {
        let tmp_path = backup_utils::crashsafe::tmp_path_for(path);
        let file = std::fs::File::create(&tmp_path).map_err(|e| EngineError::io(&tmp_path, e))?;
        Ok(FileListWriter {
            buf: BufWriter::new(file),
            tmp_path,
            final_path: path.to_path_buf(),
            pending: 0,
        })
    }

    pub fn write_entry(&mut self, entry: &FileEntry) -> Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| EngineError::Catalog(format!("encoding file entry: {e}")))?;
        self.buf
            .write_all(line.as_bytes())
            .and_then(|_| self.buf.write_all(b"\n"))
            .map_err(|e| EngineError::io(&self.tmp_path, e))?;
        self.pending += 1;
        if self.pending >= FLUSH_EVERY {
            self.buf
                .flush()
                .map_err(|e| EngineError::io(&self.tmp_path, e))?;
            self.pending = 0;
        }
        Ok(())
    }

    /// Flush remaining buffered lines, fsync, and atomically publish the
    /// file at its final path.
    pub fn finish(mut self) -> Result<()> {
        self.buf
            .flush()
            .map_err(|e| EngineError::io(&self.tmp_path, e))?;
        self.buf
            .get_ref()
            .sync_all()
            .map_err(|e| EngineError::io(&self.tmp_path, e))?;
        std::fs::rename(&self.tmp_path, &self.final_path)
            .map_err(|e| EngineError::io(&self.final_path, e))?;
        Ok(())
    }
}

impl Drop for FileListWriter {
    fn drop(&mut self) {
        // If `finish` was never called (error path, panic-unwind), don't
        // leave a half-written tmp file behind.
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

/// Write a complete file list in one shot (used for the periodic
/// checkpoints the lead worker performs every 10 s, and for the final
/// write at FINALIZED).
pub fn write_all(path: &Utf8Path, entries: &[FileEntry]) -> Result<()> {
    let mut writer = FileListWriter::create(path)?;
    for entry in entries {
        writer.write_entry(entry)?;
    }
    writer.finish()
}

pub fn read_all(path: &Utf8Path) -> Result<Vec<FileEntry>> {
    let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| EngineError::Catalog(format!("decoding file entry: {e}")))
        })
        .collect()
}

//! Incremental reading of an instance's live console output.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

use crate::error::Result;

/// Position in a console output file plus any unterminated tail already read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputCursor {
    offset: u64,
    partial: Vec<u8>,
}

impl OutputCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.partial.clear();
    }

    /// Return the complete lines appended to `path` since the last call.
    /// A file shorter than what was already consumed starts the cursor over.
    /// A missing file yields nothing and keeps the position, so the rest of
    /// an archived run can still be read from its archive.
    pub async fn read_new_lines(&mut self, path: &Path) -> Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            log::debug!("Output file {:?} shrank, rereading from start", path);
            self.reset();
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut appended = Vec::new();
        file.read_to_end(&mut appended).await?;
        self.offset += appended.len() as u64;
        self.partial.extend_from_slice(&appended);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let mut raw = &raw[..pos];
            if let Some(stripped) = raw.strip_suffix(b"\r") {
                raw = stripped;
            }
            lines.push(String::from_utf8_lossy(raw).into_owned());
        }
        Ok(lines)
    }
}

/// Newest `<output>.<timestamp>.log` archive next to `output_file`. The
/// timestamp format sorts by name.
pub fn latest_archive(output_file: &Path) -> Option<PathBuf> {
    let dir = output_file.parent()?;
    let prefix = format!("{}.", output_file.file_name()?.to_str()?);
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".log"))
        })
        .max_by(|a, b| a.file_name().cmp(b.file_name()))
        .map(|entry| entry.into_path())
}

/// Parse a menu prompt line of the form `<index>\t<text>`.
pub fn parse_menu_option(line: &str) -> Option<(u32, String)> {
    let (index, text) = line.trim_start().split_once('\t')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let index = index.parse().ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some((index, text.to_string()))
}

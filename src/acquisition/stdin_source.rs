//! JSON-lines fix source
//!
//! One `FixReading` JSON object per line, e.g.
//! `{"latitude":51.5,"longitude":-0.12,"speed_mps":8.3,"bearing":90}`.
//! Used to replay recorded tracks: `cat track.jsonl | vehicle-uplink run --vehicle 7`

use super::{FixEvent, FixSource};
use crate::uplink::FixReading;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};

/// Reads fixes from any buffered async reader, skipping malformed lines
pub struct LineFixSource<R> {
    reader: R,
    name: String,
    line_buffer: String,
    skipped: u64,
}

/// Fix source over the process's stdin
pub type StdinFixSource = LineFixSource<BufReader<Stdin>>;

impl<R: AsyncBufRead + Unpin + Send + 'static> LineFixSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
            line_buffer: String::with_capacity(512),
            skipped: 0,
        }
    }

    /// Number of lines that could not be parsed so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl StdinFixSource {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl LineFixSource<BufReader<tokio::fs::File>> {
    /// Replay a recorded JSON-lines track file.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open fix file {}", path.display()))?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send + 'static> FixSource for LineFixSource<R> {
    async fn next_fix(&mut self) -> Result<FixEvent> {
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(FixEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<FixReading>(line) {
                Ok(fix) => return Ok(FixEvent::Fix(fix)),
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(source = %self.name, error = %e, "Skipping malformed fix line");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(input: &'static str) -> LineFixSource<BufReader<&'static [u8]>> {
        LineFixSource::new(BufReader::new(input.as_bytes()), "test")
    }

    #[tokio::test]
    async fn test_reads_fixes_until_eof() {
        let mut src = source(
            "{\"latitude\":1.0,\"longitude\":2.0,\"speed_mps\":5.0}\n\n{\"latitude\":1.1,\"longitude\":2.1}\n",
        );

        match src.next_fix().await.unwrap() {
            FixEvent::Fix(fix) => {
                assert_eq!(fix.latitude, 1.0);
                assert_eq!(fix.speed_mps, 5.0);
            }
            FixEvent::Eof => panic!("expected a fix"),
        }
        assert!(matches!(src.next_fix().await.unwrap(), FixEvent::Fix(_)));
        assert_eq!(src.next_fix().await.unwrap(), FixEvent::Eof);
    }

    #[tokio::test]
    async fn test_skips_malformed_lines() {
        let mut src = source("not json\n{\"latitude\":3.0,\"longitude\":4.0}\n");
        match src.next_fix().await.unwrap() {
            FixEvent::Fix(fix) => assert_eq!(fix.longitude, 4.0),
            FixEvent::Eof => panic!("expected a fix"),
        }
        assert_eq!(src.skipped(), 1);
        assert_eq!(src.source_name(), "test");
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(LineFixSource::open(&tmp.path().join("missing.jsonl")).await.is_err());
    }
}

//! Append-only metadata log
//!
//! One JSON record per line, optionally gzip-compressed, closed by a
//! `{"__complete__": true}` marker once the crawl has been exhausted.
//!
//! Compressed logs are written as one gzip member per append so that every
//! append is a self-contained write; readers detect gzip by its magic bytes
//! and decode the concatenated members transparently.
//!
//! A crash can tear the last append. Readers stop at a torn gzip member and
//! skip a torn plain line; the next writer drops the torn member or starts a
//! fresh line before appending.

use crate::error::Result;
use crate::record::Record;
use flate2::bufread::GzDecoder;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Serialize, Deserialize)]
struct CompletionMarker {
    #[serde(rename = "__complete__")]
    complete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LogEntry {
    Marker(CompletionMarker),
    Record(Record),
}

pub struct MetadataLog {
    path: PathBuf,
    compressed: bool,
    writer: Option<File>,
    complete: Arc<AtomicBool>,
}

impl MetadataLog {
    /// Open the log at `path`; compression is used for new appends when the
    /// file name ends in `.gz`
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let compressed = path.extension().is_some_and(|ext| ext == "gz");
        Self {
            path,
            compressed,
            writer: None,
            complete: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a completion marker has been seen or written through this handle
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Open the log for appending now, cutting off whatever a crash left
    /// half-written
    ///
    /// Call before reading a log that may be resumed, so a torn gzip member
    /// is neither read nor left behind.
    pub fn repair_tail(&mut self) -> Result<()> {
        self.writer().map(|_| ())
    }

    /// Append one record and flush it to the file
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.write_line(&line)
    }

    /// Close the log; safe to call more than once
    pub fn mark_complete(&mut self) -> Result<()> {
        let mut line = serde_json::to_vec(&CompletionMarker { complete: true })?;
        line.push(b'\n');
        self.write_line(&line)?;
        self.complete.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "Metadata log marked complete");
        Ok(())
    }

    /// Stream every record in log order
    ///
    /// Blank lines are skipped, undecodable lines are logged and skipped, and
    /// completion markers are never yielded. Records without an id are
    /// yielded; callers decide what to do with them.
    pub fn stream(&self) -> Result<LogStream> {
        let (reader, compressed) = match File::open(&self.path) {
            Ok(file) => {
                let (reader, compressed) = open_reader(file)?;
                (Some(reader), compressed)
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, false),
            Err(e) => return Err(e.into()),
        };

        Ok(LogStream {
            reader,
            compressed,
            buf: Vec::new(),
            complete: Arc::clone(&self.complete),
            line_no: 0,
            path: self.path.clone(),
        })
    }

    /// Ids of every logged record, read without holding the log in memory
    pub fn all_known_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for record in self.stream()? {
            let record = record?;
            if record.has_id() {
                ids.insert(record.id);
            }
        }
        Ok(ids)
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let compressed = self.compressed;
        let file = self.writer()?;

        if compressed {
            let mut encoder = GzEncoder::new(&mut *file, Compression::default());
            encoder.write_all(line)?;
            encoder.finish()?;
        } else {
            file.write_all(line)?;
        }
        file.flush()?;
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut File> {
        let file = match self.writer.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(&self.path)?;
                if self.compressed {
                    drop_torn_member(&file)?;
                } else {
                    terminate_partial_line(&mut file)?;
                }
                file
            },
        };
        Ok(self.writer.insert(file))
    }
}

/// A crash mid-append can leave the last line without its newline; start
/// the next record on a fresh line so it is not glued onto the fragment
fn terminate_partial_line(file: &mut File) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!("Metadata log ends mid-line, terminating the partial record");
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Truncate a compressed log to the end of its last complete gzip member
///
/// Appending after a torn member would leave it in the middle of the file,
/// where the decoder rejects it along with every member that follows.
fn drop_torn_member(file: &File) -> Result<()> {
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    if len == 0 || !reader.fill_buf()?.starts_with(&GZIP_MAGIC) {
        return Ok(());
    }

    let mut intact = 0u64;
    while intact < len {
        let decoded = std::io::copy(&mut GzDecoder::new(&mut reader), &mut std::io::sink());
        let end = reader.stream_position()?;
        match decoded {
            Ok(_) if end > intact => intact = end,
            Ok(_) => break,
            Err(e) => {
                warn!(offset = intact, error = %e, "Metadata log ends in a torn gzip member");
                break;
            },
        }
    }
    drop(reader);

    if intact < len {
        warn!(kept = intact, dropped = len - intact, "Dropping torn tail of metadata log");
        file.set_len(intact)?;
    }
    Ok(())
}

fn open_reader(file: File) -> Result<(Box<dyn BufRead + Send>, bool)> {
    let mut reader = BufReader::new(file);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    if is_gzip {
        Ok((Box::new(BufReader::new(MultiGzDecoder::new(reader))), true))
    } else {
        Ok((Box::new(reader), false))
    }
}

/// Line-by-line reader over a metadata log
pub struct LogStream {
    reader: Option<Box<dyn BufRead + Send>>,
    compressed: bool,
    buf: Vec<u8>,
    complete: Arc<AtomicBool>,
    line_no: usize,
    path: PathBuf,
}

impl Iterator for LogStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.as_mut()?.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                },
                Ok(_) => {},
                // Any decode failure in a gzip log is a torn final member
                Err(e) if self.compressed || e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Metadata log has a truncated tail"
                    );
                    self.reader = None;
                    return None;
                },
                Err(e) => {
                    self.reader = None;
                    return Some(Err(e.into()));
                },
            }
            self.line_no += 1;

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<LogEntry>(&self.buf) {
                Ok(LogEntry::Marker(marker)) => {
                    if marker.complete {
                        self.complete.store(true, Ordering::Release);
                    }
                },
                Ok(LogEntry::Record(record)) => return Some(Ok(record)),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = self.line_no,
                        error = %e,
                        "Skipping undecodable metadata line"
                    );
                },
            }
        }
    }
}

//! File upload drain.
//!
//! After `/sendfile` the connection stops carrying frames and its raw bytes
//! are written to a file in the upload directory until the transfer ends:
//! - with a byte count, after exactly that many bytes
//! - without one, after the first read segment shorter than `UPLOAD_CHUNK`

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read size while draining an upload.
pub const UPLOAD_CHUNK: usize = 1024;

/// Largest single read for a sized upload.
const MAX_SIZED_READ: usize = 64 * 1024;

/// An upload in progress.
#[derive(Debug)]
pub struct Upload {
    file: File,
    path: PathBuf,
    remaining: Option<u64>,
    written: u64,
    done: bool,
}

impl Upload {
    /// Create `dir/filename`, creating `dir` if needed.
    ///
    /// `filename` must already be reduced to a bare file name.
    pub fn start(dir: &Path, filename: &str, size: Option<u64>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(filename);
        let file = File::create(&path)?;
        debug!(path = %path.display(), ?size, "Upload started");

        Ok(Self {
            file,
            path,
            remaining: size,
            written: 0,
            done: size == Some(0),
        })
    }

    /// Bytes to ask the socket for next.
    pub fn wanted(&self) -> usize {
        match self.remaining {
            Some(remaining) => remaining.min(MAX_SIZED_READ as u64) as usize,
            None => UPLOAD_CHUNK,
        }
    }

    /// Write one read segment; returns how many bytes belonged to the upload.
    ///
    /// A sized upload never consumes past its byte count, so anything left
    /// over is the start of the next frame.
    pub fn feed(&mut self, segment: &[u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }

        let consumed = match self.remaining {
            Some(remaining) => segment.len().min(remaining as usize),
            None => segment.len(),
        };
        self.file.write_all(&segment[..consumed])?;
        self.written += consumed as u64;

        match &mut self.remaining {
            Some(remaining) => {
                *remaining -= consumed as u64;
                self.done = *remaining == 0;
            }
            None => self.done = segment.len() < UPLOAD_CHUNK,
        }

        if self.done {
            self.file.flush()?;
            debug!(path = %self.path.display(), bytes = self.written, "Upload finished");
        }
        Ok(consumed)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sized_upload_stops_at_count() {
        let dir = TempDir::new().unwrap();
        let mut upload = Upload::start(dir.path(), "a.bin", Some(5)).unwrap();
        assert_eq!(upload.wanted(), 5);

        assert_eq!(upload.feed(b"abc").unwrap(), 3);
        assert!(!upload.is_done());
        assert_eq!(upload.wanted(), 2);
        // Bytes past the count are left for the frame decoder.
        assert_eq!(upload.feed(b"de00000").unwrap(), 2);
        assert!(upload.is_done());

        assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), b"abcde");
        assert_eq!(upload.written(), 5);
    }

    #[test]
    fn test_unsized_upload_ends_on_short_segment() {
        let dir = TempDir::new().unwrap();
        let mut upload = Upload::start(dir.path(), "b.bin", None).unwrap();

        let full = vec![7u8; UPLOAD_CHUNK];
        assert_eq!(upload.feed(&full).unwrap(), UPLOAD_CHUNK);
        assert!(!upload.is_done());
        assert_eq!(upload.feed(b"tail").unwrap(), 4);
        assert!(upload.is_done());

        let written = fs::read(upload.path()).unwrap();
        assert_eq!(written.len(), UPLOAD_CHUNK + 4);
    }

    #[test]
    fn test_zero_size_is_done_immediately() {
        let dir = TempDir::new().unwrap();
        let mut upload = Upload::start(dir.path(), "empty", Some(0)).unwrap();
        assert!(upload.is_done());
        assert_eq!(upload.feed(b"x").unwrap(), 0);
    }

    #[test]
    fn test_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("uploads").join("inner");
        let upload = Upload::start(&nested, "c.txt", Some(1)).unwrap();
        assert!(upload.path().starts_with(&nested));
        assert!(nested.is_dir());
    }
}

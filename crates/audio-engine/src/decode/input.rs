//! Byte sources that decoders read from.
//!
//! A decoder owns exactly one [`InputSource`]. Local files (plain paths or
//! `file://` URLs) and in-memory buffers are provided; other schemes are
//! rejected.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::DecoderError;

/// A readable, optionally seekable byte stream identified by a URL.
pub trait InputSource: Send {
    fn url(&self) -> &str;

    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    fn supports_seeking(&self) -> bool;

    /// Read up to `buf.len()` bytes; `Ok(0)` at end of input.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Move to an absolute byte offset.
    fn seek_to_offset(&mut self, offset: u64) -> io::Result<u64>;

    /// Current byte offset.
    fn offset(&self) -> u64;

    /// Total length in bytes, if known.
    fn length(&self) -> Option<u64>;

    /// Extension of the last URL path segment, without the dot.
    fn file_extension(&self) -> Option<&str> {
        file_extension(self.url())
    }
}

/// Extension of the last path segment of `url`, ignoring any query or fragment.
pub fn file_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext)
}

/// Build an unopened input source for `url`.
///
/// Accepts `file://` URLs and bare filesystem paths.
pub fn input_source_for_url(url: &str) -> Result<Box<dyn InputSource>, DecoderError> {
    if let Some(rest) = url.strip_prefix("file://") {
        let path = percent_decode(rest);
        return Ok(Box::new(FileInputSource::with_url(url.to_string(), path.into())));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        return Err(DecoderError::Open {
            url: url.to_string(),
            reason: format!("unsupported URL scheme '{scheme}'"),
        });
    }
    Ok(Box::new(FileInputSource::new(url)))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Local file input.
pub struct FileInputSource {
    url: String,
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    length: Option<u64>,
}

impl FileInputSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self::with_url(path.to_string_lossy().into_owned(), path)
    }

    fn with_url(url: String, path: PathBuf) -> Self {
        Self {
            url,
            path,
            file: None,
            offset: 0,
            length: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "input is not open"))
    }
}

impl InputSource for FileInputSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn open(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        self.length = file.metadata().ok().map(|m| m.len());
        self.file = Some(file);
        self.offset = 0;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        self.offset = 0;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file()?.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn seek_to_offset(&mut self, offset: u64) -> io::Result<u64> {
        let pos = self.file()?.seek(SeekFrom::Start(offset))?;
        self.offset = pos;
        Ok(pos)
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn length(&self) -> Option<u64> {
        self.length
    }
}

/// Input backed by bytes already in memory.
pub struct MemoryInputSource {
    url: String,
    data: Arc<[u8]>,
    pos: usize,
    open: bool,
    seekable: bool,
}

impl MemoryInputSource {
    pub fn new(url: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            url: url.into(),
            data: data.into(),
            pos: 0,
            open: false,
            seekable: true,
        }
    }

    /// Present the bytes as a forward-only stream.
    pub fn non_seekable(mut self) -> Self {
        self.seekable = false;
        self
    }
}

impl InputSource for MemoryInputSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn open(&mut self) -> io::Result<()> {
        if !self.open {
            self.open = true;
            self.pos = 0;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.open = false;
        self.pos = 0;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "input is not open"));
        }
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn seek_to_offset(&mut self, offset: u64) -> io::Result<u64> {
        if !self.seekable {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "input is not seekable"));
        }
        if offset > self.data.len() as u64 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek past end of input"));
        }
        self.pos = offset as usize;
        Ok(offset)
    }

    fn offset(&self) -> u64 {
        self.pos as u64
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

//! Resynchronizing reader for framed telemetry records.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! 0x1E | path_len: u16 | data_len: u32 | timestamp_ms: u64 | path | data
//! ```
//!
//! The stream may contain garbage between frames; the reader scans
//! byte-by-byte for the separator and validates the header before
//! committing to a frame. `data` is raw JSON, or gzip-compressed JSON
//! when it starts with the gzip magic.

use std::io::{Read, Seek, SeekFrom};

use flate2::{Decompress, FlushDecompress, Status};
use serde_json::Value;

use crate::metrics::ReaderMetrics;

/// Frame delimiter scanned for during resynchronization.
pub const RECORD_SEPARATOR: u8 = 0x1e;
/// Field delimiter inside serialized output records.
pub const UNIT_SEPARATOR: u8 = 0x1f;

/// Upper bound on the routing path carried by a frame.
pub const MAX_PATH_LENGTH: usize = 10 * 1024;
/// Upper bound on a frame's (compressed) payload.
pub const MAX_DATA_LENGTH: usize = 200 * 1024;

/// Hard ceiling for the inflate buffer; anything larger is treated as an
/// inflate failure rather than growing without bound.
const MAX_INFLATE_SIZE: usize = 64 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One parsed record.
#[derive(Debug)]
pub struct Record {
    /// Routing path; begins with a UUID-like token terminated by `/`.
    pub path: String,
    pub timestamp: u64,
    pub doc: Value,
}

struct FrameHeader {
    path_len: usize,
    data_len: usize,
    timestamp: u64,
}

enum HeaderResult {
    Valid(FrameHeader),
    Invalid,
    Truncated,
}

/// Framed record reader. The payload and inflate buffers are owned by
/// the reader and reused across calls and across input files.
pub struct RecordReader {
    data: Vec<u8>,
    inflate: Vec<u8>,
    pub metrics: ReaderMetrics,
}

impl RecordReader {
    pub fn new() -> Self {
        RecordReader {
            data: Vec::with_capacity(MAX_DATA_LENGTH),
            inflate: vec![0u8; MAX_DATA_LENGTH],
            metrics: ReaderMetrics::default(),
        }
    }

    /// Read until one valid record is parsed or the stream is exhausted.
    ///
    /// `Ok(None)` is end of stream; `Err` is a fatal I/O error. Benign
    /// per-record failures (bad header, inflate failure, JSON parse
    /// failure) are counted and skipped.
    pub fn read<R: Read + Seek>(&mut self, input: &mut R) -> std::io::Result<Option<Record>> {
        loop {
            let header = match self.find_frame(input)? {
                Some(h) => h,
                None => return Ok(None),
            };

            let mut path_buf = vec![0u8; header.path_len];
            if !read_exact_or_eof(input, &mut path_buf)? {
                return Ok(None);
            }

            self.data.resize(header.data_len, 0);
            if !read_exact_or_eof(input, &mut self.data)? {
                return Ok(None);
            }

            if let Some(doc) = self.process_payload() {
                let path = String::from_utf8_lossy(&path_buf).into_owned();
                return Ok(Some(Record {
                    path,
                    timestamp: header.timestamp,
                    doc,
                }));
            }
            // payload discarded; resume scanning
        }
    }

    /// Scan for the next separator with a valid header behind it.
    fn find_frame<R: Read + Seek>(
        &mut self,
        input: &mut R,
    ) -> std::io::Result<Option<FrameHeader>> {
        let mut byte = [0u8; 1];
        loop {
            if input.read(&mut byte)? == 0 {
                return Ok(None);
            }
            if byte[0] != RECORD_SEPARATOR {
                self.metrics.corrupt_data += 1;
                continue;
            }

            let after_separator = input.stream_position()?;
            match self.read_header(input)? {
                HeaderResult::Valid(h) => return Ok(Some(h)),
                HeaderResult::Truncated => return Ok(None),
                HeaderResult::Invalid => {
                    // rescan from the byte after the tentative separator
                    input.seek(SeekFrom::Start(after_separator))?;
                }
            }
        }
    }

    fn read_header<R: Read + Seek>(&mut self, input: &mut R) -> std::io::Result<HeaderResult> {
        let mut buf2 = [0u8; 2];
        if !read_exact_or_eof(input, &mut buf2)? {
            return Ok(HeaderResult::Truncated);
        }
        let path_len = u16::from_le_bytes(buf2) as usize;
        if path_len > MAX_PATH_LENGTH {
            self.metrics.invalid_path_length += 1;
            return Ok(HeaderResult::Invalid);
        }

        let mut buf4 = [0u8; 4];
        if !read_exact_or_eof(input, &mut buf4)? {
            return Ok(HeaderResult::Truncated);
        }
        let data_len = u32::from_le_bytes(buf4) as usize;
        if data_len > MAX_DATA_LENGTH {
            self.metrics.invalid_data_length += 1;
            return Ok(HeaderResult::Invalid);
        }

        let mut buf8 = [0u8; 8];
        if !read_exact_or_eof(input, &mut buf8)? {
            return Ok(HeaderResult::Truncated);
        }
        let timestamp = u64::from_le_bytes(buf8);

        Ok(HeaderResult::Valid(FrameHeader {
            path_len,
            data_len,
            timestamp,
        }))
    }

    /// Inflate if gzip, then parse JSON. `None` means the record was
    /// counted and discarded.
    fn process_payload(&mut self) -> Option<Value> {
        let json_bytes: &[u8] = if self.data.len() > 2 && self.data[..2] == GZIP_MAGIC {
            match inflate_gzip(&self.data, &mut self.inflate) {
                Some(len) => &self.inflate[..len],
                None => {
                    self.metrics.inflate_failures += 1;
                    return None;
                }
            }
        } else {
            &self.data
        };

        match serde_json::from_slice(json_bytes) {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::debug!(error = %e, "record JSON parse failed");
                self.metrics.parse_failures += 1;
                None
            }
        }
    }
}

impl Default for RecordReader {
    fn default() -> Self {
        Self::new()
    }
}

/// `read_exact` that reports a clean EOF as `Ok(false)`.
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Inflate a gzip payload into `out`, doubling the buffer while the
/// decoder reports it is out of output space. Returns the inflated
/// length, or `None` on any terminal decoder error.
fn inflate_gzip(input: &[u8], out: &mut Vec<u8>) -> Option<usize> {
    let mut decoder = Decompress::new_gzip(15);
    if out.is_empty() {
        out.resize(MAX_DATA_LENGTH, 0);
    }

    loop {
        let consumed = decoder.total_in() as usize;
        let produced = decoder.total_out() as usize;
        let status = decoder
            .decompress(
                &input[consumed..],
                &mut out[produced..],
                FlushDecompress::Finish,
            )
            .ok()?;
        let produced = decoder.total_out() as usize;

        match status {
            Status::StreamEnd => return Some(produced),
            Status::BufError => {
                if !grow(out) {
                    return None;
                }
            }
            Status::Ok => {
                if produced == out.len() {
                    if !grow(out) {
                        return None;
                    }
                } else {
                    // no more output pending and no stream end: truncated
                    return None;
                }
            }
        }
    }
}

fn grow(out: &mut Vec<u8>) -> bool {
    let next = out.len().saturating_mul(2);
    if next > MAX_INFLATE_SIZE {
        return false;
    }
    out.resize(next, 0);
    true
}

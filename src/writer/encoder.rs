//! Streaming XZ encoder over an owned output file.
//!
//! Thin wrapper around liblzma's easy encoder (LZMA2, CRC64 integrity
//! check). Output is produced through a fixed 8 KiB buffer and written
//! to the file as the encoder fills it; `finalize` drains the encoder's
//! internal state and closes the stream.

use std::fs::File;
use std::io::Write;

use xz2::stream::{Action, Check, Status, Stream};

const BUF_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("lzma error: {0}")]
    Lzma(#[from] xz2::stream::Error),
    #[error("compressed file write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected end of lzma stream")]
    UnexpectedStreamEnd,
}

pub struct CompressedFileWriter {
    stream: Stream,
    file: File,
    buf: Vec<u8>,
}

impl CompressedFileWriter {
    /// Initialize an encoder writing to `file`. `preset` is the LZMA
    /// preset level (0..=9).
    pub fn new(file: File, preset: u32) -> Result<Self, EncoderError> {
        let stream = Stream::new_easy_encoder(preset, Check::Crc64)?;
        Ok(CompressedFileWriter {
            stream,
            file,
            buf: vec![0u8; BUF_SIZE],
        })
    }

    /// Encode `data`, flushing encoder output to the file as it is
    /// produced.
    pub fn write(&mut self, mut data: &[u8]) -> Result<(), EncoderError> {
        while !data.is_empty() {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status = self.stream.process(data, &mut self.buf, Action::Run)?;
            if matches!(status, Status::StreamEnd) {
                return Err(EncoderError::UnexpectedStreamEnd);
            }

            let consumed = (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;
            if produced > 0 {
                self.file.write_all(&self.buf[..produced])?;
            }
            data = &data[consumed..];
        }
        Ok(())
    }

    /// Drain all deferred encoder output and terminate the XZ stream.
    pub fn finalize(mut self) -> Result<(), EncoderError> {
        loop {
            let before_out = self.stream.total_out();
            let status = self.stream.process(&[], &mut self.buf, Action::Finish)?;
            let produced = (self.stream.total_out() - before_out) as usize;
            if produced > 0 {
                self.file.write_all(&self.buf[..produced])?;
            }
            if matches!(status, Status::StreamEnd) {
                break;
            }
        }
        self.file.flush()?;
        Ok(())
    }
}

// Line framing for streamed response bodies.
// Empty lines are heartbeats; payload bytes are never interpreted here.
// Blocking only happens inside the underlying reader.
use crate::core::error::{Error, ErrorKind};
use std::io::{BufRead, BufReader, Read};

pub const DEFAULT_CHUNK_SIZE: usize = 512;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Unit {
    Heartbeat,
    Payload(Vec<u8>),
}

pub struct LineDecoder {
    reader: BufReader<Box<dyn Read + Send>>,
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new(body: Box<dyn Read + Send>) -> Self {
        Self::with_chunk_size(body, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(body: Box<dyn Read + Send>, chunk_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(chunk_size.max(1), body),
            buf: Vec::new(),
        }
    }

    /// Next unit in server order, or `None` once the body is exhausted.
    pub fn next_unit(&mut self) -> Result<Option<Unit>, Error> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(read_error)?;
        if read == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        if self.buf.is_empty() {
            return Ok(Some(Unit::Heartbeat));
        }
        Ok(Some(Unit::Payload(std::mem::take(&mut self.buf))))
    }
}

impl Iterator for LineDecoder {
    type Item = Result<Unit, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_unit().transpose()
    }
}

fn read_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            Error::new(ErrorKind::Timeout)
                .with_message("timed out reading response stream")
                .with_source(err)
        }
        _ => Error::new(ErrorKind::Transport)
            .with_message("failed to read response stream")
            .with_source(err),
    }
}

//! Newline-delimited UTF-8 text lines.

use bytes::{Bytes, BytesMut};

use crate::core::KernelError;
use crate::infra::protocol::{chunk, CommunicationProtocol, ProtocolDecoder};

/// Longest line accepted before the connection is rejected.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// One request per `\n`-terminated line; a trailing `\r` is stripped.
#[derive(Debug, Clone)]
pub struct LineProtocol {
    max_line: usize,
}

impl Default for LineProtocol {
    fn default() -> Self {
        Self {
            max_line: DEFAULT_MAX_LINE,
        }
    }
}

impl LineProtocol {
    /// Protocol rejecting lines longer than `max_line` bytes.
    #[must_use]
    pub const fn with_max_line(max_line: usize) -> Self {
        Self { max_line }
    }
}

/// Line decoder; remembers how far it has already scanned.
#[derive(Debug)]
pub struct LineDecoder {
    max_line: usize,
    scanned: usize,
}

impl ProtocolDecoder for LineDecoder {
    type Request = String;

    fn decode(&mut self, input: &mut BytesMut) -> Result<Option<String>, KernelError> {
        let start = self.scanned.min(input.len());
        let Some(offset) = input[start..].iter().position(|b| *b == b'\n') else {
            self.scanned = input.len();
            if input.len() > self.max_line {
                return Err(KernelError::Protocol("line too long".into()));
            }
            return Ok(None);
        };
        self.scanned = 0;
        if start + offset > self.max_line {
            return Err(KernelError::Protocol("line too long".into()));
        }
        let mut line = input.split_to(start + offset + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| KernelError::Protocol("line is not UTF-8".into()))
    }
}

impl CommunicationProtocol for LineProtocol {
    type Request = String;
    type Response = String;
    type Decoder = LineDecoder;

    fn new_decoder(&self) -> LineDecoder {
        LineDecoder {
            max_line: self.max_line,
            scanned: 0,
        }
    }

    fn encode(&self, response: &String, write_buffer_size: usize) -> Vec<Bytes> {
        let mut out = String::with_capacity(response.len() + 1);
        out.push_str(response);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        chunk(Bytes::from(out), write_buffer_size)
    }

    fn failure_response(&self, failure: Option<&anyhow::Error>) -> String {
        match failure {
            Some(failure) => format!("ERR {failure}"),
            None => "ERR no response".into(),
        }
    }
}

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::CodecError;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A byte stream with a pull-ahead buffer. Bytes read past a message
/// boundary stay buffered for the next decode on the same connection, which
/// is what keeps pipelined requests strictly serial instead of lost.
pub struct WireReader<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S> WireReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncRead + Unpin> WireReader<S> {
    /// Read until `pattern` is buffered and consume through it. Returns
    /// `None` on a clean EOF with nothing buffered.
    pub async fn read_until(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        loop {
            if let Some(start) = find_subsequence(&self.buffer, pattern) {
                let end = start + pattern.len();
                return Ok(Some(self.buffer.drain(..end).collect()));
            }

            if self.buffer.len() > max_bytes {
                return Err(CodecError::MalformedHeader(format!(
                    "message head exceeded {max_bytes} bytes"
                )));
            }

            let mut chunk = [0_u8; READ_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof(
                    "stream closed before message boundary".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Consume exactly `len` bytes.
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        while self.buffer.len() < len {
            let mut chunk = [0_u8; READ_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(CodecError::UnexpectedEof(
                    "stream closed mid-body".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(self.buffer.drain(..len).collect())
    }

    /// Fill the buffer until the first CRLF is visible without consuming
    /// anything. Returns the line (CRLF excluded); `None` on clean EOF.
    pub async fn peek_line(&mut self, max_bytes: usize) -> Result<Option<&[u8]>, CodecError> {
        loop {
            if let Some(end) = find_subsequence(&self.buffer, b"\r\n") {
                return Ok(Some(&self.buffer[..end]));
            }

            if self.buffer.len() > max_bytes {
                return Err(CodecError::MalformedHeader(format!(
                    "start line exceeded {max_bytes} bytes"
                )));
            }

            let mut chunk = [0_u8; READ_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof(
                    "stream closed before start line completed".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// One read into the buffer; 0 means the peer closed. Used by the review
    /// rendezvous to watch for a client hangup without consuming pipelined
    /// bytes.
    pub async fn read_some(&mut self) -> Result<usize, CodecError> {
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        let read = self.stream.read(&mut chunk).await?;
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Drain whatever is buffered, for handing off to a raw relay.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Drain up to `len` buffered bytes.
    pub fn split_buffered(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.buffer.len());
        self.buffer.drain(..len).collect()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

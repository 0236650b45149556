//! Incremental HTTP/1.1 response parsing.
//!
//! Pipelined batches mean a single socket read can carry several complete
//! responses, a fraction of one, or anything in between. The reader keeps
//! a growable buffer: parse what is there, pull more bytes when the parse
//! comes up short, and leave trailing bytes in place for the next
//! response.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Error;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

/// A parsed response before it is paired with its originating request.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status_line: String,
    pub status_code: u16,
    pub body: Vec<u8>,
}

/// Head fields the framing logic cares about.
struct Head {
    status_line: String,
    status_code: u16,
    content_length: Option<usize>,
    chunked: bool,
    keep_alive: bool,
    len: usize,
}

/// Buffered reader yielding one pipelined response at a time.
pub(crate) struct ResponseReader<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + Unpin> ResponseReader<S> {
    pub(crate) fn new(stream: S) -> Self {
        ResponseReader {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next response off the stream.
    ///
    /// Returns `Ok(None)` on a clean close, meaning the peer shut the
    /// stream down at a response boundary. The boolean in the pair is
    /// false once this stream can serve no further reads, either because
    /// the body ran to end-of-stream or because the peer did not commit
    /// to keep-alive.
    pub(crate) async fn read_response(&mut self) -> Result<Option<(RawResponse, bool)>, Error> {
        let head = loop {
            if !self.buf.is_empty() {
                if let Some(head) = parse_head(&self.buf)? {
                    break head;
                }
            }
            let n = self.fill().await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "connection closed inside a response head".into(),
                ));
            }
        };
        self.buf.advance(head.len);

        // Framing precedence: chunked, then content-length, then read
        // until the peer closes the stream.
        let (body, readable) = if head.chunked {
            (self.read_chunked_body().await?, true)
        } else if let Some(length) = head.content_length {
            self.read_sized_body(length).await?
        } else {
            (self.read_body_to_end().await?, false)
        };

        let more = readable && head.keep_alive;
        let response = RawResponse {
            status_line: head.status_line,
            status_code: head.status_code,
            body,
        };
        Ok(Some((response, more)))
    }

    async fn fill(&mut self) -> Result<usize, Error> {
        self.buf.reserve(READ_CHUNK);
        self.stream
            .read_buf(&mut self.buf)
            .await
            .map_err(|e| Error::transport("reading response bytes", e))
    }

    /// Read exactly `length` body bytes. A clean close short of the
    /// length keeps whatever arrived and marks the stream unreadable.
    async fn read_sized_body(&mut self, length: usize) -> Result<(Vec<u8>, bool), Error> {
        while self.buf.len() < length {
            if self.fill().await? == 0 {
                let body = self.buf.split().to_vec();
                return Ok((body, false));
            }
        }
        let body = self.buf.split_to(length).to_vec();
        Ok((body, true))
    }

    async fn read_body_to_end(&mut self) -> Result<Vec<u8>, Error> {
        while self.fill().await? > 0 {}
        Ok(self.buf.split().to_vec())
    }

    /// Decode a chunked body through the terminal zero-size chunk,
    /// skipping any trailers up to the closing blank line.
    async fn read_chunked_body(&mut self) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                loop {
                    let trailer = self.read_line().await?;
                    if trailer.is_empty() {
                        return Ok(body);
                    }
                }
            }
            self.ensure(size + 2).await?;
            body.extend_from_slice(&self.buf[..size]);
            if self.buf[size..size + 2] != *b"\r\n" {
                return Err(Error::Protocol("chunk data not CRLF terminated".into()));
            }
            self.buf.advance(size + 2);
        }
    }

    /// Consume one CRLF-terminated line, returning it without the CRLF.
    async fn read_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.fill().await? == 0 {
                return Err(Error::Protocol(
                    "connection closed inside a chunked body".into(),
                ));
            }
        }
    }

    /// Grow the buffer until at least `needed` bytes are available.
    async fn ensure(&mut self, needed: usize) -> Result<(), Error> {
        while self.buf.len() < needed {
            if self.fill().await? == 0 {
                return Err(Error::Protocol(
                    "connection closed inside a chunked body".into(),
                ));
            }
        }
        Ok(())
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::Protocol(format!("invalid response head: {e}"))),
    };

    let status_code = response
        .code
        .ok_or_else(|| Error::Protocol("response head missing status code".into()))?;

    let mut content_length = None;
    let mut chunked = false;
    let mut keep_alive = false;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::Protocol("content-length is not ascii".into()))?;
            content_length = Some(value.trim().parse::<usize>().map_err(|_| {
                Error::Protocol(format!("invalid content-length [{}]", value.trim()))
            })?);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value).to_ascii_lowercase();
            if value.contains("chunked") {
                chunked = true;
            }
        } else if header.name.eq_ignore_ascii_case("connection") {
            let value = String::from_utf8_lossy(header.value);
            keep_alive = value.trim().eq_ignore_ascii_case("keep-alive");
        }
    }

    let status_line = match find_crlf(buf) {
        Some(pos) => String::from_utf8_lossy(&buf[..pos]).into_owned(),
        None => return Ok(None),
    };

    Ok(Some(Head {
        status_line,
        status_code,
        content_length,
        chunked,
        keep_alive,
        len,
    }))
}

/// Parse a chunk-size line, ignoring any extensions after `;`.
fn parse_chunk_size(line: &str) -> Result<usize, Error> {
    let size = line.split(';').next().unwrap_or(line).trim();
    usize::from_str_radix(size, 16)
        .map_err(|_| Error::Protocol(format!("invalid chunk size [{size}]")))
}

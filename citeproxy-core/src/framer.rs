//! Message framing: read exactly one HTTP/1.x message off a byte stream.
//!
//! No chunked transfer-encoding. The body length comes from `Content-Length`, or from
//! the method (bodyless requests), or from the peer closing / going idle.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::message::{find_head_end, MessageHead, HEAD_TERMINATOR};

/// Default per-read idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Requests with these methods carry no body unless they declare a length.
const BODYLESS_METHODS: [&str; 5] = ["GET", "HEAD", "OPTIONS", "TRACE", "DELETE"];

/// How much to read after the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// `Content-Length` was declared.
    Exact(usize),
    /// Request method that never carries a body.
    None,
    /// Read until the peer closes or goes idle.
    UntilClose,
}

/// Decide the body strategy from a parsed head.
pub fn body_length(head: &MessageHead) -> io::Result<BodyLength> {
    if let Some(value) = head.headers.get("Content-Length").filter(|v| !v.is_empty()) {
        return value
            .parse::<usize>()
            .map(BodyLength::Exact)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length"));
    }
    match head.method() {
        Some(method)
            if BODYLESS_METHODS
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method)) =>
        {
            Ok(BodyLength::None)
        }
        _ => Ok(BodyLength::UntilClose),
    }
}

/// Read errors that mean the peer is gone rather than that something is broken.
fn is_peer_gone(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

/// Stateful reader for one message. `closed` records that the peer has gone away.
struct Reader<'a, R> {
    inner: &'a mut R,
    chunk: Vec<u8>,
    idle: Duration,
    data: Vec<u8>,
    closed: bool,
}

impl<'a, R: AsyncRead + Unpin> Reader<'a, R> {
    /// Read one chunk into `data`. Returns false once the peer closed, reset or went idle.
    async fn fill(&mut self) -> io::Result<bool> {
        match tokio::time::timeout(self.idle, self.inner.read(&mut self.chunk)).await {
            Ok(Ok(0)) | Err(_) => {
                self.closed = true;
                Ok(false)
            }
            Ok(Ok(n)) => {
                self.data.extend_from_slice(&self.chunk[..n]);
                Ok(true)
            }
            Ok(Err(e)) if is_peer_gone(e.kind()) => {
                self.closed = true;
                Ok(false)
            }
            Ok(Err(e)) => Err(e),
        }
    }
}

/// Read one complete message from `stream`.
///
/// Returns an empty vector when the peer closed before sending anything. A peer that
/// closes mid-body yields the truncated bytes. Bytes past the end of a message with a
/// known length are discarded (no pipelining).
pub async fn read_message<R>(stream: &mut R, buffer_size: usize, idle: Duration) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    continue_message(stream, Vec::new(), buffer_size, idle).await
}

/// Like [`read_message`], for a message whose first bytes were already taken off `stream`.
pub async fn continue_message<R>(
    stream: &mut R,
    initial: Vec<u8>,
    buffer_size: usize,
    idle: Duration,
) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = Reader {
        inner: stream,
        chunk: vec![0u8; buffer_size.max(1)],
        idle,
        data: initial,
        closed: false,
    };

    let mut scan_from = 0;
    let head_end = loop {
        if let Some(pos) = find_head_end(&reader.data[scan_from..]) {
            break Some(scan_from + pos);
        }
        scan_from = reader.data.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        if !reader.fill().await? {
            break find_head_end(&reader.data);
        }
    };

    let Some(head_end) = head_end else {
        return Ok(reader.data);
    };
    let head_len = head_end + HEAD_TERMINATOR.len();
    let head = MessageHead::parse(&reader.data[..head_end]);

    match body_length(&head)? {
        BodyLength::Exact(len) => {
            let total = head_len.saturating_add(len);
            while !reader.closed && reader.data.len() < total && reader.fill().await? {}
            reader.data.truncate(total);
        }
        BodyLength::None => reader.data.truncate(head_len),
        BodyLength::UntilClose => {
            while !reader.closed && reader.fill().await? {}
        }
    }
    Ok(reader.data)
}

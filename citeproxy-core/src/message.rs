//! HTTP/1.x message model: start line, ordered headers with case-insensitive lookup, raw body.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::ProxyError;

/// Blank line separating the header block from the body.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Protocol token that starts every status line.
const PROTOCOL_PREFIX: &str = "HTTP/";

/// Byte offset of the header terminator in `bytes`, if present.
pub fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

/// Ordered header list. Names keep their original case; lookup ignores case.
/// Duplicate names are kept as separate entries and the first one wins on lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
    /// Lowercased name -> position of its first entry.
    index: HashMap<String, usize>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the first header named `name` (any case).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&i| self.entries[i].1.as_str())
    }

    /// Replace the value of an existing header in place, or append a new one at the end.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.index.get(&name.to_ascii_lowercase()) {
            Some(&i) => self.entries[i].1 = value,
            None => self.append(name, value),
        }
    }

    /// Append without checking for an existing entry.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.index
            .entry(name.to_ascii_lowercase())
            .or_insert(self.entries.len());
        self.entries.push((name, value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How the header block was decoded; serialization encodes back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeadEncoding {
    #[default]
    Utf8,
    /// One byte per character (ISO-8859-1). Total: every byte sequence decodes.
    Latin1,
}

fn decode_head(raw: &[u8]) -> (Cow<'_, str>, HeadEncoding) {
    match std::str::from_utf8(raw) {
        Ok(s) => (Cow::Borrowed(s), HeadEncoding::Utf8),
        Err(_) => (
            Cow::Owned(raw.iter().map(|&b| b as char).collect()),
            HeadEncoding::Latin1,
        ),
    }
}

/// Start line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub start_line: String,
    pub headers: HeaderMap,
    pub encoding: HeadEncoding,
}

impl MessageHead {
    /// Parse a header block (without the terminating blank line). Never fails:
    /// undecodable bytes fall back to Latin-1 and lines without a colon are dropped.
    pub fn parse(raw: &[u8]) -> Self {
        let (text, encoding) = decode_head(raw);
        let mut lines = text.split("\r\n");
        let start_line = lines.next().unwrap_or_default().to_string();
        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.append(name.trim(), value.trim());
            }
        }
        Self {
            start_line,
            headers,
            encoding,
        }
    }

    /// Status lines start with the protocol token; everything else is a request.
    pub fn is_response(&self) -> bool {
        self.start_line.starts_with(PROTOCOL_PREFIX)
    }

    /// Request method (first token of the request line). `None` for responses.
    pub fn method(&self) -> Option<&str> {
        if self.is_response() {
            return None;
        }
        self.start_line.split(' ').next().filter(|m| !m.is_empty())
    }

    /// Append the wire form, including the terminating blank line.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut text = String::with_capacity(self.start_line.len() + 32 * self.headers.len());
        text.push_str(&self.start_line);
        text.push_str("\r\n");
        for (name, value) in self.headers.iter() {
            text.push_str(name);
            text.push_str(": ");
            text.push_str(value);
            text.push_str("\r\n");
        }
        text.push_str("\r\n");
        match self.encoding {
            HeadEncoding::Utf8 => out.extend_from_slice(text.as_bytes()),
            HeadEncoding::Latin1 => out.extend(
                text.chars()
                    .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')),
            ),
        }
    }
}

/// One complete HTTP message: head plus raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub head: MessageHead,
    pub body: Vec<u8>,
}

impl Message {
    /// Split raw bytes at the first blank line and parse the head.
    pub fn parse(raw: &[u8]) -> Result<Self, ProxyError> {
        let end = find_head_end(raw).ok_or(ProxyError::Malformed("missing header terminator"))?;
        Ok(Self {
            head: MessageHead::parse(&raw[..end]),
            body: raw[end + HEAD_TERMINATOR.len()..].to_vec(),
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.head.start_line.len() + 256 + self.body.len());
        self.head.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out
    }
}

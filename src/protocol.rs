//! RESP2 framing.
//!
//! Requests arrive either as multibulk arrays (`*2\r\n$6\r\nUNLOCK\r\n$1\r\na\r\n`)
//! or as inline commands (`UNLOCK a\r\n`). [`RespCodec`] decodes them on the
//! server side and encodes [`Reply`] values back; [`ReplyCodec`] is the client
//! side counterpart.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// Multibulk arrays longer than this are rejected outright.
const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;

/// Upper bound on the argument vector allocated up front for a multibulk.
const PREALLOC_ARGS: usize = 16;

/// Nesting limit for aggregate replies.
const MAX_REPLY_DEPTH: usize = 32;

/// A RESP value. Used for replies, and by clients to build request arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn nil() -> Self {
        Reply::Bulk(None)
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(Some(data.into()))
    }

    /// A request frame: an array of bulk strings.
    pub fn command(parts: &[&str]) -> Self {
        Reply::Array(parts.iter().map(|p| Reply::bulk(p.as_bytes())).collect())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        match self {
            Reply::Simple(s) => {
                out.put_u8(b'+');
                out.put_slice(s.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Error(msg) => {
                out.put_u8(b'-');
                out.put_slice(msg.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Integer(n) => out.put_slice(format!(":{n}\r\n").as_bytes()),
            Reply::Bulk(None) => out.put_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                out.put_slice(format!("${}\r\n", data.len()).as_bytes());
                out.put_slice(data);
                out.put_slice(b"\r\n");
            }
            Reply::Array(items) => {
                out.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|offset| from + offset)
}

fn parse_int(line: &[u8], what: &str) -> Result<i64, FrameError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::malformed(format!("invalid {what}")))
}

/// A multibulk whose header has been consumed but whose arguments are still
/// arriving.
#[derive(Debug)]
struct PartialMultibulk {
    remaining: usize,
    args: Vec<String>,
}

/// Server-side request codec.
///
/// Decoded items are argument vectors; an empty vector is a frame that
/// carried no command and should be skipped. Multibulk arguments are consumed
/// from the buffer as soon as each one is complete, so a frame arriving in
/// small pieces is never re-parsed from the start.
#[derive(Debug)]
pub struct RespCodec {
    max_bulk_len: usize,
    pending: Option<PartialMultibulk>,
    /// Bytes of an incomplete inline line already searched for `\n`.
    scanned: usize,
}

impl RespCodec {
    pub fn new(max_bulk_len: usize) -> Self {
        Self {
            max_bulk_len,
            pending: None,
            scanned: 0,
        }
    }

    fn decode_inline(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<String>>, FrameError> {
        let from = self.scanned.min(buf.len());
        let Some(offset) = buf[from..].iter().position(|&b| b == b'\n') else {
            self.scanned = buf.len();
            if buf.len() > self.max_bulk_len {
                return Err(FrameError::TooLarge(self.max_bulk_len));
            }
            return Ok(None);
        };
        let newline = from + offset;
        self.scanned = 0;

        let line = buf.split_to(newline + 1);
        let line = &line[..newline];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(
            line.split(|b| b.is_ascii_whitespace())
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect(),
        ))
    }

    fn decode_header(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<String>>, FrameError> {
        let Some(header_end) = find_crlf(buf, 0) else {
            if buf.len() > self.max_bulk_len {
                return Err(FrameError::TooLarge(self.max_bulk_len));
            }
            return Ok(None);
        };
        let count = parse_int(&buf[1..header_end], "multibulk length")?;
        if count > MAX_MULTIBULK_LEN {
            return Err(FrameError::malformed("invalid multibulk length"));
        }
        buf.advance(header_end + 2);
        if count <= 0 {
            return Ok(Some(Vec::new()));
        }

        let remaining = count as usize;
        self.pending = Some(PartialMultibulk {
            remaining,
            args: Vec::with_capacity(remaining.min(PREALLOC_ARGS)),
        });
        Ok(None)
    }

    /// Moves complete bulk arguments out of `buf`. Returns the arguments once
    /// the last one is in.
    fn decode_bulks(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<String>>, FrameError> {
        let Some(partial) = self.pending.as_mut() else {
            return Ok(None);
        };
        while partial.remaining > 0 {
            let Some(line_end) = find_crlf(buf, 0) else {
                if buf.len() > self.max_bulk_len {
                    return Err(FrameError::TooLarge(self.max_bulk_len));
                }
                return Ok(None);
            };
            if buf[0] != b'$' {
                return Err(FrameError::malformed(format!(
                    "expected '$', got '{}'",
                    buf[0] as char
                )));
            }
            let len = parse_int(&buf[1..line_end], "bulk length")?;
            if len < 0 {
                return Err(FrameError::malformed("invalid bulk length"));
            }
            let len = len as usize;
            if len > self.max_bulk_len {
                return Err(FrameError::TooLarge(self.max_bulk_len));
            }

            let start = line_end + 2;
            let end = start + len;
            if buf.len() < end + 2 {
                buf.reserve(end + 2 - buf.len());
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(FrameError::malformed("bulk data not terminated by CRLF"));
            }
            partial
                .args
                .push(String::from_utf8_lossy(&buf[start..end]).into_owned());
            buf.advance(end + 2);
            partial.remaining -= 1;
        }
        Ok(self.pending.take().map(|partial| partial.args))
    }
}

impl Decoder for RespCodec {
    type Item = Vec<String>;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending.is_none() {
            match buf.first() {
                None => return Ok(None),
                Some(b'*') => {
                    if let Some(empty) = self.decode_header(buf)? {
                        return Ok(Some(empty));
                    }
                    if self.pending.is_none() {
                        return Ok(None);
                    }
                }
                Some(_) => return self.decode_inline(buf),
            }
        }
        self.decode_bulks(buf)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(FrameError::malformed("connection closed mid-frame")),
        }
    }
}

impl Encoder<Reply> for RespCodec {
    type Error = FrameError;

    fn encode(&mut self, reply: Reply, buf: &mut BytesMut) -> Result<(), Self::Error> {
        reply.encode(buf);
        Ok(())
    }
}

/// Parses one reply from the front of `buf`, returning it with the number of
/// bytes it spans.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, FrameError> {
    parse_reply_at(buf, 0)
}

fn parse_reply_at(buf: &[u8], depth: usize) -> Result<Option<(Reply, usize)>, FrameError> {
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let line = &buf[1..line_end];
    let after = line_end + 2;

    let reply = match kind {
        b'+' => (Reply::Simple(String::from_utf8_lossy(line).into_owned()), after),
        b'-' => (Reply::Error(String::from_utf8_lossy(line).into_owned()), after),
        b':' => (Reply::Integer(parse_int(line, "integer")?), after),
        b'$' => {
            let len = parse_int(line, "bulk length")?;
            if len < 0 {
                (Reply::nil(), after)
            } else {
                let end = after + len as usize;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                (Reply::bulk(&buf[after..end]), end + 2)
            }
        }
        b'*' => {
            if depth >= MAX_REPLY_DEPTH {
                return Err(FrameError::malformed("reply nested too deeply"));
            }
            let count = parse_int(line, "multibulk length")?;
            let mut items = Vec::with_capacity(count.clamp(0, PREALLOC_ARGS as i64) as usize);
            let mut pos = after;
            for _ in 0..count.max(0) {
                match parse_reply_at(&buf[pos..], depth + 1)? {
                    Some((item, used)) => {
                        items.push(item);
                        pos += used;
                    }
                    None => return Ok(None),
                }
            }
            (Reply::Array(items), pos)
        }
        other => {
            return Err(FrameError::malformed(format!(
                "unknown reply type '{}'",
                other as char
            )))
        }
    };
    Ok(Some(reply))
}

/// Client-side codec: sends request arrays, decodes replies.
#[derive(Debug, Default)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_reply(buf)? {
            Some((reply, used)) => {
                buf.advance(used);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Reply> for ReplyCodec {
    type Error = FrameError;

    fn encode(&mut self, request: Reply, buf: &mut BytesMut) -> Result<(), Self::Error> {
        request.encode(buf);
        Ok(())
    }
}
